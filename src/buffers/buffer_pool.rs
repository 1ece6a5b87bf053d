use bytes::BytesMut;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::{debug, trace};

struct PoolInner {
    buf_size: usize,
    max_pool_size: usize,
    buffers: RefCell<Vec<BytesMut>>,
}

impl PoolInner {
    fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            debug!("returned buffer has a capacity of {} bytes, less than the regular {} bytes: discarding", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.borrow_mut();
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// A pool of byte buffers of a fixed size, used for datagrams and their payloads.
///
/// Buffers are leased as [PooledBuffer] and go back to the pool when the lease is dropped, so
///  every code path (including early returns and errors) releases a buffer exactly once.
///
/// The transport is single-threaded, so the pool is shared by reference counting without locks.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<PoolInner>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            inner: Rc::new(PoolInner {
                buf_size,
                max_pool_size,
                buffers: RefCell::new(Vec::with_capacity(max_pool_size)),
            }),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// number of buffers currently idle in the pool, i.e. not leased
    pub fn num_idle(&self) -> usize {
        self.inner.buffers.borrow().len()
    }

    pub fn get_from_pool(&self) -> PooledBuffer {
        let pooled = self.inner.buffers.borrow_mut().pop();

        let buf = match pooled {
            Some(buffer) => {
                trace!("returning buffer from pool");
                buffer
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.inner.buf_size)
            }
        };

        PooledBuffer {
            buf,
            pool: self.inner.clone(),
        }
    }
}

/// A buffer leased from a [BufferPool], exclusively owned by whoever holds it. It derefs to
///  `BytesMut` for reading and writing.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Rc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.return_to_pool(buf);
    }
}

impl Debug for PooledBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.buf.as_ref().fmt(f)
    }
}

impl PartialEq for PooledBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.buf.as_ref() == other.buf.as_ref()
    }
}
