use anyhow::bail;
use bytes::BufMut;
use tracing::{debug, trace};
use crate::buffers::buffer_pool::BufferPool;
use crate::error::TransportError;
use crate::packet::FramedPacket;

/// Splits messages into fragments that fit into a single datagram each.
///
/// All fragments of a message share the caller-supplied message id, so several multi-fragment
///  messages to the same peer can be in flight at the same time.
#[derive(Clone, Debug)]
pub struct Fragmenter {
    max_fragment_payload: usize,
    max_fragments: u32,
}

impl Fragmenter {
    pub fn new(max_fragment_payload: usize, max_fragments: u32) -> anyhow::Result<Fragmenter> {
        if max_fragment_payload == 0 {
            bail!("fragments must have room for payload");
        }
        if max_fragments == 0 {
            bail!("a message must be allowed at least one fragment");
        }
        Ok(Fragmenter {
            max_fragment_payload,
            max_fragments,
        })
    }

    pub fn max_message_size(&self) -> usize {
        self.max_fragment_payload * self.max_fragments as usize
    }

    /// An empty message still takes a single (empty) fragment.
    pub fn fragment_count(&self, message_len: usize) -> usize {
        message_len.div_ceil(self.max_fragment_payload).max(1)
    }

    /// The fragment count is checked against the configured maximum before any buffer is leased,
    ///  so an oversized message fails without producing anything.
    pub fn fragment(&self, message_id: u32, message: &[u8], buffer_pool: &BufferPool) -> Result<Vec<FramedPacket>, TransportError> {
        let fragment_count = self.fragment_count(message.len());
        if fragment_count > self.max_fragments as usize {
            debug!("message of length {} requires {} fragments, the maximum is {}", message.len(), fragment_count, self.max_fragments);
            return Err(TransportError::MessageTooLarge {
                len: message.len(),
                max_len: self.max_message_size(),
            });
        }

        trace!("splitting message #{} of length {} into {} fragments", message_id, message.len(), fragment_count);

        let mut chunks = message.chunks(self.max_fragment_payload);
        let result = (0..fragment_count)
            .map(|fragment_index| {
                let mut payload = buffer_pool.get_from_pool();
                if let Some(chunk) = chunks.next() {
                    payload.put_slice(chunk);
                }
                FramedPacket::new(
                    message_id,
                    fragment_index as u32,
                    fragment_index + 1 < fragment_count,
                    payload,
                )
            })
            .collect();
        Ok(result)
    }
}
