use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::buffers::buffer_pool::{BufferPool, PooledBuffer};

/// The unit sent as a single datagram on an application channel: one fragment of a message, with
///  a fixed-size header identifying the message and the fragment's position in it.
///
/// ```ascii
/// 0: message id (u32 LE)
/// 4: fragment index (u32 LE), zero-based
/// 8: more fragments (u8): 1 for all fragments except the message's last, 0 for the last
/// 9: payload
/// ```
pub struct FramedPacket {
    pub message_id: u32,
    pub fragment_index: u32,
    pub more_fragments: bool,
    payload: PooledBuffer,
}

impl Debug for FramedPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FRAG{{#{}:{}{}|{}b}}",
               self.message_id,
               self.fragment_index,
               if self.more_fragments { "+" } else { "" },
               self.payload.len(),
        )
    }
}

impl FramedPacket {
    pub const HEADER_LEN: usize = size_of::<u32>() + size_of::<u32>() + size_of::<u8>();

    const FLAG_LAST_FRAGMENT: u8 = 0;
    const FLAG_MORE_FRAGMENTS: u8 = 1;

    pub fn new(message_id: u32, fragment_index: u32, more_fragments: bool, payload: PooledBuffer) -> FramedPacket {
        FramedPacket {
            message_id,
            fragment_index,
            more_fragments,
            payload,
        }
    }

    /// A message that fits into a single fragment needs no reassembly
    pub fn is_single_fragment(&self) -> bool {
        self.fragment_index == 0 && !self.more_fragments
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_ref()
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.message_id);
        buf.put_u32_le(self.fragment_index);
        buf.put_u8(if self.more_fragments { Self::FLAG_MORE_FRAGMENTS } else { Self::FLAG_LAST_FRAGMENT });
        buf.put_slice(self.payload.as_ref());
    }

    /// Parses a received datagram, copying its payload into a buffer leased from the pool. On
    ///  failure, nothing is leased.
    pub fn decode(mut datagram: &[u8], pool: &BufferPool) -> anyhow::Result<FramedPacket> {
        if datagram.len() < Self::HEADER_LEN {
            bail!("datagram of {} bytes is shorter than the {} byte fragment header", datagram.len(), Self::HEADER_LEN);
        }

        let message_id = datagram.get_u32_le();
        let fragment_index = datagram.get_u32_le();
        let more_fragments = match datagram.get_u8() {
            Self::FLAG_LAST_FRAGMENT => false,
            Self::FLAG_MORE_FRAGMENTS => true,
            other => bail!("invalid 'more fragments' flag {}", other),
        };

        let mut payload = pool.get_from_pool();
        payload.put_slice(datagram);

        Ok(FramedPacket {
            message_id,
            fragment_index,
            more_fragments,
            payload,
        })
    }
}
