use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Handshake signal, sent as a datagram of exactly one byte on the internal channel
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlFrame {
    Connect = 0,
    AcceptConnect = 1,
    Disconnect = 2,
}

impl ControlFrame {
    pub const SERIALIZED_LEN: usize = size_of::<u8>();

    pub fn ser(&self) -> [u8; ControlFrame::SERIALIZED_LEN] {
        [(*self).into()]
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<ControlFrame> {
        if buf.len() != Self::SERIALIZED_LEN {
            bail!("control frame must have exactly {} byte, was {}", Self::SERIALIZED_LEN, buf.len());
        }
        match ControlFrame::try_from(buf[0]) {
            Ok(frame) => Ok(frame),
            Err(_) => bail!("unknown control frame {}", buf[0]),
        }
    }
}
