use thiserror::Error;
use crate::connection::ConnectionState;
use crate::peer_id::PeerId;

/// Errors reported to the caller of a host-facing operation. None of them affects other peers or
///  other in-flight messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The message requires more fragments than configured. Nothing was sent.
    #[error("message of {len} bytes exceeds the maximum message size of {max_len} bytes")]
    MessageTooLarge { len: usize, max_len: usize },

    #[error("channel {channel} is not configured, there are {num_channels} application channels")]
    InvalidChannel { channel: u8, num_channels: usize },

    /// The substrate rejected a datagram. The transport does not retry, the caller may.
    #[error("sending to {peer} on channel {channel} failed: {reason}")]
    SendFailed { peer: PeerId, channel: u8, reason: String },

    #[error("operation not possible for {peer} in connection state {state:?}")]
    InvalidState { peer: PeerId, state: ConnectionState },
}
