#[cfg(test)] use mockall::automock;
use crate::config::PacketReliability;
use crate::connection::CloseReason;
use crate::peer_id::PeerId;

/// Session changes the substrate reports asynchronously, collected by the transport on every poll
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionNotification {
    IncomingConnectionRequest(PeerId),
    ConnectionClosed(PeerId, CloseReason),
}

/// The peer-to-peer datagram primitive the transport runs on.
///
/// Implementations deliver datagrams of up to [DatagramSocket::max_packet_size] bytes per channel,
///  with the delivery guarantee requested per datagram. NAT traversal, relaying and encryption are
///  the implementation's business.
///
/// All calls are non-blocking.
#[cfg_attr(test, automock)]
pub trait DatagramSocket {
    fn max_packet_size(&self) -> usize;

    fn send_packet(&mut self, to: &PeerId, channel: u8, reliability: PacketReliability, buf: &[u8]) -> anyhow::Result<()>;

    /// Copies the next queued datagram on a channel into `buf`, returning its sender and length,
    ///  or `None` if nothing is queued. `buf` has room for [DatagramSocket::max_packet_size] bytes.
    fn try_receive(&mut self, channel: u8, buf: &mut [u8]) -> Option<(PeerId, usize)>;

    fn next_notification(&mut self) -> Option<SessionNotification>;

    /// Allows datagrams from a peer that requested a session to pass
    fn accept_session(&mut self, peer: &PeerId);

    /// Releases all substrate resources held for a peer
    fn close_session(&mut self, peer: &PeerId);
}
