#[cfg(test)] use mockall::automock;
use crate::connection::CloseReason;
use crate::peer_id::PeerId;

/// Callbacks through which the transport reports received messages and connection changes to
///  the host. They are called from within [crate::transport::Transport::poll].
#[cfg_attr(test, automock)]
pub trait TransportHandler {
    fn on_message(&mut self, peer: &PeerId, channel: u8, payload: &[u8]);

    fn on_connected(&mut self, peer: &PeerId);

    fn on_disconnected(&mut self, peer: &PeerId, reason: CloseReason);

    fn on_connection_failed(&mut self, peer: &PeerId, reason: CloseReason);
}
