use crate::connection::{CloseReason, ConnectionEvent};
use crate::handler::TransportHandler;
use crate::peer_id::PeerId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandlerCall {
    Message { peer: PeerId, channel: u8, payload: Vec<u8> },
    Event(ConnectionEvent),
}

/// Records all callbacks in the order they were made
#[derive(Default, Debug)]
pub struct RecordingHandler {
    pub calls: Vec<HandlerCall>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<(PeerId, u8, Vec<u8>)> {
        self.calls.iter()
            .filter_map(|call| match call {
                HandlerCall::Message { peer, channel, payload } => Some((peer.clone(), *channel, payload.clone())),
                HandlerCall::Event(_) => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.calls.iter()
            .filter_map(|call| match call {
                HandlerCall::Event(event) => Some(event.clone()),
                HandlerCall::Message { .. } => None,
            })
            .collect()
    }

    /// returns and forgets everything recorded so far
    pub fn take(&mut self) -> Vec<HandlerCall> {
        std::mem::take(&mut self.calls)
    }
}

impl TransportHandler for RecordingHandler {
    fn on_message(&mut self, peer: &PeerId, channel: u8, payload: &[u8]) {
        self.calls.push(HandlerCall::Message {
            peer: peer.clone(),
            channel,
            payload: payload.to_vec(),
        });
    }

    fn on_connected(&mut self, peer: &PeerId) {
        self.calls.push(HandlerCall::Event(ConnectionEvent::Connected(peer.clone())));
    }

    fn on_disconnected(&mut self, peer: &PeerId, reason: CloseReason) {
        self.calls.push(HandlerCall::Event(ConnectionEvent::Disconnected(peer.clone(), reason)));
    }

    fn on_connection_failed(&mut self, peer: &PeerId, reason: CloseReason) {
        self.calls.push(HandlerCall::Event(ConnectionEvent::ConnectionFailed(peer.clone(), reason)));
    }
}
