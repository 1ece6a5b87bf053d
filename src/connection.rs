use std::time::Duration;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::control_messages::ControlFrame;
use crate::error::TransportError;
use crate::peer_id::PeerId;

/// A peer's state as seen by the host. A peer the transport knows nothing about is `Disconnected`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// we sent CONNECT and wait for the peer's ACCEPT_CONNECT
    AwaitingAccept,
    /// the peer sent CONNECT, and our ACCEPT_CONNECT was not sent successfully yet
    AwaitingLocalAccept,
    Connected,
    /// the connection is closed, and the session is released at the start of the next poll
    Closing,
}

/// Why a connection ended or failed to be established
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CloseReason {
    ClosedByLocal,
    ClosedByPeer,
    /// the substrate closed the session without giving a more specific cause
    ConnectionClosed,
    ConnectionFailed,
    InvalidData,
    InvalidMessage,
    NegotiationFailed,
    TimedOut,
    TooManyConnections,
    UnexpectedError,
    Unknown,
}

/// Lifecycle changes to be reported to the host. Every peer that reaches `Connected` is reported
///  exactly once as `Connected` and later exactly once as `Disconnected`; a peer whose handshake
///  does not complete is reported exactly once as `ConnectionFailed`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Connected(PeerId),
    Disconnected(PeerId, CloseReason),
    ConnectionFailed(PeerId, CloseReason),
}

impl ConnectionEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            ConnectionEvent::Connected(peer) => peer,
            ConnectionEvent::Disconnected(peer, _) => peer,
            ConnectionEvent::ConnectionFailed(peer, _) => peer,
        }
    }

    /// terminal events end all tracking for the peer
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnectionEvent::Connected(_))
    }
}

/// Where the lifecycle sends its control frames - in production, the substrate's internal channel
#[cfg_attr(test, automock)]
pub trait ControlSink {
    fn send_control(&mut self, to: &PeerId, frame: ControlFrame) -> Result<(), TransportError>;
}

#[derive(Debug)]
enum PeerState {
    /// requested during the startup window, CONNECT is sent by the first poll after it
    ConnectPending { since: Instant },
    AwaitingAccept { since: Instant },
    AwaitingLocalAccept { since: Instant },
    Connected,
    Closing { reason: CloseReason, was_connected: bool },
}

impl PeerState {
    fn as_connection_state(&self) -> ConnectionState {
        match self {
            PeerState::ConnectPending { .. } => ConnectionState::AwaitingAccept,
            PeerState::AwaitingAccept { .. } => ConnectionState::AwaitingAccept,
            PeerState::AwaitingLocalAccept { .. } => ConnectionState::AwaitingLocalAccept,
            PeerState::Connected => ConnectionState::Connected,
            PeerState::Closing { .. } => ConnectionState::Closing,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }
}

/// Tracks the handshake state of every known peer.
///
/// Peers in `Disconnected` state have no entry. Closing a connection (for whatever reason) only
///  marks the peer as `Closing`; [ConnectionLifecycle::finalize_closes] then does the actual
///  teardown at the start of the next poll, after all datagrams that were already in flight for
///  the peer during the current poll were processed.
pub struct ConnectionLifecycle {
    peers: FxHashMap<PeerId, PeerState>,
    connect_timeout: Duration,
}

impl ConnectionLifecycle {
    pub fn new(connect_timeout: Duration) -> ConnectionLifecycle {
        ConnectionLifecycle {
            peers: FxHashMap::default(),
            connect_timeout,
        }
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        self.peers.get(peer)
            .map(PeerState::as_connection_state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn num_tracked_peers(&self) -> usize {
        self.peers.len()
    }

    /// Initiates a handshake with a peer we have no connection with. If sending CONNECT fails,
    ///  the peer remains `Disconnected` and the caller may retry.
    pub fn connect(&mut self, peer: &PeerId, sink: &mut dyn ControlSink) -> Result<(), TransportError> {
        let state = self.state(peer);
        if state != ConnectionState::Disconnected {
            return Err(TransportError::InvalidState { peer: peer.clone(), state });
        }

        sink.send_control(peer, ControlFrame::Connect)?;

        debug!("sent CONNECT to {:?}, awaiting accept", peer);
        self.peers.insert(peer.clone(), PeerState::AwaitingAccept { since: Instant::now() });
        Ok(())
    }

    /// Registers a handshake without sending CONNECT yet. [ConnectionLifecycle::send_pending_connects]
    ///  sends it later, and the connect timeout counts from now.
    pub fn request_connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let state = self.state(peer);
        if state != ConnectionState::Disconnected {
            return Err(TransportError::InvalidState { peer: peer.clone(), state });
        }

        debug!("deferring CONNECT to {:?}", peer);
        self.peers.insert(peer.clone(), PeerState::ConnectPending { since: Instant::now() });
        Ok(())
    }

    /// Sends CONNECT for deferred handshakes. A failed send is retried on the next call.
    pub fn send_pending_connects(&mut self, sink: &mut dyn ControlSink) {
        for (peer, state) in self.peers.iter_mut() {
            let &mut PeerState::ConnectPending { since } = state else {
                continue;
            };
            match sink.send_control(peer, ControlFrame::Connect) {
                Ok(()) => {
                    debug!("sent deferred CONNECT to {:?}, awaiting accept", peer);
                    *state = PeerState::AwaitingAccept { since };
                }
                Err(e) => debug!("sending deferred CONNECT to {:?} failed, retrying on next poll: {}", peer, e),
            }
        }
    }

    /// Accepts a peer's connection request. This happens implicitly when CONNECT is received, so
    ///  calling it explicitly is only necessary to retry an accept that failed to be sent.
    pub fn accept(&mut self, peer: &PeerId, sink: &mut dyn ControlSink, events: &mut Vec<ConnectionEvent>) -> Result<(), TransportError> {
        match self.state(peer) {
            ConnectionState::Connected => Ok(()),
            ConnectionState::AwaitingLocalAccept => {
                sink.send_control(peer, ControlFrame::AcceptConnect)?;
                self.on_established(peer, events);
                Ok(())
            }
            state => Err(TransportError::InvalidState { peer: peer.clone(), state }),
        }
    }

    /// Closes the connection with a peer, or abandons a pending handshake. Disconnecting a peer
    ///  that is not tracked or already closing does nothing.
    pub fn disconnect(&mut self, peer: &PeerId, sink: &mut dyn ControlSink) -> Result<(), TransportError> {
        if !self.peers.contains_key(peer) {
            debug!("disconnect from {:?} without a connection - ignoring", peer);
            return Ok(());
        }
        self.close_locally(peer, sink);
        Ok(())
    }

    /// Closes every tracked connection and abandons every pending handshake
    pub fn disconnect_all(&mut self, sink: &mut dyn ControlSink) {
        let peers = self.peers.keys().cloned().collect::<Vec<_>>();
        for peer in peers {
            self.close_locally(&peer, sink);
        }
    }

    pub fn on_control_frame(&mut self, peer: &PeerId, frame: ControlFrame, sink: &mut dyn ControlSink, events: &mut Vec<ConnectionEvent>) {
        let state = self.state(peer);
        debug!("received {:?} from {:?} in state {:?}", frame, peer, state);

        match (frame, state) {
            (ControlFrame::Connect, ConnectionState::Disconnected) => {
                self.peers.insert(peer.clone(), PeerState::AwaitingLocalAccept { since: Instant::now() });
                self.try_accept(peer, sink, events);
            }
            (ControlFrame::Connect, ConnectionState::AwaitingLocalAccept) => {
                self.try_accept(peer, sink, events);
            }
            (ControlFrame::Connect, ConnectionState::AwaitingAccept) => {
                // both sides connected at the same time
                self.peers.insert(peer.clone(), PeerState::AwaitingLocalAccept { since: Instant::now() });
                self.try_accept(peer, sink, events);
            }
            (ControlFrame::Connect, ConnectionState::Connected) => {
                // the peer did not receive our ACCEPT_CONNECT
                if let Err(e) = sink.send_control(peer, ControlFrame::AcceptConnect) {
                    debug!("failed to re-send ACCEPT_CONNECT to {:?}: {}", peer, e);
                }
            }
            (ControlFrame::AcceptConnect, ConnectionState::AwaitingAccept) => {
                if matches!(self.peers.get(peer), Some(PeerState::ConnectPending { .. })) {
                    warn!("ACCEPT_CONNECT from {:?} before CONNECT was sent - ignoring", peer);
                }
                else {
                    self.on_established(peer, events);
                }
            }
            (ControlFrame::AcceptConnect, ConnectionState::Connected) => {
                debug!("duplicate ACCEPT_CONNECT from {:?} - ignoring", peer);
            }
            (ControlFrame::Disconnect, ConnectionState::AwaitingAccept | ConnectionState::AwaitingLocalAccept | ConnectionState::Connected) => {
                self.start_closing(peer, CloseReason::ClosedByPeer);
            }
            (_, ConnectionState::Closing) => {
                debug!("{:?} from {:?} while closing - ignoring", frame, peer);
            }
            (frame, state) => {
                warn!("unexpected {:?} from {:?} in state {:?} - ignoring", frame, peer, state);
            }
        }
    }

    /// The substrate closed the session with a peer. This is final, so there is nothing left to
    ///  defer to the next poll.
    pub fn on_session_closed(&mut self, peer: &PeerId, reason: CloseReason, events: &mut Vec<ConnectionEvent>) {
        let Some(state) = self.peers.remove(peer) else {
            debug!("session with {:?} closed ({:?}), but there is no connection - ignoring", peer, reason);
            return;
        };

        let (reason, was_connected) = match state {
            // a pending close keeps the reason it was closed for
            PeerState::Closing { reason, was_connected } => (reason, was_connected),
            other => (reason, other.is_connected()),
        };
        events.push(Self::termination_event(peer, reason, was_connected));
    }

    /// Removes all peers that are `Closing`, reporting their termination, and returns them so the
    ///  caller can release their sessions and discard related state.
    pub fn finalize_closes(&mut self, events: &mut Vec<ConnectionEvent>) -> Vec<PeerId> {
        let closing = self.peers.iter()
            .filter_map(|(peer, state)| match state {
                PeerState::Closing { reason, was_connected } => Some((peer.clone(), *reason, *was_connected)),
                _ => None,
            })
            .collect::<Vec<_>>();

        closing.into_iter()
            .map(|(peer, reason, was_connected)| {
                self.peers.remove(&peer);
                events.push(Self::termination_event(&peer, reason, was_connected));
                peer
            })
            .collect()
    }

    /// Fails handshakes (in either direction) that did not complete within the connect timeout
    pub fn check_timeouts(&mut self, now: Instant) {
        let connect_timeout = self.connect_timeout;
        for (peer, state) in self.peers.iter_mut() {
            let since = match state {
                PeerState::ConnectPending { since } => *since,
                PeerState::AwaitingAccept { since } => *since,
                PeerState::AwaitingLocalAccept { since } => *since,
                _ => continue,
            };
            if now.saturating_duration_since(since) >= connect_timeout {
                debug!("handshake with {:?} did not complete within {:?}", peer, connect_timeout);
                *state = PeerState::Closing { reason: CloseReason::TimedOut, was_connected: false };
            }
        }
    }

    /// Re-sends ACCEPT_CONNECT to peers for which this failed before
    pub fn retry_pending_accepts(&mut self, sink: &mut dyn ControlSink, events: &mut Vec<ConnectionEvent>) {
        let pending = self.peers.iter()
            .filter(|(_, state)| matches!(state, PeerState::AwaitingLocalAccept { .. }))
            .map(|(peer, _)| peer.clone())
            .collect::<Vec<_>>();

        for peer in pending {
            self.try_accept(&peer, sink, events);
        }
    }

    fn try_accept(&mut self, peer: &PeerId, sink: &mut dyn ControlSink, events: &mut Vec<ConnectionEvent>) {
        if let Err(e) = self.accept(peer, sink, events) {
            debug!("accepting {:?} failed, retrying on next poll: {}", peer, e);
        }
    }

    fn on_established(&mut self, peer: &PeerId, events: &mut Vec<ConnectionEvent>) {
        info!("connection with {:?} established", peer);
        self.peers.insert(peer.clone(), PeerState::Connected);
        events.push(ConnectionEvent::Connected(peer.clone()));
    }

    fn close_locally(&mut self, peer: &PeerId, sink: &mut dyn ControlSink) {
        match self.peers.get(peer) {
            None | Some(PeerState::Closing { .. }) => return,
            // the peer never heard of us
            Some(PeerState::ConnectPending { .. }) => {}
            Some(_) => {
                if let Err(e) = sink.send_control(peer, ControlFrame::Disconnect) {
                    // the session is released anyway, and the peer notices eventually
                    debug!("failed to send DISCONNECT to {:?}: {}", peer, e);
                }
            }
        }
        self.start_closing(peer, CloseReason::ClosedByLocal);
    }

    fn start_closing(&mut self, peer: &PeerId, reason: CloseReason) {
        if let Some(state) = self.peers.get_mut(peer) {
            debug!("closing connection with {:?} in state {:?}: {:?}", peer, state, reason);
            let was_connected = state.is_connected();
            *state = PeerState::Closing { reason, was_connected };
        }
    }

    fn termination_event(peer: &PeerId, reason: CloseReason, was_connected: bool) -> ConnectionEvent {
        if was_connected {
            info!("connection with {:?} closed: {:?}", peer, reason);
            ConnectionEvent::Disconnected(peer.clone(), reason)
        }
        else {
            info!("connection with {:?} failed: {:?}", peer, reason);
            ConnectionEvent::ConnectionFailed(peer.clone(), reason)
        }
    }
}
