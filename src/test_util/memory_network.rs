use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;
use crate::config::PacketReliability;
use crate::datagram_socket::{DatagramSocket, SessionNotification};
use crate::peer_id::PeerId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentDatagram {
    pub from: PeerId,
    pub to: PeerId,
    pub channel: u8,
    pub reliability: PacketReliability,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug)]
struct QueuedDatagram {
    from: PeerId,
    payload: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    max_packet_size: usize,
    /// per (receiver, channel)
    queues: FxHashMap<(PeerId, u8), VecDeque<QueuedDatagram>>,
    notifications: FxHashMap<PeerId, VecDeque<SessionNotification>>,
    /// (receiver, sender) pairs for which the receiver was notified of a session request
    requested_sessions: FxHashSet<(PeerId, PeerId)>,
    accepted_sessions: Vec<(PeerId, PeerId)>,
    closed_sessions: Vec<(PeerId, PeerId)>,
    sent: Vec<SentDatagram>,
    fail_sends: bool,
}

impl NetworkState {
    fn queue(&mut self, to: &PeerId, channel: u8) -> &mut VecDeque<QueuedDatagram> {
        self.queues.entry((to.clone(), channel)).or_default()
    }
}

/// An in-memory substrate: datagrams sent through one of its sockets are queued for the
///  receiving socket until it polls them. Queues can be manipulated to simulate reordering and
///  duplication.
///
/// The first datagram a socket sends to a peer makes the peer's socket report an incoming
///  session request, like a peer-to-peer substrate does for the first packet from a new peer.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new(max_packet_size: usize) -> MemoryNetwork {
        MemoryNetwork {
            state: Rc::new(RefCell::new(NetworkState {
                max_packet_size,
                ..NetworkState::default()
            })),
        }
    }

    pub fn socket(&self, local: &str) -> MemorySocket {
        MemorySocket {
            local: PeerId::from(local),
            state: self.state.clone(),
        }
    }

    /// queues a datagram without going through a socket, and without triggering a session request
    pub fn inject(&self, to: &PeerId, from: &PeerId, channel: u8, payload: &[u8]) {
        self.state.borrow_mut()
            .queue(to, channel)
            .push_back(QueuedDatagram {
                from: from.clone(),
                payload: payload.to_vec(),
            });
    }

    pub fn notify(&self, to: &PeerId, notification: SessionNotification) {
        self.state.borrow_mut()
            .notifications
            .entry(to.clone())
            .or_default()
            .push_back(notification);
    }

    pub fn num_queued(&self, to: &PeerId, channel: u8) -> usize {
        self.state.borrow()
            .queues
            .get(&(to.clone(), channel))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn reverse(&self, to: &PeerId, channel: u8) {
        let mut state = self.state.borrow_mut();
        let queue = state.queue(to, channel);
        let reversed = queue.drain(..).rev().collect::<VecDeque<_>>();
        *queue = reversed;
    }

    /// makes every queued datagram arrive twice in a row
    pub fn duplicate(&self, to: &PeerId, channel: u8) {
        let mut state = self.state.borrow_mut();
        let queue = state.queue(to, channel);
        let duplicated = queue.drain(..)
            .flat_map(|d| [d.clone(), d])
            .collect::<VecDeque<_>>();
        *queue = duplicated;
    }

    pub fn set_fail_sends(&self, fail_sends: bool) {
        self.state.borrow_mut().fail_sends = fail_sends;
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state.borrow().sent.clone()
    }

    /// the peers a socket accepted sessions with
    pub fn accepted_sessions(&self, local: &PeerId) -> Vec<PeerId> {
        Self::sessions_of(&self.state.borrow().accepted_sessions, local)
    }

    /// the peers a socket released sessions with
    pub fn closed_sessions(&self, local: &PeerId) -> Vec<PeerId> {
        Self::sessions_of(&self.state.borrow().closed_sessions, local)
    }

    fn sessions_of(sessions: &[(PeerId, PeerId)], local: &PeerId) -> Vec<PeerId> {
        sessions.iter()
            .filter(|(l, _)| l == local)
            .map(|(_, peer)| peer.clone())
            .collect()
    }
}

pub struct MemorySocket {
    local: PeerId,
    state: Rc<RefCell<NetworkState>>,
}

impl MemorySocket {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

impl DatagramSocket for MemorySocket {
    fn max_packet_size(&self) -> usize {
        self.state.borrow().max_packet_size
    }

    fn send_packet(&mut self, to: &PeerId, channel: u8, reliability: PacketReliability, buf: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_sends {
            bail!("simulated send failure");
        }
        if buf.len() > state.max_packet_size {
            bail!("datagram of {} bytes exceeds the maximum of {} bytes", buf.len(), state.max_packet_size);
        }

        trace!("{:?} -> {:?} on channel {}: {} bytes", self.local, to, channel, buf.len());
        state.sent.push(SentDatagram {
            from: self.local.clone(),
            to: to.clone(),
            channel,
            reliability,
            payload: buf.to_vec(),
        });

        if state.requested_sessions.insert((to.clone(), self.local.clone())) {
            state.notifications
                .entry(to.clone())
                .or_default()
                .push_back(SessionNotification::IncomingConnectionRequest(self.local.clone()));
        }

        state.queue(to, channel)
            .push_back(QueuedDatagram {
                from: self.local.clone(),
                payload: buf.to_vec(),
            });
        Ok(())
    }

    /// A datagram that does not fit into `buf` is truncated, the way a UDP socket truncates
    fn try_receive(&mut self, channel: u8, buf: &mut [u8]) -> Option<(PeerId, usize)> {
        let datagram = self.state.borrow_mut()
            .queue(&self.local, channel)
            .pop_front()?;

        let len = datagram.payload.len().min(buf.len());
        if len < datagram.payload.len() {
            trace!("truncating datagram of {} bytes to the receive buffer's {} bytes", datagram.payload.len(), len);
        }
        buf[..len].copy_from_slice(&datagram.payload[..len]);
        Some((datagram.from, len))
    }

    fn next_notification(&mut self) -> Option<SessionNotification> {
        self.state.borrow_mut()
            .notifications
            .get_mut(&self.local)?
            .pop_front()
    }

    fn accept_session(&mut self, peer: &PeerId) {
        self.state.borrow_mut()
            .accepted_sessions
            .push((self.local.clone(), peer.clone()));
    }

    fn close_session(&mut self, peer: &PeerId) {
        let mut state = self.state.borrow_mut();
        state.requested_sessions.remove(&(self.local.clone(), peer.clone()));
        state.closed_sessions.push((self.local.clone(), peer.clone()));
    }
}
