use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::{PacketReliability, TransportConfig};
use crate::connection::{ConnectionEvent, ConnectionLifecycle, ConnectionState, ControlSink};
use crate::control_messages::ControlFrame;
use crate::datagram_socket::{DatagramSocket, SessionNotification};
use crate::error::TransportError;
use crate::fragmenter::Fragmenter;
use crate::handler::TransportHandler;
use crate::packet::FramedPacket;
use crate::peer_id::PeerId;
use crate::reassembly::{ReassemblyKey, ReassemblyTable};

/// Sends control frames through the socket's internal channel
struct SocketControlSink<'a> {
    socket: &'a mut dyn DatagramSocket,
    internal_channel: u8,
}

impl ControlSink for SocketControlSink<'_> {
    fn send_control(&mut self, to: &PeerId, frame: ControlFrame) -> Result<(), TransportError> {
        trace!("sending {:?} to {:?}", frame, to);
        self.socket.send_packet(to, self.internal_channel, PacketReliability::ReliableOrdered, &frame.ser())
            .map_err(|e| TransportError::SendFailed {
                peer: to.clone(),
                channel: self.internal_channel,
                reason: e.to_string(),
            })
    }
}

/// A message-oriented transport on top of a [DatagramSocket].
///
/// Messages of arbitrary size (up to [Transport::max_message_size]) are split into fragments on
///  send and reassembled on receive. All inbound processing happens in [Transport::poll], which
///  the host calls at a steady cadence from the same thread it sends from.
pub struct Transport {
    socket: Box<dyn DatagramSocket>,
    config: TransportConfig,
    buffer_pool: BufferPool,
    fragmenter: Fragmenter,
    reassembly: ReassemblyTable,
    lifecycle: ConnectionLifecycle,
    events: Vec<ConnectionEvent>,
    receive_buf: Vec<u8>,
    next_message_id: u32,
    started_at: Instant,
}

impl Transport {
    pub fn new(socket: Box<dyn DatagramSocket>, config: TransportConfig) -> anyhow::Result<Transport> {
        let max_packet_size = socket.max_packet_size();
        config.validate(max_packet_size)?;

        info!("starting transport with channels {:?}, maximum packet size {} and maximum message size {}",
            config.channels, max_packet_size, config.max_message_size(max_packet_size));

        Ok(Transport {
            buffer_pool: BufferPool::new(max_packet_size, config.buffer_pool_size),
            fragmenter: Fragmenter::new(config.max_fragment_payload(max_packet_size), config.max_fragments)?,
            reassembly: ReassemblyTable::new(config.max_fragments, config.reassembly_timeout),
            lifecycle: ConnectionLifecycle::new(config.connect_timeout),
            events: Vec::new(),
            receive_buf: vec![0; max_packet_size],
            next_message_id: 0,
            started_at: Instant::now(),
            socket,
            config,
        })
    }

    pub fn max_message_size(&self) -> usize {
        self.fragmenter.max_message_size()
    }

    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        self.lifecycle.state(peer)
    }

    /// the number of partially received messages, across all peers and channels
    pub fn num_in_flight_messages(&self) -> usize {
        self.reassembly.num_in_flight()
    }

    /// Sends a message on an application channel. The message is fragmented completely before the
    ///  first fragment is sent, so a message that is too big fails without sending anything.
    ///
    /// If the substrate rejects a fragment, the remaining fragments are not sent, and the message
    ///  will not be delivered. The transport does not retry.
    pub fn send(&mut self, peer: &PeerId, channel: u8, payload: &[u8]) -> Result<(), TransportError> {
        let Some(&reliability) = self.config.channels.get(channel as usize) else {
            return Err(TransportError::InvalidChannel {
                channel,
                num_channels: self.config.channels.len(),
            });
        };

        let message_id = self.next_message_id;
        let fragments = self.fragmenter.fragment(message_id, payload, &self.buffer_pool)?;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let mut send_buf = self.buffer_pool.get_from_pool();
        for fragment in &fragments {
            send_buf.clear();
            fragment.encode(&mut *send_buf);

            trace!("sending {:?} to {:?} on channel {}", fragment, peer, channel);
            self.socket.send_packet(peer, channel, reliability, &send_buf[..])
                .map_err(|e| TransportError::SendFailed {
                    peer: peer.clone(),
                    channel,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Initiates a handshake. During the startup window the peer's answer would be discarded, so
    ///  CONNECT is sent by the first poll after the window instead.
    pub fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        if self.in_startup_window(Instant::now()) {
            return self.lifecycle.request_connect(peer);
        }

        let mut sink = SocketControlSink {
            socket: self.socket.as_mut(),
            internal_channel: self.config.internal_channel(),
        };
        self.lifecycle.connect(peer, &mut sink)
    }

    /// Incoming connections are accepted implicitly, so this is only needed to retry an accept
    ///  that could not be sent. The resulting `on_connected` is reported by the next poll.
    pub fn accept(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let mut sink = SocketControlSink {
            socket: self.socket.as_mut(),
            internal_channel: self.config.internal_channel(),
        };
        self.lifecycle.accept(peer, &mut sink, &mut self.events)
    }

    /// Closes a connection. The peer's session is released, and `on_disconnected` reported, at
    ///  the start of the next poll.
    pub fn disconnect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let mut sink = SocketControlSink {
            socket: self.socket.as_mut(),
            internal_channel: self.config.internal_channel(),
        };
        self.lifecycle.disconnect(peer, &mut sink)
    }

    /// Processes everything the substrate has queued, reporting received messages and connection
    ///  changes to the handler. This never blocks, and it does nothing if nothing is queued.
    ///
    /// Closes that became due since the previous poll are finalized first. Then the internal
    ///  channel is drained completely, and after that the application channels in ascending
    ///  order.
    ///
    /// During the startup window, datagrams and session requests are discarded. Closure
    ///  notifications are still processed, so handshakes requested during the window fail properly.
    pub fn poll(&mut self, handler: &mut dyn TransportHandler) {
        let now = Instant::now();
        self.release_closed_sessions();

        if self.in_startup_window(now) {
            self.discard_inbound_during_startup();
            self.dispatch_events(handler);
            return;
        }

        self.process_notifications();

        self.lifecycle.check_timeouts(now);
        let mut sink = SocketControlSink {
            socket: self.socket.as_mut(),
            internal_channel: self.config.internal_channel(),
        };
        self.lifecycle.send_pending_connects(&mut sink);
        self.lifecycle.retry_pending_accepts(&mut sink, &mut self.events);
        self.reassembly.evict_stale(now);

        self.dispatch_events(handler);

        self.drain_internal_channel();
        self.dispatch_events(handler);

        for channel in 0..self.config.internal_channel() {
            self.drain_application_channel(channel, handler);
        }
    }

    /// Closes all connections and abandons all handshakes, reporting the terminations to the
    ///  handler right away. Sessions are released and partially received messages discarded.
    ///
    /// The transport can be used again afterwards, starting with a fresh startup window.
    pub fn shutdown(&mut self, handler: &mut dyn TransportHandler) {
        info!("shutting down transport with {} tracked peers", self.lifecycle.num_tracked_peers());

        let mut sink = SocketControlSink {
            socket: self.socket.as_mut(),
            internal_channel: self.config.internal_channel(),
        };
        self.lifecycle.disconnect_all(&mut sink);
        self.release_closed_sessions();
        self.reassembly.clear();
        self.dispatch_events(handler);

        self.started_at = Instant::now();
    }

    fn in_startup_window(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) < self.config.ignore_messages_at_startup
    }

    fn release_closed_sessions(&mut self) {
        for peer in self.lifecycle.finalize_closes(&mut self.events) {
            debug!("releasing session with {:?}", peer);
            self.socket.close_session(&peer);
            self.reassembly.discard_peer(&peer);
        }
    }

    fn process_notifications(&mut self) {
        while let Some(notification) = self.socket.next_notification() {
            match notification {
                SessionNotification::IncomingConnectionRequest(peer) => {
                    debug!("accepting session request from {:?}", peer);
                    self.socket.accept_session(&peer);
                }
                SessionNotification::ConnectionClosed(peer, reason) => {
                    debug!("substrate closed session with {:?}: {:?}", peer, reason);
                    self.lifecycle.on_session_closed(&peer, reason, &mut self.events);
                }
            }
        }
    }

    fn drain_internal_channel(&mut self) {
        let internal_channel = self.config.internal_channel();

        while let Some((peer, len)) = self.socket.try_receive(internal_channel, &mut self.receive_buf) {
            let frame = match ControlFrame::deser(&self.receive_buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("received malformed control frame from {:?} - dropping: {}", peer, e);
                    continue;
                }
            };

            let mut sink = SocketControlSink {
                socket: self.socket.as_mut(),
                internal_channel,
            };
            self.lifecycle.on_control_frame(&peer, frame, &mut sink, &mut self.events);
        }
    }

    fn drain_application_channel(&mut self, channel: u8, handler: &mut dyn TransportHandler) {
        while let Some((peer, len)) = self.socket.try_receive(channel, &mut self.receive_buf) {
            let packet = match FramedPacket::decode(&self.receive_buf[..len], &self.buffer_pool) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("received malformed datagram from {:?} on channel {} - dropping: {}", peer, channel, e);
                    continue;
                }
            };
            trace!("received {:?} from {:?} on channel {}", packet, peer, channel);

            let key = ReassemblyKey { peer, channel };
            if let Some(message) = self.reassembly.ingest(&key, packet) {
                handler.on_message(&key.peer, channel, &message);
            }
        }
    }

    fn dispatch_events(&mut self, handler: &mut dyn TransportHandler) {
        for event in self.events.drain(..) {
            if event.is_terminal() {
                self.reassembly.discard_peer(event.peer());
            }

            match event {
                ConnectionEvent::Connected(peer) => handler.on_connected(&peer),
                ConnectionEvent::Disconnected(peer, reason) => handler.on_disconnected(&peer, reason),
                ConnectionEvent::ConnectionFailed(peer, reason) => handler.on_connection_failed(&peer, reason),
            }
        }
    }

    /// Drains everything the substrate queued. Only closure notifications are processed.
    fn discard_inbound_during_startup(&mut self) {
        let mut num_discarded = 0;
        while let Some(notification) = self.socket.next_notification() {
            match notification {
                SessionNotification::ConnectionClosed(peer, reason) => {
                    debug!("substrate closed session with {:?} during startup: {:?}", peer, reason);
                    self.lifecycle.on_session_closed(&peer, reason, &mut self.events);
                }
                notification => {
                    trace!("ignoring {:?} during startup", notification);
                    num_discarded += 1;
                }
            }
        }
        for channel in 0..=self.config.internal_channel() {
            while let Some((peer, _)) = self.socket.try_receive(channel, &mut self.receive_buf) {
                trace!("ignoring datagram from {:?} on channel {} during startup", peer, channel);
                num_discarded += 1;
            }
        }
        if num_discarded > 0 {
            debug!("ignored {} queued datagrams and notifications during startup", num_discarded);
        }
    }
}
