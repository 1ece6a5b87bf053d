//! A message-oriented transport on top of a peer-to-peer datagram substrate, i.e. a primitive
//!  that delivers datagrams of limited size to peers identified by an opaque id, on a small number
//!  of channels with per-channel delivery guarantees.
//!
//! The transport adds two things to the substrate:
//! * Messages of arbitrary size (up to a configured number of fragments). Messages are split into
//!   fragments that fit into a single datagram each, and reassembled on the receiving side,
//!   tolerating reordering and duplication of fragments, and interleaving of several messages'
//!   fragments
//! * A connection lifecycle per peer, with an explicit handshake and teardown. The host is
//!   notified when a connection is established, closed or fails to be established
//!
//! Encryption, NAT traversal and relaying are the substrate's responsibility, as is reliable
//!  and / or ordered delivery on channels that are configured for it.
//!
//! ## Threading
//!
//! The transport is single threaded and poll driven. The host calls
//!  [transport::Transport::poll] at a steady cadence (e.g. once per frame), and all received
//!  messages and connection events are reported from within that call. Sending happens
//!  synchronously when the host calls [transport::Transport::send], from the same thread.
//!
//! ## Channels
//!
//! The host configures a list of application channels, each with its delivery guarantee. The
//!  transport uses one additional channel, numbered one past the application channels, for its
//!  control frames.
//!
//! ## Fragments
//!
//! Every datagram on an application channel carries one fragment of a message:
//!
//! ```ascii
//! 0: message id (u32 LE) - assigned by the sender, incremented for every message and wrapping
//!     around. It identifies the message among the sender's messages in flight on the same channel
//! 4: fragment index (u32 LE) - zero based
//! 8: more fragments (u8) - 1 for all but the message's last fragment, 0 for the last fragment
//! 9: payload - all fragments except the last carry the maximum payload that fits into a datagram
//! ```
//!
//! A message that fits into a single datagram is sent as fragment 0 without 'more fragments', and
//!  it is delivered without any buffering on the receiving side.
//!
//! Partially received messages are discarded when the peer disconnects, and when they did not
//!  receive a fragment for a configurable timeout.
//!
//! ## Control frames
//!
//! Control frames are a single byte, sent on the internal channel:
//! * CONNECT (0): request a connection
//! * ACCEPT_CONNECT (1): accept a connection request
//! * DISCONNECT (2): close a connection, or abandon a handshake
//!
//! A handshake is initiated by sending CONNECT. The receiving side answers with ACCEPT_CONNECT
//!  right away and considers the connection established; the initiating side does so when it
//!  receives ACCEPT_CONNECT. If both sides send CONNECT at the same time, both answer with
//!  ACCEPT_CONNECT.
//!
//! Closing a connection takes effect at the start of the next poll: the peer's substrate session
//!  is released then, after all datagrams the peer sent before the close were processed.
//!
//! A handshake that is not complete after a configurable timeout fails.
//!
//! ## Startup
//!
//! A substrate may have datagrams from an earlier session queued when the transport starts. For
//!  a configurable interval after the transport's creation (or shutdown), received datagrams and
//!  session requests are discarded. Closure notifications are still processed. A connection
//!  requested during that interval sends its CONNECT with the first poll after it.

pub mod buffers;
pub mod config;
pub mod connection;
pub mod control_messages;
pub mod datagram_socket;
pub mod error;
pub mod fragmenter;
pub mod handler;
pub mod packet;
pub mod peer_id;
pub mod reassembly;
pub mod test_util;
pub mod transport;
