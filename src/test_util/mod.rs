//! This module contains utilities for testing code that uses the transport without a real
//!  peer-to-peer substrate: an in-memory network connecting any number of sockets, and a handler
//!  that records everything the transport reports. They are used for testing the transport
//!  itself, but they are also exported for application testing.

pub mod memory_network;
pub mod recording_handler;
