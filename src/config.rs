use std::time::Duration;
use anyhow::bail;
use tracing::warn;
use crate::packet::FramedPacket;

/// Delivery guarantee of a logical channel, provided by the underlying P2P substrate
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PacketReliability {
    UnreliableUnordered,
    ReliableUnordered,
    ReliableOrdered,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// One entry per application channel, indexed by channel number. The transport reserves one
    ///  additional channel (numbered `channels.len()`) for its connection handshake.
    ///
    /// Host frameworks conventionally rely on channel 0 being ordered-reliable and channel 1 being
    ///  unordered-unreliable; other configurations are allowed but trigger a warning.
    pub channels: Vec<PacketReliability>,

    /// This is the maximum number of fragments a single message may be split into. Sending a
    ///  message that requires more fragments fails without sending anything.
    ///
    /// Together with the substrate's maximum packet size, this determines the maximum message size.
    pub max_fragments: u32,

    /// This is the number of idle buffers that will be pooled at a given time - buffers in excess
    ///  of this number are discarded when they are returned.
    pub buffer_pool_size: usize,

    /// A handshake that is not completed within this time fails with a timeout.
    pub connect_timeout: Duration,

    /// A partially received message that did not receive a fragment for this long is discarded.
    ///  Without a timeout, a peer sending partial messages could make the receiver hold on to
    ///  their fragments indefinitely.
    pub reassembly_timeout: Option<Duration>,

    /// The substrate may have datagrams from earlier sessions queued when the transport is created.
    ///  For this long after construction, everything received is discarded.
    pub ignore_messages_at_startup: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            channels: vec![PacketReliability::ReliableOrdered, PacketReliability::UnreliableUnordered],
            max_fragments: 55,
            buffer_pool_size: 256,
            connect_timeout: Duration::from_secs(25),
            reassembly_timeout: Some(Duration::from_secs(30)),
            ignore_messages_at_startup: Duration::from_secs(2),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self, max_packet_size: usize) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }
        if self.channels.len() >= u8::MAX as usize {
            bail!("too many channels: {} configured, the maximum is {}", self.channels.len(), u8::MAX - 1);
        }
        if self.max_fragments == 0 {
            bail!("max_fragments must be at least 1");
        }
        if max_packet_size <= FramedPacket::HEADER_LEN {
            bail!("maximum packet size of {} leaves no room for payload after the {} byte header", max_packet_size, FramedPacket::HEADER_LEN);
        }

        if self.channels[0] != PacketReliability::ReliableOrdered {
            warn!("channel 0 is {:?} rather than ReliableOrdered - host frameworks usually expect channel 0 to be ReliableOrdered", self.channels[0]);
        }
        if let Some(ch1) = self.channels.get(1) {
            if *ch1 != PacketReliability::UnreliableUnordered {
                warn!("channel 1 is {:?} rather than UnreliableUnordered - host frameworks usually expect channel 1 to be UnreliableUnordered", ch1);
            }
        }

        Ok(())
    }

    /// the reserved channel for handshake control frames, one past the application channels
    pub fn internal_channel(&self) -> u8 {
        self.channels.len() as u8
    }

    /// zero if the packet size leaves no room after the header, which [TransportConfig::validate] rejects
    pub fn max_fragment_payload(&self, max_packet_size: usize) -> usize {
        max_packet_size.saturating_sub(FramedPacket::HEADER_LEN)
    }

    pub fn max_message_size(&self, max_packet_size: usize) -> usize {
        self.max_fragment_payload(max_packet_size) * self.max_fragments as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use PacketReliability::*;

    fn config(channels: Vec<PacketReliability>, max_fragments: u32) -> TransportConfig {
        TransportConfig {
            channels,
            max_fragments,
            ..TransportConfig::default()
        }
    }

    #[rstest]
    #[case::default(TransportConfig::default(), 1170, true)]
    #[case::single_channel(config(vec![ReliableOrdered], 1), 1170, true)]
    #[case::unconventional_channels(config(vec![UnreliableUnordered, ReliableUnordered], 10), 1170, true)]
    #[case::no_channels(config(vec![], 10), 1170, false)]
    #[case::too_many_channels(config(vec![ReliableOrdered; 255], 10), 1170, false)]
    #[case::max_channels(config(vec![ReliableOrdered; 254], 10), 1170, true)]
    #[case::no_fragments(config(vec![ReliableOrdered], 0), 1170, false)]
    #[case::packet_size_header_only(TransportConfig::default(), 9, false)]
    #[case::packet_size_minimal(TransportConfig::default(), 10, true)]
    fn test_validate(#[case] config: TransportConfig, #[case] max_packet_size: usize, #[case] expected_ok: bool) {
        assert_eq!(config.validate(max_packet_size).is_ok(), expected_ok);
    }

    #[rstest]
    #[case(vec![ReliableOrdered], 1)]
    #[case(vec![ReliableOrdered, UnreliableUnordered], 2)]
    #[case(vec![ReliableOrdered, UnreliableUnordered, ReliableUnordered], 3)]
    fn test_internal_channel(#[case] channels: Vec<PacketReliability>, #[case] expected: u8) {
        assert_eq!(config(channels, 1).internal_channel(), expected);
    }

    #[test]
    fn test_max_message_size() {
        let config = config(vec![ReliableOrdered], 55);
        assert_eq!(config.max_fragment_payload(1170), 1161);
        assert_eq!(config.max_message_size(1170), 1161 * 55);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::header_only(9)]
    fn test_max_message_size_without_room(#[case] max_packet_size: usize) {
        let config = TransportConfig::default();
        assert_eq!(config.max_fragment_payload(max_packet_size), 0);
        assert_eq!(config.max_message_size(max_packet_size), 0);
    }
}
