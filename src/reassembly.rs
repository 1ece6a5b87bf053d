use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::packet::FramedPacket;
use crate::peer_id::PeerId;

/// One peer talking on one logical channel
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReassemblyKey {
    pub peer: PeerId,
    pub channel: u8,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct InFlightId {
    key: ReassemblyKey,
    message_id: u32,
}

/// The fragments received so far for a single message.
///
/// NB: `fragments` is sorted by fragment index and has no duplicate indices. This is what makes
///      checking for completion cheap: the indices are gap-free iff the last index is `len - 1`.
struct InFlightMessage {
    fragments: Vec<FramedPacket>,
    last_received: Instant,
}

impl InFlightMessage {
    fn new(now: Instant) -> InFlightMessage {
        InFlightMessage {
            fragments: Vec::new(),
            last_received: now,
        }
    }

    fn insert(&mut self, packet: FramedPacket) {
        if let Some(last) = self.fragments.last() {
            if !last.more_fragments && packet.fragment_index > last.fragment_index {
                debug!("fragment {:?} is beyond the message's last fragment {} - dropping", packet, last.fragment_index);
                return;
            }
        }

        if !packet.more_fragments {
            // a last fragment invalidates everything received with a higher index
            let end_index = packet.fragment_index;
            while self.fragments.last().is_some_and(|f| f.fragment_index > end_index) {
                if let Some(dropped) = self.fragments.pop() {
                    debug!("fragment {:?} is beyond the message's last fragment {} - dropping", dropped, end_index);
                }
            }
        }

        match self.fragments.binary_search_by_key(&packet.fragment_index, |f| f.fragment_index) {
            Ok(idx) => {
                trace!("duplicate fragment {:?} - replacing", packet);
                self.fragments[idx] = packet;
            }
            Err(idx) => {
                self.fragments.insert(idx, packet);
            }
        }
    }

    fn is_complete(&self) -> bool {
        match self.fragments.last() {
            Some(last) => !last.more_fragments && last.fragment_index as usize == self.fragments.len() - 1,
            None => false,
        }
    }

    /// Concatenates the fragments' payloads, releasing their buffers
    fn assemble(self) -> Vec<u8> {
        let len = self.fragments.iter()
            .map(|f| f.payload().len())
            .sum();

        let mut result = Vec::with_capacity(len);
        for fragment in self.fragments {
            result.extend_from_slice(fragment.payload());
        }
        result
    }
}

/// Reconstructs messages from fragments, tolerating arbitrary reordering and duplication of
///  fragments, and interleaving of fragments from different messages.
///
/// Each partially received message is tracked under its peer, channel and message id. It is
///  removed when it completes, when its peer is discarded, or when it has not received a fragment
///  for the configured idle timeout.
pub struct ReassemblyTable {
    in_flight: FxHashMap<InFlightId, InFlightMessage>,
    max_fragments: u32,
    idle_timeout: Option<Duration>,
}

impl ReassemblyTable {
    pub fn new(max_fragments: u32, idle_timeout: Option<Duration>) -> ReassemblyTable {
        ReassemblyTable {
            in_flight: FxHashMap::default(),
            max_fragments,
            idle_timeout,
        }
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the message's payload if the fragment completes it, `None` if the fragment was
    ///  absorbed into pending state (or dropped as invalid).
    pub fn ingest(&mut self, key: &ReassemblyKey, packet: FramedPacket) -> Option<Vec<u8>> {
        if packet.is_single_fragment() {
            return Some(packet.payload().to_vec());
        }

        if packet.fragment_index >= self.max_fragments {
            debug!("fragment {:?} from {:?} exceeds the maximum of {} fragments per message - dropping", packet, key, self.max_fragments);
            return None;
        }

        trace!("fragment {:?} from {:?}", packet, key);

        let id = InFlightId {
            key: key.clone(),
            message_id: packet.message_id,
        };

        let now = Instant::now();
        let message = self.in_flight
            .entry(id.clone())
            .or_insert_with(|| InFlightMessage::new(now));
        message.last_received = now;
        message.insert(packet);

        if !message.is_complete() {
            return None;
        }

        trace!("message #{} from {:?} is complete", id.message_id, key);
        self.in_flight.remove(&id)
            .map(InFlightMessage::assemble)
    }

    /// Drops all partially received messages from a peer, on all channels
    pub fn discard_peer(&mut self, peer: &PeerId) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|id, _| &id.key.peer != peer);

        let num_discarded = before - self.in_flight.len();
        if num_discarded > 0 {
            debug!("discarded {} partially received messages from {:?}", num_discarded, peer);
        }
        num_discarded
    }

    /// Drops all partially received messages
    pub fn clear(&mut self) -> usize {
        let num_discarded = self.in_flight.len();
        if num_discarded > 0 {
            debug!("discarded {} partially received messages", num_discarded);
        }
        self.in_flight.clear();
        num_discarded
    }

    /// Drops partially received messages that have been idle for longer than the timeout
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let Some(idle_timeout) = self.idle_timeout else {
            return 0;
        };

        let before = self.in_flight.len();
        self.in_flight.retain(|id, message| {
            let keep = now.saturating_duration_since(message.last_received) < idle_timeout;
            if !keep {
                debug!("message #{} from {:?} received no fragment for {:?} - discarding {} fragments", id.message_id, id.key, idle_timeout, message.fragments.len());
            }
            keep
        });
        before - self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::buffer_pool::BufferPool;
    use crate::fragmenter::Fragmenter;
    use bytes::BufMut;
    use rstest::rstest;

    fn key(peer: &str, channel: u8) -> ReassemblyKey {
        ReassemblyKey {
            peer: PeerId::from(peer),
            channel,
        }
    }

    fn packet(pool: &BufferPool, message_id: u32, fragment_index: u32, more_fragments: bool, payload: &[u8]) -> FramedPacket {
        let mut buf = pool.get_from_pool();
        buf.put_slice(payload);
        FramedPacket::new(message_id, fragment_index, more_fragments, buf)
    }

    /// fragments a 10 byte message into [1,2,3,4], [5,6,7,8], [9,10]
    fn ten_byte_fragments(pool: &BufferPool, message_id: u32) -> Vec<FramedPacket> {
        Fragmenter::new(4, 10).unwrap()
            .fragment(message_id, &[1,2,3,4,5,6,7,8,9,10], pool)
            .unwrap()
    }

    fn ingest_in_order(table: &mut ReassemblyTable, key: &ReassemblyKey, fragments: Vec<FramedPacket>, order: &[usize]) -> Vec<Option<Vec<u8>>> {
        let mut fragments = fragments.into_iter()
            .map(Some)
            .collect::<Vec<_>>();

        order.iter()
            .map(|&i| table.ingest(key, fragments[i].take().unwrap()))
            .collect()
    }

    /// all orderings of `0..n`
    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![vec![]];
        }
        permutations(n - 1).into_iter()
            .flat_map(|p| (0..n).map(move |pos| {
                let mut p = p.clone();
                p.insert(pos, n - 1);
                p
            }))
            .collect()
    }

    #[test]
    fn test_single_fragment_bypass() {
        let pool = BufferPool::new(10, 10);
        let mut table = ReassemblyTable::new(10, None);

        let result = table.ingest(&key("a", 0), packet(&pool, 5, 0, false, &[1,2,3]));

        assert_eq!(result, Some(vec![1,2,3]));
        assert_eq!(table.num_in_flight(), 0);
        assert_eq!(pool.num_idle(), 1);
    }

    #[test]
    fn test_example_out_of_order() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 0);

        let mut fragments = ten_byte_fragments(&pool, 1).into_iter();
        let f0 = fragments.next().unwrap();
        let f1 = fragments.next().unwrap();
        let f2 = fragments.next().unwrap();

        assert_eq!(table.ingest(&k, f1), None);
        assert_eq!(table.ingest(&k, f0), None);
        assert_eq!(table.num_in_flight(), 1);
        assert_eq!(table.ingest(&k, f2), Some(vec![1,2,3,4,5,6,7,8,9,10]));
        assert_eq!(table.num_in_flight(), 0);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::last_first_middle(vec![2, 0, 1])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::middle_first(vec![1, 2, 0])]
    #[case::middle_first_last(vec![1, 0, 2])]
    #[case::first_last_middle(vec![0, 2, 1])]
    fn test_permutations(#[case] order: Vec<usize>) {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 1);

        let results = ingest_in_order(&mut table, &k, ten_byte_fragments(&pool, 9), &order);

        assert_eq!(results, vec![None, None, Some(vec![1,2,3,4,5,6,7,8,9,10])]);
        assert_eq!(table.num_in_flight(), 0);
    }

    #[rstest]
    #[case::duplicate_first(vec![(0, true), (0, true), (1, false)])]
    #[case::duplicate_middle(vec![(1, true), (0, true), (1, true), (1, true), (2, false)])]
    #[case::duplicate_last(vec![(2, false), (2, false), (0, true), (1, true)])]
    fn test_duplicates(#[case] fragments: Vec<(u32, bool)>) {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 1);

        let mut results = Vec::new();
        for (fragment_index, more_fragments) in fragments {
            results.push(table.ingest(&k, packet(&pool, 3, fragment_index, more_fragments, &[fragment_index as u8])));
        }

        let (last, all_but_last) = results.split_last().unwrap();
        assert!(all_but_last.iter().all(Option::is_none));
        assert!(last.is_some());
        assert_eq!(table.num_in_flight(), 0);
    }

    #[test]
    fn test_duplicate_does_not_grow() {
        let pool = BufferPool::new(4, 100);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 1);

        for _ in 0..50 {
            assert_eq!(table.ingest(&k, packet(&pool, 3, 1, true, &[1])), None);
        }
        // one buffer held by the in-flight message, replaced duplicates went back to the pool
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(table.num_in_flight(), 1);
    }

    #[test]
    fn test_no_redelivery_after_completion() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 0);

        let results = ingest_in_order(&mut table, &k, ten_byte_fragments(&pool, 4), &[0, 1, 2]);
        assert!(results[2].is_some());

        // re-delivered fragments start a new in-flight message that never completes on its own
        let results = ingest_in_order(&mut table, &k, ten_byte_fragments(&pool, 4), &[2, 1]);
        assert_eq!(results, vec![None, None]);
        assert_eq!(table.num_in_flight(), 1);
    }

    #[test]
    fn test_channel_isolation() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k0 = key("a", 0);
        let k1 = key("a", 1);
        let other_peer = key("b", 0);

        assert_eq!(table.ingest(&k0, packet(&pool, 7, 0, true, &[1])), None);
        assert_eq!(table.ingest(&k1, packet(&pool, 7, 0, true, &[2])), None);
        assert_eq!(table.ingest(&other_peer, packet(&pool, 7, 0, true, &[3])), None);
        assert_eq!(table.num_in_flight(), 3);

        assert_eq!(table.ingest(&k1, packet(&pool, 7, 1, false, &[20])), Some(vec![2, 20]));
        assert_eq!(table.ingest(&other_peer, packet(&pool, 7, 1, false, &[30])), Some(vec![3, 30]));
        assert_eq!(table.ingest(&k0, packet(&pool, 7, 1, false, &[10])), Some(vec![1, 10]));
        assert_eq!(table.num_in_flight(), 0);
    }

    #[test]
    fn test_interleaved_messages() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 0);

        assert_eq!(table.ingest(&k, packet(&pool, 1, 0, true, &[1])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 2, 1, false, &[4])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 1, 1, true, &[2])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 2, 0, true, &[3])), Some(vec![3, 4]));
        assert_eq!(table.ingest(&k, packet(&pool, 1, 2, false, &[5])), Some(vec![1, 2, 5]));
    }

    #[test]
    fn test_gap_is_incomplete() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 0);

        assert_eq!(table.ingest(&k, packet(&pool, 1, 0, true, &[1])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 1, 2, false, &[3])), None);
        assert_eq!(table.num_in_flight(), 1);
    }

    #[test]
    fn test_fragment_beyond_last_is_dropped() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);
        let k = key("a", 0);

        assert_eq!(table.ingest(&k, packet(&pool, 1, 3, true, &[9])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 1, 1, false, &[2])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 1, 2, true, &[8])), None);
        assert_eq!(table.ingest(&k, packet(&pool, 1, 0, true, &[1])), Some(vec![1, 2]));
    }

    #[test]
    fn test_fragment_index_limit() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(3, None);
        let k = key("a", 0);

        assert_eq!(table.ingest(&k, packet(&pool, 1, 3, false, &[1])), None);
        assert_eq!(table.num_in_flight(), 0);
        assert_eq!(table.ingest(&k, packet(&pool, 1, 2, false, &[1])), None);
        assert_eq!(table.num_in_flight(), 1);
    }

    #[test]
    fn test_discard_peer() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);

        table.ingest(&key("a", 0), packet(&pool, 1, 0, true, &[1]));
        table.ingest(&key("a", 1), packet(&pool, 1, 0, true, &[1]));
        table.ingest(&key("a", 1), packet(&pool, 2, 1, true, &[1]));
        table.ingest(&key("b", 0), packet(&pool, 1, 0, true, &[1]));

        assert_eq!(table.discard_peer(&PeerId::from("a")), 3);
        assert_eq!(table.num_in_flight(), 1);
        assert_eq!(pool.num_idle(), 3);

        assert_eq!(table.discard_peer(&PeerId::from("a")), 0);
        assert_eq!(table.ingest(&key("b", 0), packet(&pool, 1, 1, false, &[2])), Some(vec![1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, Some(Duration::from_secs(5)));
        let k = key("a", 0);

        table.ingest(&k, packet(&pool, 1, 0, true, &[1]));
        tokio::time::advance(Duration::from_secs(3)).await;
        table.ingest(&k, packet(&pool, 2, 0, true, &[1]));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.evict_stale(Instant::now()), 1);
        assert_eq!(table.num_in_flight(), 1);

        // a new fragment refreshes the message
        tokio::time::advance(Duration::from_secs(2)).await;
        table.ingest(&k, packet(&pool, 2, 1, true, &[1]));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(table.evict_stale(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(table.evict_stale(Instant::now()), 1);
        assert_eq!(table.num_in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eviction_without_timeout() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);

        table.ingest(&key("a", 0), packet(&pool, 1, 0, true, &[1]));
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(table.evict_stale(Instant::now()), 0);
        assert_eq!(table.num_in_flight(), 1);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::exact(4)]
    #[case::two(5)]
    #[case::many(33)]
    fn test_round_trip_reversed_with_duplicates(#[case] len: usize) {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(100, None);
        let k = key("a", 0);
        let message = (0..len).map(|i| i as u8).collect::<Vec<_>>();

        let fragmenter = Fragmenter::new(4, 100).unwrap();
        let first = fragmenter.fragment(1, &message, &pool).unwrap();
        let duplicates = fragmenter.fragment(1, &message, &pool).unwrap();

        let mut result = None;
        for (fragment, duplicate) in first.into_iter().rev().zip(duplicates.into_iter().rev()) {
            assert!(result.is_none());
            if fragment.fragment_index > 0 {
                assert_eq!(table.ingest(&k, duplicate), None);
            }
            result = table.ingest(&k, fragment);
        }
        assert_eq!(result, Some(message));
    }

    #[test]
    fn test_clear() {
        let pool = BufferPool::new(4, 10);
        let mut table = ReassemblyTable::new(10, None);

        table.ingest(&key("a", 0), packet(&pool, 1, 0, true, &[1]));
        table.ingest(&key("b", 1), packet(&pool, 1, 0, true, &[1]));

        assert_eq!(table.clear(), 2);
        assert_eq!(table.num_in_flight(), 0);
        assert_eq!(pool.num_idle(), 2);
        assert_eq!(table.clear(), 0);
    }

    #[rstest]
    fn test_every_order_with_duplicates(#[values(1, 2, 3, 4)] max_fragment_payload: usize, #[values(0, 1, 2, 3, 4, 5, 6)] len: usize) {
        let pool = BufferPool::new(4, 10);
        let fragmenter = Fragmenter::new(max_fragment_payload, 10).unwrap();
        let k = key("a", 0);
        let message = (0..len).map(|i| i as u8 + 1).collect::<Vec<_>>();

        for order in permutations(fragmenter.fragment_count(len)) {
            let mut table = ReassemblyTable::new(10, None);
            let mut originals = fragmenter.fragment(7, &message, &pool).unwrap()
                .into_iter()
                .map(Some)
                .collect::<Vec<_>>();
            let mut duplicates = fragmenter.fragment(7, &message, &pool).unwrap()
                .into_iter()
                .map(Some)
                .collect::<Vec<_>>();

            let (&completing, before) = order.split_last().unwrap();
            for &i in before {
                assert_eq!(table.ingest(&k, duplicates[i].take().unwrap()), None, "order {:?}", order);
                assert_eq!(table.ingest(&k, originals[i].take().unwrap()), None, "order {:?}", order);
            }
            assert_eq!(table.ingest(&k, originals[completing].take().unwrap()), Some(message.clone()), "order {:?}", order);
            assert_eq!(table.num_in_flight(), 0);
        }
    }
}
