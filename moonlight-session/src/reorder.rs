//! Generic RTP reorder queue used by the audio receive path, grounded in
//! `RtpReorderQueue.c`.
//!
//! Packets arrive out of order over UDP; this queue holds packets that
//! arrived ahead of the next expected sequence number and releases the
//! lowest held sequence once a time or size bound is hit, accepting a gap
//! rather than waiting forever for a packet that may never arrive.

use std::time::Duration;

use crate::seq::is_before_16;

pub trait Sequenced {
    fn sequence_number(&self) -> u16;
}

bitflags::bitflags! {
    /// What the caller should do after `add_packet` returns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddOutcome: u8 {
        /// Hand the just-added packet to the depacketizer immediately; it was never queued.
        const HANDLE_NOW = 0x1;
        /// The packet was stored in the queue.
        const PACKET_CONSUMED = 0x2;
        /// At least one packet is ready to be drained via `get_queued_packet`.
        const PACKET_READY = 0x4;
    }
}

struct Entry<T> {
    packet: T,
    queued_at: std::time::Instant,
}

pub struct ReorderQueue<T> {
    entries: Vec<Entry<T>>,
    max_size: usize,
    max_queue_time: Duration,
    next_sequence: Option<u16>,
}

impl<T: Sequenced> ReorderQueue<T> {
    pub fn new(max_size: usize, max_queue_time: Duration) -> Self {
        Self {
            entries: Vec::new(),
            max_size,
            max_queue_time,
            next_sequence: None,
        }
    }

    fn lowest_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                // Any held sequence is "before" any other by wraparound comparison
                // except when equal, which queuePacket's dedup check already prevents.
                if is_before_16(a.packet.sequence_number(), b.packet.sequence_number()) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .map(|(i, _)| i)
    }

    /// Releases the lowest-sequence held entry if the queue has grown too old or too large,
    /// advancing `next_sequence` to (at least) its sequence number.
    fn enforce_constraints(&mut self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }

        let oldest = self
            .entries
            .iter()
            .map(|e| e.queued_at)
            .min()
            .expect("non-empty");
        let too_old = oldest.elapsed() > self.max_queue_time;
        let too_big = self.entries.len() == self.max_size.saturating_sub(1);

        if !too_old && !too_big {
            return None;
        }

        let idx = self.lowest_index()?;
        let entry = self.entries.remove(idx);
        self.next_sequence = Some(entry.packet.sequence_number());
        Some(entry.packet)
    }

    fn insert_sorted(&mut self, packet: T) -> bool {
        if self
            .entries
            .iter()
            .any(|e| e.packet.sequence_number() == packet.sequence_number())
        {
            return false;
        }
        self.entries.push(Entry {
            packet,
            queued_at: std::time::Instant::now(),
        });
        true
    }

    pub fn add_packet(&mut self, packet: T) -> AddOutcome {
        let seq = packet.sequence_number();

        if let Some(next) = self.next_sequence {
            if is_before_16(seq, next) {
                return AddOutcome::empty();
            }
        }

        if self.entries.is_empty() {
            if self.next_sequence.is_none() || seq == self.next_sequence.unwrap() {
                self.next_sequence = Some(seq.wrapping_add(1));
                return AddOutcome::HANDLE_NOW;
            }
            return if self.insert_sorted(packet) {
                AddOutcome::PACKET_CONSUMED
            } else {
                AddOutcome::empty()
            };
        }

        let released = self.enforce_constraints();

        if released.is_none() && self.entries.is_empty() {
            self.next_sequence = Some(seq.wrapping_add(1));
            return AddOutcome::HANDLE_NOW;
        }

        if let (Some(released), Some(next)) = (&released, self.next_sequence) {
            let _ = released;
            if is_before_16(seq, next) {
                return AddOutcome::PACKET_READY;
            }
        }

        if Some(seq) == self.next_sequence {
            return if self.insert_sorted(packet) {
                AddOutcome::PACKET_READY | AddOutcome::PACKET_CONSUMED
            } else {
                AddOutcome::empty()
            };
        }

        if self.insert_sorted(packet) {
            let mut outcome = AddOutcome::PACKET_CONSUMED;
            if released.is_some() {
                outcome |= AddOutcome::PACKET_READY;
            }
            outcome
        } else {
            AddOutcome::empty()
        }
    }

    /// Drains the packet matching `next_sequence`, if present, advancing it by one.
    pub fn get_queued_packet(&mut self) -> Option<T> {
        let next = self.next_sequence?;
        let idx = self
            .entries
            .iter()
            .position(|e| e.packet.sequence_number() == next)?;
        self.next_sequence = Some(next.wrapping_add(1));
        Some(self.entries.remove(idx).packet)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Pkt(u16);
    impl Sequenced for Pkt {
        fn sequence_number(&self) -> u16 {
            self.0
        }
    }

    #[test]
    fn in_order_packets_handle_now() {
        let mut q: ReorderQueue<Pkt> = ReorderQueue::new(16, Duration::from_millis(40));
        assert_eq!(q.add_packet(Pkt(0)), AddOutcome::HANDLE_NOW);
        assert_eq!(q.add_packet(Pkt(1)), AddOutcome::HANDLE_NOW);
    }

    #[test]
    fn out_of_order_packet_queues_then_drains_in_order() {
        let mut q: ReorderQueue<Pkt> = ReorderQueue::new(16, Duration::from_millis(40));
        assert_eq!(q.add_packet(Pkt(0)), AddOutcome::HANDLE_NOW);
        // seq 2 arrives before seq 1: queued, nothing ready yet.
        assert_eq!(q.add_packet(Pkt(2)), AddOutcome::PACKET_CONSUMED);
        // seq 1 fills the hole: queued and ready.
        assert_eq!(
            q.add_packet(Pkt(1)),
            AddOutcome::PACKET_CONSUMED | AddOutcome::PACKET_READY
        );
        assert_eq!(q.get_queued_packet(), Some(Pkt(1)));
        assert_eq!(q.get_queued_packet(), Some(Pkt(2)));
        assert_eq!(q.get_queued_packet(), None);
    }

    #[test]
    fn stale_packet_behind_next_sequence_is_rejected() {
        let mut q: ReorderQueue<Pkt> = ReorderQueue::new(16, Duration::from_millis(40));
        q.add_packet(Pkt(5));
        assert_eq!(q.add_packet(Pkt(2)), AddOutcome::empty());
    }

    #[test]
    fn size_bound_releases_lowest_held_entry() {
        let mut q: ReorderQueue<Pkt> = ReorderQueue::new(2, Duration::from_secs(10));
        // Create a hole at 0, then fill the queue to its bound with 1 and 2 (never 0).
        q.add_packet(Pkt(0));
        let outcome = q.add_packet(Pkt(1));
        assert!(outcome.contains(AddOutcome::PACKET_CONSUMED));
    }
}
