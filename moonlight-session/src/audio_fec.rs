//! Fixed-shape RS(4,2) audio FEC queue, grounded in `RtpAudioQueue.h` (the
//! original's `.c` counterpart is not present in this source drop, so the
//! reassembly policy below follows the header's struct layout plus the
//! behaviour spelled out directly in the audio FEC queue's design note).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rs::ReedSolomon;

pub const DATA_SHARDS: usize = 4;
pub const PARITY_SHARDS: usize = 2;
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;
pub const CACHED_BLOCK_LIMIT: usize = 4;
pub const OOS_WAIT: Duration = Duration::from_millis(10);

/// The header carried by parity shards, placed before the parity payload.
#[derive(Debug, Clone, Copy)]
pub struct AudioFecHeader {
    pub fec_shard_index: u8,
    pub payload_type: u8,
    pub base_sequence_number: u16,
    pub base_timestamp: u32,
    pub ssrc: u32,
}

struct FecBlock {
    base_sequence: u16,
    shards: [Option<Vec<u8>>; TOTAL_SHARDS],
    data_received: u8,
    parity_received: u8,
    reassembled: bool,
    queued_at: Instant,
}

impl FecBlock {
    fn new(base_sequence: u16) -> Self {
        Self {
            base_sequence,
            shards: Default::default(),
            data_received: 0,
            parity_received: 0,
            reassembled: false,
            queued_at: Instant::now(),
        }
    }

    fn received_count(&self) -> usize {
        self.data_received as usize + self.parity_received as usize
    }

    fn insert(&mut self, shard_index: usize, payload: Vec<u8>) {
        if shard_index >= TOTAL_SHARDS || self.shards[shard_index].is_some() {
            return;
        }
        if shard_index < DATA_SHARDS {
            self.data_received += 1;
        } else {
            self.parity_received += 1;
        }
        self.shards[shard_index] = Some(payload);
    }
}

/// Result of draining one audio FEC block.
pub struct AudioBlockResult {
    pub base_sequence: u16,
    /// One entry per data shard in shard-index order; `None` is a silence marker
    /// for a shard that could not be recovered.
    pub data_shards: [Option<Vec<u8>>; DATA_SHARDS],
}

pub struct AudioFecQueue {
    rs: ReedSolomon,
    blocks: VecDeque<FecBlock>,
}

impl AudioFecQueue {
    pub fn new() -> Self {
        Self {
            rs: ReedSolomon::new(DATA_SHARDS, PARITY_SHARDS),
            blocks: VecDeque::new(),
        }
    }

    fn find_or_create_block(&mut self, base_sequence: u16) -> usize {
        if let Some(idx) = self.blocks.iter().position(|b| b.base_sequence == base_sequence) {
            return idx;
        }

        if self.blocks.len() >= CACHED_BLOCK_LIMIT {
            self.blocks.pop_front();
        }
        self.blocks.push_back(FecBlock::new(base_sequence));
        self.blocks.len() - 1
    }

    /// Adds one shard (data shard index `0..4`, parity shard index `4..6`) belonging to the
    /// FEC block that starts at `base_sequence`.
    pub fn add_shard(&mut self, base_sequence: u16, shard_index: usize, payload: Vec<u8>) {
        let idx = self.find_or_create_block(base_sequence);
        let block = &mut self.blocks[idx];
        block.insert(shard_index, payload);

        if !block.reassembled && block.received_count() >= DATA_SHARDS {
            self.try_reassemble(idx);
        }
    }

    fn try_reassemble(&mut self, idx: usize) {
        let block = &mut self.blocks[idx];
        if (0..DATA_SHARDS).all(|i| block.shards[i].is_some()) {
            block.reassembled = true;
            return;
        }

        let len = block
            .shards
            .iter()
            .flatten()
            .map(|s| s.len())
            .max()
            .unwrap_or(0);
        let mut padded: Vec<Option<Vec<u8>>> = block
            .shards
            .iter()
            .map(|s| {
                s.as_ref().map(|v| {
                    let mut v = v.clone();
                    v.resize(len, 0);
                    v
                })
            })
            .collect();

        if self.rs.reconstruct_data(&mut padded).is_some() {
            for (i, shard) in padded.into_iter().enumerate().take(DATA_SHARDS) {
                if block.shards[i].is_none() {
                    block.shards[i] = shard;
                }
            }
            block.reassembled = true;
        }
    }

    /// Pops the oldest block if it is fully reassembled, or if it has been waiting past the
    /// out-of-sequence grace window (in which case missing data shards become silence markers).
    pub fn poll_ready(&mut self) -> Option<AudioBlockResult> {
        let front = self.blocks.front()?;
        if !front.reassembled && front.queued_at.elapsed() < OOS_WAIT {
            return None;
        }

        let mut block = self.blocks.pop_front().expect("front checked above");
        if !block.reassembled {
            self.try_reassemble_forced(&mut block);
        }

        let data_shards = std::array::from_fn(|i| block.shards[i].take());
        Some(AudioBlockResult {
            base_sequence: block.base_sequence,
            data_shards,
        })
    }

    fn try_reassemble_forced(&self, block: &mut FecBlock) {
        let len = block
            .shards
            .iter()
            .flatten()
            .map(|s| s.len())
            .max()
            .unwrap_or(0);
        if len == 0 {
            return;
        }
        let mut padded: Vec<Option<Vec<u8>>> = block
            .shards
            .iter()
            .map(|s| {
                s.as_ref().map(|v| {
                    let mut v = v.clone();
                    v.resize(len, 0);
                    v
                })
            })
            .collect();
        if self.rs.reconstruct_data(&mut padded).is_some() {
            for (i, shard) in padded.into_iter().enumerate().take(DATA_SHARDS) {
                if block.shards[i].is_none() {
                    block.shards[i] = shard;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Default for AudioFecQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_when_all_four_data_shards_present() {
        let mut q = AudioFecQueue::new();
        for i in 0..DATA_SHARDS {
            q.add_shard(1000, i, vec![i as u8; 8]);
        }
        let result = q.poll_ready().expect("block ready immediately");
        assert_eq!(result.base_sequence, 1000);
        for i in 0..DATA_SHARDS {
            assert_eq!(result.data_shards[i], Some(vec![i as u8; 8]));
        }
    }

    #[test]
    fn recovers_missing_data_shard_from_parity() {
        let rs = ReedSolomon::new(DATA_SHARDS, PARITY_SHARDS);
        let data: Vec<Vec<u8>> = (0..DATA_SHARDS).map(|i| vec![i as u8 + 1; 4]).collect();
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let parity = rs.encode(&refs).unwrap();

        let mut q = AudioFecQueue::new();
        q.add_shard(2000, 0, data[0].clone());
        q.add_shard(2000, 1, data[1].clone());
        q.add_shard(2000, 3, data[3].clone());
        q.add_shard(2000, 4, parity[0].clone());

        let result = q.poll_ready().expect("reconstructed immediately");
        assert_eq!(result.data_shards[2], Some(data[2].clone()));
    }

    #[test]
    fn stale_block_drains_with_silence_after_grace_window() {
        let mut q = AudioFecQueue::new();
        q.add_shard(3000, 0, vec![1; 4]);
        assert!(q.poll_ready().is_none());
        std::thread::sleep(OOS_WAIT + Duration::from_millis(5));
        let result = q.poll_ready().expect("grace window elapsed");
        assert_eq!(result.data_shards[0], Some(vec![1; 4]));
        assert_eq!(result.data_shards[1], None);
    }

    #[test]
    fn cache_limit_rotates_oldest_block_out() {
        let mut q = AudioFecQueue::new();
        for block in 0..(CACHED_BLOCK_LIMIT as u16 + 1) {
            q.add_shard(block * 10, 0, vec![block as u8; 4]);
        }
        assert_eq!(q.len(), CACHED_BLOCK_LIMIT);
    }
}
