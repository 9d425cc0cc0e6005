//! Audio receive pipeline: RS(4,2) FEC queue -> external renderer, grounded in
//! `AudioStream.c`'s receive thread and `Audio.h`'s renderer callback contract.

use crate::audio_fec::{AudioBlockResult, AudioFecQueue, DATA_SHARDS};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RendererCapabilities: u32 {
        const DIRECT_SUBMIT = 0x1;
        const SLOW_OPUS_DECODER = 0x2;
        const SUPPORTS_ARBITRARY_AUDIO_DURATION = 0x4;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpusMultistreamConfig {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub streams: u8,
    pub coupled_streams: u8,
    pub channel_mapping: [u8; 8],
}

/// External audio collaborator: decodes Opus shards and plays them back.
/// Mirrors the teacher's `AUDIO_RENDERER_CALLBACKS` contract.
pub trait AudioRenderer: Send {
    fn capabilities(&self) -> RendererCapabilities;
    fn init(&mut self, config: OpusMultistreamConfig);
    fn start(&mut self);
    fn stop(&mut self);
    fn cleanup(&mut self);
    /// `None` entries are silence markers for shards the FEC pass couldn't recover.
    fn decode_and_play_sample(&mut self, data: Option<&[u8]>);
}

/// Wraps the fixed-shape audio FEC queue and hands reassembled (or best-effort silenced)
/// frames to an [`AudioRenderer`] in sequence order.
pub struct AudioStream {
    fec: AudioFecQueue,
}

impl AudioStream {
    pub fn new() -> Self {
        Self { fec: AudioFecQueue::new() }
    }

    pub fn add_shard(&mut self, base_sequence: u16, shard_index: usize, payload: Vec<u8>) {
        self.fec.add_shard(base_sequence, shard_index, payload);
    }

    /// Drains every block ready to play (reassembled, or past the out-of-sequence grace
    /// window) and feeds its data shards to `renderer` in order.
    pub fn pump(&mut self, renderer: &mut dyn AudioRenderer) {
        while let Some(block) = self.fec.poll_ready() {
            self.play_block(block, renderer);
        }
    }

    fn play_block(&self, block: AudioBlockResult, renderer: &mut dyn AudioRenderer) {
        for shard in block.data_shards.into_iter().take(DATA_SHARDS) {
            renderer.decode_and_play_sample(shard.as_deref());
        }
    }
}

impl Default for AudioStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingRenderer {
        played: usize,
        silences: usize,
    }

    impl AudioRenderer for CountingRenderer {
        fn capabilities(&self) -> RendererCapabilities {
            RendererCapabilities::DIRECT_SUBMIT
        }
        fn init(&mut self, _config: OpusMultistreamConfig) {}
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn cleanup(&mut self) {}
        fn decode_and_play_sample(&mut self, data: Option<&[u8]>) {
            match data {
                Some(_) => self.played += 1,
                None => self.silences += 1,
            }
        }
    }

    #[test]
    fn full_block_plays_every_shard() {
        let mut stream = AudioStream::new();
        for i in 0..DATA_SHARDS {
            stream.add_shard(0, i, vec![1, 2, 3]);
        }
        let mut renderer = CountingRenderer { played: 0, silences: 0 };
        stream.pump(&mut renderer);
        assert_eq!(renderer.played, DATA_SHARDS);
        assert_eq!(renderer.silences, 0);
    }
}
