//! Video receive pipeline: FEC queue -> depacketizer -> external decoder,
//! grounded in `VideoStream.c`'s receive thread and `Video.h`'s decoder
//! callback contract.

pub mod depacketizer;

use crate::video_fec::{FecEvent, VideoFecQueue, VideoSubHeader};

pub use depacketizer::{DecodeUnit, DepacketizerEvent, NalEntry, NalKind, VideoDepacketizer, VideoPacket};

/// Below this payload size the depacketizer takes the slow Annex-B-splitting path; at or
/// above it, the payload is assumed to be one opaque PICDATA fragment. Matches the original's
/// `packetSize - sizeof(NV_VIDEO_PACKET)` comparison for a ~1024-byte configured packet size.
pub const FULL_PACKET_THRESHOLD: usize = 968;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DecoderCapabilities: u32 {
        const DIRECT_SUBMIT = 0x1;
        const REFERENCE_FRAME_INVALIDATION_AVC = 0x2;
        const REFERENCE_FRAME_INVALIDATION_HEVC = 0x4;
        const REFERENCE_FRAME_INVALIDATION_AV1 = 0x8;
        const PULL_RENDERER = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Ok,
    NeedIdr,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoFormat {
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub is_hevc: bool,
}

/// External decoder collaborator. Implementations may submit synchronously from
/// `add_packet`'s caller thread (`DIRECT_SUBMIT`) or be driven separately by pulling
/// from `VideoStream::poll_decode_unit`/`wait_for_decode_unit`.
pub trait VideoDecoder: Send {
    fn capabilities(&self) -> DecoderCapabilities;
    fn setup(&mut self, format: VideoFormat);
    fn start(&mut self);
    fn stop(&mut self);
    fn cleanup(&mut self);
    fn submit_decode_unit(&mut self, unit: &DecodeUnit) -> SubmitResult;
}

/// Combines the multi-block FEC queue with the depacketizer: one video RTP payload in,
/// zero or more completed frames available out (synchronously if direct-submit, otherwise
/// via the decode-unit queue).
pub struct VideoStream {
    fec: VideoFecQueue,
    depacketizer: VideoDepacketizer,
}

impl VideoStream {
    pub fn new(frame_header_len: usize, reference_frame_invalidation: bool) -> Self {
        Self {
            fec: VideoFecQueue::new(),
            depacketizer: VideoDepacketizer::new(frame_header_len, reference_frame_invalidation),
        }
    }

    /// Feeds one raw RTP video packet (sub-header already parsed) through FEC reassembly and,
    /// for any frame that completes, through the depacketizer. Returns depacketizer events;
    /// ready decode units are drained separately via `poll_decode_unit`/`wait_for_decode_unit`.
    pub fn add_rtp_packet(
        &mut self,
        sub: VideoSubHeader,
        sequence_number: u16,
        payload: Vec<u8>,
        receive_time_ms: u64,
    ) -> Vec<DepacketizerEvent> {
        match self.fec.add_packet(sub, sequence_number, payload) {
            FecEvent::Rejected | FecEvent::Stored => Vec::new(),
            FecEvent::UnrecoverableFrameDropped { .. } => Vec::new(),
            FecEvent::FrameReady { packets, .. } => {
                let mut events = Vec::new();
                for packet in packets {
                    let video_packet = VideoPacket {
                        frame_index: packet.frame_index,
                        stream_packet_index: packet.stream_packet_index,
                        flags: packet.flags,
                        payload: packet.payload,
                    };
                    events.extend(self.depacketizer.add_packet(video_packet, receive_time_ms));
                }
                events
            }
        }
    }

    pub fn poll_decode_unit(&self) -> Option<DecodeUnit> {
        self.depacketizer.poll_decode_unit()
    }

    pub fn wait_for_decode_unit(&self) -> Option<DecodeUnit> {
        self.depacketizer.wait_for_decode_unit()
    }

    /// Drives a direct-submit decoder synchronously for every decode unit queued so far.
    pub fn pump_direct_submit(&self, decoder: &mut dyn VideoDecoder) -> Option<SubmitResult> {
        let mut last = None;
        while let Some(unit) = self.depacketizer.poll_decode_unit() {
            last = Some(decoder.submit_decode_unit(&unit));
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDecoder {
        submitted: usize,
    }

    impl VideoDecoder for CountingDecoder {
        fn capabilities(&self) -> DecoderCapabilities {
            DecoderCapabilities::DIRECT_SUBMIT
        }
        fn setup(&mut self, _format: VideoFormat) {}
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn cleanup(&mut self) {}
        fn submit_decode_unit(&mut self, _unit: &DecodeUnit) -> SubmitResult {
            self.submitted += 1;
            SubmitResult::Ok
        }
    }

    fn sub_header(frame: u32, data_shards: u16, fec_index: u8, spi: u32) -> VideoSubHeader {
        VideoSubHeader {
            stream_packet_index: spi,
            frame_index: frame,
            flags: 0,
            reserved: 0,
            multi_fec_flags: 0,
            multi_fec_blocks: 1,
            fec_info: ((data_shards as u32 * 4) << 20) | (34u32 << 4) | ((fec_index as u32) << 12),
        }
    }

    #[test]
    fn end_to_end_single_block_frame_reaches_decoder() {
        let mut stream = VideoStream::new(0, true);
        let mut payload = vec![0u8; FULL_PACKET_THRESHOLD + 8];
        payload[0] = 0x67;

        for i in 0..3u8 {
            stream.add_rtp_packet(sub_header(1, 3, i, i as u32), 100 + i as u16, payload.clone(), 5);
        }

        let mut decoder = CountingDecoder { submitted: 0 };
        stream.pump_direct_submit(&mut decoder);
        assert_eq!(decoder.submitted, 1);
    }
}
