//! Video depacketizer: reassembles RTP video payloads into decode units,
//! grounded in `VideoDepacketizer.c`.

use crate::queue::BoundedQueue;
use crate::seq::is_before_32;

const DECODE_UNIT_QUEUE_CAPACITY: usize = 15;
const CONSECUTIVE_DROP_LIMIT: u32 = 120;

pub const FLAG_CONTAINS_PIC_DATA: u8 = 0x1;
pub const FLAG_EOF: u8 = 0x2;
pub const FLAG_SOF: u8 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    Sps,
    Pps,
    Vps,
    PicData,
}

#[derive(Debug, Clone)]
pub struct NalEntry {
    pub kind: NalKind,
    pub data: Vec<u8>,
}

/// One reassembled frame, ready for the decoder.
#[derive(Debug, Clone)]
pub struct DecodeUnit {
    pub frame_number: u32,
    pub is_idr: bool,
    pub entries: Vec<NalEntry>,
    pub full_length: usize,
    pub receive_time_ms: u64,
}

/// A video payload handed up from the FEC/reorder layer.
pub struct VideoPacket {
    pub frame_index: u32,
    pub stream_packet_index: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// Observable side effects of feeding a packet to the depacketizer, mirroring
/// the connection callbacks the original fires directly from this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepacketizerEvent {
    FrameLossRange { start: u32, end: u32 },
    RefreshRequested,
}

struct SpecialSeq {
    offset: usize,
    len: usize,
}

fn get_special_seq(data: &[u8], offset: usize, remaining: usize) -> Option<SpecialSeq> {
    if remaining < 3 {
        return None;
    }
    if data[offset] == 0 && data[offset + 1] == 0 {
        if data[offset + 2] == 0 {
            if remaining >= 4 && data[offset + 3] == 1 {
                return Some(SpecialSeq { offset, len: 4 });
            }
            return Some(SpecialSeq { offset, len: 3 });
        } else if data[offset + 2] == 1 {
            return Some(SpecialSeq { offset, len: 3 });
        }
    }
    None
}

fn is_seq_frame_start(data: &[u8], seq: &SpecialSeq) -> bool {
    seq.len == 4 && data[seq.offset + seq.len - 1] == 1
}

fn is_seq_avc_start(data: &[u8], seq: &SpecialSeq) -> bool {
    data[seq.offset + seq.len - 1] == 1
}

fn is_seq_padding(data: &[u8], seq: &SpecialSeq) -> bool {
    data[seq.offset + seq.len - 1] == 0
}

fn nal_kind_for(data: &[u8]) -> NalKind {
    match data.first() {
        Some(0x67) => NalKind::Sps,
        Some(0x68) => NalKind::Pps,
        Some(0x40) => NalKind::Vps,
        _ => NalKind::PicData,
    }
}

pub struct VideoDepacketizer {
    frame_header_len: usize,
    strict_idr_frame_wait: bool,

    next_frame_number: u32,
    start_frame_number: u32,
    last_stream_packet_index: Option<u32>,

    nal_chain: Vec<NalEntry>,
    nal_chain_data_length: usize,
    decoding_frame: bool,
    decoding_avc_run: bool,

    waiting_for_idr_frame: bool,
    waiting_for_next_successful_frame: bool,
    consecutive_frame_drops: u32,
    drop_state_pending: bool,

    first_packet_receive_time_ms: Option<u64>,
    decode_unit_queue: BoundedQueue<DecodeUnit>,
}

impl VideoDepacketizer {
    pub fn new(frame_header_len: usize, reference_frame_invalidation: bool) -> Self {
        Self {
            frame_header_len,
            strict_idr_frame_wait: !reference_frame_invalidation,
            next_frame_number: 1,
            start_frame_number: 1,
            last_stream_packet_index: None,
            nal_chain: Vec::new(),
            nal_chain_data_length: 0,
            decoding_frame: false,
            decoding_avc_run: false,
            waiting_for_idr_frame: true,
            waiting_for_next_successful_frame: false,
            consecutive_frame_drops: 0,
            drop_state_pending: false,
            first_packet_receive_time_ms: None,
            decode_unit_queue: BoundedQueue::new(DECODE_UNIT_QUEUE_CAPACITY),
        }
    }

    pub fn wait_for_decode_unit(&self) -> Option<DecodeUnit> {
        self.decode_unit_queue.wait().ok()
    }

    pub fn poll_decode_unit(&self) -> Option<DecodeUnit> {
        self.decode_unit_queue.poll()
    }

    fn clear_nal_state(&mut self) {
        self.nal_chain.clear();
        self.nal_chain_data_length = 0;
        self.decoding_avc_run = false;
    }

    fn drop_frame_state(&mut self, events: &mut Vec<DepacketizerEvent>) {
        self.clear_nal_state();
        self.decoding_frame = false;
        if self.strict_idr_frame_wait {
            self.waiting_for_idr_frame = true;
        }
        self.consecutive_frame_drops += 1;
        if self.consecutive_frame_drops >= CONSECUTIVE_DROP_LIMIT {
            self.request_refresh(events);
        }
    }

    fn request_refresh(&mut self, events: &mut Vec<DepacketizerEvent>) {
        self.decode_unit_queue.flush();
        self.waiting_for_idr_frame = true;
        self.drop_state_pending = true;
        self.consecutive_frame_drops = 0;
        events.push(DepacketizerEvent::RefreshRequested);
    }

    fn queue_fragment(&mut self, kind: NalKind, bytes: &[u8]) {
        self.nal_chain_data_length += bytes.len();
        self.nal_chain.push(NalEntry {
            kind,
            data: bytes.to_vec(),
        });
    }

    /// Slow path: splits Annex-B prefixed SPS/PPS/VPS/padding out of the payload.
    fn process_payload_slow(&mut self, payload: &[u8]) {
        let mut offset = 0usize;
        while offset < payload.len() {
            let remaining = payload.len() - offset;

            if let Some(seq) = get_special_seq(payload, offset, remaining) {
                if is_seq_avc_start(payload, &seq) {
                    self.decoding_avc_run = true;
                    if is_seq_frame_start(payload, &seq) {
                        // A fresh start code inside the payload closes out whatever NAL
                        // was in progress; the caller reassembles on EOF, not here, so
                        // nothing to flush mid-payload beyond skipping the marker.
                    }
                    offset += seq.len;
                } else {
                    if self.decoding_avc_run && is_seq_padding(payload, &seq) {
                        // trailing Annex-B zero padding; stop collecting this NAL.
                    }
                    self.decoding_avc_run = false;
                    offset += 1;
                }
            }

            let nal_start = offset;

            while offset < payload.len() {
                let remaining = payload.len() - offset;
                if let Some(seq) = get_special_seq(payload, offset, remaining) {
                    if self.decoding_avc_run || !is_seq_padding(payload, &seq) {
                        break;
                    }
                }
                offset += 1;
            }

            if self.decoding_avc_run && offset > nal_start {
                let bytes = &payload[nal_start..offset];
                let kind = nal_kind_for(bytes);
                self.queue_fragment(kind, bytes);
            }
        }
    }

    fn process_payload_fast(&mut self, payload: &[u8]) {
        self.queue_fragment(NalKind::PicData, payload);
    }

    fn reassemble_frame(&mut self, frame_number: u32, receive_time_ms: u64, events: &mut Vec<DepacketizerEvent>) {
        if self.nal_chain.is_empty() {
            return;
        }

        let entries = std::mem::take(&mut self.nal_chain);
        let full_length = self.nal_chain_data_length;
        self.nal_chain_data_length = 0;

        let is_idr = entries
            .first()
            .map(|e| e.kind != NalKind::PicData)
            .unwrap_or(false);

        let unit = DecodeUnit {
            frame_number,
            is_idr,
            entries,
            full_length,
            receive_time_ms,
        };

        if self.decode_unit_queue.offer(unit).is_err() {
            self.drop_state_pending = true;
            self.request_refresh(events);
        }
    }

    /// Feeds one ordered video payload into the depacketizer, returning any
    /// observable events raised while processing it.
    pub fn add_packet(&mut self, packet: VideoPacket, receive_time_ms: u64) -> Vec<DepacketizerEvent> {
        let mut events = Vec::new();

        if self.drop_state_pending {
            self.drop_state_pending = false;
        }

        let stream_packet_index = (packet.stream_packet_index >> 8) & 0xFF_FFFF;
        if let Some(last) = self.last_stream_packet_index {
            debug_assert!(
                is_before_32(last, stream_packet_index) || last == stream_packet_index,
                "stream packet index must be monotonic"
            );
        }
        self.last_stream_packet_index = Some(stream_packet_index);

        let is_first_packet = (packet.flags & (FLAG_SOF | FLAG_EOF)) == (FLAG_SOF | FLAG_EOF)
            || (packet.flags & (FLAG_SOF | FLAG_EOF)) == FLAG_SOF;

        if is_first_packet {
            if packet.frame_index > self.next_frame_number {
                events.push(DepacketizerEvent::FrameLossRange {
                    start: self.start_frame_number,
                    end: packet.frame_index - 1,
                });
                self.next_frame_number = packet.frame_index;
                self.waiting_for_next_successful_frame = true;
                self.drop_frame_state(&mut events);
            }
            self.decoding_frame = true;
            self.first_packet_receive_time_ms = Some(receive_time_ms);
        }

        if !self.decoding_frame {
            return events;
        }

        let header_len = self.frame_header_len.min(packet.payload.len());
        let body = &packet.payload[header_len..];

        if body.len() < crate::video::FULL_PACKET_THRESHOLD {
            self.process_payload_slow(body);
        } else {
            self.process_payload_fast(body);
        }

        if packet.flags & FLAG_EOF != 0 {
            let frame_number = packet.frame_index;
            self.decoding_frame = false;

            if self.waiting_for_next_successful_frame {
                events.push(DepacketizerEvent::FrameLossRange {
                    start: self.start_frame_number,
                    end: frame_number.saturating_sub(1),
                });
                self.waiting_for_next_successful_frame = false;
            }

            let is_idr = self
                .nal_chain
                .first()
                .map(|e| e.kind != NalKind::PicData)
                .unwrap_or(false);

            if self.waiting_for_idr_frame && !is_idr {
                self.clear_nal_state();
            } else {
                if is_idr {
                    self.waiting_for_idr_frame = false;
                }
                self.consecutive_frame_drops = 0;
                self.start_frame_number = frame_number + 1;
                self.next_frame_number = frame_number + 1;
                let receive_time = self.first_packet_receive_time_ms.unwrap_or(receive_time_ms);
                self.reassemble_frame(frame_number, receive_time, &mut events);
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sof_packet(frame: u32, spi: u32, payload: Vec<u8>) -> VideoPacket {
        VideoPacket {
            frame_index: frame,
            stream_packet_index: spi,
            flags: FLAG_SOF,
            payload,
        }
    }

    /// A frame that fits in a single packet carries both SOF and EOF (and usually the PIC
    /// bit) set together, not EOF alone.
    fn single_packet_frame(frame: u32, spi: u32, payload: Vec<u8>) -> VideoPacket {
        VideoPacket {
            frame_index: frame,
            stream_packet_index: spi,
            flags: FLAG_SOF | FLAG_EOF | FLAG_CONTAINS_PIC_DATA,
            payload,
        }
    }

    #[test]
    fn fast_path_reassembles_single_packet_idr_frame() {
        let mut dep = VideoDepacketizer::new(0, true);
        let mut payload = vec![0u8; crate::video::FULL_PACKET_THRESHOLD + 4];
        payload[0] = 0x67;

        let events = dep.add_packet(single_packet_frame(1, 0, payload), 10);
        assert!(events.is_empty());
        let du = dep.poll_decode_unit().expect("frame ready");
        assert!(du.is_idr);
        assert_eq!(du.frame_number, 1);
    }

    #[test]
    fn non_idr_frame_dropped_while_waiting_for_idr() {
        let mut dep = VideoDepacketizer::new(0, true);
        let mut payload = vec![0u8; crate::video::FULL_PACKET_THRESHOLD + 4];
        payload[0] = 0x01; // not an SPS/VPS marker byte, treated as pic data

        dep.add_packet(single_packet_frame(1, 0, payload), 10);
        assert!(dep.poll_decode_unit().is_none());
    }

    #[test]
    fn frame_gap_emits_loss_range_and_drops_state() {
        let mut dep = VideoDepacketizer::new(0, true);
        dep.waiting_for_idr_frame = false;

        let events = dep.add_packet(sof_packet(5, 0, vec![0u8; 4]), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, DepacketizerEvent::FrameLossRange { start: 1, end: 4 })));
    }

    #[test]
    fn slow_path_splits_sps_from_pic_data() {
        let mut dep = VideoDepacketizer::new(0, true);
        // Annex-B SPS (00 00 00 01 67 ..) followed by frame-start + pic data.
        let mut payload = vec![0, 0, 0, 1, 0x67, 0xAA, 0xBB];
        payload.extend_from_slice(&[0, 0, 0, 1, 0x41, 0xCC]);

        dep.add_packet(single_packet_frame(1, 0, payload), 5);
        let du = dep.poll_decode_unit().expect("frame ready");
        assert!(du.entries.iter().any(|e| e.kind == NalKind::Sps));
        assert!(du.is_idr);
    }
}
