//! Control stream state machine, grounded in `ControlStream.c`.
//!
//! Transport-agnostic: TCP (pre-Gen-5 hosts, port 47995) and ENet (Gen-5+,
//! port 47999) both implement [`ControlTransport`]; this module only knows
//! about packet types, payload shapes and the three worker loops' logic.

use std::time::Duration;

use crate::bytebuffer::{ByteOrder, ByteWriter};
use crate::queue::BoundedQueue;

pub const LOSS_REPORT_INTERVAL_MS: u64 = 50;
const INVALIDATION_QUEUE_CAPACITY: usize = 20;
const DISCONNECT_INTERCEPT_DELAY_MS: u64 = 100;

/// SERVER_TERMINATED_INTENDED: the host's way of saying "this wasn't an error".
const TERMINATION_REASON_GRACEFUL: u16 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    StartA,
    StartB,
    InvalidateRefFrames,
    LossStats,
    FrameStats,
    Input,
    Rumble,
    Termination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen3,
    Gen4,
    Gen5,
    Gen7,
}

impl Generation {
    pub fn from_major_version(major: u32) -> Self {
        match major {
            3 => Generation::Gen3,
            4 => Generation::Gen4,
            5 => Generation::Gen5,
            _ => Generation::Gen7,
        }
    }

    pub fn uses_enet(self) -> bool {
        !matches!(self, Generation::Gen3 | Generation::Gen4)
    }

    /// Input-pipeline cipher selection (see `input.rs`): Gen >= 7 hosts use AES-GCM with a
    /// manually chained IV, everything before that uses a persistent AES-CBC context whose
    /// IV chains implicitly through the OpenSSL-equivalent cipher state.
    pub fn uses_gcm_input_encryption(self) -> bool {
        matches!(self, Generation::Gen7)
    }

    /// Leading byte count the video depacketizer strips before NAL scanning: Gen 3 hosts
    /// send bare Annex-B, Gen 4 prefixes an 8-byte sync wrapper, Gen 5+ adds a frame-type
    /// byte and padding on top of that for 12 bytes total.
    pub fn frame_header_len(self) -> usize {
        match self {
            Generation::Gen3 => 0,
            Generation::Gen4 => 8,
            Generation::Gen5 | Generation::Gen7 => 12,
        }
    }
}

/// Maps a logical packet kind to this generation's wire type code, or `None` if unsupported.
pub fn packet_type(gen: Generation, kind: PacketKind) -> Option<u16> {
    use Generation::*;
    use PacketKind::*;
    match (gen, kind) {
        (Gen3, StartA) => None,
        (Gen3, StartB) => Some(0x1410),
        (Gen3, InvalidateRefFrames) => Some(0x1404),
        (Gen3, LossStats) => Some(0x140c),
        (Gen3, FrameStats) => Some(0x1417),
        (Gen3, Input) => None,
        (Gen3, Rumble) => None,
        (Gen3, Termination) => None,

        (Gen4, StartA) => None,
        (Gen4, StartB) => Some(0x0609),
        (Gen4, InvalidateRefFrames) => Some(0x0604),
        (Gen4, LossStats) => Some(0x060a),
        (Gen4, FrameStats) => Some(0x0611),
        (Gen4, Input) => None,
        (Gen4, Rumble) => None,
        (Gen4, Termination) => None,

        (Gen5, StartA) => Some(0x0305),
        (Gen5, StartB) => Some(0x0307),
        (Gen5, InvalidateRefFrames) => Some(0x0301),
        (Gen5, LossStats) => Some(0x0201),
        (Gen5, FrameStats) => Some(0x0204),
        (Gen5, Input) => Some(0x0207),
        (Gen5, Rumble) => None,
        (Gen5, Termination) => None,

        (Gen7, StartA) => Some(0x0305),
        (Gen7, StartB) => Some(0x0307),
        (Gen7, InvalidateRefFrames) => Some(0x0301),
        (Gen7, LossStats) => Some(0x0201),
        (Gen7, FrameStats) => Some(0x0204),
        (Gen7, Input) => Some(0x0206),
        (Gen7, Rumble) => Some(0x010b),
        (Gen7, Termination) => Some(0x0100),
    }
}

/// The "IDR frame request" index aliases `InvalidateRefFrames`'s slot pre-Gen-5 (same wire
/// type as the Gen3/Gen4 table's `IDX_REQUEST_IDR_FRAME == IDX_START_A == 0` entry).
fn request_idr_frame_packet_type(gen: Generation) -> Option<u16> {
    match gen {
        Generation::Gen3 => Some(0x1407),
        Generation::Gen4 => Some(0x0606),
        Generation::Gen5 | Generation::Gen7 => packet_type(gen, PacketKind::InvalidateRefFrames),
    }
}

fn request_idr_frame_payload(gen: Generation, last_seen_frame: i64) -> Vec<u8> {
    if matches!(gen, Generation::Gen5 | Generation::Gen7) {
        build_frame_range_payload(request_idr_window(last_seen_frame), last_seen_frame)
    } else {
        vec![0, 0]
    }
}

fn request_idr_window(last_seen_frame: i64) -> i64 {
    if last_seen_frame < 0x20 {
        0
    } else {
        last_seen_frame - 0x20
    }
}

fn build_frame_range_payload(start_frame: i64, end_frame: i64) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(24, ByteOrder::Little);
    w.put_u64(start_frame as u64);
    w.put_u64(end_frame as u64);
    w.put_u64(0);
    w.into_vec()
}

fn start_a_payload(gen: Generation) -> Vec<u8> {
    match gen {
        Generation::Gen3 | Generation::Gen4 => Vec::new(),
        Generation::Gen5 | Generation::Gen7 => vec![0, 0],
    }
}

fn start_b_payload(gen: Generation) -> Vec<u8> {
    match gen {
        Generation::Gen3 => {
            let mut w = ByteWriter::with_capacity(16, ByteOrder::Little);
            w.put_u32(0);
            w.put_u32(0);
            w.put_u32(0);
            w.put_u32(0xa);
            w.into_vec()
        }
        Generation::Gen4 | Generation::Gen5 | Generation::Gen7 => vec![0],
    }
}

fn loss_stats_payload(loss_count: u32, last_good_frame: u64) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(32, ByteOrder::Little);
    w.put_u32(loss_count);
    w.put_u32(LOSS_REPORT_INTERVAL_MS as u32);
    w.put_u32(1000);
    w.put_u64(last_good_frame);
    w.put_u32(0);
    w.put_u32(0);
    w.put_u32(0x14);
    w.into_vec()
}

#[derive(Debug, Clone, Copy)]
pub enum InboundControlEvent {
    Rumble { controller_number: u16, low_freq: u16, high_freq: u16 },
    Termination { reason: u16 },
    Disconnect,
}

const RUMBLE_PACKET_TYPE: u16 = 0x010b;
const TERMINATION_PACKET_TYPE: u16 = 0x0100;

impl InboundControlEvent {
    /// Parses a control-receive-loop packet (type already stripped off `payload`) into
    /// the event it represents, or `None` for types the client doesn't act on.
    pub fn from_wire(packet_type: u16, payload: &[u8]) -> Option<Self> {
        match packet_type {
            RUMBLE_PACKET_TYPE if payload.len() >= 10 => Some(InboundControlEvent::Rumble {
                controller_number: u16::from_le_bytes([payload[4], payload[5]]),
                low_freq: u16::from_le_bytes([payload[6], payload[7]]),
                high_freq: u16::from_le_bytes([payload[8], payload[9]]),
            }),
            TERMINATION_PACKET_TYPE if payload.len() >= 2 => Some(InboundControlEvent::Termination {
                reason: u16::from_le_bytes([payload[0], payload[1]]),
            }),
            _ => None,
        }
    }
}

/// Transport primitive the control stream drives; TCP and ENet implementations frame
/// messages differently (4-byte header vs 2-byte type) but present this same contract.
pub trait ControlTransport: Send {
    fn send_and_forget(&mut self, packet_type: u16, payload: &[u8]) -> std::io::Result<()>;
    fn send_and_discard_reply(&mut self, packet_type: u16, payload: &[u8]) -> std::io::Result<()>;
    /// Non-blocking poll, used only by the ENet control-receive loop.
    fn poll_inbound(&mut self, timeout: Duration) -> std::io::Result<Option<InboundControlEvent>>;
    fn is_enet(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameInvalidationTuple {
    Range(i64, i64),
}

pub enum InvalidationAction {
    RequestIdr { packet_type: u16, payload: Vec<u8> },
    InvalidateRanges { packet_type: u16, payload: Vec<u8> },
    Nothing,
}

/// Host-facing control stream: loss stats, reference-frame invalidation, and (ENet only)
/// dispatch of inbound rumble/termination notifications.
pub struct ControlStream {
    generation: Generation,
    reference_frame_invalidation_enabled: bool,

    loss_count_since_last_report: u32,
    last_good_frame: u64,
    last_seen_frame: i64,

    idr_frame_required: bool,
    invalidation_queue: BoundedQueue<FrameInvalidationTuple>,

    disconnect_pending: bool,
    termination_error_code: i32,
}

impl ControlStream {
    pub fn new(generation: Generation, reference_frame_invalidation_enabled: bool) -> Self {
        Self {
            generation,
            reference_frame_invalidation_enabled,
            loss_count_since_last_report: 0,
            last_good_frame: 0,
            last_seen_frame: 0,
            idr_frame_required: false,
            invalidation_queue: BoundedQueue::new(INVALIDATION_QUEUE_CAPACITY),
            disconnect_pending: false,
            termination_error_code: -1,
        }
    }

    pub fn start_a(&self) -> (u16, Vec<u8>) {
        // Pre-Gen-5 hosts use the IDR-request slot's type code for Start A too (TCP expects
        // a reply there; ENet's Start A is fire-and-forget).
        let ty = packet_type(self.generation, PacketKind::StartA)
            .or_else(|| request_idr_frame_packet_type(self.generation))
            .expect("every generation has a usable start-a type code");
        (ty, start_a_payload(self.generation))
    }

    pub fn start_b(&self) -> (u16, Vec<u8>) {
        let ty = packet_type(self.generation, PacketKind::StartB).expect("start-b always present");
        (ty, start_b_payload(self.generation))
    }

    pub fn build_loss_stats_message(&mut self) -> Option<(u16, Vec<u8>)> {
        let ty = packet_type(self.generation, PacketKind::LossStats)?;
        let payload = loss_stats_payload(self.loss_count_since_last_report, self.last_good_frame);
        self.loss_count_since_last_report = 0;
        Some((ty, payload))
    }

    pub fn record_network_loss(&mut self, count: u32) {
        self.loss_count_since_last_report += count;
    }

    pub fn on_received_complete_frame(&mut self, frame_index: u64) {
        self.last_good_frame = frame_index;
    }

    pub fn on_saw_frame(&mut self, frame_index: i64) {
        self.last_seen_frame = frame_index;
    }

    /// Equivalent of `connectionDetectedFrameLoss`: queues a range for invalidation, or
    /// forces a full IDR request if reference-frame invalidation is disabled or the queue
    /// is saturated.
    pub fn detected_frame_loss(&mut self, start_frame: i64, end_frame: i64) {
        if !self.reference_frame_invalidation_enabled {
            self.idr_frame_required = true;
            return;
        }
        if self
            .invalidation_queue
            .offer(FrameInvalidationTuple::Range(start_frame, end_frame))
            .is_err()
        {
            self.idr_frame_required = true;
        }
    }

    pub fn request_idr_on_demand(&mut self) {
        self.idr_frame_required = true;
    }

    /// The invalidate-ref-frames worker's per-wakeup decision: drain for an IDR request if
    /// one is pending, otherwise coalesce every queued range into a single payload.
    pub fn build_invalidation_action(&mut self) -> InvalidationAction {
        if self.idr_frame_required {
            self.idr_frame_required = false;
            self.invalidation_queue.flush();
            let Some(ty) = request_idr_frame_packet_type(self.generation) else {
                return InvalidationAction::Nothing;
            };
            return InvalidationAction::RequestIdr {
                packet_type: ty,
                payload: request_idr_frame_payload(self.generation, self.last_seen_frame),
            };
        }

        let tuples = self.invalidation_queue.flush();
        if tuples.is_empty() {
            return InvalidationAction::Nothing;
        }
        let (start, end) = tuples.iter().fold((i64::MAX, i64::MIN), |(s, e), t| {
            let FrameInvalidationTuple::Range(a, b) = t;
            (s.min(*a), e.max(*b))
        });
        let Some(ty) = packet_type(self.generation, PacketKind::InvalidateRefFrames) else {
            return InvalidationAction::Nothing;
        };
        InvalidationAction::InvalidateRanges {
            packet_type: ty,
            payload: build_frame_range_payload(start, end),
        }
    }

    /// One iteration of the ENet control-receive loop, given the next inbound event (or
    /// `None` after a non-blocking poll finds nothing).
    pub fn handle_inbound(&mut self, event: Option<InboundControlEvent>) -> Option<ControlStreamEvent> {
        match event {
            None => {
                if self.disconnect_pending {
                    None
                } else {
                    None
                }
            }
            Some(InboundControlEvent::Rumble {
                controller_number,
                low_freq,
                high_freq,
            }) => Some(ControlStreamEvent::Rumble {
                controller_number,
                low_freq,
                high_freq,
            }),
            Some(InboundControlEvent::Termination { reason }) => {
                self.termination_error_code = if reason == TERMINATION_REASON_GRACEFUL {
                    0
                } else {
                    reason as i32
                };
                self.disconnect_pending = true;
                None
            }
            Some(InboundControlEvent::Disconnect) => {
                Some(ControlStreamEvent::Terminated(self.termination_error_code))
            }
        }
    }

    pub fn disconnect_intercept_delay() -> Duration {
        Duration::from_millis(DISCONNECT_INTERCEPT_DELAY_MS)
    }
}

/// What the control-receive loop hands up to the session orchestrator.
#[derive(Debug, Clone, Copy)]
pub enum ControlStreamEvent {
    Rumble { controller_number: u16, low_freq: u16, high_freq: u16 },
    Terminated(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen7_packet_types_match_table() {
        assert_eq!(packet_type(Generation::Gen7, PacketKind::Rumble), Some(0x010b));
        assert_eq!(packet_type(Generation::Gen7, PacketKind::Termination), Some(0x0100));
        assert_eq!(packet_type(Generation::Gen3, PacketKind::Rumble), None);
    }

    #[test]
    fn loss_stats_payload_resets_counter() {
        let mut cs = ControlStream::new(Generation::Gen7, true);
        cs.record_network_loss(5);
        let (ty, payload) = cs.build_loss_stats_message().unwrap();
        assert_eq!(ty, 0x0201);
        assert_eq!(payload.len(), 32);
        assert_eq!(cs.loss_count_since_last_report, 0);
    }

    #[test]
    fn idr_required_takes_priority_over_queued_ranges() {
        let mut cs = ControlStream::new(Generation::Gen7, true);
        cs.detected_frame_loss(1, 5);
        cs.request_idr_on_demand();
        match cs.build_invalidation_action() {
            InvalidationAction::RequestIdr { packet_type, .. } => assert_eq!(packet_type, 0x0301),
            _ => panic!("expected RequestIdr"),
        }
        // Queue was drained as part of taking the IDR path.
        assert!(matches!(cs.build_invalidation_action(), InvalidationAction::Nothing));
    }

    #[test]
    fn queued_ranges_coalesce_into_one_payload() {
        let mut cs = ControlStream::new(Generation::Gen7, true);
        cs.detected_frame_loss(10, 12);
        cs.detected_frame_loss(1, 3);
        match cs.build_invalidation_action() {
            InvalidationAction::InvalidateRanges { payload, .. } => {
                assert_eq!(payload.len(), 24);
                let mut reader = crate::bytebuffer::ByteReader::new(&payload, ByteOrder::Little);
                assert_eq!(reader.get_u64().unwrap(), 1);
                assert_eq!(reader.get_u64().unwrap(), 12);
            }
            _ => panic!("expected InvalidateRanges"),
        }
    }

    #[test]
    fn disabled_rfi_forces_idr_instead_of_queueing() {
        let mut cs = ControlStream::new(Generation::Gen7, false);
        cs.detected_frame_loss(1, 2);
        match cs.build_invalidation_action() {
            InvalidationAction::RequestIdr { .. } => {}
            _ => panic!("expected RequestIdr when reference frame invalidation is disabled"),
        }
    }

    #[test]
    fn termination_reason_graceful_maps_to_zero() {
        let mut cs = ControlStream::new(Generation::Gen7, true);
        assert!(cs
            .handle_inbound(Some(InboundControlEvent::Termination {
                reason: TERMINATION_REASON_GRACEFUL,
            }))
            .is_none());
        match cs.handle_inbound(Some(InboundControlEvent::Disconnect)) {
            Some(ControlStreamEvent::Terminated(code)) => assert_eq!(code, 0),
            _ => panic!("expected Terminated(0)"),
        }
    }

    #[test]
    fn termination_reason_passes_through_unmodified() {
        let mut cs = ControlStream::new(Generation::Gen7, true);
        cs.handle_inbound(Some(InboundControlEvent::Termination { reason: 0x42 }));
        match cs.handle_inbound(Some(InboundControlEvent::Disconnect)) {
            Some(ControlStreamEvent::Terminated(code)) => assert_eq!(code, 0x42),
            _ => panic!("expected Terminated(0x42)"),
        }
    }
}
