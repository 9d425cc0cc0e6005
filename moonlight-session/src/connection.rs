//! Connection lifecycle types: the stage enum reported through the
//! orchestrator's progress callbacks and the listener trait a caller
//! implements to receive them, grounded in the teacher's
//! `connection::ConnectionListener` (same callback set and `Stage` shape,
//! with the FFI trampoline/global-singleton plumbing removed since this is a
//! native library with no C ABI boundary to bridge).

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Stage {
    None,
    PlatformInit,
    NameResolution,
    RtspHandshake,
    ControlStreamInit,
    VideoStreamInit,
    AudioStreamInit,
    InputStreamInit,
    ControlStreamStart,
    VideoStreamStart,
    AudioStreamStart,
    InputStreamStart,
}

impl Stage {
    /// Stages in the exact order `Session::start` runs them and `Session::stop` unwinds them.
    pub const SEQUENCE: [Stage; 11] = [
        Stage::PlatformInit,
        Stage::NameResolution,
        Stage::RtspHandshake,
        Stage::ControlStreamInit,
        Stage::VideoStreamInit,
        Stage::AudioStreamInit,
        Stage::InputStreamInit,
        Stage::ControlStreamStart,
        Stage::VideoStreamStart,
        Stage::AudioStreamStart,
        Stage::InputStreamStart,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::None => "none",
            Stage::PlatformInit => "platform initialization",
            Stage::NameResolution => "hostname resolution",
            Stage::RtspHandshake => "RTSP handshake",
            Stage::ControlStreamInit => "control stream initialization",
            Stage::VideoStreamInit => "video stream initialization",
            Stage::AudioStreamInit => "audio stream initialization",
            Stage::InputStreamInit => "input stream initialization",
            Stage::ControlStreamStart => "control stream startup",
            Stage::VideoStreamStart => "video stream startup",
            Stage::AudioStreamStart => "audio stream startup",
            Stage::InputStreamStart => "input stream startup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    Poor,
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct DualSenseEffect: u32 {
        const PAYLOAD_SIZE = 1 << 0;
        const RIGHT_TRIGGER = 1 << 1;
        const LEFT_TRIGGER = 1 << 2;
    }
}

/// Callback surface a caller implements to observe connection progress and
/// host-initiated events. Mirrors the teacher's `ConnectionListener` trait.
pub trait ConnectionListener {
    /// Invoked to indicate that a stage of initialization is about to begin.
    fn stage_starting(&mut self, stage: Stage);
    /// Invoked to indicate that a stage of initialization has completed.
    fn stage_complete(&mut self, stage: Stage);

    /// Invoked to indicate that a stage of initialization has failed.
    /// `connection_terminated` will not be invoked because the connection
    /// was never fully established.
    fn stage_failed(&mut self, stage: Stage, error_code: i32);

    /// Invoked after the connection is successfully established.
    fn connection_started(&mut self);

    /// Invoked when a connection is terminated after establishment. `error_code`
    /// is 0 if the host reported an intentional termination; non-zero means
    /// unexpected loss. Never invoked as a result of a caller-initiated stop.
    fn connection_terminated(&mut self, error_code: i32);

    /// Invoked to notify the caller of a connection quality change.
    fn connection_status_update(&mut self, status: ConnectionStatus);

    /// Invoked to notify the caller of a change in HDR mode on the host.
    fn set_hdr_mode(&mut self, hdr_enabled: bool);

    /// Invoked to rumble a gamepad. The effect is expected to persist until a
    /// future call changes it or sets both motors to 0. May be invoked for
    /// controller numbers that aren't physically present.
    fn controller_rumble(
        &mut self,
        controller_number: u16,
        low_frequency_motor: u16,
        high_frequency_motor: u16,
    );

    /// Invoked to rumble a gamepad's triggers.
    fn controller_rumble_triggers(
        &mut self,
        controller_number: u16,
        left_trigger_motor: u16,
        right_trigger_motor: u16,
    );

    /// Invoked to request motion sensor reports for a gamepad at the given
    /// rate, or to stop them when `report_rate_hz` is 0.
    fn controller_set_motion_event_state(
        &mut self,
        controller_number: u16,
        motion_type: u8,
        report_rate_hz: u16,
    );

    /// Invoked on a change in DualSense adaptive trigger configuration.
    fn controller_set_adaptive_triggers(
        &mut self,
        controller_number: u16,
        event_flags: u8,
        type_left: u8,
        type_right: u8,
    );

    /// Invoked to set a controller's RGB LED, if present.
    fn controller_set_led(&mut self, controller_number: u16, r: u8, g: u8, b: u8);
}
