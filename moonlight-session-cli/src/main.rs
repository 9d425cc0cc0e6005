//! Manual smoke-test harness: connects to a host, logs every lifecycle callback and
//! decode/renderer call, and sends one mouse nudge once the connection comes up.

use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use moonlight_session::audio::{AudioRenderer, OpusMultistreamConfig, RendererCapabilities};
use moonlight_session::config::{
    ColorRange, Colorspace, EncryptionFlags, StreamConfig, StreamingMode, SupportedVideoFormats,
};
use moonlight_session::connection::{ConnectionListener, ConnectionStatus, Stage};
use moonlight_session::session::HostAppVersion;
use moonlight_session::video::{DecodeUnit, DecoderCapabilities, SubmitResult, VideoDecoder, VideoFormat};
use moonlight_session::{Session, SessionError};

#[derive(Parser)]
struct Args {
    /// Host to stream from.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 1920)]
    width: u16,

    #[arg(long, default_value_t = 1080)]
    height: u16,

    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Host major app version, used to pick the control/input generation.
    #[arg(long, default_value_t = 7)]
    host_major: u32,
}

struct LoggingListener;

impl ConnectionListener for LoggingListener {
    fn stage_starting(&mut self, stage: Stage) {
        info!(stage = stage.name(), "stage starting");
    }
    fn stage_complete(&mut self, stage: Stage) {
        info!(stage = stage.name(), "stage complete");
    }
    fn stage_failed(&mut self, stage: Stage, error_code: i32) {
        info!(stage = stage.name(), error_code, "stage failed");
    }
    fn connection_started(&mut self) {
        info!("connection started");
    }
    fn connection_terminated(&mut self, error_code: i32) {
        info!(error_code, "connection terminated");
    }
    fn connection_status_update(&mut self, status: ConnectionStatus) {
        info!(?status, "connection status update");
    }
    fn set_hdr_mode(&mut self, hdr_enabled: bool) {
        info!(hdr_enabled, "hdr mode changed");
    }
    fn controller_rumble(&mut self, controller_number: u16, low: u16, high: u16) {
        info!(controller_number, low, high, "rumble");
    }
    fn controller_rumble_triggers(&mut self, controller_number: u16, left: u16, right: u16) {
        info!(controller_number, left, right, "trigger rumble");
    }
    fn controller_set_motion_event_state(&mut self, controller_number: u16, motion_type: u8, rate_hz: u16) {
        info!(controller_number, motion_type, rate_hz, "motion state");
    }
    fn controller_set_adaptive_triggers(&mut self, controller_number: u16, flags: u8, left: u8, right: u8) {
        info!(controller_number, flags, left, right, "adaptive triggers");
    }
    fn controller_set_led(&mut self, controller_number: u16, r: u8, g: u8, b: u8) {
        info!(controller_number, r, g, b, "led");
    }
}

struct LoggingDecoder;

impl VideoDecoder for LoggingDecoder {
    fn capabilities(&self) -> DecoderCapabilities {
        DecoderCapabilities::DIRECT_SUBMIT
    }
    fn setup(&mut self, format: VideoFormat) {
        info!(?format, "video decoder setup");
    }
    fn start(&mut self) {
        info!("video decoder start");
    }
    fn stop(&mut self) {
        info!("video decoder stop");
    }
    fn cleanup(&mut self) {
        info!("video decoder cleanup");
    }
    fn submit_decode_unit(&mut self, unit: &DecodeUnit) -> SubmitResult {
        info!(frame_number = unit.frame_number, is_idr = unit.is_idr, nal_count = unit.entries.len(), "decode unit");
        SubmitResult::Ok
    }
}

struct LoggingRenderer;

impl AudioRenderer for LoggingRenderer {
    fn capabilities(&self) -> RendererCapabilities {
        RendererCapabilities::DIRECT_SUBMIT
    }
    fn init(&mut self, config: OpusMultistreamConfig) {
        info!(?config, "audio renderer init");
    }
    fn start(&mut self) {
        info!("audio renderer start");
    }
    fn stop(&mut self) {
        info!("audio renderer stop");
    }
    fn cleanup(&mut self) {
        info!("audio renderer cleanup");
    }
    fn decode_and_play_sample(&mut self, data: Option<&[u8]>) {
        info!(bytes = data.map(<[u8]>::len), "audio sample");
    }
}

fn main() {
    moonlight_session::log::init_default();
    let args = Args::parse();

    let config = StreamConfig {
        host_address: args.host.clone(),
        width: args.width,
        height: args.height,
        fps: args.fps,
        bitrate_kbps: 20_000,
        packet_size: 1024,
        streaming_mode: StreamingMode::Remote,
        video_formats: SupportedVideoFormats::all(),
        audio_channel_count: 2,
        audio_channel_mask: 0x3,
        client_refresh_rate_x100: args.fps * 100,
        colorspace: Colorspace::Rec709,
        color_range: ColorRange::Limited,
        encryption: EncryptionFlags::all(),
        remote_input_aes_key: [0u8; 16],
        remote_input_aes_iv: [0u8; 16],
        reference_frame_invalidation_supported: true,
    };

    let app_version = HostAppVersion { major: args.host_major, minor: 1, patch: 0 };

    let mut session = match Session::new(
        config,
        app_version,
        Box::new(LoggingListener),
        Box::new(LoggingDecoder),
        Box::new(LoggingRenderer),
    ) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = session.start() {
        eprintln!("failed to start session: {e}");
        std::process::exit(1);
    }

    // Nudge the mouse once to exercise the input-send pipeline, then idle so the
    // background threads keep running until the user kills the process.
    let _: Result<(), SessionError> = session.send_mouse_move(5, 0);

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
