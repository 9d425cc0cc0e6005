//! Ambient logging setup. The teacher wires `log`/`simplelog` into its
//! application binaries; this crate is a from-scratch native reimplementation
//! with no `printf-compat`/C-callback bridge to maintain, so it follows
//! `tracing`/`tracing-subscriber` instead (the idiom used throughout the
//! pack's other pure-Rust protocol implementation for this same per-session,
//! per-stream-thread shape of logging).

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber suitable for the CLI harness and
/// for tests that want readable output. Safe to call more than once; only
/// the first call takes effect.
pub fn init_default() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Span names used by the long-running threads in the concurrency model, kept
/// here so call sites spell them consistently.
pub mod spans {
    pub const RTP_VIDEO_RECEIVE: &str = "rtp-video-receive";
    pub const RTP_AUDIO_RECEIVE: &str = "rtp-audio-receive";
    pub const CONTROL_RECEIVE: &str = "control-receive";
    pub const LOSS_STATS: &str = "loss-stats";
    pub const INPUT_SEND: &str = "input-send";
}
