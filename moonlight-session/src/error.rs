use std::io;

use thiserror::Error;

/// Reserved termination reasons surfaced through [`crate::connection::ConnectionListener::connection_terminated`].
///
/// Mirrors the constants a host-facing client is expected to recognise; anything outside this
/// set is a raw HTTP-like status code from the RTSP handshake or a platform errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TerminationReason {
    GracefulTermination = 0,
    NoVideoTraffic = -100,
    NoVideoFrame = -101,
    UnexpectedEarlyTermination = -102,
    ProtectedContent = -103,
    FrameConversion = -104,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("couldn't resolve host address")]
    NameResolution(#[source] io::Error),

    #[error("rtsp request failed with status {0}")]
    RtspStatus(u16),

    #[error("rtsp response was malformed: {0}")]
    RtspMalformed(String),

    #[error("the host doesn't support this codec or feature")]
    NotSupportedOnHost,

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("the enet connection was rejected or reset")]
    EnetFailed,

    #[error("a stage failed to start (stage {stage:?}, code {code})")]
    StageFailed { stage: crate::connection::Stage, code: i32 },

    #[error("connection already exists for this session")]
    ConnectionAlreadyExists,

    #[error("session is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, SessionError>;
