use std::{fmt::Display, num::ParseIntError, str::FromStr};

use thiserror::Error;

pub mod audio;
pub mod audio_fec;
pub mod bytebuffer;
pub mod config;
pub mod connection;
pub mod control;
pub mod crypto;
pub mod error;
pub mod input;
pub mod log;
pub mod net;
pub mod platform;
pub mod queue;
pub mod reorder;
pub mod rs;
pub mod rtsp;
pub mod sdp;
pub mod seq;
pub mod session;
pub mod video;
pub mod video_fec;

pub use audio::AudioRenderer;
pub use config::StreamConfig;
pub use connection::{ConnectionListener, Stage};
pub use error::{SessionError, TerminationReason};
pub use session::{HostAppVersion, Session};
pub use video::VideoDecoder;

#[derive(Debug, Error)]
#[error("failed to parse server version")]
pub enum ParseServerVersionError {
    #[error("{0}")]
    ParseIntError(#[from] ParseIntError),
    #[error("invalid version pattern")]
    InvalidPattern,
}

/// The host's reported `GfeVersion`/`appVersion` quad, as returned by its `/serverinfo`
/// endpoint (pairing and that endpoint are out of this crate's scope; callers resolve this
/// out-of-band and feed it to [`session::HostAppVersion`]).
#[derive(Debug, Clone, Copy)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub mini_patch: u32,
}

impl Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.mini_patch)
    }
}

impl FromStr for ServerVersion {
    type Err = ParseServerVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.splitn(4, '.');
        let major = split.next().ok_or(ParseServerVersionError::InvalidPattern)?.parse()?;
        let minor = split.next().ok_or(ParseServerVersionError::InvalidPattern)?.parse()?;
        let patch = split.next().ok_or(ParseServerVersionError::InvalidPattern)?.parse()?;
        let mini_patch = split.next().ok_or(ParseServerVersionError::InvalidPattern)?.parse()?;
        Ok(Self { major, minor, patch, mini_patch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_version_round_trips_through_display_and_parse() {
        let v: ServerVersion = "7.1.431.0".parse().unwrap();
        assert_eq!(v.major, 7);
        assert_eq!(v.to_string(), "7.1.431.0");
    }
}
