//! Session configuration: the set of knobs a caller must supply before
//! `Session::start`, plus validation. Mirrors the shape of the teacher's
//! `data::StreamConfiguration`, with validation the teacher delegated to the
//! C library folded into `Config::validate`.

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Rec601,
    Rec709,
    Rec2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    Limited,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionFlags {
    pub audio: bool,
    pub video: bool,
}

impl EncryptionFlags {
    pub const fn all() -> Self {
        Self { audio: true, video: true }
    }
    pub const fn none() -> Self {
        Self { audio: false, video: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupportedVideoFormats {
    pub h264: bool,
    pub h264_high8_444: bool,
    pub h265: bool,
    pub h265_main10: bool,
    pub h265_rext8_444: bool,
    pub h265_rext10_444: bool,
    pub av1_main8: bool,
    pub av1_main10: bool,
    pub av1_high8_444: bool,
    pub av1_high10_444: bool,
}

impl SupportedVideoFormats {
    pub fn all() -> Self {
        Self {
            h264: true,
            h264_high8_444: true,
            h265: true,
            h265_main10: true,
            h265_rext8_444: true,
            h265_rext10_444: true,
            av1_main8: true,
            av1_main10: true,
            av1_high8_444: true,
            av1_high10_444: true,
        }
    }

    pub fn any(&self) -> bool {
        self.h264
            || self.h264_high8_444
            || self.h265
            || self.h265_main10
            || self.h265_rext8_444
            || self.h265_rext10_444
            || self.av1_main8
            || self.av1_main10
            || self.av1_high8_444
            || self.av1_high10_444
    }
}

/// Everything the orchestrator needs to bring up a stream against a given
/// host, once the host's app version and capabilities are known.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host_address: String,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub packet_size: u32,
    pub streaming_mode: StreamingMode,
    pub video_formats: SupportedVideoFormats,
    pub audio_channel_count: u8,
    pub audio_channel_mask: u16,
    pub client_refresh_rate_x100: u32,
    pub colorspace: Colorspace,
    pub color_range: ColorRange,
    pub encryption: EncryptionFlags,
    pub remote_input_aes_key: [u8; 16],
    pub remote_input_aes_iv: [u8; 16],
    pub reference_frame_invalidation_supported: bool,
}

impl StreamConfig {
    /// Rejects configurations the engine cannot stream, mirroring the checks
    /// the teacher leaves to `LiStartConnection`'s internal validation.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.width == 0 || self.height == 0 {
            return Err(SessionError::InvalidConfig("width/height must be non-zero".into()));
        }
        if self.fps == 0 {
            return Err(SessionError::InvalidConfig("fps must be non-zero".into()));
        }
        if self.bitrate_kbps == 0 {
            return Err(SessionError::InvalidConfig("bitrate must be non-zero".into()));
        }
        if self.packet_size == 0 || self.packet_size % 16 != 0 {
            return Err(SessionError::InvalidConfig(
                "packet size must be a non-zero multiple of 16".into(),
            ));
        }
        if !self.video_formats.any() {
            return Err(SessionError::InvalidConfig(
                "at least one supported video format is required".into(),
            ));
        }
        if self.audio_channel_count == 0 {
            return Err(SessionError::InvalidConfig(
                "audio channel count must be non-zero".into(),
            ));
        }
        if self.host_address.trim().is_empty() {
            return Err(SessionError::InvalidConfig("host address must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StreamConfig {
        StreamConfig {
            host_address: "10.0.0.5".to_string(),
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 20_000,
            packet_size: 1024,
            streaming_mode: StreamingMode::Local,
            video_formats: SupportedVideoFormats::all(),
            audio_channel_count: 2,
            audio_channel_mask: 0x3,
            client_refresh_rate_x100: 6000,
            colorspace: Colorspace::Rec709,
            color_range: ColorRange::Limited,
            encryption: EncryptionFlags::none(),
            remote_input_aes_key: [0u8; 16],
            remote_input_aes_iv: [0u8; 16],
            reference_frame_invalidation_supported: true,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn zero_dimensions_rejected() {
        let mut cfg = base();
        cfg.width = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn packet_size_must_be_multiple_of_16() {
        let mut cfg = base();
        cfg.packet_size = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn no_supported_video_format_rejected() {
        let mut cfg = base();
        cfg.video_formats = SupportedVideoFormats::default();
        assert!(cfg.validate().is_err());
    }
}
