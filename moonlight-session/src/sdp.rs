//! SDP payload builder for the video ANNOUNCE request, grounded in
//! `SdpGenerator.c`. Produces the same `a=name:value \r\n` attribute stream,
//! keyed off the negotiated generation and stream configuration rather than
//! a live global `StreamConfig`.

#[derive(Debug, Clone)]
pub struct SdpConfig {
    pub app_major: u32,
    pub client_address: String,
    pub is_ipv6: bool,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub packet_size: u32,
    pub video_port: u16,
    pub rtsp_port: u16,
    pub streaming_remote: bool,
    pub encrypt_video: bool,
    pub encrypt_audio: bool,
    pub is_hevc: bool,
    pub is_av1: bool,
    pub hdr_enabled: bool,
    pub audio_channel_count: u8,
    pub audio_channel_mask: u16,
    pub reference_frame_invalidation_supported: bool,
    pub client_refresh_rate_x100: u32,
    pub color_space: u8,
    pub color_range: u8,
    pub is_sunshine: bool,
}

struct Attr {
    name: String,
    value: String,
}

fn attr(name: impl Into<String>, value: impl ToString) -> Attr {
    Attr {
        name: name.into(),
        value: value.to_string(),
    }
}

fn gen3_options(cfg: &SdpConfig, out: &mut Vec<Attr>) {
    out.push(attr("x-nv-general.serverAddress", &cfg.client_address));
    out.push(attr("x-nv-general.featureFlags", 0x42774141u32));
    for i in 0..4 {
        out.push(attr(format!("x-nv-video[{i}].transferProtocol"), 0x41514141u32));
    }
    for i in 0..4 {
        out.push(attr(
            format!("x-nv-video[{i}].rateControlMode"),
            0x42414141u32 + i as u32,
        ));
    }
    out.push(attr("x-nv-vqos[0].bw.flags", "14083"));
    for i in 0..4 {
        out.push(attr(format!("x-nv-vqos[{i}].videoQosMaxConsecutiveDrops"), 0));
    }
}

fn gen4_options(cfg: &SdpConfig, out: &mut Vec<Attr>) {
    out.push(attr(
        "x-nv-general.serverAddress",
        format!("rtsp://{}:{}", cfg.client_address, cfg.rtsp_port),
    ));
}

fn gen5_options(cfg: &SdpConfig, out: &mut Vec<Attr>) {
    out.push(attr("x-nv-general.useReliableUdp", "1"));
    out.push(attr("x-nv-ri.useControlChannel", "1"));
    let repair_percent = if cfg.width >= 3840 && cfg.height >= 2160 { 5 } else { 20 };
    out.push(attr("x-nv-vqos[0].fec.repairPercent", repair_percent));
    if cfg.width < 720 || cfg.height < 540 {
        out.push(attr("x-nv-vqos[0].drc.enable", "1"));
        out.push(attr("x-nv-vqos[0].drc.tableType", "2"));
    } else {
        out.push(attr("x-nv-vqos[0].drc.enable", "0"));
    }
    out.push(attr("x-nv-general.enableRecoveryMode", "0"));
}

/// Builds every `a=` attribute in the same order `getAttributesList` does.
pub fn build_attributes(cfg: &SdpConfig) -> Vec<(String, String)> {
    let mut out = Vec::new();

    if cfg.is_sunshine {
        const ML_FF_FEC_STATUS: u32 = 0x1;
        const ML_FF_SESSION_ID_V1: u32 = 0x2;
        out.push(attr(
            "x-ml-general.featureFlags",
            ML_FF_FEC_STATUS | ML_FF_SESSION_ID_V1,
        ));
        let mut encryption_enabled = 0u32;
        if cfg.encrypt_video {
            encryption_enabled |= 0x1;
        }
        if cfg.encrypt_audio {
            encryption_enabled |= 0x2;
        }
        out.push(attr("x-ss-general.encryptionEnabled", encryption_enabled));
        out.push(attr("x-ss-video[0].chromaSamplingType", "0"));
    }

    out.push(attr("x-nv-video[0].clientViewportWd", cfg.width));
    out.push(attr("x-nv-video[0].clientViewportHt", cfg.height));
    out.push(attr("x-nv-video[0].maxFPS", cfg.fps));

    let packet_size = if cfg.encrypt_video {
        cfg.packet_size.saturating_sub(8)
    } else {
        cfg.packet_size
    };
    out.push(attr("x-nv-video[0].packetSize", packet_size));
    out.push(attr("x-nv-video[0].rateControlMode", "4"));
    out.push(attr("x-nv-video[0].timeoutLengthMs", "7000"));
    out.push(attr("x-nv-video[0].framesWithInvalidRefThreshold", "0"));

    let mut adjusted_bitrate = (cfg.bitrate_kbps as f64 * 0.80) as u32;
    if cfg.streaming_remote && adjusted_bitrate > 500 {
        adjusted_bitrate -= 500;
    }
    adjusted_bitrate = adjusted_bitrate.min(100_000);

    if cfg.app_major >= 5 {
        out.push(attr("x-nv-video[0].initialBitrateKbps", adjusted_bitrate));
        out.push(attr("x-nv-video[0].initialPeakBitrateKbps", adjusted_bitrate));
        out.push(attr("x-nv-vqos[0].bw.minimumBitrateKbps", adjusted_bitrate));
        out.push(attr("x-nv-vqos[0].bw.maximumBitrateKbps", adjusted_bitrate));
        if cfg.is_sunshine {
            out.push(attr("x-ml-video.configuredBitrateKbps", cfg.bitrate_kbps));
        }
    } else {
        if cfg.streaming_remote {
            out.push(attr("x-nv-video[0].averageBitrate", "4"));
            out.push(attr("x-nv-video[0].peakBitrate", "4"));
        }
        out.push(attr("x-nv-vqos[0].bw.minimumBitrate", adjusted_bitrate));
        out.push(attr("x-nv-vqos[0].bw.maximumBitrate", adjusted_bitrate));
    }

    out.push(attr("x-nv-vqos[0].fec.enable", "1"));
    out.push(attr("x-nv-vqos[0].videoQualityScoreUpdateTime", "5000"));

    if !cfg.streaming_remote {
        out.push(attr("x-nv-vqos[0].qosTrafficType", "5"));
        out.push(attr("x-nv-aqos.qosTrafficType", "4"));
    } else {
        out.push(attr("x-nv-vqos[0].qosTrafficType", "0"));
        out.push(attr("x-nv-aqos.qosTrafficType", "0"));
    }

    match cfg.app_major {
        3 => gen3_options(cfg, &mut out),
        4 => gen4_options(cfg, &mut out),
        _ => gen5_options(cfg, &mut out),
    }

    if cfg.app_major >= 4 {
        out.push(attr("x-nv-video[0].videoEncoderSlicesPerFrame", "1"));

        if cfg.is_av1 {
            out.push(attr("x-nv-vqos[0].bitStreamFormat", "2"));
        } else if cfg.is_hevc {
            out.push(attr("x-nv-clientSupportHevc", "1"));
            out.push(attr("x-nv-vqos[0].bitStreamFormat", "1"));
        } else {
            out.push(attr("x-nv-clientSupportHevc", "0"));
            out.push(attr("x-nv-vqos[0].bitStreamFormat", "0"));
        }

        if cfg.app_major >= 7 {
            out.push(attr(
                "x-nv-video[0].dynamicRangeMode",
                if cfg.hdr_enabled { "1" } else { "0" },
            ));
            let max_ref_frames = if cfg.reference_frame_invalidation_supported { 0 } else { 1 };
            out.push(attr("x-nv-video[0].maxNumReferenceFrames", max_ref_frames));
            out.push(attr(
                "x-nv-video[0].clientRefreshRateX100",
                cfg.client_refresh_rate_x100,
            ));
        }

        out.push(attr("x-nv-audio.surround.numChannels", cfg.audio_channel_count));
        out.push(attr("x-nv-audio.surround.channelMask", cfg.audio_channel_mask));
        out.push(attr(
            "x-nv-audio.surround.enable",
            if cfg.audio_channel_count > 2 { "1" } else { "0" },
        ));
    }

    if cfg.app_major >= 7 {
        out.push(attr("x-nv-audio.surround.AudioQuality", "0"));
        out.push(attr("x-nv-aqos.packetDuration", audio_packet_duration_ms(cfg)));
        out.push(attr(
            "x-nv-video[0].encoderCscMode",
            (cfg.color_space << 1) | cfg.color_range,
        ));
    }

    out.into_iter().map(|a| (a.name, a.value)).collect()
}

/// 5ms frames unless the server predates generation 7, which always uses 5ms too; kept as its
/// own function since it also feeds the packet-duration attribute for surround audio tuning.
fn audio_packet_duration_ms(cfg: &SdpConfig) -> u32 {
    if cfg.bitrate_kbps >= 20_000 && cfg.audio_channel_count > 2 {
        5
    } else {
        10
    }
}

/// Serializes the full SDP body: header, attribute list, tail. Matches
/// `fillSdpHeader`/`fillSerializedAttributeList`/`fillSdpTail`.
pub fn build_sdp_payload(cfg: &SdpConfig, rtsp_client_version: u32) -> Vec<u8> {
    let mut body = format!(
        "v=0\r\no=android 0 {} IN {} {}\r\ns=NVIDIA Streaming Client\r\n",
        rtsp_client_version,
        if cfg.is_ipv6 { "IP6" } else { "IP4" },
        cfg.client_address,
    );

    for (name, value) in build_attributes(cfg) {
        body.push_str(&format!("a={name}:{value} \r\n"));
    }

    let video_port = if cfg.app_major < 4 { 47996 } else { cfg.video_port };
    body.push_str(&format!("t=0 0\r\nm=video {video_port}  \r\n"));

    body.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SdpConfig {
        SdpConfig {
            app_major: 7,
            client_address: "192.168.1.50".to_string(),
            is_ipv6: false,
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 20_000,
            packet_size: 1024,
            video_port: 47998,
            rtsp_port: 48010,
            streaming_remote: false,
            encrypt_video: true,
            encrypt_audio: false,
            is_hevc: false,
            is_av1: false,
            hdr_enabled: false,
            audio_channel_count: 2,
            audio_channel_mask: 0x3,
            reference_frame_invalidation_supported: true,
            client_refresh_rate_x100: 6000,
            color_space: 0,
            color_range: 1,
            is_sunshine: false,
        }
    }

    #[test]
    fn encrypted_video_shrinks_packet_size() {
        let cfg = base_config();
        let attrs = build_attributes(&cfg);
        let packet_size = attrs.iter().find(|(n, _)| n == "x-nv-video[0].packetSize").unwrap();
        assert_eq!(packet_size.1, "1016");
    }

    #[test]
    fn gen7_emits_dynamic_range_and_refresh_rate() {
        let cfg = base_config();
        let attrs = build_attributes(&cfg);
        assert!(attrs.iter().any(|(n, v)| n == "x-nv-video[0].dynamicRangeMode" && v == "0"));
        assert!(attrs
            .iter()
            .any(|(n, v)| n == "x-nv-video[0].clientRefreshRateX100" && v == "6000"));
    }

    #[test]
    fn gen3_uses_legacy_option_block_without_reliable_udp() {
        let mut cfg = base_config();
        cfg.app_major = 3;
        let attrs = build_attributes(&cfg);
        assert!(attrs.iter().any(|(n, _)| n == "x-nv-vqos[0].bw.flags"));
        assert!(!attrs.iter().any(|(n, _)| n == "x-nv-general.useReliableUdp"));
    }

    #[test]
    fn payload_ends_with_video_media_line() {
        let cfg = base_config();
        let payload = build_sdp_payload(&cfg, 14);
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("m=video 47998  \r\n"));
    }

    #[test]
    fn pre_gen4_falls_back_to_legacy_video_port() {
        let mut cfg = base_config();
        cfg.app_major = 3;
        let payload = build_sdp_payload(&cfg, 10);
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("m=video 47996  \r\n"));
    }
}
