//! RTSP handshake driver, grounded in `RtspConnection.c`.
//!
//! Builds and serializes the OPTIONS/DESCRIBE/SETUP/PLAY/ANNOUNCE request
//! sequence and parses status-line responses. Transport (TCP for the
//! pre-Gen-5 raw-socket path, ENet-over-UDP for Gen 5 through 7 below patch
//! 404) is supplied by the caller through [`RtspTransport`]; this module only
//! knows the message shapes.

use crate::error::SessionError;

pub const RTSP_PORT: u16 = 48010;

#[derive(Debug, Clone)]
pub struct RtspMessage {
    pub method: String,
    pub target: String,
    pub options: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl RtspMessage {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = format!("{} {} RTSP/1.0\r\n", self.method, self.target).into_bytes();
        for (key, value) in &self.options {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.payload);
        out
    }
}

#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub options: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl RtspResponse {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses a full RTSP response (status line, headers, optional body already appended).
pub fn parse_response(data: &[u8]) -> Result<RtspResponse, SessionError> {
    let text = String::from_utf8_lossy(data);
    let header_end = text
        .find("\r\n\r\n")
        .ok_or_else(|| SessionError::RtspMalformed("missing header terminator".into()))?;
    let header_section = &text[..header_end];
    let body = data[header_end + 4..].to_vec();

    let mut lines = header_section.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| SessionError::RtspMalformed("empty response".into()))?;

    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| SessionError::RtspMalformed(format!("bad status line: {status_line}")))?;

    let mut options = Vec::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            options.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RtspResponse {
        status_code,
        options,
        payload: body,
    })
}

fn client_version_for_major(major: u32) -> u32 {
    match major {
        3 => 10,
        4 => 11,
        5 => 12,
        6 => 13,
        _ => 14,
    }
}

/// Gen 5 through 7 below patch 404 run RTSP over ENet; everything else uses a raw TCP socket.
pub fn uses_enet_transport(major: u32, patch: u32) -> bool {
    (5..=7).contains(&major) && patch < 404
}

pub struct RtspHandshake {
    seq: u32,
    client_version: u32,
    session_id: Option<String>,
    host_addr: String,
    use_enet: bool,
}

impl RtspHandshake {
    pub fn new(host_addr: String, app_major: u32, patch: u32) -> Self {
        Self {
            seq: 1,
            client_version: client_version_for_major(app_major),
            session_id: None,
            host_addr,
            use_enet: uses_enet_transport(app_major, patch),
        }
    }

    pub fn target_url(&self) -> String {
        format!(
            "rtsp{}://{}:{}",
            if self.use_enet { "ru" } else { "" },
            self.host_addr,
            RTSP_PORT
        )
    }

    fn base_options(&mut self) -> Vec<(String, String)> {
        let mut options = vec![
            ("CSeq".to_string(), self.seq.to_string()),
            ("X-GS-ClientVersion".to_string(), self.client_version.to_string()),
        ];
        self.seq += 1;
        if !self.use_enet {
            options.push(("Host".to_string(), self.host_addr.clone()));
        }
        options
    }

    pub fn set_session_id(&mut self, session_id: String) {
        self.session_id = Some(session_id);
    }

    pub fn build_options(&mut self) -> RtspMessage {
        let target = self.target_url();
        RtspMessage {
            method: "OPTIONS".to_string(),
            target,
            options: self.base_options(),
            payload: Vec::new(),
        }
    }

    pub fn build_describe(&mut self) -> RtspMessage {
        let target = self.target_url();
        let mut options = self.base_options();
        options.push(("Accept".to_string(), "application/sdp".to_string()));
        options.push((
            "If-Modified-Since".to_string(),
            "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
        ));
        RtspMessage {
            method: "DESCRIBE".to_string(),
            target,
            options,
            payload: Vec::new(),
        }
    }

    pub fn build_setup(&mut self, stream_target: &str, app_major: u32) -> RtspMessage {
        let mut options = self.base_options();
        if let Some(session) = &self.session_id {
            options.push(("Session".to_string(), session.clone()));
        }
        let transport_value = if app_major >= 6 {
            "unicast;X-GS-ClientPort=50000-50001".to_string()
        } else {
            " ".to_string()
        };
        options.push(("Transport".to_string(), transport_value));
        options.push((
            "If-Modified-Since".to_string(),
            "Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
        ));
        RtspMessage {
            method: "SETUP".to_string(),
            target: stream_target.to_string(),
            options,
            payload: Vec::new(),
        }
    }

    pub fn build_play(&mut self, stream_target: &str) -> RtspMessage {
        let mut options = self.base_options();
        if let Some(session) = &self.session_id {
            options.push(("Session".to_string(), session.clone()));
        }
        RtspMessage {
            method: "PLAY".to_string(),
            target: stream_target.to_string(),
            options,
            payload: Vec::new(),
        }
    }

    pub fn build_announce(&mut self, sdp_payload: Vec<u8>) -> RtspMessage {
        let mut options = self.base_options();
        if let Some(session) = &self.session_id {
            options.push(("Session".to_string(), session.clone()));
        }
        options.push(("Content-type".to_string(), "application/sdp".to_string()));
        options.push(("Content-length".to_string(), sdp_payload.len().to_string()));
        RtspMessage {
            method: "ANNOUNCE".to_string(),
            target: "streamid=video".to_string(),
            options,
            payload: sdp_payload,
        }
    }

    /// Stream-id target for SETUP, which changed shape at Gen 5 to carry a track/index suffix.
    pub fn setup_target(stream: &str, app_major: u32) -> String {
        if app_major >= 5 {
            format!("streamid={stream}/0/0")
        } else {
            format!("streamid={stream}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enet_transport_only_for_gen5_through_7_below_patch_404() {
        assert!(!uses_enet_transport(4, 0));
        assert!(uses_enet_transport(5, 0));
        assert!(uses_enet_transport(7, 403));
        assert!(!uses_enet_transport(7, 404));
        assert!(!uses_enet_transport(8, 0));
    }

    #[test]
    fn options_request_omits_host_header_over_enet() {
        let mut hs = RtspHandshake::new("10.0.0.5".to_string(), 5, 0);
        let msg = hs.build_options();
        assert!(msg.options.iter().all(|(k, _)| k != "Host"));
    }

    #[test]
    fn options_request_includes_host_header_over_tcp() {
        let mut hs = RtspHandshake::new("10.0.0.5".to_string(), 4, 0);
        let msg = hs.build_options();
        assert!(msg.options.iter().any(|(k, v)| k == "Host" && v == "10.0.0.5"));
    }

    #[test]
    fn cseq_increments_across_requests() {
        let mut hs = RtspHandshake::new("10.0.0.5".to_string(), 7, 0);
        let first = hs.build_options();
        let second = hs.build_describe();
        let seq = |m: &RtspMessage| m.options.iter().find(|(k, _)| k == "CSeq").unwrap().1.clone();
        assert_eq!(seq(&first), "1");
        assert_eq!(seq(&second), "2");
    }

    #[test]
    fn setup_target_carries_track_suffix_from_gen5() {
        assert_eq!(RtspHandshake::setup_target("video", 5), "streamid=video/0/0");
        assert_eq!(RtspHandshake::setup_target("video", 4), "streamid=video");
    }

    #[test]
    fn response_parses_status_and_headers() {
        let raw = b"RTSP/1.0 200 OK\r\nSession: abc123\r\nCSeq: 1\r\n\r\nbody-bytes";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.option("Session"), Some("abc123"));
        assert_eq!(resp.payload, b"body-bytes");
    }

    #[test]
    fn malformed_response_is_rejected() {
        assert!(parse_response(b"not an rtsp response").is_err());
    }
}
