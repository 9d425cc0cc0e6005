//! Session orchestrator: the staged bring-up/teardown sequence from
//! `Connection.c`'s `LiStartConnection`/`LiStopConnection`, wiring the RTSP
//! handshake, control stream, video/audio receive pipelines and input-send
//! pipeline together behind the listener callback surface in `connection.rs`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::audio::{AudioRenderer, AudioStream};
use crate::bytebuffer::{ByteOrder, ByteReader};
use crate::config::StreamConfig;
use crate::connection::{ConnectionListener, ConnectionStatus, Stage};
use crate::control::{
    ControlStream, ControlStreamEvent, ControlTransport, Generation, InboundControlEvent, PacketKind,
};
use crate::error::{SessionError, TerminationReason};
use crate::input::{InputPacket, InputStream};
use crate::log::spans;
use crate::net::{resolve_host, EnetControlTransport, TcpChannel, TcpControlTransport, UdpChannel, AUDIO_PORT, CONTROL_PORT, VIDEO_PORT};
use crate::rtsp::{self, RtspHandshake, RtspMessage, RtspResponse};
use crate::sdp::{self, SdpConfig};
use crate::video::{DecoderCapabilities, DepacketizerEvent, SubmitResult, VideoDecoder, VideoFormat, VideoStream};

/// How long each blocking receive/poll site waits before re-checking for interruption,
/// matching the original's UDP/ENet poll-timeout pattern.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RTSP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_CONTROL_PORT: u16 = 47995;

fn stage_error_code(err: &SessionError) -> i32 {
    match err {
        SessionError::NameResolution(_) => TerminationReason::UnexpectedEarlyTermination as i32,
        SessionError::RtspStatus(code) => *code as i32,
        SessionError::RtspMalformed(_) => TerminationReason::UnexpectedEarlyTermination as i32,
        SessionError::Transport(_) => TerminationReason::NoVideoTraffic as i32,
        SessionError::EnetFailed => TerminationReason::UnexpectedEarlyTermination as i32,
        _ => TerminationReason::UnexpectedEarlyTermination as i32,
    }
}

/// Everything the orchestrator needs about the target host's reported app version, normally
/// learned from a prior `/serverinfo` exchange (pairing, out of this crate's scope).
#[derive(Debug, Clone, Copy)]
pub struct HostAppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

struct RtspChannel {
    tcp: Option<TcpChannel>,
    enet: Option<Mutex<enet::Host<()>>>,
    peer_index: usize,
}

impl RtspChannel {
    fn connect_tcp(addr: std::net::SocketAddr) -> Result<Self, SessionError> {
        let channel = TcpChannel::connect(addr, RTSP_CONNECT_TIMEOUT)?;
        Ok(Self { tcp: Some(channel), enet: None, peer_index: 0 })
    }

    fn connect_enet(addr: std::net::SocketAddr) -> Result<Self, SessionError> {
        let enet_ctx = enet::Enet::new().map_err(|_| SessionError::EnetFailed)?;
        let mut host = enet_ctx
            .create_host::<()>(None, 1, enet::ChannelLimit::Maximum, enet::BandwidthLimit::Unlimited, enet::BandwidthLimit::Unlimited)
            .map_err(|_| SessionError::EnetFailed)?;
        let peer_index = host.connect(addr, 1, 0).map_err(|_| SessionError::EnetFailed)?;
        let deadline = std::time::Instant::now() + RTSP_CONNECT_TIMEOUT;
        loop {
            if std::time::Instant::now() > deadline {
                return Err(SessionError::EnetFailed);
            }
            match host.service(POLL_TIMEOUT).map_err(|_| SessionError::EnetFailed)? {
                Some(enet::Event::Connect { .. }) => break,
                _ => continue,
            }
        }
        Ok(Self { tcp: None, enet: Some(Mutex::new(host)), peer_index })
    }

    /// Sends one RTSP request and returns its parsed response, matching the original's
    /// one-packet-per-message ENet framing (with a second packet concatenated for a DESCRIBE
    /// payload) or a plain blocking TCP round trip.
    fn send_and_receive(&mut self, msg: &RtspMessage) -> Result<RtspResponse, SessionError> {
        let request = msg.serialize();
        if let Some(tcp) = &mut self.tcp {
            tcp.stream_mut().write_all(&request).map_err(SessionError::Transport)?;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = tcp.stream_mut().read(&mut chunk).map_err(SessionError::Transport)?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(resp) = rtsp::parse_response(&buf) {
                    let declared_len = resp
                        .option("Content-length")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if resp.payload.len() >= declared_len {
                        return Ok(resp);
                    }
                }
            }
            rtsp::parse_response(&buf)
        } else if let Some(host) = &self.enet {
            let mut host = host.lock().expect("rtsp enet host mutex poisoned");
            host.peer_mut(self.peer_index)
                .map_err(|_| SessionError::EnetFailed)?
                .send(0, enet::Packet::reliable(&request))
                .map_err(|_| SessionError::EnetFailed)?;
            host.flush();

            let mut buf = Vec::new();
            loop {
                match host.service(RTSP_CONNECT_TIMEOUT).map_err(|_| SessionError::EnetFailed)? {
                    Some(enet::Event::Receive { packet, .. }) => {
                        buf.extend_from_slice(packet.data());
                        if let Ok(resp) = rtsp::parse_response(&buf) {
                            let declared_len = resp
                                .option("Content-length")
                                .and_then(|v| v.parse::<usize>().ok())
                                .unwrap_or(0);
                            if resp.payload.len() >= declared_len {
                                return Ok(resp);
                            }
                            // Otherwise a DESCRIBE payload is still arriving as a second packet.
                            continue;
                        }
                    }
                    Some(enet::Event::Disconnect { .. }) => return Err(SessionError::EnetFailed),
                    _ => return Err(SessionError::EnetFailed),
                }
            }
        } else {
            unreachable!("RtspChannel always holds exactly one transport")
        }
    }
}

fn rtsp_expect_ok(resp: &RtspResponse) -> Result<(), SessionError> {
    if resp.status_code == 200 {
        Ok(())
    } else {
        Err(SessionError::RtspStatus(resp.status_code))
    }
}

struct VideoRtpHeader {
    sequence_number: u16,
}

fn parse_video_packet(data: &[u8]) -> Option<(VideoRtpHeader, crate::video_fec::VideoSubHeader, Vec<u8>)> {
    if data.len() < 12 + 16 {
        return None;
    }
    let mut r = ByteReader::new(data, ByteOrder::Big);
    let _header_byte = r.get_u8().ok()?;
    let _packet_type = r.get_u8().ok()?;
    let sequence_number = r.get_u16().ok()?;
    let _timestamp = r.get_u32().ok()?;
    let _ssrc = r.get_u32().ok()?;

    let mut sub = ByteReader::new(&data[12..28], ByteOrder::Little);
    let stream_packet_index = sub.get_u32().ok()?;
    let frame_index = sub.get_u32().ok()?;
    let flags = sub.get_u8().ok()?;
    let reserved = sub.get_u8().ok()?;
    let multi_fec_flags = sub.get_u8().ok()?;
    let multi_fec_blocks = sub.get_u8().ok()?;
    let fec_info = sub.get_u32().ok()?;

    let payload = data[28..].to_vec();
    Some((
        VideoRtpHeader { sequence_number },
        crate::video_fec::VideoSubHeader {
            stream_packet_index,
            frame_index,
            flags,
            reserved,
            multi_fec_flags,
            multi_fec_blocks,
            fec_info,
        },
        payload,
    ))
}

const AUDIO_DATA_PAYLOAD_TYPE: u8 = 97;

enum AudioWirePacket {
    Data { shard_index: usize, base_sequence: u16, payload: Vec<u8> },
    Parity { shard_index: usize, base_sequence: u16, payload: Vec<u8> },
}

fn parse_audio_packet(data: &[u8]) -> Option<AudioWirePacket> {
    if data.len() < 12 {
        return None;
    }
    let mut r = ByteReader::new(data, ByteOrder::Big);
    let _header_byte = r.get_u8().ok()?;
    let packet_type = r.get_u8().ok()?;
    let sequence_number = r.get_u16().ok()?;
    let _timestamp = r.get_u32().ok()?;
    let _ssrc = r.get_u32().ok()?;
    let payload = data[12..].to_vec();

    if packet_type == AUDIO_DATA_PAYLOAD_TYPE {
        let shard_index = (sequence_number % crate::audio_fec::DATA_SHARDS as u16) as usize;
        let base_sequence = sequence_number - shard_index as u16;
        Some(AudioWirePacket::Data { shard_index, base_sequence, payload })
    } else {
        let mut h = ByteReader::new(data, ByteOrder::Big);
        let fec_shard_index = h.get_u8().ok()?;
        let _payload_type = h.get_u8().ok()?;
        let base_sequence_number = h.get_u16().ok()?;
        let _base_timestamp = h.get_u32().ok()?;
        let _ssrc = h.get_u32().ok()?;
        Some(AudioWirePacket::Parity {
            shard_index: crate::audio_fec::DATA_SHARDS + fec_shard_index as usize,
            base_sequence: base_sequence_number,
            payload: data[12..].to_vec(),
        })
    }
}

/// A running session's threads and the handles needed to tear them down in reverse order.
struct RunningState {
    completed_stages: Vec<Stage>,
    interrupt: crate::platform::InterruptFlag,
    terminated: Arc<AtomicBool>,
    control_stream: Option<Arc<Mutex<ControlStream>>>,
    control_transport: Option<Arc<Mutex<Box<dyn ControlTransport>>>>,
    input: Option<Arc<Mutex<InputStream>>>,
    invalidation_event: crate::platform::ManualResetEvent,
    threads: Vec<JoinHandle<()>>,
}

/// Drives one streaming session end to end: RTSP handshake, control/video/audio/input
/// pipeline bring-up, and the long-running receive/send threads until `stop` or a fatal
/// transport error.
pub struct Session {
    config: StreamConfig,
    app_version: HostAppVersion,
    generation: Generation,
    listener: Arc<Mutex<dyn ConnectionListener + Send>>,
    video_decoder: Arc<Mutex<dyn VideoDecoder>>,
    audio_renderer: Arc<Mutex<dyn AudioRenderer>>,
    state: Option<RunningState>,
}

impl Session {
    pub fn new(
        config: StreamConfig,
        app_version: HostAppVersion,
        listener: Box<dyn ConnectionListener + Send>,
        video_decoder: Box<dyn VideoDecoder>,
        audio_renderer: Box<dyn AudioRenderer>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            generation: Generation::from_major_version(app_version.major),
            config,
            app_version,
            listener: Arc::new(Mutex::new(listener)) as Arc<Mutex<dyn ConnectionListener + Send>>,
            video_decoder: Arc::new(Mutex::new(video_decoder)) as Arc<Mutex<dyn VideoDecoder>>,
            audio_renderer: Arc::new(Mutex::new(audio_renderer)) as Arc<Mutex<dyn AudioRenderer>>,
            state: None,
        })
    }

    /// Runs every stage in `Stage::SEQUENCE`, reporting progress through the listener and
    /// unwinding whatever already started if a later stage fails.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state.is_some() {
            return Err(SessionError::ConnectionAlreadyExists);
        }

        let mut state = RunningState {
            completed_stages: Vec::new(),
            interrupt: crate::platform::InterruptFlag::new(),
            terminated: Arc::new(AtomicBool::new(false)),
            control_stream: None,
            control_transport: None,
            input: None,
            invalidation_event: crate::platform::ManualResetEvent::new(),
            threads: Vec::new(),
        };

        macro_rules! run_stage {
            ($stage:expr, $body:expr) => {{
                self.listener.lock().expect("listener mutex poisoned").stage_starting($stage);
                match $body {
                    Ok(v) => {
                        self.listener.lock().expect("listener mutex poisoned").stage_complete($stage);
                        state.completed_stages.push($stage);
                        v
                    }
                    Err(e) => {
                        let code = stage_error_code(&e);
                        self.listener.lock().expect("listener mutex poisoned").stage_failed($stage, code);
                        self.unwind(&mut state);
                        return Err(e);
                    }
                }
            }};
        }

        run_stage!(Stage::PlatformInit, Ok::<(), SessionError>(()));

        let host_addr = run_stage!(Stage::NameResolution, resolve_host(&self.config.host_address, 0).map(|a| a.ip().to_string()));

        let (session_id, use_enet_control) = run_stage!(Stage::RtspHandshake, self.run_rtsp_handshake(&host_addr));

        let (control_stream, control_transport) =
            run_stage!(Stage::ControlStreamInit, self.init_control_stream(&host_addr, use_enet_control));
        state.control_stream = Some(Arc::clone(&control_stream));
        state.control_transport = Some(Arc::clone(&control_transport));
        let _ = session_id;

        let video_stream = run_stage!(Stage::VideoStreamInit, self.init_video_stream(&host_addr));

        let audio_stream = run_stage!(Stage::AudioStreamInit, self.init_audio_stream(&host_addr));

        let (input, legacy_input_socket) = run_stage!(Stage::InputStreamInit, self.init_input_stream(&host_addr));
        state.input = Some(Arc::clone(&input));

        run_stage!(
            Stage::ControlStreamStart,
            self.start_control_stream(&mut state, Arc::clone(&control_stream), Arc::clone(&control_transport))
        );

        run_stage!(Stage::VideoStreamStart, self.start_video_stream(&mut state, video_stream));

        run_stage!(Stage::AudioStreamStart, self.start_audio_stream(&mut state, audio_stream));

        run_stage!(
            Stage::InputStreamStart,
            self.start_input_stream(&mut state, Arc::clone(&input), Arc::clone(&control_transport), legacy_input_socket)
        );

        self.state = Some(state);
        self.listener.lock().expect("listener mutex poisoned").connection_started();
        Ok(())
    }

    /// Caller-initiated teardown: reverses `Stage::SEQUENCE` and never invokes
    /// `connection_terminated` (that callback is reserved for post-establishment loss).
    pub fn stop(&mut self) {
        let Some(mut state) = self.state.take() else { return };
        self.unwind(&mut state);
    }

    fn unwind(&self, state: &mut RunningState) {
        state.interrupt.interrupt();
        state.invalidation_event.set();
        if let Some(input) = &state.input {
            let _ = input; // queue shutdown happens implicitly when threads observe the interrupt flag
        }
        for stage in state.completed_stages.iter().rev() {
            info!(stage = stage.name(), "tearing down");
        }
        for handle in state.threads.drain(..) {
            let _ = handle.join();
        }
        state.completed_stages.clear();
    }

    fn run_rtsp_handshake(&self, host_addr: &str) -> Result<(String, bool), SessionError> {
        let major = self.app_version.major;
        let patch = self.app_version.patch;
        let use_enet = rtsp::uses_enet_transport(major, patch);
        let port = rtsp::RTSP_PORT;
        let addr = resolve_host(host_addr, port)?;

        let mut channel = if use_enet { RtspChannel::connect_enet(addr)? } else { RtspChannel::connect_tcp(addr)? };
        let mut hs = RtspHandshake::new(host_addr.to_string(), major, patch);

        rtsp_expect_ok(&channel.send_and_receive(&hs.build_options())?)?;

        let describe = channel.send_and_receive(&hs.build_describe())?;
        rtsp_expect_ok(&describe)?;
        if let Some(session_id) = describe.option("Session") {
            hs.set_session_id(session_id.to_string());
        }

        let audio_target = RtspHandshake::setup_target("audio", major);
        rtsp_expect_ok(&channel.send_and_receive(&hs.build_setup(&audio_target, major))?)?;

        let video_target = RtspHandshake::setup_target("video", major);
        rtsp_expect_ok(&channel.send_and_receive(&hs.build_setup(&video_target, major))?)?;

        if major >= 5 {
            let control_target = RtspHandshake::setup_target("control", major);
            rtsp_expect_ok(&channel.send_and_receive(&hs.build_setup(&control_target, major))?)?;
        }

        let sdp_cfg = SdpConfig {
            app_major: major,
            client_address: host_addr.to_string(),
            is_ipv6: addr.is_ipv6(),
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            bitrate_kbps: self.config.bitrate_kbps,
            packet_size: self.config.packet_size,
            video_port: VIDEO_PORT,
            rtsp_port: port,
            streaming_remote: matches!(self.config.streaming_mode, crate::config::StreamingMode::Remote),
            encrypt_video: self.config.encryption.video,
            encrypt_audio: self.config.encryption.audio,
            is_hevc: self.config.video_formats.h265,
            is_av1: self.config.video_formats.av1_main8,
            hdr_enabled: false,
            audio_channel_count: self.config.audio_channel_count,
            audio_channel_mask: self.config.audio_channel_mask,
            reference_frame_invalidation_supported: self.config.reference_frame_invalidation_supported,
            client_refresh_rate_x100: self.config.client_refresh_rate_x100,
            color_space: self.config.colorspace as u32,
            color_range: matches!(self.config.color_range, crate::config::ColorRange::Full) as u32,
            is_sunshine: false,
        };
        let sdp_payload = sdp::build_sdp_payload(&sdp_cfg, rtsp::client_version_for_major(major));
        rtsp_expect_ok(&channel.send_and_receive(&hs.build_announce(sdp_payload))?)?;

        rtsp_expect_ok(&channel.send_and_receive(&hs.build_play(&video_target))?)?;
        rtsp_expect_ok(&channel.send_and_receive(&hs.build_play(&audio_target))?)?;

        Ok((String::new(), use_enet))
    }

    fn init_control_stream(
        &self,
        host_addr: &str,
        use_enet: bool,
    ) -> Result<(Arc<Mutex<ControlStream>>, Arc<Mutex<Box<dyn ControlTransport>>>), SessionError> {
        let transport: Box<dyn ControlTransport> = if use_enet {
            let addr = resolve_host(host_addr, CONTROL_PORT)?;
            let enet_ctx = enet::Enet::new().map_err(|_| SessionError::EnetFailed)?;
            let mut host = enet_ctx
                .create_host::<()>(None, 1, enet::ChannelLimit::Maximum, enet::BandwidthLimit::Unlimited, enet::BandwidthLimit::Unlimited)
                .map_err(|_| SessionError::EnetFailed)?;
            let peer_index = host.connect(addr, 1, 0).map_err(|_| SessionError::EnetFailed)?;
            let deadline = std::time::Instant::now() + RTSP_CONNECT_TIMEOUT;
            loop {
                if std::time::Instant::now() > deadline {
                    return Err(SessionError::EnetFailed);
                }
                if let Some(enet::Event::Connect { .. }) = host.service(POLL_TIMEOUT).map_err(|_| SessionError::EnetFailed)? {
                    break;
                }
            }
            Box::new(EnetControlTransport::new(host, peer_index))
        } else {
            let addr = resolve_host(host_addr, TCP_CONTROL_PORT)?;
            Box::new(TcpControlTransport::new(TcpChannel::connect(addr, RTSP_CONNECT_TIMEOUT)?))
        };

        let cs = ControlStream::new(self.generation, self.config.reference_frame_invalidation_supported);
        Ok((Arc::new(Mutex::new(cs)), Arc::new(Mutex::new(transport))))
    }

    fn init_video_stream(&self, host_addr: &str) -> Result<(UdpChannel, VideoStream), SessionError> {
        let addr = resolve_host(host_addr, VIDEO_PORT)?;
        let socket = UdpChannel::connect(addr, None)?;
        let stream = VideoStream::new(self.generation.frame_header_len(), self.config.reference_frame_invalidation_supported);
        Ok((socket, stream))
    }

    fn init_audio_stream(&self, host_addr: &str) -> Result<(UdpChannel, AudioStream), SessionError> {
        let addr = resolve_host(host_addr, AUDIO_PORT)?;
        let socket = UdpChannel::connect(addr, None)?;
        Ok((socket, AudioStream::new()))
    }

    /// On ENet-capable hosts, input packets ride the control stream
    /// (`sendInputPacketOnControlStream`); pre-Gen-5 hosts get a dedicated legacy input
    /// socket instead, opened here alongside the encryption pipeline.
    fn init_input_stream(&self, host_addr: &str) -> Result<(Arc<Mutex<InputStream>>, Option<TcpChannel>), SessionError> {
        let use_gcm = self.generation.uses_gcm_input_encryption();
        let send_on_control_stream = self.generation.uses_enet();
        let stream = InputStream::new(
            self.config.remote_input_aes_key,
            self.config.remote_input_aes_iv,
            use_gcm,
            send_on_control_stream,
        );
        let legacy_socket = if send_on_control_stream {
            None
        } else {
            let addr = resolve_host(host_addr, crate::net::LEGACY_INPUT_PORT)?;
            Some(TcpChannel::connect(addr, RTSP_CONNECT_TIMEOUT)?)
        };
        Ok((Arc::new(Mutex::new(stream)), legacy_socket))
    }

    fn start_control_stream(
        &self,
        state: &mut RunningState,
        control_stream: Arc<Mutex<ControlStream>>,
        transport: Arc<Mutex<Box<dyn ControlTransport>>>,
    ) -> Result<(), SessionError> {
        {
            let (ty, payload) = control_stream.lock().expect("control stream mutex poisoned").start_a();
            let mut t = transport.lock().expect("control transport mutex poisoned");
            if t.is_enet() {
                t.send_and_forget(ty, &payload).map_err(SessionError::Transport)?;
            } else {
                t.send_and_discard_reply(ty, &payload).map_err(SessionError::Transport)?;
            }
        }
        {
            let (ty, payload) = control_stream.lock().expect("control stream mutex poisoned").start_b();
            transport
                .lock()
                .expect("control transport mutex poisoned")
                .send_and_forget(ty, &payload)
                .map_err(SessionError::Transport)?;
        }

        let interrupt = state.interrupt.clone();
        let terminated = Arc::clone(&state.terminated);
        let listener = Arc::clone(&self.listener);
        let is_enet = self.generation.uses_enet();

        if is_enet {
            let cs = Arc::clone(&control_stream);
            let tr = Arc::clone(&transport);
            let interrupt = interrupt.clone();
            let listener = Arc::clone(&listener);
            let terminated = Arc::clone(&terminated);
            state.threads.push(
                std::thread::Builder::new()
                    .name(spans::CONTROL_RECEIVE.into())
                    .spawn(move || control_receive_loop(cs, tr, interrupt, listener, terminated))
                    .expect("failed to spawn control-receive thread"),
            );
        }

        {
            let cs = Arc::clone(&control_stream);
            let tr = Arc::clone(&transport);
            let interrupt = interrupt.clone();
            state.threads.push(
                std::thread::Builder::new()
                    .name(spans::LOSS_STATS.into())
                    .spawn(move || loss_stats_loop(cs, tr, interrupt))
                    .expect("failed to spawn loss-stats thread"),
            );
        }

        {
            let cs = Arc::clone(&control_stream);
            let tr = Arc::clone(&transport);
            let event = state.invalidation_event.clone();
            let interrupt = interrupt.clone();
            state.threads.push(
                std::thread::Builder::new()
                    .name("invalidation".into())
                    .spawn(move || invalidation_loop(cs, tr, event, interrupt))
                    .expect("failed to spawn invalidation thread"),
            );
        }

        Ok(())
    }

    fn start_video_stream(&self, state: &mut RunningState, init: (UdpChannel, VideoStream)) -> Result<(), SessionError> {
        let (socket, stream) = init;
        let socket = Arc::new(socket);
        let stream = Arc::new(Mutex::new(stream));
        let decoder = Arc::clone(&self.video_decoder);
        let interrupt = state.interrupt.clone();
        let control_stream = state.control_stream.clone();

        decoder.lock().expect("decoder mutex poisoned").setup(VideoFormat {
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            is_hevc: self.config.video_formats.h265,
        });
        decoder.lock().expect("decoder mutex poisoned").start();

        {
            let socket = Arc::clone(&socket);
            let stream = Arc::clone(&stream);
            let decoder = Arc::clone(&decoder);
            let interrupt = interrupt.clone();
            state.threads.push(
                std::thread::Builder::new()
                    .name(spans::RTP_VIDEO_RECEIVE.into())
                    .spawn(move || video_receive_loop(socket, stream, decoder, control_stream, interrupt))
                    .expect("failed to spawn rtp-video-receive thread"),
            );
        }

        {
            let socket = Arc::clone(&socket);
            let interrupt = interrupt.clone();
            state.threads.push(
                std::thread::Builder::new()
                    .name("udp-ping-video".into())
                    .spawn(move || udp_ping_loop(socket, interrupt))
                    .expect("failed to spawn video ping thread"),
            );
        }

        Ok(())
    }

    fn start_audio_stream(&self, state: &mut RunningState, init: (UdpChannel, AudioStream)) -> Result<(), SessionError> {
        let (socket, stream) = init;
        let socket = Arc::new(socket);
        let stream = Arc::new(Mutex::new(stream));
        let renderer = Arc::clone(&self.audio_renderer);
        let interrupt = state.interrupt.clone();

        renderer.lock().expect("renderer mutex poisoned").init(crate::audio::OpusMultistreamConfig {
            sample_rate: 48000,
            channel_count: self.config.audio_channel_count,
            streams: 1,
            coupled_streams: if self.config.audio_channel_count > 1 { 1 } else { 0 },
            channel_mapping: [0, 1, 0, 0, 0, 0, 0, 0],
        });
        renderer.lock().expect("renderer mutex poisoned").start();

        {
            let socket = Arc::clone(&socket);
            let stream = Arc::clone(&stream);
            let renderer = Arc::clone(&renderer);
            let interrupt = interrupt.clone();
            state.threads.push(
                std::thread::Builder::new()
                    .name(spans::RTP_AUDIO_RECEIVE.into())
                    .spawn(move || audio_receive_loop(socket, stream, renderer, interrupt))
                    .expect("failed to spawn rtp-audio-receive thread"),
            );
        }

        {
            let socket = Arc::clone(&socket);
            let interrupt = interrupt.clone();
            state.threads.push(
                std::thread::Builder::new()
                    .name("udp-ping-audio".into())
                    .spawn(move || udp_ping_loop(socket, interrupt))
                    .expect("failed to spawn audio ping thread"),
            );
        }

        Ok(())
    }

    fn start_input_stream(
        &self,
        state: &mut RunningState,
        input: Arc<Mutex<InputStream>>,
        control_transport: Arc<Mutex<Box<dyn ControlTransport>>>,
        legacy_socket: Option<TcpChannel>,
    ) -> Result<(), SessionError> {
        let interrupt = state.interrupt.clone();
        let generation = self.generation;
        let legacy_socket = legacy_socket.map(|s| Arc::new(Mutex::new(s)));
        state.threads.push(
            std::thread::Builder::new()
                .name(spans::INPUT_SEND.into())
                .spawn(move || input_send_loop(input, control_transport, legacy_socket, generation, interrupt))
                .expect("failed to spawn input-send thread"),
        );
        Ok(())
    }

    fn enqueue_input(&self, packet: InputPacket) -> Result<(), SessionError> {
        let Some(state) = &self.state else { return Err(SessionError::NotRunning) };
        let Some(input) = &state.input else { return Err(SessionError::NotRunning) };
        input.lock().expect("input mutex poisoned").enqueue(packet);
        Ok(())
    }

    pub fn send_mouse_move(&self, delta_x: i16, delta_y: i16) -> Result<(), SessionError> {
        self.enqueue_input(InputPacket::MouseMove { delta_x, delta_y })
    }

    pub fn send_mouse_button(&self, action: crate::input::ButtonAction, button: crate::input::MouseButton) -> Result<(), SessionError> {
        self.enqueue_input(InputPacket::MouseButton { action, button })
    }

    pub fn send_keyboard(&self, key_action: i8, key_code: i16, modifiers: i8) -> Result<(), SessionError> {
        self.enqueue_input(InputPacket::Keyboard { key_action, key_code, modifiers })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_controller(
        &self,
        button_flags: i16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<(), SessionError> {
        self.enqueue_input(InputPacket::Controller {
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_multi_controller(
        &self,
        controller_number: i16,
        active_gamepad_mask: i16,
        button_flags: i16,
        left_trigger: u8,
        right_trigger: u8,
        left_stick_x: i16,
        left_stick_y: i16,
        right_stick_x: i16,
        right_stick_y: i16,
    ) -> Result<(), SessionError> {
        self.enqueue_input(InputPacket::MultiController {
            controller_number,
            active_gamepad_mask,
            button_flags,
            left_trigger,
            right_trigger,
            left_stick_x,
            left_stick_y,
            right_stick_x,
            right_stick_y,
        })
    }

    pub fn send_scroll(&self, amount: i16) -> Result<(), SessionError> {
        self.enqueue_input(InputPacket::Scroll { amount })
    }
}

/// Dispatches `connection_terminated` on a detached thread so a caller invoking `stop` from
/// inside the callback can't deadlock against the control-receive thread that detected the
/// disconnect, and guarantees the callback fires at most once.
fn dispatch_termination(listener: Arc<Mutex<dyn ConnectionListener + Send>>, terminated: Arc<AtomicBool>, error_code: i32) {
    if terminated.swap(true, Ordering::AcqRel) {
        return;
    }
    std::thread::spawn(move || {
        listener.lock().expect("listener mutex poisoned").connection_terminated(error_code);
    });
}

fn control_receive_loop(
    control_stream: Arc<Mutex<ControlStream>>,
    transport: Arc<Mutex<Box<dyn ControlTransport>>>,
    interrupt: crate::platform::InterruptFlag,
    listener: Arc<Mutex<dyn ConnectionListener + Send>>,
    terminated: Arc<AtomicBool>,
) {
    let mut pending_disconnect_at: Option<std::time::Instant> = None;
    while !interrupt.is_interrupted() {
        let event = {
            let mut t = transport.lock().expect("control transport mutex poisoned");
            t.poll_inbound(POLL_TIMEOUT).unwrap_or(None)
        };

        if matches!(event, Some(InboundControlEvent::Disconnect)) && pending_disconnect_at.is_none() {
            pending_disconnect_at = Some(std::time::Instant::now() + ControlStream::disconnect_intercept_delay());
            continue;
        }

        let outcome = {
            let mut cs = control_stream.lock().expect("control stream mutex poisoned");
            cs.handle_inbound(event)
        };

        match outcome {
            Some(ControlStreamEvent::Rumble { controller_number, low_freq, high_freq }) => {
                listener
                    .lock()
                    .expect("listener mutex poisoned")
                    .controller_rumble(controller_number, low_freq, high_freq);
            }
            Some(ControlStreamEvent::Terminated(code)) => {
                dispatch_termination(listener.clone(), terminated.clone(), code);
                return;
            }
            None => {}
        }

        if let Some(deadline) = pending_disconnect_at {
            if std::time::Instant::now() >= deadline {
                let outcome = control_stream
                    .lock()
                    .expect("control stream mutex poisoned")
                    .handle_inbound(Some(InboundControlEvent::Disconnect));
                if let Some(ControlStreamEvent::Terminated(code)) = outcome {
                    dispatch_termination(listener.clone(), terminated.clone(), code);
                    return;
                }
                pending_disconnect_at = None;
            }
        }
    }
}

fn loss_stats_loop(control_stream: Arc<Mutex<ControlStream>>, transport: Arc<Mutex<Box<dyn ControlTransport>>>, interrupt: crate::platform::InterruptFlag) {
    while !interrupt.is_interrupted() {
        crate::platform::interruptible_sleep(Duration::from_millis(crate::control::LOSS_REPORT_INTERVAL_MS), &interrupt);
        if interrupt.is_interrupted() {
            return;
        }
        let message = control_stream.lock().expect("control stream mutex poisoned").build_loss_stats_message();
        if let Some((ty, payload)) = message {
            let _ = transport.lock().expect("control transport mutex poisoned").send_and_forget(ty, &payload);
        }
    }
}

fn invalidation_loop(
    control_stream: Arc<Mutex<ControlStream>>,
    transport: Arc<Mutex<Box<dyn ControlTransport>>>,
    event: crate::platform::ManualResetEvent,
    interrupt: crate::platform::InterruptFlag,
) {
    while !interrupt.is_interrupted() {
        if !event.wait_timeout(POLL_TIMEOUT) {
            continue;
        }
        if interrupt.is_interrupted() {
            return;
        }
        let action = control_stream.lock().expect("control stream mutex poisoned").build_invalidation_action();
        match action {
            crate::control::InvalidationAction::RequestIdr { packet_type, payload }
            | crate::control::InvalidationAction::InvalidateRanges { packet_type, payload } => {
                let _ = transport.lock().expect("control transport mutex poisoned").send_and_forget(packet_type, &payload);
            }
            crate::control::InvalidationAction::Nothing => {}
        }
        event.clear();
    }
}

fn video_receive_loop(
    socket: Arc<UdpChannel>,
    stream: Arc<Mutex<VideoStream>>,
    decoder: Arc<Mutex<dyn VideoDecoder>>,
    control_stream: Option<Arc<Mutex<ControlStream>>>,
    interrupt: crate::platform::InterruptFlag,
) {
    let mut buf = vec![0u8; 2048];
    let direct_submit = decoder.lock().expect("decoder mutex poisoned").capabilities().contains(DecoderCapabilities::DIRECT_SUBMIT);

    while !interrupt.is_interrupted() {
        let n = match socket.recv_timeout(&mut buf, POLL_TIMEOUT) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(_) => return,
        };

        let Some((header, sub, payload)) = parse_video_packet(&buf[..n]) else { continue };
        let events = stream
            .lock()
            .expect("video stream mutex poisoned")
            .add_rtp_packet(sub, header.sequence_number, payload, crate::platform::now_ms());

        if let Some(cs) = &control_stream {
            let mut cs = cs.lock().expect("control stream mutex poisoned");
            for event in events {
                match event {
                    DepacketizerEvent::FrameLossRange { start, end } => {
                        cs.detected_frame_loss(start as i64, end as i64);
                    }
                    DepacketizerEvent::RefreshRequested => {
                        cs.request_idr_on_demand();
                    }
                }
            }
        }

        if direct_submit {
            let mut decoder = decoder.lock().expect("decoder mutex poisoned");
            let stream = stream.lock().expect("video stream mutex poisoned");
            if let Some(SubmitResult::NeedIdr) = stream.pump_direct_submit(&mut **decoder) {
                if let Some(cs) = &control_stream {
                    cs.lock().expect("control stream mutex poisoned").request_idr_on_demand();
                }
            }
        }
    }
}

fn audio_receive_loop(socket: Arc<UdpChannel>, stream: Arc<Mutex<AudioStream>>, renderer: Arc<Mutex<dyn AudioRenderer>>, interrupt: crate::platform::InterruptFlag) {
    let mut buf = vec![0u8; 1500];
    while !interrupt.is_interrupted() {
        let n = match socket.recv_timeout(&mut buf, POLL_TIMEOUT) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(_) => return,
        };

        let Some(packet) = parse_audio_packet(&buf[..n]) else { continue };
        {
            let mut stream = stream.lock().expect("audio stream mutex poisoned");
            match packet {
                AudioWirePacket::Data { shard_index, base_sequence, payload } => stream.add_shard(base_sequence, shard_index, payload),
                AudioWirePacket::Parity { shard_index, base_sequence, payload } => stream.add_shard(base_sequence, shard_index, payload),
            }
        }
        let mut renderer = renderer.lock().expect("renderer mutex poisoned");
        stream.lock().expect("audio stream mutex poisoned").pump(&mut **renderer);
    }
}

fn udp_ping_loop(socket: Arc<UdpChannel>, interrupt: crate::platform::InterruptFlag) {
    const PING_INTERVAL: Duration = Duration::from_millis(500);
    let payload = [0x50, 0x49, 0x4e, 0x47]; // "PING"
    while !interrupt.is_interrupted() {
        let _ = socket.send(&payload);
        crate::platform::interruptible_sleep(PING_INTERVAL, &interrupt);
    }
}

fn input_send_loop(
    input: Arc<Mutex<InputStream>>,
    control_transport: Arc<Mutex<Box<dyn ControlTransport>>>,
    legacy_socket: Option<Arc<Mutex<TcpChannel>>>,
    generation: Generation,
    interrupt: crate::platform::InterruptFlag,
) {
    while !interrupt.is_interrupted() {
        let head = {
            let input = input.lock().expect("input mutex poisoned");
            input.wait_for_packet_timeout(POLL_TIMEOUT)
        };
        let Some(head) = head else { continue };

        let mut input = input.lock().expect("input mutex poisoned");
        let batched = input.drain_batch(head);
        let framed = input.encrypt_and_frame(&batched);
        let send_on_control_stream = input.send_on_control_stream();
        drop(input);

        if send_on_control_stream {
            let mut t = control_transport.lock().expect("control transport mutex poisoned");
            if let Some(ty) = crate::control::packet_type(generation, PacketKind::Input) {
                let _ = t.send_and_forget(ty, &framed);
            }
        } else if let Some(socket) = &legacy_socket {
            let mut socket = socket.lock().expect("legacy input socket mutex poisoned");
            if socket.stream_mut().write_all(&framed).is_err() {
                warn!("legacy input socket write failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Generation;

    #[test]
    fn stage_sequence_runs_rtsp_handshake_before_any_stream_init() {
        let rtsp_pos = Stage::SEQUENCE.iter().position(|s| *s == Stage::RtspHandshake).unwrap();
        let control_pos = Stage::SEQUENCE.iter().position(|s| *s == Stage::ControlStreamInit).unwrap();
        let video_pos = Stage::SEQUENCE.iter().position(|s| *s == Stage::VideoStreamInit).unwrap();
        let audio_pos = Stage::SEQUENCE.iter().position(|s| *s == Stage::AudioStreamInit).unwrap();
        let input_pos = Stage::SEQUENCE.iter().position(|s| *s == Stage::InputStreamInit).unwrap();
        assert!(rtsp_pos < control_pos);
        assert!(control_pos < video_pos);
        assert!(video_pos < audio_pos);
        assert!(audio_pos < input_pos);
    }

    #[test]
    fn stage_sequence_starts_streams_only_after_every_stream_is_initialized() {
        let input_init = Stage::SEQUENCE.iter().position(|s| *s == Stage::InputStreamInit).unwrap();
        let control_start = Stage::SEQUENCE.iter().position(|s| *s == Stage::ControlStreamStart).unwrap();
        assert!(input_init < control_start);
    }

    #[test]
    fn rtsp_status_error_code_passes_through_the_status() {
        let err = SessionError::RtspStatus(404);
        assert_eq!(stage_error_code(&err), 404);
    }

    #[test]
    fn gen5_and_later_route_input_over_the_control_stream() {
        assert!(Generation::Gen5.uses_enet());
        assert!(Generation::Gen7.uses_enet());
    }

    #[test]
    fn pre_gen5_routes_input_over_a_dedicated_legacy_socket() {
        assert!(!Generation::Gen3.uses_enet());
        assert!(!Generation::Gen4.uses_enet());
    }

    #[test]
    fn host_app_version_resolves_the_right_generation() {
        assert_eq!(Generation::from_major_version(3), Generation::Gen3);
        assert_eq!(Generation::from_major_version(4), Generation::Gen4);
        assert_eq!(Generation::from_major_version(5), Generation::Gen5);
        assert_eq!(Generation::from_major_version(9), Generation::Gen7);
    }
}
