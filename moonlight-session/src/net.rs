//! UDP/TCP transport helpers, grounded in `PlatformSockets.c`. Pure ENet
//! plumbing (peer/host lifecycle) lives outside this crate behind the
//! `ControlTransport`/RTSP transport traits; this module only owns the raw
//! socket calls those trait implementations are built on.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use crate::control::{ControlTransport, InboundControlEvent};
use crate::error::SessionError;

/// Default well-known ports, matching `RtspPortNumber`/`ControlPortNumber`/
/// `AudioPortNumber`/`VideoPortNumber` defaults and the legacy input socket.
pub const RTSP_PORT: u16 = 48010;
pub const CONTROL_PORT: u16 = 47999;
pub const AUDIO_PORT: u16 = 48000;
pub const VIDEO_PORT: u16 = 47998;
pub const LEGACY_INPUT_PORT: u16 = 35043;

/// Resolves a hostname or literal address to the first usable socket address,
/// matching `resolveHostName`'s "any family, first result" behaviour.
pub fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    (host, port)
        .to_socket_addrs()
        .map_err(SessionError::NameResolution)?
        .next()
        .ok_or_else(|| SessionError::NameResolution(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

pub struct UdpChannel {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpChannel {
    /// Binds an ephemeral local socket of the same family as `peer` and
    /// connects it, mirroring `bindUdpSocket` followed by `connect`.
    pub fn connect(peer: SocketAddr, buffer_size: Option<u32>) -> Result<Self, SessionError> {
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).map_err(SessionError::Transport)?;
        socket.connect(peer).map_err(SessionError::Transport)?;
        if let Some(size) = buffer_size {
            let _ = size; // best-effort hint only; std has no portable SO_RCVBUF setter.
        }
        Ok(Self { socket, peer })
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.socket.send(payload).map_err(SessionError::Transport)?;
        Ok(())
    }

    /// Blocks for up to `timeout` waiting for a datagram, returning `None` on timeout
    /// (matching `recvUdpSocket`'s non-fatal `-1`/timeout handling at call sites).
    pub fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, SessionError> {
        self.socket.set_read_timeout(Some(timeout)).map_err(SessionError::Transport)?;
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(SessionError::Transport(e)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Connects with a bounded timeout and disables Nagle's algorithm, matching
    /// `connectTcpSocket` + `enableNoDelay`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, SessionError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(SessionError::Transport)?;
        stream.set_nodelay(true).map_err(SessionError::Transport)?;
        Ok(Self { stream })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SessionError> {
        self.stream.set_read_timeout(timeout).map_err(SessionError::Transport)
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Legacy (Gen < 5) control-channel transport: a raw TCP socket carrying
/// `{type: u16, payloadLength: u16, payload}` frames, grounded in
/// `sendMessageTcp`/`readNvctlPacketTcp`.
pub struct TcpControlTransport {
    channel: TcpChannel,
}

impl TcpControlTransport {
    pub fn new(channel: TcpChannel) -> Self {
        Self { channel }
    }

    fn write_frame(&mut self, packet_type: u16, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&packet_type.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        self.channel.stream_mut().write_all(&frame)
    }

    fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.channel.stream_mut().read_exact(&mut header)?;
        let payload_len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; payload_len];
        self.channel.stream_mut().read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl ControlTransport for TcpControlTransport {
    fn send_and_forget(&mut self, packet_type: u16, payload: &[u8]) -> io::Result<()> {
        self.write_frame(packet_type, payload)
    }

    fn send_and_discard_reply(&mut self, packet_type: u16, payload: &[u8]) -> io::Result<()> {
        self.write_frame(packet_type, payload)?;
        self.read_frame()?;
        Ok(())
    }

    fn poll_inbound(&mut self, timeout: Duration) -> io::Result<Option<InboundControlEvent>> {
        // The legacy TCP control channel carries no unsolicited host->client
        // control packets (rumble/termination ride the ENet channel from Gen 5
        // on); nothing to poll here.
        let _ = timeout;
        Ok(None)
    }

    fn is_enet(&self) -> bool {
        false
    }
}

/// Gen >= 5 control-channel transport over a reliable ENet peer, grounded in
/// `sendMessageEnet` and the control-receive loop's `enet_host_service` poll.
/// A single mutex serialises `peer.send`/`host.flush`, matching the
/// original's `enetMutex` (ENet hosts are not internally reentrant).
pub struct EnetControlTransport {
    host: Mutex<enet::Host<()>>,
    peer_index: usize,
}

impl EnetControlTransport {
    pub fn new(host: enet::Host<()>, peer_index: usize) -> Self {
        Self {
            host: Mutex::new(host),
            peer_index,
        }
    }

    fn send_reliable(&mut self, packet_type: u16, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&packet_type.to_le_bytes());
        frame.extend_from_slice(payload);

        let mut host = self.host.lock().expect("enet host mutex poisoned");
        let packet = enet::Packet::reliable(&frame);
        host.peer_mut(self.peer_index)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "control peer gone"))?
            .send(0, packet)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        host.flush();
        Ok(())
    }
}

impl ControlTransport for EnetControlTransport {
    fn send_and_forget(&mut self, packet_type: u16, payload: &[u8]) -> io::Result<()> {
        self.send_reliable(packet_type, payload)
    }

    fn send_and_discard_reply(&mut self, packet_type: u16, payload: &[u8]) -> io::Result<()> {
        // Replies (where one is sent) arrive through the same `poll_inbound`
        // loop the control-receive thread drains; the original discards them
        // by reading once on the send thread, which this transport can't do
        // without racing that thread, so the caller is expected not to rely
        // on synchronous replies when using ENet (true for every gen >= 5
        // message in `ControlStream.c`: Enet replies are never inspected).
        self.send_reliable(packet_type, payload)
    }

    fn poll_inbound(&mut self, timeout: Duration) -> io::Result<Option<InboundControlEvent>> {
        let mut host = self.host.lock().expect("enet host mutex poisoned");
        let event = host
            .service(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        match event {
            Some(enet::Event::Receive { packet, .. }) => {
                let data = packet.data();
                if data.len() < 2 {
                    return Ok(None);
                }
                let packet_type = u16::from_le_bytes([data[0], data[1]]);
                Ok(InboundControlEvent::from_wire(packet_type, &data[2..]))
            }
            Some(enet::Event::Disconnect { .. }) => Ok(Some(InboundControlEvent::Disconnect)),
            _ => Ok(None),
        }
    }

    fn is_enet(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_loopback_succeeds() {
        let addr = resolve_host("127.0.0.1", RTSP_PORT).unwrap();
        assert_eq!(addr.port(), RTSP_PORT);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn udp_channel_roundtrips_on_loopback() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let channel = UdpChannel::connect(responder_addr, None).unwrap();
        channel.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = responder.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        responder.send_to(b"pong", from).unwrap();
        let mut reply = [0u8; 16];
        let read = channel.recv_timeout(&mut reply, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&reply[..read], b"pong");
    }

    #[test]
    fn udp_recv_timeout_returns_none() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let channel = UdpChannel::connect(peer, None).unwrap();
        let mut buf = [0u8; 8];
        let result = channel.recv_timeout(&mut buf, Duration::from_millis(20)).unwrap();
        assert!(result.is_none());
    }
}
