// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction: discovery datagrams, per-peer links, listeners.
//
// Every read is non-blocking. `Ok(None)` means "nothing available right now",
// never "closed"; a closed stream surfaces as `TransportError::Closed`.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framing;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: TransportAddress,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("frame error: {0}")]
    Frame(#[from] framing::FrameError),

    #[error("transport already started")]
    AlreadyStarted,

    #[error("transport not started")]
    NotStarted,
}

// ---------------------------------------------------------------------------
// Transport address
// ---------------------------------------------------------------------------

/// Network endpoint of a peer, compared by `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportAddress {
    pub host: String,
    pub port: u16,
}

impl TransportAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host:port"`. The host part is kept as text.
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// Resolve to a socket address. Only literal IP hosts are accepted.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, TransportError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| TransportError::InvalidAddress(self.to_string()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(sa: SocketAddr) -> Self {
        Self::new(sa.ip().to_string(), sa.port())
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Link class of a peer connection; doubles as the protocol selector byte
/// of registration datagrams (0 = unreliable, 1 = reliable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LinkKind {
    /// One message per datagram, no framing.
    Datagram = 0,
    /// Byte stream carrying marker-delimited frames.
    #[default]
    Stream = 1,
}

impl LinkKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Datagram),
            1 => Some(Self::Stream),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Unreliable endpoint that receives advertisements and sends announcements.
pub trait DatagramEndpoint: Send {
    /// Receive one datagram into `buf`; `Ok(None)` when nothing is pending.
    fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, TransportAddress)>, TransportError>;

    fn send_to(&mut self, data: &[u8], addr: &TransportAddress) -> Result<(), TransportError>;

    fn local_addr(&self) -> Result<TransportAddress, TransportError>;
}

/// An established connection to one peer.
pub trait PeerLink: Send {
    fn kind(&self) -> LinkKind;

    fn remote(&self) -> &TransportAddress;

    /// Read available bytes (stream) or one datagram; `Ok(None)` when idle.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    /// Send one message payload. Stream links wrap it in a frame and keep
    /// whatever the socket does not take for a later [`PeerLink::flush`].
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Drive an outbound connect that is still in flight; `Ok(true)` once
    /// the link is established.
    fn poll_connect(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    /// Write out bytes queued by earlier sends.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Bytes accepted by `send` but not yet written to the socket.
    fn pending_bytes(&self) -> usize {
        0
    }
}

/// Listener producing inbound reliable links.
pub trait StreamAcceptor: Send {
    fn accept(&mut self) -> Result<Option<Box<dyn PeerLink>>, TransportError>;

    fn local_addr(&self) -> Result<TransportAddress, TransportError>;
}

/// Factory for endpoints and links. Swapped out in tests.
pub trait Connector: Send + Sync {
    fn bind_discovery(
        &self,
        addr: &TransportAddress,
    ) -> Result<Box<dyn DatagramEndpoint>, TransportError>;

    fn listen(&self, addr: &TransportAddress) -> Result<Box<dyn StreamAcceptor>, TransportError>;

    fn connect(
        &self,
        addr: &TransportAddress,
        kind: LinkKind,
    ) -> Result<Box<dyn PeerLink>, TransportError>;
}

// ---------------------------------------------------------------------------
// Socket-backed implementations
// ---------------------------------------------------------------------------

/// Connector over real sockets. Sockets are built with `socket2`; TCP
/// connects are started non-blocking and completed by `poll_connect`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetConnector;

fn udp_socket(bind: SocketAddr, reuse: bool) -> io::Result<socket2::Socket> {
    let domain = if bind.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn recv_uninit(
    socket: &socket2::Socket,
    buf: &mut [u8],
) -> io::Result<(usize, socket2::SockAddr)> {
    // SAFETY: u8 and MaybeUninit<u8> share layout; socket2 only writes into the slice.
    let buf_ref = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_from(buf_ref)
}

impl Connector for NetConnector {
    fn bind_discovery(
        &self,
        addr: &TransportAddress,
    ) -> Result<Box<dyn DatagramEndpoint>, TransportError> {
        let sa = addr.to_socket_addr()?;
        let socket = udp_socket(sa, true).map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;
        Ok(Box::new(UdpEndpoint { socket }))
    }

    fn listen(&self, addr: &TransportAddress) -> Result<Box<dyn StreamAcceptor>, TransportError> {
        let sa = addr.to_socket_addr()?;
        let listener = TcpListener::bind(sa).map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        Ok(Box::new(TcpAcceptor { listener }))
    }

    fn connect(
        &self,
        addr: &TransportAddress,
        kind: LinkKind,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        let sa = addr.to_socket_addr()?;
        match kind {
            LinkKind::Stream => {
                // Non-blocking connect: completion is picked up by poll_connect.
                let socket = socket2::Socket::new(
                    socket2::Domain::for_address(sa),
                    socket2::Type::STREAM,
                    Some(socket2::Protocol::TCP),
                )?;
                socket.set_nonblocking(true)?;
                let connecting = match socket.connect(&sa.into()) {
                    Ok(()) => false,
                    Err(ref e) if connect_in_progress(e) => true,
                    Err(e) => return Err(e.into()),
                };
                Ok(Box::new(TcpLink::new(socket.into(), addr.clone(), connecting)?))
            }
            LinkKind::Datagram => {
                let any: SocketAddr = if sa.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = udp_socket(any, false)?;
                socket.connect(&sa.into())?;
                Ok(Box::new(UdpLink {
                    socket,
                    remote: addr.clone(),
                }))
            }
        }
    }
}

/// Discovery endpoint on a non-blocking UDP socket.
pub struct UdpEndpoint {
    socket: socket2::Socket,
}

impl DatagramEndpoint for UdpEndpoint {
    fn recv_from(
        &mut self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, TransportAddress)>, TransportError> {
        match recv_uninit(&self.socket, buf) {
            Ok((n, from)) => {
                let from = from
                    .as_socket()
                    .ok_or_else(|| TransportError::InvalidAddress("non-IP sender".into()))?;
                Ok(Some((n, from.into())))
            }
            Err(ref e) if would_block(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send_to(&mut self, data: &[u8], addr: &TransportAddress) -> Result<(), TransportError> {
        let sa: socket2::SockAddr = addr.to_socket_addr()?.into();
        self.socket.send_to(data, &sa)?;
        Ok(())
    }

    fn local_addr(&self) -> Result<TransportAddress, TransportError> {
        let sa = self
            .socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| TransportError::InvalidAddress("non-IP local address".into()))?;
        Ok(sa.into())
    }
}

/// Connected UDP socket: one message per datagram.
pub struct UdpLink {
    socket: socket2::Socket,
    remote: TransportAddress,
}

impl PeerLink for UdpLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Datagram
    }

    fn remote(&self) -> &TransportAddress {
        &self.remote
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match recv_uninit(&self.socket, buf) {
            Ok((n, _)) => Ok(Some(n)),
            Err(ref e) if would_block(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.socket.send(payload)?;
        Ok(())
    }
}

/// Non-blocking TCP connection carrying framed messages.
///
/// Frames are queued and written as far as the socket allows; a partially
/// written frame is finished before the next one starts, so a full socket
/// buffer delays frames but never splits or drops them.
pub struct TcpLink {
    stream: TcpStream,
    remote: TransportAddress,
    /// Outbound connect not yet confirmed.
    connecting: bool,
    send_queue: VecDeque<Vec<u8>>,
    /// Frame being written and the offset reached.
    pending_send: Option<(Vec<u8>, usize)>,
    queued_bytes: usize,
}

impl TcpLink {
    /// Wrap an established stream (accepted or connected).
    pub fn from_stream(stream: TcpStream, remote: TransportAddress) -> Result<Self, TransportError> {
        Self::new(stream, remote, false)
    }

    fn new(stream: TcpStream, remote: TransportAddress, connecting: bool) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            remote,
            connecting,
            send_queue: VecDeque::new(),
            pending_send: None,
            queued_bytes: 0,
        })
    }

    /// Check whether the in-flight connect finished.
    fn establish(&mut self) -> Result<bool, TransportError> {
        if !self.connecting {
            return Ok(true);
        }
        if let Some(e) = self.stream.take_error()? {
            return Err(e.into());
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connecting = false;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn flush_queue(&mut self) -> Result<(), TransportError> {
        if !self.establish()? {
            return Ok(());
        }
        loop {
            if self.pending_send.is_none() {
                match self.send_queue.pop_front() {
                    Some(frame) => self.pending_send = Some((frame, 0)),
                    None => return Ok(()),
                }
            }
            let Some((frame, offset)) = self.pending_send.as_mut() else {
                return Ok(());
            };
            match self.stream.write(&frame[*offset..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    *offset += n;
                    self.queued_bytes -= n;
                    if *offset == frame.len() {
                        self.pending_send = None;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl PeerLink for TcpLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Stream
    }

    fn remote(&self) -> &TransportAddress {
        &self.remote
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        if !self.establish()? {
            return Ok(None);
        }
        match self.stream.read(buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(Some(n)),
            Err(ref e) if would_block(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = framing::encode_frame(payload)?;
        self.queued_bytes += frame.len();
        self.send_queue.push_back(frame);
        self.flush_queue()
    }

    fn poll_connect(&mut self) -> Result<bool, TransportError> {
        if !self.establish()? {
            return Ok(false);
        }
        self.flush_queue()?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.flush_queue()
    }

    fn pending_bytes(&self) -> usize {
        self.queued_bytes
    }
}

/// Non-blocking TCP listener.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl StreamAcceptor for TcpAcceptor {
    fn accept(&mut self) -> Result<Option<Box<dyn PeerLink>>, TransportError> {
        match self.listener.accept() {
            Ok((stream, addr)) => Ok(Some(Box::new(TcpLink::from_stream(stream, addr.into())?))),
            Err(ref e) if would_block(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> Result<TransportAddress, TransportError> {
        Ok(self.listener.local_addr()?.into())
    }
}

// ---------------------------------------------------------------------------
// In-memory network (tests)
// ---------------------------------------------------------------------------
