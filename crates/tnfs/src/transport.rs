//! Byte transports carrying TNFS messages.
//!
//! TNFS is datagram oriented: each request and each reply is one UDP datagram.
//! Over TCP the same messages are written back to back, so replies are framed by
//! parsing them (see [`ReplyFrames`]).

use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::{Bytes, BytesMut},
    futures::sink::SinkExt,
    log::debug,
    tokio::net::{TcpStream, UdpSocket, lookup_host},
    tokio_stream::StreamExt,
    tokio_util::codec::{Decoder, Encoder, Framed},
};

use crate::{
    error::Error,
    fcall::{MAX_MESSAGE_SIZE, TNFS_PORT},
    serialize,
    utils::{self, Result},
};

/// Reply wait used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Moves whole encoded messages to and from the server
///
/// `send` takes one encoded request; `recv` yields one encoded reply. Neither
/// applies a timeout; the session bounds `recv` itself.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;
    async fn recv(&mut self) -> io::Result<Bytes>;
}

/// Resolve `host:port`, preferring the first address returned
async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io_err!(NotFound, format!("{}: no address found", host)))
}

/// A connected UDP socket, one datagram per message
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(host: &str, port: u16) -> io::Result<UdpTransport> {
        let peer = resolve(host, port).await?;
        let local: SocketAddr = match peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        debug!("udp {} -> {}", socket.local_addr()?, peer);
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        let sent = self.socket.send(&frame).await?;
        if sent != frame.len() {
            return res!(io_err!(WriteZero, "datagram truncated on send"));
        }
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(MAX_MESSAGE_SIZE);
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf.freeze())
    }
}

/// Splits a TCP byte stream into replies
///
/// A reply carries no length prefix, so the decoder parses the buffered bytes and
/// waits for more while the parse runs out of input. `Stat` replies are only
/// complete once their owner names have arrived.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplyFrames;

impl Decoder for ReplyFrames {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match serialize::reply_len(&src[..])? {
            Some(len) => Ok(Some(src.split_to(len).freeze())),
            None => {
                src.reserve(MAX_MESSAGE_SIZE);
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for ReplyFrames {
    type Error = Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// A TCP stream carrying back to back messages
#[derive(Debug)]
pub struct TcpTransport {
    framed: Framed<TcpStream, ReplyFrames>,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16) -> io::Result<TcpTransport> {
        let peer = resolve(host, port).await?;
        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        debug!("tcp {} -> {}", stream.local_addr()?, peer);
        Ok(TcpTransport {
            framed: Framed::new(stream, ReplyFrames),
        })
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.framed.send(frame).await.map_err(into_io)
    }

    async fn recv(&mut self) -> io::Result<Bytes> {
        match self.framed.next().await {
            Some(frame) => frame.map_err(into_io),
            None => res!(io_err!(UnexpectedEof, "connection closed by server")),
        }
    }
}

/// Either transport, chosen at run time from a [`Config`]
#[derive(Debug)]
pub enum Connection {
    Udp(UdpTransport),
    Tcp(TcpTransport),
}

#[async_trait]
impl Transport for Connection {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        match self {
            Connection::Udp(t) => t.send(frame).await,
            Connection::Tcp(t) => t.send(frame).await,
        }
    }

    async fn recv(&mut self) -> io::Result<Bytes> {
        match self {
            Connection::Udp(t) => t.recv().await,
            Connection::Tcp(t) => t.recv().await,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Protocol> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            _ => Err(Error::InvalidAddress(format!("unsupported protocol {:?}", s))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("udp"),
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// Where and how to reach a TNFS server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Longest wait for a single reply
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            protocol: Protocol::Udp,
            host: "localhost".to_owned(),
            port: TNFS_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::InvalidAddress(format!("invalid port {:?}", port)))
}

impl Config {
    pub fn new(host: impl Into<String>) -> Config {
        Config {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Parse `proto!host!port` or `host[:port]`
    pub fn parse(addr: &str) -> Result<Config> {
        let (protocol, host, port) = match utils::parse_proto(addr) {
            Some((proto, host, port)) => (proto.parse::<Protocol>()?, host, Some(port)),
            None => {
                let (host, port) = utils::split_host_port(addr)
                    .ok_or_else(|| Error::InvalidAddress(addr.to_owned()))?;
                (Protocol::Udp, host, port)
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidAddress(addr.to_owned()));
        }

        Ok(Config {
            protocol,
            host: host.to_owned(),
            port: port.map(parse_port).transpose()?.unwrap_or(TNFS_PORT),
            ..Default::default()
        })
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Config {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Config {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Config {
        self.timeout = timeout;
        self
    }

    /// Open the transport described by this configuration
    pub async fn connect(&self) -> Result<Connection> {
        Ok(match self.protocol {
            Protocol::Udp => Connection::Udp(UdpTransport::connect(&self.host, self.port).await?),
            Protocol::Tcp => Connection::Tcp(TcpTransport::connect(&self.host, self.port).await?),
        })
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}!{}", self.protocol, self.host, self.port)
    }
}
