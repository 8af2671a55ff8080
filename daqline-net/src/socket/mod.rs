//! Socket layer shared by `Server` and `Client`.
//!
//! Every frame on the wire is a little-endian `u32` length followed by a
//! bincode encoded [`SocketEvent`]. The first frame a client sends is always
//! `Hello`, declaring its peer type and name. The server answers with
//! `Welcome` once the connection is registered and announced.
//!
//! [`SocketEvent`]: struct.SocketEvent.html

use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{Error, Result};

pub(crate) mod tcp;

/// Stable handle of a connection, unique among live connections of a
/// server.
pub type ConnectionId = u32;

#[derive(Copy, Clone, Debug)]
pub struct SocketConfig {
    /// Maximum number of frames waiting to be written, per connection
    pub send_queue_capacity: usize,
    /// How long a send blocks on a full queue before failing
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    /// Time a fresh connection has to deliver its `Hello`
    pub handshake_timeout: Duration,
    /// Silence on a connection after which it's considered lost
    pub idle_timeout: Option<Duration>,
    /// Idle time after which a heartbeat frame is sent
    pub heartbeat_interval: Option<Duration>,
    /// Granularity of blocking reads and accept polling
    pub poll_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 1024,
            send_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            idle_timeout: Some(Duration::from_secs(10)),
            heartbeat_interval: Some(Duration::from_secs(1)),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketEvent {
    pub type_: SocketEventType,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl SocketEvent {
    pub fn new(type_: SocketEventType) -> Self {
        Self {
            type_,
            bytes: Default::default(),
        }
    }

    pub fn new_bytes(bytes: Vec<u8>) -> Self {
        Self {
            type_: SocketEventType::Bytes,
            bytes,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum SocketEventType {
    Bytes,
    Heartbeat,
    Hello,
    Disconnect,
    /// Server's answer to `Hello`
    Welcome,
}

/// Payload of the `Hello` frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct Hello {
    pub peer_type: String,
    pub name: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Connected,
    Disconnected,
    Error,
}

/// Connection as seen by the server.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub transport: Transport,
    /// Name the peer declared in its `Hello`
    pub name: String,
    /// Peer type the peer declared in its `Hello`
    pub peer_type: String,
    /// Remote address
    pub addr: String,
    pub state: ConnectionState,
}

/// List of possible network transports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transport {
    /// Basic TCP transport built with rust's standard library
    Tcp,
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            _ => Err(Error::TransportUnavailable(s.to_string())),
        }
    }
}

/// Address including the transport, `tcp://host:port`.
///
/// The transport part may be left out, in which case it's `tcp`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeSocketAddress {
    pub transport: Transport,
    /// `host:port` part
    pub address: String,
}

impl CompositeSocketAddress {
    /// Resolves the host part, returning the first address found.
    pub fn resolve(&self) -> Result<SocketAddr> {
        self.address
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", self.address, e)))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("{}: no addresses found", self.address)))
    }
}

impl FromStr for CompositeSocketAddress {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (transport, address) = match s.find("://") {
            Some(pos) => (s[..pos].parse()?, &s[pos + 3..]),
            None => (Transport::Tcp, s),
        };
        let port = address
            .rsplit(':')
            .next()
            .filter(|_| address.contains(':'))
            .ok_or_else(|| Error::InvalidAddress(format!("{}: missing port", s)))?;
        port.parse::<u16>()
            .map_err(|_| Error::InvalidAddress(format!("{}: bad port", s)))?;
        Ok(CompositeSocketAddress {
            transport,
            address: address.to_string(),
        })
    }
}

impl Display for CompositeSocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}

#[test]
fn address_parsing() {
    let addr: CompositeSocketAddress = "tcp://127.0.0.1:44000".parse().unwrap();
    assert_eq!(addr.transport, Transport::Tcp);
    assert_eq!(addr.address, "127.0.0.1:44000");
    assert_eq!(addr.to_string(), "tcp://127.0.0.1:44000");

    let bare: CompositeSocketAddress = "localhost:44000".parse().unwrap();
    assert_eq!(bare.to_string(), "tcp://localhost:44000");
    assert!(bare.resolve().is_ok());

    assert!(matches!(
        "udp://127.0.0.1:1".parse::<CompositeSocketAddress>(),
        Err(Error::TransportUnavailable(_))
    ));
    assert!(matches!(
        "tcp://127.0.0.1".parse::<CompositeSocketAddress>(),
        Err(Error::InvalidAddress(_))
    ));
}
