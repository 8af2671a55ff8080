use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out")]
    TimedOut,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("outbound queue full")]
    SendQueueFull,
    #[error("delivery failed: {}", describe_failures(.0))]
    DeliveryFailed(Vec<(String, Error)>),

    #[error("cancelled")]
    Cancelled,
    #[error("nodes not configured: {0}")]
    NotConfigured(String),
    #[error("configure timed out waiting for: {0}")]
    ConfigureTimeout(String),
    #[error("node fault: {0}")]
    NodeFault(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("other: {0}")]
    Other(String),

    #[error("failed parsing int: {0}")]
    IntParseError(#[from] std::num::ParseIntError),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("core error: {0}")]
    CoreError(#[from] daqline_core::Error),
}

fn describe_failures(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(addr, e)| format!("{} ({})", addr, e))
        .collect::<Vec<_>>()
        .join(", ")
}
