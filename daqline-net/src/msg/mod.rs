//! Text protocol spoken over control connections.
//!
//! Run control sends [`Command`]s, nodes answer with [`Status`] messages.
//! Both travel as UTF-8 text in `Bytes` frames.
//!
//! [`Command`]: enum.Command.html
//! [`Status`]: struct.Status.html

mod command;
mod status;

pub use command::Command;
pub use status::{Status, TAG_DATA_LOST, TAG_EVENT, TAG_FILEBYTES, TAG_RUN, TAG_SERVER};

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::{Error, Result};

/// Kind of a node, declared in the connection handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Producer,
    DataCollector,
    LogCollector,
    Monitor,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Producer => "Producer",
            Self::DataCollector => "DataCollector",
            Self::LogCollector => "LogCollector",
            Self::Monitor => "Monitor",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NodeKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Producer" => Ok(Self::Producer),
            "DataCollector" => Ok(Self::DataCollector),
            "LogCollector" => Ok(Self::LogCollector),
            "Monitor" => Ok(Self::Monitor),
            _ => Err(Error::Other(format!("unknown node kind: {}", s))),
        }
    }
}

/// State of a node in the run lifecycle.
///
/// Ordering goes from least to most advanced, with `Error` sorting lowest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Error,
    Uninitialised,
    Initialised,
    Configured,
    Running,
    Terminated,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "ERROR",
            Self::Uninitialised => "UNINITIALISED",
            Self::Initialised => "INITIALISED",
            Self::Configured => "CONFIGURED",
            Self::Running => "RUNNING",
            Self::Terminated => "TERMINATED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NodeState {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ERROR" => Ok(Self::Error),
            "UNINITIALISED" => Ok(Self::Uninitialised),
            "INITIALISED" => Ok(Self::Initialised),
            "CONFIGURED" => Ok(Self::Configured),
            "RUNNING" => Ok(Self::Running),
            "TERMINATED" => Ok(Self::Terminated),
            _ => Err(Error::InvalidStatus(format!("unknown state: {}", s))),
        }
    }
}
