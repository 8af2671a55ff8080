//! This library provides the networking side of `daqline` data acquisition.
//!
//! This includes a simple framed TCP transport, the text based command and
//! status protocol spoken between nodes and the run controller, and the
//! higher level constructs built on top of it.
//!
//!
//! # Networking constructs overview
//!
//! A `daqline` deployment is made of a single `RunControl` and any number of
//! *nodes*. Every node keeps one control connection to the run controller,
//! over which it receives commands (`CONFIGURE`, `START`, ...) and pushes
//! status messages back.
//!
//! Nodes come in a few kinds. *Producers* read out hardware and emit events,
//! *data collectors* receive events from producers over a separate data
//! connection, merge the streams and write them to a file. The generic
//! [`Node`] drives any kind through the shared run lifecycle, delegating the
//! actual work to a user supplied [`Lifecycle`] implementation.
//!
//! Producers learn where to send their data from the run controller. Each
//! data collector reports its listening address in a status tag, which the
//! run controller relays to producers with a `DATA` command. A log collector
//! is announced the same way, with `LOG` going to every other node, whose
//! `LogForwarder` then sends it their log records.
//!
//!
//! # Transport
//!
//! `Server` and `Client` sit at the bottom. A `Server` listens for
//! connections and keeps a registry of them, a `Client` makes exactly one.
//! Both report what happens on the wire through a channel of notifications,
//! which callers drain on a thread of their own.
//!
//! Only plain TCP is available, addressed as `tcp://host:port`.
//!
//!
//! # Cancellation
//!
//! Every long running loop takes a [`CancelToken`]. Cancelling a token wakes
//! up all the loops and waits observing it, which then wind down.
//!
//! [`Node`]: node/struct.Node.html
//! [`Lifecycle`]: node/trait.Lifecycle.html
//! [`CancelToken`]: cancel/struct.CancelToken.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod cancel;
pub mod collector;
pub mod log_collector;
pub mod logging;
pub mod msg;
pub mod node;
pub mod producer;
pub mod run_control;
pub mod socket;

mod client;
mod error;
mod server;
mod util;

pub use cancel::CancelToken;
pub use client::{Client, ClientEvent, ClientSender};
pub use collector::{DataCollector, DataCollectorConfig};
pub use error::{Error, Result};
pub use log_collector::{LogCollector, LogCollectorConfig};
pub use logging::{LogForwarder, LogRecord};
pub use msg::{Command, NodeKind, NodeState, Status};
pub use node::{Lifecycle, Node, NodeConfig, NodeContext};
pub use producer::DataSender;
pub use run_control::{NodeRecord, RunControl, RunControlConfig};
pub use server::{Server, ServerEvent};
pub use socket::{
    CompositeSocketAddress, ConnectionId, ConnectionInfo, ConnectionState, SocketConfig,
    Transport,
};
