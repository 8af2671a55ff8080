//! Forwarding of log records to a log collector.
//!
//! A [`LogForwarder`] is a `log::Log` implementation meant to sit next to
//! the application's regular logger. It stays silent until it's connected
//! to a log collector, which nodes do when run control sends them `LOG`.
//! Records are queued without blocking; when the queue is full they are
//! dropped and counted.
//!
//! [`LogForwarder`]: struct.LogForwarder.html

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{LevelFilter, Log, Metadata, Record};

use crate::client::Client;
use crate::socket::SocketConfig;
use crate::util::lock;
use crate::{CancelToken, Error, Result};

/// Records from these targets are never forwarded, sending them would log
/// again.
const TRANSPORT_TARGETS: [&str; 3] = [
    "daqline_net::socket",
    "daqline_net::client",
    "daqline_net::server",
];

pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Log record as it travels to the log collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub level: String,
    /// `<Kind>.<name>` of the node the record comes from
    pub sender: String,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    pub fn from_record(record: &Record, sender: &str) -> Self {
        Self {
            time: Utc::now(),
            level: record.level().to_string(),
            sender: sender.to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:<5} [{}] {}: {}",
            self.time.format(TIME_FORMAT),
            self.level,
            self.sender,
            self.target,
            self.message
        )
    }
}

struct Link {
    addr: String,
    sender: String,
    client: Client,
}

struct Inner {
    level: LevelFilter,
    link: Mutex<Option<Link>>,
    dropped: AtomicU64,
}

/// Sends log records of this process to a log collector.
///
/// Clones share the connection, so one clone can be installed as (part of)
/// the global logger while another is handed to the node that connects it.
#[derive(Clone)]
pub struct LogForwarder {
    inner: Arc<Inner>,
}

impl LogForwarder {
    /// Creates a disconnected forwarder passing records up to `level`.
    pub fn new(level: LevelFilter) -> Self {
        Self {
            inner: Arc::new(Inner {
                level,
                link: Mutex::new(None),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.inner.level
    }

    /// Connects to the log collector at `addr`, replacing any previous
    /// connection. Records are labelled `<kind>.<name>`.
    pub fn connect(
        &self,
        addr: &str,
        kind: &str,
        name: &str,
        socket: SocketConfig,
        token: &CancelToken,
    ) -> Result<()> {
        let client = Client::connect(addr, kind, name, socket, token)?;
        let sender = if name.is_empty() {
            kind.to_string()
        } else {
            format!("{}.{}", kind, name)
        };
        let link = Link {
            addr: client.address().to_string(),
            sender,
            client,
        };
        // dropped outside the lock
        let previous = lock(&self.inner.link).replace(link);
        drop(previous);
        info!("forwarding log records to {}", addr);
        Ok(())
    }

    pub fn disconnect(&self) {
        let previous = lock(&self.inner.link).take();
        drop(previous);
    }

    /// Address of the log collector records go to.
    pub fn address(&self) -> Option<String> {
        lock(&self.inner.link).as_ref().map(|l| l.addr.clone())
    }

    /// Number of records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn forward(&self, record: &Record) {
        let mut link = lock(&self.inner.link);
        let result = match link.as_ref() {
            Some(l) => LogRecord::from_record(record, &l.sender)
                .to_bytes()
                .and_then(|bytes| l.client.sender().try_send(bytes)),
            None => return,
        };
        match result {
            Ok(()) => (),
            Err(Error::SendQueueFull) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // the collector is gone
                let gone = link.take();
                drop(link);
                drop(gone);
            }
        }
    }
}

impl Log for LogForwarder {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.inner.level
            && !TRANSPORT_TARGETS
                .iter()
                .any(|t| metadata.target().starts_with(t))
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.forward(record);
        }
    }

    fn flush(&self) {}
}

impl Debug for LogForwarder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogForwarder")
            .field("level", &self.inner.level)
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
use crate::{Server, ServerEvent};
#[cfg(test)]
use std::time::Duration;

#[test]
fn records_reach_the_collector_filtered() {
    use log::Level;

    let token = CancelToken::new();
    let server = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let forwarder = LogForwarder::new(LevelFilter::Info);

    // nothing happens before connecting
    forwarder.log(
        &Record::builder()
            .args(format_args!("too early"))
            .level(Level::Error)
            .target("daqline_cli::producer")
            .build(),
    );
    forwarder
        .connect(&server.address(), "Producer", "tel1", SocketConfig::default(), &token)
        .unwrap();
    assert_eq!(forwarder.address(), Some(server.address()));

    forwarder.log(
        &Record::builder()
            .args(format_args!("trigger {} lost", 12))
            .level(Level::Warn)
            .target("daqline_cli::producer")
            .build(),
    );
    forwarder.log(
        &Record::builder()
            .args(format_args!("too verbose"))
            .level(Level::Debug)
            .target("daqline_cli::producer")
            .build(),
    );
    forwarder.log(
        &Record::builder()
            .args(format_args!("wrote frame"))
            .level(Level::Error)
            .target("daqline_net::socket::tcp")
            .build(),
    );

    let mut records = Vec::new();
    while let Ok(event) = server.events().recv_timeout(Duration::from_millis(300)) {
        if let ServerEvent::Receive(_, bytes) = event {
            records.push(LogRecord::from_bytes(&bytes).unwrap());
        }
    }
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sender, "Producer.tel1");
    assert_eq!(records[0].level, "WARN");
    assert_eq!(records[0].message, "trigger 12 lost");
    assert!(records[0].to_string().ends_with("WARN  [Producer.tel1] daqline_cli::producer: trigger 12 lost"));
    assert_eq!(forwarder.dropped(), 0);
    token.cancel();
}
