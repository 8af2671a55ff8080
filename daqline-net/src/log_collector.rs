//! Log collector node.
//!
//! A [`LogCollector`] listens on its own address, reported as the `_SERVER`
//! status tag. Run control relays it to every other node with `LOG`, after
//! which their [`LogForwarder`]s send log records here. Records are
//! appended to a daily file in the configured directory.
//!
//! [`LogCollector`]: struct.LogCollector.html
//! [`LogForwarder`]: ../logging/struct.LogForwarder.html

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use fnv::FnvHashMap;

use crate::logging::{LogRecord, TIME_FORMAT};
use crate::msg::{Status, TAG_SERVER};
use crate::node::{Lifecycle, NodeContext};
use crate::server::{Server, ServerEvent};
use crate::socket::{ConnectionId, SocketConfig};
use crate::util::lock;
use crate::{CancelToken, Result};

/// Number of records kept in memory for display.
const RECENT_RECORDS: usize = 100;

/// Number of records written since startup.
pub const TAG_MESSAGES: &str = "MESSAGES";

#[derive(Clone, Debug)]
pub struct LogCollectorConfig {
    /// Address nodes send their records to
    pub listen_address: String,
    /// Directory the daily log files go to
    pub directory: PathBuf,
    pub socket: SocketConfig,
}

impl Default for LogCollectorConfig {
    fn default() -> Self {
        Self {
            listen_address: "tcp://0.0.0.0:0".to_string(),
            directory: PathBuf::from("logs"),
            socket: SocketConfig::default(),
        }
    }
}

struct Journal {
    file: File,
    messages: u64,
    recent: VecDeque<LogRecord>,
    /// `<Kind>.<name>` of every connected sender
    senders: FnvHashMap<ConnectionId, String>,
}

impl Journal {
    fn write(&mut self, record: LogRecord) {
        if let Err(e) = writeln!(self.file, "{}", record).and_then(|_| self.file.flush()) {
            error!("failed writing log record: {}", e);
        }
        self.messages += 1;
        if self.recent.len() == RECENT_RECORDS {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }
}

pub struct LogCollector {
    server: Arc<Server>,
    journal: Arc<Mutex<Journal>>,
    path: PathBuf,
    token: CancelToken,
    log_thread: Option<JoinHandle<()>>,
}

impl LogCollector {
    /// Opens today's log file for appending and starts listening.
    pub fn new(config: LogCollectorConfig, token: &CancelToken) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;
        let path = config
            .directory
            .join(Utc::now().format("%Y-%m-%d.log").to_string());
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "*** log collector started at {} ***",
            Utc::now().format(TIME_FORMAT)
        )?;

        let token = token.child();
        let server = Arc::new(Server::listen(&config.listen_address, config.socket, &token)?);
        info!(
            "collecting logs at {} into {}",
            server.address(),
            path.display()
        );
        let journal = Arc::new(Mutex::new(Journal {
            file,
            messages: 0,
            recent: VecDeque::new(),
            senders: FnvHashMap::default(),
        }));

        let (_server, _journal, _token) = (server.clone(), journal.clone(), token.clone());
        let log_thread = thread::Builder::new()
            .name("log-collector".to_string())
            .spawn(move || log_loop(&_server, &_journal, &_token))?;

        Ok(Self {
            server,
            journal,
            path,
            token,
            log_thread: Some(log_thread),
        })
    }

    /// Address nodes should send records to.
    pub fn address(&self) -> String {
        self.server.address()
    }

    /// File records are written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records received so far.
    pub fn messages(&self) -> u64 {
        lock(&self.journal).messages
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<LogRecord> {
        lock(&self.journal).recent.iter().cloned().collect()
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        self.server.shutdown();
        if let Some(handle) = self.log_thread.take() {
            let _ = handle.join();
            let mut journal = lock(&self.journal);
            let _ = writeln!(
                journal.file,
                "*** log collector stopped at {} ***",
                Utc::now().format(TIME_FORMAT)
            );
        }
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Lifecycle for LogCollector {
    fn terminate(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn status(&self, _ctx: &NodeContext, status: &mut Status) {
        status.set_tag(TAG_SERVER, self.server.address());
        status.set_tag(TAG_MESSAGES, self.messages());
    }
}

fn log_loop(server: &Server, journal: &Mutex<Journal>, token: &CancelToken) {
    let events = server.events().clone();
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(journal, event),
                Err(_) => break,
            },
            recv(token.receiver()) -> _ => break,
        }
    }
    debug!("log collector loop finished");
}

fn handle_event(journal: &Mutex<Journal>, event: ServerEvent) {
    match event {
        ServerEvent::Connect(info) => {
            let sender = if info.name.is_empty() {
                info.peer_type.clone()
            } else {
                format!("{}.{}", info.peer_type, info.name)
            };
            debug!("{} sends log records", sender);
            lock(journal).senders.insert(info.id, sender);
        }
        ServerEvent::Receive(id, bytes) => match LogRecord::from_bytes(&bytes) {
            Ok(mut record) => {
                let mut journal = lock(journal);
                // the connection's identity wins over what the record says
                if let Some(sender) = journal.senders.get(&id) {
                    record.sender = sender.clone();
                }
                journal.write(record);
            }
            Err(e) => warn!("dropping bad log record from connection {}: {}", id, e),
        },
        ServerEvent::Disconnect(info) => {
            if let Some(sender) = lock(journal).senders.remove(&info.id) {
                debug!("{} stopped sending log records", sender);
            }
        }
    }
}

#[test]
fn forwarded_records_end_up_in_the_file() {
    use std::time::{Duration, Instant};

    use log::{Level, LevelFilter, Log, Record};

    use crate::logging::LogForwarder;

    let dir = std::env::temp_dir().join(format!("daqline-logs-{}", std::process::id()));
    let token = CancelToken::new();
    let collector = LogCollector::new(
        LogCollectorConfig {
            listen_address: "tcp://127.0.0.1:0".to_string(),
            directory: dir.clone(),
            ..LogCollectorConfig::default()
        },
        &token,
    )
    .unwrap();

    let forwarder = LogForwarder::new(LevelFilter::Info);
    forwarder
        .connect(&collector.address(), "Producer", "tel1", SocketConfig::default(), &token)
        .unwrap();
    for n in 0..3 {
        forwarder.log(
            &Record::builder()
                .args(format_args!("spill {} done", n))
                .level(Level::Info)
                .target("daqline_cli::producer")
                .build(),
        );
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while collector.messages() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(collector.messages(), 3);
    let recent = collector.recent();
    assert_eq!(recent[2].message, "spill 2 done");
    assert_eq!(recent[2].sender, "Producer.tel1");

    let path = collector.path().to_path_buf();
    drop(collector);
    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("*** log collector started at"));
    assert!(lines[1].ends_with("INFO  [Producer.tel1] daqline_cli::producer: spill 0 done"));
    assert!(lines[4].starts_with("*** log collector stopped at"));
    let _ = fs::remove_dir_all(&dir);
    token.cancel();
}
