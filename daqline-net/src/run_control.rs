//! Run controller.
//!
//! `RunControl` listens for node control connections, tracks the state each
//! node last reported and drives all of them through the run lifecycle by
//! broadcasting commands.
//!
//! Commands are fire-and-forget, with the exception of `configure`, which
//! waits until every node reports `CONFIGURED`. A run is only started once
//! all nodes are configured.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;

use daqline_core::Configuration;

use crate::logging::LogForwarder;
use crate::msg::{Command, NodeKind, NodeState, Status, TAG_DATA_LOST, TAG_SERVER};
use crate::server::{Server, ServerEvent};
use crate::socket::{ConnectionId, ConnectionInfo, ConnectionState, SocketConfig};
use crate::util::lock;
use crate::{CancelToken, Error, Result};

/// Slice in which condition variable waits re-check cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct RunControlConfig {
    /// How long `configure` waits for all nodes to report `CONFIGURED`
    pub configure_timeout: Duration,
    /// Run number preceding the first run
    pub initial_run_n: u32,
    pub socket: SocketConfig,
    /// Connected to the first log collector that reports its address
    pub log_forwarder: Option<LogForwarder>,
}

impl Default for RunControlConfig {
    fn default() -> Self {
        Self {
            configure_timeout: Duration::from_secs(10),
            initial_run_n: 0,
            socket: SocketConfig::default(),
            log_forwarder: None,
        }
    }
}

/// What run control knows about a connected node.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub info: ConnectionInfo,
    /// Declared kind, `None` if the peer type wasn't recognised
    pub kind: Option<NodeKind>,
    /// Last reported state, cleared before each configure
    pub state: Option<NodeState>,
    pub error: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub updated: DateTime<Utc>,
}

impl NodeRecord {
    fn display_name(&self) -> String {
        match self.kind {
            Some(kind) => format!("{}.{}", kind, self.info.name),
            None => format!("{}.{}", self.info.peer_type, self.info.name),
        }
    }

    fn is_connected(&self) -> bool {
        self.info.state == ConnectionState::Connected
    }
}

#[derive(Default)]
struct Records {
    nodes: FnvHashMap<ConnectionId, NodeRecord>,
    /// Set while a configure is waiting for reports
    configuring: bool,
}

/// Listen address reported by a data or log collector.
struct Announced {
    id: ConnectionId,
    kind: NodeKind,
    addr: String,
}

struct RunState {
    run_n: u32,
    running: bool,
    announced: Vec<Announced>,
}

struct Shared {
    records: Mutex<Records>,
    changed: Condvar,
    run: Mutex<RunState>,
    faults: Mutex<Vec<String>>,
}

impl Shared {
    fn fault(&self, text: String) {
        error!("{}", text);
        lock(&self.faults).push(text);
    }
}

pub struct RunControl {
    server: Arc<Server>,
    shared: Arc<Shared>,
    config: RunControlConfig,
    token: CancelToken,
    event_thread: Option<JoinHandle<()>>,
}

impl RunControl {
    /// Starts listening for nodes at `addr`.
    pub fn listen(addr: &str, config: RunControlConfig, token: &CancelToken) -> Result<Self> {
        let token = token.child();
        let server = Arc::new(Server::listen(addr, config.socket, &token)?);
        let shared = Arc::new(Shared {
            records: Mutex::new(Records::default()),
            changed: Condvar::new(),
            run: Mutex::new(RunState {
                run_n: config.initial_run_n,
                running: false,
                announced: Vec::new(),
            }),
            faults: Mutex::new(Vec::new()),
        });

        let (_server, _shared, _token) = (server.clone(), shared.clone(), token.clone());
        let _config = config.clone();
        let event_thread = thread::Builder::new()
            .name("run-control".to_string())
            .spawn(move || event_loop(&_server, &_shared, &_config, &_token))?;

        Ok(Self {
            server,
            shared,
            config,
            token,
            event_thread: Some(event_thread),
        })
    }

    /// Address nodes connect to.
    pub fn address(&self) -> String {
        self.server.address()
    }

    /// Number of the current, or last, run.
    pub fn run_n(&self) -> u32 {
        lock(&self.shared.run).run_n
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.run).running
    }

    /// Snapshot of all tracked nodes, ordered by connection id.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = lock(&self.shared.records)
            .nodes
            .values()
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.info.id);
        nodes
    }

    /// Lowest state across tracked nodes that reported one.
    pub fn aggregate_state(&self) -> Option<NodeState> {
        lock(&self.shared.records)
            .nodes
            .values()
            .filter_map(|n| n.state)
            .min()
    }

    /// Takes the faults collected since the last call.
    pub fn faults(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.shared.faults))
    }

    /// Waits until at least `count` nodes are connected and reported a
    /// state.
    pub fn wait_for_nodes(&self, count: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut records = lock(&self.shared.records);
        loop {
            let ready = records
                .nodes
                .values()
                .filter(|n| n.is_connected() && n.state.is_some())
                .count();
            if ready >= count {
                return Ok(());
            }
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut);
            }
            records = self
                .shared
                .changed
                .wait_timeout(records, (deadline - now).min(WAIT_SLICE))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn initialise(&self, config: &Configuration) -> Result<()> {
        info!("initialising with {}", display_config_name(config));
        self.broadcast(&Command::Initialise(config.clone()))
    }

    /// Configures all nodes, waiting until every one of them reports
    /// `CONFIGURED`.
    pub fn configure(&self, config: &Configuration) -> Result<()> {
        info!("configuring with {}", display_config_name(config));
        {
            let mut records = lock(&self.shared.records);
            // nodes that are gone keep their Error until reset
            for node in records.nodes.values_mut().filter(|n| n.is_connected()) {
                node.state = None;
                node.error = None;
            }
            records.configuring = true;
        }
        let result = self
            .broadcast(&Command::Configure(config.clone()))
            .and_then(|_| self.wait_configured());
        lock(&self.shared.records).configuring = false;
        if let Err(e) = &result {
            self.shared.fault(format!("configure failed: {}", e));
        }
        result
    }

    fn wait_configured(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.configure_timeout;
        let mut records = lock(&self.shared.records);
        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let faulty: Vec<String> = records
                .nodes
                .values()
                .filter(|n| n.state == Some(NodeState::Error))
                .map(|n| match &n.error {
                    Some(e) => format!("{} ({})", n.display_name(), e),
                    None => n.display_name(),
                })
                .collect();
            if !faulty.is_empty() {
                return Err(Error::NodeFault(faulty.join(", ")));
            }
            let pending = pending_names(&records, NodeState::Configured);
            if pending.is_empty() {
                debug!("all nodes configured");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConfigureTimeout(pending.join(", ")));
            }
            records = self
                .shared
                .changed
                .wait_timeout(records, (deadline - now).min(WAIT_SLICE))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Starts the next run, returning its number. Fails without
    /// broadcasting anything unless every node reports `CONFIGURED`.
    pub fn start_run(&self) -> Result<u32> {
        let run_n = {
            let records = lock(&self.shared.records);
            let pending = pending_names(&records, NodeState::Configured);
            if !pending.is_empty() {
                return Err(Error::NotConfigured(pending.join(", ")));
            }
            if records.nodes.is_empty() {
                warn!("starting a run with no nodes connected");
            }
            let mut run = lock(&self.shared.run);
            run.run_n += 1;
            run.running = true;
            run.run_n
        };
        info!("starting run {}", run_n);
        self.broadcast(&Command::Start(run_n))?;
        Ok(run_n)
    }

    pub fn stop_run(&self) -> Result<()> {
        let run_n = {
            let mut run = lock(&self.shared.run);
            run.running = false;
            run.run_n
        };
        info!("stopping run {}", run_n);
        self.broadcast(&Command::Stop)
    }

    /// Resets all nodes and forgets the ones that are gone.
    pub fn reset(&self) -> Result<()> {
        lock(&self.shared.run).running = false;
        lock(&self.shared.records)
            .nodes
            .retain(|_, n| n.is_connected());
        info!("resetting");
        self.broadcast(&Command::Reset)
    }

    pub fn terminate(&self) -> Result<()> {
        info!("terminating all nodes");
        lock(&self.shared.run).running = false;
        self.broadcast(&Command::Terminate)
    }

    /// Asks every node for an immediate status push.
    pub fn request_status(&self) -> Result<()> {
        self.broadcast(&Command::Status)
    }

    /// Stops listening and drops all connections.
    pub fn shutdown(&mut self) {
        self.token.cancel();
        self.server.shutdown();
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
    }

    fn broadcast(&self, command: &Command) -> Result<()> {
        debug!("broadcasting {}", command.verb());
        self.server.broadcast(command.to_bytes())
    }
}

impl Drop for RunControl {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn display_config_name(config: &Configuration) -> String {
    match config.name() {
        name if name.is_empty() => "unnamed configuration".to_string(),
        name => format!("configuration {}", name),
    }
}

fn pending_names(records: &Records, wanted: NodeState) -> Vec<String> {
    let mut pending: Vec<(ConnectionId, String)> = records
        .nodes
        .values()
        .filter(|n| n.state != Some(wanted))
        .map(|n| (n.info.id, n.display_name()))
        .collect();
    pending.sort();
    pending.into_iter().map(|(_, name)| name).collect()
}

/// Command telling a node of kind `target` about a collector of kind
/// `source` listening at `addr`, if that node needs to know.
fn relay_for(source: NodeKind, target: Option<NodeKind>, addr: &str) -> Option<Command> {
    match (source, target) {
        (NodeKind::DataCollector, Some(NodeKind::Producer)) => Some(Command::Data(addr.to_string())),
        (NodeKind::LogCollector, Some(kind)) if kind != NodeKind::LogCollector => {
            Some(Command::Log(addr.to_string()))
        }
        _ => None,
    }
}

fn event_loop(server: &Server, shared: &Shared, config: &RunControlConfig, token: &CancelToken) {
    let events = server.events().clone();
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(server, shared, config, token, event),
                Err(_) => break,
            },
            recv(token.receiver()) -> _ => break,
        }
        shared.changed.notify_all();
    }
    debug!("run control event loop finished");
}

fn handle_event(
    server: &Server,
    shared: &Shared,
    config: &RunControlConfig,
    token: &CancelToken,
    event: ServerEvent,
) {
    match event {
        ServerEvent::Connect(info) => {
            let kind = info.peer_type.parse::<NodeKind>().ok();
            if kind.is_none() {
                warn!("connection {} declared unknown type {}", info.id, info.peer_type);
            }
            let record = NodeRecord {
                info: info.clone(),
                kind,
                state: None,
                error: None,
                tags: BTreeMap::new(),
                updated: Utc::now(),
            };
            info!("{} connected from {}", record.display_name(), info.addr);
            lock(&shared.records).nodes.insert(info.id, record);
            let relays: Vec<Command> = lock(&shared.run)
                .announced
                .iter()
                .filter_map(|a| relay_for(a.kind, kind, &a.addr))
                .collect();
            for command in relays {
                send_command(server, info.id, &command);
            }
        }
        ServerEvent::Disconnect(info) => {
            let running = {
                let mut run = lock(&shared.run);
                run.announced.retain(|a| a.id != info.id);
                run.running
            };
            let mut records = lock(&shared.records);
            let busy = running || records.configuring;
            if !busy {
                if let Some(node) = records.nodes.remove(&info.id) {
                    info!("{} disconnected", node.display_name());
                }
                return;
            }
            if let Some(node) = records.nodes.get_mut(&info.id) {
                node.info.state = info.state;
                node.state = Some(NodeState::Error);
                node.error = Some("connection lost".to_string());
                node.updated = Utc::now();
                let text = format!("{} lost its connection", node.display_name());
                shared.fault(text);
            }
        }
        ServerEvent::Receive(id, bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let status = match text.parse::<Status>() {
                Ok(status) => status,
                Err(e) => {
                    warn!("bad status from connection {}: {}", id, e);
                    return;
                }
            };
            let current_run = lock(&shared.run).run_n;
            if let Some(run_n) = status.run_n() {
                if run_n < current_run {
                    debug!("ignoring status for old run {} from {}", run_n, id);
                    return;
                }
            }
            update_record(server, shared, config, token, id, status);
        }
    }
}

fn update_record(
    server: &Server,
    shared: &Shared,
    config: &RunControlConfig,
    token: &CancelToken,
    id: ConnectionId,
    status: Status,
) {
    let (name, kind, previous, previous_lost) = {
        let mut records = lock(&shared.records);
        let node = match records.nodes.get_mut(&id) {
            Some(node) => node,
            None => return,
        };
        let previous = node.state;
        let previous_lost = node.tags.get(TAG_DATA_LOST).cloned();
        node.state = Some(status.state);
        node.error = status.error.clone();
        node.tags = status.tags().clone();
        node.updated = Utc::now();
        (node.display_name(), node.kind, previous, previous_lost)
    };
    if previous != Some(status.state) {
        debug!("{} is now {}", name, status.state);
        if status.state == NodeState::Error {
            shared.fault(format!(
                "{} in error: {}",
                name,
                status.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    if let Some(lost) = status.tag(TAG_DATA_LOST) {
        if previous_lost.as_deref() != Some(lost) {
            shared.fault(format!("{} lost its data connection to {}", name, lost));
        }
    }

    let kind = match kind {
        Some(kind @ NodeKind::DataCollector) | Some(kind @ NodeKind::LogCollector) => kind,
        _ => return,
    };
    let addr = match status.tag(TAG_SERVER) {
        Some(addr) => addr,
        None => return,
    };
    let known = {
        let mut run = lock(&shared.run);
        let known = run.announced.iter().any(|a| a.id == id && a.addr == addr);
        if !known {
            run.announced.retain(|a| a.id != id);
            run.announced.push(Announced {
                id,
                kind,
                addr: addr.to_string(),
            });
        }
        known
    };
    if known {
        return;
    }
    match kind {
        NodeKind::LogCollector => info!("{} collects logs at {}", name, addr),
        _ => info!("{} receives data at {}", name, addr),
    }
    let targets: Vec<(ConnectionId, Command)> = lock(&shared.records)
        .nodes
        .values()
        .filter(|n| n.is_connected())
        .filter_map(|n| relay_for(kind, n.kind, addr).map(|c| (n.info.id, c)))
        .collect();
    for (target, command) in targets {
        send_command(server, target, &command);
    }

    if kind == NodeKind::LogCollector {
        if let Some(forwarder) = &config.log_forwarder {
            if forwarder.address().is_none() {
                if let Err(e) = forwarder.connect(addr, "RunControl", "", config.socket, token) {
                    warn!("failed connecting to log collector at {}: {}", addr, e);
                }
            }
        }
    }
}

fn send_command(server: &Server, id: ConnectionId, command: &Command) {
    if let Err(e) = server.send_to(id, command.to_bytes()) {
        warn!("failed sending {} to connection {}: {}", command.verb(), id, e);
    }
}

#[cfg(test)]
use crate::client::{Client, ClientEvent};

#[cfg(test)]
fn test_control(timeout: Duration) -> (RunControl, CancelToken) {
    let token = CancelToken::new();
    let config = RunControlConfig {
        configure_timeout: timeout,
        ..RunControlConfig::default()
    };
    let rc = RunControl::listen("tcp://127.0.0.1:0", config, &token).unwrap();
    (rc, token)
}

/// Connects a bare client acting as a node that only says what it's told.
#[cfg(test)]
fn fake_node(rc: &RunControl, name: &str, state: &str, token: &CancelToken) -> Client {
    let client = Client::connect(&rc.address(), "Producer", name, SocketConfig::default(), token)
        .unwrap();
    client.send(state.as_bytes().to_vec()).unwrap();
    client
}

#[cfg(test)]
fn received_commands(client: &Client, wait: Duration) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(ClientEvent::Receive(bytes)) = client.events().recv_timeout(wait) {
        out.push(String::from_utf8_lossy(&bytes).to_string());
    }
    out
}

#[test]
fn start_requires_configured_nodes() {
    let (rc, token) = test_control(Duration::from_millis(200));
    let ready = fake_node(&rc, "ready", "CONFIGURED", &token);
    let lagging = fake_node(&rc, "lagging", "INITIALISED", &token);
    rc.wait_for_nodes(2, Duration::from_secs(5)).unwrap();
    assert_eq!(rc.aggregate_state(), Some(NodeState::Initialised));

    match rc.start_run() {
        Err(Error::NotConfigured(names)) => assert_eq!(names, "Producer.lagging"),
        other => panic!("expected not configured, got {:?}", other),
    }
    assert_eq!(rc.run_n(), 0);
    assert!(received_commands(&ready, Duration::from_millis(200)).is_empty());

    lagging.send(b"CONFIGURED;RUN=0".to_vec()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while rc.aggregate_state() != Some(NodeState::Configured) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(rc.start_run().unwrap(), 1);
    assert_eq!(
        received_commands(&ready, Duration::from_millis(500)),
        vec!["START:1".to_string()]
    );
    token.cancel();
}

#[test]
fn disconnect_during_configure_fails_in_time() {
    let timeout = Duration::from_millis(1500);
    let (rc, token) = test_control(timeout);
    let node = fake_node(&rc, "flaky", "INITIALISED", &token);
    rc.wait_for_nodes(1, Duration::from_secs(5)).unwrap();

    let dropper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        drop(node);
    });
    let started = Instant::now();
    let result = rc.configure(&Configuration::new());
    assert!(started.elapsed() < timeout + Duration::from_millis(500));
    assert!(matches!(
        result,
        Err(Error::NodeFault(_)) | Err(Error::ConfigureTimeout(_))
    ));
    dropper.join().unwrap();

    let faults = rc.faults();
    assert!(faults.iter().any(|f| f.contains("Producer.flaky")));
    assert_eq!(rc.nodes()[0].state, Some(NodeState::Error));
    assert!(rc.faults().is_empty());

    // reset forgets the node that went away
    rc.reset().unwrap();
    assert!(rc.nodes().is_empty());
    token.cancel();
}

#[test]
fn disconnect_during_run_is_a_fault_but_the_run_goes_on() {
    let timeout = Duration::from_secs(3);
    let (rc, token) = test_control(timeout);
    let stays = fake_node(&rc, "stays", "CONFIGURED", &token);
    let leaves = fake_node(&rc, "leaves", "CONFIGURED", &token);
    rc.wait_for_nodes(2, Duration::from_secs(5)).unwrap();
    assert_eq!(rc.start_run().unwrap(), 1);

    drop(leaves);
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut faults = Vec::new();
    while faults.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
        faults = rc.faults();
    }
    assert!(faults.iter().any(|f| f.contains("Producer.leaves")));
    assert!(rc.is_running());
    let left = rc
        .nodes()
        .into_iter()
        .find(|n| n.info.name == "leaves")
        .unwrap();
    assert_eq!(left.state, Some(NodeState::Error));
    assert_eq!(left.error.as_deref(), Some("connection lost"));
    // nothing was sent after the start
    assert_eq!(
        received_commands(&stays, Duration::from_millis(300)),
        vec!["START:1".to_string()]
    );

    // the dead node fails the next configure right away
    rc.stop_run().unwrap();
    let started = Instant::now();
    match rc.configure(&Configuration::new()) {
        Err(Error::NodeFault(names)) => assert!(names.contains("Producer.leaves")),
        other => panic!("expected node fault, got {:?}", other),
    }
    assert!(started.elapsed() < timeout);
    token.cancel();
}

#[test]
fn configure_times_out_naming_silent_nodes() {
    let (rc, token) = test_control(Duration::from_millis(300));
    let _quiet = fake_node(&rc, "quiet", "INITIALISED", &token);
    rc.wait_for_nodes(1, Duration::from_secs(5)).unwrap();
    match rc.configure(&Configuration::new()) {
        Err(Error::ConfigureTimeout(names)) => assert_eq!(names, "Producer.quiet"),
        other => panic!("expected timeout, got {:?}", other),
    }
    token.cancel();
}

#[test]
fn collector_address_is_relayed_to_producers() {
    let (rc, token) = test_control(Duration::from_secs(1));
    let early = fake_node(&rc, "early", "UNINITIALISED", &token);
    let collector = Client::connect(&rc.address(), "DataCollector", "dc", SocketConfig::default(), &token)
        .unwrap();
    collector
        .send(b"UNINITIALISED;_SERVER=tcp://127.0.0.1:45000".to_vec())
        .unwrap();
    assert_eq!(
        received_commands(&early, Duration::from_millis(500)),
        vec!["DATA:tcp://127.0.0.1:45000".to_string()]
    );

    let late = fake_node(&rc, "late", "UNINITIALISED", &token);
    assert_eq!(
        received_commands(&late, Duration::from_millis(500)),
        vec!["DATA:tcp://127.0.0.1:45000".to_string()]
    );
    token.cancel();
}

#[test]
fn log_collector_address_is_relayed_to_everyone_else() {
    let (rc, token) = test_control(Duration::from_secs(1));
    let producer = fake_node(&rc, "p", "UNINITIALISED", &token);
    let backup = Client::connect(&rc.address(), "LogCollector", "backup", SocketConfig::default(), &token)
        .unwrap();
    let log = Client::connect(&rc.address(), "LogCollector", "log", SocketConfig::default(), &token)
        .unwrap();
    log.send(b"UNINITIALISED;_SERVER=tcp://127.0.0.1:45001".to_vec())
        .unwrap();
    assert_eq!(
        received_commands(&producer, Duration::from_millis(500)),
        vec!["LOG:tcp://127.0.0.1:45001".to_string()]
    );
    assert!(received_commands(&backup, Duration::from_millis(300)).is_empty());

    let monitor = Client::connect(&rc.address(), "Monitor", "mon", SocketConfig::default(), &token)
        .unwrap();
    assert_eq!(
        received_commands(&monitor, Duration::from_millis(500)),
        vec!["LOG:tcp://127.0.0.1:45001".to_string()]
    );
    token.cancel();
}
