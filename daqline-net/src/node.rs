//! Generic node driving the run lifecycle.
//!
//! A [`Node`] owns the control connection to run control. It parses
//! incoming commands, applies them to the node state machine, invokes the
//! matching [`Lifecycle`] hook and pushes the resulting status back.
//!
//! | command    | accepted from                                 | result        |
//! |------------|-----------------------------------------------|---------------|
//! | INITIALISE | Uninitialised, Initialised, Configured, Error | Initialised   |
//! | CONFIGURE  | Initialised, Configured                       | Configured    |
//! | START      | Configured                                    | Running       |
//! | STOP       | Running                                       | Configured    |
//! | RESET      | anything but Terminated                       | Uninitialised |
//! | TERMINATE  | anything                                      | Terminated    |
//!
//! Commands arriving in any other state are ignored. A failing hook moves
//! the node to `Error`.
//!
//! [`Node`]: struct.Node.html
//! [`Lifecycle`]: trait.Lifecycle.html

use std::time::Duration;

use crossbeam_channel::{Receiver, Select};

use daqline_core::Configuration;

use crate::client::{Client, ClientEvent};
use crate::logging::LogForwarder;
use crate::msg::{Command, NodeKind, NodeState, Status, TAG_DATA_LOST, TAG_RUN};
use crate::producer::DataSender;
use crate::socket::{CompositeSocketAddress, SocketConfig};
use crate::{CancelToken, Result};

/// Application side of a node.
///
/// Every hook gets the node context. Configuration passed to `initialise`
/// and `configure` is a view with the node's own `<Kind>.<name>` section
/// selected.
pub trait Lifecycle: Send {
    fn initialise(&mut self, _ctx: &mut NodeContext, _config: &Configuration) -> Result<()> {
        Ok(())
    }
    fn configure(&mut self, _ctx: &mut NodeContext, _config: &Configuration) -> Result<()> {
        Ok(())
    }
    fn start_run(&mut self, _ctx: &mut NodeContext, _run_n: u32) -> Result<()> {
        Ok(())
    }
    fn stop_run(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }
    fn reset(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }
    fn terminate(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        Ok(())
    }
    /// Adds tags to an outgoing status message.
    fn status(&self, _ctx: &NodeContext, _status: &mut Status) {}
}

/// What a lifecycle hook knows about its node.
pub struct NodeContext {
    kind: NodeKind,
    name: String,
    run_n: Option<u32>,
    token: CancelToken,
    data: DataSender,
    /// Collectors whose data connection broke and wasn't re-established
    lost_data: Vec<String>,
}

impl NodeContext {
    pub fn new(kind: NodeKind, name: &str, token: CancelToken) -> Self {
        Self {
            kind,
            name: name.to_string(),
            run_n: None,
            token,
            data: DataSender::new(),
            lost_data: Vec::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of the current, or last, run.
    pub fn run_n(&self) -> Option<u32> {
        self.run_n
    }

    /// Token cancelled when the node terminates.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Configuration section of this node.
    pub fn section(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    /// Sender for the data path, available while at least one collector
    /// is connected.
    pub fn data_sender(&self) -> Option<DataSender> {
        if self.data.collectors() == 0 {
            None
        } else {
            Some(self.data.clone())
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Interval of the periodic status push
    pub status_interval: Duration,
    pub socket: SocketConfig,
    /// Connected to the log collector announced with `LOG`
    pub log_forwarder: Option<LogForwarder>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            socket: SocketConfig::default(),
            log_forwarder: None,
        }
    }
}

/// State machine part of the node, independent of the connection.
struct Machine<L> {
    lifecycle: L,
    ctx: NodeContext,
    state: NodeState,
    error: Option<String>,
}

impl<L: Lifecycle> Machine<L> {
    fn new(lifecycle: L, ctx: NodeContext) -> Self {
        Self {
            lifecycle,
            ctx,
            state: NodeState::Uninitialised,
            error: None,
        }
    }

    /// Applies a lifecycle command, returning whether it was accepted.
    fn apply(&mut self, command: &Command) -> bool {
        use NodeState::*;
        let state = self.state;
        let result = match command {
            Command::Initialise(config)
                if matches!(state, Uninitialised | Initialised | Configured | Error) =>
            {
                let view = config.for_section(&self.ctx.section());
                self.lifecycle
                    .initialise(&mut self.ctx, &view)
                    .map(|_| Initialised)
            }
            Command::Configure(config) if matches!(state, Initialised | Configured) => {
                let view = config.for_section(&self.ctx.section());
                self.lifecycle
                    .configure(&mut self.ctx, &view)
                    .map(|_| Configured)
            }
            Command::Start(run_n) if state == Configured => {
                self.ctx.run_n = Some(*run_n);
                self.lifecycle
                    .start_run(&mut self.ctx, *run_n)
                    .map(|_| Running)
            }
            Command::Stop if state == Running => {
                self.lifecycle.stop_run(&mut self.ctx).map(|_| Configured)
            }
            Command::Reset if state != Terminated => {
                self.lifecycle.reset(&mut self.ctx).map(|_| Uninitialised)
            }
            Command::Terminate => {
                if let Err(e) = self.lifecycle.terminate(&mut self.ctx) {
                    error!("terminate failed: {}", e);
                }
                Ok(Terminated)
            }
            _ => {
                warn!("ignoring {} while {}", command.verb(), state);
                return false;
            }
        };
        match result {
            Ok(next) => {
                debug!("{}: {} -> {}", command.verb(), state, next);
                self.state = next;
                self.error = None;
            }
            Err(e) => {
                error!("{} failed: {}", command.verb(), e);
                self.state = Error;
                self.error = Some(e.to_string());
            }
        }
        true
    }

    fn status(&self) -> Status {
        let mut status = Status::new(self.state);
        status.error = self.error.clone();
        if let Some(run_n) = self.ctx.run_n {
            status.set_tag(TAG_RUN, run_n);
        }
        if !self.ctx.lost_data.is_empty() {
            status.set_tag(TAG_DATA_LOST, self.ctx.lost_data.join(","));
        }
        self.lifecycle.status(&self.ctx, &mut status);
        status
    }
}

/// Node connected to run control.
pub struct Node<L: Lifecycle> {
    machine: Machine<L>,
    client: Client,
    /// Connections to data collectors
    data_clients: Vec<Client>,
    config: NodeConfig,
}

impl<L: Lifecycle> Node<L> {
    /// Connects to run control at `addr` as `name` of the given kind.
    pub fn connect(
        addr: &str,
        kind: NodeKind,
        name: &str,
        lifecycle: L,
        config: NodeConfig,
        token: &CancelToken,
    ) -> Result<Self> {
        let token = token.child();
        let client = Client::connect(addr, &kind.to_string(), name, config.socket, &token)?;
        info!("{} {} connected to run control at {}", kind, name, addr);
        Ok(Self {
            machine: Machine::new(lifecycle, NodeContext::new(kind, name, token)),
            client,
            data_clients: Vec::new(),
            config,
        })
    }

    pub fn state(&self) -> NodeState {
        self.machine.state
    }

    pub fn context(&self) -> &NodeContext {
        &self.machine.ctx
    }

    /// Runs the command loop until the node terminates, the connection to
    /// run control is lost or the token is cancelled.
    pub fn run(mut self) -> Result<()> {
        let events = self.client.events().clone();
        let cancel = self.machine.ctx.token.receiver().clone();
        let ticker = crossbeam_channel::tick(self.config.status_interval);
        self.push_status();

        loop {
            // data connections come and go, so the selection is rebuilt
            let data_events: Vec<Receiver<ClientEvent>> = self
                .data_clients
                .iter()
                .map(|c| c.events().clone())
                .collect();
            let mut select = Select::new();
            let control = select.recv(&events);
            let tick = select.recv(&ticker);
            let cancelled = select.recv(&cancel);
            for receiver in &data_events {
                select.recv(receiver);
            }

            let oper = select.select();
            match oper.index() {
                i if i == control => match oper.recv(&events) {
                    Ok(ClientEvent::Receive(bytes)) => self.handle_bytes(&bytes),
                    Ok(ClientEvent::Disconnect) | Err(_) => {
                        warn!("lost connection to run control");
                        break;
                    }
                },
                i if i == tick => {
                    let _ = oper.recv(&ticker);
                    self.push_status();
                }
                i if i == cancelled => {
                    let _ = oper.recv(&cancel);
                    debug!("node cancelled");
                    break;
                }
                i => {
                    let index = i - cancelled - 1;
                    match oper.recv(&data_events[index]) {
                        Ok(ClientEvent::Receive(_)) => (),
                        Ok(ClientEvent::Disconnect) | Err(_) => {
                            self.lose_data_client(index);
                            self.push_status();
                        }
                    }
                }
            }
            if self.machine.state == NodeState::Terminated {
                break;
            }
        }

        if self.machine.state != NodeState::Terminated {
            self.machine.apply(&Command::Terminate);
            self.push_status();
        }
        self.machine.ctx.token.cancel();
        for client in &mut self.data_clients {
            client.close();
        }
        self.client.close();
        info!("{} terminated", self.machine.ctx.section());
        Ok(())
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        match text.parse::<Command>() {
            Ok(command) => self.handle(command),
            Err(e) => warn!("ignoring unrecognised command: {}", e),
        }
    }

    /// Handles a single command and pushes the resulting status.
    pub fn handle(&mut self, command: Command) {
        debug!("received {}", command.verb());
        match command {
            Command::Status => (),
            Command::Data(addr) => {
                if let Err(e) = self.connect_data(&addr) {
                    error!("failed connecting data path to {}: {}", addr, e);
                }
            }
            Command::Log(addr) => self.connect_log(&addr),
            command => {
                self.machine.apply(&command);
            }
        }
        self.push_status();
    }

    fn connect_data(&mut self, addr: &str) -> Result<()> {
        let target: CompositeSocketAddress = addr.parse()?;
        self.prune_data_clients();
        if self.data_clients.iter().any(|c| c.address() == &target) {
            debug!("data path to {} already connected", addr);
            return Ok(());
        }
        let ctx = &self.machine.ctx;
        let client = Client::connect(
            addr,
            &ctx.kind.to_string(),
            &ctx.name,
            self.config.socket,
            &ctx.token,
        )?;
        info!("data path connected to {}", target);
        let key = target.to_string();
        self.machine.ctx.data.add(&key, client.sender());
        self.machine.ctx.lost_data.retain(|a| a != &key);
        self.data_clients.push(client);
        Ok(())
    }

    fn connect_log(&mut self, addr: &str) {
        let forwarder = match &self.config.log_forwarder {
            Some(forwarder) => forwarder,
            None => {
                debug!("no log forwarder installed, ignoring log collector at {}", addr);
                return;
            }
        };
        let ctx = &self.machine.ctx;
        if let Err(e) = forwarder.connect(
            addr,
            &ctx.kind.to_string(),
            &ctx.name,
            self.config.socket,
            &ctx.token,
        ) {
            error!("failed connecting to log collector at {}: {}", addr, e);
        }
    }

    /// Drops data connections whose disconnect is already queued.
    fn prune_data_clients(&mut self) {
        let mut index = 0;
        while index < self.data_clients.len() {
            let gone = self.data_clients[index]
                .events()
                .try_iter()
                .any(|e| matches!(e, ClientEvent::Disconnect));
            if gone {
                self.lose_data_client(index);
            } else {
                index += 1;
            }
        }
    }

    fn lose_data_client(&mut self, index: usize) {
        let client = self.data_clients.remove(index);
        let addr = client.address().to_string();
        error!("lost data connection to {}", addr);
        let ctx = &mut self.machine.ctx;
        ctx.data.remove(&addr);
        if !ctx.lost_data.contains(&addr) {
            ctx.lost_data.push(addr);
        }
    }

    fn push_status(&mut self) {
        let status = self.machine.status();
        trace!("pushing status: {}", status);
        if let Err(e) = self.client.send(status.to_bytes()) {
            debug!("failed pushing status: {}", e);
        }
    }
}

#[cfg(test)]
#[derive(Default)]
struct Recorder {
    calls: Vec<String>,
    fail_configure: bool,
}

#[cfg(test)]
impl Lifecycle for Recorder {
    fn initialise(&mut self, _: &mut NodeContext, config: &Configuration) -> Result<()> {
        self.calls.push(format!("init {}", config.current_section()));
        Ok(())
    }
    fn configure(&mut self, _: &mut NodeContext, _: &Configuration) -> Result<()> {
        self.calls.push("configure".to_string());
        if self.fail_configure {
            return Err(crate::Error::Other("no hardware".to_string()));
        }
        Ok(())
    }
    fn start_run(&mut self, _: &mut NodeContext, run_n: u32) -> Result<()> {
        self.calls.push(format!("start {}", run_n));
        Ok(())
    }
    fn stop_run(&mut self, _: &mut NodeContext) -> Result<()> {
        self.calls.push("stop".to_string());
        Ok(())
    }
    fn status(&self, _: &NodeContext, status: &mut Status) {
        status.set_tag("CALLS", self.calls.len());
    }
}

#[cfg(test)]
fn machine(fail_configure: bool) -> Machine<Recorder> {
    let recorder = Recorder {
        fail_configure,
        ..Recorder::default()
    };
    Machine::new(
        recorder,
        NodeContext::new(NodeKind::Producer, "p1", CancelToken::new()),
    )
}

#[test]
fn lifecycle_transitions() {
    let config = Configuration::new();
    let mut m = machine(false);
    assert!(!m.apply(&Command::Start(1)));
    assert!(m.apply(&Command::Initialise(config.clone())));
    assert!(m.apply(&Command::Configure(config.clone())));
    assert!(m.apply(&Command::Start(1)));
    assert_eq!(m.state, NodeState::Running);
    // duplicate start and reconfiguring while running are ignored
    assert!(!m.apply(&Command::Start(2)));
    assert!(!m.apply(&Command::Configure(config.clone())));
    assert!(!m.apply(&Command::Initialise(config.clone())));
    assert!(m.apply(&Command::Stop));
    assert!(!m.apply(&Command::Stop));
    assert_eq!(m.state, NodeState::Configured);

    let status = m.status();
    assert_eq!(status.run_n(), Some(1));
    assert_eq!(status.tag("CALLS"), Some("4"));
    assert_eq!(
        m.lifecycle.calls,
        vec!["init Producer.p1", "configure", "start 1", "stop"]
    );

    assert!(m.apply(&Command::Reset));
    assert_eq!(m.state, NodeState::Uninitialised);
    assert!(m.apply(&Command::Terminate));
    assert!(!m.apply(&Command::Reset));
    assert_eq!(m.state, NodeState::Terminated);
}

#[test]
fn failing_hook_moves_to_error() {
    let config = Configuration::new();
    let mut m = machine(true);
    m.apply(&Command::Initialise(config.clone()));
    m.apply(&Command::Configure(config.clone()));
    assert_eq!(m.state, NodeState::Error);
    let status = m.status();
    assert_eq!(status.error.as_deref(), Some("other: no hardware"));
    assert!(!m.apply(&Command::Start(1)));

    // reinitialising recovers
    assert!(m.apply(&Command::Initialise(config)));
    assert_eq!(m.state, NodeState::Initialised);
    assert_eq!(m.status().error, None);
}

#[cfg(test)]
fn wait_for_status<F: Fn(&Status) -> bool>(control: &crate::Server, check: F) -> bool {
    use crate::ServerEvent;
    use std::time::Instant;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Ok(ServerEvent::Receive(_, bytes)) =
            control.events().recv_timeout(Duration::from_millis(100))
        {
            if let Ok(status) = String::from_utf8_lossy(&bytes).parse::<Status>() {
                if check(&status) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
fn listen_retrying(addr: &str, token: &CancelToken) -> crate::Server {
    // the old listener may still be shutting down
    for _ in 0..50 {
        if let Ok(server) = crate::Server::listen(addr, SocketConfig::default(), token) {
            return server;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("couldn't listen at {}", addr);
}

#[test]
fn lost_collector_is_reported_and_can_come_back() {
    use crate::{Server, ServerEvent};

    let token = CancelToken::new();
    let control = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let collector = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let data_addr = collector.address();

    let config = NodeConfig {
        status_interval: Duration::from_millis(50),
        ..NodeConfig::default()
    };
    let node = Node::connect(
        &control.address(),
        NodeKind::Producer,
        "p",
        Recorder::default(),
        config,
        &token,
    )
    .unwrap();
    let handle = std::thread::spawn(move || node.run().unwrap());
    let id = match control.events().recv_timeout(Duration::from_secs(5)).unwrap() {
        ServerEvent::Connect(info) => info.id,
        other => panic!("expected connect, got {:?}", other),
    };

    let announce = Command::Data(data_addr.clone()).to_bytes();
    control.send_to(id, announce.clone()).unwrap();
    assert!(matches!(
        collector.events().recv_timeout(Duration::from_secs(5)),
        Ok(ServerEvent::Connect(_))
    ));

    drop(collector);
    assert!(wait_for_status(&control, |s| s.tag(TAG_DATA_LOST) == Some(data_addr.as_str())));

    // a collector restarted at the same address is reachable again
    let collector = listen_retrying(&data_addr, &token);
    control.send_to(id, announce).unwrap();
    assert!(matches!(
        collector.events().recv_timeout(Duration::from_secs(5)),
        Ok(ServerEvent::Connect(_))
    ));
    assert!(wait_for_status(&control, |s| s.tag(TAG_DATA_LOST).is_none()));

    control.send_to(id, Command::Terminate.to_bytes()).unwrap();
    handle.join().unwrap();
    token.cancel();
}
