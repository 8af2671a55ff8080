//! Data collector node.
//!
//! A [`DataCollector`] listens on its own data address, which producers
//! connect to once run control relayed it. Every producer connection becomes
//! one stream of the sync engine, and the merged output goes to a file
//! writer.
//!
//! [`DataCollector`]: struct.DataCollector.html

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use daqline_core::file::{FileWriter, NativeWriter};
use daqline_core::sync::policy_from_config;
use daqline_core::{Configuration, Registry, SyncEngine};

use crate::msg::{Status, TAG_EVENT, TAG_FILEBYTES, TAG_SERVER};
use crate::node::{Lifecycle, NodeContext};
use crate::server::{Server, ServerEvent};
use crate::socket::{ConnectionId, SocketConfig};
use crate::util::lock;
use crate::{CancelToken, Error, Result};

const DEFAULT_STOP_TIMEOUT_MS: u64 = 3000;

/// Creates the file writer for a configuration section.
pub type WriterFactory =
    Box<dyn Fn(&Configuration) -> daqline_core::Result<Box<dyn FileWriter>> + Send>;

/// Picks the writer named by the `FileType` key, `native` by default.
pub fn default_writer(config: &Configuration) -> daqline_core::Result<Box<dyn FileWriter>> {
    match config.get_str("FileType", "native").to_lowercase().as_str() {
        "native" => Ok(Box::new(NativeWriter::from_config(config)?)),
        other => Err(daqline_core::Error::ConfigError(format!(
            "unknown file type: {}",
            other
        ))),
    }
}

#[derive(Clone, Debug)]
pub struct DataCollectorConfig {
    /// Address producers connect to
    pub data_address: String,
    pub socket: SocketConfig,
    /// How often buffered events are processed without new arrivals
    pub tick_interval: Duration,
}

impl Default for DataCollectorConfig {
    fn default() -> Self {
        Self {
            data_address: "tcp://0.0.0.0:0".to_string(),
            socket: SocketConfig::default(),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Everything the data thread and the lifecycle hooks share.
struct Pipeline {
    engine: SyncEngine,
    writer: Option<Box<dyn FileWriter>>,
    running: bool,
    /// Names of the connected producers
    streams: FnvHashMap<ConnectionId, String>,
    /// First write failure of the current run
    error: Option<String>,
}

impl Pipeline {
    fn process(&mut self) {
        if !self.running || self.error.is_some() {
            return;
        }
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return,
        };
        if let Err(e) = self.engine.process(Instant::now(), writer.as_mut()) {
            error!("writing events failed: {}", e);
            self.error = Some(e.to_string());
        }
    }

    /// Replaces the engine, dropping anything still buffered.
    fn rebuild(&mut self, engine: SyncEngine) {
        self.engine = engine;
        for id in self.streams.keys() {
            if let Err(e) = self.engine.add_stream(*id) {
                warn!("{}", e);
            }
        }
    }
}

struct Shared {
    pipeline: Mutex<Pipeline>,
    /// Signalled after every processing pass
    processed: Condvar,
    registry: Arc<Registry>,
}

pub struct DataCollector {
    server: Arc<Server>,
    shared: Arc<Shared>,
    factory: WriterFactory,
    stop_timeout: Duration,
    token: CancelToken,
    data_thread: Option<JoinHandle<()>>,
}

impl DataCollector {
    /// Starts listening for producers right away, so the data address can
    /// be reported before the first configure.
    pub fn new(
        config: DataCollectorConfig,
        registry: Arc<Registry>,
        token: &CancelToken,
    ) -> Result<Self> {
        let token = token.child();
        let server = Arc::new(Server::listen(&config.data_address, config.socket, &token)?);
        info!("listening for data at {}", server.address());
        let policy = policy_from_config(&Configuration::new())?;
        let shared = Arc::new(Shared {
            pipeline: Mutex::new(Pipeline {
                engine: SyncEngine::new(policy),
                writer: None,
                running: false,
                streams: FnvHashMap::default(),
                error: None,
            }),
            processed: Condvar::new(),
            registry,
        });

        let (_server, _shared, _token) = (server.clone(), shared.clone(), token.clone());
        let tick = config.tick_interval;
        let data_thread = thread::Builder::new()
            .name("collector-data".to_string())
            .spawn(move || data_loop(&_server, &_shared, tick, &_token))?;

        Ok(Self {
            server,
            shared,
            factory: Box::new(default_writer),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            token,
            data_thread: Some(data_thread),
        })
    }

    pub fn with_writer_factory(mut self, factory: WriterFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Address producers should send data to.
    pub fn data_address(&self) -> String {
        self.server.address()
    }

    /// Number of connected producers.
    pub fn streams(&self) -> usize {
        lock(&self.shared.pipeline).streams.len()
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        self.server.shutdown();
        if let Some(handle) = self.data_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DataCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Lifecycle for DataCollector {
    fn configure(&mut self, _ctx: &mut NodeContext, config: &Configuration) -> Result<()> {
        let engine = SyncEngine::new(policy_from_config(config)?);
        let writer = (self.factory)(config)?;
        self.stop_timeout = Duration::from_millis(
            config.get_uint("StopTimeoutMs", DEFAULT_STOP_TIMEOUT_MS),
        );
        let mut pipeline = lock(&self.shared.pipeline);
        info!(
            "configured with {} synchronisation, {} producer(s) connected",
            engine.policy_name(),
            pipeline.streams.len()
        );
        pipeline.rebuild(engine);
        pipeline.writer = Some(writer);
        Ok(())
    }

    fn start_run(&mut self, _ctx: &mut NodeContext, run_n: u32) -> Result<()> {
        let mut pipeline = lock(&self.shared.pipeline);
        let pipeline = &mut *pipeline;
        pipeline
            .writer
            .as_mut()
            .ok_or_else(|| Error::NotConfigured("no file writer".to_string()))?
            .start_run(run_n)?;
        pipeline.engine.begin_run(run_n);
        pipeline.error = None;
        pipeline.running = true;
        pipeline.process();
        Ok(())
    }

    fn stop_run(&mut self, ctx: &mut NodeContext) -> Result<()> {
        let deadline = Instant::now() + self.stop_timeout;
        let mut pipeline = lock(&self.shared.pipeline);
        while !pipeline.engine.is_drained() && pipeline.error.is_none() {
            let now = Instant::now();
            if now >= deadline || ctx.token().is_cancelled() {
                warn!(
                    "not all producers ended the run, {} event(s) still buffered",
                    pipeline.engine.queues().pending()
                );
                break;
            }
            pipeline = self
                .shared
                .processed
                .wait_timeout(pipeline, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }

        let pipeline = &mut *pipeline;
        pipeline.running = false;
        if let Some(error) = pipeline.error.take() {
            return Err(Error::Other(error));
        }
        if let Some(writer) = pipeline.writer.as_mut() {
            pipeline.engine.flush(writer.as_mut())?;
            writer.flush()?;
            info!(
                "run {} stopped, {} event(s) written, {} byte(s)",
                pipeline.engine.run_n().unwrap_or(0),
                pipeline.engine.written(),
                writer.file_bytes()
            );
        }
        Ok(())
    }

    fn reset(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        let engine = SyncEngine::new(policy_from_config(&Configuration::new())?);
        let mut pipeline = lock(&self.shared.pipeline);
        pipeline.running = false;
        pipeline.error = None;
        if let Some(mut writer) = pipeline.writer.take() {
            writer.flush()?;
        }
        pipeline.rebuild(engine);
        Ok(())
    }

    fn terminate(&mut self, ctx: &mut NodeContext) -> Result<()> {
        if lock(&self.shared.pipeline).running {
            self.stop_run(ctx)?;
        }
        self.shutdown();
        Ok(())
    }

    fn status(&self, _ctx: &NodeContext, status: &mut Status) {
        status.set_tag(TAG_SERVER, self.server.address());
        let pipeline = lock(&self.shared.pipeline);
        if pipeline.running {
            status.set_tag(TAG_EVENT, pipeline.engine.written());
            if let Some(writer) = &pipeline.writer {
                status.set_tag(TAG_FILEBYTES, writer.file_bytes());
            }
        }
    }
}

fn data_loop(server: &Server, shared: &Shared, tick: Duration, token: &CancelToken) {
    let events = server.events().clone();
    let ticker = crossbeam_channel::tick(tick);
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(shared, event),
                Err(_) => break,
            },
            recv(ticker) -> _ => (),
            recv(token.receiver()) -> _ => break,
        }
        lock(&shared.pipeline).process();
        shared.processed.notify_all();
    }
    debug!("collector data loop finished");
}

fn handle_event(shared: &Shared, event: ServerEvent) {
    match event {
        ServerEvent::Connect(info) => {
            info!("{} {} connected to the data path", info.peer_type, info.name);
            let mut pipeline = lock(&shared.pipeline);
            if let Err(e) = pipeline.engine.add_stream(info.id) {
                warn!("{}", e);
            }
            pipeline.streams.insert(info.id, info.name);
        }
        ServerEvent::Receive(id, bytes) => {
            let event = match shared.registry.decode_bytes(&bytes) {
                Ok(event) => event,
                Err(e) => {
                    warn!("dropping undecodable event from stream {}: {}", id, e);
                    return;
                }
            };
            if let Err(e) = lock(&shared.pipeline).engine.push(id, event) {
                warn!("{}", e);
            }
        }
        ServerEvent::Disconnect(info) => {
            let mut pipeline = lock(&shared.pipeline);
            pipeline.streams.remove(&info.id);
            if pipeline.running {
                warn!("{} disconnected during the run", info.name);
            } else {
                info!("{} disconnected from the data path", info.name);
            }
            if let Err(e) = pipeline.engine.remove_stream(info.id) {
                warn!("{}", e);
            }
        }
    }
}

#[cfg(test)]
use daqline_core::file::MemoryWriter;
#[cfg(test)]
use daqline_core::Event;

/// Producer sending a fixed set of interleaved timestamps.
#[cfg(test)]
struct Pulser {
    offset: u64,
    count: u32,
}

#[cfg(test)]
impl Lifecycle for Pulser {
    fn configure(&mut self, ctx: &mut NodeContext, _: &Configuration) -> Result<()> {
        match ctx.data_sender() {
            Some(_) => Ok(()),
            None => Err(Error::NotConfigured("no data path".to_string())),
        }
    }
    fn start_run(&mut self, ctx: &mut NodeContext, run_n: u32) -> Result<()> {
        let data = ctx.data_sender().unwrap();
        data.send_bore(Event::raw("pulser"), run_n)?;
        for n in 0..self.count {
            let mut event = Event::raw("pulser");
            event.set_run_n(run_n);
            event.set_event_n(n + 1);
            let ts = n as u64 * 2 + self.offset;
            event.set_timestamp(ts, ts + 1);
            data.send_event(&event)?;
        }
        Ok(())
    }
    fn stop_run(&mut self, ctx: &mut NodeContext) -> Result<()> {
        let run_n = ctx.run_n().unwrap();
        ctx.data_sender()
            .unwrap()
            .send_eore(Event::raw("pulser"), run_n, self.count + 1)
    }
}

#[test]
fn producers_are_merged_into_one_file() {
    use crate::msg::{NodeKind, NodeState};
    use crate::node::{Node, NodeConfig};
    use crate::run_control::{RunControl, RunControlConfig};

    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
    let token = CancelToken::new();
    let rc = RunControl::listen("tcp://127.0.0.1:0", RunControlConfig::default(), &token).unwrap();
    let node_config = NodeConfig {
        status_interval: Duration::from_millis(100),
        ..NodeConfig::default()
    };

    let sink = MemoryWriter::new();
    let factory_sink = sink.clone();
    let collector = DataCollector::new(
        DataCollectorConfig {
            data_address: "tcp://127.0.0.1:0".to_string(),
            ..DataCollectorConfig::default()
        },
        Arc::new(Registry::with_builtins()),
        &token,
    )
    .unwrap()
    .with_writer_factory(Box::new(move |_| {
        Ok(Box::new(factory_sink.clone()) as Box<dyn FileWriter>)
    }));
    let node = Node::connect(
        &rc.address(),
        NodeKind::DataCollector,
        "dc",
        collector,
        node_config.clone(),
        &token,
    )
    .unwrap();
    let mut threads = vec![thread::spawn(move || node.run().unwrap())];
    rc.wait_for_nodes(1, Duration::from_secs(5)).unwrap();

    for (name, offset) in &[("even", 0), ("odd", 1)] {
        let pulser = Pulser {
            offset: *offset,
            count: 50,
        };
        let node = Node::connect(
            &rc.address(),
            NodeKind::Producer,
            name,
            pulser,
            node_config.clone(),
            &token,
        )
        .unwrap();
        threads.push(thread::spawn(move || node.run().unwrap()));
    }
    rc.wait_for_nodes(3, Duration::from_secs(5)).unwrap();

    let mut config = Configuration::new();
    config.set_section("DataCollector.dc");
    config.set("SyncPolicy", "timestamp");
    rc.initialise(&config).unwrap();
    rc.configure(&config).unwrap();
    assert_eq!(rc.start_run().unwrap(), 1);
    thread::sleep(Duration::from_millis(300));
    rc.stop_run().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while rc.aggregate_state() != Some(NodeState::Configured) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(rc.aggregate_state(), Some(NodeState::Configured));
    assert!(rc.faults().is_empty());

    let events = sink.events();
    assert_eq!(sink.runs(), vec![1]);
    assert_eq!(events.len(), 104);
    assert!(events[0].is_bore() && events[1].is_bore());
    assert_eq!(events.iter().filter(|e| e.is_eore()).count(), 2);
    assert!(events[103].is_eore());
    let stamps: Vec<u64> = events
        .iter()
        .filter(|e| !e.is_bore() && !e.is_eore())
        .filter_map(|e| e.timestamp_begin())
        .collect();
    assert_eq!(stamps, (0..100).collect::<Vec<u64>>());

    rc.terminate().unwrap();
    for handle in threads {
        handle.join().unwrap();
    }
    token.cancel();
}
