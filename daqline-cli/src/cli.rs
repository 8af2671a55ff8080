//! Application definition.

extern crate simplelog;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use daqline_core::file::{FileReader, NativeReader};
use daqline_core::{Configuration, Registry};
use daqline_net::{
    CancelToken, DataCollector, DataCollectorConfig, LogCollector, LogCollectorConfig,
    LogForwarder, Node, NodeConfig, NodeKind, RunControl, RunControlConfig,
};
use log::{LevelFilter, Log, Metadata, Record};

use crate::interactive;
use crate::producer::{ExampleProducer, ProducerMode, ProducerSettings};
use crate::util;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub const DEFAULT_RUN_CONTROL_ADDRESS: &str = "tcp://127.0.0.1:44000";

pub fn app<'a, 'b>() -> App<'a, 'b> {
    let app = App::new("daqline")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run distributed data acquisition nodes from the command line.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output (none, error, warn, info, debug, trace or 0-5)"))

        // runcontrol subcommand
        .subcommand(SubCommand::with_name("runcontrol")
            .display_order(10)
            .about("Start the run controller with an interactive shell")
            .arg(Arg::with_name("address")
                .long("address")
                .short("a")
                .takes_value(true)
                .value_name("address")
                .default_value(DEFAULT_RUN_CONTROL_ADDRESS)
                .help("Address to listen for nodes on"))
            .arg(Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .value_name("path")
                .help("Run configuration file used by `init` and `config`"))
            .arg(Arg::with_name("configure-timeout")
                .long("configure-timeout")
                .takes_value(true)
                .value_name("millis")
                .default_value("10000")
                .help("How long `config` waits for all nodes to report CONFIGURED"))
        )

        // collector subcommand
        .subcommand(SubCommand::with_name("collector")
            .display_order(20)
            .about("Start a data collector node")
            .arg(Arg::with_name("runcontrol")
                .long("runcontrol")
                .short("r")
                .takes_value(true)
                .value_name("address")
                .default_value(DEFAULT_RUN_CONTROL_ADDRESS)
                .help("Address of the run controller"))
            .arg(Arg::with_name("name")
                .long("name")
                .short("n")
                .takes_value(true)
                .value_name("string")
                .default_value("dc")
                .help("Name of the collector, selects the `DataCollector.<name>` config section"))
            .arg(Arg::with_name("listen")
                .long("listen")
                .short("l")
                .takes_value(true)
                .value_name("address")
                .default_value("tcp://0.0.0.0:0")
                .help("Address to receive producer data on"))
        )

        // logcollector subcommand
        .subcommand(SubCommand::with_name("logcollector")
            .display_order(22)
            .about("Start a log collector writing the records of all nodes to a daily file")
            .arg(Arg::with_name("runcontrol")
                .long("runcontrol")
                .short("r")
                .takes_value(true)
                .value_name("address")
                .default_value(DEFAULT_RUN_CONTROL_ADDRESS)
                .help("Address of the run controller"))
            .arg(Arg::with_name("name")
                .long("name")
                .short("n")
                .takes_value(true)
                .value_name("string")
                .default_value("log")
                .help("Name of the log collector"))
            .arg(Arg::with_name("listen")
                .long("listen")
                .short("l")
                .takes_value(true)
                .value_name("address")
                .default_value("tcp://0.0.0.0:0")
                .help("Address to receive log records on"))
            .arg(Arg::with_name("dir")
                .long("dir")
                .short("d")
                .takes_value(true)
                .value_name("path")
                .default_value("logs")
                .help("Directory the log files are written to"))
        )

        // producer subcommand
        .subcommand(SubCommand::with_name("producer")
            .display_order(21)
            .about("Start an example producer generating random hit data")
            .arg(Arg::with_name("runcontrol")
                .long("runcontrol")
                .short("r")
                .takes_value(true)
                .value_name("address")
                .default_value(DEFAULT_RUN_CONTROL_ADDRESS)
                .help("Address of the run controller"))
            .arg(Arg::with_name("name")
                .long("name")
                .short("n")
                .takes_value(true)
                .value_name("string")
                .default_value("example")
                .help("Name of the producer, selects the `Producer.<name>` config section"))
            .arg(Arg::with_name("trigger")
                .long("trigger")
                .short("t")
                .help("Act as the trigger reference, emitting trigger events without jitter"))
            .arg(Arg::with_name("rate")
                .long("rate")
                .takes_value(true)
                .value_name("hz")
                .default_value("100")
                .help("Events generated per second"))
            .arg(Arg::with_name("jitter")
                .long("jitter")
                .takes_value(true)
                .value_name("ticks")
                .default_value("0")
                .help("Maximum random timestamp jitter, in clock ticks"))
            .arg(Arg::with_name("sync-every")
                .long("sync-every")
                .takes_value(true)
                .value_name("events")
                .default_value("0")
                .help("Mark every n-th event as a synchronization point, 0 for never"))
        )

        // read subcommand
        .subcommand(SubCommand::with_name("read")
            .display_order(30)
            .about("Print the events stored in a native data file")
            .arg(Arg::with_name("path")
                .required(true)
                .value_name("path"))
            .arg(Arg::with_name("count")
                .long("count")
                .short("c")
                .takes_value(true)
                .value_name("n")
                .help("Stop after printing n events"))
        );

    app
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("runcontrol", Some(m)) => start_runcontrol(m),
        ("collector", Some(m)) => start_collector(m),
        ("producer", Some(m)) => start_producer(m),
        ("logcollector", Some(m)) => start_log_collector(m),
        ("read", Some(m)) => start_read(m),
        _ => Ok(()),
    }
}

/// Creates the root token, cancelled on ctrl-c.
fn root_token() -> Result<CancelToken> {
    let token = CancelToken::new();
    let t = token.clone();
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        t.cancel();
    })?;
    Ok(token)
}

fn start_runcontrol(matches: &ArgMatches) -> Result<()> {
    let forwarder = setup_log_verbosity(matches);
    let token = root_token()?;

    let run_config = match matches.value_of("config") {
        Some(path) => Some(Configuration::load(path)?),
        None => None,
    };
    let config = RunControlConfig {
        configure_timeout: Duration::from_millis(util::parse_arg(matches, "configure-timeout")?),
        log_forwarder: Some(forwarder),
        ..RunControlConfig::default()
    };
    let address = matches
        .value_of("address")
        .ok_or(Error::msg("listen address must be provided"))?;
    let mut rc = RunControl::listen(address, config, &token)?;
    println!("run control listening on {}", rc.address());

    let result = interactive::start(&rc, run_config, &token);
    rc.shutdown();
    result
}

fn start_collector(matches: &ArgMatches) -> Result<()> {
    let forwarder = setup_log_verbosity(matches);
    let token = root_token()?;

    let config = DataCollectorConfig {
        data_address: matches.value_of("listen").unwrap_or("tcp://0.0.0.0:0").to_string(),
        ..DataCollectorConfig::default()
    };
    let registry = Arc::new(Registry::with_builtins());
    let collector = DataCollector::new(config, registry, &token)?;
    println!("receiving data on {}", collector.data_address());

    let node = Node::connect(
        matches
            .value_of("runcontrol")
            .ok_or(Error::msg("run control address must be provided"))?,
        NodeKind::DataCollector,
        matches.value_of("name").unwrap_or("dc"),
        collector,
        NodeConfig {
            log_forwarder: Some(forwarder),
            ..NodeConfig::default()
        },
        &token,
    )?;
    node.run()?;
    Ok(())
}

fn start_producer(matches: &ArgMatches) -> Result<()> {
    let forwarder = setup_log_verbosity(matches);
    let token = root_token()?;

    let mode = if matches.is_present("trigger") {
        ProducerMode::Trigger
    } else {
        ProducerMode::Device
    };
    let settings = ProducerSettings {
        rate: util::parse_arg(matches, "rate")?,
        jitter: util::parse_arg(matches, "jitter")?,
        sync_every: util::parse_arg(matches, "sync-every")?,
        ..ProducerSettings::default()
    };
    if settings.rate <= 0. {
        return Err(Error::msg("event rate must be positive"));
    }

    let node = Node::connect(
        matches
            .value_of("runcontrol")
            .ok_or(Error::msg("run control address must be provided"))?,
        NodeKind::Producer,
        matches.value_of("name").unwrap_or("example"),
        ExampleProducer::new(mode, settings),
        NodeConfig {
            log_forwarder: Some(forwarder),
            ..NodeConfig::default()
        },
        &token,
    )?;
    node.run()?;
    Ok(())
}

fn start_log_collector(matches: &ArgMatches) -> Result<()> {
    // records of the collector itself only go to the terminal
    let _ = setup_log_verbosity(matches);
    let token = root_token()?;

    let config = LogCollectorConfig {
        listen_address: matches.value_of("listen").unwrap_or("tcp://0.0.0.0:0").to_string(),
        directory: PathBuf::from(matches.value_of("dir").unwrap_or("logs")),
        ..LogCollectorConfig::default()
    };
    let collector = LogCollector::new(config, &token)?;
    println!(
        "receiving log records on {}, writing to {}",
        collector.address(),
        collector.path().display()
    );

    let node = Node::connect(
        matches
            .value_of("runcontrol")
            .ok_or(Error::msg("run control address must be provided"))?,
        NodeKind::LogCollector,
        matches.value_of("name").unwrap_or("log"),
        collector,
        NodeConfig::default(),
        &token,
    )?;
    node.run()?;
    Ok(())
}

fn start_read(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let path = matches
        .value_of("path")
        .ok_or(Error::msg("file path must be provided"))?;
    let limit = match matches.value_of("count") {
        Some(_) => Some(util::parse_arg::<usize>(matches, "count")?),
        None => None,
    };

    let registry = Arc::new(Registry::with_builtins());
    let mut reader = NativeReader::open(path, registry.clone())?;
    let header = reader.header();
    println!(
        "run {}, created {}, compression {:?}",
        header.run_n, header.created, header.compression
    );

    let mut count = 0;
    while let Some(event) = reader.next_event()? {
        if limit.map_or(false, |l| count >= l) {
            break;
        }
        println!("{}", util::format_event(&event, &registry, 0));
        count += 1;
    }
    println!("{} event(s)", count);
    Ok(())
}

/// Global-logger side of a `LogForwarder`.
struct ForwardingLogger(LogForwarder);

impl Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.log(record)
    }

    fn flush(&self) {}
}

impl simplelog::SharedLogger for ForwardingLogger {
    fn level(&self) -> LevelFilter {
        self.0.level()
    }

    fn config(&self) -> Option<&simplelog::Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        Box::new(*self)
    }
}

/// Installs the terminal logger next to a log forwarder, which stays idle
/// until run control announces a log collector.
fn setup_log_verbosity(matches: &ArgMatches) -> LogForwarder {
    use self::simplelog::{CombinedLogger, SharedLogger, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Trace)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    let forwarder = LogForwarder::new(level_filter.min(LevelFilter::Info));
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(level_filter, logger_conf, simplelog::TerminalMode::Mixed),
        Box::new(ForwardingLogger(forwarder.clone())),
    ];
    let _ = CombinedLogger::init(loggers);
    forwarder
}
