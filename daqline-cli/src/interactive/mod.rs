//! Interactive run control shell.
//!
//! Reads commands from the terminal and forwards them to a [`RunControl`].
//! A run configuration can be passed on startup or given to `init` and
//! `config` as a file path.
//!
//! [`RunControl`]: ../../daqline_net/run_control/struct.RunControl.html

mod compl;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use colored::*;
use linefeed::{Interface, ReadResult, Signal};

use daqline_core::Configuration;
use daqline_net::{CancelToken, NodeRecord, NodeState, RunControl};

use self::compl::MainCompleter;

/// List of available commands with their descriptions.
pub static APP_COMMANDS: &[(&str, &str)] = &[
    ("init", "Initialise all nodes, optionally with a config file"),
    ("config", "Configure all nodes, optionally with a config file"),
    ("start", "Start the next run"),
    ("stop", "Stop the current run"),
    ("reset", "Reset all nodes and forget disconnected ones"),
    ("status", "Show the state of all connected nodes"),
    ("terminate", "Terminate all nodes"),
    ("help", "Show this list"),
    ("quit", "Leave the shell and stop run control"),
];

/// Entry point for the interactive shell. Returns once the user quits or
/// the token gets cancelled.
pub fn start(rc: &RunControl, mut config: Option<Configuration>, token: &CancelToken) -> Result<()> {
    let interface = Arc::new(Interface::new("daqline")?);
    interface.set_completer(Arc::new(MainCompleter));
    interface.set_report_signal(Signal::Interrupt, true);
    interface.set_report_signal(Signal::Quit, true);

    println!("\nYou're now in the run control shell.");
    println!("See possible commands with \"help\". Exit using \"quit\" or ctrl-d.");
    interface.set_prompt(&create_prompt(rc))?;

    loop {
        if token.is_cancelled() {
            break;
        }
        let line = match interface.read_line_step(Some(Duration::from_millis(200)))? {
            Some(ReadResult::Input(line)) => line,
            Some(ReadResult::Eof) | Some(ReadResult::Signal(_)) => break,
            None => continue,
        };
        if !line.trim().is_empty() {
            interface.add_history_unique(line.clone());
        }

        let (cmd, args) = split_first_word(&line);
        let result: Result<()> = match cmd {
            "" => Ok(()),
            "init" => load_config(&mut config, args).and_then(|c| Ok(rc.initialise(&c)?)),
            "config" => load_config(&mut config, args).and_then(|c| Ok(rc.configure(&c)?)),
            "start" => rc.start_run().map(|run_n| println!("started run {}", run_n)).map_err(|e| e.into()),
            "stop" => rc.stop_run().map_err(|e| e.into()),
            "reset" => rc.reset().map_err(|e| e.into()),
            "terminate" => rc.terminate().map_err(|e| e.into()),
            "status" => {
                print_status(rc);
                Ok(())
            }
            "help" => {
                println!("available commands:");
                println!();
                for &(cmd, help) in APP_COMMANDS {
                    println!("  {:15} - {}", cmd, help);
                }
                println!();
                Ok(())
            }
            "quit" | "exit" => break,
            _ => {
                println!("unknown command: {}, see \"help\"", cmd);
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("{}{}", "error: ".red(), e);
        }
        for fault in rc.faults() {
            println!("{}{}", "fault: ".yellow(), fault);
        }
        interface.set_prompt(&create_prompt(rc))?;
    }
    Ok(())
}

/// Loads the file given as argument, falling back to the configuration
/// already loaded. A newly loaded file replaces the remembered one.
fn load_config(config: &mut Option<Configuration>, args: &str) -> Result<Configuration> {
    if !args.is_empty() {
        *config = Some(Configuration::load(args)?);
    }
    match config {
        Some(config) => Ok(config.clone()),
        None => {
            println!("no configuration given, using an empty one");
            Ok(Configuration::new())
        }
    }
}

fn create_prompt(rc: &RunControl) -> String {
    let state = match rc.aggregate_state() {
        Some(state) => state.to_string(),
        None => "no nodes".to_string(),
    };
    if rc.is_running() {
        format!("[run {}] {}> ", rc.run_n(), state)
    } else {
        format!("{}> ", state)
    }
}

fn print_status(rc: &RunControl) {
    let nodes = rc.nodes();
    if nodes.is_empty() {
        println!("no nodes connected");
        return;
    }
    for node in &nodes {
        println!("{}", format_record(node));
    }
}

fn format_record(node: &NodeRecord) -> String {
    let name = match node.kind {
        Some(kind) => format!("{}.{}", kind, node.info.name),
        None => format!("{}.{}", node.info.peer_type, node.info.name),
    };
    let state = match node.state {
        Some(NodeState::Error) => "ERROR".red().to_string(),
        Some(NodeState::Running) => "RUNNING".green().to_string(),
        Some(state) => state.to_string(),
        None => "-".to_string(),
    };
    let mut line = format!("  {:30} {:14} {}", name, state, node.info.addr);
    for (key, value) in &node.tags {
        line.push_str(&format!(" {}={}", key, value));
    }
    if let Some(error) = &node.error {
        line.push_str(&format!(" ({})", error));
    }
    line
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(|ch: char| ch.is_whitespace()) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

#[test]
fn words_are_split_off() {
    assert_eq!(split_first_word("  config  run.toml "), ("config", "run.toml"));
    assert_eq!(split_first_word("start"), ("start", ""));
    assert_eq!(split_first_word(""), ("", ""));
}
