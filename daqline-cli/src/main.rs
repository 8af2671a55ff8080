//! Command line program for running `daqline` data acquisition nodes.

#[macro_use]
extern crate log;

extern crate anyhow;
extern crate clap;
extern crate colored;
extern crate linefeed;

pub mod cli;
pub mod interactive;
pub mod producer;
mod util;

use colored::*;

fn main() {
    match cli::start(cli::app_matches()) {
        Ok(_) => (),
        Err(e) => {
            println!("{}{}", "error: ".red(), e);
            if e.root_cause().to_string() != e.to_string() {
                println!("Caused by:\n{}", e.root_cause())
            }
            std::process::exit(1);
        }
    }
}
