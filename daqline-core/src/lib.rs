//! This library implements the core of `daqline` data acquisition.
//!
//! Programming interface is centered around the [`Event`] structure, a
//! self-describing record that producers emit and collectors store. Events
//! are encoded into a compact binary form and decoded back through a
//! [`Registry`], which maps type identifiers to decoder functions.
//!
//! On top of the event model this crate provides the run [`Configuration`]
//! object handed to nodes, the [`FileWriter`] and [`FileReader`] contracts
//! along with a native file format, and the [`SyncEngine`] which merges
//! multiple producer streams into a single ordered output.
//!
//!
//! # Networking
//!
//! By itself, this library does not provide any networking capability. For
//! the transport, run control and data collection see `daqline-net`.
//!
//! # Using the library
//!
//! To use `daqline-core` in your Rust project add the following to your
//! `Cargo.toml`:
//!
//! ```toml
//! daqline-core = "0.1.0"
//! ```
//!
//! ## Example
//!
//! ```
//! use daqline_core::{Event, Registry};
//!
//! let registry = Registry::with_builtins();
//! let mut event = Event::trigger(42);
//! event.set_event_n(7);
//! event.set_tag("SOURCE", "tlu");
//! let bytes = event.to_bytes();
//! assert_eq!(registry.decode_bytes(&bytes).unwrap(), event);
//! ```
//!
//! [`Event`]: event/struct.Event.html
//! [`Registry`]: event/struct.Registry.html
//! [`Configuration`]: config/struct.Configuration.html
//! [`FileWriter`]: file/trait.FileWriter.html
//! [`FileReader`]: file/trait.FileReader.html
//! [`SyncEngine`]: sync/struct.SyncEngine.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use config::Configuration;
pub use error::{Error, Result};
pub use event::{type_id, ByteReader, Event, EventBody, Flags, Registry};
pub use file::{FileReader, FileWriter};
pub use sync::{StreamId, SyncEngine, SyncPolicy};

pub mod config;
pub mod error;
pub mod event;
pub mod file;
pub mod sync;
