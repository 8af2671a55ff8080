use std::sync::{Arc, Mutex, MutexGuard};

use super::FileWriter;
use crate::{Error, Event, Result};

#[derive(Default)]
struct Store {
    runs: Vec<u32>,
    events: Vec<Event>,
    bytes: u64,
}

/// Writer keeping everything in memory. Clones share the same storage, so
/// one handle can be given away as the sink while another inspects it.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    store: Arc<Mutex<Store>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All events written so far, across runs.
    pub fn events(&self) -> Vec<Event> {
        self.store().events.clone()
    }

    /// Run numbers started so far.
    pub fn runs(&self) -> Vec<u32> {
        self.store().runs.clone()
    }
}

impl FileWriter for MemoryWriter {
    fn start_run(&mut self, run_n: u32) -> Result<()> {
        let mut store = self.store();
        store.runs.push(run_n);
        store.bytes = 0;
        Ok(())
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut store = self.store();
        if store.runs.is_empty() {
            return Err(Error::NoRunStarted);
        }
        store.bytes += event.to_bytes().len() as u64;
        store.events.push(event.clone());
        Ok(())
    }

    fn file_bytes(&self) -> u64 {
        self.store().bytes
    }
}
