//! Stream synchronization.
//!
//! The [`SyncEngine`] receives events from many producer streams, keeps one
//! FIFO [`SyncQueueEntry`] per stream and hands the queues to a
//! [`SyncPolicy`] which decides what gets written next.
//!
//! Begin-of-run events are not subject to the policy: the first BORE of
//! each stream in a run is written as soon as it arrives. End-of-run events
//! mark their stream as finished and are written once that stream's queue
//! is drained.
//!
//! Three policies are provided:
//!
//! * [`PassThrough`] writes events in arrival order
//! * [`TimestampMerge`] performs a stable k-way merge on begin timestamps
//! * [`JitterAlignment`] pairs a device stream with a reference trigger
//!   stream, correcting the device clock for accumulated jitter
//!
//! [`SyncEngine`]: struct.SyncEngine.html
//! [`SyncQueueEntry`]: struct.SyncQueueEntry.html
//! [`SyncPolicy`]: trait.SyncPolicy.html
//! [`PassThrough`]: struct.PassThrough.html
//! [`TimestampMerge`]: struct.TimestampMerge.html
//! [`JitterAlignment`]: struct.JitterAlignment.html

mod jitter;
mod merge;
mod passthrough;

pub use jitter::{JitterAlignment, JitterParams, SyncPredicate, ALIGNMENT_DELTA_TAG, ALIGNMENT_TAG};
pub use merge::{TimestampMerge, LATE_TAG};
pub use passthrough::PassThrough;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::event::NO_TIMESTAMP;
use crate::file::FileWriter;
use crate::{Configuration, Error, Event, Result};

/// Identity of a producer stream, usually the connection handle.
pub type StreamId = u32;

/// Decides which buffered event is written next.
pub trait SyncPolicy: Send {
    fn name(&self) -> &'static str;

    /// Called with the first BORE of each stream in a run.
    fn on_bore(&mut self, _stream: StreamId, _bore: &Event) {}

    /// Takes the next event to be written out of the queues, or returns
    /// `None` if the policy has to wait for more input.
    fn next(&mut self, queues: &mut SyncQueues, now: Instant) -> Option<Event>;

    /// Clears per-run state.
    fn reset(&mut self) {}
}

/// Creates a policy from the `SyncPolicy` configuration key and the
/// policy-specific parameters.
pub fn policy_from_config(config: &Configuration) -> Result<Box<dyn SyncPolicy>> {
    let name = config.get_str("SyncPolicy", "timestamp").to_lowercase();
    match name.as_str() {
        "passthrough" | "pass-through" | "none" => Ok(Box::new(PassThrough::default())),
        "timestamp" | "merge" => {
            let stall = config.get_uint("StallTimeoutMs", 0);
            let stall = if stall == 0 {
                None
            } else {
                Some(Duration::from_millis(stall))
            };
            Ok(Box::new(TimestampMerge::new(stall)))
        }
        "jitter" | "tlu" => Ok(Box::new(JitterAlignment::new(JitterParams {
            denominator: config.get_uint("JitterDenominator", 0),
            offset: config.get_uint("JitterOffset", 0),
            default_delta: config.get_uint("DefaultDelta", 0),
            active_time: config.get_uint("ActiveTime", 1),
        }))),
        other => Err(Error::ConfigError(format!("unknown sync policy: {}", other))),
    }
}

struct Queued {
    seq: u64,
    /// Begin timestamp, `NO_TIMESTAMP` sorting last
    ts: u64,
    event: Event,
}

/// Pending events of a single stream.
pub struct SyncQueueEntry {
    stream: StreamId,
    events: VecDeque<Queued>,
    bore: Option<Event>,
    eore: Option<Event>,
    /// End of run reached, either by EORE or by disconnect
    finished: bool,
    connected: bool,
    /// Some event arrived with an earlier timestamp than the one before it
    unsorted: bool,
    empty_since: Instant,
}

impl SyncQueueEntry {
    fn new(stream: StreamId) -> Self {
        Self {
            stream,
            events: VecDeque::new(),
            bore: None,
            eore: None,
            finished: false,
            connected: true,
            unsorted: false,
            empty_since: Instant::now(),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// No more events are expected from this stream in the current run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn bore(&self) -> Option<&Event> {
        self.bore.as_ref()
    }

    pub fn front(&self) -> Option<&Event> {
        self.events.front().map(|q| &q.event)
    }

    /// Global arrival sequence number of the front event.
    pub fn front_seq(&self) -> Option<u64> {
        self.events.front().map(|q| q.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|q| &q.event)
    }

    /// Position and begin timestamp of the earliest buffered event, the
    /// first one among equals. Only scans the queue if the stream sent
    /// events out of timestamp order.
    pub fn earliest(&self) -> Option<(usize, u64)> {
        if !self.unsorted {
            return self.events.front().map(|q| (0, q.ts));
        }
        self.events
            .iter()
            .map(|q| q.ts)
            .enumerate()
            .min_by_key(|(_, ts)| *ts)
    }

    /// How long the queue has been empty, if it is.
    pub fn empty_for(&self, now: Instant) -> Option<Duration> {
        if self.events.is_empty() {
            Some(now.saturating_duration_since(self.empty_since))
        } else {
            None
        }
    }
}

/// Ordered set of stream queues. Queue index is the registration order.
#[derive(Default)]
pub struct SyncQueues {
    entries: Vec<SyncQueueEntry>,
}

impl SyncQueues {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SyncQueueEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueEntry> {
        self.entries.iter()
    }

    pub fn position(&self, stream: StreamId) -> Option<usize> {
        self.entries.iter().position(|e| e.stream == stream)
    }

    /// Every stream has reached the end of the run.
    pub fn all_finished(&self) -> bool {
        self.entries.iter().all(|e| e.finished)
    }

    /// Total number of buffered events.
    pub fn pending(&self) -> usize {
        self.entries.iter().map(|e| e.events.len()).sum()
    }

    /// Removes the front event of the queue at `index`.
    pub fn pop(&mut self, index: usize) -> Option<Event> {
        self.take(index, 0)
    }

    /// Removes the event at position `pos` of the queue at `index`.
    pub fn take(&mut self, index: usize, pos: usize) -> Option<Event> {
        let entry = self.entries.get_mut(index)?;
        let queued = entry.events.remove(pos)?;
        if entry.events.is_empty() {
            entry.empty_since = Instant::now();
            entry.unsorted = false;
        }
        Some(queued.event)
    }

    fn get_mut(&mut self, stream: StreamId) -> Result<&mut SyncQueueEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.stream == stream)
            .ok_or(Error::UnknownStream(stream))
    }
}

/// Merges multiple producer streams into one output stream.
pub struct SyncEngine {
    queues: SyncQueues,
    policy: Box<dyn SyncPolicy>,
    next_seq: u64,
    /// BOREs waiting to be written, in arrival order
    pending_bores: Vec<Event>,
    run_n: Option<u32>,
    written: u64,
}

impl SyncEngine {
    pub fn new(policy: Box<dyn SyncPolicy>) -> Self {
        Self {
            queues: SyncQueues::default(),
            policy,
            next_seq: 0,
            pending_bores: Vec::new(),
            run_n: None,
            written: 0,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn queues(&self) -> &SyncQueues {
        &self.queues
    }

    pub fn run_n(&self) -> Option<u32> {
        self.run_n
    }

    /// Number of events written in the current run.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Resets per-run state. Connected streams stay registered.
    pub fn begin_run(&mut self, run_n: u32) {
        debug!("sync engine ({}): begin run {}", self.policy.name(), run_n);
        self.run_n = Some(run_n);
        self.written = 0;
        // a BORE can overtake the collector's own start
        self.pending_bores.retain(|b| b.run_n() == run_n);
        self.policy.reset();
        self.queues
            .entries
            .retain(|e| e.connected || !e.events.is_empty());
        for entry in &mut self.queues.entries {
            entry.bore = entry.bore.take().filter(|b| b.run_n() == run_n);
            entry.eore = None;
            entry.finished = !entry.connected;
            if let Some(bore) = &entry.bore {
                self.policy.on_bore(entry.stream, bore);
            }
        }
    }

    pub fn add_stream(&mut self, stream: StreamId) -> Result<()> {
        if self.queues.position(stream).is_some() {
            return Err(Error::StreamExists(stream));
        }
        debug!("sync engine: adding stream {}", stream);
        self.queues.entries.push(SyncQueueEntry::new(stream));
        Ok(())
    }

    /// Marks the stream as gone. Its queue is retired once drained.
    pub fn remove_stream(&mut self, stream: StreamId) -> Result<()> {
        let entry = self.queues.get_mut(stream)?;
        debug!(
            "sync engine: retiring stream {} ({} events pending)",
            stream,
            entry.events.len()
        );
        entry.connected = false;
        entry.finished = true;
        Ok(())
    }

    pub fn push(&mut self, stream: StreamId, event: Event) -> Result<()> {
        let entry = self.queues.get_mut(stream)?;
        if event.is_bore() {
            if entry.bore.is_some() {
                warn!("ignoring repeated BORE from stream {}", stream);
                return Ok(());
            }
            entry.bore = Some(event.clone());
            self.policy.on_bore(stream, &event);
            self.pending_bores.push(event);
            return Ok(());
        }
        if event.is_eore() {
            if entry.eore.is_some() {
                warn!("ignoring repeated EORE from stream {}", stream);
                return Ok(());
            }
            entry.finished = true;
            entry.eore = Some(event);
            return Ok(());
        }
        if entry.finished {
            warn!(
                "stream {} sent event {} after its end of run",
                stream,
                event.event_n()
            );
        }
        let ts = event.timestamp_begin().unwrap_or(NO_TIMESTAMP);
        if entry.events.back().map_or(false, |last| last.ts > ts) {
            entry.unsorted = true;
        }
        entry.events.push_back(Queued {
            seq: self.next_seq,
            ts,
            event,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Writes everything the policy lets through, returning the number of
    /// events written.
    pub fn process(&mut self, now: Instant, sink: &mut dyn FileWriter) -> Result<usize> {
        let mut count = 0;
        while !self.pending_bores.is_empty() {
            sink.write_event(&self.pending_bores[0])?;
            self.pending_bores.remove(0);
            count += 1;
        }
        while let Some(event) = self.policy.next(&mut self.queues, now) {
            sink.write_event(&event)?;
            count += 1;
        }
        for entry in &mut self.queues.entries {
            if entry.finished && entry.events.is_empty() {
                if let Some(eore) = entry.eore.take() {
                    sink.write_event(&eore)?;
                    count += 1;
                }
            }
        }
        self.queues
            .entries
            .retain(|e| e.connected || !e.events.is_empty());
        self.written += count as u64;
        Ok(count)
    }

    /// Treats every stream as finished and writes out everything left.
    pub fn flush(&mut self, sink: &mut dyn FileWriter) -> Result<usize> {
        for entry in &mut self.queues.entries {
            entry.finished = true;
        }
        self.process(Instant::now(), sink)
    }

    /// All streams are finished and nothing is left to write.
    pub fn is_drained(&self) -> bool {
        self.pending_bores.is_empty()
            && self
                .queues
                .entries
                .iter()
                .all(|e| e.finished && e.events.is_empty() && e.eore.is_none())
    }
}

#[cfg(test)]
pub(crate) fn stamped(event_n: u32, ts: u64) -> Event {
    let mut event = Event::base();
    event.set_event_n(event_n);
    event.set_timestamp(ts, ts + 1);
    event
}

#[cfg(test)]
fn marker(flag: crate::Flags) -> Event {
    let mut event = Event::base();
    event.set_flag(flag);
    event
}

#[test]
fn bores_and_eores_bracket_the_stream() {
    use crate::file::MemoryWriter;
    use crate::Flags;

    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let mut engine = SyncEngine::new(Box::new(PassThrough::default()));
    engine.begin_run(1);
    engine.add_stream(1).unwrap();
    engine.push(1, marker(Flags::BORE)).unwrap();
    engine.push(1, marker(Flags::BORE)).unwrap();
    engine.push(1, stamped(1, 10)).unwrap();
    engine.push(1, marker(Flags::EORE)).unwrap();
    engine.process(Instant::now(), &mut sink).unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert!(events[0].is_bore());
    assert_eq!(events[1].event_n(), 1);
    assert!(events[2].is_eore());
    assert!(engine.is_drained());
    assert_eq!(engine.written(), 3);
}

#[test]
fn disconnected_stream_is_retired_after_drain() {
    use crate::file::MemoryWriter;

    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let mut engine = SyncEngine::new(Box::new(TimestampMerge::new(None)));
    engine.begin_run(1);
    engine.add_stream(1).unwrap();
    engine.add_stream(2).unwrap();
    engine.push(1, stamped(1, 5)).unwrap();
    engine.push(2, stamped(2, 3)).unwrap();
    engine.push(2, stamped(3, 8)).unwrap();

    // stream 1 runs dry, merge has to wait for it
    assert_eq!(engine.process(Instant::now(), &mut sink).unwrap(), 2);
    engine.remove_stream(1).unwrap();
    assert_eq!(engine.process(Instant::now(), &mut sink).unwrap(), 1);
    assert_eq!(engine.queues().len(), 1);
    assert!(matches!(engine.push(1, stamped(4, 9)), Err(Error::UnknownStream(1))));
}

#[test]
fn early_bore_survives_begin_run() {
    use crate::file::MemoryWriter;
    use crate::Flags;

    let mut engine = SyncEngine::new(Box::new(PassThrough::default()));
    engine.add_stream(1).unwrap();
    engine.add_stream(2).unwrap();
    let mut bore = marker(Flags::BORE);
    bore.set_run_n(4);
    engine.push(1, bore).unwrap();
    let mut stale = marker(Flags::BORE);
    stale.set_run_n(3);
    engine.push(2, stale).unwrap();

    let mut sink = MemoryWriter::new();
    sink.start_run(4).unwrap();
    engine.begin_run(4);
    engine.process(Instant::now(), &mut sink).unwrap();
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].run_n(), 4);
    assert!(engine.queues().get(0).unwrap().bore().is_some());
    assert!(engine.queues().get(1).unwrap().bore().is_none());
}

#[test]
fn unknown_and_duplicate_streams() {
    let mut engine = SyncEngine::new(Box::new(PassThrough::default()));
    assert!(matches!(engine.push(3, stamped(0, 0)), Err(Error::UnknownStream(3))));
    engine.add_stream(3).unwrap();
    assert!(matches!(engine.add_stream(3), Err(Error::StreamExists(3))));
}

#[test]
fn policy_selection_from_config() {
    let mut config = Configuration::new();
    assert_eq!(policy_from_config(&config).unwrap().name(), "timestamp");
    config.set("SyncPolicy", "jitter");
    assert_eq!(policy_from_config(&config).unwrap().name(), "jitter");
    config.set("SyncPolicy", "passthrough");
    assert_eq!(policy_from_config(&config).unwrap().name(), "passthrough");
    config.set("SyncPolicy", "bogus");
    assert!(policy_from_config(&config).is_err());
}
