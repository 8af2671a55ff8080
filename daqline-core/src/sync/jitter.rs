//! Alignment of a device stream against a reference trigger stream.
//!
//! The reference stream is the one whose BORE is a `TRIGGER` event; the
//! first other stream becomes the device. Device timestamps are mapped onto
//! the reference clock with
//!
//! ```text
//! corrected = dev_ts + drift + ((dev_ts - sync_dev_ts) / denominator) * offset
//! ```
//!
//! where `drift` and `sync_dev_ts` are re-anchored on every device event
//! accepted by the sync predicate. A device event matches the reference
//! event at the front of the reference queue when `corrected` falls into
//! `[ref_ts, ref_ts + active_time)`.
//!
//! Every input event is written exactly once: matched pairs as a packet of
//! two, device events falling before the window alone, reference events
//! with no device event in their window alone. Each output carries an
//! `ALIGNMENT` tag saying which case it was.

use std::time::Instant;

use super::{StreamId, SyncPolicy, SyncQueues};
use crate::event::{NO_TIMESTAMP, TYPE_TRIGGER};
use crate::Event;

pub const ALIGNMENT_TAG: &str = "ALIGNMENT";
pub const ALIGNMENT_DELTA_TAG: &str = "ALIGNMENT_DELTA";

/// Decides whether a device event carries a synchronization point.
pub type SyncPredicate = Box<dyn Fn(&Event) -> bool + Send>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JitterParams {
    /// Device clock ticks per correction step, 0 disables the step
    /// correction
    pub denominator: u64,
    /// Correction applied per step
    pub offset: u64,
    /// Assumed distance between events lacking a timestamp
    pub default_delta: u64,
    /// Width of the matching window
    pub active_time: u64,
}

impl Default for JitterParams {
    fn default() -> Self {
        Self {
            denominator: 0,
            offset: 0,
            default_delta: 0,
            active_time: 1,
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
enum Side {
    Ready(usize),
    Waiting,
    Done,
}

pub struct JitterAlignment {
    params: JitterParams,
    is_sync: SyncPredicate,

    reference: Option<StreamId>,
    device: Option<StreamId>,
    ref_bore_ts: Option<u64>,
    dev_bore_ts: Option<u64>,

    drift: i128,
    sync_dev_ts: u64,

    last_ref_ts: Option<u64>,
    last_dev_ts: Option<u64>,

    matched: u64,
    mismatched: u64,
    unmatched: u64,
}

impl JitterAlignment {
    /// Creates the policy with device events tagged `SYNC=1` as sync points.
    pub fn new(params: JitterParams) -> Self {
        Self::with_predicate(params, Box::new(|e: &Event| e.tag("SYNC") == Some("1")))
    }

    pub fn with_predicate(params: JitterParams, is_sync: SyncPredicate) -> Self {
        Self {
            params,
            is_sync,
            reference: None,
            device: None,
            ref_bore_ts: None,
            dev_bore_ts: None,
            drift: 0,
            sync_dev_ts: 0,
            last_ref_ts: None,
            last_dev_ts: None,
            matched: 0,
            mismatched: 0,
            unmatched: 0,
        }
    }

    pub fn params(&self) -> &JitterParams {
        &self.params
    }

    /// Counts of matched pairs, early device events and unmatched
    /// reference events in the current run.
    pub fn counts(&self) -> (u64, u64, u64) {
        (self.matched, self.mismatched, self.unmatched)
    }

    /// Maps a device timestamp onto the reference clock.
    pub fn corrected(&self, dev_ts: u64) -> i128 {
        let steps = if self.params.denominator == 0 {
            0
        } else {
            dev_ts.saturating_sub(self.sync_dev_ts) / self.params.denominator
        };
        dev_ts as i128 + self.drift + steps as i128 * self.params.offset as i128
    }

    fn anchor(&mut self, ref_ts: u64, dev_ts: u64) {
        self.drift = ref_ts as i128 - dev_ts as i128;
        self.sync_dev_ts = dev_ts;
    }

    fn side(&self, queues: &SyncQueues, stream: Option<StreamId>) -> Side {
        let stream = match stream {
            Some(s) => s,
            // role not taken yet, the stream may still show up
            None if queues.all_finished() => return Side::Done,
            None => return Side::Waiting,
        };
        match queues.position(stream) {
            Some(index) => {
                let entry = queues.get(index).map(|e| (e.is_empty(), e.is_finished()));
                match entry {
                    Some((false, _)) => Side::Ready(index),
                    Some((true, true)) => Side::Done,
                    _ => Side::Waiting,
                }
            }
            // retired after disconnect
            None => Side::Done,
        }
    }

    fn ref_time(&self, event: &Event) -> u64 {
        event.timestamp_begin().unwrap_or_else(|| {
            self.last_ref_ts
                .or(self.ref_bore_ts)
                .unwrap_or(0)
                .saturating_add(self.params.default_delta)
        })
    }

    fn dev_time(&self, event: &Event) -> u64 {
        event.timestamp_begin().unwrap_or_else(|| {
            self.last_dev_ts
                .or(self.dev_bore_ts)
                .unwrap_or(0)
                .saturating_add(self.params.default_delta)
        })
    }

    fn emit_unmatched(&mut self, queues: &mut SyncQueues, index: usize) -> Option<Event> {
        let mut event = queues.pop(index)?;
        self.last_ref_ts = Some(self.ref_time(&event));
        self.unmatched += 1;
        event.set_tag(ALIGNMENT_TAG, "UNMATCHED");
        Some(event)
    }

    fn emit_mismatched(
        &mut self,
        queues: &mut SyncQueues,
        index: usize,
        delta: Option<i128>,
    ) -> Option<Event> {
        let mut event = queues.pop(index)?;
        self.last_dev_ts = Some(self.dev_time(&event));
        self.mismatched += 1;
        event.set_tag(ALIGNMENT_TAG, "MISMATCHED");
        if let Some(delta) = delta {
            event.set_tag(ALIGNMENT_DELTA_TAG, delta);
        }
        Some(event)
    }

    fn align(&mut self, queues: &mut SyncQueues, ri: usize, di: usize) -> Option<Event> {
        let (ref_ts, dev_ts, sync) = {
            let ref_ev = queues.get(ri)?.front()?;
            let dev_ev = queues.get(di)?.front()?;
            (self.ref_time(ref_ev), self.dev_time(dev_ev), (self.is_sync)(dev_ev))
        };
        if sync {
            debug!("sync point: ref {} dev {}", ref_ts, dev_ts);
            self.anchor(ref_ts, dev_ts);
        }

        let corrected = self.corrected(dev_ts);
        let delta = corrected - ref_ts as i128;
        if delta < 0 {
            trace!("device ts {} (corrected {}) before ref {}", dev_ts, corrected, ref_ts);
            return self.emit_mismatched(queues, di, Some(delta));
        }
        if delta >= self.params.active_time as i128 {
            trace!("no device event for ref {}", ref_ts);
            return self.emit_unmatched(queues, ri);
        }

        let ref_ev = queues.pop(ri)?;
        let dev_ev = queues.pop(di)?;
        self.last_ref_ts = Some(ref_ts);
        self.last_dev_ts = Some(dev_ts);
        self.matched += 1;

        let mut packet = Event::packet();
        packet.set_run_n(ref_ev.run_n());
        packet.set_event_n(ref_ev.event_n());
        packet.set_timestamp(
            ref_ev.timestamp_begin().unwrap_or(NO_TIMESTAMP),
            ref_ev.timestamp_end().unwrap_or(NO_TIMESTAMP),
        );
        packet.set_tag(ALIGNMENT_TAG, "MATCHED");
        packet.set_tag(ALIGNMENT_DELTA_TAG, delta);
        packet.add_child(ref_ev);
        packet.add_child(dev_ev);
        Some(packet)
    }
}

impl SyncPolicy for JitterAlignment {
    fn name(&self) -> &'static str {
        "jitter"
    }

    fn on_bore(&mut self, stream: StreamId, bore: &Event) {
        if self.reference.is_none() && bore.type_id() == TYPE_TRIGGER {
            debug!("stream {} is the alignment reference", stream);
            self.reference = Some(stream);
            self.ref_bore_ts = bore.timestamp_begin();
        } else if self.device.is_none() && self.reference != Some(stream) {
            debug!("stream {} is the aligned device", stream);
            self.device = Some(stream);
            self.dev_bore_ts = bore.timestamp_begin();
        } else {
            warn!("stream {} takes no part in alignment, passing through", stream);
            return;
        }
        if let (Some(ref_ts), Some(dev_ts)) = (self.ref_bore_ts, self.dev_bore_ts) {
            self.anchor(ref_ts, dev_ts);
        }
    }

    fn next(&mut self, queues: &mut SyncQueues, _now: Instant) -> Option<Event> {
        let extra = queues.iter().position(|e| {
            !e.is_empty() && Some(e.stream()) != self.reference && Some(e.stream()) != self.device
        });
        if let Some(index) = extra {
            let mut event = queues.pop(index)?;
            event.set_tag(ALIGNMENT_TAG, "UNALIGNED");
            return Some(event);
        }

        match (self.side(queues, self.reference), self.side(queues, self.device)) {
            (Side::Ready(ri), Side::Ready(di)) => self.align(queues, ri, di),
            (Side::Ready(ri), Side::Done) => self.emit_unmatched(queues, ri),
            (Side::Done, Side::Ready(di)) => self.emit_mismatched(queues, di, None),
            _ => None,
        }
    }

    fn reset(&mut self) {
        if self.matched + self.mismatched + self.unmatched > 0 {
            info!(
                "alignment: {} matched, {} device only, {} reference only",
                self.matched, self.mismatched, self.unmatched
            );
        }
        let params = self.params;
        let is_sync = std::mem::replace(&mut self.is_sync, Box::new(|_: &Event| false));
        *self = Self::with_predicate(params, is_sync);
    }
}

#[cfg(test)]
use super::SyncEngine;
#[cfg(test)]
use crate::file::{FileWriter, MemoryWriter};
#[cfg(test)]
use crate::Flags;

#[cfg(test)]
fn run_trace(params: JitterParams, refs: &[u64], devs: &[(u64, bool)]) -> Vec<Event> {
    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let mut engine = SyncEngine::new(Box::new(JitterAlignment::new(params)));
    engine.begin_run(1);
    engine.add_stream(1).unwrap();
    engine.add_stream(2).unwrap();

    let mut ref_bore = Event::trigger(0);
    ref_bore.set_flag(Flags::BORE);
    let mut dev_bore = Event::raw("dut");
    dev_bore.set_flag(Flags::BORE);
    engine.push(2, dev_bore).unwrap();
    engine.push(1, ref_bore).unwrap();

    for (n, ts) in refs.iter().enumerate() {
        let mut event = Event::trigger(n as u32);
        event.set_event_n(n as u32);
        event.set_timestamp(*ts, ts + 25);
        engine.push(1, event).unwrap();
    }
    for (n, (ts, sync)) in devs.iter().enumerate() {
        let mut event = Event::raw("dut");
        event.set_event_n(n as u32);
        event.set_timestamp(*ts, ts + 1);
        if *sync {
            event.set_tag("SYNC", 1);
        }
        engine.push(2, event).unwrap();
    }
    engine.process(Instant::now(), &mut sink).unwrap();
    engine.flush(&mut sink).unwrap();
    assert!(engine.is_drained());

    sink.events().into_iter().filter(|e| !e.is_bore()).collect()
}

#[cfg(test)]
fn alignment(events: &[Event]) -> Vec<(String, Option<String>)> {
    events
        .iter()
        .map(|e| {
            (
                e.tag(ALIGNMENT_TAG).unwrap_or("").to_string(),
                e.tag(ALIGNMENT_DELTA_TAG).map(|d| d.to_string()),
            )
        })
        .collect()
}

#[cfg(test)]
const REFS: [u64; 4] = [10_000, 11_000, 12_000, 13_000];
#[cfg(test)]
const DEVS: [(u64, bool); 4] = [(0, true), (995, false), (1990, false), (2985, false)];

#[test]
fn compensated_jitter_matches_every_event() {
    let params = JitterParams {
        denominator: 199,
        offset: 1,
        default_delta: 1000,
        active_time: 100,
    };
    let events = run_trace(params, &REFS, &DEVS);
    assert_eq!(events.len(), 4);
    for (n, event) in events.iter().enumerate() {
        assert!(event.is_packet());
        assert_eq!(event.tag(ALIGNMENT_TAG), Some("MATCHED"));
        assert_eq!(event.tag(ALIGNMENT_DELTA_TAG), Some("0"));
        assert_eq!(event.event_n(), n as u32);
        assert_eq!(event.children().len(), 2);
        assert_eq!(event.children()[0].type_id(), TYPE_TRIGGER);
        assert_eq!(event.children()[1].event_n(), n as u32);
    }
}

#[test]
fn uncompensated_jitter_is_reported_not_dropped() {
    let params = JitterParams {
        denominator: 0,
        offset: 0,
        default_delta: 1000,
        active_time: 100,
    };
    let events = run_trace(params, &REFS, &DEVS);
    let m = |d: &str| ("MISMATCHED".to_string(), Some(d.to_string()));
    let u = || ("UNMATCHED".to_string(), None);
    assert_eq!(
        alignment(&events),
        vec![
            ("MATCHED".to_string(), Some("0".to_string())),
            m("-5"),
            u(),
            m("-10"),
            u(),
            m("-15"),
            u(),
        ]
    );
    // every input event appears exactly once
    let total: usize = events
        .iter()
        .map(|e| if e.is_packet() { e.children().len() } else { 1 })
        .sum();
    assert_eq!(total, REFS.len() + DEVS.len());
}

#[test]
fn resync_bounds_drift() {
    let params = JitterParams {
        denominator: 0,
        offset: 0,
        default_delta: 1000,
        active_time: 12,
    };
    let refs = [10_000, 11_000, 12_000, 13_000, 14_000];
    let devs = [(0, true), (1005, false), (2010, true), (3015, false), (4020, false)];
    let events = run_trace(params, &refs, &devs);
    assert_eq!(events.len(), 5);
    assert!(events
        .iter()
        .all(|e| e.tag(ALIGNMENT_TAG) == Some("MATCHED")));

    let devs = [(0, true), (1005, false), (2010, false), (3015, false), (4020, false)];
    let events = run_trace(params, &refs, &devs);
    assert_eq!(events[3].tag(ALIGNMENT_TAG), Some("UNMATCHED"));
}

#[test]
fn missing_timestamps_are_extrapolated() {
    let mut policy = JitterAlignment::new(JitterParams {
        default_delta: 500,
        ..JitterParams::default()
    });
    let mut bore = Event::trigger(0);
    bore.set_timestamp(100, 100);
    policy.on_bore(7, &bore);
    assert_eq!(policy.ref_time(&Event::trigger(1)), 600);
    policy.last_ref_ts = Some(2000);
    assert_eq!(policy.ref_time(&Event::trigger(2)), 2500);
    assert_eq!(policy.dev_time(&Event::raw("dut")), 500);
}

#[test]
fn third_stream_passes_through_unaligned() {
    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let params = JitterParams {
        active_time: 100,
        ..JitterParams::default()
    };
    let mut engine = SyncEngine::new(Box::new(JitterAlignment::new(params)));
    engine.begin_run(1);
    for stream in 1..=3 {
        engine.add_stream(stream).unwrap();
    }
    let bore = |mut event: Event| {
        event.set_flag(Flags::BORE);
        event
    };
    engine.push(1, bore(Event::trigger(0))).unwrap();
    engine.push(2, bore(Event::raw("dut"))).unwrap();
    engine.push(3, bore(Event::raw("extra"))).unwrap();

    for n in 0..3u32 {
        let ts = 1000 * n as u64;
        let mut trigger = Event::trigger(n);
        trigger.set_event_n(n);
        trigger.set_timestamp(ts, ts + 25);
        engine.push(1, trigger).unwrap();
        let mut dut = Event::raw("dut");
        dut.set_event_n(n);
        dut.set_timestamp(ts, ts + 1);
        engine.push(2, dut).unwrap();
        let mut extra = Event::raw("extra");
        extra.set_event_n(n);
        extra.set_timestamp(ts + 500, ts + 501);
        engine.push(3, extra).unwrap();
    }
    engine.flush(&mut sink).unwrap();

    let events: Vec<Event> = sink
        .events()
        .into_iter()
        .filter(|e| !e.is_bore() && !e.is_eore())
        .collect();
    assert_eq!(events.len(), 6);
    let unaligned: Vec<u32> = events
        .iter()
        .filter(|e| e.tag(ALIGNMENT_TAG) == Some("UNALIGNED"))
        .map(|e| e.event_n())
        .collect();
    assert_eq!(unaligned, vec![0, 1, 2]);
    assert!(events
        .iter()
        .filter(|e| e.tag(ALIGNMENT_TAG) == Some("MATCHED"))
        .all(|e| e.is_packet() && e.children().len() == 2));
    assert_eq!(
        events
            .iter()
            .filter(|e| e.tag(ALIGNMENT_TAG) == Some("MATCHED"))
            .count(),
        3
    );
}
