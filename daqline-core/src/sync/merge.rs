use std::time::{Duration, Instant};

use super::{SyncPolicy, SyncQueueEntry, SyncQueues};
use crate::event::NO_TIMESTAMP;
use crate::Event;

/// Tag set on events written after a later timestamp already went out.
pub const LATE_TAG: &str = "LATE";

/// Stable k-way merge on begin timestamps.
///
/// The next event written is the one with the smallest timestamp across all
/// buffered events. Ties go to the earlier event within a queue, then to
/// the queue registered first. As long as a stream that hasn't finished has
/// nothing buffered, the merge waits for it, unless a stall timeout is set
/// and the stream has been empty for longer than that.
///
/// Events without a timestamp sort last. Only queue fronts are compared
/// unless a stream sent its events out of timestamp order.
#[derive(Default)]
pub struct TimestampMerge {
    stall_timeout: Option<Duration>,
    /// Highest timestamp written so far in this run
    watermark: Option<u64>,
}

impl TimestampMerge {
    pub fn new(stall_timeout: Option<Duration>) -> Self {
        Self {
            stall_timeout,
            watermark: None,
        }
    }

    fn is_stalled(&self, entry: &SyncQueueEntry, now: Instant) -> bool {
        match (self.stall_timeout, entry.empty_for(now)) {
            (Some(timeout), Some(empty)) => empty >= timeout,
            _ => false,
        }
    }
}

impl SyncPolicy for TimestampMerge {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn next(&mut self, queues: &mut SyncQueues, now: Instant) -> Option<Event> {
        // (queue index, position in queue, timestamp)
        let mut best: Option<(usize, usize, u64)> = None;
        for (index, entry) in queues.iter().enumerate() {
            if entry.is_empty() {
                if !entry.is_finished() && !self.is_stalled(entry, now) {
                    return None;
                }
                continue;
            }
            let (pos, ts) = entry.earliest()?;
            if best.map_or(true, |(_, _, best_ts)| ts < best_ts) {
                best = Some((index, pos, ts));
            }
        }

        let (index, pos, ts) = best?;
        let mut event = queues.take(index, pos)?;
        if ts != NO_TIMESTAMP {
            match self.watermark {
                Some(mark) if ts < mark => {
                    warn!(
                        "event {} (ts {}) arrived after ts {} was written",
                        event.event_n(),
                        ts,
                        mark
                    );
                    event.set_tag(LATE_TAG, 1);
                }
                Some(mark) => self.watermark = Some(mark.max(ts)),
                None => self.watermark = Some(ts),
            }
        }
        Some(event)
    }

    fn reset(&mut self) {
        self.watermark = None;
    }
}

#[cfg(test)]
use super::{stamped, SyncEngine};
#[cfg(test)]
use crate::file::{FileWriter, MemoryWriter};

#[cfg(test)]
fn engine(streams: u32, stall: Option<Duration>) -> (SyncEngine, MemoryWriter) {
    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let mut engine = SyncEngine::new(Box::new(TimestampMerge::new(stall)));
    engine.begin_run(1);
    for stream in 0..streams {
        engine.add_stream(stream).unwrap();
    }
    (engine, sink)
}

#[cfg(test)]
fn timestamps(sink: &MemoryWriter) -> Vec<u64> {
    sink.events()
        .iter()
        .filter_map(|e| e.timestamp_begin())
        .collect()
}

#[test]
fn three_streams_merge_in_order() {
    let (mut engine, mut sink) = engine(3, None);
    for (stream, list) in [vec![5, 1, 9], vec![3, 7], vec![2, 4, 8]].iter().enumerate() {
        for ts in list {
            engine.push(stream as u32, stamped(*ts as u32, *ts)).unwrap();
        }
    }

    engine.process(Instant::now(), &mut sink).unwrap();
    // stream 1 is exhausted after 7, the merge waits for it
    assert_eq!(timestamps(&sink), vec![1, 2, 3, 4, 5, 7]);

    engine.flush(&mut sink).unwrap();
    assert_eq!(timestamps(&sink), vec![1, 2, 3, 4, 5, 7, 8, 9]);
    assert!(engine.is_drained());
}

#[test]
fn equal_timestamps_keep_queue_order() {
    let (mut engine, mut sink) = engine(2, None);
    engine.push(1, stamped(10, 4)).unwrap();
    engine.push(0, stamped(1, 4)).unwrap();
    engine.push(0, stamped(2, 4)).unwrap();
    engine.flush(&mut sink).unwrap();

    let order: Vec<u32> = sink.events().iter().map(|e| e.event_n()).collect();
    assert_eq!(order, vec![1, 2, 10]);
}

#[test]
fn out_of_order_stream_is_still_merged() {
    let (mut engine, mut sink) = engine(2, None);
    engine.push(0, stamped(1, 5)).unwrap();
    engine.push(0, stamped(2, 1)).unwrap();
    engine.push(0, stamped(3, 9)).unwrap();
    engine.push(1, stamped(4, 3)).unwrap();
    engine.push(1, stamped(5, 7)).unwrap();
    engine.flush(&mut sink).unwrap();
    assert_eq!(timestamps(&sink), vec![1, 3, 5, 7, 9]);
    assert!(sink.events().iter().all(|e| e.tag(LATE_TAG).is_none()));
}

#[test]
fn stalled_stream_is_skipped_and_late_events_tagged() {
    let (mut engine, mut sink) = engine(2, Some(Duration::from_millis(50)));
    engine.push(0, stamped(1, 10)).unwrap();
    engine.push(0, stamped(2, 20)).unwrap();

    // stream 1 has been empty for less than the timeout
    engine.process(Instant::now(), &mut sink).unwrap();
    assert!(sink.events().is_empty());

    let later = Instant::now() + Duration::from_millis(100);
    engine.process(later, &mut sink).unwrap();
    assert_eq!(timestamps(&sink), vec![10, 20]);

    engine.push(1, stamped(3, 15)).unwrap();
    engine.flush(&mut sink).unwrap();
    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].tag(LATE_TAG), Some("1"));
    assert_eq!(events[1].tag(LATE_TAG), None);
}

#[test]
fn merged_output_is_sorted_for_any_interleaving() {
    // pseudo-random push order, each stream sorted on its own
    let mut seed: u64 = 0x2545_f491;
    for _ in 0..20 {
        let (mut engine, mut sink) = engine(4, None);
        let mut next_ts = [0u64; 4];
        let mut expected = Vec::new();
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let stream = ((seed >> 33) % 4) as usize;
            next_ts[stream] += (seed >> 40) % 7;
            expected.push(next_ts[stream]);
            engine
                .push(stream as u32, stamped(0, next_ts[stream]))
                .unwrap();
            engine.process(Instant::now(), &mut sink).unwrap();
        }
        engine.flush(&mut sink).unwrap();
        expected.sort();
        assert_eq!(timestamps(&sink), expected);
        assert!(sink.events().iter().all(|e| e.tag(LATE_TAG).is_none()));
    }
}
