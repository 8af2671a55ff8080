use std::time::Instant;

use super::{SyncPolicy, SyncQueues};
use crate::Event;

/// Writes events in the order they arrived, regardless of stream.
#[derive(Default)]
pub struct PassThrough;

impl SyncPolicy for PassThrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn next(&mut self, queues: &mut SyncQueues, _now: Instant) -> Option<Event> {
        let (_, index) = queues
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.front_seq().map(|seq| (seq, index)))
            .min()?;
        queues.pop(index)
    }
}

#[test]
fn arrival_order_is_kept() {
    use super::{stamped, SyncEngine};
    use crate::file::{FileWriter, MemoryWriter};

    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let mut engine = SyncEngine::new(Box::new(PassThrough));
    engine.begin_run(1);
    engine.add_stream(1).unwrap();
    engine.add_stream(2).unwrap();
    engine.push(2, stamped(1, 50)).unwrap();
    engine.push(1, stamped(2, 10)).unwrap();
    engine.push(2, stamped(3, 20)).unwrap();
    engine.process(Instant::now(), &mut sink).unwrap();

    let order: Vec<u32> = sink.events().iter().map(|e| e.event_n()).collect();
    assert_eq!(order, vec![1, 2, 3]);
}
