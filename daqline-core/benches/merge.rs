use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use daqline_core::file::{FileWriter, MemoryWriter};
use daqline_core::sync::{JitterAlignment, JitterParams, PassThrough, TimestampMerge};
use daqline_core::{Event, Registry, SyncEngine, SyncPolicy};

criterion_group!(merge, merge_4x1000, passthrough_4x1000, align_1000, decode_packet);
criterion_main!(merge);

fn stamped(event_n: u32, ts: u64) -> Event {
    let mut event = Event::raw("bench");
    event.set_event_n(event_n);
    event.set_timestamp(ts, ts + 1);
    event
}

fn run(policy: Box<dyn SyncPolicy>, streams: u32, events: u32) -> usize {
    let mut sink = MemoryWriter::new();
    sink.start_run(1).unwrap();
    let mut engine = SyncEngine::new(policy);
    engine.begin_run(1);
    for stream in 0..streams {
        engine.add_stream(stream).unwrap();
    }
    for n in 0..events {
        for stream in 0..streams {
            engine
                .push(stream, stamped(n, (n * streams + stream) as u64))
                .unwrap();
        }
        engine.process(Instant::now(), &mut sink).unwrap();
    }
    engine.flush(&mut sink).unwrap();
    sink.events().len()
}

fn merge_4x1000(c: &mut Criterion) {
    c.bench_function("merge_4x1000", |b| {
        b.iter(|| black_box(run(Box::new(TimestampMerge::new(None)), 4, 1000)))
    });
}

fn passthrough_4x1000(c: &mut Criterion) {
    c.bench_function("passthrough_4x1000", |b| {
        b.iter(|| black_box(run(Box::new(PassThrough), 4, 1000)))
    });
}

fn align_1000(c: &mut Criterion) {
    let params = JitterParams {
        denominator: 199,
        offset: 1,
        default_delta: 1000,
        active_time: 100,
    };
    c.bench_function("align_1000", |b| {
        b.iter(|| black_box(run(Box::new(JitterAlignment::new(params)), 2, 1000)))
    });
}

fn decode_packet(c: &mut Criterion) {
    let registry = Registry::with_builtins();
    let mut packet = Event::packet();
    for n in 0..16 {
        let mut child = Event::raw("plane");
        if let Some(raw) = child.body_mut().as_raw_mut() {
            raw.add_block(n, vec![0xAB; 256]);
        }
        packet.add_child(child);
    }
    let bytes = packet.to_bytes();
    c.bench_function("decode_packet_16", |b| {
        b.iter(|| black_box(registry.decode_bytes(&bytes).unwrap()))
    });
}
