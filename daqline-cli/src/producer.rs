//! Example producer generating random hit data.
//!
//! In trigger mode the producer acts as the reference for jitter alignment:
//! it sends `TRIGGER` events on a perfect clock. Otherwise it sends `RAW`
//! events whose timestamps are smeared by a random jitter, every n-th one
//! marked as a synchronization point.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use daqline_core::{Configuration, Event};
use daqline_net::msg::TAG_EVENT;
use daqline_net::{CancelToken, DataSender, Error, Lifecycle, NodeContext, Result, Status};

/// Tag marking device events that carry a synchronization point.
pub const SYNC_TAG: &str = "SYNC";

const HIT_BYTES: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProducerMode {
    Trigger,
    Device,
}

#[derive(Copy, Clone, Debug)]
pub struct ProducerSettings {
    /// Events per second
    pub rate: f64,
    /// Maximum timestamp jitter in clock ticks
    pub jitter: u64,
    /// Synchronization point interval in events, 0 for none
    pub sync_every: u32,
    /// Clock ticks between consecutive events
    pub period: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            rate: 100.,
            jitter: 0,
            sync_every: 0,
            period: 1000,
        }
    }
}

impl ProducerSettings {
    /// Overrides settings with `EventRate`, `Jitter`, `SyncEvery` and
    /// `ClockPeriod` keys.
    fn apply(&mut self, config: &Configuration) {
        self.rate = config.get_float("EventRate", self.rate);
        self.jitter = config.get_uint("Jitter", self.jitter);
        self.sync_every = config.get_uint("SyncEvery", self.sync_every as u64) as u32;
        self.period = config.get_uint("ClockPeriod", self.period);
    }
}

struct Readout {
    token: CancelToken,
    handle: JoinHandle<()>,
}

pub struct ExampleProducer {
    mode: ProducerMode,
    settings: ProducerSettings,
    /// Events sent in the current run
    sent: Arc<AtomicU32>,
    readout: Option<Readout>,
}

impl ExampleProducer {
    pub fn new(mode: ProducerMode, settings: ProducerSettings) -> Self {
        Self {
            mode,
            settings,
            sent: Arc::new(AtomicU32::new(0)),
            readout: None,
        }
    }

    /// Stops the readout thread, returning the number of events sent.
    fn stop_readout(&mut self) -> u32 {
        if let Some(readout) = self.readout.take() {
            readout.token.cancel();
            if readout.handle.join().is_err() {
                error!("readout thread panicked");
            }
        }
        self.sent.load(Ordering::SeqCst)
    }

    fn empty_event(&self) -> Event {
        match self.mode {
            ProducerMode::Trigger => Event::trigger(0),
            ProducerMode::Device => Event::raw("example"),
        }
    }
}

impl Lifecycle for ExampleProducer {
    fn configure(&mut self, _ctx: &mut NodeContext, config: &Configuration) -> Result<()> {
        self.settings.apply(config);
        if self.settings.rate <= 0. {
            return Err(Error::Other(format!(
                "event rate must be positive, got {}",
                self.settings.rate
            )));
        }
        info!(
            "{:?} mode, {} Hz, jitter {} ticks",
            self.mode, self.settings.rate, self.settings.jitter
        );
        Ok(())
    }

    fn start_run(&mut self, ctx: &mut NodeContext, run_n: u32) -> Result<()> {
        let data = ctx
            .data_sender()
            .ok_or_else(|| Error::NotConfigured("no data collector announced".to_string()))?;
        self.stop_readout();
        self.sent.store(0, Ordering::SeqCst);

        let mut bore = self.empty_event();
        bore.set_timestamp(0, 1);
        data.send_bore(bore, run_n)?;

        let token = ctx.token().child();
        let (_token, sent) = (token.clone(), self.sent.clone());
        let (mode, settings) = (self.mode, self.settings);
        let handle = thread::Builder::new()
            .name("readout".to_string())
            .spawn(move || readout_loop(data, mode, settings, run_n, sent, _token))?;
        self.readout = Some(Readout { token, handle });
        Ok(())
    }

    fn stop_run(&mut self, ctx: &mut NodeContext) -> Result<()> {
        let sent = self.stop_readout();
        let data = ctx
            .data_sender()
            .ok_or_else(|| Error::NotConfigured("no data collector announced".to_string()))?;
        let run_n = ctx.run_n().unwrap_or(0);
        info!("run {} stopped after {} event(s)", run_n, sent);
        data.send_eore(self.empty_event(), run_n, sent + 1)
    }

    fn reset(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.stop_readout();
        Ok(())
    }

    fn terminate(&mut self, _ctx: &mut NodeContext) -> Result<()> {
        self.stop_readout();
        Ok(())
    }

    fn status(&self, _ctx: &NodeContext, status: &mut Status) {
        if self.readout.is_some() {
            status.set_tag(TAG_EVENT, self.sent.load(Ordering::SeqCst));
        }
    }
}

fn readout_loop(
    data: DataSender,
    mode: ProducerMode,
    settings: ProducerSettings,
    run_n: u32,
    sent: Arc<AtomicU32>,
    token: CancelToken,
) {
    let interval = Duration::from_secs_f64(1. / settings.rate);
    let mut rng = rand::thread_rng();
    let mut event_n = 0;
    while !token.sleep(interval) {
        event_n += 1;
        let event = generate(mode, &settings, run_n, event_n, &mut rng);
        match data.send_event(&event) {
            Ok(()) => (),
            // the node drops the lost collectors and reports them
            Err(e @ Error::DeliveryFailed(_)) => warn!("event {}: {}", event_n, e),
            Err(e) => {
                error!("sending event {} failed: {}", event_n, e);
                break;
            }
        }
        sent.store(event_n, Ordering::SeqCst);
    }
    debug!("readout finished after {} event(s)", event_n);
}

/// Builds event `event_n` of a run. Nominal timestamps are multiples of the
/// clock period, device events get a uniform jitter on top.
fn generate<R: Rng>(
    mode: ProducerMode,
    settings: &ProducerSettings,
    run_n: u32,
    event_n: u32,
    rng: &mut R,
) -> Event {
    let nominal = event_n as u64 * settings.period;
    let mut event = match mode {
        ProducerMode::Trigger => {
            let mut event = Event::trigger(event_n);
            event.set_timestamp(nominal, nominal + 1);
            event
        }
        ProducerMode::Device => {
            let jitter = settings.jitter as i64;
            let ts = if jitter > 0 {
                (nominal as i64 + rng.gen_range(-jitter, jitter + 1)).max(0) as u64
            } else {
                nominal
            };
            let mut event = Event::raw("example");
            event.set_timestamp(ts, ts + 1);
            if let Some(raw) = event.body_mut().as_raw_mut() {
                let hits: Vec<u8> = (0..HIT_BYTES).map(|_| rng.gen()).collect();
                raw.add_block(0, hits);
            }
            if settings.sync_every > 0 && event_n % settings.sync_every == 0 {
                event.set_tag(SYNC_TAG, 1);
            }
            event
        }
    };
    event.set_run_n(run_n);
    event.set_event_n(event_n);
    event
}

#[test]
fn trigger_events_follow_the_clock() {
    let settings = ProducerSettings::default();
    let mut rng = rand::thread_rng();
    for n in 1..5 {
        let event = generate(ProducerMode::Trigger, &settings, 2, n, &mut rng);
        assert_eq!(event.timestamp_begin(), Some(n as u64 * 1000));
        assert_eq!(event.body().as_trigger().map(|t| t.trigger_n), Some(n));
        assert_eq!(event.run_n(), 2);
    }
}

#[test]
fn device_jitter_stays_in_bounds() {
    let settings = ProducerSettings {
        jitter: 20,
        sync_every: 4,
        ..ProducerSettings::default()
    };
    let mut rng = rand::thread_rng();
    for n in 1..200 {
        let event = generate(ProducerMode::Device, &settings, 1, n, &mut rng);
        let ts = event.timestamp_begin().unwrap() as i64;
        assert!((ts - n as i64 * 1000).abs() <= 20);
        assert_eq!(event.tag(SYNC_TAG).is_some(), n % 4 == 0);
        assert_eq!(event.body().as_raw().unwrap().blocks()[0].1.len(), HIT_BYTES);
    }
}

#[test]
fn settings_follow_the_configuration() {
    let mut config = Configuration::new();
    config.set("EventRate", 2.5);
    config.set("Jitter", 7);
    let mut settings = ProducerSettings::default();
    settings.apply(&config);
    assert_eq!(settings.rate, 2.5);
    assert_eq!(settings.jitter, 7);
    assert_eq!(settings.period, 1000);
}
