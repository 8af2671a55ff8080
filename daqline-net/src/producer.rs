//! Producer side of the data path.

use std::sync::{Arc, Mutex};

use daqline_core::{Event, Flags};

use crate::client::ClientSender;
use crate::util::lock;
use crate::{Error, Result};

/// Connection to one collector.
#[derive(Clone)]
struct Target {
    addr: String,
    sender: ClientSender,
}

/// Sends events to every data collector the producer is connected to.
///
/// Obtained from `NodeContext::data_sender` once run control announced the
/// collectors. Clones share the list of connections, so a sender moved to a
/// readout thread keeps following collectors that are lost or announced
/// later.
#[derive(Clone, Default)]
pub struct DataSender {
    targets: Arc<Mutex<Vec<Target>>>,
}

impl DataSender {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds the connection to the collector at `addr`, replacing an older
    /// one to the same address.
    pub(crate) fn add(&self, addr: &str, sender: ClientSender) {
        let mut targets = lock(&self.targets);
        targets.retain(|t| t.addr != addr);
        targets.push(Target {
            addr: addr.to_string(),
            sender,
        });
    }

    /// Forgets the collector at `addr`, returning whether it was known.
    pub(crate) fn remove(&self, addr: &str) -> bool {
        let mut targets = lock(&self.targets);
        let before = targets.len();
        targets.retain(|t| t.addr != addr);
        targets.len() != before
    }

    /// Number of collectors events go to.
    pub fn collectors(&self) -> usize {
        lock(&self.targets).len()
    }

    /// Addresses of the collectors events go to.
    pub fn addresses(&self) -> Vec<String> {
        lock(&self.targets).iter().map(|t| t.addr.clone()).collect()
    }

    /// Encodes the event once and queues it for every collector.
    ///
    /// Every collector is tried even if some of them fail. The failures are
    /// reported together as `DeliveryFailed`.
    pub fn send_event(&self, event: &Event) -> Result<()> {
        // a full queue blocks, so don't hold the lock while sending
        let targets = lock(&self.targets).clone();
        if targets.is_empty() {
            return Err(Error::SocketNotConnected);
        }
        let bytes = event.to_bytes();
        let failures: Vec<(String, Error)> = targets
            .into_iter()
            .filter_map(|t| t.sender.send(bytes.clone()).err().map(|e| (t.addr, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::DeliveryFailed(failures))
        }
    }

    /// Sends `event` as the begin-of-run event of `run_n`.
    pub fn send_bore(&self, mut event: Event, run_n: u32) -> Result<()> {
        event.set_flag(Flags::BORE);
        event.set_run_n(run_n);
        event.set_event_n(0);
        self.send_event(&event)
    }

    /// Sends `event` as the end-of-run event of `run_n`, numbered after the
    /// last data event.
    pub fn send_eore(&self, mut event: Event, run_n: u32, event_n: u32) -> Result<()> {
        event.set_flag(Flags::EORE);
        event.set_run_n(run_n);
        event.set_event_n(event_n);
        self.send_event(&event)
    }
}

#[cfg(test)]
use crate::{CancelToken, Client, Server, ServerEvent, SocketConfig};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn received(server: &Server, wait: Duration) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Ok(event) = server.events().recv_timeout(wait) {
        if let ServerEvent::Receive(_, bytes) = event {
            out.push(bytes);
        }
    }
    out
}

#[test]
fn events_reach_the_collector_decodable() {
    use daqline_core::Registry;

    let token = CancelToken::new();
    let server = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let client = Client::connect(&server.address(), "Producer", "p", SocketConfig::default(), &token)
        .unwrap();
    let sender = DataSender::new();
    sender.add(&server.address(), client.sender());
    assert_eq!(sender.collectors(), 1);

    sender.send_bore(Event::raw("tel"), 3).unwrap();
    let mut event = Event::raw("tel");
    event.set_run_n(3);
    event.set_event_n(1);
    sender.send_event(&event).unwrap();
    sender.send_eore(Event::raw("tel"), 3, 2).unwrap();

    let registry = Registry::with_builtins();
    let decoded: Vec<Event> = received(&server, Duration::from_millis(500))
        .iter()
        .map(|bytes| registry.decode_bytes(bytes).unwrap())
        .collect();
    assert_eq!(decoded.len(), 3);
    assert!(decoded[0].is_bore());
    assert_eq!(decoded[0].run_n(), 3);
    assert_eq!(decoded[1], event);
    assert!(decoded[2].is_eore());
    assert_eq!(decoded[2].event_n(), 2);
    token.cancel();
}

#[test]
fn dead_collector_does_not_block_the_others() {
    let token = CancelToken::new();
    let dead = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let live = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let to_dead = Client::connect(&dead.address(), "Producer", "p", SocketConfig::default(), &token)
        .unwrap();
    let to_live = Client::connect(&live.address(), "Producer", "p", SocketConfig::default(), &token)
        .unwrap();
    let sender = DataSender::new();
    sender.add(&dead.address(), to_dead.sender());
    sender.add(&live.address(), to_live.sender());

    dead.shutdown();
    loop {
        match to_dead.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            crate::ClientEvent::Disconnect => break,
            crate::ClientEvent::Receive(_) => (),
        }
    }
    // the writer thread of the dead connection may take a moment to exit
    let mut result = Ok(());
    for _ in 0..50 {
        result = sender.send_event(&Event::raw("tel"));
        if result.is_err() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    match result {
        Err(Error::DeliveryFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, dead.address());
        }
        other => panic!("expected a delivery failure, got {:?}", other),
    }
    assert!(!received(&live, Duration::from_millis(300)).is_empty());

    assert!(sender.remove(&dead.address()));
    assert!(!sender.remove(&dead.address()));
    assert_eq!(sender.addresses(), vec![live.address()]);
    sender.send_event(&Event::raw("tel")).unwrap();
    token.cancel();
}

#[test]
fn sending_without_collectors_fails() {
    let sender = DataSender::new();
    assert!(matches!(
        sender.send_event(&Event::raw("tel")),
        Err(Error::SocketNotConnected)
    ));
}
