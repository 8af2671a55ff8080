//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

struct Inner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `receiver`
    trigger: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

/// Clonable cancellation context.
///
/// Loops built around `select!` add `recv(token.receiver())` as one of their
/// arms: the channel never carries a message, it only becomes disconnected
/// once the token is cancelled, which makes the arm ready for every clone at
/// once.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, receiver) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                receiver,
            }),
        }
    }

    /// Creates a token cancelled together with this one, but which can also
    /// be cancelled on its own.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let (parent, linked) = (self.clone(), child.clone());
        thread::spawn(move || {
            crossbeam_channel::select! {
                recv(parent.receiver()) -> _ => linked.cancel(),
                recv(linked.receiver()) -> _ => (),
            }
        });
        child
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner
                .trigger
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.receiver
    }

    /// Sleeps for `duration` or until cancelled, returning whether the token
    /// got cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.inner.receiver.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

#[test]
fn cancel_wakes_sleepers() {
    let token = CancelToken::new();
    let sleeper = token.clone();
    let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(20));
    token.cancel();
    assert!(handle.join().unwrap());
    assert!(token.is_cancelled());
}

#[test]
fn child_follows_parent_only() {
    let parent = CancelToken::new();
    let child = parent.child();
    child.cancel();
    assert!(!parent.is_cancelled());

    let child = parent.child();
    parent.cancel();
    assert!(child.sleep(Duration::from_secs(10)));
    assert!(child.is_cancelled());
}
