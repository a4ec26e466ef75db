//! Shutdown coordination for rollup.
//!
//! The relay runs an ingest server, a flush scheduler and, optionally, a
//! telemetry exporter. When the process is asked to stop every one of these
//! must wind down before the final drain of the accumulator, otherwise
//! samples arriving during teardown would be lost or, worse, be raced by the
//! drain itself.
//!
//! There are two halves. A single [`Broadcaster`] announces shutdown. Any
//! number of [`Watcher`] instances wait for that announcement, and
//! [`Broadcaster::signal_and_wait`] does not return until every one of them
//! has observed the signal or been dropped.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(Peers {
        count: AtomicU32::new(1),
        notify: Notify::new(),
    });

    let w = Watcher {
        receiver,
        peers: Arc::clone(&peers),
    };
    let b = Broadcaster { sender, peers };

    (w, b)
}

/// Registered peer bookkeeping shared between both halves.
#[derive(Debug)]
struct Peers {
    count: AtomicU32,
    notify: Notify,
}

impl Peers {
    fn depart(&self) {
        // fetch_sub wraps at zero, the count must saturate instead.
        let mut old = self.count.load(Ordering::Relaxed);
        while old > 0 {
            match self.count.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    return;
                }
                Err(x) => old = x,
            }
        }
    }
}

#[derive(Debug)]
/// Announces shutdown to every [`Watcher`] derived from the same pair.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
    peers: Arc<Peers>,
}

impl Broadcaster {
    /// Send the signal. Does NOT wait for peers to acknowledge it.
    pub fn signal(self) {
        // Receivers observe either the value change or the closed channel,
        // both count as the signal.
        let _ = self.sender.send(true);
    }

    /// Send the signal and wait until every registered `Watcher` has
    /// observed it or been dropped.
    pub async fn signal_and_wait(self) {
        let _ = self.sender.send(true);

        loop {
            // Register interest before checking the count, otherwise a peer
            // departing between the check and the await is a lost wakeup.
            let notified = self.peers.notify.notified();
            let peers = self.peers.count.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");
            notified.await;
        }
    }
}

/// Errors for [`Watcher::register`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has already been sent.
    #[error("signal has already been sent")]
    SignalSent,
}

#[derive(Debug)]
/// Waits for the shutdown announcement of a [`Broadcaster`].
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<Peers>,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if it has already been sent.
    pub async fn recv(mut self) {
        // An error means the `Broadcaster` is gone, which is as good as a
        // signal.
        let _ = self.receiver.wait_for(|signaled| *signaled).await;
        // Dropping self departs the peer count.
    }

    /// Register a new `Watcher` the `Broadcaster` will wait on.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalSent` if the signal has already been
    /// sent.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if *self.receiver.borrow() {
            return Err(RegisterError::SignalSent);
        }
        self.peers.count.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
        })
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.peers.depart();
    }
}
