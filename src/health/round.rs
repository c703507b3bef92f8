//! Tracking of in-flight sessions of one check round.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Outstanding session count of one round on one worker.
#[derive(Debug)]
pub struct RoundTracker {
    started: Instant,
    outstanding: AtomicUsize,
    finished: AtomicBool,
    idle: Notify,
    done: Notify,
}

impl RoundTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            outstanding: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            idle: Notify::new(),
            done: Notify::new(),
        })
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Register one more session; the returned ticket releases it on drop.
    pub fn ticket(self: &Arc<Self>) -> SessionTicket {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        SessionTicket {
            tracker: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Wait until no session holds a ticket.
    pub async fn wait_idle(&self) {
        while self.outstanding() > 0 {
            self.idle.notified().await;
        }
    }

    /// True until completion has run.
    pub fn in_flight(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
        self.done.notify_waiters();
    }

    /// Wait until the round's completion has run.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.done.notified();
            if !self.in_flight() {
                return;
            }
            notified.await;
        }
    }
}

/// Held by one session for its whole lifetime.
#[derive(Debug)]
pub struct SessionTicket {
    tracker: Arc<RoundTracker>,
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        if self.tracker.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_one();
        }
    }
}
