//! FIFO of discovered addresses awaiting node creation.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::NewNodeCandidate;

#[derive(Default)]
struct Inner {
    queue: VecDeque<NewNodeCandidate>,
    queued: HashSet<IpAddr>,
    processing: HashSet<IpAddr>,
    closed: bool,
}

/// New node queue.
///
/// An address is refused while it is queued or while a consumer holds the
/// [`QueuedCandidate`] popped for it.
#[derive(Default)]
pub struct NewNodeQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Notify,
}

impl NewNodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate. Returns `false` if its address is already queued
    /// or being processed, or the queue is closed.
    pub fn push(&self, candidate: NewNodeCandidate) -> bool {
        let ip = candidate.address.address();
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.queued.contains(&ip) || inner.processing.contains(&ip) {
                return false;
            }
            inner.queued.insert(ip);
            inner.queue.push_back(candidate);
        }
        self.notify.notify_one();
        true
    }

    /// Whether `ip` is queued or being processed.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let inner = self.inner.lock();
        inner.queued.contains(&ip) || inner.processing.contains(&ip)
    }

    pub fn try_pop(&self) -> Option<QueuedCandidate> {
        let mut inner = self.inner.lock();
        let candidate = inner.queue.pop_front()?;
        let ip = candidate.address.address();
        inner.queued.remove(&ip);
        inner.processing.insert(ip);
        Some(QueuedCandidate {
            candidate,
            owner: self.inner.clone(),
        })
    }

    /// Wait for the next candidate. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<QueuedCandidate> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(candidate) = self.try_pop() {
                return Some(candidate);
            }
            if self.inner.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue and wake every waiting consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Drop every queued candidate. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.queue.len();
        inner.queue.clear();
        inner.queued.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Queued candidates in FIFO order.
    pub fn snapshot(&self) -> Vec<NewNodeCandidate> {
        self.inner.lock().queue.iter().cloned().collect()
    }
}

/// Candidate taken off the queue. Its address stays reserved until the
/// guard is dropped.
pub struct QueuedCandidate {
    candidate: NewNodeCandidate,
    owner: Arc<Mutex<Inner>>,
}

impl Deref for QueuedCandidate {
    type Target = NewNodeCandidate;

    fn deref(&self) -> &Self::Target {
        &self.candidate
    }
}

impl Drop for QueuedCandidate {
    fn drop(&mut self) {
        self.owner
            .lock()
            .processing
            .remove(&self.candidate.address.address());
    }
}
