// Copyright 2020 Joyent, Inc.

//! Per-call retry timers.
//!
//! Each armed timer is a key into a `DelayQueue`.  The key is owned by the
//! pending call it belongs to and is cancelled when that call resolves, so a
//! timer never fires for a call that is already settled.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::time::delay_queue::{self, DelayQueue};

use crate::pending::CallId;

pub type TimerKey = delay_queue::Key;

/// Longest timeout a timer can be armed with.  The underlying timer wheel
/// cannot represent deadlines much further out than two years.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug)]
pub struct RetryScheduler {
    queue: DelayQueue<CallId>,
}

impl RetryScheduler {
    pub fn new() -> RetryScheduler {
        RetryScheduler {
            queue: DelayQueue::new(),
        }
    }

    /// Arm a timer for `id` that expires after `timeout`, capped at
    /// `MAX_TIMEOUT`.  Must be called from within a tokio runtime.
    pub fn arm(&mut self, id: CallId, timeout: Duration) -> TimerKey {
        self.queue.insert(id, timeout.min(MAX_TIMEOUT))
    }

    /// Cancel a timer that has not yet been returned by `next_expired`.
    pub fn cancel(&mut self, key: &TimerKey) {
        self.queue.remove(key);
    }

    /// Wait for the next timer to expire.  Returns `None` immediately when no
    /// timer is armed.
    pub async fn next_expired(&mut self) -> Option<CallId> {
        self.queue.next().await.map(|expired| expired.into_inner())
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        RetryScheduler::new()
    }
}
