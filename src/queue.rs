//! Outbound frame queue.
//!
//! Producers push encoded frames from any task; the transport channel
//! drains the whole queue in FIFO order whenever it is woken. Wake-ups
//! between drains coalesce into one, but no frame is ever dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A FIFO of pending encoded frames with a level-triggered wake-up.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl OutboundQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame. Never blocks the producer and never drops.
    pub fn push(&self, frame: Vec<u8>) {
        self.inner.lock().push_back(frame);
        self.notify.notify_one();
    }

    /// Removes and returns all pending frames in push order.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.inner.lock().drain(..).collect()
    }

    /// Waits until at least one push happened since the last drain.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Returns the number of pending frames.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no frames are pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
