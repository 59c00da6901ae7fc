//! Event Queue
//!
//! A single-consumer async queue with explicit close semantics, used as
//! the buffer behind stream receive ends. Elements pushed before the
//! close still drain in order; only after the buffer empties does the
//! consumer observe the end of the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct QueueState<T> {
    buffer: VecDeque<T>,
    /// Parked consumer, woken directly by the next push or close.
    waiter: Option<oneshot::Sender<Option<T>>>,
    closed: bool,
}

/// An async FIFO of events. Clones share the queue; at most one
/// consumer should await [`EventQueue::next`] at a time, since a new
/// waiter displaces the previous one.
pub struct EventQueue<T> {
    inner: Arc<Mutex<QueueState<T>>>,
}

impl<T: Send + 'static> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState {
                buffer: VecDeque::new(),
                waiter: None,
                closed: false,
            })),
        }
    }

    /// Append an event, or hand it straight to a parked consumer.
    /// Events pushed after [`EventQueue::close`] are discarded.
    pub fn push(&self, item: T) {
        let mut q = self.inner.lock();
        if q.closed {
            tracing::warn!("event pushed to a closed queue, dropping it");
            return;
        }
        match q.waiter.take() {
            Some(waiter) => {
                // The consumer may have given up; keep the event.
                if let Err(Some(item)) = waiter.send(Some(item)) {
                    q.buffer.push_back(item);
                }
            }
            None => q.buffer.push_back(item),
        }
    }

    /// Await the next event. Returns `None` once the queue is closed
    /// and drained.
    pub async fn next(&self) -> Option<T> {
        let parked = {
            let mut q = self.inner.lock();
            if let Some(item) = q.buffer.pop_front() {
                return Some(item);
            }
            if q.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            q.waiter = Some(tx);
            rx
        };
        parked.await.unwrap_or(None)
    }

    /// Close the queue. Buffered events stay readable; a parked
    /// consumer is released with `None`. Closing is permanent.
    pub fn close(&self) {
        let mut q = self.inner.lock();
        q.closed = true;
        if let Some(waiter) = q.waiter.take() {
            let _ = waiter.send(None);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }
}

impl<T: Send + 'static> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.inner.lock();
        f.debug_struct("EventQueue")
            .field("buffered", &q.buffer.len())
            .field("closed", &q.closed)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_events_come_out_in_order() {
        let queue = EventQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, Some(2));
        assert_eq!(queue.next().await, Some(3));
    }

    #[tokio::test]
    async fn a_parked_consumer_is_woken_by_push() {
        let queue = EventQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.push(7);
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_drains_the_buffer_before_reporting_the_end() {
        let queue = EventQueue::new();
        queue.push("a");
        queue.push("b");
        queue.close();

        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
        assert_eq!(queue.next().await, None);
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn close_releases_a_parked_consumer() {
        let queue = EventQueue::<i32>::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn pushes_after_close_are_dropped() {
        let queue = EventQueue::new();
        queue.close();
        queue.push(9);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.next().await, None);
    }
}
