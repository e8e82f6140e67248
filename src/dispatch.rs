//! Fan-out of session notifications to consumers.
//!
//! Every consumer-visible notification goes through one [`EventDispatcher`].
//! Each subscriber owns an unbounded queue, so publishing never blocks the
//! transport worker and a subscriber sees events in exactly the order they
//! were published. Consumers drain their [`EventStream`] on whatever task
//! they choose; callbacks therefore never race each other.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

/// Cloneable publisher handle.
#[derive(Debug)]
pub struct EventDispatcher<E> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for EventDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> EventDispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber that receives every event published from now on.
    pub fn subscribe(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        EventStream { rx }
    }

    /// Delivers `event` to every live subscriber and returns how many got it.
    ///
    /// Subscribers whose stream was dropped are pruned.
    pub fn publish(&self, event: E) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ordered stream of events for one subscriber.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Waits for the next event; `None` once every dispatcher handle is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.rx.poll_recv(cx)
    }
}
