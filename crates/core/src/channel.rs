//! Closeable unbounded channel
//!
//! Every producer/consumer pair in the pipeline is connected through this primitive.
//! Sends never block and fail once the channel is closed; the receiver keeps yielding
//! queued items after close and ends cleanly once drained. Closing is idempotent and
//! may be done from either half.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// Returned when sending on a closed channel
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

struct Inner<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    senders: AtomicUsize,
}

type Shared<T> = Arc<Inner<T>>;

/// Create a new closeable channel
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Inner {
        tx: Mutex::new(Some(tx)),
        senders: AtomicUsize::new(0),
    });
    (Sender::attach(shared.clone()), Receiver { shared, rx })
}

/// Sending half; clones share the same open/closed state
///
/// Dropping the last sender closes the channel.
pub struct Sender<T> {
    shared: Shared<T>,
}

impl<T> Sender<T> {
    fn attach(shared: Shared<T>) -> Self {
        shared.senders.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self::attach(self.shared.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            lock(&self.shared).take();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Queue an item without waiting
    pub fn send(&self, item: T) -> Result<(), ChannelClosed> {
        let guard = lock(&self.shared);
        match guard.as_ref() {
            Some(tx) => tx.send(item).map_err(|_| ChannelClosed),
            None => Err(ChannelClosed),
        }
    }

    /// Close the channel; queued items remain receivable
    pub fn close(&self) {
        lock(&self.shared).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Receiving half
pub struct Receiver<T> {
    shared: Shared<T>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

impl<T> Receiver<T> {
    /// Wait for the next item; `None` once closed and drained
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an item if one is queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Remove every queued item without waiting
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Close the channel from the receiving side
    pub fn close(&self) {
        lock(&self.shared).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).is_none()
    }

    /// A new sender for this channel (closed if the channel already is)
    pub fn sender(&self) -> Sender<T> {
        Sender::attach(self.shared.clone())
    }
}

impl<T> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // Senders observe the closed state instead of queueing into a dead channel
        lock(&self.shared).take();
    }
}

fn lock<T>(shared: &Shared<T>) -> MutexGuard<'_, Option<mpsc::UnboundedSender<T>>> {
    shared.tx.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_send_recv_in_order() {
        let (tx, mut rx) = channel();
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (tx, rx) = channel::<u32>();
        tx.close();
        assert_eq!(tx.send(1), Err(ChannelClosed));
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn test_drain_after_close() {
        let (tx, rx) = channel();
        tx.send("a").unwrap();
        tx.send("b").unwrap();
        tx.close();

        let items: Vec<_> = rx.collect().await;
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (tx, mut rx) = channel::<u8>();
        let other = tx.clone();
        tx.close();
        tx.close();
        other.close();
        rx.close();
        assert_eq!(rx.recv().await, None);
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn test_receiver_wakes_on_close() {
        let (tx, mut rx) = channel::<u8>();
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.close();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drop_receiver_closes() {
        let (tx, rx) = channel::<u8>();
        drop(rx);
        assert!(tx.is_closed());
        assert!(tx.send(1).is_err());
    }

    #[tokio::test]
    async fn test_dropping_last_sender_closes() {
        let (tx, mut rx) = channel::<u8>();
        let other = tx.clone();
        tx.send(7).unwrap();
        drop(tx);
        assert!(!rx.is_closed());
        drop(other);
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_drain_non_blocking() {
        let (tx, mut rx) = channel();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(rx.drain(), vec![1, 2]);
        assert!(rx.drain().is_empty());
        assert!(!rx.is_closed());
    }

    #[test]
    fn test_recv_wakes_on_send() {
        let (tx, mut rx) = channel::<u8>();
        let mut recv = tokio_test::task::spawn(async move { rx.recv().await });
        tokio_test::assert_pending!(recv.poll());

        tx.send(3).unwrap();
        assert!(recv.is_woken());
        tokio_test::assert_ready_eq!(recv.poll(), Some(3));
    }
}
