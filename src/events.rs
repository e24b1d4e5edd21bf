//! Bounded publish/subscribe fan-out
//!
//! Publishing never waits on subscribers. Each subscriber sees at most
//! `capacity` undelivered messages; when it falls further behind, the oldest
//! messages are dropped for that subscriber only and counted. Messages that
//! are delivered arrive in publish order.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Multi-subscriber event channel
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
    published: AtomicU64,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a bus whose subscribers buffer up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Fire-and-forget publish. Returns how many subscribers were live.
    pub fn publish(&self, event: T) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // An error only means nobody is listening right now
        self.sender.send(event).unwrap_or(0)
    }

    /// Register a subscriber. It receives only messages published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            receiver: self.sender.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Receiving end of an [`EventBus`]. Dropping it deregisters the subscriber.
#[derive(Debug)]
pub struct Subscription<T: Clone> {
    receiver: broadcast::Receiver<T>,
    dropped: u64,
}

impl<T: Clone> Subscription<T> {
    /// Next message, skipping past anything dropped under backpressure.
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => self.note_dropped(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => self.note_dropped(missed),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Messages this subscriber lost to backpressure
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn note_dropped(&mut self, missed: u64) {
        log::warn!("slow subscriber dropped {} message(s)", missed);
        self.dropped += missed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for i in 0..5 {
            assert_eq!(bus.publish(i), 2);
        }
        for i in 0..5 {
            assert_eq!(a.recv().await, Some(i));
            assert_eq!(b.recv().await, Some(i));
        }
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        for i in 0..10 {
            bus.publish(i);
        }
        let received: Vec<i32> = std::iter::from_fn(|| slow.try_recv()).collect();
        assert_eq!(received, vec![6, 7, 8, 9]);
        assert_eq!(slow.dropped(), 6);
    }

    #[test]
    fn test_late_subscriber_gets_no_backfill() {
        let bus = EventBus::new(8);
        bus.publish("before");
        let mut late = bus.subscribe();
        assert_eq!(late.try_recv(), None);
        bus.publish("after");
        assert_eq!(late.try_recv(), Some("after"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(2);
        assert_eq!(bus.publish(1u8), 0);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_stream() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        bus.publish(7u32);
        drop(bus);
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);
    }
}
