//! Typed event broadcasting.
//!
//! The EventBus fans a single stream of events out to any number of
//! subscribers. Each subscription is a `broadcast::Receiver`; dropping it
//! cancels the subscription.
//!
//! # Example
//!
//! ```rust
//! use chatlink_core::event_bus::EventBus;
//!
//! let bus: EventBus<String> = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.emit("hello".to_string());
//! assert_eq!(rx.try_recv().unwrap(), "hello");
//! ```

use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
/// Events beyond this capacity will cause slow subscribers to miss events (lag).
const DEFAULT_CAPACITY: usize = 1024;

/// A broadcast bus for events of type `E`.
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a new EventBus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new EventBus with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, the event is dropped and 0 is returned.
    pub fn emit(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Get the current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_creates_bus_without_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscribe_and_drop_track_count() {
        let bus: EventBus<u32> = EventBus::default();
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn emit_returns_zero_with_no_subscribers() {
        let bus: EventBus<&str> = EventBus::new();
        assert_eq!(bus.emit("dropped"), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(42), 2);

        assert_eq!(rx1.recv().await.unwrap(), 42);
        assert_eq!(rx2.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(1);
        bus.emit(2);
        bus.emit(3);

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn late_subscriber_misses_old_events() {
        let bus: EventBus<&str> = EventBus::new();
        let mut early = bus.subscribe();
        bus.emit("early");

        let mut late = bus.subscribe();
        bus.emit("later");

        assert_eq!(early.recv().await.unwrap(), "early");
        assert_eq!(early.recv().await.unwrap(), "later");
        assert_eq!(late.recv().await.unwrap(), "later");
    }

    #[tokio::test]
    async fn slow_subscriber_experiences_lag() {
        let bus: EventBus<u32> = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        bus.emit(1);
        bus.emit(2);
        bus.emit(3);

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
