//! Mutation notifications.
//!
//! Each [`Database`](crate::Database) owns its own subscriber list.
//! Subscribers receive every event emitted after they subscribed, in
//! emission order, until their [`Subscription`] is dropped.

use crate::record::RecordFlags;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

/// A mutation of the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    /// An add is about to write to disk.
    Adding {
        /// Group name.
        group: String,
        /// Day timestamp.
        day: u64,
    },
    /// An add completed.
    Added {
        /// Group name.
        group: String,
        /// Day timestamp.
        day: u64,
        /// Offset of the new record.
        offset: u64,
        /// On-disk size of the new record.
        size: u64,
        /// Payload of the new record.
        data: Bytes,
        /// Flags of the new record.
        flags: RecordFlags,
    },
    /// A group (`day == None`) or a single partition was removed.
    Removed {
        /// Group name.
        group: String,
        /// Day timestamp of the removed partition.
        day: Option<u64>,
    },
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<MutationEvent>)>,
}

/// Per-database subscriber registry.
#[derive(Default)]
pub(crate) struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock_state();
        state.next_id += 1;
        let id = state.next_id;
        state.senders.push((id, tx));
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Emits the event built by `make`; skips building it when nobody listens.
    pub(crate) fn emit_with(&self, make: impl FnOnce() -> MutationEvent) {
        let mut state = self.lock_state();
        if state.senders.is_empty() {
            return;
        }
        let event = make();
        state.senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock_state().senders.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_state().senders.retain(|(sender_id, _)| *sender_id != id);
    }

    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// A live stream of [`MutationEvent`]s. Unsubscribes when dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<MutationEvent>,
    hub: Weak<EventHub>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the database is gone.
    pub async fn recv(&mut self) -> Option<MutationEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<MutationEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(group: &str) -> MutationEvent {
        MutationEvent::Removed {
            group: group.to_string(),
            day: None,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let hub = Arc::new(EventHub::default());
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit_with(|| removed("a"));
        hub.emit_with(|| removed("b"));

        for subscription in [&mut first, &mut second] {
            assert_eq!(subscription.recv().await, Some(removed("a")));
            assert_eq!(subscription.recv().await, Some(removed("b")));
            assert_eq!(subscription.try_recv(), None);
        }
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = Arc::new(EventHub::default());
        let subscription = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_no_event_built_without_subscribers() {
        let hub = EventHub::default();
        hub.emit_with(|| panic!("event built with no subscribers"));
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let hub = Arc::new(EventHub::default());
        let _early = hub.subscribe();
        hub.emit_with(|| removed("before"));
        let mut late = hub.subscribe();
        hub.emit_with(|| removed("after"));
        assert_eq!(late.try_recv(), Some(removed("after")));
        assert_eq!(late.try_recv(), None);
    }
}
