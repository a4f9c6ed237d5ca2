//! Change events and the ChangeBus
//!
//! Every committed ledger mutation produces exactly one [`LedgerEvent`].
//! The [`ChangeBus`] keeps an explicit registry of subscribers and fans each
//! event out to all of them in the order it was published.
//!
//! Delivery is best-effort and at-most-once:
//! - No acknowledgement, no retry
//! - A subscriber whose queue is full misses that event (logged)
//! - A subscriber registered late sees only events published after it
//!   registered; it must fetch a full snapshot to catch up
//!
//! The bus knows nothing about transports. The SSE adapter in `sse` (or any
//! other transport) consumes a [`Subscription`] like any other subscriber.

use crate::models::BookingRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Ledger change events
///
/// Serialized with the event name in `type`, e.g.
/// `{"type":"booking-deleted","referenceNumber":"BK-...",...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum LedgerEvent {
    /// A record was written to a previously empty key
    #[serde(rename = "booking-created")]
    BookingCreated {
        key: String,
        record: BookingRecord,
        timestamp: DateTime<Utc>,
    },

    /// A record replaced the one stored under `key`
    ///
    /// `previous_key` is set when an update moved the record to a new key.
    #[serde(rename = "booking-updated")]
    BookingUpdated {
        key: String,
        record: BookingRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_key: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A record was deleted by reference number
    #[serde(rename = "booking-deleted")]
    BookingDeleted {
        reference_number: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// The whole ledger was replaced (recovery, migration) or a full
    /// snapshot was requested
    #[serde(rename = "bookings-updated")]
    BookingsUpdated {
        records: BTreeMap<String, BookingRecord>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    /// Event name as exposed to the transport layer
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::BookingCreated { .. } => "booking-created",
            LedgerEvent::BookingUpdated { .. } => "booking-updated",
            LedgerEvent::BookingDeleted { .. } => "booking-deleted",
            LedgerEvent::BookingsUpdated { .. } => "bookings-updated",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::BookingCreated { timestamp, .. }
            | LedgerEvent::BookingUpdated { timestamp, .. }
            | LedgerEvent::BookingDeleted { timestamp, .. }
            | LedgerEvent::BookingsUpdated { timestamp, .. } => *timestamp,
        }
    }
}

/// Identifier handed out by [`ChangeBus::register`]
pub type SubscriberId = Uuid;

/// Receiving end of one registration
pub struct Subscription {
    id: SubscriberId,
    name: String,
    rx: mpsc::Receiver<LedgerEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event; `None` once the subscriber was unregistered
    pub async fn recv(&mut self) -> Option<LedgerEvent> {
        self.rx.recv().await
    }

    /// Next queued event, if any, without waiting
    pub fn try_recv(&mut self) -> Option<LedgerEvent> {
        self.rx.try_recv().ok()
    }
}

struct SubscriberSlot {
    name: String,
    tx: mpsc::Sender<LedgerEvent>,
    dropped: u64,
}

/// Central fan-out of ledger change events
///
/// Cloning is cheap; clones share one registry.
///
/// # Examples
///
/// ```
/// use booking_common::events::{ChangeBus, LedgerEvent};
///
/// let bus = ChangeBus::new(16);
/// let mut sub = bus.register("audit-log");
///
/// bus.publish(LedgerEvent::BookingDeleted {
///     reference_number: "BK-20250301-AAAAAA".to_string(),
///     key: "assembly-10-1-2025-03-01".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(sub.try_recv().unwrap().event_type(), "booking-deleted");
/// ```
#[derive(Clone)]
pub struct ChangeBus {
    registry: Arc<Mutex<HashMap<SubscriberId, SubscriberSlot>>>,
    capacity: usize,
}

impl ChangeBus {
    /// Creates a bus whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SubscriberId, SubscriberSlot>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber for all future events
    pub fn register(&self, name: impl Into<String>) -> Subscription {
        let name = name.into();
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.slots().insert(
            id,
            SubscriberSlot {
                name: name.clone(),
                tx,
                dropped: 0,
            },
        );
        debug!(subscriber = %id, name = %name, "ChangeBus: subscriber registered");
        Subscription { id, name, rx }
    }

    /// Remove a subscriber; its [`Subscription`] then yields `None`
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.slots().remove(&id);
        if let Some(slot) = &removed {
            debug!(subscriber = %id, name = %slot.name, "ChangeBus: subscriber unregistered");
        }
        removed.is_some()
    }

    /// Deliver `event` to every registered subscriber
    ///
    /// Returns the number of subscribers that accepted the event. Never
    /// blocks: a full queue drops the event for that subscriber only, and a
    /// subscriber whose receiver is gone is removed from the registry.
    pub fn publish(&self, event: LedgerEvent) -> usize {
        let mut slots = self.slots();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, slot) in slots.iter_mut() {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped += 1;
                    warn!(
                        subscriber = %id,
                        name = %slot.name,
                        dropped_total = slot.dropped,
                        "ChangeBus: subscriber queue full, dropped {}",
                        event.event_type()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            if let Some(slot) = slots.remove(&id) {
                debug!(subscriber = %id, name = %slot.name, "ChangeBus: pruned closed subscriber");
            }
        }

        delivered
    }

    /// Get the current number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.slots().len()
    }

    /// Registered subscribers with their names
    pub fn subscribers(&self) -> Vec<(SubscriberId, String)> {
        self.slots()
            .iter()
            .map(|(id, slot)| (*id, slot.name.clone()))
            .collect()
    }

    /// Get the configured per-subscriber capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
