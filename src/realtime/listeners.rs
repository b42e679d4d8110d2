//! Identity-keyed listener registry.
//!
//! Listeners are stored by registration id so that removal never depends on
//! position. Delivery iterates a snapshot, which keeps subscribe and
//! unsubscribe safe from inside a listener.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, error};

use crate::realtime::proto::NotificationEvent;

pub(crate) type Listener = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Listener>>,
}

impl ListenerSet {
    pub(crate) fn insert(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers `event` to every listener registered right now.
    ///
    /// Returns how many listeners returned without panicking.
    pub(crate) fn notify(&self, event: &NotificationEvent) -> usize {
        let snapshot: Vec<(u64, Listener)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        event = "listener_panicked",
                        listener_id = id,
                        reason = panic_message(panic.as_ref())
                    );
                }
            }
        }
        debug!(event = "notification_delivered", listeners = delivered);
        delivered
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by [`RealtimeChannel::subscribe`](crate::realtime::channel::RealtimeChannel::subscribe).
///
/// Dropping the handle leaves the listener registered. Call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription keeps the listener registered"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerSet>,
}

impl Subscription {
    pub(crate) fn new(id: u64, listeners: &Arc<ListenerSet>) -> Self {
        Self {
            id,
            listeners: Arc::downgrade(listeners),
        }
    }

    /// Removes exactly this registration.
    ///
    /// Returns false when the channel is already gone.
    pub fn unsubscribe(self) -> bool {
        self.listeners
            .upgrade()
            .is_some_and(|listeners| listeners.remove(self.id))
    }
}
