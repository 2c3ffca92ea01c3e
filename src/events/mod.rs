//! Gateway event bus.
//!
//! Approval traffic flows outward through this seam: the coordinator emits
//! `approval_request` / `approval_resolved` payloads addressed to a session,
//! and connected clients subscribed to that session receive them. The
//! coordinator itself depends only on [`EventSink`], so tests plug in a
//! recording sink instead of the bus.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Event `data.type` for a newly registered approval.
pub const EVENT_APPROVAL_REQUEST: &str = "approval_request";
/// Event `data.type` for a settled approval.
pub const EVENT_APPROVAL_RESOLVED: &str = "approval_resolved";

/// One outbound event, addressed to a session's subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub session_key: String,
    pub run_id: String,
    pub data: serde_json::Value,
}

/// Outbound emission seam. Best-effort broadcast; no delivery guarantees.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}

type ListenerFn = Arc<dyn Fn(&GatewayEvent) + Send + Sync>;

/// In-process broadcast bus. Listeners are invoked synchronously, in
/// subscription order, on the emitting thread.
pub struct EventBus {
    listeners: RwLock<Vec<(u64, ListenerFn)>>,
    next_listener_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to all events. Returns an id for [`EventBus::unsubscribe`].
    pub fn subscribe(&self, listener: impl Fn(&GatewayEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(lid, _)| *lid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: GatewayEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, listener) in listeners.iter() {
            listener(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
