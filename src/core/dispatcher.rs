//! Process-local routing from agent addresses to message sinks.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::identity::normalize_address;
use crate::protocol::history::{EnvelopeHistory, EnvelopeRecord};
use crate::protocol::IncomingMessage;

/// Receiver of locally dispatched messages.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn handle_message(&self, message: IncomingMessage);
}

/// Many sinks per address, plus a bounded history of everything dispatched.
///
/// The registry lock is released before any sink is awaited.
pub struct Dispatcher {
    sinks: Mutex<HashMap<String, Vec<Arc<dyn Sink>>>>,
    history: Mutex<EnvelopeHistory>,
}

fn same_sink(a: &Arc<dyn Sink>, b: &Arc<dyn Sink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_history(EnvelopeHistory::default())
    }

    pub fn with_history(history: EnvelopeHistory) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            history: Mutex::new(history),
        }
    }

    /// Register `sink` for `address`. Registering the same sink twice is a no-op.
    pub fn register(&self, address: &str, sink: Arc<dyn Sink>) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = sinks
            .entry(normalize_address(address).to_string())
            .or_default();
        if !entry.iter().any(|s| same_sink(s, &sink)) {
            entry.push(sink);
            tracing::debug!(address, "Registered local sink");
        }
    }

    /// Remove `sink` from `address`. Unknown sinks are ignored.
    pub fn unregister(&self, address: &str, sink: &Arc<dyn Sink>) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let address = normalize_address(address);
        if let Some(entry) = sinks.get_mut(address) {
            entry.retain(|s| !same_sink(s, sink));
            if entry.is_empty() {
                sinks.remove(address);
            }
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(normalize_address(address))
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Deliver `message` to every sink registered for `destination`.
    /// Returns false when nothing is registered there.
    pub async fn dispatch(&self, destination: &str, message: IncomingMessage) -> bool {
        let destination = normalize_address(destination);
        self.record(
            EnvelopeRecord::new(
                message.sender.clone(),
                destination,
                message.session,
                message.schema_digest.clone(),
                Some(message.payload.clone()),
            )
            .with_protocol_digest(message.protocol_digest.clone()),
        );

        let sinks: Vec<Arc<dyn Sink>> = self
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(destination)
            .cloned()
            .unwrap_or_default();

        if sinks.is_empty() {
            tracing::debug!(destination, "No local sink for destination");
            return false;
        }

        for sink in sinks {
            sink.handle_message(message.clone()).await;
        }
        true
    }

    pub fn record(&self, record: EnvelopeRecord) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn history(&self) -> Vec<EnvelopeRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records()
    }

    pub fn session_history(&self, session: Uuid) -> Vec<EnvelopeRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_session(session)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
