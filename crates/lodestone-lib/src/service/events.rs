use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A notification raised by a service, e.g. `minecraft-exit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    pub service_name: String,
    pub event: String,
    pub payload: Value,
}

/// Delivers service events to one frontend.
pub trait EventSink: Send + Sync {
    /// Returns `false` once the frontend is gone.
    fn send_event(&self, event: &ServiceEvent) -> bool;
}

/// Fans service events out to every connected frontend.
#[derive(Clone, Default)]
pub struct EventHub {
    sinks: Arc<Mutex<Vec<(String, Arc<dyn EventSink>)>>>,
}

impl EventHub {
    pub fn attach(&self, client: &str, sink: Arc<dyn EventSink>) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((client.to_string(), sink));
    }

    pub fn detach(&self, client: &str) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| id != client);
    }

    pub fn emit(&self, service: &str, event: &str, payload: impl Serialize) {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("[events] Cannot encode {} of {}: {}", event, service, e);
                return;
            }
        };
        let event = ServiceEvent {
            service_name: service.to_string(),
            event: event.to_string(),
            payload,
        };
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, sink)| sink.send_event(&event));
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects events in memory. Handy for embedding and tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ServiceEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ServiceEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn named(&self, event: &str) -> Vec<ServiceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn send_event(&self, event: &ServiceEvent) -> bool {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        true
    }
}
