use std::sync::Mutex;

use futures::future::BoxFuture;

use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::NotificationPort;
use flowmill_core::types::EngineEvent;

/// Keeps every event it is sent.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Event names in arrival order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(EngineEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }
}

impl NotificationPort for RecordingNotifier {
    fn notify(&self, event: EngineEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
            Ok(())
        })
    }
}

/// Rejects every event.
pub struct FailingNotifier;

impl NotificationPort for FailingNotifier {
    fn notify(&self, _event: EngineEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(FlowError::EngineFault("notification sink offline".into())) })
    }
}
