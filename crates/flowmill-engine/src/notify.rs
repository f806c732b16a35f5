use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use flowmill_core::error::Result;
use flowmill_core::event::EventBus;
use flowmill_core::traits::NotificationPort;
use flowmill_core::types::EngineEvent;

/// Fans engine events out to the event bus and every notification port.
///
/// Port calls run on their own tasks; a failing or slow port never delays
/// or fails the engine operation that raised the event.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<EventBus>,
    ports: Vec<Arc<dyn NotificationPort>>,
}

impl Notifier {
    pub fn new(bus: Arc<EventBus>, ports: Vec<Arc<dyn NotificationPort>>) -> Self {
        Self { bus, ports }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn emit(&self, event: EngineEvent) {
        for port in &self.ports {
            let port = port.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let name = event.name();
                if let Err(e) = port.notify(event).await {
                    warn!(event = name, error = %e, "Notification failed");
                }
            });
        }
        self.bus.publish(event);
    }
}

/// Writes every event to the log. Used by the CLI.
pub struct TracingNotifier;

impl NotificationPort for TracingNotifier {
    fn notify(&self, event: EngineEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&event)?;
            info!(event = event.name(), %payload, "Engine event");
            Ok(())
        })
    }
}
