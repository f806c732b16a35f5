//! Service handler registry and the built-in handlers.

pub mod custom;
pub mod database;
pub mod email;
pub mod http;
pub mod script;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{HandlerContext, NodeHandler};
use flowmill_core::types::Variables;

/// Handlers keyed by `serviceType`.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
    default_timeout_secs: u64,
}

impl HandlerRegistry {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            handlers: HashMap::new(),
            default_timeout_secs,
        }
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&mut self, handler: impl NodeHandler) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn NodeHandler>) {
        let name = handler.service_type().to_string();
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, service_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(service_type).cloned()
    }

    /// Registered service types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a handler by service type under a timeout.
    ///
    /// The node's `timeoutSecs` wins over the handler's own override, which
    /// wins over the engine default.
    pub async fn execute(
        &self,
        service_type: &str,
        ctx: HandlerContext,
        params: Variables,
        timeout_override: Option<u64>,
    ) -> Result<Value> {
        let handler = self.get(service_type).ok_or_else(|| {
            FlowError::handler(service_type, "no handler registered for this service type")
        })?;

        let timeout_secs = timeout_override
            .or_else(|| handler.timeout_secs())
            .unwrap_or(self.default_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, handler.execute(ctx, params)).await {
            Ok(result) => result,
            Err(_) => Err(FlowError::HandlerTimeout {
                service_type: service_type.to_string(),
                timeout_secs,
            }),
        }
    }

    /// Create a registry with all built-in handlers registered.
    pub fn with_builtins(default_timeout_secs: u64) -> Self {
        let mut registry = Self::new(default_timeout_secs);
        registry.register(http::HttpHandler::new());
        registry.register(email::EmailHandler);
        registry.register(script::ScriptHandler);
        registry.register(database::DatabaseHandler);
        registry.register(custom::CustomHandler);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins(30)
    }
}
