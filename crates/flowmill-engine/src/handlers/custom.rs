use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use flowmill_core::error::Result;
use flowmill_core::traits::{HandlerContext, NodeHandler};
use flowmill_core::types::Variables;

/// Default `custom` handler. Deployments replace it via `HandlerRegistry::register`.
pub struct CustomHandler;

impl NodeHandler for CustomHandler {
    fn service_type(&self) -> &str {
        "custom"
    }

    fn execute(&self, ctx: HandlerContext, params: Variables) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            info!(instance_id = %ctx.instance_id, node_id = %ctx.node_id, keys = params.len(), "Custom step");
            Ok(json!({
                "serviceType": "custom",
                "params": params,
            }))
        })
    }
}
