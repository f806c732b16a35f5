use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use flowmill_core::error::Result;
use flowmill_core::traits::{HandlerContext, NodeHandler};
use flowmill_core::types::Variables;

/// Placeholder for database side effects; logs and echoes its params.
pub struct DatabaseHandler;

impl NodeHandler for DatabaseHandler {
    fn service_type(&self) -> &str {
        "database"
    }

    fn execute(&self, ctx: HandlerContext, params: Variables) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let operation = params
                .get("operation")
                .and_then(Value::as_str)
                .unwrap_or("query")
                .to_string();
            info!(instance_id = %ctx.instance_id, node_id = %ctx.node_id, %operation, "Database step");
            Ok(json!({
                "serviceType": "database",
                "operation": operation,
                "params": params,
            }))
        })
    }
}
