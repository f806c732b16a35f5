use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{HandlerContext, NodeHandler};
use flowmill_core::types::Variables;

/// Logs the message it would send. Requires a `to` param.
pub struct EmailHandler;

impl NodeHandler for EmailHandler {
    fn service_type(&self) -> &str {
        "email"
    }

    fn execute(&self, ctx: HandlerContext, params: Variables) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let to = params
                .get("to")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| FlowError::handler("email", "missing 'to' param"))?
                .to_string();
            let subject = params
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or_default();

            info!(instance_id = %ctx.instance_id, node_id = %ctx.node_id, %to, subject, "Email dispatched");

            Ok(json!({
                "serviceType": "email",
                "to": to,
                "params": params,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_recipient() {
        let ctx = HandlerContext {
            instance_id: "i".into(),
            node_id: "mail".into(),
            variables: Variables::new(),
        };
        assert!(EmailHandler.execute(ctx.clone(), Variables::new()).await.is_err());

        let params = json!({"to": "ops@example.com", "subject": "Done"})
            .as_object()
            .cloned()
            .unwrap();
        let out = EmailHandler.execute(ctx, params).await.unwrap();
        assert_eq!(out["to"], "ops@example.com");
    }
}
