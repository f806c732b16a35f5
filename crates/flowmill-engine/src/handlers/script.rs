use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{HandlerContext, NodeHandler};
use flowmill_core::types::Variables;

use crate::expr::{parse_script, run_script};

/// Runs `name = expr` statements from the `script` param in the sandbox.
///
/// The result is an object of the assigned names; the dispatcher merges it
/// into the instance variables.
pub struct ScriptHandler;

impl NodeHandler for ScriptHandler {
    fn service_type(&self) -> &str {
        "script"
    }

    fn execute(&self, ctx: HandlerContext, params: Variables) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let source = params
                .get("script")
                .and_then(Value::as_str)
                .ok_or_else(|| FlowError::handler("script", "missing 'script' param"))?;

            let statements =
                parse_script(source).map_err(|e| FlowError::handler("script", e.to_string()))?;
            let assigned = run_script(&statements, &ctx.variables)
                .map_err(|e| FlowError::handler("script", e.to_string()))?;

            debug!(node_id = %ctx.node_id, assigned = assigned.len(), "Script evaluated");
            Ok(Value::Object(assigned))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(vars: Value) -> HandlerContext {
        HandlerContext {
            instance_id: "i".into(),
            node_id: "calc".into(),
            variables: vars.as_object().cloned().unwrap(),
        }
    }

    fn params(script: &str) -> Variables {
        json!({ "script": script }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_assignments_are_returned() {
        let out = ScriptHandler
            .execute(ctx(json!({"price": 10, "qty": 3})), params("total = price * qty"))
            .await
            .unwrap();
        assert_eq!(out, json!({"total": 30}));
    }

    #[tokio::test]
    async fn test_errors_are_handler_failures() {
        let err = ScriptHandler
            .execute(ctx(json!({})), params("x = 1 / 0"))
            .await
            .unwrap_err();
        assert!(err.is_handler_failure());

        let err = ScriptHandler
            .execute(ctx(json!({})), params("x = exec('rm')"))
            .await
            .unwrap_err();
        assert!(err.is_handler_failure());
    }
}
