use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use flowmill_core::error::{FlowError, Result};
use flowmill_core::traits::{HandlerContext, NodeHandler};
use flowmill_core::types::Variables;

/// Performs an HTTP request described by the node params.
///
/// Params: `url`, `method` (default GET), `headers`, `body` (sent as JSON).
/// Returns `{status, body}`; the body is parsed as JSON when possible.
pub struct HttpHandler {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct HttpParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".into()
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeHandler for HttpHandler {
    fn service_type(&self) -> &str {
        "http"
    }

    fn timeout_secs(&self) -> Option<u64> {
        Some(60)
    }

    fn execute(&self, ctx: HandlerContext, params: Variables) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let p: HttpParams = serde_json::from_value(Value::Object(params))
                .map_err(|e| FlowError::handler("http", format!("invalid params: {}", e)))?;

            let method = p
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| FlowError::handler("http", format!("invalid method: {}", e)))?;

            debug!(instance_id = %ctx.instance_id, node_id = %ctx.node_id, url = %p.url, %method, "HTTP request");

            let mut req = self
                .client
                .request(method, &p.url)
                .timeout(Duration::from_secs(60));
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = &p.body {
                req = req.json(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FlowError::handler("http", e.to_string()))?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            if !status.is_success() {
                return Err(FlowError::handler(
                    "http",
                    format!("{} {} returned {}", p.method.to_uppercase(), p.url, status.as_u16()),
                ));
            }

            Ok(serde_json::json!({
                "status": status.as_u16(),
                "body": body,
            }))
        })
    }
}
