/// Run completion webhooks
///
/// One POST per finished attempt that carried a webhook target. Delivery is best
/// effort: failures are logged and never retried.

use crate::runtime::worker::WorkerResult;
use chrono::Utc;
use serde_json::{Map, Value};
use std::time::Duration;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Default)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to `url`; never fails
    pub async fn dispatch(&self, url: &str, payload: &Value) {
        let response = self
            .client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match response {
            Ok(response) => {
                tracing::info!(webhook = %url, status = %response.status(), "🪝 Webhook delivered");
            }
            Err(err) => {
                tracing::error!(webhook = %url, error = %err, "❌ Background worker failed to call webhook");
            }
        }
    }
}

/// Body sent to the webhook target
///
/// The run record's fields plus `status`, `run_started_at`, `run_ended_at`,
/// `webhook_sent_at`, `values` from the final checkpoint and `error` when the
/// attempt failed.
pub fn webhook_payload(result: &WorkerResult) -> Value {
    let mut payload = match serde_json::to_value(&result.run) {
        Ok(Value::Object(fields)) => fields,
        _ => Map::new(),
    };

    payload.insert("status".to_string(), Value::String(result.status.to_string()));
    payload.insert(
        "run_started_at".to_string(),
        Value::String(result.run_started_at.to_rfc3339()),
    );
    payload.insert(
        "run_ended_at".to_string(),
        Value::String(result.run_ended_at.to_rfc3339()),
    );
    payload.insert(
        "webhook_sent_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    payload.insert(
        "values".to_string(),
        result
            .checkpoint
            .as_ref()
            .map(|checkpoint| checkpoint.values.clone())
            .unwrap_or(Value::Null),
    );
    if let Some(error) = &result.error {
        payload.insert("error".to_string(), Value::String(error.to_string()));
    }

    Value::Object(payload)
}
