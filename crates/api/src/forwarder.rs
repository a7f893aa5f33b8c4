//! Relays delivery receipts to a downstream listener.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

#[derive(Clone)]
pub struct ReceiptForwarder {
    http: Client,
    url: String,
}

impl ReceiptForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("herald-api/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// POST `payload` as JSON. Failures are logged; the receipt is already stored.
    pub async fn forward(&self, payload: &Value) {
        match self.http.post(&self.url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %self.url, "Receipt forwarded");
            }
            Ok(response) => {
                tracing::warn!(url = %self.url, status = %response.status(), "Receipt forward rejected");
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Receipt forward failed");
            }
        }
    }
}
