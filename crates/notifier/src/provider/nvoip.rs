//! Nvoip SMS adapter: `POST {api_url}/sms?napikey=...`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use herald_common::types::MessageRequest;
use herald_engine::settings::ProviderSettings;

use super::{DeliveryError, Provider, execute, mismatch};

pub struct NvoipProvider {
    http: Client,
}

impl NvoipProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Provider for NvoipProvider {
    async fn send(
        &self,
        settings: &ProviderSettings,
        request: &MessageRequest,
    ) -> Result<Value, DeliveryError> {
        let ProviderSettings::Nvoip { api_url, api_key } = settings else {
            return Err(mismatch("nvoip", request));
        };

        let payload = json!({
            "numberPhone": request.recipient.normalized(request.channel),
            "message": request.content.body,
            "flashSms": false,
        });
        let url = format!("{}/sms", api_url.trim_end_matches('/'));

        execute(
            self.http
                .post(url)
                .query(&[("napikey", api_key.as_str())])
                .json(&payload),
        )
        .await
    }
}
