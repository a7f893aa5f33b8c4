//! Z-API chat adapter.
//!
//! Text goes to `{base_url}/send-text`, images to `{base_url}/send-image`. The instance is
//! authenticated with the `Client-Token` header.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use herald_common::types::MessageRequest;
use herald_engine::settings::ProviderSettings;

use super::{DeliveryError, Provider, execute, mismatch};

pub struct ZApiProvider {
    http: Client,
}

impl ZApiProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    fn payload(request: &MessageRequest) -> (&'static str, Value) {
        let phone = request.recipient.normalized(request.channel);
        match &request.media {
            Some(media) => (
                "send-image",
                json!({
                    "phone": phone,
                    "image": media.image,
                    "caption": media.caption.as_deref().unwrap_or(&request.content.body),
                    "viewOnce": false,
                }),
            ),
            None => (
                "send-text",
                json!({
                    "phone": phone,
                    "message": request.content.body,
                }),
            ),
        }
    }
}

#[async_trait]
impl Provider for ZApiProvider {
    async fn send(
        &self,
        settings: &ProviderSettings,
        request: &MessageRequest,
    ) -> Result<Value, DeliveryError> {
        let ProviderSettings::ZApi {
            base_url,
            client_token,
        } = settings
        else {
            return Err(mismatch("z_api", request));
        };

        let (endpoint, payload) = Self::payload(request);
        let url = format!("{}/{}", base_url.trim_end_matches('/'), endpoint);

        tracing::debug!(url = %url, endpoint, "Sending via Z-API");
        execute(
            self.http
                .post(url)
                .header("Client-Token", client_token)
                .json(&payload),
        )
        .await
    }
}
