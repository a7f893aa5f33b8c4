//! Provider adapters. Each one makes exactly one provider call per send: HTTP for the chat and
//! SMS gateways, SMTP for email.

pub mod evolution;
pub mod nvoip;
pub mod smtp;
pub mod zapi;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use thiserror::Error;

use herald_common::types::{Channel, MessageRequest};
use herald_engine::settings::ProviderSettings;

pub use evolution::EvolutionProvider;
pub use nvoip::NvoipProvider;
pub use smtp::SmtpProvider;
pub use zapi::ZApiProvider;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no provider configured for channel '{0}'")]
    MissingSettings(Channel),

    #[error("{provider} settings cannot deliver {channel} messages")]
    SettingsMismatch {
        provider: &'static str,
        channel: Channel,
    },

    #[error("unsupported by provider: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

/// A delivery backend. Returns the provider's response body on success.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(
        &self,
        settings: &ProviderSettings,
        request: &MessageRequest,
    ) -> Result<Value, DeliveryError>;
}

/// Routes each send to the adapter named by the customer's settings.
pub struct ProviderGateway {
    zapi: ZApiProvider,
    evolution: EvolutionProvider,
    nvoip: NvoipProvider,
    smtp: SmtpProvider,
}

impl ProviderGateway {
    /// `timeout` bounds each HTTP exchange and SMTP session, independently of the worker's own
    /// deadline.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("herald-notifier/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            zapi: ZApiProvider::new(http.clone()),
            evolution: EvolutionProvider::new(http.clone()),
            nvoip: NvoipProvider::new(http),
            smtp: SmtpProvider::new(timeout),
        })
    }
}

#[async_trait]
impl Provider for ProviderGateway {
    async fn send(
        &self,
        settings: &ProviderSettings,
        request: &MessageRequest,
    ) -> Result<Value, DeliveryError> {
        if settings.channel() != request.channel {
            return Err(DeliveryError::SettingsMismatch {
                provider: settings.provider_name(),
                channel: request.channel,
            });
        }

        match settings {
            ProviderSettings::ZApi { .. } => self.zapi.send(settings, request).await,
            ProviderSettings::Evolution { .. } => self.evolution.send(settings, request).await,
            ProviderSettings::Nvoip { .. } => self.nvoip.send(settings, request).await,
            ProviderSettings::Smtp { .. } => self.smtp.send(settings, request).await,
        }
    }
}

/// Send a prepared request and turn the reply into a JSON value.
///
/// Non-2xx replies are errors. Bodies that are not JSON are kept as a string.
pub(crate) async fn execute(request: RequestBuilder) -> Result<Value, DeliveryError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

pub(crate) fn mismatch(provider: &'static str, request: &MessageRequest) -> DeliveryError {
    DeliveryError::SettingsMismatch {
        provider,
        channel: request.channel,
    }
}
