//! Per-customer provider credentials.
//!
//! Stored as a tagged JSON object in `provider_settings.settings`, one row per customer and
//! channel. The tag decides which adapter delivers the channel's messages.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use herald_common::types::Channel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderSettings {
    /// Z-API chat instance. `base_url` already identifies the instance and its token.
    ZApi {
        base_url: String,
        client_token: String,
    },
    /// Evolution API. `url` is the full send-text endpoint of the instance.
    Evolution { url: String, api_key: String },
    /// Nvoip SMS gateway.
    Nvoip { api_url: String, api_key: String },
    /// SMTP relay. Port 465 means implicit TLS, any other port upgrades with STARTTLS when
    /// the server offers it.
    Smtp {
        host: String,
        port: u16,
        user: String,
        pass: String,
        from_name: String,
        from_address: String,
    },
}

impl ProviderSettings {
    /// The channel these credentials deliver.
    pub fn channel(&self) -> Channel {
        match self {
            ProviderSettings::ZApi { .. } | ProviderSettings::Evolution { .. } => Channel::Whatsapp,
            ProviderSettings::Nvoip { .. } => Channel::Sms,
            ProviderSettings::Smtp { .. } => Channel::Email,
        }
    }

    /// Z-API instance id, the path segment after `/instances/` in `base_url`.
    pub fn instance_id(&self) -> Option<&str> {
        let ProviderSettings::ZApi { base_url, .. } = self else {
            return None;
        };
        let (_, rest) = base_url.split_once("/instances/")?;
        rest.split('/').next().filter(|id| !id.is_empty())
    }

    /// Settings without credentials, safe to hand to third parties.
    pub fn public_view(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "provider": self.provider_name(),
            "channel": self.channel(),
        });
        if let Some(instance_id) = self.instance_id() {
            value["instance_id"] = serde_json::Value::from(instance_id);
        }
        value
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            ProviderSettings::ZApi { .. } => "z_api",
            ProviderSettings::Evolution { .. } => "evolution",
            ProviderSettings::Nvoip { .. } => "nvoip",
            ProviderSettings::Smtp { .. } => "smtp",
        }
    }
}

#[async_trait]
pub trait ProviderSettingsRepository: Send + Sync {
    async fn find(
        &self,
        customer_id: Uuid,
        channel: Channel,
    ) -> anyhow::Result<Option<ProviderSettings>>;

    /// The customer owning the chat instance `instance_id`, with its settings.
    async fn find_by_instance(
        &self,
        instance_id: &str,
    ) -> anyhow::Result<Option<(Uuid, ProviderSettings)>>;
}

#[derive(Clone)]
pub struct PgProviderSettings {
    pool: PgPool,
}

impl PgProviderSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace the settings of one channel.
    pub async fn upsert(&self, customer_id: Uuid, settings: &ProviderSettings) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_settings (customer_id, channel, settings, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (customer_id, channel)
            DO UPDATE SET settings = EXCLUDED.settings, updated_at = NOW()
            "#,
        )
        .bind(customer_id)
        .bind(settings.channel())
        .bind(Json(settings))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderSettingsRepository for PgProviderSettings {
    async fn find(
        &self,
        customer_id: Uuid,
        channel: Channel,
    ) -> anyhow::Result<Option<ProviderSettings>> {
        let row: Option<(Json<ProviderSettings>,)> = sqlx::query_as(
            "SELECT settings FROM provider_settings WHERE customer_id = $1 AND channel = $2",
        )
        .bind(customer_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(settings,)| settings.0))
    }

    async fn find_by_instance(
        &self,
        instance_id: &str,
    ) -> anyhow::Result<Option<(Uuid, ProviderSettings)>> {
        let rows: Vec<(Uuid, Json<ProviderSettings>)> = sqlx::query_as(
            r#"
            SELECT customer_id, settings FROM provider_settings
            WHERE channel = 'whatsapp'
              AND settings->>'provider' = 'z_api'
              AND strpos(settings->>'base_url', '/instances/' || $1 || '/') > 0
            ORDER BY updated_at DESC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(customer_id, settings)| (customer_id, settings.0))
            .find(|(_, settings)| settings.instance_id() == Some(instance_id)))
    }
}

#[derive(Default)]
pub struct InMemoryProviderSettings {
    settings: RwLock<HashMap<(Uuid, Channel), ProviderSettings>>,
}

impl InMemoryProviderSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, customer_id: Uuid, settings: ProviderSettings) {
        self.settings
            .write()
            .await
            .insert((customer_id, settings.channel()), settings);
    }
}

#[async_trait]
impl ProviderSettingsRepository for InMemoryProviderSettings {
    async fn find(
        &self,
        customer_id: Uuid,
        channel: Channel,
    ) -> anyhow::Result<Option<ProviderSettings>> {
        Ok(self.settings.read().await.get(&(customer_id, channel)).cloned())
    }

    async fn find_by_instance(
        &self,
        instance_id: &str,
    ) -> anyhow::Result<Option<(Uuid, ProviderSettings)>> {
        Ok(self
            .settings
            .read()
            .await
            .iter()
            .find(|(_, settings)| settings.instance_id() == Some(instance_id))
            .map(|((customer_id, _), settings)| (*customer_id, settings.clone())))
    }
}
