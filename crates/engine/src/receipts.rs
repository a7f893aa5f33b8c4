//! Delivery receipts posted back by the chat provider.
//!
//! A receipt names the recipient phone and the provider instance that sent the message. The
//! instance identifies the customer; the newest WhatsApp job of that customer for the phone
//! gets the receipt attached.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use herald_common::types::Channel;

use crate::settings::ProviderSettingsRepository;
use crate::store::JobStore;

/// What a receipt resolved to.
#[derive(Debug, Clone)]
pub struct ReceiptOutcome {
    pub customer_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    /// Receipt merged over the owner's public settings, for downstream listeners.
    pub forward: Value,
}

pub struct ReceiptRecorder {
    jobs: Arc<dyn JobStore>,
    settings: Arc<dyn ProviderSettingsRepository>,
}

impl ReceiptRecorder {
    pub fn new(jobs: Arc<dyn JobStore>, settings: Arc<dyn ProviderSettingsRepository>) -> Self {
        Self { jobs, settings }
    }

    /// Attach `payload` to the job it reports on. Unknown instances and phones are not errors.
    pub async fn record(&self, payload: &Value) -> anyhow::Result<ReceiptOutcome> {
        let phone = payload.get("phone").and_then(phone_digits);
        let instance_id = payload.get("instanceId").and_then(Value::as_str);

        let owner = match instance_id {
            Some(id) => self.settings.find_by_instance(id).await?,
            None => None,
        };

        let mut job_id = None;
        if let (Some((customer_id, _)), Some(phone)) = (&owner, &phone)
            && let Some(job) = self
                .jobs
                .latest_for_recipient(*customer_id, Channel::Whatsapp, phone)
                .await?
        {
            self.jobs.record_receipt(job.id, payload).await?;
            job_id = Some(job.id);
        }

        tracing::info!(
            instance_id = instance_id.unwrap_or_default(),
            customer_id = ?owner.as_ref().map(|(id, _)| *id),
            job_id = ?job_id,
            "Delivery receipt received"
        );

        let mut forward = Map::new();
        if let Some((customer_id, settings)) = &owner {
            forward.insert("customer_id".to_string(), Value::String(customer_id.to_string()));
            if let Value::Object(public) = settings.public_view() {
                forward.extend(public);
            }
        }
        let forward = match payload {
            Value::Object(fields) => {
                forward.extend(fields.clone());
                Value::Object(forward)
            }
            other => other.clone(),
        };

        Ok(ReceiptOutcome {
            customer_id: owner.map(|(id, _)| id),
            job_id,
            forward,
        })
    }
}

/// Phones arrive as digit strings or plain numbers; keep the digits only.
fn phone_digits(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}
