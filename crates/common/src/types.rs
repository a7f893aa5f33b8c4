use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Sms,
    Email,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Whatsapp, Channel::Sms, Channel::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }

    /// Whether the recipient of this channel is a phone number.
    pub fn uses_phone(&self) -> bool {
        matches!(self, Channel::Whatsapp | Channel::Sms)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Channel::Whatsapp),
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// A recurring daily hour range during which nothing may be dispatched.
///
/// `start > end` wraps midnight: `20-4` blocks 20:00-04:00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BlackoutWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self, String> {
        if start_hour > 23 {
            return Err(format!("start hour {} must be within 0..=23", start_hour));
        }
        if end_hour == 0 || end_hour > 24 {
            return Err(format!("end hour {} must be within 1..=24", end_hour));
        }
        if start_hour == end_hour {
            return Err(format!("window {}-{} is empty", start_hour, end_hour));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    /// Whether `hour` (0..=23) falls inside the window.
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// Parse a comma-separated list such as `"20-24,0-8"`. Blank input yields no windows.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for BlackoutWindow {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .split_once('-')
            .ok_or_else(|| format!("'{}' is not a START-END hour range", value))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| format!("'{}' has an invalid start hour", value))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| format!("'{}' has an invalid end hour", value))?;
        Self::new(start, end)
    }
}

impl std::fmt::Display for BlackoutWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start_hour, self.end_hour)
    }
}

/// Destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Recipient {
    Phone {
        country: String,
        area_code: String,
        number: String,
    },
    Email {
        address: String,
    },
}

impl Recipient {
    /// Address handed to providers: digits only for phones, the bare address for email.
    pub fn normalized(&self, channel: Channel) -> String {
        match self {
            Recipient::Phone {
                country,
                area_code,
                number,
            } => {
                // The chat provider expects mobile numbers without the leading ninth digit.
                let local = if channel == Channel::Whatsapp && number.len() == 9 {
                    &number[1..]
                } else {
                    number.as_str()
                };
                format!("{}{}{}", country, area_code, local)
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect()
            }
            Recipient::Email { address } => address.trim().to_string(),
        }
    }
}

/// Text payload of a message. Email uses the optional framing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

/// Image sent alongside a chat message; `image` is a URL or a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// An accepted, validated message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub channel: Channel,
    pub recipient: Recipient,
    pub content: MessageContent,
    /// Caller-requested send time, already converted to UTC.
    pub send_at: Option<DateTime<Utc>>,
    pub media: Option<MediaAttachment>,
}

/// Raw submission as received from callers.
///
/// Every field is optional so a single malformed entry never fails the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageInput {
    pub channel: Option<String>,
    pub country: Option<String>,
    #[serde(alias = "dd")]
    pub area_code: Option<String>,
    pub number: Option<String>,
    #[serde(alias = "email_to")]
    pub email: Option<String>,
    #[serde(alias = "email_title")]
    pub subject: Option<String>,
    #[serde(alias = "email_header_title")]
    pub header_title: Option<String>,
    #[serde(alias = "email_content")]
    pub message: Option<String>,
    #[serde(alias = "email_footer_content")]
    pub footer: Option<String>,
    /// `YYYY-MM-DD HH:mm:ss` in the configured request time zone.
    #[serde(alias = "sendAt")]
    pub send_at: Option<String>,
    pub image: Option<String>,
    pub caption: Option<String>,
}

/// Lifecycle of a dispatch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Sending,
    Sent,
    Retrying,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }

    /// `Sending -> Sending` covers redelivery of a job whose worker died mid-attempt.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Sending)
                | (Retrying, Sending)
                | (Sending, Sending)
                | (Sending, Sent)
                | (Sending, Retrying)
                | (Sending, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Sending => write!(f, "sending"),
            JobStatus::Sent => write!(f, "sent"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A scheduled message and its delivery record. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub request: MessageRequest,
    pub dispatch_at: DateTime<Utc>,
    pub delay_ms: i64,
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    /// Latest delivery receipt reported back by the provider.
    #[serde(default)]
    pub received: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(
        customer_id: Uuid,
        request: MessageRequest,
        dispatch_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let delay_ms = (dispatch_at - now).num_milliseconds().max(0);
        Self {
            id: Uuid::new_v4(),
            customer_id,
            request,
            dispatch_at,
            delay_ms,
            attempts: 0,
            status: JobStatus::Queued,
            last_error: None,
            provider_response: None,
            received: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn channel(&self) -> Channel {
        self.request.channel
    }

    /// Address the provider is called with, used to match delivery receipts.
    pub fn recipient_address(&self) -> String {
        self.request.recipient.normalized(self.request.channel)
    }

    /// Move to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(
        &mut self,
        next: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Payload carried by the delayed queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub customer_id: Uuid,
    pub channel: Channel,
    /// 1-based number of the attempt this delivery will make.
    pub attempt: u32,
    /// Scheduling delay, used by the worker to size its adaptive send floor.
    pub pacing_hint_ms: u64,
}

impl QueuedJob {
    pub fn first_attempt(job: &DispatchJob) -> Self {
        Self {
            job_id: job.id,
            customer_id: job.customer_id,
            channel: job.channel(),
            attempt: 1,
            pacing_hint_ms: job.delay_ms.max(0) as u64,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}
