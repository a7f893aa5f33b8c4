//! Per-item validation of submitted messages.
//!
//! Turns a loosely-typed [`MessageInput`] into an accepted [`MessageRequest`]. A failure here
//! rejects only the offending item; the rest of the batch is still scheduled.

use std::sync::LazyLock;

use chrono::{NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use thiserror::Error;

use herald_common::types::{
    Channel, MediaAttachment, MessageContent, MessageInput, MessageRequest, Recipient,
};

/// Wire format of requested send times.
pub const SEND_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Longest SMS body accepted.
pub const SMS_MAX_CHARS: usize = 160;

static COUNTRY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+\d{1,3}$").unwrap());
static AREA_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{2}$").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{8,9}$").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("send_at must be in the format 'YYYY-MM-DD HH:mm:ss' (got '{0}')")]
    InvalidSendAt(String),

    #[error("message must not exceed {max} characters")]
    MessageTooLong { max: usize },

    #[error("media attachments are only supported on whatsapp")]
    MediaNotSupported,
}

/// Validate one submitted message. `tz` is the zone requested send times are written in.
pub fn validate(input: &MessageInput, tz: Tz) -> Result<MessageRequest, ValidationError> {
    let channel: Channel = required(&input.channel, "channel")?
        .parse()
        .map_err(|_| ValidationError::UnknownChannel(input.channel.clone().unwrap_or_default()))?;

    let body = required(&input.message, "message")?.to_string();
    if channel == Channel::Sms && body.chars().count() > SMS_MAX_CHARS {
        return Err(ValidationError::MessageTooLong { max: SMS_MAX_CHARS });
    }

    let recipient = if channel.uses_phone() {
        phone_recipient(input)?
    } else {
        email_recipient(input)?
    };

    let subject = if channel == Channel::Email {
        Some(required(&input.subject, "subject")?.to_string())
    } else {
        None
    };

    let media = match input.image.as_deref().map(str::trim) {
        None => None,
        Some(_) if channel != Channel::Whatsapp => return Err(ValidationError::MediaNotSupported),
        Some("") => return Err(ValidationError::MissingField("image")),
        Some(image) => Some(MediaAttachment {
            image: image.to_string(),
            caption: input.caption.clone(),
        }),
    };

    let send_at = match input.send_at.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_send_at(raw, tz)?),
    };

    Ok(MessageRequest {
        channel,
        recipient,
        content: MessageContent {
            body,
            subject,
            header_title: non_blank(&input.header_title),
            footer: non_blank(&input.footer),
        },
        send_at,
        media,
    })
}

/// Parse `YYYY-MM-DD HH:mm:ss` as wall-clock time in `tz`.
///
/// Ambiguous local times (clocks turned back) resolve to the earlier instant; times skipped by a
/// forward shift are rejected.
pub fn parse_send_at(raw: &str, tz: Tz) -> Result<chrono::DateTime<Utc>, ValidationError> {
    let naive = NaiveDateTime::parse_from_str(raw, SEND_AT_FORMAT)
        .map_err(|_| ValidationError::InvalidSendAt(raw.to_string()))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::InvalidSendAt(raw.to_string()))
}

fn phone_recipient(input: &MessageInput) -> Result<Recipient, ValidationError> {
    let country = required(&input.country, "country")?;
    let area_code = required(&input.area_code, "area_code")?;
    let number = required(&input.number, "number")?;

    if !COUNTRY_RE.is_match(country) {
        return Err(ValidationError::InvalidRecipient(format!(
            "country code '{}' must be '+' followed by 1 to 3 digits",
            country
        )));
    }
    if !AREA_CODE_RE.is_match(area_code) {
        return Err(ValidationError::InvalidRecipient(format!(
            "area code '{}' must be exactly 2 digits",
            area_code
        )));
    }
    if !NUMBER_RE.is_match(number) {
        return Err(ValidationError::InvalidRecipient(format!(
            "number '{}' must be 8 or 9 digits",
            number
        )));
    }

    Ok(Recipient::Phone {
        country: country.to_string(),
        area_code: area_code.to_string(),
        number: number.to_string(),
    })
}

fn email_recipient(input: &MessageInput) -> Result<Recipient, ValidationError> {
    let address = required(&input.email, "email")?;
    if !EMAIL_RE.is_match(address) {
        return Err(ValidationError::InvalidRecipient(format!(
            "'{}' is not a valid email address",
            address
        )));
    }
    Ok(Recipient::Email {
        address: address.to_string(),
    })
}

/// A present, non-blank field, trimmed.
fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(field))
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Sao_Paulo;

    fn whatsapp_input() -> MessageInput {
        MessageInput {
            channel: Some("whatsapp".to_string()),
            country: Some("+55".to_string()),
            area_code: Some("86".to_string()),
            number: Some("994873708".to_string()),
            message: Some("Olá!".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_whatsapp_message() {
        let request = validate(&whatsapp_input(), Sao_Paulo).unwrap();
        assert_eq!(request.channel, Channel::Whatsapp);
        assert_eq!(request.content.body, "Olá!");
        assert!(request.send_at.is_none());
        assert!(request.media.is_none());
    }

    #[test]
    fn test_missing_fields_are_named() {
        let mut input = whatsapp_input();
        input.area_code = None;
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::MissingField("area_code"))
        );

        let mut input = whatsapp_input();
        input.message = Some("   ".to_string());
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::MissingField("message"))
        );

        let mut input = whatsapp_input();
        input.channel = None;
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::MissingField("channel"))
        );
    }

    #[test]
    fn test_unknown_channel() {
        let mut input = whatsapp_input();
        input.channel = Some("pigeon".to_string());
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::UnknownChannel("pigeon".to_string()))
        );
    }

    #[test]
    fn test_bad_phone_formats() {
        for (country, area, number) in [
            ("55", "86", "994873708"),
            ("+55", "8", "994873708"),
            ("+55", "86", "99487"),
            ("+55", "86", "99487370a"),
        ] {
            let mut input = whatsapp_input();
            input.country = Some(country.to_string());
            input.area_code = Some(area.to_string());
            input.number = Some(number.to_string());
            assert!(
                matches!(
                    validate(&input, Sao_Paulo),
                    Err(ValidationError::InvalidRecipient(_))
                ),
                "{country} {area} {number} should be rejected"
            );
        }
    }

    #[test]
    fn test_sms_length_limit() {
        let mut input = whatsapp_input();
        input.channel = Some("sms".to_string());
        input.message = Some("x".repeat(161));
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::MessageTooLong { max: 160 })
        );

        input.message = Some("x".repeat(160));
        assert!(validate(&input, Sao_Paulo).is_ok());
    }

    #[test]
    fn test_email_requires_subject_and_address() {
        let mut input = MessageInput {
            channel: Some("email".to_string()),
            email: Some("ana@example.com".to_string()),
            message: Some("<p>Hi</p>".to_string()),
            ..Default::default()
        };
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::MissingField("subject"))
        );

        input.subject = Some("Welcome".to_string());
        let request = validate(&input, Sao_Paulo).unwrap();
        assert_eq!(request.content.subject.as_deref(), Some("Welcome"));

        input.email = Some("not-an-address".to_string());
        assert!(matches!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_media_only_on_whatsapp() {
        let mut input = whatsapp_input();
        input.image = Some("https://cdn.example.com/a.png".to_string());
        input.caption = Some("promo".to_string());
        let request = validate(&input, Sao_Paulo).unwrap();
        assert_eq!(request.media.unwrap().caption.as_deref(), Some("promo"));

        input.channel = Some("sms".to_string());
        assert_eq!(
            validate(&input, Sao_Paulo),
            Err(ValidationError::MediaNotSupported)
        );
    }

    #[test]
    fn test_send_at_is_read_in_request_zone() {
        let mut input = whatsapp_input();
        input.send_at = Some("2025-01-17 10:47:23".to_string());
        let request = validate(&input, Sao_Paulo).unwrap();
        assert_eq!(
            request.send_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 17, 13, 47, 23).unwrap())
        );
    }

    #[test]
    fn test_malformed_send_at() {
        for raw in ["2025-01-17T10:47:23", "2025-13-01 10:00:00", "2025-01-17 25:00:00", "soon"] {
            let mut input = whatsapp_input();
            input.send_at = Some(raw.to_string());
            assert_eq!(
                validate(&input, Sao_Paulo),
                Err(ValidationError::InvalidSendAt(raw.to_string()))
            );
        }
    }
}
