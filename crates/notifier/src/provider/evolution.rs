//! Evolution API chat adapter.
//!
//! The stored URL is the instance's `/message/sendText/{instance}` endpoint; images go to the
//! matching `/message/sendMedia/{instance}` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use herald_common::types::MessageRequest;
use herald_engine::settings::ProviderSettings;

use super::{DeliveryError, Provider, execute, mismatch};

const TEXT_PATH: &str = "/message/sendText/";
const MEDIA_PATH: &str = "/message/sendMedia/";

pub struct EvolutionProvider {
    http: Client,
}

impl EvolutionProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    fn target(url: &str, request: &MessageRequest) -> Result<(String, Value), DeliveryError> {
        let number = request.recipient.normalized(request.channel);
        match &request.media {
            None => Ok((
                url.to_string(),
                json!({ "number": number, "text": request.content.body }),
            )),
            Some(media) => {
                if !url.contains(TEXT_PATH) {
                    return Err(DeliveryError::Unsupported(format!(
                        "cannot derive a media endpoint from '{}'",
                        url
                    )));
                }
                Ok((
                    url.replacen(TEXT_PATH, MEDIA_PATH, 1),
                    json!({
                        "number": number,
                        "mediatype": "image",
                        "media": media.image,
                        "caption": media.caption.as_deref().unwrap_or(&request.content.body),
                    }),
                ))
            }
        }
    }
}

#[async_trait]
impl Provider for EvolutionProvider {
    async fn send(
        &self,
        settings: &ProviderSettings,
        request: &MessageRequest,
    ) -> Result<Value, DeliveryError> {
        let ProviderSettings::Evolution { url, api_key } = settings else {
            return Err(mismatch("evolution", request));
        };

        let (url, payload) = Self::target(url, request)?;
        tracing::debug!(url = %url, "Sending via Evolution API");
        execute(self.http.post(url).header("apikey", api_key).json(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::{Channel, MediaAttachment, MessageContent, Recipient};

    fn request(media: Option<MediaAttachment>) -> MessageRequest {
        MessageRequest {
            channel: Channel::Whatsapp,
            recipient: Recipient::Phone {
                country: "+55".to_string(),
                area_code: "11".to_string(),
                number: "912345678".to_string(),
            },
            content: MessageContent {
                body: "Oi".to_string(),
                subject: None,
                header_title: None,
                footer: None,
            },
            send_at: None,
            media,
        }
    }

    #[test]
    fn test_text_uses_stored_endpoint() {
        let url = "https://evo.example.com/message/sendText/acme";
        let (target, payload) = EvolutionProvider::target(url, &request(None)).unwrap();
        assert_eq!(target, url);
        assert_eq!(payload["number"], "551112345678");
        assert_eq!(payload["text"], "Oi");
    }

    #[test]
    fn test_media_endpoint_derived() {
        let media = MediaAttachment {
            image: "data:image/png;base64,AAAA".to_string(),
            caption: Some("promo".to_string()),
        };
        let (target, payload) = EvolutionProvider::target(
            "https://evo.example.com/message/sendText/acme",
            &request(Some(media.clone())),
        )
        .unwrap();
        assert_eq!(target, "https://evo.example.com/message/sendMedia/acme");
        assert_eq!(payload["caption"], "promo");

        let err = EvolutionProvider::target("https://evo.example.com/custom", &request(Some(media)));
        assert!(matches!(err, Err(DeliveryError::Unsupported(_))));
    }
}
