//! SMTP adapter. One connection per send, built from the customer's relay credentials.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{Value, json};

use herald_common::types::{MessageContent, MessageRequest};
use herald_engine::settings::ProviderSettings;

use super::{DeliveryError, Provider, mismatch};

/// Port on which the relay expects TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

pub struct SmtpProvider {
    timeout: Duration,
}

impl SmtpProvider {
    /// `timeout` bounds connecting to the relay and each SMTP command.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn transport(
        &self,
        host: &str,
        port: u16,
        user: &str,
        pass: &str,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        // Customer relays often run self-signed certificates.
        let parameters = TlsParameters::builder(host.to_string())
            .dangerous_accept_invalid_certs(true)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .tls(tls_for_port(port, parameters))
            .credentials(Credentials::new(user.to_string(), pass.to_string()))
            .timeout(Some(self.timeout))
            .build())
    }
}

/// Implicit TLS on 465, STARTTLS when offered elsewhere.
fn tls_for_port(port: u16, parameters: TlsParameters) -> Tls {
    if port == IMPLICIT_TLS_PORT {
        Tls::Wrapper(parameters)
    } else {
        Tls::Opportunistic(parameters)
    }
}

/// Wrap the message body with its optional header title and footer.
///
/// The body is already HTML and is inserted as-is.
pub fn render_html(content: &MessageContent) -> String {
    let mut html = String::from(
        "<!DOCTYPE html><html><body style=\"font-family:Arial,sans-serif;margin:0;padding:0\">",
    );
    if let Some(title) = &content.header_title {
        html.push_str("<div style=\"padding:24px;background:#f4f4f4\"><h1 style=\"margin:0\">");
        html.push_str(title);
        html.push_str("</h1></div>");
    }
    html.push_str("<div style=\"padding:24px\">");
    html.push_str(&content.body);
    html.push_str("</div>");
    if let Some(footer) = &content.footer {
        html.push_str("<div style=\"padding:16px;font-size:12px;color:#888\">");
        html.push_str(footer);
        html.push_str("</div>");
    }
    html.push_str("</body></html>");
    html
}

/// Build the HTML mail for `request` sent from `from_name <from_address>`.
pub fn build_message(
    from_name: &str,
    from_address: &str,
    request: &MessageRequest,
) -> Result<Message, DeliveryError> {
    let from: Address = from_address
        .parse()
        .map_err(|e| DeliveryError::Unsupported(format!("sender address: {}", e)))?;
    let to: Address = request
        .recipient
        .normalized(request.channel)
        .parse()
        .map_err(|e| DeliveryError::Unsupported(format!("recipient address: {}", e)))?;

    Message::builder()
        .from(Mailbox::new(Some(from_name.to_string()), from))
        .to(Mailbox::new(None, to))
        .subject(request.content.subject.as_deref().unwrap_or_default())
        .header(ContentType::TEXT_HTML)
        .body(render_html(&request.content))
        .map_err(|e| DeliveryError::Unsupported(e.to_string()))
}

#[async_trait]
impl Provider for SmtpProvider {
    async fn send(
        &self,
        settings: &ProviderSettings,
        request: &MessageRequest,
    ) -> Result<Value, DeliveryError> {
        let ProviderSettings::Smtp {
            host,
            port,
            user,
            pass,
            from_name,
            from_address,
        } = settings
        else {
            return Err(mismatch("smtp", request));
        };

        let message = build_message(from_name, from_address, request)?;
        let transport = self.transport(host, *port, user, pass)?;
        let response = transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(json!({
            "success": true,
            "code": response.code().to_string(),
            "message": response.message().collect::<Vec<_>>(),
        }))
    }
}
