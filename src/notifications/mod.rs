use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Transactional email delivery errors
#[derive(Debug, Error)]
pub enum MailError {
    #[error("email provider unreachable: {0}")]
    Transport(String),
    #[error("email provider rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        MailError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// Outbound transactional email.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Mailer for a JSON email API (`POST {api_base}/emails`, bearer auth).
#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    api_base: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[derive(Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<OutboundAttachment<'a>>,
}

#[derive(Serialize)]
struct OutboundAttachment<'a> {
    filename: &'a str,
    content_type: &'a str,
    /// Base64 encoded body
    content: String,
}

#[async_trait]
impl Mailer for HttpMailer {
    #[instrument(skip(self, email), fields(subject = %email.subject))]
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let payload = OutboundEmail {
            from: &self.from,
            to: [&email.to],
            subject: &email.subject,
            text: &email.text,
            attachments: email
                .attachments
                .iter()
                .map(|a| OutboundAttachment {
                    filename: &a.filename,
                    content_type: &a.content_type,
                    content: base64::engine::general_purpose::STANDARD.encode(&a.content),
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/emails", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Fallback used when no email provider is configured: logs and succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(
            to = %email.to,
            subject = %email.subject,
            attachments = email.attachments.len(),
            "Email provider not configured; message logged only"
        );
        Ok(())
    }
}

/// Picks the HTTP mailer when an API key is configured, the logging one
/// otherwise.
pub fn mailer_from_config(cfg: &crate::config::EmailConfig) -> Arc<dyn Mailer> {
    match cfg.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => Arc::new(HttpMailer::new(&cfg.api_base, key, &cfg.from_address)),
        None => {
            warn!("email.api_key not set; transactional email will only be logged");
            Arc::new(LogMailer)
        }
    }
}
