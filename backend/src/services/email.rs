use async_trait::async_trait;
use crm_shared::Record;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::automation::templates;
use crate::config::SmtpConfig;
use crate::error::{ApiResult, AppError};
use crate::services::system_modules::EMAIL_TEMPLATES;
use crate::store::RecordRepository;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address '{0}'")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("smtp transport error: {0}")]
    Transport(String),
}

/// Outbound email transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

#[derive(Debug, Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl SmtpMailer {
    pub fn new(smtp_config: &SmtpConfig) -> Self {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host).unwrap_or_else(|e| {
                warn!("STARTTLS setup for {} failed, sending without TLS: {}", smtp_config.host, e);
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            })
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        SmtpMailer {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let from_raw = format!("{} <{}>", self.from_name, self.from_email);
        let from = from_raw
            .parse::<Mailbox>()
            .map_err(|_| MailError::Address(from_raw.clone()))?;
        let recipient = to.parse::<Mailbox>().map_err(|_| MailError::Address(to.to_string()))?;

        let message = Message::builder()
            .from(from)
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())
            .map_err(|e| MailError::Build(e.to_string()))?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", to);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to, e);
                Err(MailError::Transport(e.to_string()))
            }
        }
    }
}

/// Used when SMTP is not configured: messages are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, to: &str, subject: &str, _body: &str) -> Result<(), MailError> {
        info!(to = %to, subject = %subject, "SMTP not configured, email not sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Renders records of the `email_templates` module against a record
#[derive(Clone)]
pub struct EmailTemplateService {
    records: Arc<dyn RecordRepository>,
}

impl EmailTemplateService {
    pub fn new(records: Arc<dyn RecordRepository>) -> Self {
        Self { records }
    }

    pub async fn render_template(&self, template_id: Uuid, record: &Record) -> ApiResult<RenderedEmail> {
        let template = self
            .records
            .get(EMAIL_TEMPLATES, template_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Email template {}", template_id)))?;

        let text = |name: &str| {
            template
                .data
                .get(name)
                .map(|v| v.display_string())
                .unwrap_or_default()
        };

        Ok(RenderedEmail {
            subject: templates::render(&text("subject"), record),
            body: templates::render(&text("body"), record),
        })
    }
}
