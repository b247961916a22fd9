//! SMTP transport backed by lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

use super::{MailerError, Transport};
use crate::config::{Mail, TlsMode};
use crate::model::NotificationMessage;

/// SMTP delivery with one pooled connection, reused while it stays idle for
/// less than `mail.idle_seconds`.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    server: String,
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Build the transport and check the configured addresses. Does not connect.
    pub fn from_config(config: &Mail) -> Result<Self, MailerError> {
        parse_mailbox(&config.from)?;
        for to in &config.to {
            parse_mailbox(to)?;
        }

        let mut builder = match config.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server),
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)
                .map_err(|e| MailerError::ConnectFailed(e.to_string()))?,
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
                .map_err(|e| MailerError::ConnectFailed(e.to_string()))?,
        };

        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)))
            .pool_config(
                PoolConfig::new()
                    .max_size(1)
                    .idle_timeout(Duration::from_secs(config.idle_seconds)),
            );

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            server: format!("{}:{}", config.server, config.port),
        })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailerError> {
    address
        .parse()
        .map_err(|_| MailerError::InvalidAddress(address.to_string()))
}

pub(crate) fn build_message(message: &NotificationMessage) -> Result<Message, MailerError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&message.from)?)
        .subject(message.subject.as_str())
        .header(ContentType::TEXT_PLAIN);
    for to in &message.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    builder
        .body(message.body.clone())
        .map_err(|e| MailerError::SendFailed(e.to_string()))
}

/// 53x replies are authentication problems; no reply at all means the
/// connection never got that far.
fn classify(err: lettre::transport::smtp::Error) -> MailerError {
    let code = err.status().map(|c| c.to_string());
    match code.as_deref() {
        Some(c) if c.starts_with("53") => MailerError::AuthFailed(err.to_string()),
        Some(_) => MailerError::SendFailed(err.to_string()),
        None => MailerError::ConnectFailed(err.to_string()),
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &NotificationMessage) -> Result<(), MailerError> {
        let email = build_message(message)?;
        self.transport.send(email).await.map_err(classify)?;
        Ok(())
    }

    async fn verify(&self) -> Result<(), MailerError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(MailerError::ConnectFailed(format!(
                "{} did not answer NOOP",
                self.server
            ))),
            Err(err) => Err(classify(err)),
        }
    }
}
