//! SMTP fallback transport using the relay from the config file.

use anyhow::{Context, Result};
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use super::OutgoingMail;
use crate::config::SmtpConfig;
use crate::engine::ingest::html_to_text;

pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    /// `None` unless host and from address are configured
    pub fn from_config(config: &SmtpConfig) -> Option<Self> {
        config.is_configured().then(|| Self {
            config: config.clone(),
        })
    }

    /// Send an HTML message with a plain-text alternative
    pub async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        let smtp_host = self
            .config
            .host
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SMTP host not configured"))?;
        let from_address = self
            .config
            .from_address
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("From address not configured"))?;

        let from: Mailbox = format!("{} <{}>", self.config.from_name, from_address)
            .parse()
            .context("Invalid from address")?;
        let to: Mailbox = match &mail.to_name {
            Some(name) => format!("{} <{}>", name, mail.to).parse(),
            None => mail.to.parse(),
        }
        .with_context(|| format!("Invalid recipient {}", mail.to))?;

        let body = MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(html_to_text(&mail.html_body)),
            )
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(mail.html_body.clone()),
            );

        let builder = Message::builder().from(from).to(to).subject(&mail.subject);
        let email = if mail.attachments.is_empty() {
            builder.multipart(body)?
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for file in &mail.attachments {
                let content_type = ContentType::parse(&file.content_type)
                    .or_else(|_| ContentType::parse("application/octet-stream"))?;
                mixed = mixed.singlepart(
                    Attachment::new(file.name.clone()).body(file.bytes.clone(), content_type),
                );
            }
            builder.multipart(mixed)?
        };

        let mailer = if self.config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host)
        }
        .port(self.config.port);

        let mailer = if let (Some(username), Some(password)) =
            (&self.config.username, &self.config.password)
        {
            mailer.credentials(Credentials::new(username.clone(), password.clone()))
        } else {
            mailer
        };

        mailer.build().send(email).await?;

        tracing::info!(to = %mail.to, subject = %mail.subject, "Sent mail via SMTP");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_host_and_sender() {
        let mut config = SmtpConfig::default();
        assert!(SmtpMailer::from_config(&config).is_none());
        config.host = Some("smtp.example.com".to_string());
        config.from_address = Some("helpdesk@example.com".to_string());
        assert!(SmtpMailer::from_config(&config).is_some());
    }
}
