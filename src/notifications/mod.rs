//! Outbound mail for tech notifications, forwarded notes and purchase orders.
//!
//! Mail goes out through the Graph mailbox when it is configured, else
//! through the SMTP relay from the config file, else it is logged and
//! dropped. Callers use [`notify`], which never fails the calling operation.

mod email;

pub use email::SmtpMailer;

use anyhow::Result;
use async_trait::async_trait;

use crate::crypto::SettingsKey;
use crate::graph::{GraphClient, GraphSettings, OutgoingAttachment};
use crate::DbPool;

/// A single outgoing HTML message
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<OutgoingAttachment>,
}

impl OutgoingMail {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, html_body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            to_name: None,
            subject: subject.into(),
            html_body: html_body.into(),
            attachments: Vec::new(),
        }
    }

    pub fn to_name(mut self, name: Option<&str>) -> Self {
        self.to_name = name.map(str::to_string);
        self
    }

    pub fn attach(mut self, attachment: OutgoingAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Which transport delivered a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Graph,
    Smtp,
    Skipped,
}

#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<Delivery>;
}

/// Send and log; failures are reported as `false`
pub async fn notify(outbox: &dyn Outbox, mail: OutgoingMail) -> bool {
    let to = mail.to.clone();
    let subject = mail.subject.clone();
    match outbox.send(mail).await {
        Ok(Delivery::Skipped) => false,
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(to = %to, subject = %subject, error = %e, "Failed to send mail");
            false
        }
    }
}

/// Production outbox: Graph, then SMTP, then nothing
pub struct MailRouter {
    db: DbPool,
    settings_key: Option<SettingsKey>,
    smtp: Option<SmtpMailer>,
}

impl MailRouter {
    pub fn new(db: DbPool, settings_key: Option<SettingsKey>, smtp: Option<SmtpMailer>) -> Self {
        Self {
            db,
            settings_key,
            smtp,
        }
    }
}

#[async_trait]
impl Outbox for MailRouter {
    async fn send(&self, mail: OutgoingMail) -> Result<Delivery> {
        if let Some(settings) = GraphSettings::load(&self.db, self.settings_key.as_ref()).await? {
            let client = GraphClient::new(settings);
            client
                .send_mail(
                    &mail.to,
                    mail.to_name.as_deref(),
                    &mail.subject,
                    &mail.html_body,
                    &mail.attachments,
                )
                .await?;
            return Ok(Delivery::Graph);
        }

        if let Some(smtp) = &self.smtp {
            smtp.send(&mail).await?;
            return Ok(Delivery::Smtp);
        }

        tracing::warn!(
            to = %mail.to,
            subject = %mail.subject,
            "No mail transport configured, skipping message"
        );
        Ok(Delivery::Skipped)
    }
}

/// Outbox that keeps every message in memory
#[cfg(test)]
#[derive(Default)]
pub struct RecordingOutbox {
    pub sent: std::sync::Mutex<Vec<OutgoingMail>>,
}

#[cfg(test)]
impl RecordingOutbox {
    pub fn messages(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Outbox for RecordingOutbox {
    async fn send(&self, mail: OutgoingMail) -> Result<Delivery> {
        self.sent.lock().unwrap().push(mail);
        Ok(Delivery::Smtp)
    }
}
