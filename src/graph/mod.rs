//! Microsoft Graph mailbox integration.
//!
//! The shared help desk mailbox is read with client-credentials (app-only)
//! tokens. [`Mailbox`] is the seam the poller works against; [`GraphClient`]
//! is the real implementation.

mod client;

pub use client::GraphClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::SettingsKey;
use crate::db::Setting;
use crate::DbPool;

/// Graph `emailAddress` object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRecipient {
    #[serde(rename = "emailAddress", default)]
    pub email_address: EmailAddress,
}

/// Unread message summary as returned by the inbox listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphMessage {
    pub id: String,
    pub subject: Option<String>,
    pub from: Option<MessageRecipient>,
    #[serde(rename = "replyTo", default)]
    pub reply_to: Vec<MessageRecipient>,
    #[serde(rename = "bodyPreview")]
    pub body_preview: Option<String>,
}

impl GraphMessage {
    pub fn subject_or_default(&self) -> String {
        self.subject
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("(no subject)")
            .to_string()
    }

    pub fn from_address(&self) -> Option<&str> {
        self.from.as_ref()?.email_address.address.as_deref()
    }

    /// Requester address and name: Reply-To wins over From
    pub fn requester(&self) -> (Option<String>, Option<String>) {
        let reply = self.reply_to.first().map(|r| &r.email_address);
        let from = self.from.as_ref().map(|r| &r.email_address);
        let address = reply
            .and_then(|r| r.address.clone())
            .or_else(|| from.and_then(|f| f.address.clone()));
        let name = reply
            .and_then(|r| r.name.clone())
            .or_else(|| from.and_then(|f| f.name.clone()));
        (address, name)
    }
}

pub const FILE_ATTACHMENT_TYPE: &str = "#microsoft.graph.fileAttachment";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphAttachment {
    pub id: Option<String>,
    #[serde(rename = "@odata.type")]
    pub odata_type: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    /// Base64 content; not always included in listings
    #[serde(rename = "contentBytes")]
    pub content_bytes: Option<String>,
}

impl GraphAttachment {
    pub fn is_file(&self) -> bool {
        self.odata_type.as_deref() == Some(FILE_ATTACHMENT_TYPE)
    }
}

/// File attached to an outgoing Graph message
#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Operations the poller needs from the shared mailbox
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Up to 25 unread inbox messages, newest first
    async fn unread_messages(&self) -> Result<Vec<GraphMessage>>;
    /// Full body content, `None` when unavailable
    async fn message_body(&self, message_id: &str) -> Result<Option<String>>;
    async fn attachments(&self, message_id: &str) -> Result<Vec<GraphAttachment>>;
    async fn download_attachment(&self, attachment_id: &str) -> Result<Option<GraphAttachment>>;
    async fn mark_read(&self, message_id: &str) -> Result<()>;
}

/// Graph app registration and mailbox, read from settings
#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_email: String,
}

impl GraphSettings {
    /// `None` unless client id, client secret and mailbox address are all set
    pub async fn load(db: &DbPool, key: Option<&SettingsKey>) -> Result<Option<Self>> {
        let client_id = Setting::get_or(db, "MS_CLIENT_ID", "").await?;
        let client_secret = Setting::get_secret(db, "MS_CLIENT_SECRET", key).await?;
        let tenant_id = Setting::get_or(db, "MS_TENANT_ID", "common").await?;
        let user_email = Setting::get_or(db, "MS_USER_EMAIL", "").await?;

        if client_id.is_empty() || client_secret.is_empty() || user_email.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            tenant_id,
            client_id,
            client_secret,
            user_email,
        }))
    }
}
