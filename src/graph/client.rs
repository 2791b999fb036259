//! reqwest-backed Graph client with a cached app-only token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{GraphAttachment, GraphMessage, GraphSettings, Mailbox, OutgoingAttachment};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Renew tokens this long before Graph says they expire
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    body: Option<BodyContent>,
}

#[derive(Debug, Deserialize)]
struct BodyContent {
    content: Option<String>,
}

pub struct GraphClient {
    settings: GraphSettings,
    client: reqwest::Client,
    token: Mutex<Option<(String, Instant)>>,
}

impl GraphClient {
    pub fn new(settings: GraphSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            settings,
            client,
            token: Mutex::new(None),
        }
    }

    pub fn mailbox_address(&self) -> &str {
        &self.settings.user_email
    }

    fn user_url(&self, path: &str) -> String {
        format!("{}/users/{}/{}", GRAPH_BASE, self.settings.user_email, path)
    }

    /// App-only token for the Graph default scope, reused until near expiry
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires)) = cached.as_ref() {
            if Instant::now() + TOKEN_SLACK < *expires {
                return Ok(token.clone());
            }
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.settings.tenant_id
        );
        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("Failed to request Graph token")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Graph token error: {} - {}", status, body);
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse Graph token response")?;
        let expires = Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some((token.access_token.clone(), expires));
        Ok(token.access_token)
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to make Graph API request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Graph API error: {} - {}", status, body);
        }

        response.json().await.context("Failed to parse Graph API response")
    }

    /// Like `get`, but a non-success status yields `None`
    async fn get_optional<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<Option<T>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("Failed to make Graph API request")?;

        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(Some(
            response
                .json()
                .await
                .context("Failed to parse Graph API response")?,
        ))
    }

    /// Send an HTML message from the shared mailbox, saving it to Sent Items
    pub async fn send_mail(
        &self,
        to_address: &str,
        to_name: Option<&str>,
        subject: &str,
        html_body: &str,
        attachments: &[OutgoingAttachment],
    ) -> Result<()> {
        let mut message = json!({
            "subject": subject,
            "body": {"contentType": "HTML", "content": html_body},
            "toRecipients": [
                {"emailAddress": {"address": to_address, "name": to_name.unwrap_or(to_address)}}
            ],
        });
        if !attachments.is_empty() {
            let files: Vec<_> = attachments
                .iter()
                .map(|a| {
                    json!({
                        "@odata.type": super::FILE_ATTACHMENT_TYPE,
                        "name": a.name,
                        "contentType": a.content_type,
                        "contentBytes": BASE64.encode(&a.bytes),
                    })
                })
                .collect();
            message["attachments"] = json!(files);
        }

        tracing::info!(
            to = %to_address,
            subject = %subject,
            attachments = attachments.len(),
            "Sending mail via Graph"
        );

        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.user_url("sendMail"))
            .bearer_auth(token)
            .json(&json!({"message": message, "saveToSentItems": true}))
            .send()
            .await
            .context("Failed to call Graph sendMail")?;

        let status = response.status();
        if status.as_u16() != 202 && status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(1000).collect();
            anyhow::bail!("Graph sendMail error: {} - {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl Mailbox for GraphClient {
    async fn unread_messages(&self) -> Result<Vec<GraphMessage>> {
        let url = self.user_url(
            "mailFolders/Inbox/messages?$filter=isRead eq false&$orderby=receivedDateTime desc&$top=25",
        );
        let list: ValueList<GraphMessage> = self.get(&url).await?;
        Ok(list.value)
    }

    async fn message_body(&self, message_id: &str) -> Result<Option<String>> {
        let url = self.user_url(&format!("messages/{}?$select=body", message_id));
        let body: Option<MessageBody> = self.get_optional(&url).await?;
        Ok(body.and_then(|b| b.body).and_then(|b| b.content))
    }

    async fn attachments(&self, message_id: &str) -> Result<Vec<GraphAttachment>> {
        let url = self.user_url(&format!("messages/{}/attachments", message_id));
        let list: ValueList<GraphAttachment> = self.get(&url).await?;
        Ok(list.value)
    }

    async fn download_attachment(&self, attachment_id: &str) -> Result<Option<GraphAttachment>> {
        let url = self.user_url(&format!("attachments/{}", attachment_id));
        self.get_optional(&url).await
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .client
            .patch(self.user_url(&format!("messages/{}", message_id)))
            .bearer_auth(token)
            .json(&json!({"isRead": true}))
            .send()
            .await
            .context("Failed to mark message read")?;

        if !response.status().is_success() {
            anyhow::bail!("Graph API error marking read: {}", response.status());
        }
        Ok(())
    }
}
