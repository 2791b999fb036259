pub mod api;
pub mod attachments;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod directory;
pub mod engine;
pub mod ftp;
pub mod graph;
pub mod notifications;

pub use db::DbPool;

use attachments::AttachmentStore;
use config::Config;
use crypto::SettingsKey;
use notifications::{MailRouter, Outbox, SmtpMailer};
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    /// Key for sensitive settings; `None` stores them in plain text
    pub settings_key: Option<SettingsKey>,
    pub outbox: Arc<dyn Outbox>,
    pub attachments: AttachmentStore,
}

impl AppState {
    pub fn new(config: Config, db: DbPool) -> Self {
        let settings_key = config
            .security
            .secret_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(SettingsKey::derive);
        let outbox: Arc<dyn Outbox> = Arc::new(MailRouter::new(
            db.clone(),
            settings_key.clone(),
            SmtpMailer::from_config(&config.smtp),
        ));
        let attachments = AttachmentStore::new(config.attachments_root(), &config.attachments.subdir);
        Self {
            config,
            db,
            settings_key,
            outbox,
            attachments,
        }
    }

    /// Replace the outbound mail transport
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = outbox;
        self
    }
}
