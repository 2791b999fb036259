//! Shared mailbox poller.
//!
//! Each run turns unread mail into tickets or reply notes, then imports the
//! FTP drop folder when enabled. Overlapping runs are prevented with a lock
//! flag kept in the settings table; a flag left behind by a crashed run is
//! taken over once it is old enough, and cleared by the watchdog.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use super::ftp_import::import_drop_folders;
use super::ingest::{
    domain_allowed, html_to_text, is_denied, reply_note_html, reply_segment, sanitize_note,
    sender_domain, text_to_html, ticket_reference, wanted_mail_attachment,
};
use crate::attachments::AttachmentStore;
use crate::crypto::SettingsKey;
use crate::db::{
    allowed_domains, deny_phrases, now_timestamp, parse_timestamp, timestamp, Contact, EmailCheck,
    EntryAction, NewTicket, PollStatus, Setting, Ticket, TicketNote, TicketSource, TicketStatus,
    User,
};
use crate::ftp::{DropFolder, FtpDropFolder, FtpSettings};
use crate::graph::{GraphClient, GraphMessage, GraphSettings, Mailbox};
use crate::notifications::{notify, OutgoingMail, Outbox};
use crate::{AppState, DbPool};

pub const LOCK_FLAG_KEY: &str = "EMAIL_POLL_RUNNING";
pub const LOCK_STARTED_KEY: &str = "EMAIL_POLL_STARTED_AT";
pub const LAST_FINISHED_KEY: &str = "EMAIL_POLL_LAST_FINISHED_AT";
pub const LAST_DURATION_KEY: &str = "EMAIL_POLL_LAST_DURATION_MS";
pub const LAST_RESULT_KEY: &str = "EMAIL_POLL_LAST_RESULT";

pub const RESULT_OK: &str = "ok";
pub const RESULT_TIMEOUT: &str = "timeout_abort";
pub const RESULT_EXCEPTION: &str = "exception";

/// Age after which the watchdog clears a lock regardless of the interval
pub const WATCHDOG_STALE_SECS: i64 = 900;
/// Mail check logs are kept this long
const CHECK_RETENTION_DAYS: i64 = 7;

/// Timing limits derived from the poll interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimits {
    pub interval_secs: i64,
    /// A lock younger than this means another run is active
    pub stale_after_secs: i64,
    pub max_runtime_secs: i64,
}

impl PollLimits {
    /// `max_runtime_override` of 0 means "derive from the interval"
    pub fn new(interval_secs: i64, max_runtime_override: i64) -> Self {
        let interval_secs = if interval_secs > 0 { interval_secs } else { 60 };
        let derived = if interval_secs <= 90 {
            50
        } else {
            (interval_secs as f64 * 0.8) as i64
        };
        Self {
            interval_secs,
            stale_after_secs: (interval_secs * 5).max(180),
            max_runtime_secs: if max_runtime_override > 0 {
                max_runtime_override
            } else {
                derived
            },
        }
    }

    /// `default_interval` applies when `POLL_INTERVAL_SECONDS` is unset
    pub async fn load(db: &DbPool, default_interval: i64) -> Result<Self> {
        let interval = Setting::get_i64(db, "POLL_INTERVAL_SECONDS", default_interval).await?;
        let max_runtime = Setting::get_i64(db, "POLL_MAX_SECONDS", 0).await?;
        Ok(Self::new(interval, max_runtime))
    }
}

/// Take the poll lock unless a live run holds it.
/// A set flag with no start time counts as live; only an aged or
/// unreadable start time lets a new run take over.
pub async fn acquire_lock(db: &DbPool, limits: &PollLimits, now: DateTime<Utc>) -> Result<bool> {
    let running = Setting::get(db, LOCK_FLAG_KEY).await?.as_deref() == Some("1");
    if running {
        let started = Setting::get(db, LOCK_STARTED_KEY).await?.unwrap_or_default();
        if started.is_empty() {
            warn!("Email poll lock set without a start time, skipping run");
            return Ok(false);
        }
        match parse_timestamp(&started) {
            Some(at) => {
                let age = (now - at).num_seconds();
                if age <= limits.stale_after_secs {
                    return Ok(false);
                }
                warn!(
                    age_secs = age,
                    threshold = limits.stale_after_secs,
                    "Stale email poll lock, taking over"
                );
            }
            None => warn!(started = %started, "Unreadable email poll lock time, taking over"),
        }
    }
    Setting::set(db, LOCK_FLAG_KEY, "1").await?;
    Setting::set(db, LOCK_STARTED_KEY, &timestamp(now)).await?;
    Ok(true)
}

/// Clear the lock and record how the run ended
pub async fn release_lock(db: &DbPool, duration_ms: i64, result: &str) -> Result<()> {
    Setting::set(db, LOCK_FLAG_KEY, "0").await?;
    Setting::set(db, LAST_FINISHED_KEY, &now_timestamp()).await?;
    Setting::set(db, LAST_DURATION_KEY, &duration_ms.to_string()).await?;
    Setting::set(db, LAST_RESULT_KEY, result).await?;
    Ok(())
}

pub async fn poll_status(db: &DbPool, default_interval: i64) -> Result<PollStatus> {
    Ok(PollStatus {
        running: Setting::get(db, LOCK_FLAG_KEY).await?.as_deref() == Some("1"),
        started_at: Setting::get(db, LOCK_STARTED_KEY).await?,
        last_finished_at: Setting::get(db, LAST_FINISHED_KEY).await?,
        last_duration_ms: Setting::get(db, LAST_DURATION_KEY)
            .await?
            .and_then(|v| v.parse().ok()),
        last_result: Setting::get(db, LAST_RESULT_KEY).await?,
        interval_seconds: PollLimits::load(db, default_interval).await?.interval_secs,
    })
}

/// Clear a lock left by a run that never finished.
/// Returns the recorded result when the lock was cleared.
pub async fn run_watchdog(db: &DbPool, now: DateTime<Utc>) -> Result<Option<String>> {
    if Setting::get(db, LOCK_FLAG_KEY).await?.as_deref() != Some("1") {
        return Ok(None);
    }
    let started = Setting::get(db, LOCK_STARTED_KEY).await?.unwrap_or_default();
    if started.is_empty() {
        return Ok(None);
    }

    let result = match parse_timestamp(&started) {
        Some(at) => {
            let age = (now - at).num_seconds();
            if age <= WATCHDOG_STALE_SECS {
                return Ok(None);
            }
            error!(age_secs = age, "Watchdog cleared stale email poll lock");
            format!("watchdog_cleared_stale_after_{}s", age)
        }
        None => {
            error!(started = %started, "Watchdog cleared email poll lock with unreadable start time");
            "watchdog_cleared_parse_error".to_string()
        }
    };
    Setting::set(db, LOCK_FLAG_KEY, "0").await?;
    Setting::set(db, LAST_RESULT_KEY, &result).await?;
    Ok(Some(result))
}

/// Statistics from one poll run
#[derive(Debug, Default, Serialize)]
pub struct PollStats {
    pub skipped: bool,
    pub messages: usize,
    pub tickets_created: usize,
    pub notes_created: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub ftp_tickets: usize,
    pub result: String,
}

pub struct EmailPoller {
    db: DbPool,
    settings_key: Option<SettingsKey>,
    outbox: Arc<dyn Outbox>,
    attachments: AttachmentStore,
    default_interval: i64,
}

impl EmailPoller {
    pub fn new(
        db: DbPool,
        settings_key: Option<SettingsKey>,
        outbox: Arc<dyn Outbox>,
        attachments: AttachmentStore,
    ) -> Self {
        Self {
            db,
            settings_key,
            outbox,
            attachments,
            default_interval: 60,
        }
    }

    pub fn with_default_interval(mut self, secs: u64) -> Self {
        self.default_interval = secs as i64;
        self
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.db.clone(),
            state.settings_key.clone(),
            state.outbox.clone(),
            state.attachments.clone(),
        )
        .with_default_interval(state.config.scheduler.poll_interval_secs)
    }

    /// One full poll: lock, mailbox pass, FTP pass, log purge, unlock
    pub async fn run(&self) -> Result<PollStats> {
        let limits = PollLimits::load(&self.db, self.default_interval).await?;
        if !acquire_lock(&self.db, &limits, Utc::now()).await? {
            info!("Previous email poll still active, skipping");
            return Ok(PollStats {
                skipped: true,
                ..Default::default()
            });
        }

        let started = Instant::now();
        let deadline = started + Duration::from_secs(limits.max_runtime_secs.max(1) as u64);
        let mut stats = PollStats::default();

        let result = match self.run_locked(deadline, &mut stats).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Email poll failed");
                RESULT_EXCEPTION
            }
        };
        stats.result = result.to_string();

        let duration_ms = started.elapsed().as_millis() as i64;
        release_lock(&self.db, duration_ms, result).await?;

        info!(
            tickets_created = stats.tickets_created,
            notes_created = stats.notes_created,
            ftp_tickets = stats.ftp_tickets,
            duration_ms = duration_ms,
            result = %result,
            "Email poll finished"
        );
        Ok(stats)
    }

    async fn run_locked(&self, deadline: Instant, stats: &mut PollStats) -> Result<&'static str> {
        let check_id = EmailCheck::start(&self.db).await?;
        let mut result = RESULT_OK;

        if Setting::get_bool(&self.db, "MS_ENABLED", true).await? {
            match GraphSettings::load(&self.db, self.settings_key.as_ref()).await? {
                Some(settings) => {
                    let client = GraphClient::new(settings);
                    if !self.process_mailbox(&client, check_id, deadline, stats).await? {
                        result = RESULT_TIMEOUT;
                    }
                }
                None => {
                    info!("Graph mailbox not configured, skipping mail");
                    EmailCheck::log(&self.db, check_id, "", "No New Messages", EntryAction::None, None, "")
                        .await?;
                }
            }
        }

        if Setting::get_bool(&self.db, "FTP_ENABLED", false).await? {
            if let Err(e) = self.import_ftp(check_id, stats).await {
                warn!(error = %e, "FTP import failed");
                EmailCheck::log(
                    &self.db,
                    check_id,
                    "",
                    "FTP Import Error",
                    EntryAction::Error,
                    None,
                    &e.to_string(),
                )
                .await?;
            }
        }

        let cutoff = timestamp(Utc::now() - ChronoDuration::days(CHECK_RETENTION_DAYS));
        let purged = EmailCheck::purge_before(&self.db, &cutoff).await?;
        if purged > 0 {
            debug!(purged = purged, "Purged old email checks");
        }

        Ok(result)
    }

    async fn import_ftp(&self, check_id: i64, stats: &mut PollStats) -> Result<()> {
        let Some(settings) = FtpSettings::load(&self.db, self.settings_key.as_ref()).await? else {
            return Ok(());
        };
        let drop = FtpDropFolder::connect(&settings).await?;
        let imported = import_drop_folders(&self.db, &self.attachments, &drop, &settings, check_id).await;
        if let Err(e) = drop.close().await {
            debug!(error = %e, "FTP quit failed");
        }
        let imported = imported?;
        stats.ftp_tickets += imported;
        stats.tickets_created += imported;
        Ok(())
    }

    /// Handle every unread message. Returns `false` when the run hit its
    /// deadline before finishing.
    pub async fn process_mailbox(
        &self,
        mailbox: &dyn Mailbox,
        check_id: i64,
        deadline: Instant,
        stats: &mut PollStats,
    ) -> Result<bool> {
        let messages = mailbox.unread_messages().await?;
        stats.messages = messages.len();
        EmailCheck::set_count(&self.db, check_id, messages.len() as i64).await?;

        if messages.is_empty() {
            EmailCheck::log(&self.db, check_id, "", "No New Messages", EntryAction::None, None, "")
                .await?;
            return Ok(true);
        }

        let allowed = allowed_domains(&self.db).await?;
        let phrases = deny_phrases(&self.db).await?;
        info!(messages = messages.len(), "Processing unread mail");

        for (idx, message) in messages.iter().enumerate() {
            if Instant::now() > deadline {
                error!(processed = idx, "Email poll hit its runtime limit, aborting");
                return Ok(false);
            }
            self.handle_message(mailbox, message, check_id, &allowed, &phrases, stats)
                .await?;
        }
        Ok(true)
    }

    async fn handle_message(
        &self,
        mailbox: &dyn Mailbox,
        message: &GraphMessage,
        check_id: i64,
        allowed: &[String],
        phrases: &[String],
        stats: &mut PollStats,
    ) -> Result<()> {
        let subject = message.subject_or_default();
        let (requester, requester_name) = message.requester();
        let sender = requester.clone().unwrap_or_default();

        let body_html = match mailbox.message_body(&message.id).await {
            Ok(Some(body)) => body,
            Ok(None) => message.body_preview.clone().unwrap_or_default(),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Failed to fetch message body");
                message.body_preview.clone().unwrap_or_default()
            }
        };

        if is_denied(&subject, phrases) {
            self.mark_read(mailbox, &message.id).await;
            EmailCheck::log(&self.db, check_id, &sender, &subject, EntryAction::FilteredDeny, None, "Matched deny filter")
                .await?;
            stats.filtered += 1;
            return Ok(());
        }

        if let Some(ticket_id) = ticket_reference(&subject) {
            if let Some(ticket) = Ticket::find(&self.db, ticket_id).await? {
                self.append_reply(mailbox, message, &ticket, &body_html).await?;
                EmailCheck::log(
                    &self.db,
                    check_id,
                    &sender,
                    &subject,
                    EntryAction::AppendTicket,
                    Some(ticket.id),
                    &format!("Reply to Ticket #{}", ticket.id),
                )
                .await?;
                self.mark_read(mailbox, &message.id).await;
                stats.notes_created += 1;
                return Ok(());
            }
        }

        if let Some(from) = message.from_address() {
            let domain = sender_domain(from);
            if !domain_allowed(&domain, allowed) {
                self.mark_read(mailbox, &message.id).await;
                EmailCheck::log(
                    &self.db,
                    check_id,
                    &sender,
                    &subject,
                    EntryAction::FilteredDomain,
                    None,
                    &format!("Domain not allowed: {}", domain),
                )
                .await?;
                stats.filtered += 1;
                return Ok(());
            }
        }

        if Ticket::external_id_exists(&self.db, &message.id).await? {
            EmailCheck::log(&self.db, check_id, &sender, &subject, EntryAction::Duplicate, None, "Duplicate external_id")
                .await?;
            stats.duplicates += 1;
            return Ok(());
        }

        if let Some(address) = &requester {
            Contact::upsert_by_email(&self.db, address, requester_name.as_deref()).await?;
        }

        let mut new = NewTicket::new(subject.clone(), TicketSource::Email);
        new.external_id = Some(message.id.clone());
        new.requester_email = requester.clone();
        new.requester_name = requester_name;
        new.body = Some(sanitize_note(&body_html));
        let ticket = Ticket::create(&self.db, &new).await?;

        EmailCheck::log(&self.db, check_id, &sender, &subject, EntryAction::NewTicket, Some(ticket.id), "Created new ticket")
            .await?;
        self.save_attachments(mailbox, &message.id, ticket.id).await;
        self.mark_read(mailbox, &message.id).await;
        stats.tickets_created += 1;

        info!(ticket_id = ticket.id, subject = %subject, "Created ticket from mail");
        Ok(())
    }

    /// Add a reply as a public note, reopening a closed ticket
    async fn append_reply(
        &self,
        mailbox: &dyn Mailbox,
        message: &GraphMessage,
        ticket: &Ticket,
        body_html: &str,
    ) -> Result<()> {
        let text = html_to_text(body_html);
        let new_text = reply_segment(&text);
        let content = if !new_text.is_empty() {
            new_text
        } else if !text.is_empty() {
            text
        } else {
            message.body_preview.clone().unwrap_or_default()
        };

        if ticket.is_closed() {
            Ticket::transition(&self.db, ticket.id, TicketStatus::InProgress).await?;
        }
        TicketNote::create(&self.db, ticket.id, None, &reply_note_html(&content), false).await?;
        self.save_attachments(mailbox, &message.id, ticket.id).await;

        if let Some(assignee_id) = ticket.assignee_id {
            if let Some(tech) = User::find(&self.db, assignee_id).await? {
                let mail = OutgoingMail::new(
                    tech.email.clone(),
                    format!("Ticket#{} - New reply", ticket.id),
                    format!("<p>{}</p>", text_to_html(&content)),
                )
                .to_name(tech.name.as_deref());
                notify(self.outbox.as_ref(), mail).await;
            }
        }
        Ok(())
    }

    /// Store image and PDF attachments. Failures are logged, never fatal.
    async fn save_attachments(&self, mailbox: &dyn Mailbox, message_id: &str, ticket_id: i64) {
        let attachments = match mailbox.attachments(message_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Failed to list attachments");
                return;
            }
        };

        for attachment in attachments.iter().filter(|a| a.is_file()) {
            let name = attachment.name.clone().unwrap_or_else(|| "attachment".to_string());
            let content_type = attachment.content_type.clone().unwrap_or_default();
            if !wanted_mail_attachment(&name, &content_type) {
                continue;
            }

            let mut content = attachment.content_bytes.clone();
            if content.is_none() {
                if let Some(id) = &attachment.id {
                    match mailbox.download_attachment(id).await {
                        Ok(full) => content = full.and_then(|a| a.content_bytes),
                        Err(e) => warn!(attachment = %name, error = %e, "Failed to download attachment"),
                    }
                }
            }
            let Some(content) = content.filter(|c| !c.is_empty()) else {
                continue;
            };

            let bytes = match BASE64.decode(content.trim()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(attachment = %name, error = %e, "Attachment is not valid base64");
                    continue;
                }
            };
            let ctype = (!content_type.is_empty()).then_some(content_type.as_str());
            if let Err(e) = self.attachments.save(&self.db, ticket_id, &name, ctype, &bytes).await {
                warn!(ticket_id = ticket_id, attachment = %name, error = %e, "Failed to save attachment");
            }
        }
        self.attachments.prune_if_empty(ticket_id).await;
    }

    async fn mark_read(&self, mailbox: &dyn Mailbox, message_id: &str) {
        if let Err(e) = mailbox.mark_read(message_id).await {
            warn!(message_id = %message_id, error = %e, "Failed to mark message read");
        }
    }
}

/// Spawn the mailbox poller on the configured interval
pub fn spawn_email_poll_task(state: Arc<AppState>) {
    let poller = EmailPoller::from_state(&state);
    let db = state.db.clone();
    let default_interval = state.config.scheduler.poll_interval_secs as i64;
    info!("Starting email poller");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(15)).await;
        loop {
            if let Err(e) = poller.run().await {
                error!(error = %e, "Email poll cycle failed");
            }
            let interval_secs = match PollLimits::load(&db, default_interval).await {
                Ok(limits) => limits.interval_secs,
                Err(_) => default_interval,
            };
            tokio::time::sleep(Duration::from_secs(interval_secs as u64)).await;
        }
    });
}

/// Spawn the stale-lock watchdog
pub fn spawn_poll_watchdog_task(db: DbPool, interval_secs: u64) {
    info!(interval_secs = interval_secs, "Starting email poll watchdog");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = run_watchdog(&db, Utc::now()).await {
                warn!(error = %e, "Email poll watchdog failed");
            }
        }
    });
}
