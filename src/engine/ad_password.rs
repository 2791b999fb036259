//! Daily Active Directory password expiry check.
//!
//! Every non-archived contact is looked up in AD and its
//! `password_expires_days` refreshed. Contacts inside the warning window, or
//! already expired, are listed on one system ticket.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use super::backups::{SYSTEM_EMAIL, SYSTEM_REQUESTER};
use super::ingest::escape_html;
use super::scheduled_tickets::local_now;
use crate::crypto::SettingsKey;
use crate::db::{
    parse_hhmm, timestamp, Contact, NewTicket, Setting, Ticket, TicketSource,
    PASSWORD_NEVER_EXPIRES, PASSWORD_NOT_FOUND,
};
use crate::directory::{
    days_until, filetime_to_utc, AdSettings, Directory, LdapDirectory,
    DEFAULT_MAX_PASSWORD_AGE_DAYS,
};
use crate::DbPool;

const CELL: &str = "border: 1px solid #ddd; padding: 8px;";
const HEADER_CELL: &str = "border: 1px solid #ddd; padding: 8px; text-align: left;";

/// A contact whose password needs attention
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiringUser {
    pub contact_id: i64,
    pub name: Option<String>,
    pub email: String,
    pub username: Option<String>,
    pub days_until_expiry: i64,
    pub expiry_date: Option<String>,
}

impl ExpiringUser {
    pub fn is_expired(&self) -> bool {
        self.days_until_expiry < 0
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PasswordCheckStats {
    pub checked: usize,
    pub not_found: usize,
    pub never_expires: usize,
    pub expiring: usize,
    pub expired: usize,
    pub ticket_id: Option<i64>,
}

/// Refresh every contact's expiry and return those needing a warning,
/// sorted by days until expiry (expired first).
pub async fn check_contacts(
    db: &DbPool,
    directory: &dyn Directory,
    warning_days: i64,
    now: DateTime<Utc>,
    stats: &mut PasswordCheckStats,
) -> Result<Vec<ExpiringUser>> {
    let max_age = match directory.max_password_age_days().await {
        Ok(Some(days)) if days > 0.0 => days,
        Ok(_) => DEFAULT_MAX_PASSWORD_AGE_DAYS,
        Err(e) => {
            warn!(error = %e, "Failed to read maxPwdAge, using default");
            DEFAULT_MAX_PASSWORD_AGE_DAYS
        }
    };
    let max_age = ChronoDuration::milliseconds((max_age * 86_400_000.0) as i64);

    let contacts: Vec<Contact> =
        sqlx::query_as("SELECT * FROM contacts WHERE archived = 0 AND email != '' ORDER BY id")
            .fetch_all(db)
            .await?;

    let checked_at = timestamp(now);
    let mut expiring = Vec::new();

    for contact in contacts {
        stats.checked += 1;
        let email = contact.email.trim().to_lowercase();
        let account = directory
            .find_account(&email)
            .await
            .with_context(|| format!("AD lookup failed for {}", email))?;

        let mut expiry = None;
        let days = match &account {
            None => {
                stats.not_found += 1;
                Some(PASSWORD_NOT_FOUND)
            }
            Some(acct) if acct.password_never_expires() => {
                stats.never_expires += 1;
                Some(PASSWORD_NEVER_EXPIRES)
            }
            Some(acct) => acct.pwd_last_set.and_then(filetime_to_utc).map(|set| {
                let at = set + max_age;
                expiry = Some(at);
                days_until(at, now)
            }),
        };

        sqlx::query(
            "UPDATE contacts SET password_expires_days = ?, password_checked_at = ? WHERE id = ?",
        )
        .bind(days)
        .bind(&checked_at)
        .bind(contact.id)
        .execute(db)
        .await?;

        let (Some(acct), Some(at), Some(days)) = (account, expiry, days) else {
            continue;
        };
        if days > warning_days {
            continue;
        }
        if days < 0 {
            stats.expired += 1;
        } else {
            stats.expiring += 1;
        }
        expiring.push(ExpiringUser {
            contact_id: contact.id,
            name: contact.name,
            email,
            username: acct.username,
            days_until_expiry: days,
            expiry_date: Some(at.format("%Y-%m-%d").to_string()),
        });
    }

    expiring.sort_by_key(|u| u.days_until_expiry);
    Ok(expiring)
}

pub fn ticket_subject(users: &[ExpiringUser]) -> String {
    let expired = users.iter().filter(|u| u.is_expired()).count();
    let soon = users.len() - expired;
    let mut parts = Vec::new();
    if expired > 0 {
        parts.push(format!("{} expired", expired));
    }
    if soon > 0 {
        parts.push(format!("{} expiring soon", soon));
    }
    format!("Passwords Expiring - {}", parts.join(", "))
}

pub fn ticket_body(users: &[ExpiringUser], warning_days: i64, now: DateTime<Utc>) -> String {
    let mut lines = vec![
        format!(
            "<p>The following users have passwords expiring within <strong>{} days</strong>:</p>",
            warning_days
        ),
        "<table style='border-collapse: collapse; width: 100%;'>".to_string(),
        "<thead>".to_string(),
        "<tr style='background-color: #f2f2f2;'>".to_string(),
    ];
    for heading in ["Name", "Email", "AD Username", "Expires", "Status"] {
        lines.push(format!("<th style='{}'>{}</th>", HEADER_CELL, heading));
    }
    lines.push("</tr>".to_string());
    lines.push("</thead>".to_string());
    lines.push("<tbody>".to_string());

    for user in users {
        let days = user.days_until_expiry;
        let (status, row_style) = if user.is_expired() {
            (
                r#"<span style="color: red; font-weight: bold;">EXPIRED</span>"#.to_string(),
                "background-color: #ffebee;",
            )
        } else if days <= 3 {
            let plural = if days == 1 { "" } else { "s" };
            (
                format!(r#"<span style="color: red;">{} day{}</span>"#, days, plural),
                "background-color: #fff3e0;",
            )
        } else {
            (format!("{} days", days), "")
        };

        let dash = "-".to_string();
        lines.push(format!("<tr style='{}'>", row_style));
        for cell in [
            user.name.as_deref().map(escape_html).unwrap_or_else(|| dash.clone()),
            escape_html(&user.email),
            user.username.as_deref().map(escape_html).unwrap_or_else(|| dash.clone()),
            user.expiry_date.clone().unwrap_or_else(|| dash.clone()),
            status,
        ] {
            lines.push(format!("<td style='{}'>{}</td>", CELL, cell));
        }
        lines.push("</tr>".to_string());
    }

    lines.push("</tbody>".to_string());
    lines.push("</table>".to_string());
    lines.push(format!(
        "<p style='margin-top: 16px; color: #666; font-size: 0.9em;'>This ticket was automatically generated on {}.</p>",
        now.format("%Y-%m-%d at %H:%M UTC")
    ));
    lines.join("\n")
}

/// Open the summary ticket and stamp the listed contacts as notified
pub async fn create_expiry_ticket(
    db: &DbPool,
    users: &[ExpiringUser],
    warning_days: i64,
    now: DateTime<Utc>,
) -> Result<Ticket> {
    let mut new = NewTicket::new(ticket_subject(users), TicketSource::System);
    new.body = Some(ticket_body(users, warning_days, now));
    new.requester_name = Some(SYSTEM_REQUESTER.to_string());
    new.requester_email = Some(SYSTEM_EMAIL.to_string());
    let ticket = Ticket::create(db, &new).await?;

    let sent_at = timestamp(now);
    for user in users {
        sqlx::query("UPDATE contacts SET password_notification_sent_at = ? WHERE id = ?")
            .bind(&sent_at)
            .bind(user.contact_id)
            .execute(db)
            .await?;
    }

    info!(ticket_id = ticket.id, users = users.len(), "Created password expiry ticket");
    Ok(ticket)
}

/// Check contacts against `directory` and open a ticket when needed
pub async fn run_with_directory(
    db: &DbPool,
    directory: &dyn Directory,
    warning_days: i64,
) -> Result<PasswordCheckStats> {
    let now = Utc::now();
    let mut stats = PasswordCheckStats::default();
    let expiring = check_contacts(db, directory, warning_days, now, &mut stats).await?;

    if expiring.is_empty() {
        info!(checked = stats.checked, "No expiring passwords within warning window");
    } else {
        let ticket = create_expiry_ticket(db, &expiring, warning_days, now).await?;
        stats.ticket_id = Some(ticket.id);
    }
    Ok(stats)
}

/// Full check against the configured AD server. `force` ignores the
/// daily-check toggle (used by the on-demand endpoint).
pub async fn run_password_check(
    db: &DbPool,
    key: Option<&SettingsKey>,
    force: bool,
) -> Result<Option<PasswordCheckStats>> {
    if !force && !Setting::get_bool(db, "AD_PWD_CHECK_ENABLED", false).await? {
        return Ok(None);
    }
    if !Setting::get_bool(db, "AD_ENABLED", false).await? {
        warn!("AD password check skipped: AD is not enabled");
        return Ok(None);
    }
    let settings = AdSettings::load(db, key).await?;
    if settings.server.is_empty() {
        warn!("AD password check skipped: AD server not configured");
        return Ok(None);
    }
    if settings.base_dn.is_empty() {
        warn!("AD password check skipped: base DN not configured");
        return Ok(None);
    }

    let directory = LdapDirectory::connect(&settings).await?;
    let result = run_with_directory(db, &directory, settings.warning_days).await;
    if let Err(e) = directory.close().await {
        warn!(error = %e, "Failed to unbind from AD");
    }
    result.map(Some)
}

/// Run once a day at `AD_PWD_CHECK_TIME` (local `HH:MM`, default 07:00)
pub fn spawn_password_check_task(db: DbPool, key: Option<SettingsKey>, tz: Tz) {
    info!(timezone = %tz, "Starting AD password check task");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_run: Option<NaiveDateTime> = None;

        loop {
            tick.tick().await;
            let now = local_now(tz);
            let time = match Setting::get_or(&db, "AD_PWD_CHECK_TIME", "07:00").await {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "Failed to read AD check time");
                    continue;
                }
            };
            let (hh, mm) = parse_hhmm(&time);
            if now.hour() != hh || now.minute() != mm {
                continue;
            }
            if last_run.is_some_and(|last| (now - last).num_seconds() < 60) {
                continue;
            }
            last_run = Some(now);

            match run_password_check(&db, key.as_ref(), false).await {
                Ok(Some(stats)) => info!(
                    checked = stats.checked,
                    expiring = stats.expiring,
                    expired = stats.expired,
                    "AD password check complete"
                ),
                Ok(None) => {}
                Err(e) => error!(error = %e, "AD password check failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::directory::AdAccount;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// FILETIME ticks for a UTC instant
    fn filetime(at: DateTime<Utc>) -> i64 {
        (at.timestamp() + 11_644_473_600) * 10_000_000
    }

    struct FakeDirectory {
        accounts: HashMap<String, AdAccount>,
    }

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn max_password_age_days(&self) -> Result<Option<f64>> {
            Ok(Some(30.0))
        }
        async fn find_account(&self, email: &str) -> Result<Option<AdAccount>> {
            Ok(self.accounts.get(email).cloned())
        }
    }

    async fn contact(db: &DbPool, email: &str, name: &str) -> i64 {
        Contact::upsert_by_email(db, email, Some(name)).await.unwrap().id
    }

    #[tokio::test]
    async fn test_check_updates_contacts_and_opens_ticket() {
        let db = init_memory().await.unwrap();
        let expired = contact(&db, "old@example.com", "Old Password").await;
        let soon = contact(&db, "soon@example.com", "Soon Expiring").await;
        let fine = contact(&db, "fine@example.com", "Fresh").await;
        let never = contact(&db, "svc@example.com", "Service").await;
        let missing = contact(&db, "gone@example.com", "Gone").await;

        let now = Utc::now();
        let account = |days_ago: i64, uac: i64| AdAccount {
            username: Some("user".to_string()),
            user_account_control: uac,
            pwd_last_set: Some(filetime(now - ChronoDuration::days(days_ago) - ChronoDuration::hours(1))),
        };
        let mut accounts = HashMap::new();
        accounts.insert("old@example.com".to_string(), account(40, 0));
        accounts.insert("soon@example.com".to_string(), account(25, 0));
        accounts.insert("fine@example.com".to_string(), account(1, 0));
        accounts.insert("svc@example.com".to_string(), account(400, 0x10200));
        let directory = FakeDirectory { accounts };

        let stats = run_with_directory(&db, &directory, 14).await.unwrap();
        assert_eq!(stats.checked, 5);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.expiring, 1);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.never_expires, 1);

        let days = |id| {
            let db = db.clone();
            async move { Contact::find(&db, id).await.unwrap().unwrap().password_expires_days }
        };
        assert_eq!(days(expired).await, Some(-11));
        assert_eq!(days(soon).await, Some(4));
        assert_eq!(days(fine).await, Some(28));
        assert_eq!(days(never).await, Some(PASSWORD_NEVER_EXPIRES));
        assert_eq!(days(missing).await, Some(PASSWORD_NOT_FOUND));

        let ticket = Ticket::find(&db, stats.ticket_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(ticket.subject, "Passwords Expiring - 1 expired, 1 expiring soon");
        assert_eq!(ticket.source, "system");
        assert_eq!(ticket.requester_name.as_deref(), Some("System"));
        let body = ticket.body.unwrap();
        assert!(body.find("old@example.com").unwrap() < body.find("soon@example.com").unwrap());
        assert!(!body.contains("fine@example.com"));

        let notified = Contact::find(&db, soon).await.unwrap().unwrap();
        assert!(notified.password_notification_sent_at.is_some());
        let untouched = Contact::find(&db, fine).await.unwrap().unwrap();
        assert!(untouched.password_notification_sent_at.is_none());
        assert!(untouched.password_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_no_ticket_when_nobody_expiring() {
        let db = init_memory().await.unwrap();
        contact(&db, "fine@example.com", "Fresh").await;
        let mut accounts = HashMap::new();
        accounts.insert(
            "fine@example.com".to_string(),
            AdAccount {
                username: None,
                user_account_control: 0,
                pwd_last_set: Some(filetime(Utc::now())),
            },
        );
        let stats = run_with_directory(&db, &FakeDirectory { accounts }, 14).await.unwrap();
        assert!(stats.ticket_id.is_none());
    }

    #[tokio::test]
    async fn test_disabled_check_does_nothing() {
        let db = init_memory().await.unwrap();
        assert!(run_password_check(&db, None, false).await.unwrap().is_none());
        // Forced, but AD itself is off
        assert!(run_password_check(&db, None, true).await.unwrap().is_none());
    }

    #[test]
    fn test_subject_and_status_cells() {
        let user = |days| ExpiringUser {
            contact_id: 1,
            name: None,
            email: "a@example.com".to_string(),
            username: None,
            days_until_expiry: days,
            expiry_date: None,
        };
        assert_eq!(ticket_subject(&[user(5)]), "Passwords Expiring - 1 expiring soon");
        assert_eq!(ticket_subject(&[user(-1), user(-3)]), "Passwords Expiring - 2 expired");

        let body = ticket_body(&[user(-2), user(1), user(9)], 14, Utc::now());
        assert!(body.contains("EXPIRED"));
        assert!(body.contains(">1 day</span>"));
        assert!(body.contains(">9 days</td>"));
    }
}
