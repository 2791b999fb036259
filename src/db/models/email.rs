//! Mail ingestion filters and the per-run check log.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use super::common::now_timestamp;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AllowedDomain {
    pub id: i64,
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DenyFilter {
    pub id: i64,
    pub phrase: String,
}

/// What the poller did with one message or folder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryAction {
    NewTicket,
    AppendTicket,
    FilteredDeny,
    FilteredDomain,
    Duplicate,
    None,
    Skip,
    Error,
}

impl std::fmt::Display for EntryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NewTicket => "new_ticket",
            Self::AppendTicket => "append_ticket",
            Self::FilteredDeny => "filtered_deny",
            Self::FilteredDomain => "filtered_domain",
            Self::Duplicate => "duplicate",
            Self::None => "none",
            Self::Skip => "skip",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailCheck {
    pub id: i64,
    pub checked_at: String,
    pub new_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailCheckEntry {
    pub id: i64,
    pub check_id: i64,
    pub sender: String,
    pub subject: String,
    pub action: String,
    pub ticket_id: Option<i64>,
    pub note: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct EmailCheckWithEntries {
    #[serde(flatten)]
    pub check: EmailCheck,
    pub entries: Vec<EmailCheckEntry>,
}

impl EmailCheck {
    pub async fn start(db: &SqlitePool) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO email_checks (checked_at, new_count) VALUES (?, 0)")
            .bind(now_timestamp())
            .execute(db)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_count(db: &SqlitePool, id: i64, count: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE email_checks SET new_count = ? WHERE id = ?")
            .bind(count)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn log(
        db: &SqlitePool,
        check_id: i64,
        sender: &str,
        subject: &str,
        action: EntryAction,
        ticket_id: Option<i64>,
        note: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO email_check_entries
                (check_id, sender, subject, action, ticket_id, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(check_id)
        .bind(sender)
        .bind(subject)
        .bind(action.to_string())
        .bind(ticket_id)
        .bind(note)
        .bind(now_timestamp())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn entries(db: &SqlitePool, check_id: i64) -> Result<Vec<EmailCheckEntry>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM email_check_entries WHERE check_id = ? ORDER BY id")
            .bind(check_id)
            .fetch_all(db)
            .await
    }

    /// Remove checks (and their entries) recorded before `cutoff`
    pub async fn purge_before(db: &SqlitePool, cutoff: &str) -> Result<u64, sqlx::Error> {
        sqlx::query(
            "DELETE FROM email_check_entries WHERE check_id IN (SELECT id FROM email_checks WHERE checked_at < ?)",
        )
        .bind(cutoff)
        .execute(db)
        .await?;
        let result = sqlx::query("DELETE FROM email_checks WHERE checked_at < ?")
            .bind(cutoff)
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}

pub async fn allowed_domains(db: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT domain FROM allowed_domains")
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(|(d,)| d.trim().to_lowercase()).collect())
}

pub async fn deny_phrases(db: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT phrase FROM deny_filters")
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(|(p,)| p.trim().to_lowercase()).collect())
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
}

#[derive(Debug, Deserialize)]
pub struct DenyRequest {
    pub phrase: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct EmailLogQuery {
    pub limit: Option<i64>,
}

/// Lock and last-run state of the mailbox poller
#[derive(Debug, Serialize)]
pub struct PollStatus {
    pub running: bool,
    pub started_at: Option<String>,
    pub last_finished_at: Option<String>,
    pub last_duration_ms: Option<i64>,
    pub last_result: Option<String>,
    pub interval_seconds: i64,
}
