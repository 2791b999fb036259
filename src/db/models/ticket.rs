//! Ticket models: tickets, notes, attachments and checklist tasks.

use serde::{Deserialize, Serialize};
use sqlx::{Acquire, FromRow, Sqlite, SqlitePool};

use super::common::now_timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Closed,
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl TicketStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Where a ticket came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketSource {
    Email,
    Manual,
    Ftp,
    Scheduled,
    System,
}

impl std::fmt::Display for TicketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Manual => write!(f, "manual"),
            Self::Ftp => write!(f, "ftp"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Business-rule refusals on tickets
#[derive(Debug, thiserror::Error)]
pub enum TicketRuleError {
    #[error("Cannot close ticket. All process and task checklist items must be completed.")]
    ChecklistIncomplete,
    #[error("Ticket is closed. Reopen it before changing tasks or processes.")]
    Closed,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: i64,
    pub external_id: Option<String>,
    pub subject: String,
    pub requester: Option<String>,
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
    pub body: Option<String>,
    pub status: String,
    pub priority: String,
    pub assignee_id: Option<i64>,
    pub source: String,
    pub project_id: Option<i64>,
    pub project_position: Option<i64>,
    pub asset_id: Option<i64>,
    pub snoozed_until: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

/// Fields for inserting a ticket from any source
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub external_id: Option<String>,
    pub subject: String,
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
    pub body: Option<String>,
    pub status: TicketStatus,
    pub priority: Priority,
    pub assignee_id: Option<i64>,
    pub source: TicketSource,
    pub project_id: Option<i64>,
    pub project_position: Option<i64>,
    pub asset_id: Option<i64>,
}

impl NewTicket {
    pub fn new(subject: impl Into<String>, source: TicketSource) -> Self {
        Self {
            external_id: None,
            subject: subject.into(),
            requester_name: None,
            requester_email: None,
            body: None,
            status: TicketStatus::Open,
            priority: Priority::Medium,
            assignee_id: None,
            source,
            project_id: None,
            project_position: None,
            asset_id: None,
        }
    }
}

impl Ticket {
    pub fn status_enum(&self) -> TicketStatus {
        TicketStatus::parse(&self.status).unwrap_or(TicketStatus::Open)
    }

    pub fn is_closed(&self) -> bool {
        self.status_enum() == TicketStatus::Closed
    }

    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn external_id_exists(db: &SqlitePool, external_id: &str) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM tickets WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(db)
            .await?;
        Ok(row.is_some())
    }

    pub async fn create(db: &SqlitePool, new: &NewTicket) -> Result<Ticket, sqlx::Error> {
        let now = now_timestamp();
        let closed_at = (new.status == TicketStatus::Closed).then(|| now.clone());
        let result = sqlx::query(
            r#"
            INSERT INTO tickets (
                external_id, subject, requester, requester_name, requester_email, body,
                status, priority, assignee_id, source, project_id, project_position,
                asset_id, created_at, updated_at, closed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.external_id)
        .bind(&new.subject)
        .bind(&new.requester_email)
        .bind(&new.requester_name)
        .bind(&new.requester_email)
        .bind(&new.body)
        .bind(new.status.to_string())
        .bind(new.priority.to_string())
        .bind(new.assignee_id)
        .bind(new.source.to_string())
        .bind(new.project_id)
        .bind(new.project_position)
        .bind(new.asset_id)
        .bind(&now)
        .bind(&now)
        .bind(closed_at)
        .execute(db)
        .await?;

        sqlx::query_as("SELECT * FROM tickets WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(db)
            .await
    }

    /// Unchecked checkbox process items plus unchecked tasks
    pub fn open_checklist_count<'a, A>(
        db: A,
        id: i64,
    ) -> impl std::future::Future<Output = Result<i64, sqlx::Error>> + Send + 'a
    where
        A: Acquire<'a, Database = Sqlite> + Send + 'a,
        A::Connection: Send,
    {
        async move {
            let mut conn = db.acquire().await?;
            let (count,): (i64,) = sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM ticket_process_items i
                       JOIN ticket_processes p ON p.id = i.ticket_process_id
                      WHERE p.ticket_id = ? AND i.item_type = 'checkbox' AND i.checked = 0)
                  + (SELECT COUNT(*) FROM ticket_tasks WHERE ticket_id = ? AND checked = 0)
                "#,
            )
            .bind(id)
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
            Ok(count)
        }
    }

    /// Move a ticket to a new status, enforcing checklist completion on close.
    /// Closing stamps `closed_at`; any other status clears it.
    pub fn transition<'a, A>(
        db: A,
        id: i64,
        status: TicketStatus,
    ) -> impl std::future::Future<Output = Result<(), TicketRuleError>> + Send + 'a
    where
        A: Acquire<'a, Database = Sqlite> + Send + 'a,
        A::Connection: Send,
    {
        async move {
            let mut conn = db.acquire().await?;
            if status == TicketStatus::Closed {
                if Self::open_checklist_count(&mut *conn, id).await? > 0 {
                    return Err(TicketRuleError::ChecklistIncomplete);
                }
                let now = now_timestamp();
                sqlx::query(
                    r#"
                    UPDATE tickets
                    SET status = 'closed', closed_at = coalesce(closed_at, ?), updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&now)
                .bind(&now)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE tickets SET status = ?, closed_at = NULL, updated_at = ? WHERE id = ?",
                )
                .bind(status.to_string())
                .bind(now_timestamp())
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }
            Ok(())
        }
    }

    /// Refuse checklist edits on closed tickets
    pub fn ensure_open(&self) -> Result<(), TicketRuleError> {
        if self.is_closed() {
            Err(TicketRuleError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn touch(db: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tickets SET updated_at = ? WHERE id = ?")
            .bind(now_timestamp())
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketNote {
    pub id: i64,
    pub ticket_id: i64,
    pub author_id: Option<i64>,
    pub content: String,
    pub is_private: bool,
    pub created_at: String,
}

impl TicketNote {
    pub async fn create(
        db: &SqlitePool,
        ticket_id: i64,
        author_id: Option<i64>,
        content: &str,
        is_private: bool,
    ) -> Result<TicketNote, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO ticket_notes (ticket_id, author_id, content, is_private, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ticket_id)
        .bind(author_id)
        .bind(content)
        .bind(is_private)
        .bind(now_timestamp())
        .execute(db)
        .await?;
        Ticket::touch(db, ticket_id).await?;

        sqlx::query_as("SELECT * FROM ticket_notes WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(db)
            .await
    }

    pub async fn for_ticket(db: &SqlitePool, ticket_id: i64) -> Result<Vec<TicketNote>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ticket_notes WHERE ticket_id = ? ORDER BY created_at, id")
            .bind(ticket_id)
            .fetch_all(db)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketAttachment {
    pub id: i64,
    pub ticket_id: i64,
    pub filename: String,
    pub content_type: Option<String>,
    /// Path relative to the attachments root, e.g. `attachments/12/scan.pdf`
    pub static_path: String,
    pub size_bytes: i64,
    pub created_at: String,
}

impl TicketAttachment {
    pub async fn create(
        db: &SqlitePool,
        ticket_id: i64,
        filename: &str,
        content_type: Option<&str>,
        static_path: &str,
        size_bytes: i64,
    ) -> Result<TicketAttachment, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO ticket_attachments
                (ticket_id, filename, content_type, static_path, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ticket_id)
        .bind(filename)
        .bind(content_type)
        .bind(static_path)
        .bind(size_bytes)
        .bind(now_timestamp())
        .execute(db)
        .await?;

        sqlx::query_as("SELECT * FROM ticket_attachments WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(db)
            .await
    }

    pub async fn for_ticket(
        db: &SqlitePool,
        ticket_id: i64,
    ) -> Result<Vec<TicketAttachment>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ticket_attachments WHERE ticket_id = ? ORDER BY id")
            .bind(ticket_id)
            .fetch_all(db)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketTask {
    pub id: i64,
    pub ticket_id: i64,
    pub list_name: Option<String>,
    pub label: String,
    pub assigned_tech_id: Option<i64>,
    pub position: i64,
    pub checked: bool,
    pub checked_by: Option<i64>,
    pub checked_at: Option<String>,
}

impl TicketTask {
    /// Add one task per non-blank line, numbered after the existing tasks
    pub async fn add_lines(
        db: &SqlitePool,
        ticket_id: i64,
        text: &str,
        list_name: Option<&str>,
        assigned_tech_id: Option<i64>,
    ) -> Result<Vec<TicketTask>, sqlx::Error> {
        let (existing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM ticket_tasks WHERE ticket_id = ?")
                .bind(ticket_id)
                .fetch_one(db)
                .await?;

        let mut created = Vec::new();
        let labels = text.lines().map(str::trim).filter(|l| !l.is_empty());
        for (offset, label) in labels.enumerate() {
            let result = sqlx::query(
                r#"
                INSERT INTO ticket_tasks (ticket_id, list_name, label, assigned_tech_id, position)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(ticket_id)
            .bind(list_name)
            .bind(label)
            .bind(assigned_tech_id)
            .bind(existing + 1 + offset as i64)
            .execute(db)
            .await?;
            let task = sqlx::query_as("SELECT * FROM ticket_tasks WHERE id = ?")
                .bind(result.last_insert_rowid())
                .fetch_one(db)
                .await?;
            created.push(task);
        }
        Ok(created)
    }

    pub async fn for_ticket(db: &SqlitePool, ticket_id: i64) -> Result<Vec<TicketTask>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ticket_tasks WHERE ticket_id = ? ORDER BY position, id")
            .bind(ticket_id)
            .fetch_all(db)
            .await
    }
}

/// Ticket list filters
#[derive(Debug, Deserialize, Default)]
pub struct TicketListQuery {
    /// `open` (anything not closed, default) or `all`
    pub status: Option<String>,
    #[serde(default)]
    pub show_snoozed: bool,
    /// `any` (default), `me`, `me_or_unassigned`
    pub assigned: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TicketListResponse {
    pub tickets: Vec<Ticket>,
    pub snoozed_count: i64,
}

/// Full ticket view
#[derive(Debug, Serialize)]
pub struct TicketDetail {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub notes: Vec<TicketNote>,
    pub attachments: Vec<TicketAttachment>,
    pub tasks: Vec<TicketTask>,
    pub processes: Vec<super::TicketProcessDetail>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub body: Option<String>,
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<i64>,
    pub source: Option<TicketSource>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateTicketRequest {
    pub subject: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    /// `Some(None)` (explicit null) unassigns
    #[serde(default, deserialize_with = "super::double_option")]
    pub assignee_id: Option<Option<i64>>,
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnoozeRequest {
    /// `YYYY-MM-DD`; the ticket wakes at 23:59:59 local time that day
    pub until: String,
}

#[derive(Debug, Deserialize)]
pub struct AddNoteRequest {
    pub content: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub close_after: bool,
}

#[derive(Debug, Deserialize)]
pub struct EditNoteRequest {
    pub content: String,
    pub is_private: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ForwardNoteRequest {
    pub to: String,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddTasksRequest {
    pub text: String,
    pub list_name: Option<String>,
    pub assigned_tech_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EditTaskRequest {
    pub label: Option<String>,
    #[serde(default, deserialize_with = "super::double_option")]
    pub assigned_tech_id: Option<Option<i64>>,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub project_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct LinkAssetRequest {
    pub asset_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn test_status_parse_and_display() {
        for s in ["open", "in_progress", "closed"] {
            assert_eq!(TicketStatus::parse(s).unwrap().to_string(), s);
        }
        assert!(TicketStatus::parse("pending").is_none());
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(TicketSource::Ftp.to_string(), "ftp");
    }

    #[tokio::test]
    async fn test_create_sets_defaults() {
        let db = init_memory().await.unwrap();
        let mut new = NewTicket::new("Printer jam", TicketSource::Email);
        new.external_id = Some("AAMk-1".to_string());
        new.requester_email = Some("pat@example.com".to_string());
        let ticket = Ticket::create(&db, &new).await.unwrap();

        assert_eq!(ticket.status, "open");
        assert_eq!(ticket.priority, "medium");
        assert_eq!(ticket.source, "email");
        assert_eq!(ticket.requester.as_deref(), Some("pat@example.com"));
        assert!(ticket.closed_at.is_none());
        assert!(Ticket::external_id_exists(&db, "AAMk-1").await.unwrap());
        assert!(!Ticket::external_id_exists(&db, "AAMk-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_requires_completed_tasks() {
        let db = init_memory().await.unwrap();
        let ticket = Ticket::create(&db, &NewTicket::new("Onboard", TicketSource::Manual))
            .await
            .unwrap();
        let tasks = TicketTask::add_lines(&db, ticket.id, "Create account\n\n  Ship laptop ", None, None)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].position, 1);
        assert_eq!(tasks[1].position, 2);

        let err = Ticket::transition(&db, ticket.id, TicketStatus::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, TicketRuleError::ChecklistIncomplete));

        sqlx::query("UPDATE ticket_tasks SET checked = 1 WHERE ticket_id = ?")
            .bind(ticket.id)
            .execute(&db)
            .await
            .unwrap();
        Ticket::transition(&db, ticket.id, TicketStatus::Closed)
            .await
            .unwrap();
        let closed = Ticket::find(&db, ticket.id).await.unwrap().unwrap();
        assert!(closed.is_closed());
        assert!(closed.closed_at.is_some());
        assert!(closed.ensure_open().is_err());

        Ticket::transition(&db, ticket.id, TicketStatus::InProgress)
            .await
            .unwrap();
        let reopened = Ticket::find(&db, ticket.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, "in_progress");
        assert!(reopened.closed_at.is_none());
    }

    #[tokio::test]
    async fn test_task_positions_continue() {
        let db = init_memory().await.unwrap();
        let ticket = Ticket::create(&db, &NewTicket::new("T", TicketSource::Manual))
            .await
            .unwrap();
        TicketTask::add_lines(&db, ticket.id, "a\nb", None, None)
            .await
            .unwrap();
        let more = TicketTask::add_lines(&db, ticket.id, "c", Some("Later"), None)
            .await
            .unwrap();
        assert_eq!(more[0].position, 3);
        assert_eq!(more[0].list_name.as_deref(), Some("Later"));
    }
}
