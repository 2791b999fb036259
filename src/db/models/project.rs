//! Projects group related tickets into an ordered work list.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use super::Ticket;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// `open` or `closed`
    pub status: String,
    pub created_at: String,
    pub closed_at: Option<String>,
}

impl Project {
    pub fn is_open(&self) -> bool {
        self.status == "open"
    }

    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<Project>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Position for a ticket appended to the end of the project
    pub async fn next_position(db: &SqlitePool, id: i64) -> Result<i64, sqlx::Error> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(project_position) FROM tickets WHERE project_id = ?")
                .bind(id)
                .fetch_one(db)
                .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    pub async fn open_ticket_count(db: &SqlitePool, id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tickets WHERE project_id = ? AND status != 'closed'",
        )
        .bind(id)
        .fetch_one(db)
        .await?;
        Ok(count)
    }
}

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    #[serde(flatten)]
    pub project: Project,
    pub ticket_count: i64,
    pub open_ticket_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub tickets: Vec<Ticket>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectListQuery {
    pub q: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectShowQuery {
    /// `open` (default) or `all`
    pub tickets: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectTicketRequest {
    pub subject: String,
    pub body: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<i64>,
}
