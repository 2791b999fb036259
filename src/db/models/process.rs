//! Process templates and the per-ticket checklists copied from them.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use super::common::now_timestamp;

pub const ITEM_CHECKBOX: &str = "checkbox";
pub const ITEM_TEXT: &str = "text";

pub fn valid_item_type(kind: &str) -> bool {
    kind == ITEM_CHECKBOX || kind == ITEM_TEXT
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessTemplate {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessTemplateItem {
    pub id: i64,
    pub template_id: i64,
    pub item_type: String,
    pub label: String,
    pub assigned_tech_id: Option<i64>,
    pub position: i64,
}

#[derive(Debug, Serialize)]
pub struct ProcessTemplateDetail {
    #[serde(flatten)]
    pub template: ProcessTemplate,
    pub items: Vec<ProcessTemplateItem>,
}

impl ProcessTemplate {
    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<ProcessTemplate>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM process_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn items(db: &SqlitePool, id: i64) -> Result<Vec<ProcessTemplateItem>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM process_template_items WHERE template_id = ? ORDER BY position, id",
        )
        .bind(id)
        .fetch_all(db)
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketProcess {
    pub id: i64,
    pub ticket_id: i64,
    pub template_id: Option<i64>,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketProcessItem {
    pub id: i64,
    pub ticket_process_id: i64,
    pub item_type: String,
    pub label: String,
    pub assigned_tech_id: Option<i64>,
    pub position: i64,
    pub checked: bool,
    pub text_value: Option<String>,
    pub checked_by: Option<i64>,
    pub checked_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TicketProcessDetail {
    #[serde(flatten)]
    pub process: TicketProcess,
    pub items: Vec<TicketProcessItem>,
}

impl TicketProcess {
    /// Copy a template onto a ticket; item positions restart at 1
    pub async fn assign(
        db: &SqlitePool,
        ticket_id: i64,
        template: &ProcessTemplate,
    ) -> Result<TicketProcessDetail, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO ticket_processes (ticket_id, template_id, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(ticket_id)
        .bind(template.id)
        .bind(&template.name)
        .bind(now_timestamp())
        .execute(db)
        .await?;
        let process_id = result.last_insert_rowid();

        let template_items = ProcessTemplate::items(db, template.id).await?;
        for (idx, item) in template_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO ticket_process_items
                    (ticket_process_id, item_type, label, assigned_tech_id, position)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(process_id)
            .bind(&item.item_type)
            .bind(&item.label)
            .bind(item.assigned_tech_id)
            .bind(idx as i64 + 1)
            .execute(db)
            .await?;
        }

        let process = sqlx::query_as("SELECT * FROM ticket_processes WHERE id = ?")
            .bind(process_id)
            .fetch_one(db)
            .await?;
        let items = Self::items(db, process_id).await?;
        Ok(TicketProcessDetail { process, items })
    }

    pub async fn items(db: &SqlitePool, process_id: i64) -> Result<Vec<TicketProcessItem>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM ticket_process_items WHERE ticket_process_id = ? ORDER BY position, id",
        )
        .bind(process_id)
        .fetch_all(db)
        .await
    }

    pub async fn for_ticket(
        db: &SqlitePool,
        ticket_id: i64,
    ) -> Result<Vec<TicketProcessDetail>, sqlx::Error> {
        let processes: Vec<TicketProcess> =
            sqlx::query_as("SELECT * FROM ticket_processes WHERE ticket_id = ? ORDER BY id")
                .bind(ticket_id)
                .fetch_all(db)
                .await?;
        let mut details = Vec::with_capacity(processes.len());
        for process in processes {
            let items = Self::items(db, process.id).await?;
            details.push(TicketProcessDetail { process, items });
        }
        Ok(details)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TemplateItemRequest {
    #[serde(default = "default_item_type")]
    pub item_type: String,
    pub label: String,
    pub assigned_tech_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateItemRequest {
    pub item_type: Option<String>,
    pub label: Option<String>,
    #[serde(default, deserialize_with = "super::double_option")]
    pub assigned_tech_id: Option<Option<i64>>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    /// Ids in their new order
    pub ids: Vec<i64>,
}

fn default_item_type() -> String {
    ITEM_CHECKBOX.to_string()
}

#[derive(Debug, Deserialize)]
pub struct AssignProcessRequest {
    pub template_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProcessItemRequest {
    pub checked: Option<bool>,
    pub text_value: Option<String>,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, NewTicket, Ticket, TicketSource};

    #[tokio::test]
    async fn test_assign_copies_items_in_order() {
        let db = init_memory().await.unwrap();
        sqlx::query("INSERT INTO process_templates (id, name) VALUES (1, 'New hire')")
            .execute(&db)
            .await
            .unwrap();
        for (label, kind, pos) in [("Badge", "checkbox", 20), ("Laptop tag", "text", 10)] {
            sqlx::query(
                "INSERT INTO process_template_items (template_id, item_type, label, position) VALUES (1, ?, ?, ?)",
            )
            .bind(kind)
            .bind(label)
            .bind(pos)
            .execute(&db)
            .await
            .unwrap();
        }
        let ticket = Ticket::create(&db, &NewTicket::new("Hire", TicketSource::Manual))
            .await
            .unwrap();
        let template = ProcessTemplate::find(&db, 1).await.unwrap().unwrap();

        let detail = TicketProcess::assign(&db, ticket.id, &template).await.unwrap();
        assert_eq!(detail.process.name, "New hire");
        let labels: Vec<_> = detail.items.iter().map(|i| (i.label.as_str(), i.position)).collect();
        assert_eq!(labels, vec![("Laptop tag", 1), ("Badge", 2)]);

        // Only the checkbox item blocks closing
        assert_eq!(Ticket::open_checklist_count(&db, ticket.id).await.unwrap(), 1);
    }
}
