//! Per-ticket checklists: ad-hoc tasks and processes copied from templates.
//! Every change is refused while the ticket is closed.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{
    now_timestamp, AddTasksRequest, AssignProcessRequest, EditTaskRequest, ProcessTemplate,
    Ticket, TicketProcess, TicketProcessDetail, TicketProcessItem, TicketTask,
    UpdateProcessItemRequest, ITEM_CHECKBOX,
};
use crate::AppState;

use super::actor::Actor;
use super::error::ApiError;
use super::tickets::load_ticket;
use super::validation::validate_name;

async fn open_ticket(state: &AppState, id: i64) -> Result<Ticket, ApiError> {
    let ticket = load_ticket(state, id).await?;
    ticket.ensure_open()?;
    Ok(ticket)
}

async fn load_task(state: &AppState, ticket_id: i64, task_id: i64) -> Result<TicketTask, ApiError> {
    sqlx::query_as::<_, TicketTask>("SELECT * FROM ticket_tasks WHERE id = ? AND ticket_id = ?")
        .bind(task_id)
        .bind(ticket_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Task not found"))
}

/// One task per non-blank line of `text`
pub async fn add_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AddTasksRequest>,
) -> Result<(StatusCode, Json<Vec<TicketTask>>), ApiError> {
    open_ticket(&state, id).await?;
    let list_name = req
        .list_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let tasks =
        TicketTask::add_lines(&state.db, id, &req.text, list_name, req.assigned_tech_id).await?;
    if tasks.is_empty() {
        return Err(ApiError::validation_field("text", "Enter at least one task"));
    }
    Ticket::touch(&state.db, id).await?;
    Ok((StatusCode::CREATED, Json(tasks)))
}

/// Flip a task, recording who checked it
pub async fn toggle_task(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((id, task_id)): Path<(i64, i64)>,
) -> Result<Json<TicketTask>, ApiError> {
    open_ticket(&state, id).await?;
    let task = load_task(&state, id, task_id).await?;

    if task.checked {
        sqlx::query(
            "UPDATE ticket_tasks SET checked = 0, checked_by = NULL, checked_at = NULL WHERE id = ?",
        )
        .bind(task_id)
        .execute(&state.db)
        .await?;
    } else {
        sqlx::query("UPDATE ticket_tasks SET checked = 1, checked_by = ?, checked_at = ? WHERE id = ?")
            .bind(actor.id())
            .bind(now_timestamp())
            .bind(task_id)
            .execute(&state.db)
            .await?;
    }
    Ok(Json(load_task(&state, id, task_id).await?))
}

pub async fn edit_task(
    State(state): State<Arc<AppState>>,
    Path((id, task_id)): Path<(i64, i64)>,
    Json(req): Json<EditTaskRequest>,
) -> Result<Json<TicketTask>, ApiError> {
    open_ticket(&state, id).await?;
    let task = load_task(&state, id, task_id).await?;
    let label = match req.label.as_deref().map(str::trim) {
        Some(label) => {
            validate_name(label, "Label").map_err(|e| ApiError::validation_field("label", e))?;
            label.to_string()
        }
        None => task.label.clone(),
    };
    let assigned = req.assigned_tech_id.unwrap_or(task.assigned_tech_id);

    sqlx::query("UPDATE ticket_tasks SET label = ?, assigned_tech_id = ? WHERE id = ?")
        .bind(&label)
        .bind(assigned)
        .bind(task_id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_task(&state, id, task_id).await?))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    open_ticket(&state, id).await?;
    load_task(&state, id, task_id).await?;
    sqlx::query("DELETE FROM ticket_tasks WHERE id = ?")
        .bind(task_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_all_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    open_ticket(&state, id).await?;
    sqlx::query("DELETE FROM ticket_tasks WHERE ticket_id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Copy a process template onto the ticket
pub async fn assign_process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AssignProcessRequest>,
) -> Result<(StatusCode, Json<TicketProcessDetail>), ApiError> {
    open_ticket(&state, id).await?;
    let template = ProcessTemplate::find(&state.db, req.template_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Process template not found"))?;
    let detail = TicketProcess::assign(&state.db, id, &template).await?;
    Ticket::touch(&state.db, id).await?;
    tracing::info!(ticket_id = id, template = %template.name, "Process assigned");
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn load_process(
    state: &AppState,
    ticket_id: i64,
    process_id: i64,
) -> Result<TicketProcess, ApiError> {
    sqlx::query_as::<_, TicketProcess>(
        "SELECT * FROM ticket_processes WHERE id = ? AND ticket_id = ?",
    )
    .bind(process_id)
    .bind(ticket_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Process not found"))
}

async fn load_process_item(
    state: &AppState,
    process_id: i64,
    item_id: i64,
) -> Result<TicketProcessItem, ApiError> {
    sqlx::query_as::<_, TicketProcessItem>(
        "SELECT * FROM ticket_process_items WHERE id = ? AND ticket_process_id = ?",
    )
    .bind(item_id)
    .bind(process_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Process item not found"))
}

/// Check or uncheck a checkbox line, or set a text line's value
pub async fn update_process_item(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((id, process_id, item_id)): Path<(i64, i64, i64)>,
    Json(req): Json<UpdateProcessItemRequest>,
) -> Result<Json<TicketProcessItem>, ApiError> {
    open_ticket(&state, id).await?;
    load_process(&state, id, process_id).await?;
    let item = load_process_item(&state, process_id, item_id).await?;

    if let Some(label) = req.label.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        sqlx::query("UPDATE ticket_process_items SET label = ? WHERE id = ?")
            .bind(label)
            .bind(item_id)
            .execute(&state.db)
            .await?;
    }

    if item.item_type == ITEM_CHECKBOX {
        if let Some(checked) = req.checked {
            let (by, at) = if checked {
                (actor.id(), Some(now_timestamp()))
            } else {
                (None, None)
            };
            sqlx::query(
                "UPDATE ticket_process_items SET checked = ?, checked_by = ?, checked_at = ? WHERE id = ?",
            )
            .bind(checked)
            .bind(by)
            .bind(at)
            .bind(item_id)
            .execute(&state.db)
            .await?;
        }
    } else if let Some(text) = &req.text_value {
        sqlx::query("UPDATE ticket_process_items SET text_value = ? WHERE id = ?")
            .bind(text)
            .bind(item_id)
            .execute(&state.db)
            .await?;
    }

    Ok(Json(load_process_item(&state, process_id, item_id).await?))
}

pub async fn delete_process(
    State(state): State<Arc<AppState>>,
    Path((id, process_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    open_ticket(&state, id).await?;
    load_process(&state, id, process_id).await?;
    sqlx::query("DELETE FROM ticket_processes WHERE id = ?")
        .bind(process_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_process_item(
    State(state): State<Arc<AppState>>,
    Path((id, process_id, item_id)): Path<(i64, i64, i64)>,
) -> Result<StatusCode, ApiError> {
    open_ticket(&state, id).await?;
    load_process(&state, id, process_id).await?;
    load_process_item(&state, process_id, item_id).await?;
    sqlx::query("DELETE FROM ticket_process_items WHERE id = ?")
        .bind(item_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::{actor, insert_user, test_app, TestApp};
    use crate::db::{NewTicket, TicketSource, TicketStatus};

    async fn ticket(app: &TestApp) -> Ticket {
        Ticket::create(&app.state.db, &NewTicket::new("Onboard", TicketSource::Manual))
            .await
            .unwrap()
    }

    async fn template(app: &TestApp) -> i64 {
        sqlx::query("INSERT INTO process_templates (id, name) VALUES (1, 'New hire')")
            .execute(&app.state.db)
            .await
            .unwrap();
        for (label, kind) in [("Badge", "checkbox"), ("Laptop tag", "text")] {
            sqlx::query(
                "INSERT INTO process_template_items (template_id, item_type, label, position) VALUES (1, ?, ?, 1)",
            )
            .bind(kind)
            .bind(label)
            .execute(&app.state.db)
            .await
            .unwrap();
        }
        1
    }

    #[tokio::test]
    async fn test_task_toggle_records_checker() {
        let app = test_app().await;
        let tech = insert_user(&app, "t@example.com", "Tess", "tech").await;
        let t = ticket(&app).await;

        let (_, Json(tasks)) = add_tasks(
            State(app.state.clone()),
            Path(t.id),
            Json(AddTasksRequest {
                text: "Create account\n\nShip laptop".to_string(),
                list_name: Some("  ".to_string()),
                assigned_tech_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].list_name.is_none());

        let Json(checked) = toggle_task(State(app.state.clone()), actor(&tech), Path((t.id, tasks[0].id)))
            .await
            .unwrap();
        assert!(checked.checked);
        assert_eq!(checked.checked_by, Some(tech.id));
        assert!(checked.checked_at.is_some());

        let Json(unchecked) =
            toggle_task(State(app.state.clone()), actor(&tech), Path((t.id, tasks[0].id)))
                .await
                .unwrap();
        assert!(!unchecked.checked);
        assert!(unchecked.checked_by.is_none());
    }

    #[tokio::test]
    async fn test_closed_ticket_refuses_changes() {
        let app = test_app().await;
        let t = ticket(&app).await;
        TicketTask::add_lines(&app.state.db, t.id, "One", None, None)
            .await
            .unwrap();
        sqlx::query("UPDATE ticket_tasks SET checked = 1")
            .execute(&app.state.db)
            .await
            .unwrap();
        Ticket::transition(&app.state.db, t.id, TicketStatus::Closed)
            .await
            .unwrap();

        let err = delete_all_tasks(State(app.state.clone()), Path(t.id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        let err = add_tasks(
            State(app.state.clone()),
            Path(t.id),
            Json(AddTasksRequest {
                text: "More".to_string(),
                list_name: None,
                assigned_tech_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(TicketTask::for_ticket(&app.state.db, t.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_process_items_by_type() {
        let app = test_app().await;
        let t = ticket(&app).await;
        let template_id = template(&app).await;

        let (_, Json(detail)) = assign_process(
            State(app.state.clone()),
            Path(t.id),
            Json(AssignProcessRequest { template_id }),
        )
        .await
        .unwrap();
        let pid = detail.process.id;
        let checkbox = detail.items.iter().find(|i| i.item_type == "checkbox").unwrap();
        let text = detail.items.iter().find(|i| i.item_type == "text").unwrap();

        let Json(filled) = update_process_item(
            State(app.state.clone()),
            Actor::default(),
            Path((t.id, pid, text.id)),
            Json(UpdateProcessItemRequest {
                checked: Some(true),
                text_value: Some("LT-0042".to_string()),
                label: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(filled.text_value.as_deref(), Some("LT-0042"));
        assert!(!filled.checked);

        assert_eq!(Ticket::open_checklist_count(&app.state.db, t.id).await.unwrap(), 1);
        let Json(ticked) = update_process_item(
            State(app.state.clone()),
            Actor::default(),
            Path((t.id, pid, checkbox.id)),
            Json(UpdateProcessItemRequest {
                checked: Some(true),
                text_value: None,
                label: None,
            }),
        )
        .await
        .unwrap();
        assert!(ticked.checked);
        assert_eq!(Ticket::open_checklist_count(&app.state.db, t.id).await.unwrap(), 0);

        delete_process_item(State(app.state.clone()), Path((t.id, pid, text.id)))
            .await
            .unwrap();
        assert_eq!(TicketProcess::items(&app.state.db, pid).await.unwrap().len(), 1);

        // Process ids are scoped to their ticket
        let other = ticket(&app).await;
        let err = delete_process(State(app.state.clone()), Path((other.id, pid)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        delete_process(State(app.state.clone()), Path((t.id, pid)))
            .await
            .unwrap();
        assert!(TicketProcess::for_ticket(&app.state.db, t.id).await.unwrap().is_empty());
    }
}
