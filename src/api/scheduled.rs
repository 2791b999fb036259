use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{Priority, ScheduledTicket, ScheduledTicketRequest, Ticket, TicketStatus, SCHEDULE_TYPES};
use crate::engine::scheduled_tickets::{fire_scheduled_ticket, local_now};
use crate::AppState;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_hhmm, validate_name};

fn validate_request(req: &ScheduledTicketRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_name(&req.name, "Name") {
        errors.add("name", e);
    }
    if let Err(e) = validate_name(&req.subject, "Subject") {
        errors.add("subject", e);
    }
    if !SCHEDULE_TYPES.contains(&req.schedule_type.as_str()) {
        errors.add("schedule_type", "Schedule must be daily, weekly or monthly");
    }
    if let Err(e) = validate_hhmm(&req.schedule_time) {
        errors.add("schedule_time", e);
    }
    if let Some(day) = req.day_of_week {
        if !(0..=6).contains(&day) {
            errors.add("day_of_week", "Day of week must be 0 (Monday) to 6 (Sunday)");
        }
    }
    if let Some(day) = req.day_of_month {
        if !(1..=31).contains(&day) {
            errors.add("day_of_month", "Day of month must be 1 to 31");
        }
    }
    if let Some(status) = &req.status {
        if TicketStatus::parse(status).is_none() {
            errors.add("status", "Status must be open, in_progress or closed");
        }
    }
    if let Some(priority) = &req.priority {
        if Priority::parse(priority).is_none() {
            errors.add("priority", "Priority must be low, medium or high");
        }
    }
    errors.finish()
}

async fn load_row(state: &AppState, id: i64) -> Result<ScheduledTicket, ApiError> {
    sqlx::query_as::<_, ScheduledTicket>("SELECT * FROM scheduled_tickets WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Scheduled ticket not found"))
}

pub async fn list_scheduled(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ScheduledTicket>>, ApiError> {
    let rows = sqlx::query_as("SELECT * FROM scheduled_tickets ORDER BY created_at DESC, id DESC")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(rows))
}

pub async fn create_scheduled(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduledTicketRequest>,
) -> Result<(StatusCode, Json<ScheduledTicket>), ApiError> {
    validate_request(&req)?;
    let result = sqlx::query(
        r#"
        INSERT INTO scheduled_tickets (
            name, subject, body, status, priority, assignee_id, tasks_text,
            schedule_type, day_of_week, day_of_month, schedule_time, active
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(req.name.trim())
    .bind(req.subject.trim())
    .bind(&req.body)
    .bind(req.status.as_deref().unwrap_or("open"))
    .bind(req.priority.as_deref().unwrap_or("medium"))
    .bind(req.assignee_id)
    .bind(&req.tasks_text)
    .bind(&req.schedule_type)
    .bind(req.day_of_week)
    .bind(req.day_of_month)
    .bind(req.schedule_time.trim())
    .bind(req.active)
    .execute(&state.db)
    .await?;

    let row = load_row(&state, result.last_insert_rowid()).await?;
    tracing::info!(schedule_id = row.id, name = %row.name, "Scheduled ticket created");
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get_scheduled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduledTicket>, ApiError> {
    Ok(Json(load_row(&state, id).await?))
}

/// Replace every field of a definition
pub async fn update_scheduled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ScheduledTicketRequest>,
) -> Result<Json<ScheduledTicket>, ApiError> {
    load_row(&state, id).await?;
    validate_request(&req)?;
    sqlx::query(
        r#"
        UPDATE scheduled_tickets
        SET name = ?, subject = ?, body = ?, status = ?, priority = ?, assignee_id = ?,
            tasks_text = ?, schedule_type = ?, day_of_week = ?, day_of_month = ?,
            schedule_time = ?, active = ?
        WHERE id = ?
        "#,
    )
    .bind(req.name.trim())
    .bind(req.subject.trim())
    .bind(&req.body)
    .bind(req.status.as_deref().unwrap_or("open"))
    .bind(req.priority.as_deref().unwrap_or("medium"))
    .bind(req.assignee_id)
    .bind(&req.tasks_text)
    .bind(&req.schedule_type)
    .bind(req.day_of_week)
    .bind(req.day_of_month)
    .bind(req.schedule_time.trim())
    .bind(req.active)
    .bind(id)
    .execute(&state.db)
    .await?;
    Ok(Json(load_row(&state, id).await?))
}

pub async fn delete_scheduled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_row(&state, id).await?;
    sqlx::query("DELETE FROM scheduled_tickets WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the ticket now, whatever the schedule says
pub async fn run_scheduled_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let row = load_row(&state, id).await?;
    let now = local_now(state.config.scheduler.tz());
    let ticket = fire_scheduled_ticket(&state.db, &row, now).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}
