//! Projects API endpoints for grouping related tickets into an ordered list.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{
    like_pattern, now_timestamp, CreateProjectRequest, NewTicket, Priority, Project,
    ProjectDetail, ProjectListQuery, ProjectShowQuery, ProjectSummary, ProjectTicketRequest,
    ReorderRequest, Ticket, TicketSource, UpdateProjectRequest,
};
use crate::AppState;

use super::actor::Actor;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::validate_name;

/// Validate a project description
fn validate_project_description(description: &Option<String>) -> Result<(), String> {
    if let Some(d) = description {
        if d.len() > 2000 {
            return Err("Project description is too long (max 2000 characters)".to_string());
        }
    }
    Ok(())
}

fn validate_create_request(req: &CreateProjectRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_name(&req.name, "Project name") {
        errors.add("name", e);
    }
    if let Err(e) = validate_project_description(&req.description) {
        errors.add("description", e);
    }
    errors.finish()
}

fn validate_update_request(req: &UpdateProjectRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Some(ref name) = req.name {
        if let Err(e) = validate_name(name, "Project name") {
            errors.add("name", e);
        }
    }
    if let Err(e) = validate_project_description(&req.description) {
        errors.add("description", e);
    }
    errors.finish()
}

async fn load_project(state: &AppState, id: i64) -> Result<Project, ApiError> {
    Project::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))
}

/// Open projects, or with `q` every project whose fields or tickets match
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectListQuery>,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let search = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(like_pattern)
        .unwrap_or_default();

    let projects: Vec<Project> = sqlx::query_as(
        r#"
        SELECT DISTINCT p.* FROM projects p
        LEFT JOIN tickets t ON t.project_id = p.id
        WHERE (?1 = '' AND p.status != 'closed')
           OR (?1 != '' AND (lower(p.name) LIKE ?1
                OR lower(coalesce(p.description, '')) LIKE ?1
                OR lower(coalesce(t.subject, '')) LIKE ?1
                OR lower(coalesce(t.body, '')) LIKE ?1))
        ORDER BY p.created_at DESC, p.id DESC
        "#,
    )
    .bind(&search)
    .fetch_all(&state.db)
    .await?;

    let mut results = Vec::with_capacity(projects.len());
    for project in projects {
        let (ticket_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tickets WHERE project_id = ?")
                .bind(project.id)
                .fetch_one(&state.db)
                .await?;
        let open_ticket_count = Project::open_ticket_count(&state.db, project.id).await?;
        results.push(ProjectSummary {
            project,
            ticket_count,
            open_ticket_count,
        });
    }

    Ok(Json(results))
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    validate_create_request(&req)?;

    let result = sqlx::query("INSERT INTO projects (name, description, created_at) VALUES (?, ?, ?)")
        .bind(req.name.trim())
        .bind(req.description.as_deref().map(str::trim))
        .bind(now_timestamp())
        .execute(&state.db)
        .await?;

    let project = load_project(&state, result.last_insert_rowid()).await?;
    tracing::info!(project_id = project.id, name = %project.name, "Project created");
    Ok((StatusCode::CREATED, Json(project)))
}

/// Project with its tickets in position order; `tickets=all` includes closed
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<ProjectShowQuery>,
) -> Result<Json<ProjectDetail>, ApiError> {
    let project = load_project(&state, id).await?;
    let show_all = query
        .tickets
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("all"));

    let tickets: Vec<Ticket> = sqlx::query_as(
        r#"
        SELECT * FROM tickets
        WHERE project_id = ?1 AND (?2 OR status != 'closed')
        ORDER BY project_position IS NULL, project_position, created_at DESC
        "#,
    )
    .bind(id)
    .bind(show_all)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(ProjectDetail { project, tickets }))
}

/// New ticket appended to the end of the project
pub async fn create_project_ticket(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<ProjectTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let project = load_project(&state, id).await?;
    validate_name(&req.subject, "Subject").map_err(|e| ApiError::validation_field("subject", e))?;
    let priority = match req.priority.as_deref() {
        Some(p) => Priority::parse(p).ok_or_else(|| {
            ApiError::validation_field("priority", "Priority must be low, medium or high")
        })?,
        None => Priority::Medium,
    };

    let mut new = NewTicket::new(req.subject.trim(), TicketSource::Manual);
    new.body = req.body.clone();
    new.priority = priority;
    new.assignee_id = req.assignee_id;
    new.project_id = Some(project.id);
    new.project_position = Some(Project::next_position(&state.db, project.id).await?);

    let ticket = Ticket::create(&state.db, &new).await?;
    tracing::info!(
        project_id = project.id,
        ticket_id = ticket.id,
        actor = ?actor.id(),
        "Ticket created in project"
    );
    Ok((StatusCode::CREATED, Json(ticket)))
}

/// Renumber tickets from 1 in the given order; foreign ids are ignored
pub async fn reorder_project_tickets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> Result<StatusCode, ApiError> {
    load_project(&state, id).await?;

    let mut tx = state.db.begin().await?;
    let mut position = 1;
    for ticket_id in &req.ids {
        let result =
            sqlx::query("UPDATE tickets SET project_position = ? WHERE id = ? AND project_id = ?")
                .bind(position)
                .bind(ticket_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() > 0 {
            position += 1;
        }
    }
    tx.commit().await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    validate_update_request(&req)?;
    let existing = load_project(&state, id).await?;

    let name = req.name.as_deref().map(str::trim).unwrap_or(&existing.name);
    let description = req
        .description
        .as_deref()
        .map(str::trim)
        .or(existing.description.as_deref());

    sqlx::query("UPDATE projects SET name = ?, description = ? WHERE id = ?")
        .bind(name)
        .bind(description)
        .bind(id)
        .execute(&state.db)
        .await?;

    Ok(Json(load_project(&state, id).await?))
}

pub async fn close_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Project>, ApiError> {
    load_project(&state, id).await?;
    if Project::open_ticket_count(&state.db, id).await? > 0 {
        return Err(ApiError::conflict(
            "Close all project tickets before closing the project.",
        ));
    }

    sqlx::query("UPDATE projects SET status = 'closed', closed_at = ? WHERE id = ?")
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    tracing::info!(project_id = id, "Project closed");
    Ok(Json(load_project(&state, id).await?))
}

/// Delete a project; its tickets stay and lose the project link
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_project(&state, id).await?;

    let mut tx = state.db.begin().await?;
    sqlx::query("UPDATE tickets SET project_id = NULL, project_position = NULL WHERE project_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(project_id = id, "Project deleted");
    Ok(StatusCode::NO_CONTENT)
}
