//! Ticket endpoints: the queue, ticket lifecycle, notes, attachments,
//! project merge and asset links.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{
    like_pattern, now_timestamp, timestamp, AddNoteRequest, Asset, Contact, CreateTicketRequest,
    EditNoteRequest, ForwardNoteRequest, LinkAssetRequest, MergeRequest, NewTicket, Priority,
    Project, SnoozeRequest, Ticket, TicketAttachment, TicketDetail, TicketListQuery,
    TicketListResponse, TicketNote, TicketProcess, TicketSource, TicketStatus, TicketTask,
    UpdateTicketRequest, User,
};
use crate::engine::ingest::{escape_html, sanitize_note};
use crate::notifications::{notify, OutgoingMail};
use crate::AppState;

use super::actor::Actor;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{parse_date, validate_email, validate_name};

/// Queue listings stop here
const LIST_LIMIT: i64 = 200;
/// Largest accepted upload request
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub(crate) async fn load_ticket(state: &AppState, id: i64) -> Result<Ticket, ApiError> {
    Ticket::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Ticket not found"))
}

fn parse_priority(value: &str) -> Result<Priority, ApiError> {
    Priority::parse(value)
        .ok_or_else(|| ApiError::validation_field("priority", "Priority must be low, medium or high"))
}

fn parse_status(value: &str) -> Result<TicketStatus, ApiError> {
    TicketStatus::parse(value).ok_or_else(|| {
        ApiError::validation_field("status", "Status must be open, in_progress or closed")
    })
}

/// Email the new assignee unless they made the change themselves
async fn notify_new_assignee(state: &AppState, ticket: &Ticket, actor: &Actor) {
    let Some(assignee_id) = ticket.assignee_id else {
        return;
    };
    if actor.id() == Some(assignee_id) {
        return;
    }
    let assignee = match User::find(&state.db, assignee_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load assignee for notification");
            return;
        }
    };
    let requester = ticket
        .requester_name
        .as_deref()
        .or(ticket.requester_email.as_deref())
        .or(ticket.requester.as_deref())
        .unwrap_or("Unknown");
    let html = format!(
        "<p>Hi {},</p>\n<p>A ticket has been assigned to you.</p>\n<p><strong>Ticket #{}</strong>: {}</p>\n<p><strong>From:</strong> {}</p>",
        escape_html(assignee.display_name()),
        ticket.id,
        escape_html(&ticket.subject),
        escape_html(requester),
    );
    let mail = OutgoingMail::new(
        assignee.email.clone(),
        format!("New Ticket Assigned: #{}", ticket.id),
        html,
    )
    .to_name(assignee.name.as_deref());
    notify(state.outbox.as_ref(), mail).await;
}

/// List the queue
pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(query): Query<TicketListQuery>,
) -> Result<Json<TicketListResponse>, ApiError> {
    let status = query.status.as_deref().unwrap_or("open");
    let assigned = query
        .assigned
        .clone()
        .or_else(|| actor.user().map(|u| u.tickets_view_pref.clone()))
        .unwrap_or_else(|| "any".to_string());
    let search = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(like_pattern)
        .unwrap_or_default();
    let me = actor.id().unwrap_or(-1);
    let now = now_timestamp();

    let tickets: Vec<Ticket> = sqlx::query_as(
        r#"
        SELECT * FROM tickets
        WHERE (?1 = 'all' OR status != 'closed')
          AND (?2 OR snoozed_until IS NULL OR snoozed_until <= ?3)
          AND (?4 = 'any'
               OR (?4 = 'me' AND assignee_id = ?5)
               OR (?4 = 'me_or_unassigned' AND (assignee_id = ?5 OR assignee_id IS NULL)))
          AND (?6 != '' OR project_id IS NULL OR assignee_id = ?5)
          AND (?6 = ''
               OR lower(subject) LIKE ?6
               OR lower(coalesce(body, '')) LIKE ?6
               OR lower(coalesce(requester_name, '')) LIKE ?6
               OR lower(coalesce(requester_email, '')) LIKE ?6
               OR lower(coalesce(requester, '')) LIKE ?6)
        ORDER BY created_at DESC, id DESC
        LIMIT ?7
        "#,
    )
    .bind(status)
    .bind(query.show_snoozed)
    .bind(&now)
    .bind(&assigned)
    .bind(me)
    .bind(&search)
    .bind(LIST_LIMIT)
    .fetch_all(&state.db)
    .await?;

    let (snoozed_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND snoozed_until IS NOT NULL AND snoozed_until > ?",
    )
    .bind(&now)
    .fetch_one(&state.db)
    .await?;

    Ok(Json(TicketListResponse {
        tickets,
        snoozed_count,
    }))
}

/// Open a ticket by hand
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_name(&req.subject, "Subject") {
        errors.add("subject", e);
    }
    let requester_email = req
        .requester_email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty());
    if let Some(email) = &requester_email {
        if let Err(e) = validate_email(email) {
            errors.add("requester_email", e);
        }
    }
    errors.finish()?;

    let mut new = NewTicket::new(req.subject.trim(), req.source.unwrap_or(TicketSource::Manual));
    new.body = req.body.clone();
    new.priority = match req.priority.as_deref() {
        Some(p) => parse_priority(p)?,
        None => Priority::Medium,
    };
    new.assignee_id = req.assignee_id;

    if let Some(email) = &requester_email {
        let contact =
            Contact::upsert_by_email(&state.db, email, req.requester_name.as_deref()).await?;
        new.requester_email = Some(contact.email.clone());
        new.requester_name = contact.name.clone();
    }

    let ticket = Ticket::create(&state.db, &new).await?;
    tracing::info!(ticket_id = ticket.id, source = %ticket.source, "Ticket created");
    notify_new_assignee(&state, &ticket, &actor).await;
    Ok((StatusCode::CREATED, Json(ticket)))
}

/// Ticket with notes, attachments, tasks and processes
pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TicketDetail>, ApiError> {
    let ticket = load_ticket(&state, id).await?;
    let notes = TicketNote::for_ticket(&state.db, id).await?;
    let attachments = TicketAttachment::for_ticket(&state.db, id).await?;
    let tasks = TicketTask::for_ticket(&state.db, id).await?;
    let processes = TicketProcess::for_ticket(&state.db, id).await?;
    Ok(Json(TicketDetail {
        ticket,
        notes,
        attachments,
        tasks,
        processes,
    }))
}

/// Change status, priority, assignee, subject or requester.
/// A refused close leaves every field untouched.
pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let before = load_ticket(&state, id).await?;

    let mut errors = ValidationErrorBuilder::new();
    if let Some(subject) = &req.subject {
        if let Err(e) = validate_name(subject, "Subject") {
            errors.add("subject", e);
        }
    }
    if let Some(email) = &req.requester_email {
        if let Err(e) = validate_email(email) {
            errors.add("requester_email", e);
        }
    }
    errors.finish()?;

    let status = req.status.as_deref().map(parse_status).transpose()?;
    let priority = req.priority.as_deref().map(parse_priority).transpose()?;

    let mut tx = state.db.begin().await?;
    if let Some(status) = status {
        if status != before.status_enum() {
            Ticket::transition(&mut *tx, id, status).await?;
        }
    }

    let assignee_id = match req.assignee_id {
        Some(value) => value,
        None => before.assignee_id,
    };
    let (requester, requester_email, requester_name) = match &req.requester_email {
        Some(email) => {
            let contact =
                Contact::upsert_by_email(&mut *tx, email, req.requester_name.as_deref()).await?;
            (
                Some(contact.email.clone()),
                Some(contact.email.clone()),
                contact.name.clone(),
            )
        }
        None => (
            before.requester.clone(),
            before.requester_email.clone(),
            req.requester_name.clone().or(before.requester_name.clone()),
        ),
    };

    sqlx::query(
        r#"
        UPDATE tickets
        SET subject = ?, priority = ?, assignee_id = ?, requester = ?, requester_email = ?,
            requester_name = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(req.subject.as_deref().map(str::trim).unwrap_or(&before.subject))
    .bind(priority.map(|p| p.to_string()).unwrap_or(before.priority.clone()))
    .bind(assignee_id)
    .bind(requester)
    .bind(requester_email)
    .bind(requester_name)
    .bind(now_timestamp())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let ticket = load_ticket(&state, id).await?;
    if ticket.assignee_id.is_some() && ticket.assignee_id != before.assignee_id {
        notify_new_assignee(&state, &ticket, &actor).await;
    }
    Ok(Json(ticket))
}

/// Hard delete, allowed only for untouched tickets
pub async fn delete_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let ticket = load_ticket(&state, id).await?;
    let (notes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ticket_notes WHERE ticket_id = ?")
        .bind(id)
        .fetch_one(&state.db)
        .await?;
    let (items,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM order_items WHERE ticket_id = ?")
        .bind(id)
        .fetch_one(&state.db)
        .await?;
    if notes > 0 || items > 0 || ticket.assignee_id.is_some() {
        return Err(ApiError::conflict(
            "Ticket cannot be deleted (must have no notes, no order items, and no assignee). Close it instead.",
        ));
    }

    if let Err(e) = state.attachments.remove_ticket(id).await {
        tracing::warn!(ticket_id = id, error = %e, "Failed to remove attachment directory");
    }
    sqlx::query("DELETE FROM tickets WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    tracing::info!(ticket_id = id, "Ticket deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Hide the ticket until the end of the chosen local day
pub async fn snooze_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<SnoozeRequest>,
) -> Result<Json<Ticket>, ApiError> {
    load_ticket(&state, id).await?;
    let date = parse_date(&req.until).map_err(|e| ApiError::validation_field("until", e))?;
    let end_of_day = date.and_time(
        NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
    );
    let tz = state.config.scheduler.tz();
    let until = tz
        .from_local_datetime(&end_of_day)
        .latest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&end_of_day));

    sqlx::query("UPDATE tickets SET snoozed_until = ?, updated_at = ? WHERE id = ?")
        .bind(timestamp(until))
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_ticket(&state, id).await?))
}

pub async fn unsnooze_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Ticket>, ApiError> {
    load_ticket(&state, id).await?;
    sqlx::query("UPDATE tickets SET snoozed_until = NULL, updated_at = ? WHERE id = ?")
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_ticket(&state, id).await?))
}

#[derive(Debug, Serialize)]
pub struct AddNoteResponse {
    pub note: TicketNote,
    pub closed: bool,
    /// Set when `close_after` was asked for but the checklist is open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Add a note. Public notes are mailed to the requester.
pub async fn add_note(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<AddNoteRequest>,
) -> Result<(StatusCode, Json<AddNoteResponse>), ApiError> {
    let ticket = load_ticket(&state, id).await?;
    let content = sanitize_note(req.content.trim());
    if content.trim().is_empty() {
        return Err(ApiError::validation_field("content", "Note content is required"));
    }

    let note = TicketNote::create(&state.db, id, actor.id(), &content, req.is_private).await?;

    if !req.is_private {
        let to = ticket
            .requester_email
            .as_deref()
            .or(ticket.requester.as_deref())
            .filter(|e| !e.trim().is_empty());
        if let Some(to) = to {
            let mail = OutgoingMail::new(
                to,
                format!("Ticket#{} - {}", ticket.id, ticket.subject),
                note.content.clone(),
            );
            notify(state.outbox.as_ref(), mail).await;
        }
    }

    let mut closed = false;
    let mut warning = None;
    if req.close_after && !ticket.is_closed() {
        match Ticket::transition(&state.db, id, TicketStatus::Closed).await {
            Ok(()) => closed = true,
            Err(crate::db::TicketRuleError::ChecklistIncomplete) => {
                warning = Some(
                    "Note added, but ticket not closed (open checklist items/tasks remain)."
                        .to_string(),
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(AddNoteResponse {
            note,
            closed,
            warning,
        }),
    ))
}

async fn load_note(state: &AppState, ticket_id: i64, note_id: i64) -> Result<TicketNote, ApiError> {
    sqlx::query_as::<_, TicketNote>("SELECT * FROM ticket_notes WHERE id = ? AND ticket_id = ?")
        .bind(note_id)
        .bind(ticket_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Note not found"))
}

/// Authors edit their own notes; admins edit any, including received mail
fn ensure_can_edit(note: &TicketNote, actor: &Actor) -> Result<(), ApiError> {
    let is_author = note.author_id.is_some() && note.author_id == actor.id();
    if is_author || actor.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "You do not have permission to edit this note.",
        ))
    }
}

pub async fn edit_note(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((id, note_id)): Path<(i64, i64)>,
    Json(req): Json<EditNoteRequest>,
) -> Result<Json<TicketNote>, ApiError> {
    let note = load_note(&state, id, note_id).await?;
    ensure_can_edit(&note, &actor)?;
    let content = sanitize_note(req.content.trim());
    if content.trim().is_empty() {
        return Err(ApiError::validation_field("content", "Note content is required"));
    }

    sqlx::query("UPDATE ticket_notes SET content = ?, is_private = ? WHERE id = ?")
        .bind(&content)
        .bind(req.is_private.unwrap_or(note.is_private))
        .bind(note_id)
        .execute(&state.db)
        .await?;
    Ticket::touch(&state.db, id).await?;
    Ok(Json(load_note(&state, id, note_id).await?))
}

pub async fn delete_note(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((id, note_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    let note = load_note(&state, id, note_id).await?;
    ensure_can_edit(&note, &actor)?;
    sqlx::query("DELETE FROM ticket_notes WHERE id = ?")
        .bind(note_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Mail a note to someone outside the ticket and log it as a public note
pub async fn forward_note(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path((id, note_id)): Path<(i64, i64)>,
    Json(req): Json<ForwardNoteRequest>,
) -> Result<(StatusCode, Json<TicketNote>), ApiError> {
    let ticket = load_ticket(&state, id).await?;
    let note = load_note(&state, id, note_id).await?;
    let to = req.to.trim().to_string();
    validate_email(&to).map_err(|e| ApiError::validation_field("to", e))?;

    let mut forwarded = String::new();
    if let Some(message) = req.message.as_deref().filter(|m| !m.trim().is_empty()) {
        forwarded.push_str(&sanitize_note(message));
    }
    forwarded.push_str(&note.content);
    if forwarded.trim().is_empty() {
        forwarded = "<p>(no note body)</p>".to_string();
    }

    let requester = ticket
        .requester_name
        .as_deref()
        .or(ticket.requester_email.as_deref())
        .or(ticket.requester.as_deref())
        .unwrap_or("Unknown");
    let description = ticket
        .body
        .as_deref()
        .map(sanitize_note)
        .filter(|d| !d.trim().is_empty())
        .map(|d| format!("<div><div><strong>Description</strong></div><div>{}</div></div>", d))
        .unwrap_or_else(|| "<div>(no description)</div>".to_string());
    let html = format!(
        "<div><div><strong>Ticket #{}</strong>: {}</div><div><strong>From:</strong> {}</div></div><hr>{}<hr>{}",
        ticket.id,
        escape_html(&ticket.subject),
        escape_html(requester),
        forwarded,
        description,
    );

    let mail = OutgoingMail::new(
        to.clone(),
        format!("FW: Ticket #{} - {}", ticket.id, ticket.subject),
        html,
    );
    state.outbox.send(mail).await.map_err(|e| {
        tracing::warn!(ticket_id = id, error = %e, "Failed to forward note");
        ApiError::external("Failed to forward note.")
    })?;

    let log_html = format!("<div>Forwarded to: {}</div>{}", escape_html(&to), forwarded);
    let logged = TicketNote::create(&state.db, id, actor.id(), &log_html, false).await?;
    Ok((StatusCode::CREATED, Json(logged)))
}

pub async fn list_attachments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<TicketAttachment>>, ApiError> {
    load_ticket(&state, id).await?;
    Ok(Json(TicketAttachment::for_ticket(&state.db, id).await?))
}

/// Store every file part of a multipart upload
pub async fn upload_attachments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<TicketAttachment>>), ApiError> {
    load_ticket(&state, id).await?;

    let mut saved = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?;
        let stored = state
            .attachments
            .save(&state.db, id, &file_name, content_type.as_deref(), &bytes)
            .await?;
        saved.push(stored.record);
    }

    if saved.is_empty() {
        return Err(ApiError::validation_field("file", "No file was uploaded"));
    }
    Ticket::touch(&state.db, id).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// Serve an attachment inline
pub async fn download_attachment(
    State(state): State<Arc<AppState>>,
    Path((id, attachment_id)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    let attachment = sqlx::query_as::<_, TicketAttachment>(
        "SELECT * FROM ticket_attachments WHERE id = ? AND ticket_id = ?",
    )
    .bind(attachment_id)
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Attachment not found"))?;

    let path = state.attachments.resolve(&attachment.static_path);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found("Attachment file is missing"))?;
    let content_type = attachment
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let disposition = format!(
        "inline; filename=\"{}\"",
        attachment.filename.replace('"', "")
    );

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

pub fn upload_limit() -> DefaultBodyLimit {
    DefaultBodyLimit::max(MAX_UPLOAD_BYTES)
}

/// Move a ticket to the end of an open project
pub async fn merge_into_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<MergeRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let ticket = load_ticket(&state, id).await?;
    if ticket.project_id.is_some() {
        return Err(ApiError::conflict("Ticket is already part of a project."));
    }
    let project = Project::find(&state.db, req.project_id)
        .await?
        .filter(Project::is_open)
        .ok_or_else(|| ApiError::bad_request("Invalid project selection."))?;

    let position = Project::next_position(&state.db, project.id).await?;
    sqlx::query("UPDATE tickets SET project_id = ?, project_position = ?, updated_at = ? WHERE id = ?")
        .bind(project.id)
        .bind(position)
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_ticket(&state, id).await?))
}

/// Link an asset held by the requester (or by nobody)
pub async fn link_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<LinkAssetRequest>,
) -> Result<Json<Ticket>, ApiError> {
    let ticket = load_ticket(&state, id).await?;
    if ticket.asset_id.is_some() {
        return Err(ApiError::conflict("Asset already linked."));
    }
    let asset = Asset::find(&state.db, req.asset_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Asset not found."))?;

    if let (Some(holder), Some(email)) = (asset.assigned_contact_id, ticket.requester_email.as_deref()) {
        if let Some(contact) = Contact::find_by_email(&state.db, email).await? {
            if contact.id != holder {
                return Err(ApiError::conflict("Asset is not assigned to this requester."));
            }
        }
    }

    sqlx::query("UPDATE tickets SET asset_id = ?, updated_at = ? WHERE id = ?")
        .bind(asset.id)
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_ticket(&state, id).await?))
}

pub async fn unlink_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Ticket>, ApiError> {
    load_ticket(&state, id).await?;
    sqlx::query("UPDATE tickets SET asset_id = NULL, updated_at = ? WHERE id = ?")
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_ticket(&state, id).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct RequesterAssetsQuery {
    pub email: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AssetOption {
    pub id: i64,
    /// `name#tag`, or just the name when untagged
    pub label: String,
}

/// Assets currently checked out to the contact with this email
pub async fn assets_for_requester(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RequesterAssetsQuery>,
) -> Result<Json<Vec<AssetOption>>, ApiError> {
    let email = query.email.as_deref().map(str::trim).unwrap_or("");
    if email.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let Some(contact) = Contact::find_by_email(&state.db, email).await? else {
        return Ok(Json(Vec::new()));
    };
    let assets: Vec<Asset> =
        sqlx::query_as("SELECT * FROM assets WHERE assigned_contact_id = ? ORDER BY name")
            .bind(contact.id)
            .fetch_all(&state.db)
            .await?;
    Ok(Json(
        assets
            .into_iter()
            .map(|a| AssetOption {
                id: a.id,
                label: match a.asset_tag.as_deref().filter(|t| !t.is_empty()) {
                    Some(tag) => format!("{}#{}", a.name, tag),
                    None => a.name,
                },
            })
            .collect(),
    ))
}
