//! Process template administration.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{
    valid_item_type, CreateTemplateRequest, ProcessTemplate, ProcessTemplateDetail,
    ProcessTemplateItem, ReorderRequest, TemplateItemRequest, UpdateTemplateItemRequest,
};
use crate::AppState;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::validate_name;

async fn load_template(state: &AppState, id: i64) -> Result<ProcessTemplate, ApiError> {
    ProcessTemplate::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Process template not found"))
}

async fn load_item(state: &AppState, template_id: i64, item_id: i64) -> Result<ProcessTemplateItem, ApiError> {
    sqlx::query_as::<_, ProcessTemplateItem>(
        "SELECT * FROM process_template_items WHERE id = ? AND template_id = ?",
    )
    .bind(item_id)
    .bind(template_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Item not found"))
}

fn validate_item(item_type: &str, label: &str) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if !valid_item_type(item_type) {
        errors.add("item_type", "Type must be checkbox or text");
    }
    if let Err(e) = validate_name(label, "Label") {
        errors.add("label", e);
    }
    errors.finish()
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProcessTemplateDetail>>, ApiError> {
    let templates: Vec<ProcessTemplate> =
        sqlx::query_as("SELECT * FROM process_templates ORDER BY lower(name)")
            .fetch_all(&state.db)
            .await?;
    let mut results = Vec::with_capacity(templates.len());
    for template in templates {
        let items = ProcessTemplate::items(&state.db, template.id).await?;
        results.push(ProcessTemplateDetail { template, items });
    }
    Ok(Json(results))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<ProcessTemplate>), ApiError> {
    let name = req.name.trim();
    validate_name(name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    let result = sqlx::query("INSERT INTO process_templates (name) VALUES (?)")
        .bind(name)
        .execute(&state.db)
        .await?;
    let template = load_template(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ProcessTemplateDetail>, ApiError> {
    let template = load_template(&state, id).await?;
    let items = ProcessTemplate::items(&state.db, id).await?;
    Ok(Json(ProcessTemplateDetail { template, items }))
}

pub async fn rename_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<Json<ProcessTemplate>, ApiError> {
    load_template(&state, id).await?;
    let name = req.name.trim();
    validate_name(name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    sqlx::query("UPDATE process_templates SET name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_template(&state, id).await?))
}

/// Delete a template; processes already on tickets keep their items
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_template(&state, id).await?;
    sqlx::query("DELETE FROM process_templates WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Append an item after the current last one
pub async fn add_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TemplateItemRequest>,
) -> Result<(StatusCode, Json<ProcessTemplateItem>), ApiError> {
    load_template(&state, id).await?;
    let item_type = req.item_type.trim().to_lowercase();
    let label = req.label.trim();
    validate_item(&item_type, label)?;

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM process_template_items WHERE template_id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await?;
    let result = sqlx::query(
        r#"
        INSERT INTO process_template_items (template_id, item_type, label, assigned_tech_id, position)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(&item_type)
    .bind(label)
    .bind(req.assigned_tech_id.filter(|t| *t != 0))
    .bind(count + 1)
    .execute(&state.db)
    .await?;

    let item = load_item(&state, id, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path((id, item_id)): Path<(i64, i64)>,
    Json(req): Json<UpdateTemplateItemRequest>,
) -> Result<Json<ProcessTemplateItem>, ApiError> {
    let item = load_item(&state, id, item_id).await?;
    let item_type = req
        .item_type
        .as_deref()
        .map(|t| t.trim().to_lowercase())
        .unwrap_or(item.item_type.clone());
    let label = req.label.as_deref().map(str::trim).unwrap_or(&item.label);
    validate_item(&item_type, label)?;
    let assigned = match req.assigned_tech_id {
        Some(value) => value.filter(|t| *t != 0),
        None => item.assigned_tech_id,
    };

    sqlx::query(
        "UPDATE process_template_items SET item_type = ?, label = ?, assigned_tech_id = ? WHERE id = ?",
    )
    .bind(&item_type)
    .bind(label)
    .bind(assigned)
    .bind(item_id)
    .execute(&state.db)
    .await?;
    Ok(Json(load_item(&state, id, item_id).await?))
}

pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path((id, item_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    load_item(&state, id, item_id).await?;
    sqlx::query("DELETE FROM process_template_items WHERE id = ?")
        .bind(item_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Renumber items from 1 in the given order; unknown ids are skipped
pub async fn reorder_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> Result<StatusCode, ApiError> {
    load_template(&state, id).await?;
    if req.ids.is_empty() {
        return Err(ApiError::validation_field("ids", "Invalid order"));
    }

    let mut tx = state.db.begin().await?;
    let mut position = 1;
    for item_id in &req.ids {
        let result = sqlx::query(
            "UPDATE process_template_items SET position = ? WHERE id = ? AND template_id = ?",
        )
        .bind(position)
        .bind(item_id)
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
