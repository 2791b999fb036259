use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{
    like_pattern, now_timestamp, CategoryRequest, CategoryWithDocuments, CreateDocumentRequest,
    Document, DocumentCategory, DocumentHit, DocumentSearchQuery, UpdateDocumentRequest,
};
use crate::AppState;

use super::error::ApiError;
use super::validation::validate_name;

const SEARCH_LIMIT: i64 = 50;

async fn load_category(state: &AppState, id: i64) -> Result<DocumentCategory, ApiError> {
    sqlx::query_as::<_, DocumentCategory>("SELECT * FROM document_categories WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Category not found"))
}

async fn load_document(state: &AppState, id: i64) -> Result<Document, ApiError> {
    sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Document not found"))
}

/// Category names are unique regardless of case
async fn ensure_unique_category(state: &AppState, name: &str, except: Option<i64>) -> Result<(), ApiError> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM document_categories WHERE lower(name) = lower(?)")
            .bind(name)
            .fetch_optional(&state.db)
            .await?;
    match existing {
        Some((id,)) if Some(id) != except => Err(ApiError::conflict(
            "A category with that name already exists.",
        )),
        _ => Ok(()),
    }
}

/// Every category with its document names
pub async fn list_categories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CategoryWithDocuments>>, ApiError> {
    let categories: Vec<DocumentCategory> =
        sqlx::query_as("SELECT * FROM document_categories ORDER BY lower(name)")
            .fetch_all(&state.db)
            .await?;

    let mut results = Vec::with_capacity(categories.len());
    for category in categories {
        let documents: Vec<DocumentHit> = sqlx::query_as(
            "SELECT id, category_id, name FROM documents WHERE category_id = ? ORDER BY lower(name)",
        )
        .bind(category.id)
        .fetch_all(&state.db)
        .await?;
        results.push(CategoryWithDocuments {
            category,
            documents,
        });
    }
    Ok(Json(results))
}

pub async fn create_category(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CategoryRequest>,
) -> Result<(StatusCode, Json<DocumentCategory>), ApiError> {
    let name = req.name.trim();
    validate_name(name, "Category name").map_err(|e| ApiError::validation_field("name", e))?;
    ensure_unique_category(&state, name, None).await?;

    let result = sqlx::query("INSERT INTO document_categories (name) VALUES (?)")
        .bind(name)
        .execute(&state.db)
        .await?;
    let category = load_category(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

pub async fn rename_category(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CategoryRequest>,
) -> Result<Json<DocumentCategory>, ApiError> {
    load_category(&state, id).await?;
    let name = req.name.trim();
    validate_name(name, "Category name").map_err(|e| ApiError::validation_field("name", e))?;
    ensure_unique_category(&state, name, Some(id)).await?;

    sqlx::query("UPDATE document_categories SET name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_category(&state, id).await?))
}

/// Delete a category; its documents become uncategorised
pub async fn delete_category(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_category(&state, id).await?;
    sqlx::query("DELETE FROM document_categories WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    validate_name(&req.name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    if let Some(category_id) = req.category_id {
        load_category(&state, category_id).await?;
    }

    let now = now_timestamp();
    let result = sqlx::query(
        "INSERT INTO documents (category_id, name, body, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(req.category_id)
    .bind(req.name.trim())
    .bind(req.body.as_deref().unwrap_or(""))
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let document = load_document(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Document>, ApiError> {
    Ok(Json(load_document(&state, id).await?))
}

/// Edit name/body, or move to another category
pub async fn update_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateDocumentRequest>,
) -> Result<Json<Document>, ApiError> {
    let document = load_document(&state, id).await?;
    if let Some(name) = &req.name {
        validate_name(name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    }
    let category_id = match req.category_id {
        Some(Some(category_id)) => {
            load_category(&state, category_id)
                .await
                .map_err(|_| ApiError::bad_request("Invalid category selected"))?;
            Some(category_id)
        }
        Some(None) => None,
        None => document.category_id,
    };

    sqlx::query("UPDATE documents SET category_id = ?, name = ?, body = ?, updated_at = ? WHERE id = ?")
        .bind(category_id)
        .bind(req.name.as_deref().map(str::trim).unwrap_or(&document.name))
        .bind(req.body.as_deref().or(document.body.as_deref()))
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_document(&state, id).await?))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_document(&state, id).await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Documents whose name matches, alphabetically
pub async fn search_documents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentSearchQuery>,
) -> Result<Json<Vec<DocumentHit>>, ApiError> {
    let pattern = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(like_pattern)
        .unwrap_or_else(|| "%".to_string());

    let hits: Vec<DocumentHit> = sqlx::query_as(
        "SELECT id, category_id, name FROM documents WHERE lower(name) LIKE ? ORDER BY lower(name) LIMIT ?",
    )
    .bind(pattern)
    .bind(SEARCH_LIMIT)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(hits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::test_app;

    #[tokio::test]
    async fn test_category_names_unique_ignoring_case() {
        let app = test_app().await;
        create_category(State(app.state.clone()), Json(CategoryRequest { name: "Printers".to_string() }))
            .await
            .unwrap();
        let err = create_category(State(app.state.clone()), Json(CategoryRequest { name: " printers ".to_string() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_move_and_search() {
        let app = test_app().await;
        let (_, Json(network)) =
            create_category(State(app.state.clone()), Json(CategoryRequest { name: "Network".to_string() }))
                .await
                .unwrap();
        let (_, Json(vpn)) =
            create_category(State(app.state.clone()), Json(CategoryRequest { name: "VPN".to_string() }))
                .await
                .unwrap();
        let (_, Json(doc)) = create_document(
            State(app.state.clone()),
            Json(CreateDocumentRequest {
                category_id: Some(network.id),
                name: "Reset the VPN client".to_string(),
                body: Some("<p>Steps</p>".to_string()),
            }),
        )
        .await
        .unwrap();

        let Json(moved) = update_document(
            State(app.state.clone()),
            Path(doc.id),
            Json(UpdateDocumentRequest {
                category_id: Some(Some(vpn.id)),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(moved.category_id, Some(vpn.id));
        assert_eq!(moved.body.as_deref(), Some("<p>Steps</p>"));

        let err = update_document(
            State(app.state.clone()),
            Path(doc.id),
            Json(UpdateDocumentRequest {
                category_id: Some(Some(9999)),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);

        let Json(hits) = search_documents(
            State(app.state.clone()),
            Query(DocumentSearchQuery { q: Some("vpn".to_string()) }),
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);

        let Json(tree) = list_categories(State(app.state.clone())).await.unwrap();
        assert_eq!(tree[0].category.name, "Network");
        assert!(tree[0].documents.is_empty());
        assert_eq!(tree[1].documents[0].id, doc.id);

        delete_category(State(app.state.clone()), Path(vpn.id)).await.unwrap();
        let orphan = load_document(&app.state, doc.id).await.unwrap();
        assert!(orphan.category_id.is_none());
    }
}
