//! Document wiki: categories and documents.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DocumentCategory {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: i64,
    pub category_id: Option<i64>,
    pub name: String,
    pub body: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Search hit without the body
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DocumentHit {
    pub id: i64,
    pub category_id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CategoryWithDocuments {
    #[serde(flatten)]
    pub category: DocumentCategory,
    pub documents: Vec<DocumentHit>,
}

#[derive(Debug, Deserialize)]
pub struct CategoryRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    pub category_id: Option<i64>,
    pub name: String,
    pub body: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateDocumentRequest {
    #[serde(default, deserialize_with = "super::double_option")]
    pub category_id: Option<Option<i64>>,
    pub name: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DocumentSearchQuery {
    pub q: Option<String>,
}
