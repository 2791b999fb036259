//! Asset inventory: CRUD with field audits, check-out/in, CSV exchange
//! and the dropdown picklists.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{
    like_pattern, now_timestamp, page_offset, parse_cost, Asset, AssetDetail, AssetListQuery,
    AssetRequest, AssetSearchQuery, AssetStatus, AuditChange, CheckOptions, CheckoutRequest,
    Contact, Page, PicklistEntry, PicklistKind, PicklistRequest, StatusRequest,
};
use crate::AppState;

use super::actor::Actor;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{parse_date, validate_name};

const SEARCH_LIMIT: i64 = 50;
const DEFAULT_PAGE_SIZE: i64 = 20;
const LARGE_PAGE_SIZE: i64 = 100;
const EXPORT_FILE_NAME: &str = "assets_export.csv";

pub(crate) async fn load_asset(state: &AppState, id: i64) -> Result<Asset, ApiError> {
    Asset::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Asset not found"))
}

/// Trimmed value, or `None` when blank
fn clean(value: &str) -> Option<String> {
    Some(value.trim().to_string()).filter(|v| !v.is_empty())
}

/// Absent keeps the current value; blank clears it
fn merge(requested: &Option<String>, current: &Option<String>) -> Option<String> {
    match requested {
        Some(value) => clean(value),
        None => current.clone(),
    }
}

fn validate_request(req: &AssetRequest, creating: bool) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    match &req.name {
        Some(name) => {
            if let Err(e) = validate_name(name, "Name") {
                errors.add("name", e);
            }
        }
        None if creating => {
            errors.add("name", "Name is required");
        }
        None => {}
    }
    if let Some(status) = &req.status {
        if AssetStatus::parse(status).is_none() {
            errors.add("status", "Unknown asset status");
        }
    }
    for (field, value) in [
        ("purchase_date", &req.purchase_date),
        ("warranty_expires", &req.warranty_expires),
    ] {
        if let Some(value) = value.as_deref().and_then(clean) {
            if let Err(e) = parse_date(&value) {
                errors.add(field, e);
            }
        }
    }
    if req.purchase_cost.is_some_and(|c| c < 0.0) {
        errors.add("purchase_cost", "Cost cannot be negative");
    }
    errors.finish()
}

async fn ensure_unique_tag(state: &AppState, tag: Option<&str>, except: Option<i64>) -> Result<(), ApiError> {
    let Some(tag) = tag else {
        return Ok(());
    };
    match Asset::find_by_tag(&state.db, tag).await? {
        Some(existing) if Some(existing.id) != except => Err(ApiError::conflict(
            "Asset Tag already exists. Please choose a unique tag.",
        )),
        _ => Ok(()),
    }
}

/// Paged inventory, alphabetical. `q` also matches the assigned contact.
pub async fn list_assets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssetListQuery>,
) -> Result<Json<Page<Asset>>, ApiError> {
    let per_page = match query.per_page {
        Some(LARGE_PAGE_SIZE) => LARGE_PAGE_SIZE,
        _ => DEFAULT_PAGE_SIZE,
    };
    let pattern = query.q.as_deref().and_then(clean).map(|q| like_pattern(&q));
    let status = query.status.as_deref().and_then(clean);
    let category = query.category.as_deref().and_then(clean);

    let filter = r#"
        FROM assets a
        LEFT JOIN contacts c ON c.id = a.assigned_contact_id
        WHERE (?1 IS NULL
               OR lower(a.name) LIKE ?1
               OR lower(coalesce(a.asset_tag, '')) LIKE ?1
               OR lower(coalesce(a.serial_number, '')) LIKE ?1
               OR lower(coalesce(a.category, '')) LIKE ?1
               OR lower(coalesce(a.manufacturer, '')) LIKE ?1
               OR lower(coalesce(a.model, '')) LIKE ?1
               OR lower(coalesce(c.name, '')) LIKE ?1
               OR lower(coalesce(c.email, '')) LIKE ?1)
          AND (?2 IS NULL OR lower(a.status) = lower(?2))
          AND (?3 IS NULL OR a.category = ?3)
    "#;

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) {}", filter))
        .bind(&pattern)
        .bind(&status)
        .bind(&category)
        .fetch_one(&state.db)
        .await?;
    let pages = ((total + per_page - 1) / per_page).max(1);
    let (page, offset) = page_offset(query.page.map(|p| p.min(pages)), per_page);

    let assets: Vec<Asset> = sqlx::query_as(&format!(
        "SELECT a.* {} ORDER BY lower(a.name), a.id LIMIT ?4 OFFSET ?5",
        filter
    ))
    .bind(&pattern)
    .bind(&status)
    .bind(&category)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(Page::new(assets, total, page, per_page)))
}

pub async fn get_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<AssetDetail>, ApiError> {
    let asset = load_asset(&state, id).await?;
    let assigned_contact = match asset.assigned_contact_id {
        Some(contact_id) => Contact::find(&state.db, contact_id).await?,
        None => None,
    };
    let audits = Asset::audits(&state.db, id).await?;
    Ok(Json(AssetDetail {
        asset,
        assigned_contact,
        audits,
    }))
}

pub async fn create_asset(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<AssetRequest>,
) -> Result<(StatusCode, Json<Asset>), ApiError> {
    validate_request(&req, true)?;
    let tag = req.asset_tag.as_deref().and_then(clean);
    ensure_unique_tag(&state, tag.as_deref(), None).await?;

    let name = req.name.as_deref().and_then(clean).unwrap_or_default();
    let status = req
        .status
        .as_deref()
        .and_then(AssetStatus::parse)
        .unwrap_or(AssetStatus::Available);
    let now = now_timestamp();
    let result = sqlx::query(
        r#"
        INSERT INTO assets (
            name, asset_tag, serial_number, model, category, manufacturer, condition,
            location, status, purchase_date, purchase_cost, warranty_expires, notes,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&name)
    .bind(&tag)
    .bind(req.serial_number.as_deref().and_then(clean))
    .bind(req.model.as_deref().and_then(clean))
    .bind(req.category.as_deref().and_then(clean))
    .bind(req.manufacturer.as_deref().and_then(clean))
    .bind(req.condition.as_deref().and_then(clean))
    .bind(req.location.as_deref().and_then(clean))
    .bind(status.to_string())
    .bind(req.purchase_date.as_deref().and_then(clean))
    .bind(req.purchase_cost)
    .bind(req.warranty_expires.as_deref().and_then(clean))
    .bind(req.notes.as_deref().and_then(clean))
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let asset = load_asset(&state, result.last_insert_rowid()).await?;
    Asset::audit(
        &state.db,
        asset.id,
        actor.id(),
        AuditChange {
            action: "edit",
            field: "create",
            old_value: None,
            new_value: Some(asset.name.clone()),
        },
    )
    .await?;
    tracing::info!(asset_id = asset.id, name = %asset.name, "Asset created");
    Ok((StatusCode::CREATED, Json(asset)))
}

/// Edit fields, writing one audit row per changed field
pub async fn update_asset(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<AssetRequest>,
) -> Result<Json<Asset>, ApiError> {
    let asset = load_asset(&state, id).await?;
    validate_request(&req, false)?;

    let tag = merge(&req.asset_tag, &asset.asset_tag);
    ensure_unique_tag(&state, tag.as_deref(), Some(id)).await?;

    let name = req
        .name
        .as_deref()
        .and_then(clean)
        .unwrap_or_else(|| asset.name.clone());
    let status = req
        .status
        .as_deref()
        .and_then(AssetStatus::parse)
        .map(|s| s.to_string())
        .unwrap_or_else(|| asset.status.clone());
    let cost = req.purchase_cost.or(asset.purchase_cost);

    let updated = Asset {
        name,
        asset_tag: tag,
        serial_number: merge(&req.serial_number, &asset.serial_number),
        model: merge(&req.model, &asset.model),
        category: merge(&req.category, &asset.category),
        manufacturer: merge(&req.manufacturer, &asset.manufacturer),
        condition: merge(&req.condition, &asset.condition),
        location: merge(&req.location, &asset.location),
        status,
        purchase_date: merge(&req.purchase_date, &asset.purchase_date),
        purchase_cost: cost,
        warranty_expires: merge(&req.warranty_expires, &asset.warranty_expires),
        notes: merge(&req.notes, &asset.notes),
        ..asset.clone()
    };

    let changes = field_changes(&asset, &updated);
    if changes.is_empty() {
        return Ok(Json(asset));
    }

    sqlx::query(
        r#"
        UPDATE assets
        SET name = ?, asset_tag = ?, serial_number = ?, model = ?, category = ?,
            manufacturer = ?, condition = ?, location = ?, status = ?, purchase_date = ?,
            purchase_cost = ?, warranty_expires = ?, notes = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&updated.name)
    .bind(&updated.asset_tag)
    .bind(&updated.serial_number)
    .bind(&updated.model)
    .bind(&updated.category)
    .bind(&updated.manufacturer)
    .bind(&updated.condition)
    .bind(&updated.location)
    .bind(&updated.status)
    .bind(&updated.purchase_date)
    .bind(updated.purchase_cost)
    .bind(&updated.warranty_expires)
    .bind(&updated.notes)
    .bind(now_timestamp())
    .bind(id)
    .execute(&state.db)
    .await?;

    for (field, old_value, new_value) in changes {
        Asset::audit(
            &state.db,
            id,
            actor.id(),
            AuditChange {
                action: "edit",
                field,
                old_value,
                new_value,
            },
        )
        .await?;
    }
    Ok(Json(load_asset(&state, id).await?))
}

type FieldChange = (&'static str, Option<String>, Option<String>);

fn field_changes(before: &Asset, after: &Asset) -> Vec<FieldChange> {
    let text_fields: [(&'static str, &Option<String>, &Option<String>); 11] = [
        ("asset_tag", &before.asset_tag, &after.asset_tag),
        ("serial_number", &before.serial_number, &after.serial_number),
        ("model", &before.model, &after.model),
        ("category", &before.category, &after.category),
        ("manufacturer", &before.manufacturer, &after.manufacturer),
        ("condition", &before.condition, &after.condition),
        ("location", &before.location, &after.location),
        ("purchase_date", &before.purchase_date, &after.purchase_date),
        ("warranty_expires", &before.warranty_expires, &after.warranty_expires),
        ("notes", &before.notes, &after.notes),
        ("status", &Some(before.status.clone()), &Some(after.status.clone())),
    ];

    let mut changes = Vec::new();
    if before.name != after.name {
        changes.push(("name", Some(before.name.clone()), Some(after.name.clone())));
    }
    for (field, old, new) in text_fields {
        if old.as_deref().unwrap_or("") != new.as_deref().unwrap_or("") {
            changes.push((field, old.clone(), new.clone()));
        }
    }
    if before.purchase_cost != after.purchase_cost {
        changes.push((
            "purchase_cost",
            before.purchase_cost.map(|c| format!("{:.2}", c)),
            after.purchase_cost.map(|c| format!("{:.2}", c)),
        ));
    }
    changes
}

pub async fn set_asset_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Asset>, ApiError> {
    let asset = load_asset(&state, id).await?;
    let status = AssetStatus::parse(&req.status)
        .ok_or_else(|| ApiError::validation_field("status", "Unknown asset status"))?;
    Asset::set_status(&state.db, &asset, status, actor.id()).await?;
    Ok(Json(load_asset(&state, id).await?))
}

pub async fn checkout_asset(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<Asset>, ApiError> {
    let asset = load_asset(&state, id).await?;
    let contact = Contact::find(&state.db, req.contact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Contact not found"))?;
    let asset = Asset::checkout(&state.db, &asset, contact.id, &req.options, actor.id()).await?;
    tracing::info!(asset_id = id, contact_id = contact.id, "Asset checked out");
    Ok(Json(asset))
}

pub async fn checkin_asset(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(opts): Json<CheckOptions>,
) -> Result<Json<Asset>, ApiError> {
    let asset = load_asset(&state, id).await?;
    let asset = Asset::checkin(&state.db, &asset, &opts, actor.id()).await?;
    tracing::info!(asset_id = id, "Asset checked in");
    Ok(Json(asset))
}

#[derive(Debug, Serialize)]
pub struct BulkCheckinResponse {
    pub checked_in: usize,
}

/// Check in everything assigned to a contact
pub async fn checkin_contact_assets(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(contact_id): Path<i64>,
) -> Result<Json<BulkCheckinResponse>, ApiError> {
    Contact::find(&state.db, contact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Contact not found"))?;
    let assets: Vec<Asset> = sqlx::query_as("SELECT * FROM assets WHERE assigned_contact_id = ?")
        .bind(contact_id)
        .fetch_all(&state.db)
        .await?;
    for asset in &assets {
        Asset::checkin(&state.db, asset, &CheckOptions::default(), actor.id()).await?;
    }
    Ok(Json(BulkCheckinResponse {
        checked_in: assets.len(),
    }))
}

pub async fn archive_asset(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<Asset>, ApiError> {
    let asset = load_asset(&state, id).await?;
    Asset::set_status(&state.db, &asset, AssetStatus::Archived, actor.id()).await?;
    Ok(Json(load_asset(&state, id).await?))
}

/// Permanent removal, only for archived assets
pub async fn delete_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let asset = load_asset(&state, id).await?;
    if asset.status_enum() != Some(AssetStatus::Archived) {
        return Err(ApiError::conflict(
            "Asset must be archived before it can be hard deleted.",
        ));
    }
    // Tickets keep their history but lose the link
    let mut tx = state.db.begin().await?;
    sqlx::query("UPDATE tickets SET asset_id = NULL WHERE asset_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM assets WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!(asset_id = id, name = %asset.name, "Asset deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: u64,
}

pub async fn purge_archived(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<PurgeResponse>, ApiError> {
    actor.require_admin("Only admins can purge assets")?;
    let mut tx = state.db.begin().await?;
    sqlx::query(
        "UPDATE tickets SET asset_id = NULL \
         WHERE asset_id IN (SELECT id FROM assets WHERE status = 'archived')",
    )
    .execute(&mut *tx)
    .await?;
    let result = sqlx::query("DELETE FROM assets WHERE status = 'archived'")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!(deleted = result.rows_affected(), "Archived assets purged");
    Ok(Json(PurgeResponse {
        deleted: result.rows_affected(),
    }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AssetHit {
    pub id: i64,
    pub name: String,
    pub asset_tag: Option<String>,
    pub serial_number: Option<String>,
    pub status: String,
}

pub async fn search_assets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssetSearchQuery>,
) -> Result<Json<Vec<AssetHit>>, ApiError> {
    let pattern = query
        .q
        .as_deref()
        .and_then(clean)
        .map(|q| like_pattern(&q))
        .unwrap_or_else(|| "%".to_string());
    let hits = sqlx::query_as(
        r#"
        SELECT id, name, asset_tag, serial_number, status
        FROM assets
        WHERE lower(name) LIKE ?1
           OR lower(coalesce(asset_tag, '')) LIKE ?1
           OR lower(coalesce(serial_number, '')) LIKE ?1
        ORDER BY lower(name)
        LIMIT ?2
        "#,
    )
    .bind(pattern)
    .bind(SEARCH_LIMIT)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(hits))
}

/// One spreadsheet row; import and export share these columns
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct AssetCsvRow {
    #[serde(rename = "ID")]
    id: Option<i64>,
    #[serde(rename = "Asset Name")]
    name: Option<String>,
    #[serde(rename = "Asset Tag")]
    asset_tag: Option<String>,
    #[serde(rename = "Model")]
    model: Option<String>,
    #[serde(rename = "Category")]
    category: Option<String>,
    #[serde(rename = "Manufacturer")]
    manufacturer: Option<String>,
    #[serde(rename = "Serial")]
    serial_number: Option<String>,
    #[serde(rename = "Purchased")]
    purchase_date: Option<String>,
    #[serde(rename = "Cost")]
    cost: Option<String>,
    #[serde(rename = "Warranty Expires")]
    warranty_expires: Option<String>,
    #[serde(rename = "Location")]
    location: Option<String>,
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "Physical Condition")]
    condition: Option<String>,
    #[serde(rename = "Checkout Date")]
    checkout_date: Option<String>,
    #[serde(rename = "Last Checkin Date")]
    last_checkin_date: Option<String>,
    #[serde(rename = "Expected Checkin Date")]
    expected_checkin_date: Option<String>,
    #[serde(rename = "Notes")]
    notes: Option<String>,
}

impl From<&Asset> for AssetCsvRow {
    fn from(asset: &Asset) -> Self {
        Self {
            id: Some(asset.id),
            name: Some(asset.name.clone()),
            asset_tag: asset.asset_tag.clone(),
            model: asset.model.clone(),
            category: asset.category.clone(),
            manufacturer: asset.manufacturer.clone(),
            serial_number: asset.serial_number.clone(),
            purchase_date: asset.purchase_date.clone(),
            cost: asset.purchase_cost.map(|c| format!("{:.2}", c)),
            warranty_expires: asset.warranty_expires.clone(),
            location: asset.location.clone(),
            status: Some(asset.status.clone()),
            condition: asset.condition.clone(),
            checkout_date: asset.checkout_date.clone(),
            last_checkin_date: asset.last_checkin_date.clone(),
            expected_checkin_date: asset.expected_checkin_date.clone(),
            notes: asset.notes.clone(),
        }
    }
}

/// Dates arrive in several spreadsheet formats; store `YYYY-MM-DD`
fn import_date(raw: Option<&str>) -> Option<String> {
    let raw = raw.map(str::trim).filter(|r| !r.is_empty())?;
    let date_part = raw.split_whitespace().next().unwrap_or(raw);
    ["%Y-%m-%d", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
        .map(|d| d.format("%Y-%m-%d").to_string())
}

/// "Deployed (Jane)" style values keep the part before the parenthesis
fn import_status(raw: Option<&str>) -> AssetStatus {
    raw.and_then(|s| s.split('(').next())
        .and_then(AssetStatus::parse)
        .unwrap_or(AssetStatus::Available)
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ImportSummary {
    pub added: u64,
    pub updated: u64,
}

/// Upsert rows from CSV text, matching on tag then serial. Existing
/// assignments are left untouched.
pub async fn import_csv_text(state: &AppState, text: &str) -> Result<ImportSummary, ApiError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut summary = ImportSummary::default();
    let mut tx = state.db.begin().await?;
    for (index, record) in reader.deserialize::<AssetCsvRow>().enumerate() {
        let row = record
            .map_err(|e| ApiError::bad_request(format!("Import failed on row {}: {}", index + 2, e)))?;
        let tag = row.asset_tag.as_deref().and_then(clean);
        let serial = row.serial_number.as_deref().and_then(clean);

        let mut existing: Option<(i64,)> = None;
        if let Some(tag) = &tag {
            existing = sqlx::query_as("SELECT id FROM assets WHERE asset_tag = ?")
                .bind(tag)
                .fetch_optional(&mut *tx)
                .await?;
        }
        if existing.is_none() {
            if let Some(serial) = &serial {
                existing = sqlx::query_as("SELECT id FROM assets WHERE serial_number = ? ORDER BY id LIMIT 1")
                    .bind(serial)
                    .fetch_optional(&mut *tx)
                    .await?;
            }
        }

        let name = row
            .name
            .as_deref()
            .and_then(clean)
            .unwrap_or_else(|| "Unnamed Asset".to_string());
        let cost = row.cost.as_deref().and_then(parse_cost);
        let status = import_status(row.status.as_deref()).to_string();
        let now = now_timestamp();

        let query = match existing {
            Some((id,)) => {
                summary.updated += 1;
                sqlx::query(
                    r#"
                    UPDATE assets
                    SET name = ?1, asset_tag = ?2, serial_number = ?3, model = ?4, category = ?5,
                        manufacturer = ?6, condition = ?7, location = ?8, status = ?9,
                        purchase_date = ?10, purchase_cost = ?11, warranty_expires = ?12,
                        notes = ?13, updated_at = ?14
                    WHERE id = ?15
                    "#,
                )
                .bind(&name)
                .bind(&tag)
                .bind(&serial)
                .bind(row.model.as_deref().and_then(clean))
                .bind(row.category.as_deref().and_then(clean))
                .bind(row.manufacturer.as_deref().and_then(clean))
                .bind(row.condition.as_deref().and_then(clean))
                .bind(row.location.as_deref().and_then(clean))
                .bind(&status)
                .bind(import_date(row.purchase_date.as_deref()))
                .bind(cost)
                .bind(import_date(row.warranty_expires.as_deref()))
                .bind(row.notes.as_deref().and_then(clean))
                .bind(&now)
                .bind(id)
            }
            None => {
                summary.added += 1;
                sqlx::query(
                    r#"
                    INSERT INTO assets (
                        name, asset_tag, serial_number, model, category, manufacturer, condition,
                        location, status, purchase_date, purchase_cost, warranty_expires, notes,
                        created_at, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                    "#,
                )
                .bind(&name)
                .bind(&tag)
                .bind(&serial)
                .bind(row.model.as_deref().and_then(clean))
                .bind(row.category.as_deref().and_then(clean))
                .bind(row.manufacturer.as_deref().and_then(clean))
                .bind(row.condition.as_deref().and_then(clean))
                .bind(row.location.as_deref().and_then(clean))
                .bind(&status)
                .bind(import_date(row.purchase_date.as_deref()))
                .bind(cost)
                .bind(import_date(row.warranty_expires.as_deref()))
                .bind(row.notes.as_deref().and_then(clean))
                .bind(&now)
            }
        };
        query.execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(summary)
}

/// Multipart upload with a `file` part holding the CSV
pub async fn import_assets(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    mut multipart: Multipart,
) -> Result<Json<ImportSummary>, ApiError> {
    actor.require_admin("Only admins can import assets")?;

    let mut contents = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid upload: {}", e)))?;
        contents = Some(String::from_utf8_lossy(&bytes).into_owned());
    }
    let text = contents.ok_or_else(|| ApiError::validation_field("file", "No file uploaded"))?;

    let summary = import_csv_text(&state, &text).await?;
    tracing::info!(added = summary.added, updated = summary.updated, "Asset import complete");
    Ok(Json(summary))
}

pub async fn export_csv_bytes(state: &AppState) -> Result<Vec<u8>, ApiError> {
    let assets: Vec<Asset> = sqlx::query_as("SELECT * FROM assets ORDER BY id")
        .fetch_all(&state.db)
        .await?;
    let mut writer = csv::Writer::from_writer(Vec::new());
    for asset in &assets {
        writer
            .serialize(AssetCsvRow::from(asset))
            .map_err(|e| ApiError::internal(format!("Failed to write CSV: {}", e)))?;
    }
    writer
        .into_inner()
        .map_err(|e| ApiError::internal(format!("Failed to write CSV: {}", e)))
}

pub async fn export_assets(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Response, ApiError> {
    actor.require_admin("Only admins can export assets")?;
    let bytes = export_csv_bytes(&state).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", EXPORT_FILE_NAME),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn picklist_kind(kind: &str) -> Result<PicklistKind, ApiError> {
    PicklistKind::parse(kind).ok_or_else(|| ApiError::not_found("Invalid picklist."))
}

/// Names are unique per picklist regardless of case
async fn ensure_unique_entry(
    state: &AppState,
    kind: PicklistKind,
    name: &str,
    except: Option<i64>,
) -> Result<(), ApiError> {
    let existing: Option<(i64,)> = sqlx::query_as(&format!(
        "SELECT id FROM {} WHERE lower(name) = lower(?)",
        kind.table()
    ))
    .bind(name)
    .fetch_optional(&state.db)
    .await?;
    match existing {
        Some((id,)) if Some(id) != except => Err(ApiError::conflict("That name already exists.")),
        _ => Ok(()),
    }
}

async fn load_entry(state: &AppState, kind: PicklistKind, id: i64) -> Result<PicklistEntry, ApiError> {
    sqlx::query_as::<_, PicklistEntry>(&format!("SELECT id, name FROM {} WHERE id = ?", kind.table()))
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Picklist entry not found"))
}

pub async fn list_picklist(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<Vec<PicklistEntry>>, ApiError> {
    let kind = picklist_kind(&kind)?;
    let rows = sqlx::query_as(&format!(
        "SELECT id, name FROM {} ORDER BY lower(name)",
        kind.table()
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct AllPicklists {
    pub categories: Vec<PicklistEntry>,
    pub manufacturers: Vec<PicklistEntry>,
    pub conditions: Vec<PicklistEntry>,
    pub locations: Vec<PicklistEntry>,
}

/// Every picklist at once, for populating the asset form
pub async fn all_picklists(State(state): State<Arc<AppState>>) -> Result<Json<AllPicklists>, ApiError> {
    let mut lists = Vec::with_capacity(4);
    for kind in [
        PicklistKind::Categories,
        PicklistKind::Manufacturers,
        PicklistKind::Conditions,
        PicklistKind::Locations,
    ] {
        let rows: Vec<PicklistEntry> = sqlx::query_as(&format!(
            "SELECT id, name FROM {} ORDER BY lower(name)",
            kind.table()
        ))
        .fetch_all(&state.db)
        .await?;
        lists.push(rows);
    }
    let mut lists = lists.into_iter();
    Ok(Json(AllPicklists {
        categories: lists.next().unwrap_or_default(),
        manufacturers: lists.next().unwrap_or_default(),
        conditions: lists.next().unwrap_or_default(),
        locations: lists.next().unwrap_or_default(),
    }))
}

pub async fn create_picklist_entry(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(req): Json<PicklistRequest>,
) -> Result<(StatusCode, Json<PicklistEntry>), ApiError> {
    let kind = picklist_kind(&kind)?;
    let name = req.name.trim();
    validate_name(name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    ensure_unique_entry(&state, kind, name, None).await?;

    let result = sqlx::query(&format!("INSERT INTO {} (name) VALUES (?)", kind.table()))
        .bind(name)
        .execute(&state.db)
        .await?;
    let entry = load_entry(&state, kind, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn rename_picklist_entry(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<PicklistRequest>,
) -> Result<Json<PicklistEntry>, ApiError> {
    let kind = picklist_kind(&kind)?;
    load_entry(&state, kind, id).await?;
    let name = req.name.trim();
    validate_name(name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    ensure_unique_entry(&state, kind, name, Some(id)).await?;

    sqlx::query(&format!("UPDATE {} SET name = ? WHERE id = ?", kind.table()))
        .bind(name)
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_entry(&state, kind, id).await?))
}

pub async fn delete_picklist_entry(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    let kind = picklist_kind(&kind)?;
    load_entry(&state, kind, id).await?;
    sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::{actor, insert_asset, insert_user, test_app};

    fn named(name: &str, tag: &str) -> AssetRequest {
        AssetRequest {
            name: Some(name.to_string()),
            asset_tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_tag() {
        let app = test_app().await;
        let (status, Json(asset)) =
            create_asset(State(app.state.clone()), Actor::default(), Json(named("Laptop", "A-1")))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(asset.status, "available");

        let err = create_asset(State(app.state.clone()), Actor::default(), Json(named("Other", "A-1")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = create_asset(State(app.state.clone()), Actor::default(), Json(AssetRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_update_audits_each_changed_field() {
        let app = test_app().await;
        let asset = insert_asset(&app, "Laptop", "A-1").await;
        let Json(updated) = update_asset(
            State(app.state.clone()),
            Actor::default(),
            Path(asset.id),
            Json(AssetRequest {
                serial_number: Some("SN-9".to_string()),
                location: Some("HQ".to_string()),
                purchase_cost: Some(1299.0),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.serial_number.as_deref(), Some("SN-9"));
        assert_eq!(updated.name, "Laptop");

        let audits = Asset::audits(&app.state.db, asset.id).await.unwrap();
        let mut fields: Vec<_> = audits.iter().filter_map(|a| a.field.clone()).collect();
        fields.sort();
        assert_eq!(fields, vec!["location", "purchase_cost", "serial_number"]);

        // Unchanged values write nothing
        update_asset(
            State(app.state.clone()),
            Actor::default(),
            Path(asset.id),
            Json(AssetRequest {
                location: Some("HQ".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(Asset::audits(&app.state.db, asset.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_matches_assigned_contact() {
        let app = test_app().await;
        let laptop = insert_asset(&app, "Laptop", "A-1").await;
        insert_asset(&app, "Monitor", "A-2").await;
        let contact = Contact::upsert_by_email(&app.state.db, "jane@example.com", Some("Jane Roe"))
            .await
            .unwrap();
        checkout_asset(
            State(app.state.clone()),
            Actor::default(),
            Path(laptop.id),
            Json(CheckoutRequest {
                contact_id: contact.id,
                options: CheckOptions::default(),
            }),
        )
        .await
        .unwrap();

        let Json(page) = list_assets(
            State(app.state.clone()),
            Query(AssetListQuery {
                q: Some("roe".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, laptop.id);

        let Json(page) = list_assets(
            State(app.state.clone()),
            Query(AssetListQuery {
                status: Some("Available".to_string()),
                per_page: Some(37),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.per_page, 20);
        assert_eq!(page.items[0].name, "Monitor");
    }

    #[tokio::test]
    async fn test_bulk_checkin_and_delete_rules() {
        let app = test_app().await;
        let contact = Contact::upsert_by_email(&app.state.db, "sam@example.com", None)
            .await
            .unwrap();
        let a = insert_asset(&app, "Laptop", "A-1").await;
        let b = insert_asset(&app, "Phone", "A-2").await;
        for asset in [&a, &b] {
            Asset::checkout(&app.state.db, asset, contact.id, &CheckOptions::default(), None)
                .await
                .unwrap();
        }

        let Json(result) = checkin_contact_assets(State(app.state.clone()), Actor::default(), Path(contact.id))
            .await
            .unwrap();
        assert_eq!(result.checked_in, 2);
        let back = load_asset(&app.state, a.id).await.unwrap();
        assert!(back.assigned_contact_id.is_none());
        assert_eq!(back.status, "available");

        let err = delete_asset(State(app.state.clone()), Path(a.id)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        archive_asset(State(app.state.clone()), Actor::default(), Path(a.id))
            .await
            .unwrap();
        assert_eq!(
            delete_asset(State(app.state.clone()), Path(a.id)).await.unwrap(),
            StatusCode::NO_CONTENT
        );

        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;
        archive_asset(State(app.state.clone()), Actor::default(), Path(b.id))
            .await
            .unwrap();
        let err = purge_archived(State(app.state.clone()), Actor::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        let Json(purged) = purge_archived(State(app.state.clone()), actor(&admin)).await.unwrap();
        assert_eq!(purged.deleted, 1);
    }

    #[tokio::test]
    async fn test_deleting_asset_unlinks_tickets() {
        use crate::api::tickets::link_asset;
        use crate::db::{LinkAssetRequest, NewTicket, Ticket, TicketSource};

        let app = test_app().await;
        let db = &app.state.db;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;
        let first = Ticket::create(db, &NewTicket::new("Screen flicker", TicketSource::Manual))
            .await
            .unwrap();
        let second = Ticket::create(db, &NewTicket::new("Battery swollen", TicketSource::Manual))
            .await
            .unwrap();
        let laptop = insert_asset(&app, "Laptop", "A-1").await;
        let phone = insert_asset(&app, "Phone", "A-2").await;
        for (ticket, asset) in [(&first, &laptop), (&second, &phone)] {
            link_asset(
                State(app.state.clone()),
                Path(ticket.id),
                Json(LinkAssetRequest { asset_id: asset.id }),
            )
            .await
            .unwrap();
            archive_asset(State(app.state.clone()), Actor::default(), Path(asset.id))
                .await
                .unwrap();
        }

        delete_asset(State(app.state.clone()), Path(laptop.id)).await.unwrap();
        let unlinked = Ticket::find(db, first.id).await.unwrap().unwrap();
        assert_eq!(unlinked.asset_id, None);
        assert_eq!(
            Ticket::find(db, second.id).await.unwrap().unwrap().asset_id,
            Some(phone.id)
        );

        let Json(purged) = purge_archived(State(app.state.clone()), actor(&admin)).await.unwrap();
        assert_eq!(purged.deleted, 1);
        assert_eq!(Ticket::find(db, second.id).await.unwrap().unwrap().asset_id, None);

        // A freed ticket can be linked again
        let spare = insert_asset(&app, "Spare laptop", "A-3").await;
        let Json(relinked) = link_asset(
            State(app.state.clone()),
            Path(first.id),
            Json(LinkAssetRequest { asset_id: spare.id }),
        )
        .await
        .unwrap();
        assert_eq!(relinked.asset_id, Some(spare.id));
    }

    #[tokio::test]
    async fn test_csv_import_upserts_by_tag_then_serial() {
        let app = test_app().await;
        let existing = insert_asset(&app, "Old name", "A-1").await;
        sqlx::query("UPDATE assets SET serial_number = 'SN-2' WHERE id = ?")
            .bind(existing.id)
            .execute(&app.state.db)
            .await
            .unwrap();

        let csv = "\
Asset Name,Asset Tag,Serial,Cost,Purchased,Status,Extra
Laptop,A-1,SN-2,\"$1,200.00\",03/15/2024,Deployed (Jane),x
Dock,,SN-2,,,,
Printer,P-9,,,2024-01-02 10:00:00,mystery,
";
        let summary = import_csv_text(&app.state, csv).await.unwrap();
        assert_eq!(summary, ImportSummary { added: 1, updated: 2 });

        let updated = load_asset(&app.state, existing.id).await.unwrap();
        // Both rows matched the same asset, so the later one wins
        assert_eq!(updated.name, "Dock");

        let printer = Asset::find_by_tag(&app.state.db, "P-9").await.unwrap().unwrap();
        assert_eq!(printer.status, "available");
        assert_eq!(printer.purchase_date.as_deref(), Some("2024-01-02"));

        let exported = String::from_utf8(export_csv_bytes(&app.state).await.unwrap()).unwrap();
        let header = exported.lines().next().unwrap();
        assert!(header.starts_with("ID,Asset Name,Asset Tag"));
        assert!(exported.contains("Printer,P-9"));
    }

    #[test]
    fn test_import_helpers() {
        assert_eq!(import_date(Some("03/15/2024")).as_deref(), Some("2024-03-15"));
        assert_eq!(import_date(Some("2024-03-15 08:00:00")).as_deref(), Some("2024-03-15"));
        assert_eq!(import_date(Some("soon")), None);
        assert_eq!(import_status(Some("Retired (old)")), AssetStatus::Retired);
        assert_eq!(import_status(None), AssetStatus::Available);
    }

    #[tokio::test]
    async fn test_picklists() {
        let app = test_app().await;
        let (_, Json(entry)) = create_picklist_entry(
            State(app.state.clone()),
            Path("locations".to_string()),
            Json(PicklistRequest { name: "Store room".to_string() }),
        )
        .await
        .unwrap();
        let err = create_picklist_entry(
            State(app.state.clone()),
            Path("locations".to_string()),
            Json(PicklistRequest { name: "STORE ROOM".to_string() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = list_picklist(State(app.state.clone()), Path("colours".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let Json(renamed) = rename_picklist_entry(
            State(app.state.clone()),
            Path(("locations".to_string(), entry.id)),
            Json(PicklistRequest { name: "Basement".to_string() }),
        )
        .await
        .unwrap();
        assert_eq!(renamed.name, "Basement");

        let Json(all) = all_picklists(State(app.state.clone())).await.unwrap();
        assert_eq!(all.locations.len(), 1);
        assert!(all.categories.is_empty());
    }
}
