//! Order line items and purchase orders.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::db::{
    like_pattern, now_timestamp, page_offset, parse_cost, parse_needed_by, Company,
    CreateOrderItemRequest, CreatePoRequest, FinalizeRequest, IdsRequest, ItemStatus, OrderItem,
    Page, PoItemRequest, PoListQuery, PoMetaRequest, PoNotesRequest, PoStatus, PoTotals,
    PurchaseOrder, PurchaseOrderDetail, ShippingLocation, UpdateOrderItemRequest, Vendor,
};
use crate::notifications::{notify, OutgoingMail};
use crate::AppState;

use super::actor::Actor;
use super::error::ApiError;
use super::validation::validate_name;

const PLANNED_LIMIT: i64 = 500;
const DEFAULT_PO_PAGE: i64 = 5;
const LARGE_PO_PAGE: i64 = 20;
const SHOW_ALL_PO_PAGE: i64 = 50;
const PO_NUMBER_ATTEMPTS: usize = 10;

async fn load_item(state: &AppState, id: i64) -> Result<OrderItem, ApiError> {
    OrderItem::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Order item not found"))
}

async fn load_po(state: &AppState, id: i64) -> Result<PurchaseOrder, ApiError> {
    PurchaseOrder::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Purchase order not found"))
}

/// The PO with the given id, refused unless it is still a draft
async fn load_draft(state: &AppState, id: i64, message: &str) -> Result<PurchaseOrder, ApiError> {
    let po = load_po(state, id).await?;
    if !po.is_draft() {
        return Err(ApiError::conflict(message));
    }
    Ok(po)
}

/// An item that belongs to the given PO
async fn load_po_item(state: &AppState, po_id: i64, item_id: i64) -> Result<OrderItem, ApiError> {
    let item = load_item(state, item_id).await?;
    if item.po_id != Some(po_id) {
        return Err(ApiError::not_found("Item is not part of this PO"));
    }
    Ok(item)
}

async fn po_detail(state: &AppState, po: PurchaseOrder) -> Result<PurchaseOrderDetail, ApiError> {
    let items = PurchaseOrder::items(&state.db, po.id).await?;
    let totals = PoTotals::compute(&items, po.tax_rate, po.shipping_cost);
    Ok(PurchaseOrderDetail { po, items, totals })
}

fn clean(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn quantity(raw: Option<i64>) -> i64 {
    raw.unwrap_or(1).max(1)
}

/// Items not yet on a purchase order, newest first
pub async fn list_planned_items(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderItem>>, ApiError> {
    let items = sqlx::query_as(
        "SELECT * FROM order_items WHERE po_id IS NULL ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(PLANNED_LIMIT)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(items))
}

pub async fn ticket_order_items(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<i64>,
) -> Result<Json<Vec<OrderItem>>, ApiError> {
    let items = sqlx::query_as(
        "SELECT * FROM order_items WHERE ticket_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(ticket_id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(items))
}

pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderItemRequest>,
) -> Result<(StatusCode, Json<OrderItem>), ApiError> {
    validate_name(&req.description, "Description")
        .map_err(|e| ApiError::validation_field("description", e))?;

    let result = sqlx::query(
        r#"
        INSERT INTO order_items (
            description, quantity, target_vendor, source_url, est_unit_cost, status,
            dept_code, needed_by_text, ticket_id, created_at
        )
        VALUES (?, ?, ?, ?, ?, 'planned', ?, ?, ?, ?)
        "#,
    )
    .bind(req.description.trim())
    .bind(quantity(req.quantity))
    .bind(clean(req.target_vendor.as_deref()))
    .bind(clean(req.source_url.as_deref()))
    .bind(req.est_unit_cost.as_deref().and_then(parse_cost))
    .bind(clean(req.dept_code.as_deref()))
    .bind(req.needed_by.as_deref().and_then(parse_needed_by))
    .bind(req.ticket_id)
    .bind(now_timestamp())
    .execute(&state.db)
    .await?;

    let item = load_item(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// Edit a line item. Absent fields are unchanged; a blank cost clears it.
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateOrderItemRequest>,
) -> Result<Json<OrderItem>, ApiError> {
    let item = load_item(&state, id).await?;
    let status = match req.status.as_deref() {
        Some(raw) => ItemStatus::parse(raw)
            .ok_or_else(|| ApiError::validation_field("status", "Unknown item status"))?
            .to_string(),
        None => item.status.clone(),
    };
    let description = clean(req.description.as_deref()).unwrap_or_else(|| item.description.clone());
    let quantity = req.quantity.map(|q| q.max(1)).unwrap_or(item.quantity);
    let target_vendor = match req.target_vendor.as_deref() {
        Some(raw) => clean(Some(raw)),
        None => item.target_vendor.clone(),
    };
    let source_url = match req.source_url.as_deref() {
        Some(raw) => clean(Some(raw)),
        None => item.source_url.clone(),
    };
    let cost = match req.est_unit_cost.as_deref() {
        Some(raw) if raw.trim().is_empty() => None,
        Some(raw) => parse_cost(raw).or(item.est_unit_cost),
        None => item.est_unit_cost,
    };
    let needed_by = match req.needed_by.as_deref() {
        Some(raw) => parse_needed_by(raw),
        None => item.needed_by_text.clone(),
    };
    let dept_code = match req.dept_code.as_deref() {
        Some(raw) => clean(Some(raw)),
        None => item.dept_code.clone(),
    };

    sqlx::query(
        r#"
        UPDATE order_items
        SET description = ?, quantity = ?, target_vendor = ?, source_url = ?,
            est_unit_cost = ?, needed_by_text = ?, dept_code = ?, status = ?
        WHERE id = ?
        "#,
    )
    .bind(&description)
    .bind(quantity)
    .bind(&target_vendor)
    .bind(&source_url)
    .bind(cost)
    .bind(&needed_by)
    .bind(&dept_code)
    .bind(&status)
    .bind(id)
    .execute(&state.db)
    .await?;
    Ok(Json(load_item(&state, id).await?))
}

pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_item(&state, id).await?;
    sqlx::query("DELETE FROM order_items WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

pub async fn delete_selected_items(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdsRequest>,
) -> Result<Json<DeletedResponse>, ApiError> {
    if req.ids.is_empty() {
        return Err(ApiError::validation_field("ids", "No items selected for deletion"));
    }
    let mut tx = state.db.begin().await?;
    let mut deleted = 0;
    for id in &req.ids {
        let result = sqlx::query("DELETE FROM order_items WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        deleted += result.rows_affected();
    }
    tx.commit().await?;
    if deleted == 0 {
        return Err(ApiError::not_found("No items found for deletion"));
    }
    Ok(Json(DeletedResponse { deleted }))
}

/// Start a draft PO from unassigned items, copying in a known vendor's
/// details when the name matches one
pub async fn create_po(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePoRequest>,
) -> Result<(StatusCode, Json<PurchaseOrderDetail>), ApiError> {
    if req.item_ids.is_empty() {
        return Err(ApiError::validation_field("item_ids", "Select at least one item"));
    }
    let vendor_name = clean(req.vendor.as_deref()).unwrap_or_else(|| "Vendor".to_string());
    let vendor: Option<Vendor> =
        sqlx::query_as("SELECT * FROM vendors WHERE lower(company_name) = lower(?)")
            .bind(&vendor_name)
            .fetch_optional(&state.db)
            .await?;

    let mut tx = state.db.begin().await?;
    let result = sqlx::query(
        r#"
        INSERT INTO purchase_orders (
            vendor_name, vendor_contact_name, vendor_email, vendor_address, vendor_phone,
            status, created_at
        )
        VALUES (?, ?, ?, ?, ?, 'draft', ?)
        "#,
    )
    .bind(&vendor_name)
    .bind(vendor.as_ref().and_then(|v| v.contact_name.clone()))
    .bind(vendor.as_ref().and_then(|v| v.email.clone()))
    .bind(vendor.as_ref().and_then(|v| v.address.clone()))
    .bind(vendor.as_ref().and_then(|v| v.phone.clone()))
    .bind(now_timestamp())
    .execute(&mut *tx)
    .await?;
    let po_id = result.last_insert_rowid();

    let mut attached = 0;
    for item_id in &req.item_ids {
        let result = sqlx::query(
            "UPDATE order_items SET po_id = ?, status = 'ordered' WHERE id = ? AND po_id IS NULL",
        )
        .bind(po_id)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;
        attached += result.rows_affected();
    }
    if attached == 0 {
        tx.rollback().await?;
        return Err(ApiError::validation_field("item_ids", "No valid items selected"));
    }
    tx.commit().await?;

    let po = load_po(&state, po_id).await?;
    tracing::info!(po_id, vendor = %vendor_name, items = attached, "Draft PO created");
    Ok((StatusCode::CREATED, Json(po_detail(&state, po).await?)))
}

/// Recent POs, newest first. Completed ones are hidden unless asked for.
pub async fn list_pos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PoListQuery>,
) -> Result<Json<Page<PurchaseOrder>>, ApiError> {
    let per_page = if query.show_all {
        SHOW_ALL_PO_PAGE
    } else {
        match query.per_page {
            Some(LARGE_PO_PAGE) => LARGE_PO_PAGE,
            _ => DEFAULT_PO_PAGE,
        }
    };
    let pattern = clean(query.search.as_deref()).map(|q| like_pattern(&q));
    let (page, offset) = page_offset(query.page, per_page);

    let filter = r#"
        FROM purchase_orders p
        WHERE (?1 IS NULL
               OR lower(coalesce(p.vendor_name, '')) LIKE ?1
               OR lower(coalesce(p.vendor_contact_name, '')) LIKE ?1
               OR lower(coalesce(p.vendor_email, '')) LIKE ?1
               OR lower(coalesce(p.vendor_address, '')) LIKE ?1
               OR lower(coalesce(p.po_number, '')) LIKE ?1
               OR lower(coalesce(p.quote_number, '')) LIKE ?1
               OR lower(coalesce(p.notes, '')) LIKE ?1
               OR lower(coalesce(p.company_name, '')) LIKE ?1
               OR lower(coalesce(p.shipping_name, '')) LIKE ?1
               OR p.id IN (SELECT po_id FROM order_items
                           WHERE po_id IS NOT NULL AND lower(description) LIKE ?1))
          AND (?2 OR p.status != 'complete')
    "#;

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) {}", filter))
        .bind(&pattern)
        .bind(query.show_completed)
        .fetch_one(&state.db)
        .await?;
    let pos: Vec<PurchaseOrder> = sqlx::query_as(&format!(
        "SELECT p.* {} ORDER BY p.created_at DESC, p.id DESC LIMIT ?3 OFFSET ?4",
        filter
    ))
    .bind(&pattern)
    .bind(query.show_completed)
    .bind(per_page)
    .bind(offset)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(Page::new(pos, total, page, per_page)))
}

pub async fn get_po(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<PurchaseOrderDetail>, ApiError> {
    let po = load_po(&state, id).await?;
    Ok(Json(po_detail(&state, po).await?))
}

/// Choose the billing company and ship-to location (their details are
/// copied onto the PO), quote number and shipping cost
pub async fn update_po_meta(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PoMetaRequest>,
) -> Result<Json<PurchaseOrderDetail>, ApiError> {
    let po = load_draft(&state, id, "Cannot change details of a finalized PO").await?;

    let company = match req.company_id {
        Some(company_id) => Some(
            sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?")
                .bind(company_id)
                .fetch_optional(&state.db)
                .await?
                .ok_or_else(|| ApiError::validation_field("company_id", "Unknown company"))?,
        ),
        None => None,
    };
    let shipping = match req.shipping_location_id {
        Some(location_id) => Some(
            sqlx::query_as::<_, ShippingLocation>("SELECT * FROM shipping_locations WHERE id = ?")
                .bind(location_id)
                .fetch_optional(&state.db)
                .await?
                .ok_or_else(|| {
                    ApiError::validation_field("shipping_location_id", "Unknown shipping location")
                })?,
        ),
        None => None,
    };
    let shipping_cost = req.shipping_cost.map(|c| c.max(0.0)).unwrap_or(po.shipping_cost);

    sqlx::query(
        r#"
        UPDATE purchase_orders
        SET company_name = ?, company_address = ?, company_city = ?, company_state = ?,
            company_zip = ?, shipping_name = ?, shipping_address = ?, shipping_city = ?,
            shipping_state = ?, shipping_zip = ?, tax_rate = ?, quote_number = ?,
            shipping_cost = ?
        WHERE id = ?
        "#,
    )
    .bind(company.as_ref().map(|c| c.name.clone()))
    .bind(company.as_ref().and_then(|c| c.address.clone()))
    .bind(company.as_ref().and_then(|c| c.city.clone()))
    .bind(company.as_ref().and_then(|c| c.state.clone()))
    .bind(company.as_ref().and_then(|c| c.zip.clone()))
    .bind(shipping.as_ref().map(|s| s.name.clone()))
    .bind(shipping.as_ref().and_then(|s| s.address.clone()))
    .bind(shipping.as_ref().and_then(|s| s.city.clone()))
    .bind(shipping.as_ref().and_then(|s| s.state.clone()))
    .bind(shipping.as_ref().and_then(|s| s.zip.clone()))
    .bind(shipping.as_ref().map(|s| s.tax_rate).unwrap_or(0.0))
    .bind(clean(req.quote_number.as_deref()))
    .bind(shipping_cost)
    .bind(id)
    .execute(&state.db)
    .await?;

    let po = load_po(&state, id).await?;
    Ok(Json(po_detail(&state, po).await?))
}

pub async fn update_po_notes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PoNotesRequest>,
) -> Result<Json<PurchaseOrder>, ApiError> {
    load_draft(&state, id, "Cannot edit notes after finalize").await?;
    sqlx::query("UPDATE purchase_orders SET notes = ? WHERE id = ?")
        .bind(clean(req.notes.as_deref()))
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_po(&state, id).await?))
}

pub async fn add_po_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PoItemRequest>,
) -> Result<(StatusCode, Json<OrderItem>), ApiError> {
    load_draft(&state, id, "Cannot add items to a finalized PO.").await?;
    validate_name(&req.description, "Description")
        .map_err(|e| ApiError::validation_field("description", e))?;

    let result = sqlx::query(
        r#"
        INSERT INTO order_items (description, quantity, est_unit_cost, dept_code, po_id, status, created_at)
        VALUES (?, ?, ?, ?, ?, 'ordered', ?)
        "#,
    )
    .bind(req.description.trim())
    .bind(quantity(req.quantity))
    .bind(req.est_unit_cost.as_deref().and_then(parse_cost))
    .bind(clean(req.dept_code.as_deref()))
    .bind(id)
    .bind(now_timestamp())
    .execute(&state.db)
    .await?;

    let item = load_item(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn edit_po_item(
    State(state): State<Arc<AppState>>,
    Path((id, item_id)): Path<(i64, i64)>,
    Json(req): Json<UpdateOrderItemRequest>,
) -> Result<Json<OrderItem>, ApiError> {
    load_draft(&state, id, "Cannot edit items in a finalized PO").await?;
    load_po_item(&state, id, item_id).await?;
    let edit = UpdateOrderItemRequest {
        description: req.description,
        quantity: req.quantity,
        est_unit_cost: req.est_unit_cost,
        dept_code: req.dept_code,
        ..Default::default()
    };
    update_item(State(state), Path(item_id), Json(edit)).await
}

pub async fn delete_po_item(
    State(state): State<Arc<AppState>>,
    Path((id, item_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    load_draft(&state, id, "Cannot delete items from a finalized PO").await?;
    load_po_item(&state, id, item_id).await?;
    sqlx::query("DELETE FROM order_items WHERE id = ?")
        .bind(item_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.message().contains("UNIQUE constraint failed"))
}

/// Give the PO the next number and mark it sent. A number taken by a
/// concurrent finalize is retried with a fresh one.
async fn assign_number(state: &AppState, po: &PurchaseOrder) -> Result<String, ApiError> {
    let mut number = po.po_number.clone();
    for _ in 0..PO_NUMBER_ATTEMPTS {
        let candidate = match number.take() {
            Some(existing) => existing,
            None => PurchaseOrder::next_number(&state.db).await?,
        };
        let result = sqlx::query(
            "UPDATE purchase_orders SET po_number = ?, status = ?, ordered_at = ? WHERE id = ?",
        )
        .bind(&candidate)
        .bind(PoStatus::Sent.to_string())
        .bind(now_timestamp())
        .bind(po.id)
        .execute(&state.db)
        .await;
        match result {
            Ok(_) => return Ok(candidate),
            Err(e) if is_unique_violation(&e) => {
                tracing::warn!(po_id = po.id, number = %candidate, "PO number taken, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ApiError::conflict(
        "Could not assign a unique PO number. Please try again.",
    ))
}

fn summary_html(detail: &PurchaseOrderDetail) -> String {
    let number = detail.po.po_number.as_deref().unwrap_or("");
    let vendor = detail.po.vendor_name.as_deref().unwrap_or("");
    let mut rows = String::new();
    for item in &detail.items {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>${:.2}</td><td>${:.2}</td></tr>",
            ammonia::clean_text(&item.description),
            item.quantity,
            item.est_unit_cost.unwrap_or(0.0),
            item.line_total(),
        ));
    }
    format!(
        "<p>Purchase Order <strong>{}</strong> for {}.</p>\
         <table><tr><th>Item</th><th>Qty</th><th>Unit</th><th>Total</th></tr>{}</table>\
         <p>Subtotal: ${:.2}<br>Tax: ${:.2}<br>Shipping: ${:.2}<br>Total: ${:.2}</p>",
        ammonia::clean_text(number),
        ammonia::clean_text(vendor),
        rows,
        detail.totals.subtotal,
        detail.totals.tax,
        detail.totals.shipping,
        detail.totals.grand_total,
    )
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    #[serde(flatten)]
    pub detail: PurchaseOrderDetail,
    pub emailed: bool,
}

/// Number the PO, mark it sent and mail the summary to the requested
/// address (or the acting tech). Mail failures do not undo the finalize.
pub async fn finalize_po(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let po = load_draft(&state, id, "Purchase order is already finalized").await?;
    let number = assign_number(&state, &po).await?;
    tracing::info!(po_id = id, po_number = %number, "PO finalized");

    let detail = po_detail(&state, load_po(&state, id).await?).await?;
    let recipient = clean(req.email_to.as_deref())
        .map(|to| (to, None))
        .or_else(|| actor.user().map(|u| (u.email.clone(), u.name.clone())));
    let emailed = match recipient {
        Some((to, name)) => {
            let mail = OutgoingMail::new(to, format!("Purchase Order {}", number), summary_html(&detail))
                .to_name(name.as_deref());
            notify(state.outbox.as_ref(), mail).await
        }
        None => {
            tracing::warn!(po_id = id, "No recipient for PO summary");
            false
        }
    };
    Ok(Json(FinalizeResponse { detail, emailed }))
}

/// Mark an item received and roll the PO status forward
pub async fn receive_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OrderItem>, ApiError> {
    let item = load_item(&state, id).await?;
    sqlx::query("UPDATE order_items SET status = 'received', received_at = ? WHERE id = ?")
        .bind(now_timestamp())
        .bind(id)
        .execute(&state.db)
        .await?;

    if let Some(po_id) = item.po_id {
        let (outstanding,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM order_items WHERE po_id = ? AND status != 'received'",
        )
        .bind(po_id)
        .fetch_one(&state.db)
        .await?;
        let status = if outstanding == 0 {
            PoStatus::Complete
        } else {
            PoStatus::PartiallyReceived
        };
        sqlx::query("UPDATE purchase_orders SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(po_id)
            .execute(&state.db)
            .await?;
    }
    Ok(Json(load_item(&state, id).await?))
}
