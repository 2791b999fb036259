//! Procurement models: order line items, purchase orders and their
//! vendor / billing / ship-to reference data.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoStatus {
    Draft,
    Sent,
    PartiallyReceived,
    Complete,
    Canceled,
}

impl std::fmt::Display for PoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::PartiallyReceived => "partially_received",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl PoStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "draft" => Some(Self::Draft),
            "sent" => Some(Self::Sent),
            "partially_received" => Some(Self::PartiallyReceived),
            "complete" => Some(Self::Complete),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Planned,
    Ordered,
    Backordered,
    Received,
    Canceled,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Ordered => "ordered",
            Self::Backordered => "backordered",
            Self::Received => "received",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl ItemStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "planned" => Some(Self::Planned),
            "ordered" => Some(Self::Ordered),
            "backordered" => Some(Self::Backordered),
            "received" => Some(Self::Received),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Vendor {
    pub id: i64,
    pub company_name: String,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ShippingLocation {
    pub id: i64,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    /// Fraction, e.g. 0.0825
    pub tax_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub description: String,
    pub quantity: i64,
    pub target_vendor: Option<String>,
    pub source_url: Option<String>,
    pub est_unit_cost: Option<f64>,
    pub status: String,
    pub dept_code: Option<String>,
    /// `MM-DD-YYYY`
    pub needed_by_text: Option<String>,
    pub ticket_id: Option<i64>,
    pub po_id: Option<i64>,
    pub received_at: Option<String>,
    pub created_at: String,
}

impl OrderItem {
    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<OrderItem>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM order_items WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub fn line_total(&self) -> f64 {
        self.est_unit_cost.unwrap_or(0.0) * self.quantity as f64
    }
}

/// Purchase order with vendor, billing and ship-to details copied in at
/// the time they were chosen
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PurchaseOrder {
    pub id: i64,
    pub po_number: Option<String>,
    pub quote_number: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_contact_name: Option<String>,
    pub vendor_email: Option<String>,
    pub vendor_address: Option<String>,
    pub vendor_phone: Option<String>,
    pub company_name: Option<String>,
    pub company_address: Option<String>,
    pub company_city: Option<String>,
    pub company_state: Option<String>,
    pub company_zip: Option<String>,
    pub shipping_name: Option<String>,
    pub shipping_address: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_state: Option<String>,
    pub shipping_zip: Option<String>,
    pub tax_rate: f64,
    pub shipping_cost: f64,
    pub status: String,
    pub notes: Option<String>,
    pub ordered_at: Option<String>,
    pub created_at: String,
}

impl PurchaseOrder {
    pub fn is_draft(&self) -> bool {
        self.status == PoStatus::Draft.to_string()
    }

    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<PurchaseOrder>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM purchase_orders WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn items(db: &SqlitePool, id: i64) -> Result<Vec<OrderItem>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM order_items WHERE po_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(db)
            .await
    }

    /// Next sequential number: highest numeric `po_number`, or 999, plus one
    pub async fn next_number(db: &SqlitePool) -> Result<String, sqlx::Error> {
        let (max,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(CAST(po_number AS INTEGER)) FROM purchase_orders WHERE po_number IS NOT NULL",
        )
        .fetch_one(db)
        .await?;
        let current = match max {
            Some(n) if n > 0 => n,
            _ => 999,
        };
        Ok((current + 1).to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PoTotals {
    pub subtotal: f64,
    pub tax: f64,
    pub shipping: f64,
    pub grand_total: f64,
}

impl PoTotals {
    pub fn compute(items: &[OrderItem], tax_rate: f64, shipping_cost: f64) -> Self {
        let subtotal: f64 = items.iter().map(OrderItem::line_total).sum();
        let tax = subtotal * tax_rate;
        let shipping = shipping_cost.max(0.0);
        Self {
            subtotal,
            tax,
            shipping,
            grand_total: subtotal + tax + shipping,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PurchaseOrderDetail {
    #[serde(flatten)]
    pub po: PurchaseOrder,
    pub items: Vec<OrderItem>,
    pub totals: PoTotals,
}

/// Keep digits, '.' and '-' from a typed cost such as "$1,299.00"
pub fn parse_cost(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Accept `YYYY-MM-DD` or `MM-DD-YYYY`, normalised to `MM-DD-YYYY`
pub fn parse_needed_by(raw: &str) -> Option<String> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m-%d-%Y"))
        .ok()
        .map(|d| d.format("%m-%d-%Y").to_string())
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderItemRequest {
    pub description: String,
    pub quantity: Option<i64>,
    pub target_vendor: Option<String>,
    pub source_url: Option<String>,
    /// Free text such as "$1,299.00"
    pub est_unit_cost: Option<String>,
    pub needed_by: Option<String>,
    pub dept_code: Option<String>,
    pub ticket_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateOrderItemRequest {
    pub description: Option<String>,
    pub quantity: Option<i64>,
    pub target_vendor: Option<String>,
    pub source_url: Option<String>,
    pub est_unit_cost: Option<String>,
    pub needed_by: Option<String>,
    pub dept_code: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoRequest {
    pub item_ids: Vec<i64>,
    pub vendor: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PoMetaRequest {
    pub company_id: Option<i64>,
    pub shipping_location_id: Option<i64>,
    pub quote_number: Option<String>,
    pub shipping_cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PoNotesRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PoItemRequest {
    pub description: String,
    pub quantity: Option<i64>,
    pub est_unit_cost: Option<String>,
    pub dept_code: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FinalizeRequest {
    /// Address that receives the PO summary
    pub email_to: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PoListQuery {
    pub search: Option<String>,
    #[serde(default)]
    pub show_completed: bool,
    #[serde(default)]
    pub show_all: bool,
    pub page: Option<i64>,
    /// 5 (default) or 20
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct VendorRequest {
    pub company_name: String,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompanyRequest {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShippingLocationRequest {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    #[serde(default)]
    pub tax_rate: f64,
}
