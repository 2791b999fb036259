//! Purchasing reference data: vendors, billing companies and ship-to
//! locations.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{
    Company, CompanyRequest, ShippingLocation, ShippingLocationRequest, Vendor, VendorRequest,
};
use crate::AppState;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_name};

fn clean(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Tax rate arrives as a percentage (8.25) and is stored as a fraction
fn tax_fraction(percent: f64) -> f64 {
    percent.clamp(0.0, 100.0) / 100.0
}

async fn load_vendor(state: &AppState, id: i64) -> Result<Vendor, ApiError> {
    sqlx::query_as::<_, Vendor>("SELECT * FROM vendors WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Vendor not found"))
}

async fn load_company(state: &AppState, id: i64) -> Result<Company, ApiError> {
    sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Company not found"))
}

async fn load_location(state: &AppState, id: i64) -> Result<ShippingLocation, ApiError> {
    sqlx::query_as::<_, ShippingLocation>("SELECT * FROM shipping_locations WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Shipping location not found"))
}

fn validate_vendor(req: &VendorRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_name(&req.company_name, "Company name") {
        errors.add("company_name", e);
    }
    if let Some(email) = clean(req.email.as_deref()) {
        if let Err(e) = validate_email(&email) {
            errors.add("email", e);
        }
    }
    errors.finish()
}

pub async fn list_vendors(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Vendor>>, ApiError> {
    let vendors = sqlx::query_as("SELECT * FROM vendors ORDER BY lower(company_name)")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(vendors))
}

pub async fn get_vendor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vendor>, ApiError> {
    Ok(Json(load_vendor(&state, id).await?))
}

pub async fn create_vendor(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VendorRequest>,
) -> Result<(StatusCode, Json<Vendor>), ApiError> {
    validate_vendor(&req)?;
    let result = sqlx::query(
        "INSERT INTO vendors (company_name, contact_name, email, address, phone) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(req.company_name.trim())
    .bind(clean(req.contact_name.as_deref()))
    .bind(clean(req.email.as_deref()))
    .bind(clean(req.address.as_deref()))
    .bind(clean(req.phone.as_deref()))
    .execute(&state.db)
    .await?;
    let vendor = load_vendor(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(vendor)))
}

pub async fn update_vendor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<VendorRequest>,
) -> Result<Json<Vendor>, ApiError> {
    load_vendor(&state, id).await?;
    validate_vendor(&req)?;
    sqlx::query(
        "UPDATE vendors SET company_name = ?, contact_name = ?, email = ?, address = ?, phone = ? WHERE id = ?",
    )
    .bind(req.company_name.trim())
    .bind(clean(req.contact_name.as_deref()))
    .bind(clean(req.email.as_deref()))
    .bind(clean(req.address.as_deref()))
    .bind(clean(req.phone.as_deref()))
    .bind(id)
    .execute(&state.db)
    .await?;
    Ok(Json(load_vendor(&state, id).await?))
}

/// Vendors named on a purchase order stay
pub async fn delete_vendor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let vendor = load_vendor(&state, id).await?;
    let (used,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM purchase_orders WHERE lower(vendor_name) = lower(?)")
            .bind(&vendor.company_name)
            .fetch_one(&state.db)
            .await?;
    if used > 0 {
        return Err(ApiError::conflict(
            "Cannot delete vendor: it is used by existing purchase orders.",
        ));
    }
    sqlx::query("DELETE FROM vendors WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_companies(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Company>>, ApiError> {
    let companies = sqlx::query_as("SELECT * FROM companies ORDER BY lower(name)")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(companies))
}

pub async fn create_company(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompanyRequest>,
) -> Result<(StatusCode, Json<Company>), ApiError> {
    validate_name(&req.name, "Company name").map_err(|e| ApiError::validation_field("name", e))?;
    let result = sqlx::query("INSERT INTO companies (name, address, city, state, zip) VALUES (?, ?, ?, ?, ?)")
        .bind(req.name.trim())
        .bind(clean(req.address.as_deref()))
        .bind(clean(req.city.as_deref()))
        .bind(clean(req.state.as_deref()))
        .bind(clean(req.zip.as_deref()))
        .execute(&state.db)
        .await?;
    let company = load_company(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(company)))
}

pub async fn update_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<CompanyRequest>,
) -> Result<Json<Company>, ApiError> {
    load_company(&state, id).await?;
    validate_name(&req.name, "Company name").map_err(|e| ApiError::validation_field("name", e))?;
    sqlx::query("UPDATE companies SET name = ?, address = ?, city = ?, state = ?, zip = ? WHERE id = ?")
        .bind(req.name.trim())
        .bind(clean(req.address.as_deref()))
        .bind(clean(req.city.as_deref()))
        .bind(clean(req.state.as_deref()))
        .bind(clean(req.zip.as_deref()))
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(Json(load_company(&state, id).await?))
}

pub async fn delete_company(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_company(&state, id).await?;
    sqlx::query("DELETE FROM companies WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_shipping_locations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ShippingLocation>>, ApiError> {
    let locations = sqlx::query_as("SELECT * FROM shipping_locations ORDER BY lower(name)")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(locations))
}

pub async fn create_shipping_location(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ShippingLocationRequest>,
) -> Result<(StatusCode, Json<ShippingLocation>), ApiError> {
    validate_name(&req.name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    let result = sqlx::query(
        "INSERT INTO shipping_locations (name, address, city, state, zip, tax_rate) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(req.name.trim())
    .bind(clean(req.address.as_deref()))
    .bind(clean(req.city.as_deref()))
    .bind(clean(req.state.as_deref()))
    .bind(clean(req.zip.as_deref()))
    .bind(tax_fraction(req.tax_rate))
    .execute(&state.db)
    .await?;
    let location = load_location(&state, result.last_insert_rowid()).await?;
    Ok((StatusCode::CREATED, Json(location)))
}

pub async fn update_shipping_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ShippingLocationRequest>,
) -> Result<Json<ShippingLocation>, ApiError> {
    load_location(&state, id).await?;
    validate_name(&req.name, "Name").map_err(|e| ApiError::validation_field("name", e))?;
    sqlx::query(
        "UPDATE shipping_locations SET name = ?, address = ?, city = ?, state = ?, zip = ?, tax_rate = ? WHERE id = ?",
    )
    .bind(req.name.trim())
    .bind(clean(req.address.as_deref()))
    .bind(clean(req.city.as_deref()))
    .bind(clean(req.state.as_deref()))
    .bind(clean(req.zip.as_deref()))
    .bind(tax_fraction(req.tax_rate))
    .bind(id)
    .execute(&state.db)
    .await?;
    Ok(Json(load_location(&state, id).await?))
}

pub async fn delete_shipping_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_location(&state, id).await?;
    sqlx::query("DELETE FROM shipping_locations WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::test_app;
    use crate::db::now_timestamp;

    fn vendor(name: &str) -> VendorRequest {
        VendorRequest {
            company_name: name.to_string(),
            contact_name: Some("Pat".to_string()),
            email: Some("pat@acme.test".to_string()),
            address: None,
            phone: Some(" ".to_string()),
        }
    }

    #[tokio::test]
    async fn test_vendor_in_use_cannot_be_deleted() {
        let app = test_app().await;
        let (_, Json(acme)) = create_vendor(State(app.state.clone()), Json(vendor("Acme")))
            .await
            .unwrap();
        assert!(acme.phone.is_none());

        let err = create_vendor(State(app.state.clone()), Json(vendor("Acme")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        sqlx::query("INSERT INTO purchase_orders (vendor_name, created_at) VALUES ('ACME', ?)")
            .bind(now_timestamp())
            .execute(&app.state.db)
            .await
            .unwrap();
        let err = delete_vendor(State(app.state.clone()), Path(acme.id)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let (_, Json(other)) = create_vendor(State(app.state.clone()), Json(vendor("Globex")))
            .await
            .unwrap();
        delete_vendor(State(app.state.clone()), Path(other.id)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shipping_tax_rate_is_percent() {
        let app = test_app().await;
        let (_, Json(hq)) = create_shipping_location(
            State(app.state.clone()),
            Json(ShippingLocationRequest {
                name: "HQ".to_string(),
                address: None,
                city: Some("Austin".to_string()),
                state: Some("TX".to_string()),
                zip: None,
                tax_rate: 8.25,
            }),
        )
        .await
        .unwrap();
        assert!((hq.tax_rate - 0.0825).abs() < 1e-9);

        let Json(updated) = update_shipping_location(
            State(app.state.clone()),
            Path(hq.id),
            Json(ShippingLocationRequest {
                name: "HQ".to_string(),
                address: None,
                city: None,
                state: None,
                zip: None,
                tax_rate: 250.0,
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.tax_rate, 1.0);
    }
}
