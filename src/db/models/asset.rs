//! Asset inventory models, picklists and the audit trail.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use super::common::now_timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Available,
    Deployed,
    Maintenance,
    Retired,
    Lost,
    Archived,
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Deployed => "deployed",
            Self::Maintenance => "maintenance",
            Self::Retired => "retired",
            Self::Lost => "lost",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl AssetStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "available" => Some(Self::Available),
            "deployed" => Some(Self::Deployed),
            "maintenance" => Some(Self::Maintenance),
            "retired" => Some(Self::Retired),
            "lost" => Some(Self::Lost),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub asset_tag: Option<String>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub condition: Option<String>,
    pub location: Option<String>,
    pub status: String,
    pub purchase_date: Option<String>,
    pub purchase_cost: Option<f64>,
    pub warranty_expires: Option<String>,
    pub notes: Option<String>,
    pub assigned_contact_id: Option<i64>,
    pub checkout_date: Option<String>,
    pub expected_checkin_date: Option<String>,
    pub last_checkin_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetAudit {
    pub id: i64,
    pub asset_id: i64,
    pub action: String,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub user_id: Option<i64>,
    pub created_at: String,
}

/// One audit row to be written
#[derive(Debug, Clone)]
pub struct AuditChange<'a> {
    pub action: &'a str,
    pub field: &'a str,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl Asset {
    pub fn status_enum(&self) -> Option<AssetStatus> {
        AssetStatus::parse(&self.status)
    }

    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<Asset>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM assets WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_tag(db: &SqlitePool, tag: &str) -> Result<Option<Asset>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM assets WHERE asset_tag = ?")
            .bind(tag.trim())
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_serial(db: &SqlitePool, serial: &str) -> Result<Option<Asset>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM assets WHERE serial_number = ? ORDER BY id LIMIT 1")
            .bind(serial.trim())
            .fetch_optional(db)
            .await
    }

    pub async fn audit(
        db: &SqlitePool,
        asset_id: i64,
        user_id: Option<i64>,
        change: AuditChange<'_>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO asset_audits (asset_id, action, field, old_value, new_value, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(asset_id)
        .bind(change.action)
        .bind(change.field)
        .bind(change.old_value)
        .bind(change.new_value)
        .bind(user_id)
        .bind(now_timestamp())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn audits(db: &SqlitePool, asset_id: i64) -> Result<Vec<AssetAudit>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM asset_audits WHERE asset_id = ? ORDER BY id DESC")
            .bind(asset_id)
            .fetch_all(db)
            .await
    }

    /// Change the status, auditing when it actually changes
    pub async fn set_status(
        db: &SqlitePool,
        asset: &Asset,
        status: AssetStatus,
        user_id: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let new_status = status.to_string();
        if asset.status == new_status {
            return Ok(false);
        }
        sqlx::query("UPDATE assets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(&new_status)
            .bind(now_timestamp())
            .bind(asset.id)
            .execute(db)
            .await?;
        Self::audit(
            db,
            asset.id,
            user_id,
            AuditChange {
                action: "status_change",
                field: "status",
                old_value: Some(asset.status.clone()),
                new_value: Some(new_status),
            },
        )
        .await?;
        Ok(true)
    }

    /// Assign to a contact. Status defaults to `deployed`.
    pub async fn checkout(
        db: &SqlitePool,
        asset: &Asset,
        contact_id: i64,
        opts: &CheckOptions,
        user_id: Option<i64>,
    ) -> Result<Asset, sqlx::Error> {
        let status = opts.status.unwrap_or(AssetStatus::Deployed).to_string();
        let location = opts.location_override().or(asset.location.clone());
        let now = now_timestamp();

        sqlx::query(
            r#"
            UPDATE assets
            SET assigned_contact_id = ?, checkout_date = ?, expected_checkin_date = ?,
                status = ?, location = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(contact_id)
        .bind(&now)
        .bind(&opts.expected_checkin_date)
        .bind(&status)
        .bind(&location)
        .bind(&now)
        .bind(asset.id)
        .execute(db)
        .await?;

        Self::audit(
            db,
            asset.id,
            user_id,
            AuditChange {
                action: "checkout",
                field: "assigned_contact_id",
                old_value: asset.assigned_contact_id.map(|id| id.to_string()),
                new_value: Some(contact_id.to_string()),
            },
        )
        .await?;
        Self::audit_side_effects(db, asset, &status, &location, user_id).await?;

        Self::find(db, asset.id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Clear the assignment. Without an override the status becomes
    /// `available`, except retired and archived assets keep theirs.
    pub async fn checkin(
        db: &SqlitePool,
        asset: &Asset,
        opts: &CheckOptions,
        user_id: Option<i64>,
    ) -> Result<Asset, sqlx::Error> {
        let status = match opts.status {
            Some(s) => s.to_string(),
            None => match asset.status_enum() {
                Some(AssetStatus::Retired) | Some(AssetStatus::Archived) => asset.status.clone(),
                _ => AssetStatus::Available.to_string(),
            },
        };
        let location = opts.location_override().or(asset.location.clone());
        let now = now_timestamp();

        sqlx::query(
            r#"
            UPDATE assets
            SET assigned_contact_id = NULL, checkout_date = NULL, expected_checkin_date = NULL,
                last_checkin_date = ?, status = ?, location = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(&status)
        .bind(&location)
        .bind(&now)
        .bind(asset.id)
        .execute(db)
        .await?;

        Self::audit(
            db,
            asset.id,
            user_id,
            AuditChange {
                action: "checkin",
                field: "assigned_contact_id",
                old_value: asset.assigned_contact_id.map(|id| id.to_string()),
                new_value: None,
            },
        )
        .await?;
        Self::audit_side_effects(db, asset, &status, &location, user_id).await?;

        Self::find(db, asset.id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    async fn audit_side_effects(
        db: &SqlitePool,
        before: &Asset,
        status: &str,
        location: &Option<String>,
        user_id: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        if before.status != status {
            Self::audit(
                db,
                before.id,
                user_id,
                AuditChange {
                    action: "status_change",
                    field: "status",
                    old_value: Some(before.status.clone()),
                    new_value: Some(status.to_string()),
                },
            )
            .await?;
        }
        if before.location.as_deref().unwrap_or("") != location.as_deref().unwrap_or("") {
            Self::audit(
                db,
                before.id,
                user_id,
                AuditChange {
                    action: "edit",
                    field: "location",
                    old_value: before.location.clone(),
                    new_value: location.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// Optional overrides for checkout and checkin
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckOptions {
    pub status: Option<AssetStatus>,
    pub location: Option<String>,
    pub expected_checkin_date: Option<String>,
}

impl CheckOptions {
    fn location_override(&self) -> Option<String> {
        self.location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub contact_id: i64,
    #[serde(flatten)]
    pub options: CheckOptions,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct AssetListQuery {
    pub q: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub page: Option<i64>,
    /// 20 (default) or 100
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AssetSearchQuery {
    pub q: Option<String>,
}

/// Create or edit payload; on edit, absent fields are left unchanged
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AssetRequest {
    pub name: Option<String>,
    pub asset_tag: Option<String>,
    pub serial_number: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub condition: Option<String>,
    pub location: Option<String>,
    pub status: Option<String>,
    pub purchase_date: Option<String>,
    pub purchase_cost: Option<f64>,
    pub warranty_expires: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssetDetail {
    #[serde(flatten)]
    pub asset: Asset,
    pub assigned_contact: Option<super::Contact>,
    pub audits: Vec<AssetAudit>,
}

/// Picklist tables backing the asset form dropdowns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicklistKind {
    Categories,
    Manufacturers,
    Conditions,
    Locations,
}

impl PicklistKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "categories" | "category" => Some(Self::Categories),
            "manufacturers" | "manufacturer" => Some(Self::Manufacturers),
            "conditions" | "condition" => Some(Self::Conditions),
            "locations" | "location" => Some(Self::Locations),
            _ => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Categories => "asset_categories",
            Self::Manufacturers => "asset_manufacturers",
            Self::Conditions => "asset_conditions",
            Self::Locations => "asset_locations",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PicklistEntry {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PicklistRequest {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, Contact};

    async fn insert_asset(db: &SqlitePool, status: &str) -> Asset {
        let now = now_timestamp();
        let result = sqlx::query(
            "INSERT INTO assets (name, asset_tag, status, location, created_at, updated_at) VALUES ('Laptop', 'A-100', ?, 'Store room', ?, ?)",
        )
        .bind(status)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await
        .unwrap();
        Asset::find(db, result.last_insert_rowid()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_checkout_then_checkin_toggles_assignment() {
        let db = init_memory().await.unwrap();
        let contact = Contact::upsert_by_email(&db, "sam@example.com", Some("Sam"))
            .await
            .unwrap();
        let asset = insert_asset(&db, "available").await;

        let out = Asset::checkout(&db, &asset, contact.id, &CheckOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(out.assigned_contact_id, Some(contact.id));
        assert_eq!(out.status, "deployed");
        assert!(out.checkout_date.is_some());

        let back = Asset::checkin(&db, &out, &CheckOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(back.assigned_contact_id, None);
        assert_eq!(back.status, "available");
        assert!(back.last_checkin_date.is_some());
        assert!(back.checkout_date.is_none());

        let actions: Vec<String> = Asset::audits(&db, asset.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert!(actions.contains(&"checkout".to_string()));
        assert!(actions.contains(&"checkin".to_string()));
        assert_eq!(actions.iter().filter(|a| *a == "status_change").count(), 2);
    }

    #[tokio::test]
    async fn test_checkin_keeps_retired_and_applies_overrides() {
        let db = init_memory().await.unwrap();
        let retired = insert_asset(&db, "retired").await;
        let back = Asset::checkin(&db, &retired, &CheckOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(back.status, "retired");

        let opts = CheckOptions {
            status: Some(AssetStatus::Maintenance),
            location: Some("Bench".to_string()),
            expected_checkin_date: None,
        };
        let tech = sqlx::query(
            "INSERT INTO users (email, name, password_hash, role) VALUES ('tech@example.com', 'Tech', 'x', 'tech')",
        )
        .execute(&db)
        .await
        .unwrap()
        .last_insert_rowid();
        let back = Asset::checkin(&db, &back, &opts, Some(tech)).await.unwrap();
        assert_eq!(back.status, "maintenance");
        assert_eq!(back.location.as_deref(), Some("Bench"));
        let audits = Asset::audits(&db, back.id).await.unwrap();
        // checkin, status and location rows are attributed to the tech
        assert_eq!(audits.iter().filter(|a| a.user_id == Some(tech)).count(), 3);
    }

    #[tokio::test]
    async fn test_set_status_audits_only_changes() {
        let db = init_memory().await.unwrap();
        let asset = insert_asset(&db, "available").await;
        assert!(!Asset::set_status(&db, &asset, AssetStatus::Available, None).await.unwrap());
        assert!(Asset::set_status(&db, &asset, AssetStatus::Lost, None).await.unwrap());
        let audits = Asset::audits(&db, asset.id).await.unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].new_value.as_deref(), Some("lost"));
    }

    #[test]
    fn test_picklist_kind() {
        assert_eq!(PicklistKind::parse("locations").unwrap().table(), "asset_locations");
        assert!(PicklistKind::parse("colours").is_none());
        assert_eq!(AssetStatus::parse(" Deployed "), Some(AssetStatus::Deployed));
    }
}
