//! Key/value settings: runtime tunables edited by admins while the service runs.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use super::common::truthy;
use crate::crypto::{self, SettingsKey};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Setting {
    pub key: String,
    pub value: Option<String>,
}

/// Request to write a setting
#[derive(Debug, Deserialize)]
pub struct SetSettingRequest {
    pub value: String,
}

impl Setting {
    /// Raw stored value, if the key exists
    pub async fn get(db: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(db)
                .await?;
        Ok(row.and_then(|(v,)| v))
    }

    /// Stored value, then the environment variable of the same name, then `default`.
    /// Empty values count as unset.
    pub async fn get_or(db: &SqlitePool, key: &str, default: &str) -> Result<String, sqlx::Error> {
        if let Some(value) = Self::get(db, key).await? {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
        Ok(default.to_string())
    }

    pub async fn get_bool(db: &SqlitePool, key: &str, default: bool) -> Result<bool, sqlx::Error> {
        let value = Self::get_or(db, key, if default { "1" } else { "0" }).await?;
        Ok(truthy(&value))
    }

    pub async fn get_i64(db: &SqlitePool, key: &str, default: i64) -> Result<i64, sqlx::Error> {
        let value = Self::get_or(db, key, "").await?;
        Ok(value.parse().unwrap_or(default))
    }

    /// Sensitive value, decrypted. A value that cannot be decrypted reads as empty.
    pub async fn get_secret(
        db: &SqlitePool,
        key: &str,
        cipher: Option<&SettingsKey>,
    ) -> Result<String, sqlx::Error> {
        let value = Self::get_or(db, key, "").await?;
        if !crypto::is_encrypted(&value) {
            return Ok(value);
        }
        match cipher.map(|c| c.decrypt(&value)) {
            Some(Ok(plain)) => Ok(plain),
            Some(Err(e)) => {
                tracing::warn!(key = key, error = %e, "Failed to decrypt setting");
                Ok(String::new())
            }
            None => {
                tracing::warn!(key = key, "Setting is encrypted but no secret key is configured");
                Ok(String::new())
            }
        }
    }

    pub async fn set(db: &SqlitePool, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Write a setting, encrypting sensitive keys when a cipher is available
    pub async fn store(
        db: &SqlitePool,
        key: &str,
        value: &str,
        cipher: Option<&SettingsKey>,
    ) -> anyhow::Result<()> {
        let stored = match cipher {
            Some(c) if crypto::is_sensitive(key) => c.encrypt(value)?,
            _ => value.to_string(),
        };
        Self::set(db, key, &stored).await?;
        Ok(())
    }

    pub async fn delete(db: &SqlitePool, key: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All settings with sensitive values masked
    pub async fn list_masked(db: &SqlitePool) -> Result<Vec<Setting>, sqlx::Error> {
        let rows: Vec<Setting> = sqlx::query_as("SELECT key, value FROM settings ORDER BY key")
            .fetch_all(db)
            .await?;
        Ok(rows.into_iter().map(Setting::masked).collect())
    }

    pub fn masked(self) -> Self {
        if crypto::is_sensitive(&self.key) {
            let value = self.value.as_deref().map(crypto::mask);
            Self { key: self.key, value }
        } else {
            self
        }
    }
}
