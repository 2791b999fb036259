//! Runtime settings. Sensitive values are never returned in clear text.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{SetSettingRequest, Setting};
use crate::AppState;

use super::actor::Actor;
use super::error::ApiError;

const MAX_KEY_LENGTH: usize = 64;

fn validate_key(key: &str) -> Result<(), ApiError> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(ApiError::validation_field(
            "key",
            format!("Key must be 1-{} characters", MAX_KEY_LENGTH),
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ApiError::validation_field(
            "key",
            "Key may only contain uppercase letters, digits and underscores",
        ));
    }
    Ok(())
}

async fn load_setting(state: &AppState, key: &str) -> Result<Setting, ApiError> {
    sqlx::query_as::<_, Setting>("SELECT key, value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Setting not found"))
}

pub async fn list_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Setting>>, ApiError> {
    Ok(Json(Setting::list_masked(&state.db).await?))
}

pub async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Setting>, ApiError> {
    Ok(Json(load_setting(&state, &key).await?.masked()))
}

/// Create or replace a setting. Sensitive keys are encrypted at rest when
/// a secret key is configured.
pub async fn put_setting(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(key): Path<String>,
    Json(req): Json<SetSettingRequest>,
) -> Result<Json<Setting>, ApiError> {
    actor.require_admin("Only admins can change settings")?;
    validate_key(&key)?;

    Setting::store(&state.db, &key, req.value.trim(), state.settings_key.as_ref()).await?;
    tracing::info!(key = %key, "Setting updated");
    Ok(Json(load_setting(&state, &key).await?.masked()))
}

pub async fn delete_setting(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    actor.require_admin("Only admins can change settings")?;
    if !Setting::delete(&state.db, &key).await? {
        return Err(ApiError::not_found("Setting not found"));
    }
    tracing::info!(key = %key, "Setting deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::{actor, insert_user, test_app};

    #[tokio::test]
    async fn test_upsert_then_read_back() {
        let app = test_app().await;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;

        let Json(setting) = put_setting(
            State(app.state.clone()),
            actor(&admin),
            Path("AUTO_BACKUP_TIME".to_string()),
            Json(SetSettingRequest { value: " 22:30 ".to_string() }),
        )
        .await
        .unwrap();
        assert_eq!(setting.value.as_deref(), Some("22:30"));

        let Json(setting) = get_setting(State(app.state.clone()), Path("AUTO_BACKUP_TIME".to_string()))
            .await
            .unwrap();
        assert_eq!(setting.value.as_deref(), Some("22:30"));
    }

    #[tokio::test]
    async fn test_sensitive_values_are_masked() {
        let app = test_app().await;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;
        put_setting(
            State(app.state.clone()),
            actor(&admin),
            Path("FTP_PASS".to_string()),
            Json(SetSettingRequest { value: "hunter2hunter2".to_string() }),
        )
        .await
        .unwrap();

        let Json(settings) = list_settings(State(app.state.clone())).await.unwrap();
        let ftp = settings.iter().find(|s| s.key == "FTP_PASS").unwrap();
        assert_ne!(ftp.value.as_deref(), Some("hunter2hunter2"));
    }

    #[tokio::test]
    async fn test_writes_need_admin_and_valid_key() {
        let app = test_app().await;
        let tech = insert_user(&app, "tech@example.com", "Tech", "tech").await;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;

        let err = put_setting(
            State(app.state.clone()),
            actor(&tech),
            Path("FTP_ENABLED".to_string()),
            Json(SetSettingRequest { value: "1".to_string() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let err = put_setting(
            State(app.state.clone()),
            actor(&admin),
            Path("ftp enabled".to_string()),
            Json(SetSettingRequest { value: "1".to_string() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = delete_setting(State(app.state.clone()), actor(&admin), Path("MISSING".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
