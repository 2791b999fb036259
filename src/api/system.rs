//! Service status and on-demand maintenance jobs.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::db::PollStatus;
use crate::engine::ad_password::{run_password_check, PasswordCheckStats};
use crate::engine::backups::{run_auto_backup, BackupSettings, BackupStats};
use crate::engine::email_poll::poll_status;
use crate::AppState;

use super::actor::Actor;
use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct SchedulerInfo {
    pub enabled: bool,
    pub timezone: String,
    pub email_poll: PollStatus,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub version: &'static str,
    pub scheduler: SchedulerInfo,
}

/// Result of an on-demand AD check. `ran` is false when AD is not
/// configured.
#[derive(Debug, Serialize)]
pub struct PasswordCheckResponse {
    pub ran: bool,
    #[serde(flatten)]
    pub stats: PasswordCheckStats,
}

/// GET /api/system
pub async fn get_system_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemInfo>, ApiError> {
    let scheduler = &state.config.scheduler;
    let email_poll = poll_status(&state.db, scheduler.poll_interval_secs as i64).await?;
    Ok(Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION"),
        scheduler: SchedulerInfo {
            enabled: scheduler.enabled,
            timezone: scheduler.tz().to_string(),
            email_poll,
        },
    }))
}

/// POST /api/system/backup
///
/// Runs regardless of `AUTO_BACKUP_ENABLED`; retention still applies.
pub async fn backup_now(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<BackupStats>, ApiError> {
    actor.require_admin("Only admins can run backups")?;
    let settings = BackupSettings::load(&state.db, &state.config.server.data_dir).await?;
    let stats = run_auto_backup(&state.db, &settings).await?;
    if stats.failed {
        return Err(ApiError::internal(
            "Backup failed. A system ticket has been opened with the details.",
        ));
    }
    Ok(Json(stats))
}

/// POST /api/system/ad-password-check
pub async fn password_check_now(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<PasswordCheckResponse>, ApiError> {
    actor.require_admin("Only admins can run the password check")?;
    let result = run_password_check(&state.db, state.settings_key.as_ref(), true)
        .await
        .map_err(|e| ApiError::external(format!("AD password check failed: {}", e)))?;
    Ok(Json(match result {
        Some(stats) => PasswordCheckResponse { ran: true, stats },
        None => PasswordCheckResponse {
            ran: false,
            stats: PasswordCheckStats::default(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::{actor, insert_user, test_app, test_app_on_disk};

    #[tokio::test]
    async fn test_system_info() {
        let app = test_app().await;
        let Json(info) = get_system_info(State(app.state.clone())).await.unwrap();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(!info.scheduler.enabled);
        assert_eq!(info.scheduler.timezone, "UTC");
        assert!(!info.scheduler.email_poll.running);
    }

    #[tokio::test]
    async fn test_backup_now_writes_into_data_dir() {
        let app = test_app_on_disk().await;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;
        let Json(stats) = backup_now(State(app.state.clone()), actor(&admin))
            .await
            .unwrap();
        let path = stats.path.unwrap();
        assert!(path.starts_with(app.dir.path().join("backups")));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_password_check_without_ad_is_skipped() {
        let app = test_app().await;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;
        let tech = insert_user(&app, "tech@example.com", "Tech", "tech").await;

        let err = password_check_now(State(app.state.clone()), actor(&tech))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let Json(result) = password_check_now(State(app.state.clone()), actor(&admin))
            .await
            .unwrap();
        assert!(!result.ran);
    }
}
