//! Shared fixtures for handler tests.

use std::sync::Arc;
use tempfile::TempDir;

use crate::config::Config;
use crate::db::{init, init_memory, now_timestamp, Asset, User};
use crate::notifications::RecordingOutbox;
use crate::{AppState, DbPool};

use super::actor::Actor;

pub struct TestApp {
    pub state: Arc<AppState>,
    pub outbox: Arc<RecordingOutbox>,
    /// Holds the data and attachment directories for the test's lifetime
    pub dir: TempDir,
}

pub async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db = init_memory().await.unwrap();
    build_app(dir, db)
}

/// Like `test_app`, with the database file inside the data directory.
/// Needed by anything that snapshots the database file.
pub async fn test_app_on_disk() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db = init(dir.path()).await.unwrap();
    build_app(dir, db)
}

fn build_app(dir: TempDir, db: DbPool) -> TestApp {
    let mut config = Config::default();
    config.server.data_dir = dir.path().to_path_buf();
    config.scheduler.enabled = false;
    config.scheduler.timezone = "UTC".to_string();
    let outbox = Arc::new(RecordingOutbox::default());
    let state = AppState::new(config, db).with_outbox(outbox.clone());
    TestApp {
        state: Arc::new(state),
        outbox,
        dir,
    }
}

pub async fn insert_user(app: &TestApp, email: &str, name: &str, role: &str) -> User {
    let result = sqlx::query(
        "INSERT INTO users (email, name, password_hash, role) VALUES (?, ?, 'x', ?)",
    )
    .bind(email)
    .bind(name)
    .bind(role)
    .execute(&app.state.db)
    .await
    .unwrap();
    User::find(&app.state.db, result.last_insert_rowid())
        .await
        .unwrap()
        .unwrap()
}

pub fn actor(user: &User) -> Actor {
    Actor(Some(user.clone()))
}

pub async fn insert_asset(app: &TestApp, name: &str, tag: &str) -> Asset {
    let now = now_timestamp();
    let result = sqlx::query(
        "INSERT INTO assets (name, asset_tag, status, created_at, updated_at) VALUES (?, ?, 'available', ?, ?)",
    )
    .bind(name)
    .bind(tag)
    .bind(&now)
    .bind(&now)
    .execute(&app.state.db)
    .await
    .unwrap();
    Asset::find(&app.state.db, result.last_insert_rowid())
        .await
        .unwrap()
        .unwrap()
}
