//! Technician accounts and the bootstrap administrator.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{CreateUserRequest, DbPool, UpdateUserRequest, User, ROLE_ADMIN, ROLE_TECH};
use crate::AppState;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_password};

const VIEW_PREFS: [&str; 3] = ["any", "me", "me_or_unassigned"];

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

fn hash_or_internal(password: &str) -> Result<String, ApiError> {
    hash_password(password).map_err(|e| {
        tracing::error!(error = %e, "Failed to hash password");
        ApiError::internal("Failed to hash password")
    })
}

fn validate_role(role: &str) -> Result<(), String> {
    if role == ROLE_ADMIN || role == ROLE_TECH {
        Ok(())
    } else {
        Err("Role must be admin or tech".to_string())
    }
}

/// Create the configured administrator when no active admin exists
pub async fn ensure_admin_user(
    db: &DbPool,
    email: Option<&str>,
    password: Option<&str>,
) -> anyhow::Result<()> {
    if User::admin_count(db).await? > 0 {
        return Ok(());
    }
    let (Some(email), Some(password)) = (
        email.map(str::trim).filter(|e| !e.is_empty()),
        password.filter(|p| !p.is_empty()),
    ) else {
        tracing::warn!("No admin account exists; set ADMIN_EMAIL and ADMIN_PASSWORD to create one");
        return Ok(());
    };

    let hash = hash_password(password).map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    let email = email.to_lowercase();
    match User::find_by_email(db, &email).await? {
        Some(existing) => {
            sqlx::query("UPDATE users SET role = 'admin', is_active = 1, password_hash = ? WHERE id = ?")
                .bind(&hash)
                .bind(existing.id)
                .execute(db)
                .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO users (email, name, password_hash, role) VALUES (?, 'Administrator', ?, 'admin')",
            )
            .bind(&email)
            .bind(&hash)
            .execute(db)
            .await?;
        }
    }
    tracing::info!(email = %email, "Bootstrap admin account ready");
    Ok(())
}

async fn load_user(state: &AppState, id: i64) -> Result<User, ApiError> {
    User::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Tech not found"))
}

pub async fn list_techs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<User>>, ApiError> {
    Ok(Json(User::list(&state.db).await?))
}

pub async fn create_tech(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let email = req.email.trim().to_lowercase();
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_email(&email) {
        errors.add("email", e);
    }
    if let Err(e) = validate_password(&req.password) {
        errors.add("password", e);
    }
    if let Err(e) = validate_role(&req.role) {
        errors.add("role", e);
    }
    errors.finish()?;

    if User::find_by_email(&state.db, &email).await?.is_some() {
        return Err(ApiError::conflict("A tech with that email already exists."));
    }

    let hash = hash_or_internal(&req.password)?;
    let result = sqlx::query("INSERT INTO users (email, name, password_hash, role) VALUES (?, ?, ?, ?)")
        .bind(&email)
        .bind(req.name.as_deref().map(str::trim).filter(|n| !n.is_empty()))
        .bind(&hash)
        .bind(&req.role)
        .execute(&state.db)
        .await?;

    let user = load_user(&state, result.last_insert_rowid()).await?;
    tracing::info!(user_id = user.id, role = %user.role, "Tech created");
    Ok((StatusCode::CREATED, Json(user)))
}

/// Losing the last active admin is refused
async fn ensure_other_admin(state: &AppState, user: &User) -> Result<(), ApiError> {
    if user.is_admin() && user.is_active && User::admin_count(&state.db).await? <= 1 {
        return Err(ApiError::conflict("Cannot remove the last administrator."));
    }
    Ok(())
}

pub async fn update_tech(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    let user = load_user(&state, id).await?;
    let email = req
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .unwrap_or_else(|| user.email.clone());
    let role = req.role.clone().unwrap_or_else(|| user.role.clone());
    let is_active = req.is_active.unwrap_or(user.is_active);
    let view_pref = req
        .tickets_view_pref
        .clone()
        .unwrap_or_else(|| user.tickets_view_pref.clone());

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_email(&email) {
        errors.add("email", e);
    }
    if let Err(e) = validate_role(&role) {
        errors.add("role", e);
    }
    if let Some(password) = &req.password {
        if let Err(e) = validate_password(password) {
            errors.add("password", e);
        }
    }
    if !VIEW_PREFS.contains(&view_pref.as_str()) {
        errors.add("tickets_view_pref", "View must be any, me or me_or_unassigned");
    }
    errors.finish()?;

    if role != ROLE_ADMIN || !is_active {
        ensure_other_admin(&state, &user).await?;
    }
    if let Some(other) = User::find_by_email(&state.db, &email).await? {
        if other.id != id {
            return Err(ApiError::conflict("Another tech already uses that email."));
        }
    }

    let password_hash = match &req.password {
        Some(password) => hash_or_internal(password)?,
        None => user.password_hash.clone(),
    };
    let name = match &req.name {
        Some(name) => Some(name.trim().to_string()).filter(|n| !n.is_empty()),
        None => user.name.clone(),
    };

    sqlx::query(
        r#"
        UPDATE users
        SET email = ?, name = ?, password_hash = ?, role = ?, is_active = ?, tickets_view_pref = ?
        WHERE id = ?
        "#,
    )
    .bind(&email)
    .bind(name)
    .bind(&password_hash)
    .bind(&role)
    .bind(is_active)
    .bind(&view_pref)
    .bind(id)
    .execute(&state.db)
    .await?;

    Ok(Json(load_user(&state, id).await?))
}

pub async fn delete_tech(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user = load_user(&state, id).await?;
    ensure_other_admin(&state, &user).await?;
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    tracing::info!(user_id = id, "Tech deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::{insert_user, test_app};

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[tokio::test]
    async fn test_bootstrap_admin_once() {
        let app = test_app().await;
        let db = &app.state.db;
        ensure_admin_user(db, None, None).await.unwrap();
        assert_eq!(User::admin_count(db).await.unwrap(), 0);

        ensure_admin_user(db, Some("Boss@Example.com"), Some("s3cret-pass"))
            .await
            .unwrap();
        let admin = User::find_by_email(db, "boss@example.com").await.unwrap().unwrap();
        assert!(admin.is_admin());
        assert!(verify_password("s3cret-pass", &admin.password_hash));

        // An existing admin is left alone
        ensure_admin_user(db, Some("other@example.com"), Some("whatever1"))
            .await
            .unwrap();
        assert!(User::find_by_email(db, "other@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_validates_and_hashes() {
        let app = test_app().await;
        let err = create_tech(
            State(app.state.clone()),
            Json(CreateUserRequest {
                email: "bad".to_string(),
                name: None,
                password: "short".to_string(),
                role: "owner".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let (status, Json(user)) = create_tech(
            State(app.state.clone()),
            Json(CreateUserRequest {
                email: "Tess@Example.com".to_string(),
                name: Some("Tess".to_string()),
                password: "long enough".to_string(),
                role: "tech".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(user.email, "tess@example.com");
        assert!(verify_password("long enough", &user.password_hash));
    }

    #[tokio::test]
    async fn test_last_admin_is_protected() {
        let app = test_app().await;
        let admin = insert_user(&app, "admin@example.com", "Admin", "admin").await;
        let tech = insert_user(&app, "tech@example.com", "Tech", "tech").await;

        let err = delete_tech(State(app.state.clone()), Path(admin.id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        let err = update_tech(
            State(app.state.clone()),
            Path(admin.id),
            Json(UpdateUserRequest {
                role: Some("tech".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        update_tech(
            State(app.state.clone()),
            Path(tech.id),
            Json(UpdateUserRequest {
                role: Some("admin".to_string()),
                tickets_view_pref: Some("me".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        let status = delete_tech(State(app.state.clone()), Path(admin.id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
