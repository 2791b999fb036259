//! Mail ingestion filters, the check log and poller controls.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::db::{
    AllowedDomain, DenyFilter, DenyRequest, DomainRequest, EmailCheck, EmailCheckWithEntries,
    EmailLogQuery, PollStatus,
};
use crate::engine::email_poll::{poll_status, PollStats, LOCK_FLAG_KEY};
use crate::engine::EmailPoller;
use crate::AppState;

use super::error::ApiError;
use super::validation::{validate_domain, validate_name};

const DEFAULT_LOG_LIMIT: i64 = 20;
const MAX_LOG_LIMIT: i64 = 100;

pub async fn list_domains(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AllowedDomain>>, ApiError> {
    let domains = sqlx::query_as("SELECT * FROM allowed_domains ORDER BY domain")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(domains))
}

pub async fn add_domain(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DomainRequest>,
) -> Result<(StatusCode, Json<AllowedDomain>), ApiError> {
    let domain = req.domain.trim().trim_start_matches('@').to_lowercase();
    validate_domain(&domain).map_err(|e| ApiError::validation_field("domain", e))?;

    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM allowed_domains WHERE domain = ?")
        .bind(&domain)
        .fetch_optional(&state.db)
        .await?;
    if exists.is_some() {
        return Err(ApiError::conflict("Domain already exists"));
    }

    let result = sqlx::query("INSERT INTO allowed_domains (domain) VALUES (?)")
        .bind(&domain)
        .execute(&state.db)
        .await?;
    tracing::info!(domain = %domain, "Allowed domain added");
    Ok((
        StatusCode::CREATED,
        Json(AllowedDomain {
            id: result.last_insert_rowid(),
            domain,
        }),
    ))
}

pub async fn delete_domain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let result = sqlx::query("DELETE FROM allowed_domains WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Domain not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_deny_filters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DenyFilter>>, ApiError> {
    let filters = sqlx::query_as("SELECT * FROM deny_filters ORDER BY lower(phrase)")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(filters))
}

/// Phrases match sender or subject case-insensitively, so duplicates
/// differing only in case are refused
pub async fn add_deny_filter(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DenyRequest>,
) -> Result<(StatusCode, Json<DenyFilter>), ApiError> {
    let phrase = req.phrase.trim().to_string();
    validate_name(&phrase, "Phrase").map_err(|e| ApiError::validation_field("phrase", e))?;

    let exists: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM deny_filters WHERE lower(phrase) = lower(?)")
            .bind(&phrase)
            .fetch_optional(&state.db)
            .await?;
    if exists.is_some() {
        return Err(ApiError::conflict("Phrase already exists"));
    }

    let result = sqlx::query("INSERT INTO deny_filters (phrase) VALUES (?)")
        .bind(&phrase)
        .execute(&state.db)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DenyFilter {
            id: result.last_insert_rowid(),
            phrase,
        }),
    ))
}

pub async fn delete_deny_filter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let result = sqlx::query("DELETE FROM deny_filters WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Filter not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Most recent poll runs with what happened to each message
pub async fn list_email_checks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EmailLogQuery>,
) -> Result<Json<Vec<EmailCheckWithEntries>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let checks: Vec<EmailCheck> =
        sqlx::query_as("SELECT * FROM email_checks ORDER BY checked_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&state.db)
            .await?;

    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        let entries = EmailCheck::entries(&state.db, check.id).await?;
        results.push(EmailCheckWithEntries { check, entries });
    }
    Ok(Json(results))
}

pub async fn get_poll_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PollStatus>, ApiError> {
    let status = poll_status(&state.db, state.config.scheduler.poll_interval_secs as i64).await?;
    Ok(Json(status))
}

/// Run a poll now. A run already in progress makes this a no-op that
/// reports `skipped`.
pub async fn poll_now(State(state): State<Arc<AppState>>) -> Result<Json<PollStats>, ApiError> {
    let stats = EmailPoller::from_state(&state).run().await?;
    tracing::info!(skipped = stats.skipped, result = %stats.result, "Manual email poll finished");
    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::test_app;
    use crate::db::{EntryAction, Setting};

    #[tokio::test]
    async fn test_domains_normalised_and_unique() {
        let app = test_app().await;
        let (_, Json(domain)) = add_domain(
            State(app.state.clone()),
            Json(DomainRequest { domain: " @Example.COM ".to_string() }),
        )
        .await
        .unwrap();
        assert_eq!(domain.domain, "example.com");

        let err = add_domain(
            State(app.state.clone()),
            Json(DomainRequest { domain: "example.com".to_string() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = add_domain(
            State(app.state.clone()),
            Json(DomainRequest { domain: "not a domain".to_string() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        delete_domain(State(app.state.clone()), Path(domain.id)).await.unwrap();
        let err = delete_domain(State(app.state.clone()), Path(domain.id)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_deny_phrases_case_insensitive() {
        let app = test_app().await;
        add_deny_filter(
            State(app.state.clone()),
            Json(DenyRequest { phrase: "Out of Office".to_string() }),
        )
        .await
        .unwrap();
        let err = add_deny_filter(
            State(app.state.clone()),
            Json(DenyRequest { phrase: "out of office".to_string() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        let Json(filters) = list_deny_filters(State(app.state.clone())).await.unwrap();
        assert_eq!(filters.len(), 1);
    }

    #[tokio::test]
    async fn test_log_lists_newest_first_with_entries() {
        let app = test_app().await;
        let db = &app.state.db;
        let first = EmailCheck::start(db).await.unwrap();
        EmailCheck::log(db, first, "a@example.com", "Printer", EntryAction::NewTicket, None, "")
            .await
            .unwrap();
        let second = EmailCheck::start(db).await.unwrap();
        EmailCheck::set_count(db, second, 0).await.unwrap();

        let Json(checks) = list_email_checks(
            State(app.state.clone()),
            Query(EmailLogQuery { limit: Some(500) }),
        )
        .await
        .unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].check.id, second);
        assert_eq!(checks[1].entries[0].action, "new_ticket");
    }

    #[tokio::test]
    async fn test_poll_status_reads_lock() {
        let app = test_app().await;
        let Json(status) = get_poll_status(State(app.state.clone())).await.unwrap();
        assert!(!status.running);

        Setting::set(&app.state.db, LOCK_FLAG_KEY, "1").await.unwrap();
        let Json(status) = get_poll_status(State(app.state.clone())).await.unwrap();
        assert!(status.running);
    }
}
