//! Landing page counters and the helpdesk health score.

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::db::{now_timestamp, DbPool};
use crate::engine::health_score::{self, HealthScore};
use crate::AppState;

use super::actor::Actor;
use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct DashboardCounts {
    pub open_total: i64,
    /// Open tickets assigned to the requesting technician; zero when anonymous
    pub my_open: i64,
    pub unassigned: i64,
    pub active_projects: i64,
    pub snoozed: i64,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub counts: DashboardCounts,
    pub health: HealthScore,
}

async fn count(db: &DbPool, sql: &str, bind: Option<&str>) -> Result<i64, sqlx::Error> {
    let mut query = sqlx::query_as::<_, (i64,)>(sql);
    if let Some(value) = bind {
        query = query.bind(value);
    }
    let (n,) = query.fetch_one(db).await?;
    Ok(n)
}

async fn load_counts(db: &DbPool, actor_id: Option<i64>) -> Result<DashboardCounts, sqlx::Error> {
    let now = now_timestamp();
    let my_open = match actor_id {
        Some(id) => {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND assignee_id = ?",
            )
            .bind(id)
            .fetch_one(db)
            .await?;
            n
        }
        None => 0,
    };

    Ok(DashboardCounts {
        open_total: count(db, "SELECT COUNT(*) FROM tickets WHERE status != 'closed'", None).await?,
        my_open,
        unassigned: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND assignee_id IS NULL",
            None,
        )
        .await?,
        active_projects: count(db, "SELECT COUNT(*) FROM projects WHERE status != 'closed'", None)
            .await?,
        snoozed: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND snoozed_until IS NOT NULL AND snoozed_until > ?",
            Some(&now),
        )
        .await?,
    })
}

pub async fn get_dashboard(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Dashboard>, ApiError> {
    let counts = load_counts(&state.db, actor.id()).await?;
    let health =
        health_score::compute(&state.db, Utc::now(), state.config.scheduler.tz()).await?;
    Ok(Json(Dashboard { counts, health }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{actor, insert_user, test_app};
    use chrono::Duration;

    async fn insert_ticket(
        db: &DbPool,
        status: &str,
        assignee: Option<i64>,
        snoozed_until: Option<String>,
    ) {
        let now = now_timestamp();
        sqlx::query(
            "INSERT INTO tickets (subject, status, assignee_id, snoozed_until, created_at, updated_at) VALUES ('T', ?, ?, ?, ?, ?)",
        )
        .bind(status)
        .bind(assignee)
        .bind(snoozed_until)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_counts() {
        let app = test_app().await;
        let db = &app.state.db;
        let tech = insert_user(&app, "tech@example.com", "Tech", "tech").await;
        let later = crate::db::timestamp(Utc::now() + Duration::days(1));

        insert_ticket(db, "open", Some(tech.id), None).await;
        insert_ticket(db, "in_progress", None, Some(later)).await;
        insert_ticket(db, "closed", Some(tech.id), None).await;
        sqlx::query("INSERT INTO projects (name, status, created_at) VALUES ('Move', 'open', ?)")
            .bind(now_timestamp())
            .execute(db)
            .await
            .unwrap();

        let Json(dashboard) = get_dashboard(State(app.state.clone()), actor(&tech))
            .await
            .unwrap();
        assert_eq!(dashboard.counts.open_total, 2);
        assert_eq!(dashboard.counts.my_open, 1);
        assert_eq!(dashboard.counts.unassigned, 1);
        assert_eq!(dashboard.counts.active_projects, 1);
        assert_eq!(dashboard.counts.snoozed, 1);
        assert!((0..=100).contains(&dashboard.health.score));
    }

    #[tokio::test]
    async fn test_anonymous_has_no_own_tickets() {
        let app = test_app().await;
        let Json(dashboard) = get_dashboard(State(app.state.clone()), Actor(None))
            .await
            .unwrap();
        assert_eq!(dashboard.counts.my_open, 0);
        assert_eq!(dashboard.health.score, 100);
    }
}
