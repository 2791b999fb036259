//! Queue health score shown on the dashboard.
//!
//! Starts at 100 and loses points for work that is going stale:
//!
//! | input                                   | weight |
//! |-----------------------------------------|--------|
//! | overdue (open, high priority, > 48h)    | -10    |
//! | unassigned for more than 24h            | -5     |
//! | open between 7 and 14 days              | -2     |
//! | open more than 14 days                  | -4     |
//! | closed today                            | +2     |
//!
//! The result is clamped to `0..=100`.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::db::timestamp;
use crate::DbPool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthInputs {
    pub overdue: i64,
    pub unassigned_over_24h: i64,
    pub open_7_to_14_days: i64,
    pub open_over_14_days: i64,
    pub closed_today: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthScore {
    pub score: i64,
    pub label: &'static str,
    #[serde(flatten)]
    pub inputs: HealthInputs,
}

impl HealthInputs {
    pub fn score(&self) -> i64 {
        let raw = 100 - 10 * self.overdue - 5 * self.unassigned_over_24h - 2 * self.open_7_to_14_days
            - 4 * self.open_over_14_days
            + 2 * self.closed_today;
        raw.clamp(0, 100)
    }
}

pub fn label(score: i64) -> &'static str {
    match score {
        90..=100 => "excellent",
        75..=89 => "good",
        50..=74 => "fair",
        _ => "poor",
    }
}

/// Start of the local day containing `now`, in UTC
fn start_of_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_midnight = now.with_timezone(&tz).date_naive().and_time(NaiveTime::MIN);
    tz.from_local_datetime(&local_midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now - Duration::hours(24))
}

async fn count(db: &DbPool, sql: &str, binds: &[&str]) -> Result<i64> {
    let mut query = sqlx::query_as::<_, (i64,)>(sql);
    for value in binds {
        query = query.bind(*value);
    }
    let (n,) = query.fetch_one(db).await?;
    Ok(n)
}

pub async fn load_inputs(db: &DbPool, now: DateTime<Utc>, tz: Tz) -> Result<HealthInputs> {
    let h24 = timestamp(now - Duration::hours(24));
    let h48 = timestamp(now - Duration::hours(48));
    let d7 = timestamp(now - Duration::days(7));
    let d14 = timestamp(now - Duration::days(14));
    let today = timestamp(start_of_day(now, tz));

    Ok(HealthInputs {
        overdue: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND priority = 'high' AND created_at < ?",
            &[&h48],
        )
        .await?,
        unassigned_over_24h: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND assignee_id IS NULL AND created_at < ?",
            &[&h24],
        )
        .await?,
        open_7_to_14_days: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND created_at < ? AND created_at >= ?",
            &[&d7, &d14],
        )
        .await?,
        open_over_14_days: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status != 'closed' AND created_at < ?",
            &[&d14],
        )
        .await?,
        closed_today: count(
            db,
            "SELECT COUNT(*) FROM tickets WHERE status = 'closed' AND closed_at >= ?",
            &[&today],
        )
        .await?,
    })
}

pub async fn compute(db: &DbPool, now: DateTime<Utc>, tz: Tz) -> Result<HealthScore> {
    let inputs = load_inputs(db, now, tz).await?;
    let score = inputs.score();
    Ok(HealthScore {
        score,
        label: label(score),
        inputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[test]
    fn test_score_weights_and_clamp() {
        assert_eq!(HealthInputs::default().score(), 100);
        let inputs = HealthInputs {
            overdue: 1,
            unassigned_over_24h: 2,
            open_7_to_14_days: 1,
            open_over_14_days: 1,
            closed_today: 3,
        };
        assert_eq!(inputs.score(), 100 - 10 - 10 - 2 - 4 + 6);
        let bad = HealthInputs {
            overdue: 20,
            ..Default::default()
        };
        assert_eq!(bad.score(), 0);
        let busy_day = HealthInputs {
            closed_today: 10,
            ..Default::default()
        };
        assert_eq!(busy_day.score(), 100);
    }

    #[test]
    fn test_labels() {
        assert_eq!(label(100), "excellent");
        assert_eq!(label(80), "good");
        assert_eq!(label(60), "fair");
        assert_eq!(label(10), "poor");
    }

    #[tokio::test]
    async fn test_load_inputs_from_tickets() {
        let db = init_memory().await.unwrap();
        let now = Utc::now();
        let insert = |created: DateTime<Utc>, status: &'static str, priority: &'static str| {
            let db = db.clone();
            async move {
                let created = timestamp(created);
                let closed = (status == "closed").then(|| timestamp(now));
                sqlx::query(
                    "INSERT INTO tickets (subject, status, priority, created_at, updated_at, closed_at) VALUES ('t', ?, ?, ?, ?, ?)",
                )
                .bind(status)
                .bind(priority)
                .bind(&created)
                .bind(&created)
                .bind(closed)
                .execute(&db)
                .await
                .unwrap();
            }
        };
        insert(now - Duration::hours(50), "open", "high").await;
        insert(now - Duration::days(10), "open", "low").await;
        insert(now - Duration::days(20), "in_progress", "medium").await;
        insert(now - Duration::hours(1), "open", "medium").await;
        insert(now - Duration::days(3), "closed", "medium").await;

        let inputs = load_inputs(&db, now, chrono_tz::UTC).await.unwrap();
        assert_eq!(inputs.overdue, 1);
        assert_eq!(inputs.unassigned_over_24h, 3);
        assert_eq!(inputs.open_7_to_14_days, 1);
        assert_eq!(inputs.open_over_14_days, 1);
        assert_eq!(inputs.closed_today, 1);
    }
}
