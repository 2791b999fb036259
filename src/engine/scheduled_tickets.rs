//! Creates tickets from recurring definitions.
//!
//! Runs once a minute. A definition fires when its `HH:MM` matches the
//! current minute in the scheduler timezone and the weekday or day of month
//! lines up. `last_run_at` guards against double runs inside one minute.

use anyhow::Result;
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::db::{
    NewTicket, Priority, ScheduledTicket, Ticket, TicketSource, TicketStatus, TicketTask,
    LOCAL_FORMAT,
};
use crate::DbPool;

#[derive(Debug, Default)]
pub struct ScheduleStats {
    pub checked: usize,
    pub created: usize,
    pub failed: usize,
}

/// Current wall-clock time in the scheduler timezone
pub fn local_now(tz: Tz) -> NaiveDateTime {
    Utc::now().with_timezone(&tz).naive_local()
}

/// Create the ticket for one definition and stamp `last_run_at`
pub async fn fire_scheduled_ticket(
    db: &DbPool,
    row: &ScheduledTicket,
    now_local: NaiveDateTime,
) -> Result<Ticket> {
    let mut new = NewTicket::new(row.subject.clone(), TicketSource::Scheduled);
    new.body = row.body.clone();
    new.status = TicketStatus::parse(&row.status).unwrap_or(TicketStatus::Open);
    new.priority = Priority::parse(&row.priority).unwrap_or(Priority::Medium);
    new.assignee_id = row.assignee_id;
    let ticket = Ticket::create(db, &new).await?;

    if let Some(tasks) = row.tasks_text.as_deref() {
        TicketTask::add_lines(db, ticket.id, tasks, None, None).await?;
    }

    sqlx::query("UPDATE scheduled_tickets SET last_run_at = ? WHERE id = ?")
        .bind(now_local.format(LOCAL_FORMAT).to_string())
        .bind(row.id)
        .execute(db)
        .await?;

    info!(schedule_id = row.id, ticket_id = ticket.id, name = %row.name, "Created scheduled ticket");
    Ok(ticket)
}

/// Fire every definition due at `now_local`
pub async fn run_scheduled_tickets(db: &DbPool, now_local: NaiveDateTime) -> Result<ScheduleStats> {
    let mut stats = ScheduleStats::default();
    let rows: Vec<ScheduledTicket> =
        sqlx::query_as("SELECT * FROM scheduled_tickets WHERE active = 1 ORDER BY id")
            .fetch_all(db)
            .await?;

    for row in rows {
        stats.checked += 1;
        if !row.is_due(now_local) || row.ran_recently(now_local) {
            continue;
        }
        match fire_scheduled_ticket(db, &row, now_local).await {
            Ok(_) => stats.created += 1,
            Err(e) => {
                stats.failed += 1;
                error!(schedule_id = row.id, error = %e, "Scheduled ticket failed");
            }
        }
    }

    if stats.created > 0 {
        debug!(checked = stats.checked, created = stats.created, "Scheduled ticket pass complete");
    }
    Ok(stats)
}

pub fn spawn_scheduled_ticket_task(db: DbPool, tz: Tz) {
    info!(timezone = %tz, "Starting scheduled ticket task");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = run_scheduled_tickets(&db, local_now(tz)).await {
                error!(error = %e, "Scheduled ticket run failed");
            }
        }
    });
}
