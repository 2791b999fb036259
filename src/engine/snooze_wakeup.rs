//! Wakes snoozed tickets once their snooze time has passed.

use anyhow::Result;
use std::sync::Arc;
use tokio::time::{interval, Duration};

use super::ingest::escape_html;
use crate::db::{now_timestamp, Ticket, TicketNote, User};
use crate::notifications::{notify, OutgoingMail, Outbox};
use crate::DbPool;

pub const WAKE_NOTE: &str = "<em>System:</em> Ticket woke from snooze.";

#[derive(Debug, Default)]
pub struct WakeupStats {
    pub woken: usize,
    pub emailed: usize,
}

pub async fn run_snooze_wakeup(db: &DbPool, outbox: &dyn Outbox) -> Result<WakeupStats> {
    let mut stats = WakeupStats::default();
    let due: Vec<Ticket> = sqlx::query_as(
        "SELECT * FROM tickets WHERE snoozed_until IS NOT NULL AND snoozed_until <= ? ORDER BY id",
    )
    .bind(now_timestamp())
    .fetch_all(db)
    .await?;

    if due.is_empty() {
        return Ok(stats);
    }

    for ticket in &due {
        TicketNote::create(db, ticket.id, None, WAKE_NOTE, true).await?;
        sqlx::query("UPDATE tickets SET snoozed_until = NULL WHERE id = ?")
            .bind(ticket.id)
            .execute(db)
            .await?;
        stats.woken += 1;

        let Some(assignee_id) = ticket.assignee_id else {
            continue;
        };
        let Some(tech) = User::find(db, assignee_id).await? else {
            continue;
        };
        let requester = ticket
            .requester_name
            .as_deref()
            .or(ticket.requester_email.as_deref())
            .or(ticket.requester.as_deref())
            .unwrap_or("Requester");
        let body = format!(
            "<p><strong>Ticket #{}</strong>: {}</p>\n<p><strong>From:</strong> {}</p>\n<p>This ticket has automatically woken from snooze and is visible again.</p>",
            ticket.id,
            escape_html(&ticket.subject),
            escape_html(requester)
        );
        let mail = OutgoingMail::new(
            tech.email.clone(),
            format!("Ticket #{} is active again", ticket.id),
            body,
        )
        .to_name(tech.name.as_deref());
        if notify(outbox, mail).await {
            stats.emailed += 1;
        }
    }

    tracing::info!(woken = stats.woken, emailed = stats.emailed, "Processed snooze wake-ups");
    Ok(stats)
}

pub fn spawn_snooze_wakeup_task(db: DbPool, outbox: Arc<dyn Outbox>, interval_secs: u64) {
    tracing::info!(interval_secs = interval_secs, "Starting snooze wake-up task");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = run_snooze_wakeup(&db, outbox.as_ref()).await {
                tracing::error!(error = %e, "Snooze wake-up failed");
            }
        }
    });
}
