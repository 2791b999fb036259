pub mod ad_password;
pub mod backups;
pub mod email_poll;
pub mod ftp_import;
pub mod health_score;
pub mod ingest;
pub mod scheduled_tickets;
pub mod snooze_wakeup;

pub use ad_password::spawn_password_check_task;
pub use backups::spawn_auto_backup_task;
pub use email_poll::{spawn_email_poll_task, spawn_poll_watchdog_task, EmailPoller};
pub use scheduled_tickets::spawn_scheduled_ticket_task;
pub use snooze_wakeup::spawn_snooze_wakeup_task;

use crate::AppState;
use std::sync::Arc;

/// Seconds between snooze wake-up passes
const SNOOZE_WAKEUP_INTERVAL_SECS: u64 = 60;

/// Start every background job. Each job logs its own failures and keeps
/// running.
pub fn spawn_background_jobs(state: Arc<AppState>) {
    let scheduler = &state.config.scheduler;
    let tz = scheduler.tz();

    spawn_email_poll_task(state.clone());
    spawn_poll_watchdog_task(state.db.clone(), scheduler.watchdog_interval_secs);
    spawn_snooze_wakeup_task(
        state.db.clone(),
        state.outbox.clone(),
        SNOOZE_WAKEUP_INTERVAL_SECS,
    );
    spawn_scheduled_ticket_task(state.db.clone(), tz);
    spawn_auto_backup_task(state.db.clone(), state.config.server.data_dir.clone(), tz);
    spawn_password_check_task(state.db.clone(), state.settings_key.clone(), tz);

    tracing::info!(timezone = %tz, "Background jobs started");
}
