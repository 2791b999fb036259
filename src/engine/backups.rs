//! Nightly SQLite snapshots with retention.
//!
//! Backups are taken with `VACUUM INTO`, which writes a consistent copy of
//! the live database without blocking the WAL writers for long.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use super::scheduled_tickets::local_now;
use crate::db::{parse_hhmm, NewTicket, Priority, Setting, Ticket, TicketSource};
use crate::DbPool;

const FILE_PREFIX: &str = "helpdesk-autobackup-";
pub const SYSTEM_REQUESTER: &str = "System";
pub const SYSTEM_EMAIL: &str = "system@helpdesk.local";

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    /// Local `HH:MM`
    pub time: String,
    pub dir: PathBuf,
    pub retention: usize,
}

impl BackupSettings {
    pub async fn load(db: &DbPool, data_dir: &Path) -> Result<Self> {
        let dir = Setting::get_or(db, "AUTO_BACKUP_DIR", "").await?;
        let retention = Setting::get_i64(db, "AUTO_BACKUP_RETENTION", 7).await?;
        Ok(Self {
            enabled: Setting::get_bool(db, "AUTO_BACKUP_ENABLED", false).await?,
            time: Setting::get_or(db, "AUTO_BACKUP_TIME", "23:00").await?,
            dir: if dir.is_empty() {
                data_dir.join("backups")
            } else {
                PathBuf::from(dir)
            },
            retention: retention.max(1) as usize,
        })
    }

    /// Whether the backup minute is `now_local`
    pub fn is_due(&self, now_local: NaiveDateTime) -> bool {
        let (hh, mm) = parse_hhmm(&self.time);
        self.enabled && now_local.hour() == hh && now_local.minute() == mm
    }
}

#[derive(Debug, Default, Serialize)]
pub struct BackupStats {
    pub path: Option<PathBuf>,
    pub size_bytes: u64,
    pub pruned: usize,
    pub failed: bool,
}

pub fn backup_file_name(now: DateTime<Utc>) -> String {
    format!("{}{}.db", FILE_PREFIX, now.format("%Y%m%d-%H%M%S"))
}

/// Write a snapshot of the database into `dir`
pub async fn create_backup(db: &DbPool, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;

    let path = dir.join(backup_file_name(Utc::now()));
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        anyhow::bail!("Backup file already exists: {}", path.display());
    }

    sqlx::query("VACUUM INTO ?")
        .bind(path.to_string_lossy().into_owned())
        .execute(db)
        .await
        .with_context(|| format!("VACUUM INTO {} failed", path.display()))?;

    Ok(path)
}

/// Keep the newest `keep` auto-backups in `dir`, deleting the rest
pub async fn prune_backups(dir: &Path, keep: usize) -> Result<usize> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".db") && name.contains("autobackup") {
            names.push(name);
        }
    }

    // Names embed the timestamp, so lexical order is age order
    names.sort_unstable_by(|a, b| b.cmp(a));

    let mut removed = 0;
    for name in names.into_iter().skip(keep) {
        match tokio::fs::remove_file(dir.join(&name)).await {
            Ok(()) => {
                removed += 1;
                debug!(file = %name, "Removed old backup");
            }
            Err(e) => warn!(file = %name, error = %e, "Failed to remove old backup"),
        }
    }
    Ok(removed)
}

/// Take a backup and apply retention. A failure opens a system ticket.
pub async fn run_auto_backup(db: &DbPool, settings: &BackupSettings) -> Result<BackupStats> {
    let mut stats = BackupStats::default();

    match create_backup(db, &settings.dir).await {
        Ok(path) => {
            stats.size_bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            info!(path = %path.display(), size_bytes = stats.size_bytes, "Database backup written");
            stats.path = Some(path);
        }
        Err(e) => {
            error!(error = %e, "Database backup failed");
            stats.failed = true;
            open_failure_ticket(db, &settings.dir, &e).await?;
            return Ok(stats);
        }
    }

    stats.pruned = prune_backups(&settings.dir, settings.retention).await?;
    Ok(stats)
}

async fn open_failure_ticket(db: &DbPool, dir: &Path, err: &anyhow::Error) -> Result<Ticket> {
    let mut new = NewTicket::new("Automatic backup failed", TicketSource::System);
    new.priority = Priority::High;
    new.requester_name = Some(SYSTEM_REQUESTER.to_string());
    new.requester_email = Some(SYSTEM_EMAIL.to_string());
    new.body = Some(format!(
        "<p>The nightly database backup could not be written.</p>\n<p><strong>Directory:</strong> {}</p>\n<p><strong>Error:</strong> {}</p>",
        super::ingest::escape_html(&dir.display().to_string()),
        super::ingest::escape_html(&format!("{:#}", err)),
    ));
    Ok(Ticket::create(db, &new).await?)
}

/// Check once a minute whether the configured backup time has come
pub fn spawn_auto_backup_task(db: DbPool, data_dir: PathBuf, tz: Tz) {
    info!(timezone = %tz, "Starting auto backup task");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_run: Option<NaiveDateTime> = None;

        loop {
            tick.tick().await;
            let now = local_now(tz);
            let settings = match BackupSettings::load(&db, &data_dir).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to load backup settings");
                    continue;
                }
            };
            if !settings.is_due(now) {
                continue;
            }
            if last_run.is_some_and(|last| (now - last).num_seconds() < 60) {
                continue;
            }
            last_run = Some(now);

            if let Err(e) = run_auto_backup(&db, &settings).await {
                error!(error = %e, "Auto backup run failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use chrono::{NaiveDate, TimeZone};

    fn settings(dir: &Path) -> BackupSettings {
        BackupSettings {
            enabled: true,
            time: "23:00".to_string(),
            dir: dir.to_path_buf(),
            retention: 2,
        }
    }

    #[test]
    fn test_file_name() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(backup_file_name(now), "helpdesk-autobackup-20240309-040506.db");
    }

    #[test]
    fn test_is_due() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        let at = |hh, mm| NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(hh, mm, 0).unwrap();
        assert!(s.is_due(at(23, 0)));
        assert!(!s.is_due(at(23, 1)));
        s.enabled = false;
        assert!(!s.is_due(at(23, 0)));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "helpdesk-autobackup-20240101-230000.db",
            "helpdesk-autobackup-20240102-230000.db",
            "helpdesk-autobackup-20240103-230000.db",
            "manual.db",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let removed = prune_backups(dir.path(), 2).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("helpdesk-autobackup-20240101-230000.db").exists());
        assert!(dir.path().join("helpdesk-autobackup-20240103-230000.db").exists());
        assert!(dir.path().join("manual.db").exists());
    }

    #[tokio::test]
    async fn test_backup_writes_snapshot() {
        let data_dir = tempfile::tempdir().unwrap();
        let db = crate::db::init(data_dir.path()).await.unwrap();
        Setting::set(&db, "MARKER", "1").await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let stats = run_auto_backup(&db, &settings(dir.path())).await.unwrap();
        assert!(!stats.failed);
        let path = stats.path.unwrap();
        assert!(path.exists());
        assert!(stats.size_bytes > 0);

        // The snapshot is a complete database
        let copy = sqlx::SqlitePool::connect(&format!("sqlite:{}", path.display()))
            .await
            .unwrap();
        assert_eq!(Setting::get(&copy, "MARKER").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_failure_opens_system_ticket() {
        let db = init_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        // A file where the directory should be
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();

        let stats = run_auto_backup(&db, &settings(&blocked)).await.unwrap();
        assert!(stats.failed);
        let ticket: Ticket = sqlx::query_as("SELECT * FROM tickets WHERE source = 'system'")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(ticket.subject, "Automatic backup failed");
        assert_eq!(ticket.requester_email.as_deref(), Some(SYSTEM_EMAIL));
    }
}
