//! Recurring ticket definitions.

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledTicket {
    pub id: i64,
    pub name: String,
    pub subject: String,
    pub body: Option<String>,
    pub status: String,
    pub priority: String,
    pub assignee_id: Option<i64>,
    /// One task per line, copied onto each created ticket
    pub tasks_text: Option<String>,
    /// `daily`, `weekly` or `monthly`
    pub schedule_type: String,
    /// 0 = Monday
    pub day_of_week: Option<i64>,
    pub day_of_month: Option<i64>,
    /// `HH:MM` in the scheduler timezone
    pub schedule_time: String,
    pub active: bool,
    /// Local wall-clock time of the last run
    pub last_run_at: Option<String>,
    pub created_at: String,
}

pub const SCHEDULE_TYPES: &[&str] = &["daily", "weekly", "monthly"];

/// Parse `HH:MM`; anything unparsable means midnight
pub fn parse_hhmm(value: &str) -> (u32, u32) {
    let mut parts = value.trim().splitn(2, ':');
    let hh = parts.next().and_then(|h| h.trim().parse().ok()).unwrap_or(0);
    let mm = parts.next().and_then(|m| m.trim().parse().ok()).unwrap_or(0);
    if hh > 23 || mm > 59 {
        (0, 0)
    } else {
        (hh, mm)
    }
}

impl ScheduledTicket {
    /// Whether this row fires at the given local minute
    pub fn is_due(&self, now_local: NaiveDateTime) -> bool {
        if !self.active {
            return false;
        }
        let (hh, mm) = parse_hhmm(&self.schedule_time);
        if now_local.hour() != hh || now_local.minute() != mm {
            return false;
        }
        match self.schedule_type.as_str() {
            "daily" => true,
            "weekly" => self
                .day_of_week
                .map_or(true, |d| i64::from(now_local.weekday().num_days_from_monday()) == d),
            "monthly" => self
                .day_of_month
                .map_or(true, |d| i64::from(now_local.day()) == d),
            _ => false,
        }
    }

    /// True when the last run is less than a minute away from `now_local`
    pub fn ran_recently(&self, now_local: NaiveDateTime) -> bool {
        self.last_run_at
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, LOCAL_FORMAT).ok())
            .map_or(false, |last| (now_local - last).num_seconds().abs() < 60)
    }
}

/// Stored format of `last_run_at`
pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Deserialize)]
pub struct ScheduledTicketRequest {
    pub name: String,
    pub subject: String,
    pub body: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<i64>,
    pub tasks_text: Option<String>,
    pub schedule_type: String,
    pub day_of_week: Option<i64>,
    pub day_of_month: Option<i64>,
    pub schedule_time: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(schedule_type: &str) -> ScheduledTicket {
        ScheduledTicket {
            id: 1,
            name: "Backups".to_string(),
            subject: "Check backups".to_string(),
            body: None,
            status: "open".to_string(),
            priority: "medium".to_string(),
            assignee_id: None,
            tasks_text: None,
            schedule_type: schedule_type.to_string(),
            day_of_week: None,
            day_of_month: None,
            schedule_time: "08:30".to_string(),
            active: true,
            last_run_at: None,
            created_at: String::new(),
        }
    }

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("08:30"), (8, 30));
        assert_eq!(parse_hhmm("7:5"), (7, 5));
        assert_eq!(parse_hhmm("garbage"), (0, 0));
        assert_eq!(parse_hhmm("25:00"), (0, 0));
    }

    #[test]
    fn test_daily_matches_minute_only() {
        let r = row("daily");
        assert!(r.is_due(at(2024, 5, 1, 8, 30)));
        assert!(!r.is_due(at(2024, 5, 1, 8, 31)));
    }

    #[test]
    fn test_weekly_and_monthly() {
        let mut weekly = row("weekly");
        // 2024-05-06 is a Monday
        weekly.day_of_week = Some(0);
        assert!(weekly.is_due(at(2024, 5, 6, 8, 30)));
        assert!(!weekly.is_due(at(2024, 5, 7, 8, 30)));
        weekly.day_of_week = None;
        assert!(weekly.is_due(at(2024, 5, 7, 8, 30)));

        let mut monthly = row("monthly");
        monthly.day_of_month = Some(15);
        assert!(monthly.is_due(at(2024, 5, 15, 8, 30)));
        assert!(!monthly.is_due(at(2024, 5, 16, 8, 30)));
    }

    #[test]
    fn test_inactive_and_recent_runs() {
        let mut r = row("daily");
        r.active = false;
        assert!(!r.is_due(at(2024, 5, 1, 8, 30)));

        r.last_run_at = Some("2024-05-01 08:30:10".to_string());
        assert!(r.ran_recently(at(2024, 5, 1, 8, 30)));
        assert!(!r.ran_recently(at(2024, 5, 2, 8, 30)));
    }
}
