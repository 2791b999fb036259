//! Common types and helpers shared across models.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Canonical stored timestamp: RFC 3339, UTC, whole seconds (`2024-05-01T13:45:00Z`).
/// The fixed width keeps string comparison in SQL equal to time comparison.
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Parse a stored timestamp, accepting any RFC 3339 offset
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Settings-style boolean: "1", "true", "on", "yes"
pub fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// `%term%` pattern for case-insensitive LIKE searches
pub fn like_pattern(term: &str) -> String {
    format!("%{}%", term.trim().to_lowercase())
}

/// Distinguish an absent field (`None`) from an explicit `null` (`Some(None)`)
pub fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// One page of a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, per_page: i64) -> Self {
        let pages = if per_page > 0 {
            ((total + per_page - 1) / per_page).max(1)
        } else {
            1
        };
        Self {
            items,
            total,
            page,
            per_page,
            pages,
        }
    }
}

/// Clamp a requested page to 1.. and return (page, offset)
pub fn page_offset(page: Option<i64>, per_page: i64) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    (page, (page - 1) * per_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_is_fixed_width() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 13, 45, 0).unwrap();
        assert_eq!(timestamp(dt), "2024-05-01T13:45:00Z");
        assert_eq!(parse_timestamp("2024-05-01T13:45:00Z"), Some(dt));
        assert_eq!(parse_timestamp("2024-05-01T08:45:00-05:00"), Some(dt));
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_truthy() {
        for v in ["1", "true", "ON", " yes "] {
            assert!(truthy(v), "{v}");
        }
        for v in ["0", "", "off", "no", "nope"] {
            assert!(!truthy(v), "{v}");
        }
    }

    #[test]
    fn test_page_math() {
        let page: Page<i32> = Page::new(vec![], 41, 1, 20);
        assert_eq!(page.pages, 3);
        let empty: Page<i32> = Page::new(vec![], 0, 1, 20);
        assert_eq!(empty.pages, 1);
        assert_eq!(page_offset(Some(3), 20), (3, 40));
        assert_eq!(page_offset(Some(-2), 20), (1, 0));
        assert_eq!(page_offset(None, 5), (1, 0));
    }
}
