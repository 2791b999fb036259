//! Field validators for API requests.
//!
//! Each returns the user-facing message on failure; handlers collect them
//! with [`ValidationErrorBuilder`](super::error::ValidationErrorBuilder).

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"^[^@\s]+@[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)+$")
            .unwrap();

    static ref DOMAIN_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)+$"
    )
    .unwrap();

    static ref HHMM_REGEX: Regex = Regex::new(r"^([01]?\d|2[0-3]):[0-5]\d$").unwrap();
}

pub const MAX_NAME_LEN: usize = 200;
pub const MIN_PASSWORD_LEN: usize = 8;

pub fn validate_email(email: &str) -> Result<(), String> {
    let email = email.trim();
    if email.is_empty() {
        return Err("Email is required".to_string());
    }
    if email.len() > 254 {
        return Err("Email is too long (max 254 characters)".to_string());
    }
    if !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email format".to_string());
    }
    Ok(())
}

/// Required display name or label
pub fn validate_name(value: &str, field: &str) -> Result<(), String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{} is required", field));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(format!("{} is too long (max {} characters)", field, MAX_NAME_LEN));
    }
    Ok(())
}

/// Mail domain for the allow-list, e.g. `example.com`
pub fn validate_domain(domain: &str) -> Result<(), String> {
    let domain = domain.trim().trim_start_matches('@');
    if domain.is_empty() {
        return Err("Domain is required".to_string());
    }
    if domain.len() > 253 {
        return Err("Domain is too long (max 253 characters)".to_string());
    }
    if !DOMAIN_REGEX.is_match(domain) {
        return Err("Invalid domain format".to_string());
    }
    Ok(())
}

/// Optional link; empty means unset
pub fn validate_url(url: &Option<String>) -> Result<(), String> {
    match url.as_deref().map(str::trim) {
        None | Some("") => Ok(()),
        Some(u) if u.starts_with("http://") || u.starts_with("https://") => {
            if u.len() > 2048 {
                Err("URL is too long (max 2048 characters)".to_string())
            } else {
                Ok(())
            }
        }
        Some(_) => Err("URL must start with http:// or https://".to_string()),
    }
}

pub fn validate_hhmm(value: &str) -> Result<(), String> {
    if HHMM_REGEX.is_match(value.trim()) {
        Ok(())
    } else {
        Err("Time must be HH:MM (24-hour)".to_string())
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| "Date must be YYYY-MM-DD".to_string())
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    Ok(())
}
