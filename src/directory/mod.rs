//! Active Directory lookups for the password expiry check.
//!
//! [`Directory`] is what the check needs from AD; [`LdapDirectory`] is the
//! ldap3 implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::crypto::SettingsKey;
use crate::db::Setting;
use crate::DbPool;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// userAccountControl DONT_EXPIRE_PASSWORD
pub const UAC_DONT_EXPIRE_PASSWORD: i64 = 0x10000;
/// 100ns FILETIME ticks per day
const TICKS_PER_DAY: f64 = 10_000_000.0 * 60.0 * 60.0 * 24.0;
pub const DEFAULT_MAX_PASSWORD_AGE_DAYS: f64 = 90.0;

#[derive(Debug, Clone)]
pub struct AdSettings {
    pub server: String,
    pub port: u16,
    pub use_ssl: bool,
    pub start_tls: bool,
    pub base_dn: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub warning_days: i64,
}

impl AdSettings {
    pub async fn load(db: &DbPool, key: Option<&SettingsKey>) -> Result<Self> {
        Ok(Self {
            server: Setting::get_or(db, "AD_SERVER", "").await?,
            port: Setting::get_or(db, "AD_PORT", "389").await?.parse().unwrap_or(389),
            use_ssl: Setting::get_bool(db, "AD_USE_SSL", false).await?,
            start_tls: Setting::get_bool(db, "AD_START_TLS", false).await?,
            base_dn: Setting::get_or(db, "AD_BASE_DN", "").await?,
            bind_dn: Setting::get_or(db, "AD_BIND_DN", "").await?,
            bind_password: Setting::get_secret(db, "AD_BIND_PASSWORD", key).await?,
            warning_days: Setting::get_i64(db, "AD_PWD_WARNING_DAYS", 14).await?,
        })
    }

    pub fn url(&self) -> String {
        if self.server.contains("://") {
            return self.server.clone();
        }
        let scheme = if self.use_ssl { "ldaps" } else { "ldap" };
        format!("{}://{}:{}", scheme, self.server, self.port)
    }
}

/// The attributes of an AD user the expiry check reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdAccount {
    pub username: Option<String>,
    pub user_account_control: i64,
    /// Raw FILETIME; `None` or 0 when never set
    pub pwd_last_set: Option<i64>,
}

impl AdAccount {
    pub fn password_never_expires(&self) -> bool {
        self.user_account_control & UAC_DONT_EXPIRE_PASSWORD != 0
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Domain `maxPwdAge` in days, when readable
    async fn max_password_age_days(&self) -> Result<Option<f64>>;
    /// First account whose mail, UPN or proxy address matches
    async fn find_account(&self, email: &str) -> Result<Option<AdAccount>>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// FILETIME (100ns ticks since 1601-01-01 UTC) to a UTC timestamp
pub fn filetime_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 {
        return None;
    }
    let epoch = Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).single()?;
    epoch.checked_add_signed(ChronoDuration::microseconds(ticks / 10))
}

/// `maxPwdAge` is a negative tick interval
pub fn max_age_days(raw: i64) -> f64 {
    (raw as f64).abs() / TICKS_PER_DAY
}

/// Whole days from `now` until `expiry`, rounded down
pub fn days_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiry - now).num_seconds().div_euclid(86_400)
}

pub fn account_filter(email: &str) -> String {
    let e = ldap_escape(email);
    format!(
        "(|(mail={e})(userPrincipalName={e})(proxyAddresses=smtp:{e})(proxyAddresses=SMTP:{e}))"
    )
}

pub struct LdapDirectory {
    ldap: Mutex<Ldap>,
    base_dn: String,
}

impl LdapDirectory {
    pub async fn connect(settings: &AdSettings) -> Result<Self> {
        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(CONNECT_TIMEOUT)
            .set_starttls(settings.start_tls && !settings.use_ssl)
            .set_no_tls_verify(true);
        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, &settings.url())
            .await
            .with_context(|| format!("Failed to connect to {}", settings.url()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(error = %e, "LDAP connection error");
            }
        });

        ldap.simple_bind(&settings.bind_dn, &settings.bind_password)
            .await
            .context("LDAP bind failed")?
            .success()
            .context("LDAP bind rejected")?;

        Ok(Self {
            ldap: Mutex::new(ldap),
            base_dn: settings.base_dn.clone(),
        })
    }

    async fn search(&self, filter: &str, attrs: Vec<&str>) -> Result<Vec<SearchEntry>> {
        let mut ldap = self.ldap.lock().await;
        let (entries, _res) = ldap
            .search(&self.base_dn, Scope::Subtree, filter, attrs)
            .await
            .context("LDAP search failed")?
            .success()
            .context("LDAP search rejected")?;
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }
}

fn first_attr(entry: &SearchEntry, name: &str) -> Option<String> {
    entry
        .attrs
        .get(name)
        .and_then(|values| values.first())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl Directory for LdapDirectory {
    async fn max_password_age_days(&self) -> Result<Option<f64>> {
        let entries = self.search("(objectClass=domain)", vec!["maxPwdAge"]).await?;
        Ok(entries
            .first()
            .and_then(|e| first_attr(e, "maxPwdAge"))
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v != 0)
            .map(max_age_days))
    }

    async fn find_account(&self, email: &str) -> Result<Option<AdAccount>> {
        let entries = self
            .search(
                &account_filter(email),
                vec!["sAMAccountName", "pwdLastSet", "userAccountControl", "cn"],
            )
            .await?;
        Ok(entries.first().map(|e| AdAccount {
            username: first_attr(e, "sAMAccountName"),
            user_account_control: first_attr(e, "userAccountControl")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            pwd_last_set: first_attr(e, "pwdLastSet").and_then(|v| v.parse().ok()),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.ldap.lock().await.unbind().await.context("LDAP unbind failed")?;
        Ok(())
    }
}
