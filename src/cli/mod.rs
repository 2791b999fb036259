//! Command-line interface.
//!
//! With no subcommand the binary starts the server. Subcommands:
//! - `status` - Ask a running server for its version and poller state
//! - `config check` - Validate the configuration file
//! - `backup` - Write a database backup now
//! - `assets import <file>` / `assets export <file>` - Asset CSV transfer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::AppState;

#[derive(Parser, Debug)]
#[command(name = "helpdesk")]
#[command(author, version, about = "A small-business IT helpdesk", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "helpdesk.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Server URL used by `status`
    #[arg(long, env = "HELPDESK_API_URL", default_value = "http://localhost:5000")]
    pub api_url: String,

    /// Subcommand to run (if none, starts the server)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show server status (version, scheduler, mailbox poller)
    Status,

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Write a database backup and apply retention
    Backup {
        /// Target directory (default: AUTO_BACKUP_DIR or <data_dir>/backups)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Asset inventory CSV transfer
    #[command(subcommand)]
    Assets(AssetsCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

#[derive(Subcommand, Debug)]
pub enum AssetsCommands {
    /// Upsert assets from a CSV file (matched by tag, then serial)
    Import { file: PathBuf },
    /// Write every asset to a CSV file
    Export { file: PathBuf },
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    version: String,
    scheduler: SchedulerInfo,
}

#[derive(Debug, Deserialize)]
struct SchedulerInfo {
    enabled: bool,
    timezone: String,
    email_poll: PollInfo,
}

#[derive(Debug, Deserialize)]
struct PollInfo {
    running: bool,
    started_at: Option<String>,
    last_finished_at: Option<String>,
    last_duration_ms: Option<i64>,
    last_result: Option<String>,
    interval_seconds: i64,
}

fn create_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")
}

/// Run a CLI command. Returns `Ok(false)` when no subcommand was given and
/// the server should start.
pub async fn run_command(cli: &Cli) -> Result<bool> {
    match &cli.command {
        Some(Commands::Status) => cmd_status(cli).await?,
        Some(Commands::Config(ConfigCommands::Check)) => cmd_config_check(cli)?,
        Some(Commands::Backup { dir }) => cmd_backup(cli, dir.as_deref()).await?,
        Some(Commands::Assets(AssetsCommands::Import { file })) => {
            cmd_assets_import(cli, file).await?
        }
        Some(Commands::Assets(AssetsCommands::Export { file })) => {
            cmd_assets_export(cli, file).await?
        }
        None => return Ok(false),
    }
    Ok(true)
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let client = create_client()?;
    let base_url = cli.api_url.trim_end_matches('/');

    println!("Connecting to {}...", base_url);
    let response = client
        .get(format!("{}/api/system", base_url))
        .send()
        .await
        .context("Failed to connect to server. Is the helpdesk running?")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Server returned error {}: {}", status, body);
    }
    let info: SystemInfo = response
        .json()
        .await
        .context("Failed to parse status response")?;

    println!();
    println!("=== Helpdesk Server Status ===");
    println!();
    println!("Version:    v{}", info.version);
    println!(
        "Scheduler:  {} ({})",
        enabled(info.scheduler.enabled),
        info.scheduler.timezone
    );

    let poll = &info.scheduler.email_poll;
    println!();
    println!("Mailbox poller:");
    println!("  Interval:      {}s", poll.interval_seconds);
    if poll.running {
        println!(
            "  State:         running since {}",
            poll.started_at.as_deref().unwrap_or("unknown")
        );
    } else {
        println!("  State:         idle");
    }
    println!(
        "  Last finished: {}",
        poll.last_finished_at.as_deref().unwrap_or("never")
    );
    if let Some(ms) = poll.last_duration_ms {
        println!("  Last duration: {}ms", ms);
    }
    if let Some(result) = &poll.last_result {
        println!("  Last result:   {}", result);
    }
    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

fn cmd_config_check(cli: &Cli) -> Result<()> {
    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!("[!!] Configuration file not found: {}", config_path.display());
        println!();
        println!("A default configuration will be used when starting the server.");
        println!("To create a custom configuration, copy helpdesk.example.toml to helpdesk.toml");
        return Ok(());
    }

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("[!!] Configuration file is invalid!");
            println!();
            println!("Error: {:#}", e);
            anyhow::bail!("Invalid configuration file");
        }
    };

    println!("[OK] Configuration file is valid!");
    println!();
    println!("Server:");
    println!("  Listen:       {}:{}", config.server.host, config.server.port);
    println!("  Data Dir:     {}", config.server.data_dir.display());
    println!("  Attachments:  {}", config.attachments_root().join(&config.attachments.subdir).display());
    println!();
    println!("Scheduler:      {}", enabled(config.scheduler.enabled));
    println!("  Timezone:     {}", config.scheduler.tz());
    println!("  Poll every:   {}s", config.scheduler.poll_interval_secs);
    println!();
    println!("SMTP fallback:  {}", enabled(config.smtp.is_configured()));
    println!();

    let mut warnings = Vec::new();
    if config.security.secret_key.as_deref().map_or(true, str::is_empty) {
        warnings.push("No secret key set - sensitive settings will be stored in plaintext");
    }
    if config.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
        warnings.push("Unknown timezone - falling back to America/Chicago");
    }
    if config.admin.email.is_none() {
        warnings.push("No bootstrap admin configured - the first start will have no admin");
    }
    if !warnings.is_empty() {
        println!("Warnings:");
        for warning in warnings {
            println!("  [!] {}", warning);
        }
        println!();
    }
    Ok(())
}

/// State for offline commands: same database and settings as the server,
/// no background jobs.
async fn open_state(cli: &Cli) -> Result<Arc<AppState>> {
    let config = Config::load(&cli.config)?;
    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data directory: {}",
            config.server.data_dir.display()
        )
    })?;
    let db = crate::db::init(&config.server.data_dir).await?;
    Ok(Arc::new(AppState::new(config, db)))
}

async fn cmd_backup(cli: &Cli, dir: Option<&Path>) -> Result<()> {
    use crate::engine::backups::{run_auto_backup, BackupSettings};

    let state = open_state(cli).await?;
    let mut settings = BackupSettings::load(&state.db, &state.config.server.data_dir).await?;
    if let Some(dir) = dir {
        settings.dir = dir.to_path_buf();
    }
    let stats = run_auto_backup(&state.db, &settings).await?;
    match &stats.path {
        Some(path) => {
            println!("[OK] Backup written to {} ({} bytes)", path.display(), stats.size_bytes);
            if stats.pruned > 0 {
                println!("     Removed {} old backup(s)", stats.pruned);
            }
            Ok(())
        }
        None => anyhow::bail!("Backup failed; a system ticket has been opened"),
    }
}

async fn cmd_assets_import(cli: &Cli, file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let state = open_state(cli).await?;
    let summary = crate::api::assets::import_csv_text(&state, &text).await?;
    println!(
        "[OK] Import complete: {} added, {} updated",
        summary.added, summary.updated
    );
    Ok(())
}

async fn cmd_assets_export(cli: &Cli, file: &Path) -> Result<()> {
    let state = open_state(cli).await?;
    let bytes = crate::api::assets::export_csv_bytes(&state).await?;
    std::fs::write(file, &bytes).with_context(|| format!("Failed to write {}", file.display()))?;
    println!("[OK] Exported assets to {}", file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_starts_server() {
        let cli = Cli::parse_from(["helpdesk"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("helpdesk.toml"));
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["helpdesk", "assets", "import", "inventory.csv"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Assets(AssetsCommands::Import { ref file })) if file == Path::new("inventory.csv")
        ));

        let cli = Cli::parse_from(["helpdesk", "backup", "--dir", "/tmp/b"]);
        assert!(matches!(cli.command, Some(Commands::Backup { dir: Some(_) })));
    }

    #[tokio::test]
    async fn test_config_check_with_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "helpdesk",
            "--config",
            dir.path().join("missing.toml").to_str().unwrap(),
            "config",
            "check",
        ]);
        assert!(run_command(&cli).await.unwrap());
    }
}
