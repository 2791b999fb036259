//! FTP drop folder used by the desktop "HDWish" submission tool.
//!
//! Each submission is a folder holding a `note.txt` and optional screenshots.
//! [`DropFolder`] is the seam the importer works against; [`FtpDropFolder`]
//! talks to a real server through suppaftp's blocking client on the
//! blocking thread pool.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suppaftp::FtpStream;

use crate::crypto::SettingsKey;
use crate::db::Setting;
use crate::DbPool;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Drop folder connection settings
#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub base_dir: String,
    pub subdir: String,
}

impl FtpSettings {
    /// `None` when no host is configured
    pub async fn load(db: &DbPool, key: Option<&SettingsKey>) -> Result<Option<Self>> {
        let host = Setting::get_or(db, "FTP_HOST", "").await?;
        if host.is_empty() {
            return Ok(None);
        }
        let port = Setting::get_or(db, "FTP_PORT", "21").await?.parse().unwrap_or(21);
        Ok(Some(Self {
            host,
            port,
            user: Setting::get_or(db, "FTP_USER", "anonymous").await?,
            password: Setting::get_secret(db, "FTP_PASS", key).await?,
            base_dir: Setting::get_or(db, "FTP_BASE_DIR", "").await?,
            subdir: Setting::get_or(db, "FTP_SUBDIR", "HDWish Data").await?,
        }))
    }

    /// Stable id for a submission folder, used to skip re-imports
    pub fn external_id(&self, folder: &str) -> String {
        let base = self.base_dir.trim_matches('/');
        if base.is_empty() {
            format!("ftp://{}/{}/{}", self.host, self.subdir, folder)
        } else {
            format!("ftp://{}/{}/{}/{}", self.host, base, self.subdir, folder)
        }
    }
}

/// Remote folder of submissions
#[async_trait]
pub trait DropFolder: Send + Sync {
    /// Submission folder names
    async fn list_folders(&self) -> Result<Vec<String>>;
    async fn list_files(&self, folder: &str) -> Result<Vec<String>>;
    async fn read_file(&self, folder: &str, name: &str) -> Result<Vec<u8>>;
    async fn remove_file(&self, folder: &str, name: &str) -> Result<()>;
    /// Remove an (empty) submission folder
    async fn remove_folder(&self, folder: &str) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connected FTP session positioned at `base_dir/subdir`
pub struct FtpDropFolder {
    stream: Arc<Mutex<FtpStream>>,
    root: String,
}

impl FtpDropFolder {
    pub async fn connect(settings: &FtpSettings) -> Result<Self> {
        let settings = settings.clone();
        let (stream, root) = tokio::task::spawn_blocking(move || -> Result<(FtpStream, String)> {
            let addr = std::net::ToSocketAddrs::to_socket_addrs(&(settings.host.as_str(), settings.port))
                .with_context(|| format!("Failed to resolve {}", settings.host))?
                .next()
                .ok_or_else(|| anyhow!("No address for {}", settings.host))?;
            let mut ftp = FtpStream::connect_timeout(addr, CONNECT_TIMEOUT)
                .with_context(|| format!("Failed to connect to {}:{}", settings.host, settings.port))?;
            ftp.login(&settings.user, &settings.password)
                .context("FTP login failed")?;
            let base = settings.base_dir.trim();
            if !base.is_empty() {
                ftp.cwd(base).with_context(|| format!("FTP cwd {} failed", base))?;
            }
            let subdir = settings.subdir.trim();
            if !subdir.is_empty() {
                ftp.cwd(subdir).with_context(|| format!("FTP cwd {} failed", subdir))?;
            }
            let root = ftp.pwd().context("FTP pwd failed")?;
            Ok((ftp, root))
        })
        .await??;

        Ok(Self {
            stream: Arc::new(Mutex::new(stream)),
            root,
        })
    }

    /// Run `op` on the blocking pool with the session at the drop root
    async fn with_stream<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream, &str) -> Result<T> + Send + 'static,
    {
        let stream = self.stream.clone();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = stream
                .lock()
                .map_err(|_| anyhow!("FTP session lock poisoned"))?;
            ftp.cwd(&root).context("FTP cwd to drop root failed")?;
            op(&mut ftp, &root)
        })
        .await?
    }
}

fn base_name(entry: &str) -> String {
    entry.rsplit('/').next().unwrap_or(entry).to_string()
}

#[async_trait]
impl DropFolder for FtpDropFolder {
    async fn list_folders(&self) -> Result<Vec<String>> {
        self.with_stream(|ftp, root| {
            let names = ftp.nlst(None).context("FTP list failed")?;
            let mut folders = Vec::new();
            for name in names.iter().map(|n| base_name(n)) {
                if name.is_empty() || name.contains('.') {
                    continue;
                }
                if ftp.cwd(&name).is_ok() {
                    ftp.cwd(root).context("FTP cwd to drop root failed")?;
                    folders.push(name);
                }
            }
            Ok(folders)
        })
        .await
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<String>> {
        let folder = folder.to_string();
        self.with_stream(move |ftp, _| {
            ftp.cwd(&folder).with_context(|| format!("FTP cwd {} failed", folder))?;
            let names = ftp.nlst(None).context("FTP list failed")?;
            Ok(names.iter().map(|n| base_name(n)).filter(|n| !n.is_empty()).collect())
        })
        .await
    }

    async fn read_file(&self, folder: &str, name: &str) -> Result<Vec<u8>> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.with_stream(move |ftp, _| {
            ftp.cwd(&folder).with_context(|| format!("FTP cwd {} failed", folder))?;
            let buffer = ftp
                .retr_as_buffer(&name)
                .with_context(|| format!("FTP download of {} failed", name))?;
            Ok(buffer.into_inner())
        })
        .await
    }

    async fn remove_file(&self, folder: &str, name: &str) -> Result<()> {
        let (folder, name) = (folder.to_string(), name.to_string());
        self.with_stream(move |ftp, _| {
            ftp.cwd(&folder).with_context(|| format!("FTP cwd {} failed", folder))?;
            ftp.rm(&name).with_context(|| format!("FTP delete of {} failed", name))?;
            Ok(())
        })
        .await
    }

    async fn remove_folder(&self, folder: &str) -> Result<()> {
        let folder = folder.to_string();
        self.with_stream(move |ftp, _| {
            ftp.rmdir(&folder)
                .with_context(|| format!("FTP rmdir {} failed", folder))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.with_stream(|ftp, _| {
            ftp.quit().context("FTP quit failed")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base: &str) -> FtpSettings {
        FtpSettings {
            host: "ftp.example.com".to_string(),
            port: 21,
            user: "anonymous".to_string(),
            password: String::new(),
            base_dir: base.to_string(),
            subdir: "HDWish Data".to_string(),
        }
    }

    #[test]
    fn test_external_id() {
        assert_eq!(
            settings("").external_id("20240501-1"),
            "ftp://ftp.example.com/HDWish Data/20240501-1"
        );
        assert_eq!(
            settings("/uploads/").external_id("x"),
            "ftp://ftp.example.com/uploads/HDWish Data/x"
        );
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("HDWish Data/folder1"), "folder1");
        assert_eq!(base_name("note.txt"), "note.txt");
    }
}
