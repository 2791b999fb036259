//! On-disk ticket attachment storage.
//!
//! Files live at `<root>/<subdir>/<ticket_id>/<name>`; the path stored on the
//! attachment row is relative to `<root>`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::db::TicketAttachment;
use crate::DbPool;

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
    subdir: String,
}

/// A file written to disk and recorded against a ticket
#[derive(Debug, Clone)]
pub struct SavedAttachment {
    pub path: PathBuf,
    pub record: TicketAttachment,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>, subdir: &str) -> Self {
        let subdir = subdir.replace('\\', "/");
        let subdir = subdir.trim_matches('/');
        Self {
            root: root.into(),
            subdir: if subdir.is_empty() {
                "attachments".to_string()
            } else {
                subdir.to_string()
            },
        }
    }

    pub fn ticket_dir(&self, ticket_id: i64) -> PathBuf {
        self.root.join(&self.subdir).join(ticket_id.to_string())
    }

    /// Absolute path of a stored `static_path`
    pub fn resolve(&self, static_path: &str) -> PathBuf {
        self.root.join(static_path)
    }

    /// Write `bytes` for a ticket without overwriting an existing file and
    /// record the attachment row.
    pub async fn save(
        &self,
        db: &DbPool,
        ticket_id: i64,
        name: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<SavedAttachment> {
        let dir = self.ticket_dir(ticket_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let file_name = sanitize_file_name(name);
        let path = unique_path(&dir, &file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let stored_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(file_name);
        let static_path = format!("{}/{}/{}", self.subdir, ticket_id, stored_name);
        let content_type = content_type
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(&stored_name)
                    .first_or_octet_stream()
                    .to_string()
            });

        let record = TicketAttachment::create(
            db,
            ticket_id,
            &stored_name,
            Some(&content_type),
            &static_path,
            bytes.len() as i64,
        )
        .await?;

        Ok(SavedAttachment { path, record })
    }

    /// Remove the ticket directory if nothing was saved into it
    pub async fn prune_if_empty(&self, ticket_id: i64) {
        let dir = self.ticket_dir(ticket_id);
        let empty = match tokio::fs::read_dir(&dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => false,
        };
        if empty {
            if let Err(e) = tokio::fs::remove_dir(&dir).await {
                tracing::debug!(dir = %dir.display(), error = %e, "Could not remove empty attachment dir");
            }
        }
    }

    /// Delete every stored file for a ticket
    pub async fn remove_ticket(&self, ticket_id: i64) -> Result<()> {
        let dir = self.ticket_dir(ticket_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Strip directory components and characters that are unsafe in file names
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || ":*?\"<>|".contains(c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// `dir/name`, or `dir/stem_1.ext`, `dir/stem_2.ext`... when taken
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{}_{}{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, NewTicket, Ticket, TicketSource};

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\scans\\page 1.pdf"), "page 1.pdf");
        assert_eq!(sanitize_file_name("a:b?.png"), "a_b_.png");
        assert_eq!(sanitize_file_name(""), "attachment");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[test]
    fn test_unique_path_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "scan.pdf");
        assert_eq!(first, dir.path().join("scan.pdf"));
        std::fs::write(&first, b"x").unwrap();
        let second = unique_path(dir.path(), "scan.pdf");
        assert_eq!(second, dir.path().join("scan_1.pdf"));
        std::fs::write(&second, b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "scan.pdf"), dir.path().join("scan_2.pdf"));
    }

    #[tokio::test]
    async fn test_save_records_row_and_prunes() {
        let db = init_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path(), "/attachments/");
        let ticket = Ticket::create(&db, &NewTicket::new("Scan", TicketSource::Manual))
            .await
            .unwrap();

        let a = store.save(&db, ticket.id, "photo.png", None, b"png").await.unwrap();
        let b = store.save(&db, ticket.id, "photo.png", None, b"png2").await.unwrap();
        assert_eq!(a.record.static_path, format!("attachments/{}/photo.png", ticket.id));
        assert_eq!(b.record.filename, "photo_1.png");
        assert_eq!(a.record.content_type.as_deref(), Some("image/png"));
        assert_eq!(b.record.size_bytes, 4);
        assert!(store.resolve(&b.record.static_path).exists());

        store.remove_ticket(ticket.id).await.unwrap();
        assert!(!store.ticket_dir(ticket.id).exists());

        tokio::fs::create_dir_all(store.ticket_dir(99)).await.unwrap();
        store.prune_if_empty(99).await;
        assert!(!store.ticket_dir(99).exists());

        // A directory holding a file stays, a missing one is ignored
        let kept = store.save(&db, ticket.id, "scan.pdf", None, b"%PDF").await.unwrap();
        store.prune_if_empty(ticket.id).await;
        assert!(store.resolve(&kept.record.static_path).exists());
        store.prune_if_empty(12345).await;
    }
}
