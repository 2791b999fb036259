//! Turns drop-folder submissions into tickets.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::ingest::{is_drop_image, parse_drop_note};
use crate::attachments::AttachmentStore;
use crate::db::{Asset, Contact, EmailCheck, EntryAction, NewTicket, Ticket, TicketSource};
use crate::ftp::{DropFolder, FtpSettings};
use crate::DbPool;

const NOTE_FILE: &str = "note.txt";

/// Import every new submission folder. Returns the number of tickets created.
pub async fn import_drop_folders(
    db: &DbPool,
    store: &AttachmentStore,
    drop: &dyn DropFolder,
    settings: &FtpSettings,
    check_id: i64,
) -> Result<usize> {
    let folders = drop.list_folders().await?;
    let mut created = 0;

    for folder in folders {
        let external_id = settings.external_id(&folder);
        if Ticket::external_id_exists(db, &external_id).await? {
            EmailCheck::log(db, check_id, "", &folder, EntryAction::Duplicate, None, "FTP folder already imported")
                .await?;
            continue;
        }

        let files = drop.list_files(&folder).await?;
        let Some(note_name) = files.iter().find(|f| f.eq_ignore_ascii_case(NOTE_FILE)).cloned() else {
            EmailCheck::log(db, check_id, "", &folder, EntryAction::Skip, None, "No note.txt").await?;
            continue;
        };

        let raw = drop.read_file(&folder, &note_name).await?;
        let note = parse_drop_note(&String::from_utf8_lossy(&raw), &folder);

        let contact = match &note.email {
            Some(email) => Some(Contact::upsert_by_email(db, email, None).await?),
            None => None,
        };
        let asset = match &note.serial {
            Some(serial) => Asset::find_by_serial(db, serial).await?,
            None => None,
        };

        let mut new = NewTicket::new(note.subject.clone(), TicketSource::Ftp);
        new.external_id = Some(external_id);
        new.requester_email = note.email.clone();
        new.requester_name = contact.and_then(|c| c.name);
        new.body = Some(note.body.clone());
        new.asset_id = asset.map(|a| a.id);
        let ticket = Ticket::create(db, &new).await?;

        if let Err(e) = drop.remove_file(&folder, &note_name).await {
            warn!(folder = %folder, error = %e, "Failed to delete note.txt");
        }

        for name in files.iter().filter(|f| is_drop_image(f)) {
            let bytes = match drop.read_file(&folder, name).await {
                Ok(bytes) if !bytes.is_empty() => bytes,
                Ok(_) => continue,
                Err(e) => {
                    warn!(folder = %folder, file = %name, error = %e, "Failed to download image");
                    continue;
                }
            };
            if let Err(e) = store.save(db, ticket.id, name, None, &bytes).await {
                warn!(ticket_id = ticket.id, file = %name, error = %e, "Failed to save image");
                continue;
            }
            if let Err(e) = drop.remove_file(&folder, name).await {
                debug!(folder = %folder, file = %name, error = %e, "Failed to delete image");
            }
        }
        store.prune_if_empty(ticket.id).await;

        EmailCheck::log(
            db,
            check_id,
            note.email.as_deref().unwrap_or(""),
            &note.subject,
            EntryAction::NewTicket,
            Some(ticket.id),
            "FTP import",
        )
        .await?;
        created += 1;
        info!(ticket_id = ticket.id, folder = %folder, "Imported drop folder");

        remove_folder(drop, &folder).await;
    }

    Ok(created)
}

/// Delete leftovers, then the folder itself
async fn remove_folder(drop: &dyn DropFolder, folder: &str) {
    match drop.list_files(folder).await {
        Ok(remaining) => {
            for name in remaining {
                if let Err(e) = drop.remove_file(folder, &name).await {
                    debug!(folder = %folder, file = %name, error = %e, "Failed to delete leftover file");
                }
            }
        }
        Err(e) => debug!(folder = %folder, error = %e, "Failed to list leftovers"),
    }
    if let Err(e) = drop.remove_folder(folder).await {
        warn!(folder = %folder, error = %e, "Failed to remove drop folder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, TicketAttachment};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory drop folder: folder -> file -> bytes
    #[derive(Default)]
    struct MemoryDrop {
        folders: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    }

    impl MemoryDrop {
        fn add(&self, folder: &str, file: &str, bytes: &[u8]) {
            self.folders
                .lock()
                .unwrap()
                .entry(folder.to_string())
                .or_default()
                .insert(file.to_string(), bytes.to_vec());
        }

        fn has_folder(&self, folder: &str) -> bool {
            self.folders.lock().unwrap().contains_key(folder)
        }
    }

    #[async_trait]
    impl DropFolder for MemoryDrop {
        async fn list_folders(&self) -> Result<Vec<String>> {
            Ok(self.folders.lock().unwrap().keys().cloned().collect())
        }
        async fn list_files(&self, folder: &str) -> Result<Vec<String>> {
            let folders = self.folders.lock().unwrap();
            let files = folders.get(folder).ok_or_else(|| anyhow!("no folder"))?;
            Ok(files.keys().cloned().collect())
        }
        async fn read_file(&self, folder: &str, name: &str) -> Result<Vec<u8>> {
            let folders = self.folders.lock().unwrap();
            folders
                .get(folder)
                .and_then(|f| f.get(name))
                .cloned()
                .ok_or_else(|| anyhow!("no file"))
        }
        async fn remove_file(&self, folder: &str, name: &str) -> Result<()> {
            if let Some(files) = self.folders.lock().unwrap().get_mut(folder) {
                files.remove(name);
            }
            Ok(())
        }
        async fn remove_folder(&self, folder: &str) -> Result<()> {
            let mut folders = self.folders.lock().unwrap();
            if folders.get(folder).is_some_and(|f| !f.is_empty()) {
                return Err(anyhow!("folder not empty"));
            }
            folders.remove(folder);
            Ok(())
        }
    }

    fn settings() -> FtpSettings {
        FtpSettings {
            host: "ftp.example.com".to_string(),
            port: 21,
            user: "anonymous".to_string(),
            password: String::new(),
            base_dir: String::new(),
            subdir: "HDWish Data".to_string(),
        }
    }

    #[tokio::test]
    async fn test_import_creates_ticket_and_cleans_up() {
        let db = init_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path(), "attachments");
        sqlx::query("INSERT INTO assets (id, name, serial_number, status, created_at, updated_at) VALUES (5, 'Laptop', 'SN123', 'deployed', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')")
            .execute(&db)
            .await
            .unwrap();

        let drop = MemoryDrop::default();
        drop.add("sub-1", "Note.TXT", b"pat@example.com\nSN123\nMonitor flickers\nsince Monday");
        drop.add("sub-1", "screen.png", b"png");
        drop.add("sub-1", "log.zip", b"zip");
        drop.add("sub-2", "screen.png", b"png");

        let check_id = EmailCheck::start(&db).await.unwrap();
        let created = import_drop_folders(&db, &store, &drop, &settings(), check_id)
            .await
            .unwrap();
        assert_eq!(created, 1);

        let ticket: Ticket = sqlx::query_as("SELECT * FROM tickets WHERE source = 'ftp'")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(ticket.external_id.as_deref(), Some("ftp://ftp.example.com/HDWish Data/sub-1"));
        assert_eq!(ticket.subject, "Monitor flickers");
        assert_eq!(ticket.asset_id, Some(5));
        assert_eq!(ticket.body.as_deref(), Some("Monitor flickers<br>since Monday"));
        assert!(Contact::find_by_email(&db, "pat@example.com").await.unwrap().is_some());

        let files = TicketAttachment::for_ticket(&db, ticket.id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "screen.png");

        // Imported folder is gone, the one without a note stays
        assert!(!drop.has_folder("sub-1"));
        assert!(drop.has_folder("sub-2"));

        let actions: Vec<String> = EmailCheck::entries(&db, check_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["new_ticket".to_string(), "skip".to_string()]);
    }

    #[tokio::test]
    async fn test_already_imported_folder_is_duplicate() {
        let db = init_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(dir.path(), "attachments");
        let mut existing = NewTicket::new("Old", TicketSource::Ftp);
        existing.external_id = Some(settings().external_id("sub-1"));
        Ticket::create(&db, &existing).await.unwrap();

        let drop = MemoryDrop::default();
        drop.add("sub-1", "note.txt", b"pat@example.com");

        let check_id = EmailCheck::start(&db).await.unwrap();
        let created = import_drop_folders(&db, &store, &drop, &settings(), check_id)
            .await
            .unwrap();
        assert_eq!(created, 0);
        let entries = EmailCheck::entries(&db, check_id).await.unwrap();
        assert_eq!(entries[0].action, "duplicate");
        assert_eq!(entries[0].note, "FTP folder already imported");
    }
}
