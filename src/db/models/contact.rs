//! Contacts: the external people who raise tickets and hold assets.

use serde::{Deserialize, Serialize};
use sqlx::{Acquire, FromRow, Sqlite, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contact {
    pub id: i64,
    pub name: Option<String>,
    pub email: String,
    pub notes: Option<String>,
    pub inventory_url: Option<String>,
    pub ninja_url: Option<String>,
    /// Days until the AD password expires; -1 never expires, -999 not found in AD
    pub password_expires_days: Option<i64>,
    pub password_checked_at: Option<String>,
    pub password_notification_sent_at: Option<String>,
    pub archived: bool,
    pub created_at: String,
}

pub const PASSWORD_NEVER_EXPIRES: i64 = -1;
pub const PASSWORD_NOT_FOUND: i64 = -999;

impl Contact {
    pub async fn find(db: &SqlitePool, id: i64) -> Result<Option<Contact>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM contacts WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub fn find_by_email<'a, 'e, A>(
        db: A,
        email: &'e str,
    ) -> impl std::future::Future<Output = Result<Option<Contact>, sqlx::Error>> + Send + 'e
    where
        A: Acquire<'a, Database = Sqlite> + Send + 'e,
        A::Connection: Send,
        'a: 'e,
    {
        async move {
            let mut conn = db.acquire().await?;
            sqlx::query_as("SELECT * FROM contacts WHERE email = ?")
                .bind(email.trim().to_lowercase())
                .fetch_optional(&mut *conn)
                .await
        }
    }

    /// Find a contact by (lower-cased) email, creating it when missing.
    /// A supplied non-empty name replaces the stored one.
    pub fn upsert_by_email<'a, 'e, A>(
        db: A,
        email: &'e str,
        name: Option<&'e str>,
    ) -> impl std::future::Future<Output = Result<Contact, sqlx::Error>> + Send + 'e
    where
        A: Acquire<'a, Database = Sqlite> + Send + 'e,
        A::Connection: Send,
        'a: 'e,
    {
        async move {
            let mut conn = db.acquire().await?;
            let email = email.trim().to_lowercase();
            let name = name.map(str::trim).filter(|n| !n.is_empty());

            match Self::find_by_email(&mut *conn, &email).await? {
                Some(existing) => {
                    if let Some(name) = name {
                        if existing.name.as_deref() != Some(name) {
                            sqlx::query("UPDATE contacts SET name = ? WHERE id = ?")
                                .bind(name)
                                .bind(existing.id)
                                .execute(&mut *conn)
                                .await?;
                            return Ok(Contact {
                                name: Some(name.to_string()),
                                ..existing
                            });
                        }
                    }
                    Ok(existing)
                }
                None => {
                    let result = sqlx::query(
                        "INSERT INTO contacts (name, email, created_at) VALUES (?, ?, ?)",
                    )
                    .bind(name)
                    .bind(&email)
                    .bind(super::now_timestamp())
                    .execute(&mut *conn)
                    .await?;
                    sqlx::query_as("SELECT * FROM contacts WHERE id = ?")
                        .bind(result.last_insert_rowid())
                        .fetch_one(&mut *conn)
                        .await
                }
            }
        }
    }

    /// Sort key: first word of the name, falling back to the email
    pub fn first_name_key(&self) -> String {
        self.name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or(&self.email)
            .to_lowercase()
    }
}

/// Request to create a contact
#[derive(Debug, Deserialize)]
pub struct CreateContactRequest {
    pub email: String,
    pub name: Option<String>,
    pub notes: Option<String>,
    pub inventory_url: Option<String>,
    pub ninja_url: Option<String>,
}

/// Request to update a contact
#[derive(Debug, Deserialize, Default)]
pub struct UpdateContactRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub notes: Option<String>,
    pub inventory_url: Option<String>,
    pub ninja_url: Option<String>,
    pub archived: Option<bool>,
}

/// A name/email pair offered when addressing mail
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Recipient {
    pub name: Option<String>,
    pub email: String,
    pub kind: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[tokio::test]
    async fn test_upsert_lowercases_and_updates_name() {
        let db = init_memory().await.unwrap();
        let first = Contact::upsert_by_email(&db, "Jane.Doe@Example.com", None)
            .await
            .unwrap();
        assert_eq!(first.email, "jane.doe@example.com");
        assert_eq!(first.name, None);

        let second = Contact::upsert_by_email(&db, "jane.doe@example.com", Some("Jane Doe"))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.name.as_deref(), Some("Jane Doe"));

        let stored = Contact::find(&db, first.id).await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn test_first_name_key() {
        let mut c = Contact {
            id: 1,
            name: Some("Zed Alpha".to_string()),
            email: "b@x.com".to_string(),
            notes: None,
            inventory_url: None,
            ninja_url: None,
            password_expires_days: None,
            password_checked_at: None,
            password_notification_sent_at: None,
            archived: false,
            created_at: String::new(),
        };
        assert_eq!(c.first_name_key(), "zed");
        c.name = None;
        assert_eq!(c.first_name_key(), "b@x.com");
    }
}
