use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::db::{
    like_pattern, now_timestamp, Asset, Contact, CreateContactRequest, Recipient, Ticket,
    UpdateContactRequest, User,
};
use crate::AppState;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_url};

const LIST_LIMIT: usize = 500;
const RECIPIENT_LIMIT: usize = 20;

#[derive(Debug, Deserialize, Default)]
pub struct ContactListQuery {
    pub q: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Serialize)]
pub struct ContactDetail {
    #[serde(flatten)]
    pub contact: Contact,
    pub tickets: Vec<Ticket>,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RecipientQuery {
    pub q: Option<String>,
}

fn validate_links(
    errors: &mut ValidationErrorBuilder,
    inventory_url: &Option<String>,
    ninja_url: &Option<String>,
) {
    if let Err(e) = validate_url(inventory_url) {
        errors.add("inventory_url", e);
    }
    if let Err(e) = validate_url(ninja_url) {
        errors.add("ninja_url", e);
    }
}

fn blank_to_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn load_contact(state: &AppState, id: i64) -> Result<Contact, ApiError> {
    Contact::find(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Contact not found"))
}

/// Contacts sorted by first name
pub async fn list_contacts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactListQuery>,
) -> Result<Json<Vec<Contact>>, ApiError> {
    let search = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(like_pattern)
        .unwrap_or_default();

    let mut contacts: Vec<Contact> = sqlx::query_as(
        r#"
        SELECT * FROM contacts
        WHERE (?1 OR archived = 0)
          AND (?2 = '' OR lower(coalesce(name, '')) LIKE ?2 OR lower(email) LIKE ?2)
        "#,
    )
    .bind(query.include_archived)
    .bind(&search)
    .fetch_all(&state.db)
    .await?;

    contacts.sort_by_cached_key(|c| {
        (
            c.first_name_key(),
            c.name.as_deref().unwrap_or("").to_lowercase(),
            c.email.clone(),
        )
    });
    contacts.truncate(LIST_LIMIT);
    Ok(Json(contacts))
}

pub async fn create_contact(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateContactRequest>,
) -> Result<(StatusCode, Json<Contact>), ApiError> {
    let email = req.email.trim().to_lowercase();
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_email(&email) {
        errors.add("email", e);
    }
    validate_links(&mut errors, &req.inventory_url, &req.ninja_url);
    errors.finish()?;

    if Contact::find_by_email(&state.db, &email).await?.is_some() {
        return Err(ApiError::conflict("A contact with that email already exists."));
    }

    let result = sqlx::query(
        r#"
        INSERT INTO contacts (name, email, notes, inventory_url, ninja_url, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(blank_to_none(req.name.as_deref()))
    .bind(&email)
    .bind(&req.notes)
    .bind(blank_to_none(req.inventory_url.as_deref()))
    .bind(blank_to_none(req.ninja_url.as_deref()))
    .bind(now_timestamp())
    .execute(&state.db)
    .await?;

    let contact = load_contact(&state, result.last_insert_rowid()).await?;
    tracing::info!(contact_id = contact.id, "Contact created");
    Ok((StatusCode::CREATED, Json(contact)))
}

/// Contact with their tickets and the assets they hold
pub async fn get_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ContactDetail>, ApiError> {
    let contact = load_contact(&state, id).await?;
    let tickets: Vec<Ticket> = sqlx::query_as(
        r#"
        SELECT * FROM tickets
        WHERE lower(requester_email) = ?1 OR (?2 IS NOT NULL AND requester_name = ?2)
        ORDER BY created_at DESC, id DESC
        "#,
    )
    .bind(&contact.email)
    .bind(&contact.name)
    .fetch_all(&state.db)
    .await?;
    let assets: Vec<Asset> =
        sqlx::query_as("SELECT * FROM assets WHERE assigned_contact_id = ? ORDER BY name")
            .bind(id)
            .fetch_all(&state.db)
            .await?;
    Ok(Json(ContactDetail {
        contact,
        tickets,
        assets,
    }))
}

pub async fn update_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateContactRequest>,
) -> Result<Json<Contact>, ApiError> {
    let contact = load_contact(&state, id).await?;
    let email = req
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .unwrap_or_else(|| contact.email.clone());

    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_email(&email) {
        errors.add("email", e);
    }
    validate_links(&mut errors, &req.inventory_url, &req.ninja_url);
    errors.finish()?;

    if let Some(other) = Contact::find_by_email(&state.db, &email).await? {
        if other.id != id {
            return Err(ApiError::conflict("Another contact already uses that email."));
        }
    }

    let name = match &req.name {
        Some(name) => blank_to_none(Some(name)),
        None => contact.name.clone(),
    };
    let inventory_url = match &req.inventory_url {
        Some(url) => blank_to_none(Some(url)),
        None => contact.inventory_url.clone(),
    };
    let ninja_url = match &req.ninja_url {
        Some(url) => blank_to_none(Some(url)),
        None => contact.ninja_url.clone(),
    };

    sqlx::query(
        r#"
        UPDATE contacts
        SET name = ?, email = ?, notes = ?, inventory_url = ?, ninja_url = ?, archived = ?
        WHERE id = ?
        "#,
    )
    .bind(name)
    .bind(&email)
    .bind(req.notes.clone().or(contact.notes.clone()))
    .bind(inventory_url)
    .bind(ninja_url)
    .bind(req.archived.unwrap_or(contact.archived))
    .bind(id)
    .execute(&state.db)
    .await?;

    Ok(Json(load_contact(&state, id).await?))
}

/// Delete a contact; tickets keep their requester fields
pub async fn delete_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    load_contact(&state, id).await?;
    let (held,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM assets WHERE assigned_contact_id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await?;
    if held > 0 {
        return Err(ApiError::conflict(format!(
            "Cannot delete: contact has {} asset(s) checked out. Check them in first.",
            held
        )));
    }

    sqlx::query("DELETE FROM contacts WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;
    tracing::info!(contact_id = id, "Contact deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Contacts then techs matching `q`, one entry per address
pub async fn search_recipients(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecipientQuery>,
) -> Result<Json<Vec<Recipient>>, ApiError> {
    let q = query.q.as_deref().map(str::trim).unwrap_or("");
    if q.is_empty() {
        return Ok(Json(Vec::new()));
    }
    let pattern = like_pattern(q);

    let contacts: Vec<Contact> = sqlx::query_as(
        r#"
        SELECT * FROM contacts
        WHERE lower(coalesce(name, '')) LIKE ?1 OR lower(email) LIKE ?1
        ORDER BY lower(coalesce(name, email))
        LIMIT 10
        "#,
    )
    .bind(&pattern)
    .fetch_all(&state.db)
    .await?;
    let users: Vec<User> = sqlx::query_as(
        r#"
        SELECT * FROM users
        WHERE lower(coalesce(name, '')) LIKE ?1 OR lower(email) LIKE ?1
        ORDER BY lower(coalesce(name, email))
        LIMIT 10
        "#,
    )
    .bind(&pattern)
    .fetch_all(&state.db)
    .await?;

    let candidates = contacts
        .into_iter()
        .map(|c| (c.name, c.email, "contact"))
        .chain(users.into_iter().map(|u| (u.name, u.email, "user")));

    let mut seen = HashSet::new();
    let mut results = Vec::new();
    for (name, email, kind) in candidates {
        if email.trim().is_empty() || !seen.insert(email.to_lowercase()) {
            continue;
        }
        results.push(Recipient {
            name: name.filter(|n| !n.trim().is_empty()).or_else(|| Some(email.clone())),
            email,
            kind,
        });
    }
    results.truncate(RECIPIENT_LIMIT);
    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::api::test_support::{insert_asset, insert_user, test_app};
    use crate::db::CheckOptions;

    fn new_contact(email: &str, name: Option<&str>) -> CreateContactRequest {
        CreateContactRequest {
            email: email.to_string(),
            name: name.map(str::to_string),
            notes: None,
            inventory_url: None,
            ninja_url: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_list_by_first_name() {
        let app = test_app().await;
        for (email, name) in [
            ("zed@example.com", Some("Zed Adams")),
            ("amy@example.com", Some("Amy Zimmer")),
            ("mo@example.com", None),
        ] {
            create_contact(State(app.state.clone()), Json(new_contact(email, name)))
                .await
                .unwrap();
        }

        let err = create_contact(
            State(app.state.clone()),
            Json(new_contact("AMY@example.com", None)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let Json(all) = list_contacts(State(app.state.clone()), Query(ContactListQuery::default()))
            .await
            .unwrap();
        let emails: Vec<_> = all.iter().map(|c| c.email.as_str()).collect();
        assert_eq!(emails, vec!["amy@example.com", "mo@example.com", "zed@example.com"]);

        let Json(found) = list_contacts(
            State(app.state.clone()),
            Query(ContactListQuery {
                q: Some("ADAMS".to_string()),
                include_archived: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "zed@example.com");
    }

    #[tokio::test]
    async fn test_update_rejects_taken_email() {
        let app = test_app().await;
        let (_, Json(a)) = create_contact(State(app.state.clone()), Json(new_contact("a@example.com", None)))
            .await
            .unwrap();
        create_contact(State(app.state.clone()), Json(new_contact("b@example.com", None)))
            .await
            .unwrap();

        let err = update_contact(
            State(app.state.clone()),
            Path(a.id),
            Json(UpdateContactRequest {
                email: Some("b@example.com".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let Json(updated) = update_contact(
            State(app.state.clone()),
            Path(a.id),
            Json(UpdateContactRequest {
                name: Some("Alex Ample".to_string()),
                ninja_url: Some("https://ninja.example.com/device/9".to_string()),
                archived: Some(true),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.name.as_deref(), Some("Alex Ample"));
        assert!(updated.archived);

        let Json(active) = list_contacts(State(app.state.clone()), Query(ContactListQuery::default()))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_blocked_by_checked_out_assets() {
        let app = test_app().await;
        let (_, Json(c)) = create_contact(State(app.state.clone()), Json(new_contact("c@example.com", None)))
            .await
            .unwrap();
        let asset = insert_asset(&app, "Laptop", "L-1").await;
        let asset = Asset::checkout(&app.state.db, &asset, c.id, &CheckOptions::default(), None)
            .await
            .unwrap();

        let Json(detail) = get_contact(State(app.state.clone()), Path(c.id)).await.unwrap();
        assert_eq!(detail.assets.len(), 1);

        let err = delete_contact(State(app.state.clone()), Path(c.id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert!(err.message().contains("1 asset(s)"));

        Asset::checkin(&app.state.db, &asset, &CheckOptions::default(), None)
            .await
            .unwrap();
        let status = delete_contact(State(app.state.clone()), Path(c.id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_recipients_dedupe_across_contacts_and_techs() {
        let app = test_app().await;
        Contact::upsert_by_email(&app.state.db, "sam@example.com", Some("Sam Jones"))
            .await
            .unwrap();
        insert_user(&app, "SAM@example.com", "Sam Tech", "tech").await;
        insert_user(&app, "samantha@example.com", "", "tech").await;

        let Json(results) = search_recipients(
            State(app.state.clone()),
            Query(RecipientQuery {
                q: Some("sam".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].kind, "contact");
        assert_eq!(results[1].email, "samantha@example.com");
        assert_eq!(results[1].name.as_deref(), Some("samantha@example.com"));

        let Json(empty) = search_recipients(State(app.state.clone()), Query(RecipientQuery::default()))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
