pub mod actor;
pub mod assets;
mod checklists;
pub mod contacts;
mod dashboard;
mod documents;
mod email_settings;
pub mod error;
pub mod orders;
mod processes;
mod projects;
mod scheduled;
mod settings;
mod system;
pub mod techs;
pub mod tickets;
mod validation;
mod vendors;

#[cfg(test)]
pub(crate) mod test_support;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Dashboard
        .route("/dashboard", get(dashboard::get_dashboard))
        // Tickets
        .route("/tickets", get(tickets::list_tickets))
        .route("/tickets", post(tickets::create_ticket))
        .route("/tickets/requester-assets", get(tickets::assets_for_requester))
        .route("/tickets/:id", get(tickets::get_ticket))
        .route("/tickets/:id", put(tickets::update_ticket))
        .route("/tickets/:id", delete(tickets::delete_ticket))
        .route("/tickets/:id/snooze", post(tickets::snooze_ticket))
        .route("/tickets/:id/snooze", delete(tickets::unsnooze_ticket))
        .route("/tickets/:id/notes", post(tickets::add_note))
        .route("/tickets/:id/notes/:note_id", put(tickets::edit_note))
        .route("/tickets/:id/notes/:note_id", delete(tickets::delete_note))
        .route("/tickets/:id/notes/:note_id/forward", post(tickets::forward_note))
        .route("/tickets/:id/attachments", get(tickets::list_attachments))
        .route(
            "/tickets/:id/attachments",
            post(tickets::upload_attachments).layer(tickets::upload_limit()),
        )
        .route(
            "/tickets/:id/attachments/:attachment_id",
            get(tickets::download_attachment),
        )
        .route("/tickets/:id/project", post(tickets::merge_into_project))
        .route("/tickets/:id/asset", put(tickets::link_asset))
        .route("/tickets/:id/asset", delete(tickets::unlink_asset))
        .route("/tickets/:id/order-items", get(orders::ticket_order_items))
        // Ticket tasks and attached processes
        .route("/tickets/:id/tasks", post(checklists::add_tasks))
        .route("/tickets/:id/tasks", delete(checklists::delete_all_tasks))
        .route("/tickets/:id/tasks/:task_id", put(checklists::edit_task))
        .route("/tickets/:id/tasks/:task_id", delete(checklists::delete_task))
        .route("/tickets/:id/tasks/:task_id/toggle", post(checklists::toggle_task))
        .route("/tickets/:id/processes", post(checklists::assign_process))
        .route(
            "/tickets/:id/processes/:process_id",
            delete(checklists::delete_process),
        )
        .route(
            "/tickets/:id/processes/:process_id/items/:item_id",
            put(checklists::update_process_item),
        )
        .route(
            "/tickets/:id/processes/:process_id/items/:item_id",
            delete(checklists::delete_process_item),
        )
        // Projects
        .route("/projects", get(projects::list_projects))
        .route("/projects", post(projects::create_project))
        .route("/projects/:id", get(projects::get_project))
        .route("/projects/:id", put(projects::update_project))
        .route("/projects/:id", delete(projects::delete_project))
        .route("/projects/:id/tickets", post(projects::create_project_ticket))
        .route("/projects/:id/reorder", post(projects::reorder_project_tickets))
        .route("/projects/:id/close", post(projects::close_project))
        // Contacts
        .route("/contacts", get(contacts::list_contacts))
        .route("/contacts", post(contacts::create_contact))
        .route("/contacts/recipients", get(contacts::search_recipients))
        .route("/contacts/:id", get(contacts::get_contact))
        .route("/contacts/:id", put(contacts::update_contact))
        .route("/contacts/:id", delete(contacts::delete_contact))
        .route("/contacts/:id/checkin-assets", post(assets::checkin_contact_assets))
        // Techs
        .route("/techs", get(techs::list_techs))
        .route("/techs", post(techs::create_tech))
        .route("/techs/:id", put(techs::update_tech))
        .route("/techs/:id", delete(techs::delete_tech))
        // Assets
        .route("/assets", get(assets::list_assets))
        .route("/assets", post(assets::create_asset))
        .route("/assets/search", get(assets::search_assets))
        .route("/assets/export", get(assets::export_assets))
        .route(
            "/assets/import",
            post(assets::import_assets).layer(tickets::upload_limit()),
        )
        .route("/assets/purge", post(assets::purge_archived))
        .route("/assets/:id", get(assets::get_asset))
        .route("/assets/:id", put(assets::update_asset))
        .route("/assets/:id", delete(assets::delete_asset))
        .route("/assets/:id/status", put(assets::set_asset_status))
        .route("/assets/:id/checkout", post(assets::checkout_asset))
        .route("/assets/:id/checkin", post(assets::checkin_asset))
        .route("/assets/:id/archive", post(assets::archive_asset))
        .route("/picklists", get(assets::all_picklists))
        .route("/picklists/:kind", get(assets::list_picklist))
        .route("/picklists/:kind", post(assets::create_picklist_entry))
        .route("/picklists/:kind/:id", put(assets::rename_picklist_entry))
        .route("/picklists/:kind/:id", delete(assets::delete_picklist_entry))
        // Order items and purchase orders
        .route("/orders/items", get(orders::list_planned_items))
        .route("/orders/items", post(orders::create_item))
        .route("/orders/items/delete", post(orders::delete_selected_items))
        .route("/orders/items/:id", put(orders::update_item))
        .route("/orders/items/:id", delete(orders::delete_item))
        .route("/orders/items/:id/receive", post(orders::receive_item))
        .route("/purchase-orders", get(orders::list_pos))
        .route("/purchase-orders", post(orders::create_po))
        .route("/purchase-orders/:id", get(orders::get_po))
        .route("/purchase-orders/:id", put(orders::update_po_meta))
        .route("/purchase-orders/:id/notes", put(orders::update_po_notes))
        .route("/purchase-orders/:id/items", post(orders::add_po_item))
        .route("/purchase-orders/:id/items/:item_id", put(orders::edit_po_item))
        .route(
            "/purchase-orders/:id/items/:item_id",
            delete(orders::delete_po_item),
        )
        .route("/purchase-orders/:id/finalize", post(orders::finalize_po))
        .route("/vendors", get(vendors::list_vendors))
        .route("/vendors", post(vendors::create_vendor))
        .route("/vendors/:id", get(vendors::get_vendor))
        .route("/vendors/:id", put(vendors::update_vendor))
        .route("/vendors/:id", delete(vendors::delete_vendor))
        .route("/companies", get(vendors::list_companies))
        .route("/companies", post(vendors::create_company))
        .route("/companies/:id", put(vendors::update_company))
        .route("/companies/:id", delete(vendors::delete_company))
        .route("/shipping-locations", get(vendors::list_shipping_locations))
        .route("/shipping-locations", post(vendors::create_shipping_location))
        .route("/shipping-locations/:id", put(vendors::update_shipping_location))
        .route("/shipping-locations/:id", delete(vendors::delete_shipping_location))
        // Documents
        .route("/documents", get(documents::list_categories))
        .route("/documents", post(documents::create_document))
        .route("/documents/search", get(documents::search_documents))
        .route("/documents/categories", post(documents::create_category))
        .route("/documents/categories/:id", put(documents::rename_category))
        .route("/documents/categories/:id", delete(documents::delete_category))
        .route("/documents/:id", get(documents::get_document))
        .route("/documents/:id", put(documents::update_document))
        .route("/documents/:id", delete(documents::delete_document))
        // Process templates
        .route("/processes", get(processes::list_templates))
        .route("/processes", post(processes::create_template))
        .route("/processes/:id", get(processes::get_template))
        .route("/processes/:id", put(processes::rename_template))
        .route("/processes/:id", delete(processes::delete_template))
        .route("/processes/:id/items", post(processes::add_item))
        .route("/processes/:id/reorder", post(processes::reorder_items))
        .route("/processes/:id/items/:item_id", put(processes::update_item))
        .route("/processes/:id/items/:item_id", delete(processes::delete_item))
        // Scheduled tickets
        .route("/scheduled-tickets", get(scheduled::list_scheduled))
        .route("/scheduled-tickets", post(scheduled::create_scheduled))
        .route("/scheduled-tickets/:id", get(scheduled::get_scheduled))
        .route("/scheduled-tickets/:id", put(scheduled::update_scheduled))
        .route("/scheduled-tickets/:id", delete(scheduled::delete_scheduled))
        .route("/scheduled-tickets/:id/run", post(scheduled::run_scheduled_now))
        // Mail ingestion
        .route("/email/domains", get(email_settings::list_domains))
        .route("/email/domains", post(email_settings::add_domain))
        .route("/email/domains/:id", delete(email_settings::delete_domain))
        .route("/email/deny-filters", get(email_settings::list_deny_filters))
        .route("/email/deny-filters", post(email_settings::add_deny_filter))
        .route("/email/deny-filters/:id", delete(email_settings::delete_deny_filter))
        .route("/email/checks", get(email_settings::list_email_checks))
        .route("/email/poll", get(email_settings::get_poll_status))
        .route("/email/poll", post(email_settings::poll_now))
        // Settings
        .route("/settings", get(settings::list_settings))
        .route("/settings/:key", get(settings::get_setting))
        .route("/settings/:key", put(settings::put_setting))
        .route("/settings/:key", delete(settings::delete_setting))
        // System
        .route("/system", get(system::get_system_info))
        .route("/system/backup", post(system::backup_now))
        .route("/system/ad-password-check", post(system::password_check_now));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::test_support::{insert_user, test_app};

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;
        let response = create_router(app.state.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_create_and_fetch_ticket_over_http() {
        let app = test_app().await;
        let tech = insert_user(&app, "tech@example.com", "Tech", "tech").await;
        let router = create_router(app.state.clone());

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/tickets")
                    .header("content-type", "application/json")
                    .header(actor::ACTOR_HEADER, tech.id.to_string())
                    .body(Body::from(r#"{"subject":"Printer jammed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = created["id"].as_i64().unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/api/tickets/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_actor_header_is_rejected() {
        let app = test_app().await;
        let response = create_router(app.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/dashboard")
                    .header(actor::ACTOR_HEADER, "nobody")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_record_is_404_json() {
        let app = test_app().await;
        let response = create_router(app.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/assets/999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "not_found");
    }
}
