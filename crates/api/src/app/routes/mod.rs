use axum::Router;

pub mod admin;
pub mod invoices;
pub mod line_items;
pub mod system;

/// Router for all billing endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/invoices", invoices::router())
        .nest("/admin", admin::router())
}
