//! Package routes: export and import under /system/package.

use crate::handlers::{export_package, import_package, import_package_from_url};
use crate::state::AppState;
use axum::{extract::DefaultBodyLimit, routing::post, Router};
use tower_http::limit::RequestBodyLimitLayer;

/// Room for multipart boundaries and the `fields` part on top of the package itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// POST /system/package, POST /system/package/url, POST /system/package/:app_id/export.
pub fn package_routes(state: AppState) -> Router {
    let limit = state.packager.settings().max_package_bytes.saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/system/package", post(import_package))
        .route("/system/package/url", post(import_package_from_url))
        .route("/system/package/:app_id/export", post(export_package))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(limit))
        .with_state(state)
}
