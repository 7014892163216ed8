pub mod common;
pub mod package;

pub use common::common_routes;
pub use package::package_routes;

use crate::state::AppState;
use axum::Router;

/// Full router: common routes plus the package routes.
pub fn router(state: AppState) -> Router {
    common_routes(state.clone()).merge(package_routes(state))
}
