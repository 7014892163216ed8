//! Shared application state for all routes.

use crate::service::Packager;

#[derive(Clone)]
pub struct AppState {
    pub packager: Packager,
    /// Client for URL imports; shared so connections are pooled.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(packager: Packager) -> Self {
        AppState {
            packager,
            http: reqwest::Client::new(),
        }
    }
}
