//! Standard response envelope helpers, plus package downloads.

use crate::package::validator::sanitize_file_stem;
use crate::service::PackageDownload;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

pub fn success_one<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::CREATED, Json(SuccessOne { data, meta: None }))
}

pub fn success_one_ok<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::OK, Json(SuccessOne { data, meta: None }))
}

pub const PACKAGE_CONTENT_TYPE: &str = "application/zip";

/// The archive itself is the body; no JSON envelope.
impl IntoResponse for PackageDownload {
    fn into_response(self) -> Response {
        let disposition = format!("attachment; filename=\"{}\"", sanitize_file_stem(&self.file_name));
        let disposition =
            HeaderValue::from_str(&disposition).unwrap_or_else(|_| HeaderValue::from_static("attachment"));
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, HeaderValue::from_static(PACKAGE_CONTENT_TYPE)),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            self.bytes,
        )
            .into_response()
    }
}
