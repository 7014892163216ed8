//! Package handlers: export an application as a download, import from a multipart upload or a URL.

use crate::error::AppError;
use crate::package::types::ExportOptions;
use crate::response::success_one;
use crate::service::PackageDownload;
use crate::source::PackageSource;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};

/// POST /system/package/:app_id/export: JSON body `{services, schemas, include_files, include_data}`,
/// all optional. Responds with the package as an attachment.
pub async fn export_package(
    State(state): State<AppState>,
    Path(app_id): Path<i64>,
    body: Bytes,
) -> Result<PackageDownload, AppError> {
    let options: ExportOptions = if body.iter().all(u8::is_ascii_whitespace) {
        ExportOptions::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("invalid export options: {}", e)))?
    };
    state.packager.export_application(app_id, &options).await
}

fn parse_overrides(text: &str) -> Result<Map<String, Value>, AppError> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::BadRequest("'fields' must be a JSON object".into())),
        Err(e) => Err(AppError::BadRequest(format!("invalid 'fields': {}", e))),
    }
}

/// POST /system/package: multipart form with a `file` (or `package`) field holding one `.dfpkg`
/// and an optional `fields` JSON object overriding the archived description.
pub async fn import_package(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut overrides = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" | "package" => {
                if upload.is_some() {
                    return Err(AppError::BadRequest(
                        "Only a single application package file is allowed for import.".into(),
                    ));
                }
                let file_name = field.file_name().unwrap_or("").to_string();
                let data = field.bytes().await.map_err(|e| AppError::BadRequest(e.to_string()))?;
                upload = Some((file_name, data.to_vec()));
            }
            "fields" => {
                let text = field.text().await.map_err(|e| AppError::BadRequest(e.to_string()))?;
                overrides = parse_overrides(&text)?;
            }
            _ => {}
        }
    }
    let (file_name, bytes) =
        upload.ok_or_else(|| AppError::BadRequest("missing 'file' or 'package' field in multipart body".into()))?;

    let imported = state
        .packager
        .import_from_source(PackageSource::Upload { file_name, bytes }, &overrides, &state.http)
        .await?;
    Ok(success_one(imported))
}

#[derive(Deserialize)]
pub struct ImportUrlRequest {
    pub url: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// POST /system/package/url: JSON `{url, fields}`; the package is downloaded, then imported.
pub async fn import_package_from_url(
    State(state): State<AppState>,
    Json(request): Json<ImportUrlRequest>,
) -> Result<impl IntoResponse, AppError> {
    let imported = state
        .packager
        .import_from_source(PackageSource::Url(request.url), &request.fields, &state.http)
        .await?;
    Ok(success_one(imported))
}
