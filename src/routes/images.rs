//! Image cache HTTP surface: upload originals, fetch derived images, and
//! manage persistence/signed URLs.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

/// Allowed upload MIME types, validated against magic bytes, not just the
/// multipart part's declared content type.
const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/images", get(list_originals).post(upload_original))
        .route("/images/{name}", get(get_image).delete(delete_image))
        .route("/images/{name}/persist", post(persist_image))
        .route("/images/{name}/url", get(signed_url))
}

fn mime_to_format(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn validate_magic_bytes(bytes: &[u8], declared_mime: &str) -> Result<(), AppError> {
    let detected = infer::get(bytes).ok_or_else(|| {
        AppError::BadQuery("could not verify uploaded file content".to_string())
    })?;
    if detected.mime_type() != declared_mime {
        return Err(AppError::BadQuery(format!(
            "file content does not match declared type: declared {declared_mime}, detected {}",
            detected.mime_type()
        )));
    }
    Ok(())
}

#[derive(Serialize)]
struct UploadResponse {
    name: String,
}

async fn upload_original(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut bytes = None;
    let mut filename = "upload".to_string();
    let mut content_type = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadQuery(e.to_string()))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload").to_string();
            content_type = field.content_type().map(|s| s.to_string());
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadQuery(e.to_string()))?
                    .to_vec(),
            );
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::BadQuery("missing file part".to_string()))?;
    let max = state.config().max_upload_bytes;
    if bytes.len() as u64 > max {
        return Err(AppError::BadQuery(format!(
            "file too large: {} bytes (max {max} bytes)",
            bytes.len()
        )));
    }

    let declared_mime = content_type
        .ok_or_else(|| AppError::BadQuery("missing content type".to_string()))?;
    if !ALLOWED_MIME_TYPES.contains(&declared_mime.as_str()) {
        return Err(AppError::BadQuery(format!(
            "file type not allowed: {declared_mime}"
        )));
    }
    validate_magic_bytes(&bytes, &declared_mime)?;
    let format = mime_to_format(&declared_mime)
        .ok_or_else(|| AppError::BadQuery(format!("unsupported mime type: {declared_mime}")))?;

    let upload_bytes = bytes.len() as u64;
    let name = state
        .master()
        .add_original(bytes, &filename, format)
        .await?;
    state.metrics().record_upload(upload_bytes);

    Ok((StatusCode::CREATED, Json(UploadResponse { name: name.render() })).into_response())
}

async fn get_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let handle = state.master().get(&name).await?;
    let bytes = handle.bytes().await?;
    let format = handle.format().await;
    let content_type = crate::tier::remote_cache::content_type_for(&format);
    Ok((StatusCode::OK, [("content-type", content_type)], bytes).into_response())
}

async fn delete_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.master().delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn persist_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.master().make_persistent(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct SignedUrlResponse {
    url: String,
}

async fn signed_url(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SignedUrlResponse>, AppError> {
    let url = state.master().signed_url(&name).await?;
    Ok(Json(SignedUrlResponse { url }))
}

#[derive(Serialize)]
struct OriginalsResponse {
    bases: Vec<String>,
}

#[derive(Deserialize)]
struct ListQuery {
    path: Option<String>,
    regex: Option<String>,
}

async fn list_originals(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<OriginalsResponse>, AppError> {
    let mut bases = state.master().known_bases();
    if let Some(path) = &query.path {
        bases.retain(|b| b.starts_with(path.as_str()));
    }
    if let Some(pattern) = &query.regex {
        let re = regex::Regex::new(pattern)
            .map_err(|e| AppError::BadQuery(format!("invalid regex: {e}")))?;
        bases.retain(|b| re.find(b).is_some_and(|m| m.start() == 0 && m.end() == b.len()));
    }
    Ok(Json(OriginalsResponse { bases }))
}
