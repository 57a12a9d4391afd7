use axum::{
    Json, Router,
    extract::{Multipart, Path, multipart::Field},
    http::StatusCode,
    routing::{get, post},
};
use delve_core::{DelveError, DocumentUpload, FileType, UploadedDocument};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::GuardedState;
use crate::error::AppError;
use crate::state::AppState;

pub fn document_router() -> Router<AppState> {
    Router::new()
        .route("/sessions/:id/documents", post(upload_document))
        .route("/documents/:id", get(get_document))
}

/// A `file` part read off a multipart body.
pub(super) struct FilePart {
    name: String,
    content_type: Option<String>,
    content: Vec<u8>,
}

impl FilePart {
    pub(super) async fn read(field: Field<'_>) -> Result<Self, AppError> {
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::bad_request("file part needs a file name"))?;
        let content_type = field.content_type().map(str::to_string);
        let content = field.bytes().await?.to_vec();
        Ok(Self {
            name,
            content_type,
            content,
        })
    }

    /// A declared type wins; otherwise the extension, then the part's content type.
    pub(super) fn into_upload(
        self,
        declared: Option<FileType>,
        max_bytes: usize,
    ) -> Result<DocumentUpload, AppError> {
        if self.content.len() > max_bytes {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("upload exceeds {max_bytes} bytes"),
            ));
        }

        let content_type = self.content_type;
        let upload = DocumentUpload::new(self.name, self.content);
        let file_type = declared.or_else(|| {
            FileType::from_name(&upload.name).ok().or_else(|| {
                content_type
                    .as_deref()
                    .and_then(|value| value.parse::<FileType>().ok())
            })
        });
        Ok(match file_type {
            Some(file_type) => upload.with_declared_type(file_type),
            None => upload,
        })
    }
}

pub(super) async fn declared_type(field: Field<'_>) -> Result<FileType, AppError> {
    let value = field.text().await?;
    value
        .parse::<FileType>()
        .map_err(|err| AppError::from(DelveError::from(err)))
}

/// Multipart upload: a `file` part plus an optional `file_type` part (`pdf`/`txt`).
#[instrument(skip_all, fields(session_id = %session_id))]
async fn upload_document(
    GuardedState(state): GuardedState,
    Path(session_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadedDocument>), AppError> {
    let mut file: Option<FilePart> = None;
    let mut declared: Option<FileType> = None;

    while let Some(field) = multipart.next_field().await? {
        let part = field.name().map(str::to_string);
        match part.as_deref() {
            Some("file") => file = Some(FilePart::read(field).await?),
            Some("file_type") | Some("type") => declared = Some(declared_type(field).await?),
            other => debug!(part = ?other, "ignoring multipart field"),
        }
    }

    let file = file.ok_or_else(|| AppError::bad_request("multipart body needs a `file` part"))?;
    let upload = file.into_upload(declared, state.max_upload_bytes())?;

    let document = state.manager().upload_document(session_id, upload).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

async fn get_document(
    GuardedState(state): GuardedState,
    Path(document_id): Path<Uuid>,
) -> Result<Json<UploadedDocument>, AppError> {
    let document = state.manager().document(document_id).await?;
    Ok(Json(document))
}
