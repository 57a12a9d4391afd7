use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{FromRequest, Multipart, Path, Query, Request},
    http::{StatusCode, header},
    routing::{get, post},
};
use delve_core::{
    ExplainFormat, FileType, HistoryFilter, ReasoningTimeline, ResearchSession, SessionDetail,
    SessionRequest, SessionStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::GuardedState;
use super::documents::{FilePart, declared_type};
use crate::error::AppError;
use crate::state::{AppState, CapacitySnapshot};

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub query: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

/// Body of the session-creating routes.
///
/// Either JSON (`{query, parent_id?}`) or multipart with a `query` part, an
/// optional `parent_id` part, any number of `file` parts and an optional
/// `file_type` part applied to every file. Files sent this way are attached
/// before the session is scheduled, so they reach its composed query.
pub struct SessionForm {
    query: String,
    parent_id: Option<Uuid>,
    files: Vec<FilePart>,
    declared: Option<FileType>,
}

impl SessionForm {
    fn into_request(self, max_upload_bytes: usize) -> Result<SessionRequest, AppError> {
        let mut request = SessionRequest::new(self.query);
        if let Some(parent_id) = self.parent_id {
            request = request.continuing(parent_id);
        }
        for file in self.files {
            request = request.with_document(file.into_upload(self.declared, max_upload_bytes)?);
        }
        Ok(request)
    }

    async fn from_multipart(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut query: Option<String> = None;
        let mut parent_id: Option<Uuid> = None;
        let mut files = Vec::new();
        let mut declared: Option<FileType> = None;

        while let Some(field) = multipart.next_field().await? {
            let part = field.name().map(str::to_string);
            match part.as_deref() {
                Some("query") => query = Some(field.text().await?),
                Some("parent_id") => {
                    let value = field.text().await?;
                    let id = value
                        .trim()
                        .parse::<Uuid>()
                        .map_err(|_| AppError::bad_request("parent_id must be a UUID"))?;
                    parent_id = Some(id);
                }
                Some("file") => files.push(FilePart::read(field).await?),
                Some("file_type") | Some("type") => declared = Some(declared_type(field).await?),
                other => debug!(part = ?other, "ignoring multipart field"),
            }
        }

        let query = query.ok_or_else(|| AppError::bad_request("multipart body needs a `query` part"))?;
        Ok(Self {
            query,
            parent_id,
            files,
            declared,
        })
    }
}

#[async_trait]
impl FromRequest<AppState> for SessionForm {
    type Rejection = AppError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("multipart/form-data"));

        if is_multipart {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|rejection| AppError::new(rejection.status(), rejection.body_text()))?;
            return Self::from_multipart(multipart).await;
        }

        let Json(payload) = Json::<StartSessionRequest>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::new(rejection.status(), rejection.body_text()))?;
        Ok(Self {
            query: payload.query,
            parent_id: payload.parent_id,
            files: Vec::new(),
            declared: None,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub capacity: CapacitySnapshot,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<ResearchSession>,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    #[serde(default)]
    pub explain: Option<ExplainFormat>,
}

#[derive(Debug, Serialize)]
pub struct Explanation {
    pub format: ExplainFormat,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    #[serde(flatten)]
    pub detail: SessionDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Explanation>,
}

pub fn session_router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(start_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/continue", post(continue_session))
        .route("/sessions/:id/lineage", get(get_lineage))
}

#[instrument(skip_all, fields(parent_id = ?form.parent_id, documents = form.files.len()))]
async fn start_session(
    GuardedState(state): GuardedState,
    form: SessionForm,
) -> Result<(StatusCode, Json<StartSessionResponse>), AppError> {
    let request = form.into_request(state.max_upload_bytes())?;
    let session = state.manager().start_session(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted(&state, &session))))
}

#[instrument(skip_all, fields(parent_id = %parent_id, documents = form.files.len()))]
async fn continue_session(
    GuardedState(state): GuardedState,
    Path(parent_id): Path<Uuid>,
    form: SessionForm,
) -> Result<(StatusCode, Json<StartSessionResponse>), AppError> {
    if form.parent_id.is_some_and(|id| id != parent_id) {
        return Err(AppError::bad_request("parent_id does not match the session path"));
    }
    let request = form
        .into_request(state.max_upload_bytes())?
        .continuing(parent_id);
    let session = state.manager().start_session(request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted(&state, &session))))
}

fn accepted(state: &AppState, session: &ResearchSession) -> StartSessionResponse {
    StartSessionResponse {
        session_id: session.id,
        status: session.status,
        parent_id: session.parent_id(),
        capacity: state.capacity(),
    }
}

async fn list_sessions(
    GuardedState(state): GuardedState,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListSessionsResponse>, AppError> {
    let filter = HistoryFilter {
        limit: Some(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
        parent_id: query.parent_id,
        status: query.status,
    };
    let sessions = state.manager().history(&filter).await?;
    Ok(Json(ListSessionsResponse { sessions }))
}

async fn get_session(
    GuardedState(state): GuardedState,
    Path(session_id): Path<Uuid>,
    Query(query): Query<DetailQuery>,
) -> Result<Json<SessionDetailResponse>, AppError> {
    let detail = state.manager().session_detail(session_id).await?;
    let explanation = query.explain.map(|format| Explanation {
        format,
        content: ReasoningTimeline::new(&detail.reasoning).render(format),
    });
    Ok(Json(SessionDetailResponse {
        detail,
        explanation,
    }))
}

async fn get_lineage(
    GuardedState(state): GuardedState,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ListSessionsResponse>, AppError> {
    let sessions = state.manager().lineage(session_id).await?;
    Ok(Json(ListSessionsResponse { sessions }))
}

async fn delete_session(
    GuardedState(state): GuardedState,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.manager().delete_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
