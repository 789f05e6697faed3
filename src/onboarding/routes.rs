//! REST endpoints driving onboarding sessions.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::{OnboardingError, ValidationError};

use super::model::{ExtractedProfile, UploadPolicy, UploadedDocument};
use super::sequencer::{OnboardingSequencer, OnboardingSnapshot};
use super::sessions::OnboardingSessions;

/// Multipart field carrying the CV.
pub const CV_FIELD: &str = "cv";

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub sessions: Arc<OnboardingSessions>,
}

/// HTTP status for a sequencer failure.
pub fn status_for(err: &OnboardingError) -> StatusCode {
    match err {
        OnboardingError::Validation(_) => StatusCode::BAD_REQUEST,
        OnboardingError::Conflict { .. }
        | OnboardingError::Busy
        | OnboardingError::StepUnavailable { .. } => StatusCode::CONFLICT,
        OnboardingError::Collaborator(_) => StatusCode::BAD_GATEWAY,
    }
}

fn failure(err: &OnboardingError, snapshot: OnboardingSnapshot) -> Response {
    (
        status_for(err),
        Json(serde_json::json!({ "error": err.to_string(), "snapshot": snapshot })),
    )
        .into_response()
}

fn not_found(id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("Unknown onboarding session {id}") })),
    )
        .into_response()
}

/// Turn a sequencer outcome into a response; failures carry the snapshot so
/// the client can redraw the step that failed.
async fn respond<T: serde::Serialize>(
    sequencer: &OnboardingSequencer,
    outcome: Result<T, OnboardingError>,
) -> Response {
    match outcome {
        Ok(body) => Json(body).into_response(),
        Err(e) => failure(&e, sequencer.snapshot().await),
    }
}

/// Why a multipart CV upload could not be read.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The document breaks the upload policy before it was fully received.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("{0}")]
    Malformed(String),
}

/// Read the CV out of a multipart body. A `filename` text field, when present,
/// overrides the file part's own name.
///
/// The file part is streamed: once it reaches the policy's size limit the rest
/// is drained without buffering and the upload is refused as too large.
pub async fn read_upload(
    mut multipart: Multipart,
    policy: &UploadPolicy,
) -> Result<UploadedDocument, UploadError> {
    let limit = policy.max_bytes;
    let mut document: Option<UploadedDocument> = None;
    let mut filename_override: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| upload_error(e, 0, limit))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(CV_FIELD) | Some("file") => {
                let filename = field.file_name().unwrap_or("cv").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let mut bytes = Vec::new();
                let mut size = 0usize;
                while let Some(chunk) = field.chunk().await.map_err(|e| upload_error(e, size, limit))? {
                    size = size.saturating_add(chunk.len());
                    if size < limit {
                        bytes.extend_from_slice(&chunk);
                    }
                }
                if size >= limit {
                    policy.check_media_type(&content_type)?;
                    return Err(ValidationError::DocumentTooLarge { size, limit }.into());
                }
                document = Some(UploadedDocument::new(filename, content_type, bytes));
            }
            Some("filename") => {
                let name = field.text().await.map_err(|e| upload_error(e, 0, limit))?;
                if !name.trim().is_empty() {
                    filename_override = Some(name.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let mut document = document
        .ok_or_else(|| UploadError::Malformed(format!("Missing '{CV_FIELD}' file field")))?;
    if let Some(name) = filename_override {
        document.filename = name;
    }
    Ok(document)
}

/// A body cut off by the request size ceiling is a document that is too large.
fn upload_error(err: MultipartError, seen: usize, limit: usize) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ValidationError::DocumentTooLarge {
            size: seen.max(limit),
            limit,
        }
        .into()
    } else {
        UploadError::Malformed(err.to_string())
    }
}

/// POST /api/onboarding/sessions
async fn create_session(State(state): State<OnboardingRouteState>) -> impl IntoResponse {
    let (id, sequencer) = state.sessions.create().await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "snapshot": sequencer.snapshot().await })),
    )
}

/// GET /api/onboarding/sessions/{id}
async fn get_session(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.sessions.get(id).await {
        Some(sequencer) => Json(sequencer.snapshot().await).into_response(),
        None => not_found(id),
    }
}

/// POST /api/onboarding/sessions/{id}/document
async fn upload_document(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Response {
    let Some(sequencer) = state.sessions.get(id).await else {
        return not_found(id);
    };
    let document = match read_upload(multipart, sequencer.upload_policy()).await {
        Ok(doc) => doc,
        Err(UploadError::Invalid(reason)) => {
            let err = sequencer.reject_document(reason).await;
            return failure(&err, sequencer.snapshot().await);
        }
        Err(UploadError::Malformed(reason)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": reason })),
            )
                .into_response();
        }
    };
    let outcome = sequencer.select_document(document).await;
    respond(&sequencer, outcome).await
}

/// PUT /api/onboarding/sessions/{id}/profile
async fn update_profile(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
    Json(profile): Json<ExtractedProfile>,
) -> Response {
    let Some(sequencer) = state.sessions.get(id).await else {
        return not_found(id);
    };
    let outcome = sequencer.update_profile(profile).await;
    respond(&sequencer, outcome).await
}

/// POST /api/onboarding/sessions/{id}/submit
///
/// An optional JSON body with the edited profile is applied before submitting.
async fn submit(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Response {
    let Some(sequencer) = state.sessions.get(id).await else {
        return not_found(id);
    };
    if !body.is_empty() {
        let edited: ExtractedProfile = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("Invalid profile: {e}") })),
                )
                    .into_response();
            }
        };
        if let Err(e) = sequencer.update_profile(edited).await {
            return failure(&e, sequencer.snapshot().await);
        }
    }
    let outcome = sequencer.submit().await;
    respond(&sequencer, outcome).await
}

/// POST /api/onboarding/sessions/{id}/back
async fn back(State(state): State<OnboardingRouteState>, Path(id): Path<Uuid>) -> Response {
    let Some(sequencer) = state.sessions.get(id).await else {
        return not_found(id);
    };
    let outcome = sequencer.back().await;
    respond(&sequencer, outcome).await
}

/// POST /api/onboarding/sessions/{id}/calendar/connect
async fn connect_calendar(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(sequencer) = state.sessions.get(id).await else {
        return not_found(id);
    };
    let outcome = sequencer.connect_calendar().await;
    respond(&sequencer, outcome).await
}

/// POST /api/onboarding/sessions/{id}/calendar/skip
async fn skip_calendar(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(sequencer) = state.sessions.get(id).await else {
        return not_found(id);
    };
    let outcome = sequencer.skip_calendar().await;
    respond(&sequencer, outcome).await
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/api/onboarding/sessions", post(create_session))
        .route("/api/onboarding/sessions/{id}", get(get_session))
        .route("/api/onboarding/sessions/{id}/document", post(upload_document))
        .route(
            "/api/onboarding/sessions/{id}/profile",
            axum::routing::put(update_profile),
        )
        .route("/api/onboarding/sessions/{id}/submit", post(submit))
        .route("/api/onboarding/sessions/{id}/back", post(back))
        .route(
            "/api/onboarding/sessions/{id}/calendar/connect",
            post(connect_calendar),
        )
        .route(
            "/api/onboarding/sessions/{id}/calendar/skip",
            post(skip_calendar),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::onboarding::state::{Action, OnboardingStep};

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&ValidationError::EmptyDocument.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&OnboardingError::Busy), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&OnboardingError::StepUnavailable {
                action: Action::Submit,
                step: OnboardingStep::AwaitingDocument,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CollaboratorError::Conflict { email: "a@b.c".into() }.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CollaboratorError::MissingId { service: "registry" }.into()),
            StatusCode::BAD_GATEWAY
        );
    }
}
