//! HTTP surface: onboarding sessions plus the endpoints the web frontend and
//! the admin dashboard call directly.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::calendar::{CallbackFailure, GoogleCalendar};
use crate::config::AppConfig;
use crate::dashboard::DashboardService;
use crate::error::{CollaboratorError, Error, OnboardingError, ValidationError};
use crate::extraction::{ExtractionService, WebhookExtractor};
use crate::onboarding::model::{ExtractedProfile, ProfileId};
use crate::onboarding::routes::{read_upload, status_for};
use crate::onboarding::{
    Collaborators, OnboardingRouteState, OnboardingSessions, SequencerSettings, onboarding_routes,
};
use crate::registry::{
    DirectoryEntry, DirectoryForm, ProfileRegistry, SupabaseRegistry, register_profile,
};
use crate::whatsapp::EvolutionClient;

/// Headroom on top of the CV size limit for multipart framing.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// How many times the CV limit a request body may reach. Oversized CVs below
/// this are read to the end and refused with a validation error; bodies above
/// it are cut off.
const OVERSIZE_FACTOR: usize = 4;

/// Hard cap on request bodies.
fn request_ceiling(max_upload_bytes: usize) -> usize {
    max_upload_bytes
        .saturating_mul(OVERSIZE_FACTOR)
        .saturating_add(MULTIPART_OVERHEAD)
}

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<OnboardingSessions>,
    pub extraction: Arc<dyn ExtractionService>,
    pub registry: Arc<SupabaseRegistry>,
    pub calendar: Arc<GoogleCalendar>,
    pub whatsapp: Option<Arc<EvolutionClient>>,
    pub dashboard: DashboardService,
    pub settings: SequencerSettings,
}

impl AppState {
    /// Build every collaborator client from the configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| CollaboratorError::transport("http client", e))?;

        let extraction: Arc<dyn ExtractionService> = Arc::new(WebhookExtractor::new(
            client.clone(),
            config.extraction.webhook_url.clone(),
        ));
        let registry = Arc::new(SupabaseRegistry::new(
            client.clone(),
            &config.registry.project_url,
            config.registry.service_key.clone(),
            config.registry.tables.clone(),
        )?);
        let calendar = Arc::new(GoogleCalendar::new(
            client.clone(),
            config.google.clone(),
            config.server.public_url.clone(),
            config.onboarding.return_path.clone(),
            registry.clone(),
        ));
        let whatsapp = config.evolution.as_ref().map(|evo| {
            Arc::new(EvolutionClient::new(
                client.clone(),
                evo.base_url.clone(),
                evo.instance.clone(),
                evo.api_key.clone(),
            ))
        });

        let sessions = OnboardingSessions::new(
            Collaborators {
                extraction: extraction.clone(),
                registry: registry.clone(),
                calendar: calendar.clone(),
            },
            config.onboarding.clone(),
            config.sessions,
        );

        Ok(Self {
            sessions,
            extraction,
            dashboard: DashboardService::new(registry.clone()),
            registry,
            calendar,
            whatsapp,
            settings: config.onboarding.clone(),
        })
    }
}

/// The full service router.
pub fn app_router(state: AppState) -> Router {
    let body_limit = request_ceiling(state.settings.policy.max_bytes);
    let onboarding = onboarding_routes(OnboardingRouteState {
        sessions: state.sessions.clone(),
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/upload-cv", post(upload_cv))
        .route("/api/check-email", get(check_email))
        .route("/api/psychologists", post(create_psychologist))
        .route("/api/admin/profiles", post(create_directory_profile))
        .route("/api/auth/google", get(google_auth_start))
        .route("/api/auth/google/callback", get(google_auth_callback))
        .route("/api/whatsapp-status", get(whatsapp_status))
        .route("/api/dashboard", get(dashboard))
        .with_state(state)
        .merge(onboarding)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "safe-spot"
    }))
}

// ── CV extraction ───────────────────────────────────────────────────────

/// POST /api/upload-cv: extract a CV without an onboarding session.
async fn upload_cv(State(state): State<AppState>, multipart: Multipart) -> Response {
    let document = match read_upload(multipart, &state.settings.policy).await {
        Ok(doc) => doc,
        Err(reason) => return error_response(StatusCode::BAD_REQUEST, reason),
    };
    if let Err(e) = state.settings.policy.check(&document) {
        return error_response(StatusCode::BAD_REQUEST, e);
    }
    match state.extraction.extract(document).await {
        Ok(profile) => Json(profile).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "CV extraction failed");
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

// ── Psychologists ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmailQuery {
    email: Option<String>,
}

/// GET /api/check-email?email=
async fn check_email(State(state): State<AppState>, Query(query): Query<EmailQuery>) -> Response {
    let Some(email) = query
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Email is required");
    };
    match state.registry.email_exists(&email).await {
        Ok(exists) => Json(serde_json::json!({ "exists": exists })).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

/// POST /api/psychologists: register a reviewed profile in one call.
async fn create_psychologist(
    State(state): State<AppState>,
    Json(profile): Json<ExtractedProfile>,
) -> Response {
    if let Some(field) = profile.missing_required() {
        let err = OnboardingError::from(ValidationError::MissingField(field));
        return error_response(status_for(&err), err);
    }
    match register_profile(state.registry.as_ref(), &profile, &state.settings.defaults).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "success": true, "id": id })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), e),
    }
}

/// POST /api/admin/profiles: the admin "load profile" form.
async fn create_directory_profile(
    State(state): State<AppState>,
    Form(form): Form<DirectoryForm>,
) -> Response {
    let entry = DirectoryEntry::from(form);
    if entry.nombre_completo.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            ValidationError::MissingField("nombre_completo"),
        );
    }
    match state.registry.create_directory_entry(&entry).await {
        Ok(row) => {
            tracing::info!(nombre = %entry.nombre_completo, "Directory profile created");
            (StatusCode::CREATED, Json(row)).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

// ── Google Calendar ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthStartQuery {
    psychologist_id: Option<String>,
    redirect: Option<String>,
}

/// GET /api/auth/google: send the browser to Google's consent screen.
async fn google_auth_start(
    State(state): State<AppState>,
    Query(query): Query<AuthStartQuery>,
) -> Response {
    let Some(id) = query
        .psychologist_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST, "psychologist_id is required");
    };
    if !state.calendar.is_configured() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Google Calendar is not configured",
        );
    }
    let return_path = query
        .redirect
        .as_deref()
        .unwrap_or(state.calendar.default_return_path());
    match state
        .calendar
        .authorization_url(&ProfileId::new(id), return_path)
        .await
    {
        Ok(url) => found(url.as_str()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /api/auth/google/callback: store the tokens and return to the app.
async fn google_auth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let calendar = &state.calendar;
    let oauth_state = match query.state.as_deref() {
        Some(raw) => calendar.take_state(raw).await,
        None => None,
    };
    let return_path = oauth_state
        .as_ref()
        .map(|s| s.return_path.clone())
        .unwrap_or_else(|| calendar.default_return_path().to_string());

    let outcome = if let Some(error) = query.error {
        tracing::info!(error = %error, "Calendar authorization denied");
        Err(CallbackFailure::AuthDenied)
    } else {
        match (query.code.as_deref(), oauth_state.as_ref()) {
            (Some(code), Some(oauth_state)) if !code.is_empty() => {
                calendar.complete(code, oauth_state).await
            }
            _ => Err(CallbackFailure::MissingParams),
        }
    };

    found(&calendar.finish_url(&return_path, outcome))
}

// ── WhatsApp ────────────────────────────────────────────────────────────

/// GET /api/whatsapp-status
async fn whatsapp_status(State(state): State<AppState>) -> Response {
    let Some(client) = state.whatsapp.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "state": "not_configured" })),
        )
            .into_response();
    };
    match client.connection_state().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Error checking WhatsApp status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "state": "error", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// ── Dashboard ───────────────────────────────────────────────────────────

/// GET /api/dashboard
async fn dashboard(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.dashboard.load().await)
}
