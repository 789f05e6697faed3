//! Google Calendar linking.
//!
//! The onboarding wizard only needs [`CalendarLinker::handoff_url`]: the
//! in-app address that starts the OAuth dance. The redirect to Google's
//! consent screen and the callback that stores the tokens are served by the
//! HTTP layer on top of [`GoogleCalendar`].
//!
//! The consent redirect is not authenticated: anyone may start it for any
//! profile id. What ties a callback to a started flow is the `state` value,
//! a random nonce kept server side and redeemable once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CollaboratorError;
use crate::onboarding::model::ProfileId;
use crate::registry::{CalendarLink, CalendarLinkStore};

const SERVICE: &str = "google";

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Scopes requested on the consent screen.
pub const SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/calendar.readonly",
    "https://www.googleapis.com/auth/calendar.events",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Path of the in-app endpoint that redirects to Google.
pub const AUTH_START_PATH: &str = "/api/auth/google";
/// Path Google redirects back to.
pub const CALLBACK_PATH: &str = "/api/auth/google/callback";

/// How long a consent redirect stays redeemable.
pub const STATE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Outstanding consent redirects kept at most; the oldest is dropped first.
pub const MAX_PENDING_STATES: usize = 10_000;

/// Produces the address that hands a freshly registered psychologist over to
/// calendar authorization.
pub trait CalendarLinker: Send + Sync {
    fn handoff_url(&self, profile_id: &ProfileId, return_path: &str)
    -> Result<Url, CollaboratorError>;
}

/// OAuth client settings.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub auth_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
}

impl GoogleConfig {
    /// Settings pointing at Google's public endpoints.
    pub fn new(client_id: String, client_secret: SecretString) -> Result<Self, CollaboratorError> {
        let parse = |raw: &str| Url::parse(raw).map_err(|e| CollaboratorError::malformed(SERVICE, e));
        Ok(Self {
            client_id,
            client_secret,
            auth_url: parse(GOOGLE_AUTH_URL)?,
            token_url: parse(GOOGLE_TOKEN_URL)?,
            userinfo_url: parse(GOOGLE_USERINFO_URL)?,
        })
    }
}

/// Why a callback did not end with a linked calendar. Rendered into the
/// `error` query parameter of the final redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFailure {
    AuthDenied,
    MissingParams,
    AuthFailed,
    SaveFailed,
}

impl CallbackFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthDenied => "auth_denied",
            Self::MissingParams => "missing_params",
            Self::AuthFailed => "auth_failed",
            Self::SaveFailed => "save_failed",
        }
    }
}

/// What a consent redirect remembers until Google calls back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState {
    pub profile_id: ProfileId,
    pub return_path: String,
}

/// `path` if it points inside this application, otherwise `fallback`.
pub fn local_path<'a>(path: &'a str, fallback: &'a str) -> &'a str {
    let local = path.starts_with('/') && !path.starts_with("//") && !path.contains('\\');
    if local { path } else { fallback }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
}

/// Google Calendar OAuth flow. Works without credentials for the handoff URL;
/// the consent redirect and callback need [`GoogleConfig`].
pub struct GoogleCalendar {
    client: reqwest::Client,
    config: Option<GoogleConfig>,
    public_base_url: Url,
    default_return_path: String,
    store: Arc<dyn CalendarLinkStore>,
    pending: Mutex<HashMap<String, (OAuthState, Instant)>>,
}

impl GoogleCalendar {
    pub fn new(
        client: reqwest::Client,
        config: Option<GoogleConfig>,
        public_base_url: Url,
        default_return_path: impl Into<String>,
        store: Arc<dyn CalendarLinkStore>,
    ) -> Self {
        Self {
            client,
            config,
            public_base_url,
            default_return_path: default_return_path.into(),
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn default_return_path(&self) -> &str {
        &self.default_return_path
    }

    fn config(&self) -> Result<&GoogleConfig, CollaboratorError> {
        self.config
            .as_ref()
            .ok_or(CollaboratorError::NotConfigured { service: SERVICE })
    }

    fn app_url(&self, path: &str) -> Result<Url, CollaboratorError> {
        self.public_base_url
            .join(path)
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))
    }

    /// Google's consent screen for this psychologist. The `state` sent along
    /// is a fresh nonce; [`take_state`](Self::take_state) redeems it.
    pub async fn authorization_url(
        &self,
        profile_id: &ProfileId,
        return_path: &str,
    ) -> Result<Url, CollaboratorError> {
        let config = self.config()?;
        let state = OAuthState {
            profile_id: profile_id.clone(),
            return_path: local_path(return_path, &self.default_return_path).to_string(),
        };
        let redirect_uri = self.app_url(CALLBACK_PATH)?;
        let nonce = Uuid::new_v4().simple().to_string();

        let mut url = config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("response_type", "code")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("state", &nonce);

        let mut pending = self.pending.lock().await;
        pending.retain(|_, (_, issued)| issued.elapsed() < STATE_TTL);
        if pending.len() >= MAX_PENDING_STATES {
            let oldest = pending
                .iter()
                .min_by_key(|(_, (_, issued))| *issued)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                pending.remove(&key);
            }
        }
        pending.insert(nonce, (state, Instant::now()));
        Ok(url)
    }

    /// Redeem a `state` value issued by
    /// [`authorization_url`](Self::authorization_url). Unknown, expired and
    /// already used values yield `None`.
    pub async fn take_state(&self, raw: &str) -> Option<OAuthState> {
        let (state, issued) = self.pending.lock().await.remove(raw)?;
        (issued.elapsed() < STATE_TTL).then_some(state)
    }

    /// Finish the OAuth flow: trade the code for tokens, look up the Google
    /// account and store the link.
    pub async fn complete(&self, code: &str, state: &OAuthState) -> Result<(), CallbackFailure> {
        let tokens = self.exchange_code(code).await.map_err(|e| {
            tracing::warn!(profile_id = %state.profile_id, error = %e, "OAuth code exchange failed");
            CallbackFailure::AuthFailed
        })?;
        let email = self.user_email(&tokens.access_token).await.map_err(|e| {
            tracing::warn!(profile_id = %state.profile_id, error = %e, "Google userinfo lookup failed");
            CallbackFailure::AuthFailed
        })?;

        let now = Utc::now();
        let link = CalendarLink {
            psychologist_id: state.profile_id.clone(),
            google_email: email.clone(),
            google_calendar_id: email,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_expiry: tokens.expires_in.map(|secs| now + Duration::seconds(secs)),
            sync_enabled: true,
            last_sync_at: now,
        };
        self.store.upsert_calendar_link(&link).await.map_err(|e| {
            tracing::error!(profile_id = %state.profile_id, error = %e, "Failed to save calendar tokens");
            CallbackFailure::SaveFailed
        })?;

        tracing::info!(profile_id = %state.profile_id, google_email = %link.google_email, "Calendar connected");
        Ok(())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenResponse, CollaboratorError> {
        let config = self.config()?;
        let redirect_uri = self.app_url(CALLBACK_PATH)?;
        let params = [
            ("code", code),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
            ("redirect_uri", redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        let resp = self
            .client
            .post(config.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(SERVICE, e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                service: SERVICE,
                status,
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))
    }

    async fn user_email(&self, access_token: &str) -> Result<String, CollaboratorError> {
        let config = self.config()?;
        let resp = self
            .client
            .get(config.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| CollaboratorError::transport(SERVICE, e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                service: SERVICE,
                status,
                body,
            });
        }
        let info: UserInfo = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        info.email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| CollaboratorError::malformed(SERVICE, "userinfo without email"))
    }

    /// Where the browser lands after the callback.
    pub fn finish_url(&self, return_path: &str, outcome: Result<(), CallbackFailure>) -> String {
        let path = local_path(return_path, &self.default_return_path);
        let sep = if path.contains('?') { '&' } else { '?' };
        match outcome {
            Ok(()) => format!("{path}{sep}success=calendar_connected"),
            Err(failure) => format!("{path}{sep}error={}", failure.as_str()),
        }
    }
}

impl CalendarLinker for GoogleCalendar {
    fn handoff_url(
        &self,
        profile_id: &ProfileId,
        return_path: &str,
    ) -> Result<Url, CollaboratorError> {
        let mut url = self.app_url(AUTH_START_PATH)?;
        url.query_pairs_mut()
            .append_pair("psychologist_id", profile_id.as_str())
            .append_pair(
                "redirect",
                local_path(return_path, &self.default_return_path),
            );
        Ok(url)
    }
}
