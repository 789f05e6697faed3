//! Configuration types, read from the environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;

use crate::calendar::GoogleConfig;
use crate::error::ConfigError;
use crate::onboarding::model::{ProfileDefaults, UploadPolicy};
use crate::onboarding::sequencer::{DEFAULT_RETURN_PATH, SequencerSettings};
use crate::onboarding::sessions::SessionLimits;
use crate::registry::RegistryTables;

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Externally visible base URL; OAuth redirects are built from it.
    pub public_url: Url,
}

/// The CV extraction webhook.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub webhook_url: Url,
}

/// Supabase project access.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub project_url: Url,
    pub service_key: SecretString,
    pub tables: RegistryTables,
}

/// Evolution API instance backing the WhatsApp bot.
#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    pub base_url: Url,
    pub api_key: SecretString,
    pub instance: String,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub extraction: ExtractionConfig,
    pub registry: RegistryConfig,
    /// Absent when Google OAuth credentials are not set.
    pub google: Option<GoogleConfig>,
    /// Absent when the Evolution API is not set up.
    pub evolution: Option<EvolutionConfig>,
    pub onboarding: SequencerSettings,
    pub sessions: SessionLimits,
    /// Timeout applied to every outbound request.
    pub http_timeout: Duration,
}

impl AppConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let server = ServerConfig {
            bind_addr: env.parse_or("SAFESPOT_BIND", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            public_url: env.url_or("SAFESPOT_PUBLIC_URL", "http://localhost:3000")?,
        };

        let extraction = ExtractionConfig {
            webhook_url: env.required_url("SAFESPOT_EXTRACTION_URL")?,
        };

        let defaults = RegistryTables::default();
        let registry = RegistryConfig {
            project_url: env.required_url("SUPABASE_URL")?,
            service_key: SecretString::from(env.required("SUPABASE_SERVICE_ROLE_KEY")?),
            tables: RegistryTables {
                profiles: env.get("SAFESPOT_PROFILES_TABLE").unwrap_or(defaults.profiles),
                directory: env.get("SAFESPOT_DIRECTORY_TABLE").unwrap_or(defaults.directory),
                ..defaults
            },
        };

        let google = match (env.get("GOOGLE_CLIENT_ID"), env.get("GOOGLE_CLIENT_SECRET")) {
            (Some(id), Some(secret)) => Some(
                GoogleConfig::new(id, SecretString::from(secret)).map_err(|e| {
                    ConfigError::InvalidValue {
                        key: "GOOGLE_CLIENT_ID".to_string(),
                        message: e.to_string(),
                    }
                })?,
            ),
            _ => None,
        };

        let evolution = match (env.get("EVOLUTION_API_URL"), env.get("EVOLUTION_API_KEY")) {
            (Some(_), Some(api_key)) => Some(EvolutionConfig {
                base_url: env.required_url("EVOLUTION_API_URL")?,
                api_key: SecretString::from(api_key),
                instance: env.get("EVOLUTION_INSTANCE").unwrap_or_else(|| "The safe spot".to_string()),
            }),
            _ => None,
        };

        let policy_defaults = UploadPolicy::default();
        let profile_defaults = ProfileDefaults::default();
        let onboarding = SequencerSettings {
            policy: UploadPolicy {
                accepted_media_type: env
                    .get("SAFESPOT_ACCEPTED_MEDIA_TYPE")
                    .unwrap_or(policy_defaults.accepted_media_type),
                max_bytes: env.parse_or("SAFESPOT_MAX_UPLOAD_BYTES", policy_defaults.max_bytes)?,
            },
            defaults: ProfileDefaults {
                hourly_rate: env.parse_or("SAFESPOT_DEFAULT_HOURLY_RATE", profile_defaults.hourly_rate)?,
                currency: env
                    .get("SAFESPOT_DEFAULT_CURRENCY")
                    .unwrap_or(profile_defaults.currency),
                ..profile_defaults
            },
            return_path: env
                .get("SAFESPOT_CALENDAR_RETURN_PATH")
                .unwrap_or_else(|| DEFAULT_RETURN_PATH.to_string()),
        };
        if !onboarding.return_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "SAFESPOT_CALENDAR_RETURN_PATH".to_string(),
                message: "must be a path starting with '/'".to_string(),
            });
        }

        let session_defaults = SessionLimits::default();
        let sessions = SessionLimits {
            idle_ttl: env.minutes_or("SAFESPOT_SESSION_IDLE_MINUTES", session_defaults.idle_ttl)?,
            completed_ttl: env
                .minutes_or("SAFESPOT_SESSION_COMPLETED_MINUTES", session_defaults.completed_ttl)?,
            max_sessions: env.parse_or("SAFESPOT_MAX_SESSIONS", session_defaults.max_sessions)?,
            ..session_defaults
        };
        if sessions.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SAFESPOT_MAX_SESSIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let http_timeout = Duration::from_secs(env.parse_or("SAFESPOT_HTTP_TIMEOUT_SECS", 60u64)?);

        Ok(Self {
            server,
            extraction,
            registry,
            google,
            evolution,
            onboarding,
            sessions,
            http_timeout,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Value of `key`, with blank values treated as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn minutes_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let minutes = self.parse_or(key, default.as_secs() / 60)?;
        Ok(Duration::from_secs(minutes.saturating_mul(60)))
    }

    fn url(key: &str, raw: &str) -> Result<Url, ConfigError> {
        Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn required_url(&self, key: &str) -> Result<Url, ConfigError> {
        Self::url(key, &self.required(key)?)
    }

    fn url_or(&self, key: &str, default: &str) -> Result<Url, ConfigError> {
        Self::url(key, &self.get(key).unwrap_or_else(|| default.to_string()))
    }
}
