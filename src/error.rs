//! Error types for Safe Spot.

use crate::onboarding::state::{Action, OnboardingStep};

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Local validation failures. None of these ever reach a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported document type {found:?}, expected {expected}")]
    UnsupportedMediaType { found: String, expected: String },

    #[error("Document is {size} bytes, it must be smaller than {limit} bytes")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error("Document is empty")]
    EmptyDocument,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Failures talking to one of the external services (extraction webhook,
/// registry, Google, Evolution API).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} request failed: {reason}")]
    Transport {
        service: &'static str,
        reason: String,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Malformed response from {service}: {reason}")]
    Malformed {
        service: &'static str,
        reason: String,
    },

    #[error("{service} response did not include an id")]
    MissingId { service: &'static str },

    #[error("Email {email} is already registered")]
    Conflict { email: String },

    #[error("{service} is not configured")]
    NotConfigured { service: &'static str },
}

impl CollaboratorError {
    pub(crate) fn transport(service: &'static str, err: reqwest::Error) -> Self {
        Self::Transport {
            service,
            reason: err.to_string(),
        }
    }

    pub(crate) fn malformed(service: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            service,
            reason: reason.to_string(),
        }
    }
}

/// Errors surfaced by the onboarding sequencer.
///
/// Every variant is recoverable: the sequencer records the message as its
/// last error and leaves the flow at the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Email {email} is already registered")]
    Conflict { email: String },

    #[error(transparent)]
    Collaborator(CollaboratorError),

    #[error("Another action is still in progress")]
    Busy,

    #[error("Action {action} is not available while {step}")]
    StepUnavailable {
        action: Action,
        step: OnboardingStep,
    },
}

impl From<CollaboratorError> for OnboardingError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Conflict { email } => Self::Conflict { email },
            other => Self::Collaborator(other),
        }
    }
}
