//! Onboarding wizard: CV upload, profile review, calendar linking.
//!
//! A psychologist moves through the steps in order. Each step owns the data
//! it produced, and the collaborator calls behind each step are only issued
//! once the step is reached.

pub mod model;
pub mod routes;
pub mod sequencer;
pub mod sessions;
pub mod state;

pub use model::{ExtractedProfile, Modality, ProfileDefaults, ProfileId, UploadPolicy, UploadedDocument};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use sequencer::{
    CalendarHandoff, Collaborators, OnboardingSequencer, OnboardingSnapshot, SequencerSettings,
};
pub use sessions::{OnboardingSessions, SessionLimits, spawn_sweep_task};
pub use state::{Action, CalendarChoice, OnboardingState, OnboardingStep, PendingAction};
