//! OnboardingSequencer: drives one psychologist through CV upload, profile
//! review and calendar linking, in that order.
//!
//! State sits behind a lock that is never held across a collaborator call.
//! The pending marker is set before the call and cleared after it, so a second
//! action arriving meanwhile fails with [`OnboardingError::Busy`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::calendar::CalendarLinker;
use crate::error::{OnboardingError, ValidationError};
use crate::extraction::ExtractionService;
use crate::registry::{ProfileRegistry, register_profile};

use super::model::{ExtractedProfile, ProfileDefaults, UploadPolicy, UploadedDocument};
use super::state::{Action, CalendarChoice, OnboardingState, PendingAction};

/// Default page the psychologist lands on once the calendar step is done.
pub const DEFAULT_RETURN_PATH: &str = "/onboarding/success";

/// Settings shared by every sequencer.
#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub policy: UploadPolicy,
    pub defaults: ProfileDefaults,
    /// Where the calendar provider sends the user back to.
    pub return_path: String,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            policy: UploadPolicy::default(),
            defaults: ProfileDefaults::default(),
            return_path: DEFAULT_RETURN_PATH.to_string(),
        }
    }
}

/// The three services the wizard talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub extraction: Arc<dyn ExtractionService>,
    pub registry: Arc<dyn ProfileRegistry>,
    pub calendar: Arc<dyn CalendarLinker>,
}

/// Read-only view of a sequencer, as returned by every action.
#[derive(Debug, Clone, Serialize)]
pub struct OnboardingSnapshot {
    #[serde(flatten)]
    pub state: OnboardingState,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Actions that may be invoked right now. Empty while busy.
    pub actions: Vec<Action>,
}

/// Result of the "connect" action: where to send the browser next.
#[derive(Debug, Clone, Serialize)]
pub struct CalendarHandoff {
    pub redirect_url: String,
    pub snapshot: OnboardingSnapshot,
}

#[derive(Debug, Default)]
struct Inner {
    state: OnboardingState,
    pending: Option<PendingAction>,
    last_error: Option<String>,
}

impl Inner {
    fn snapshot(&self) -> OnboardingSnapshot {
        let actions = if self.pending.is_some() {
            Vec::new()
        } else {
            self.state.step().actions().to_vec()
        };
        OnboardingSnapshot {
            state: self.state.clone(),
            busy: self.pending.is_some(),
            pending: self.pending.clone(),
            last_error: self.last_error.clone(),
            actions,
        }
    }

    /// Record the failure and hand it back.
    fn fail(&mut self, err: OnboardingError) -> OnboardingError {
        self.last_error = Some(err.to_string());
        err
    }
}

/// The onboarding state machine for a single psychologist.
pub struct OnboardingSequencer {
    collaborators: Collaborators,
    settings: SequencerSettings,
    inner: RwLock<Inner>,
}

impl OnboardingSequencer {
    pub fn new(collaborators: Collaborators, settings: SequencerSettings) -> Self {
        Self {
            collaborators,
            settings,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn snapshot(&self) -> OnboardingSnapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn state(&self) -> OnboardingState {
        self.inner.read().await.state.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.inner.read().await.pending.is_some()
    }

    /// Lock the state for `action`, refusing if a call is in flight or the
    /// current step does not offer the action.
    async fn begin(&self, action: Action) -> Result<RwLockWriteGuard<'_, Inner>, OnboardingError> {
        let mut inner = self.inner.write().await;
        if inner.pending.is_some() {
            return Err(inner.fail(OnboardingError::Busy));
        }
        let step = inner.state.step();
        if !step.offers(action) {
            return Err(inner.fail(OnboardingError::StepUnavailable { action, step }));
        }
        inner.last_error = None;
        Ok(inner)
    }

    pub fn upload_policy(&self) -> &UploadPolicy {
        &self.settings.policy
    }

    /// Step 1: record a CV that was refused while it was still arriving, as
    /// [`select_document`](Self::select_document) would have.
    pub async fn reject_document(&self, reason: ValidationError) -> OnboardingError {
        match self.begin(Action::SelectDocument).await {
            Ok(mut inner) => {
                tracing::info!(error = %reason, "CV rejected while uploading");
                inner.fail(reason.into())
            }
            Err(e) => e,
        }
    }

    /// Step 1: validate the CV and send it to the extraction service.
    pub async fn select_document(
        &self,
        document: UploadedDocument,
    ) -> Result<OnboardingSnapshot, OnboardingError> {
        {
            let mut inner = self.begin(Action::SelectDocument).await?;
            if let Err(e) = self.settings.policy.check(&document) {
                tracing::info!(filename = %document.filename, error = %e, "CV rejected before upload");
                return Err(inner.fail(e.into()));
            }
            inner.pending = Some(PendingAction::Extracting {
                filename: document.filename.clone(),
            });
        }

        tracing::info!(
            filename = %document.filename,
            size = document.size(),
            "Sending CV to extraction service"
        );
        let outcome = self.collaborators.extraction.extract(document).await;

        let mut inner = self.inner.write().await;
        inner.pending = None;
        match outcome {
            Ok(profile) => {
                inner.state = OnboardingState::ReviewingProfile { profile };
                inner.last_error = None;
                Ok(inner.snapshot())
            }
            Err(e) => {
                tracing::warn!(error = %e, "CV extraction failed");
                Err(inner.fail(e.into()))
            }
        }
    }

    /// Step 2: replace the fields under review with the user's edits.
    pub async fn update_profile(
        &self,
        edited: ExtractedProfile,
    ) -> Result<OnboardingSnapshot, OnboardingError> {
        let mut inner = self.begin(Action::UpdateProfile).await?;
        if let OnboardingState::ReviewingProfile { profile } = &mut inner.state {
            *profile = edited;
        }
        Ok(inner.snapshot())
    }

    /// Step 2: register the reviewed profile.
    pub async fn submit(&self) -> Result<OnboardingSnapshot, OnboardingError> {
        let profile = {
            let mut inner = self.begin(Action::Submit).await?;
            let Some(profile) = inner.state.profile().cloned() else {
                let step = inner.state.step();
                return Err(inner.fail(OnboardingError::StepUnavailable {
                    action: Action::Submit,
                    step,
                }));
            };
            if let Some(field) = profile.missing_required() {
                return Err(inner.fail(ValidationError::MissingField(field).into()));
            }
            inner.pending = Some(PendingAction::Registering {
                email: profile.email.trim().to_string(),
            });
            profile
        };

        let outcome = register_profile(
            self.collaborators.registry.as_ref(),
            &profile,
            &self.settings.defaults,
        )
        .await;

        let mut inner = self.inner.write().await;
        inner.pending = None;
        match outcome {
            Ok(profile_id) => {
                inner.state = OnboardingState::AwaitingCalendarLink { profile_id };
                inner.last_error = None;
                Ok(inner.snapshot())
            }
            Err(e) => {
                tracing::warn!(email = %profile.email, error = %e, "Profile submission failed");
                Err(inner.fail(e))
            }
        }
    }

    /// Step 2: discard the extracted profile and start over.
    pub async fn back(&self) -> Result<OnboardingSnapshot, OnboardingError> {
        let mut inner = self.begin(Action::Back).await?;
        inner.state = OnboardingState::AwaitingDocument;
        Ok(inner.snapshot())
    }

    /// Step 3: hand over to calendar authorization. The OAuth flow finishes
    /// outside the sequencer, which considers onboarding complete.
    pub async fn connect_calendar(&self) -> Result<CalendarHandoff, OnboardingError> {
        let mut inner = self.begin(Action::ConnectCalendar).await?;
        let Some(profile_id) = inner.state.profile_id().cloned() else {
            let step = inner.state.step();
            return Err(inner.fail(OnboardingError::StepUnavailable {
                action: Action::ConnectCalendar,
                step,
            }));
        };
        let url = match self
            .collaborators
            .calendar
            .handoff_url(&profile_id, &self.settings.return_path)
        {
            Ok(url) => url,
            Err(e) => return Err(inner.fail(e.into())),
        };

        tracing::info!(profile_id = %profile_id, "Handing off to calendar authorization");
        inner.state = OnboardingState::Completed {
            profile_id,
            calendar: CalendarChoice::Connected,
        };
        Ok(CalendarHandoff {
            redirect_url: url.to_string(),
            snapshot: inner.snapshot(),
        })
    }

    /// Step 3: finish without a calendar. A no-op once completed.
    pub async fn skip_calendar(&self) -> Result<OnboardingSnapshot, OnboardingError> {
        {
            let inner = self.inner.read().await;
            if inner.state.step().is_terminal() {
                return Ok(inner.snapshot());
            }
        }

        let mut inner = self.begin(Action::SkipCalendar).await?;
        let Some(profile_id) = inner.state.profile_id().cloned() else {
            let step = inner.state.step();
            return Err(inner.fail(OnboardingError::StepUnavailable {
                action: Action::SkipCalendar,
                step,
            }));
        };
        tracing::info!(profile_id = %profile_id, "Calendar step skipped");
        inner.state = OnboardingState::Completed {
            profile_id,
            calendar: CalendarChoice::Skipped,
        };
        Ok(inner.snapshot())
    }
}
