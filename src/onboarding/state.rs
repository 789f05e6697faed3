//! Onboarding state machine: which step the psychologist is on, and the data
//! that step owns.
//!
//! Each step's data lives inside its own variant, so a profile id cannot
//! exist before the profile was registered and the extracted fields cannot
//! outlive the review step.

use serde::Serialize;

use super::model::{ExtractedProfile, ProfileId};

/// The steps of the onboarding wizard.
///
/// Progresses linearly: AwaitingDocument → ReviewingProfile →
/// AwaitingCalendarLink → Completed, with a single way back from
/// ReviewingProfile to AwaitingDocument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    AwaitingDocument,
    ReviewingProfile,
    AwaitingCalendarLink,
    Completed,
}

impl OnboardingStep {
    /// Actions the step offers.
    pub fn actions(&self) -> &'static [Action] {
        match self {
            Self::AwaitingDocument => &[Action::SelectDocument],
            Self::ReviewingProfile => &[Action::UpdateProfile, Action::Submit, Action::Back],
            Self::AwaitingCalendarLink => &[Action::ConnectCalendar, Action::SkipCalendar],
            Self::Completed => &[],
        }
    }

    pub fn offers(&self, action: Action) -> bool {
        self.actions().contains(&action)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingDocument => "awaiting_document",
            Self::ReviewingProfile => "reviewing_profile",
            Self::AwaitingCalendarLink => "awaiting_calendar_link",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// User-facing actions of the wizard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SelectDocument,
    UpdateProfile,
    Submit,
    Back,
    ConnectCalendar,
    SkipCalendar,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SelectDocument => "select_document",
            Self::UpdateProfile => "update_profile",
            Self::Submit => "submit",
            Self::Back => "back",
            Self::ConnectCalendar => "connect_calendar",
            Self::SkipCalendar => "skip_calendar",
        };
        write!(f, "{s}")
    }
}

/// How the calendar step was left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarChoice {
    /// Handed off to the calendar provider's consent screen.
    Connected,
    Skipped,
}

/// Current step together with the data it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum OnboardingState {
    #[default]
    AwaitingDocument,
    ReviewingProfile {
        profile: ExtractedProfile,
    },
    AwaitingCalendarLink {
        profile_id: ProfileId,
    },
    Completed {
        profile_id: ProfileId,
        calendar: CalendarChoice,
    },
}

impl OnboardingState {
    pub fn step(&self) -> OnboardingStep {
        match self {
            Self::AwaitingDocument => OnboardingStep::AwaitingDocument,
            Self::ReviewingProfile { .. } => OnboardingStep::ReviewingProfile,
            Self::AwaitingCalendarLink { .. } => OnboardingStep::AwaitingCalendarLink,
            Self::Completed { .. } => OnboardingStep::Completed,
        }
    }

    /// The profile under review, if the wizard is on the review step.
    pub fn profile(&self) -> Option<&ExtractedProfile> {
        match self {
            Self::ReviewingProfile { profile } => Some(profile),
            _ => None,
        }
    }

    /// The registered id, present from the calendar step onwards.
    pub fn profile_id(&self) -> Option<&ProfileId> {
        match self {
            Self::AwaitingCalendarLink { profile_id } | Self::Completed { profile_id, .. } => {
                Some(profile_id)
            }
            _ => None,
        }
    }
}

/// A collaborator call currently in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PendingAction {
    Extracting { filename: String },
    Registering { email: String },
}
