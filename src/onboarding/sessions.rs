//! In-memory onboarding sessions, one sequencer per browser.
//!
//! Sessions are dropped once idle past their time to live, sooner when the
//! wizard is already finished. At capacity the least recently used session
//! makes room for a new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::sequencer::{Collaborators, OnboardingSequencer, SequencerSettings};

/// How long sessions live and how many are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Unfinished sessions untouched for this long are dropped.
    pub idle_ttl: Duration,
    /// Finished sessions untouched for this long are dropped.
    pub completed_ttl: Duration,
    pub max_sessions: usize,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(2 * 60 * 60),
            completed_ttl: Duration::from_secs(10 * 60),
            max_sessions: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Session {
    sequencer: Arc<OnboardingSequencer>,
    touched: Instant,
}

/// Hands out sequencers keyed by session id.
pub struct OnboardingSessions {
    collaborators: Collaborators,
    settings: SequencerSettings,
    limits: SessionLimits,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl OnboardingSessions {
    pub fn new(
        collaborators: Collaborators,
        settings: SequencerSettings,
        limits: SessionLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            collaborators,
            settings,
            limits,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Start a fresh wizard.
    pub async fn create(&self) -> (Uuid, Arc<OnboardingSequencer>) {
        if self.len().await >= self.limits.max_sessions {
            self.expire_idle().await;
        }

        let id = Uuid::new_v4();
        let sequencer = Arc::new(OnboardingSequencer::new(
            self.collaborators.clone(),
            self.settings.clone(),
        ));
        let mut sessions = self.sessions.write().await;
        while sessions.len() >= self.limits.max_sessions.max(1) {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.touched)
                .map(|(id, _)| *id)
            else {
                break;
            };
            sessions.remove(&oldest);
            tracing::warn!(session = %oldest, "Session limit reached, evicted least recently used");
        }
        sessions.insert(
            id,
            Session {
                sequencer: Arc::clone(&sequencer),
                touched: Instant::now(),
            },
        );
        tracing::info!(session = %id, "Onboarding session started");
        (id, sequencer)
    }

    /// Look up a session and mark it as used.
    pub async fn get(&self, id: Uuid) -> Option<Arc<OnboardingSequencer>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id)?;
        session.touched = Instant::now();
        Some(Arc::clone(&session.sequencer))
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        self.sessions.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop sessions idle past their time to live. Returns how many went.
    pub async fn expire_idle(&self) -> usize {
        let shortest = self.limits.idle_ttl.min(self.limits.completed_ttl);
        let candidates: Vec<(Uuid, Arc<OnboardingSequencer>, Instant)> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.touched.elapsed() >= shortest)
            .map(|(id, s)| (*id, Arc::clone(&s.sequencer), s.touched))
            .collect();

        let mut expired = Vec::new();
        for (id, sequencer, touched) in candidates {
            if sequencer.is_busy().await {
                continue;
            }
            let ttl = if sequencer.state().await.step().is_terminal() {
                self.limits.completed_ttl
            } else {
                self.limits.idle_ttl
            };
            if touched.elapsed() >= ttl {
                expired.push((id, touched));
            }
        }

        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for (id, touched) in expired {
            // Skip sessions used again since the scan.
            if sessions.get(&id).is_some_and(|s| s.touched == touched) {
                sessions.remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, remaining = sessions.len(), "Expired idle onboarding sessions");
        }
        removed
    }
}

/// Periodically drop expired sessions.
pub fn spawn_sweep_task(sessions: Arc<OnboardingSessions>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sessions.limits().sweep_interval);
        loop {
            interval.tick().await;
            sessions.expire_idle().await;
        }
    })
}
