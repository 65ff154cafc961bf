//! In-memory conversation sessions.
//!
//! State lives behind a `parking_lot` mutex that is never held across an
//! `.await`; a separate async mutex serializes sandbox deploys so one
//! conversation never races itself into two sandboxes.

use super::{Conversation, Transition, TransitionError, TurnPhase};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    state: Mutex<Conversation>,
    last_active: Mutex<Instant>,
    pub(crate) deploy_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(conversation: Conversation) -> Arc<Self> {
        Arc::new(Self {
            id: conversation.id,
            state: Mutex::new(conversation),
            last_active: Mutex::new(Instant::now()),
            deploy_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Conversation {
        self.state.lock().clone()
    }

    pub fn apply(&self, transition: Transition) -> Result<(), TransitionError> {
        self.touch();
        self.state.lock().apply(transition)
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Time since the session was last looked up or changed.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    /// Idle past `ttl` and not mid-turn or mid-deploy.
    fn is_expired(&self, ttl: Duration) -> bool {
        self.idle_for() >= ttl
            && self.with_state(|c| c.phase) == TurnPhase::AwaitingUser
            && self.deploy_lock.try_lock().is_ok()
    }

    /// Run `f` against the state while holding the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&Conversation) -> R) -> R {
        f(&self.state.lock())
    }
}

/// All live conversations, keyed by id. Nothing is persisted; sessions the
/// browser abandons are dropped by [`SessionStore::evict_idle`] or removed
/// explicitly.
pub struct SessionStore {
    sessions: DashMap<Uuid, Arc<Session>>,
    system_prompt: String,
}

impl SessionStore {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            system_prompt: system_prompt.into(),
        }
    }

    pub fn create(&self) -> Arc<Session> {
        let session = Session::new(Conversation::new(&self.system_prompt));
        self.sessions.insert(session.id(), session.clone());
        tracing::debug!(conversation = %session.id(), "Conversation created");
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.get(&id).map(|entry| entry.value().clone())?;
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.sessions.remove(&id).is_some()
    }

    /// Drop sessions idle for at least `ttl`. Returns how many were removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(ttl));
        before - self.sessions.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
