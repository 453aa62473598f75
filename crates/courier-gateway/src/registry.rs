use anyhow::Result;
use chrono::{DateTime, Utc};
use courier_core::{ConversationKey, InvocationMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session_store::DiskSessionStore;

/// Durable state of one conversation or task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Session {
    pub key: ConversationKey,
    /// Assigned by the agent on the first turn; reused until reset.
    pub session_id: Option<String>,
    pub message_count: u64,
    pub total_cost_usd: f64,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            session_id: None,
            message_count: 0,
            total_cost_usd: 0.0,
            last_activity: Utc::now(),
        }
    }

    fn clear(&mut self) {
        self.session_id = None;
        self.message_count = 0;
        self.total_cost_usd = 0.0;
        self.last_activity = Utc::now();
    }
}

/// Snapshot returned by [`SessionRegistry::status`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SessionStatus {
    pub session: Session,
    pub busy: bool,
}

#[derive(Debug)]
struct PendingProcess {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SlotState {
    session: Session,
    /// Present iff the session is busy.
    pending: Option<PendingProcess>,
    /// Bumped on every reset; turns started under an older generation no
    /// longer write to the session.
    generation: u64,
}

#[derive(Debug)]
struct SessionSlot {
    state: Mutex<SlotState>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            state: Mutex::new(SlotState {
                session,
                pending: None,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().expect("session slot lock poisoned")
    }
}

/// Map from conversation identity to session state and in-flight process.
///
/// The outer map lock is only held to look up or insert a slot, so work on
/// different conversations never contends. Everything touching one session
/// happens under that session's slot lock, including the write-through to
/// disk.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    slots: Mutex<HashMap<ConversationKey, Arc<SessionSlot>>>,
    store: Option<DiskSessionStore>,
}

impl SessionRegistry {
    /// Registry backed by `dir`, preloaded with every session stored there.
    pub(crate) fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let store = DiskSessionStore::new(dir)?;
        let slots = store
            .load_all()?
            .into_iter()
            .map(|session| (session.key.clone(), Arc::new(SessionSlot::new(session))))
            .collect::<HashMap<_, _>>();
        Ok(Self {
            slots: Mutex::new(slots),
            store: Some(store),
        })
    }

    pub(crate) fn in_memory() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().expect("session map lock poisoned").len()
    }

    pub(crate) fn contains(&self, key: &ConversationKey) -> bool {
        self.slots
            .lock()
            .expect("session map lock poisoned")
            .contains_key(key)
    }

    /// The session for `key`, created (and persisted) on first use.
    pub(crate) fn resolve(&self, key: &ConversationKey) -> Session {
        self.slot(key).lock().session.clone()
    }

    pub(crate) fn status(&self, key: &ConversationKey) -> SessionStatus {
        let slot = self.slot(key);
        let state = slot.lock();
        SessionStatus {
            session: state.session.clone(),
            busy: state.pending.is_some(),
        }
    }

    /// Claim the session for one turn. `None` means a turn is already in
    /// flight. The session goes idle again when the guard is dropped.
    pub(crate) fn mark_busy(self: &Arc<Self>, key: &ConversationKey) -> Option<TurnGuard> {
        let slot = self.slot(key);
        let generation = {
            let mut state = slot.lock();
            if state.pending.is_some() {
                return None;
            }
            state.pending = Some(PendingProcess {
                cancel: CancellationToken::new(),
                started_at: Utc::now(),
            });
            state.generation
        };
        debug!(session = %key, "session marked busy");
        Some(TurnGuard {
            registry: Arc::clone(self),
            slot,
            key: key.clone(),
            generation,
        })
    }

    /// Signal the in-flight process, if any. Session state is untouched.
    pub(crate) fn stop(&self, key: &ConversationKey) -> bool {
        let Some(slot) = self.existing_slot(key) else {
            return false;
        };
        let state = slot.lock();
        match &state.pending {
            Some(pending) => {
                info!(
                    session = %key,
                    running_for_ms = (Utc::now() - pending.started_at).num_milliseconds(),
                    "stopping agent turn"
                );
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop any in-flight process, then discard the session id and counters.
    /// The identity itself stays registered. Returns whether a process was
    /// signalled.
    pub(crate) fn reset(&self, key: &ConversationKey) -> bool {
        let slot = self.slot(key);
        let mut state = slot.lock();
        let stopped = match &state.pending {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        };
        state.session.clear();
        state.generation += 1;
        self.persist(&state.session);
        info!(session = %key, stopped, "session reset");
        stopped
    }

    /// Clear the pending process, signalling it first in case the turn was
    /// abandoned before its process exited.
    fn mark_idle(&self, slot: &SessionSlot, key: &ConversationKey) {
        let pending = slot.lock().pending.take();
        if let Some(pending) = pending {
            pending.cancel.cancel();
        }
        debug!(session = %key, "session marked idle");
    }

    fn slot(&self, key: &ConversationKey) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().expect("session map lock poisoned");
        if let Some(slot) = slots.get(key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(SessionSlot::new(Session::new(key.clone())));
        slots.insert(key.clone(), Arc::clone(&slot));
        drop(slots);

        let state = slot.lock();
        debug!(session = %key, "session created");
        self.persist(&state.session);
        drop(state);
        slot
    }

    fn existing_slot(&self, key: &ConversationKey) -> Option<Arc<SessionSlot>> {
        self.slots
            .lock()
            .expect("session map lock poisoned")
            .get(key)
            .map(Arc::clone)
    }

    fn persist(&self, session: &Session) {
        if let Some(store) = &self.store
            && let Err(error) = store.save(session)
        {
            warn!(session = %session.key, error = %format!("{error:#}"), "failed to persist session");
        }
    }
}

/// Exclusive claim on a session for the duration of one turn.
///
/// Dropping the guard cancels and clears the pending process and the busy
/// flag, however the turn ended.
#[derive(Debug)]
pub(crate) struct TurnGuard {
    registry: Arc<SessionRegistry>,
    slot: Arc<SessionSlot>,
    key: ConversationKey,
    generation: u64,
}

impl TurnGuard {
    pub(crate) fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Session id to resume, or `None` to start a new session.
    pub(crate) fn session_id(&self) -> Option<String> {
        self.slot.lock().session.session_id.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.slot
            .lock()
            .pending
            .as_ref()
            .map(|pending| pending.cancel.clone())
            .unwrap_or_default()
    }

    /// Discard the session id and counters before running, keeping the claim.
    pub(crate) fn start_fresh(&mut self) {
        let mut state = self.slot.lock();
        state.session.clear();
        state.generation += 1;
        self.generation = state.generation;
        self.registry.persist(&state.session);
    }

    /// Count a turn that the agent accepted.
    pub(crate) fn record_start(&self, mode: &InvocationMode) {
        self.update(|session| {
            session.session_id = Some(mode.session_id().to_owned());
            session.message_count += 1;
            session.last_activity = Utc::now();
        });
    }

    /// Adopt the id the agent reports for this session.
    pub(crate) fn record_session_id(&self, session_id: &str) {
        self.update(|session| {
            if session.session_id.as_deref() != Some(session_id) {
                debug!(session = %session.key, session_id, "agent session id recorded");
                session.session_id = Some(session_id.to_owned());
            }
        });
    }

    pub(crate) fn add_cost(&self, cost_usd: f64) {
        self.update(|session| {
            session.total_cost_usd += cost_usd;
            session.last_activity = Utc::now();
        });
    }

    fn update(&self, apply: impl FnOnce(&mut Session)) {
        let mut state = self.slot.lock();
        if state.generation != self.generation {
            debug!(session = %self.key, "session was reset during turn, discarding update");
            return;
        }
        apply(&mut state.session);
        self.registry.persist(&state.session);
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.registry.mark_idle(&self.slot, &self.key);
    }
}
