use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(pub i64);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reply-correlation state of one conversation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GateState {
    Off,
    Armed(MessageId),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConversationSession {
    pub working_directory: PathBuf,
    pub terminal_mode_enabled: bool,
    pub pending_prompt_id: Option<MessageId>,
}

impl ConversationSession {
    fn new(working_directory: PathBuf) -> Self {
        Self {
            working_directory,
            terminal_mode_enabled: false,
            pending_prompt_id: None,
        }
    }

    pub fn gate_state(&self) -> GateState {
        match (self.terminal_mode_enabled, self.pending_prompt_id) {
            (true, Some(prompt_id)) => GateState::Armed(prompt_id),
            _ => GateState::Off,
        }
    }
}

/// Volatile per-conversation state, keyed by conversation id.
///
/// Every operation takes the map lock for its own duration only. Callers that need a
/// read-modify-write across an `.await` hold the conversation lock from
/// [`SessionStore::conversation_lock`] instead.
pub struct SessionStore {
    initial_directory: PathBuf,
    sessions: Mutex<HashMap<ConversationId, ConversationSession>>,
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(initial_directory: impl Into<PathBuf>) -> Self {
        Self {
            initial_directory: initial_directory.into(),
            sessions: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: ConversationId) -> ConversationSession {
        self.sessions()
            .entry(id)
            .or_insert_with(|| ConversationSession::new(self.initial_directory.clone()))
            .clone()
    }

    pub fn working_directory(&self, id: ConversationId) -> PathBuf {
        self.get(id).working_directory
    }

    pub fn set_working_directory(&self, id: ConversationId, path: PathBuf) {
        self.with_session(id, |session| session.working_directory = path);
    }

    /// Enables terminal mode with `prompt_id` as the only eligible reply target. Re-arming
    /// replaces any previous prompt.
    pub fn arm_terminal(&self, id: ConversationId, prompt_id: MessageId) {
        self.with_session(id, |session| {
            session.terminal_mode_enabled = true;
            session.pending_prompt_id = Some(prompt_id);
        });
    }

    pub fn disarm_terminal(&self, id: ConversationId) {
        self.with_session(id, |session| {
            session.terminal_mode_enabled = false;
            session.pending_prompt_id = None;
        });
    }

    pub fn gate_state(&self, id: ConversationId) -> GateState {
        self.get(id).gate_state()
    }

    pub fn is_eligible_reply(&self, id: ConversationId, replied_to: Option<MessageId>) -> bool {
        match (self.gate_state(id), replied_to) {
            (GateState::Armed(prompt_id), Some(target)) => prompt_id == target,
            _ => false,
        }
    }

    /// Serializes handling of messages within one conversation.
    pub fn conversation_lock(&self, id: ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }

    pub fn reset(&self) {
        self.sessions().clear();
    }

    fn with_session<F>(&self, id: ConversationId, mutate: F)
    where
        F: FnOnce(&mut ConversationSession),
    {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(id)
            .or_insert_with(|| ConversationSession::new(self.initial_directory.clone()));
        mutate(session);
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConversationId, ConversationSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: ConversationId = ConversationId(42);

    #[test]
    fn first_access_creates_default_session() {
        let store = SessionStore::new("/srv");
        let session = store.get(CHAT);
        assert_eq!(session.working_directory, PathBuf::from("/srv"));
        assert!(!session.terminal_mode_enabled);
        assert_eq!(session.pending_prompt_id, None);
        assert_eq!(session.gate_state(), GateState::Off);
    }

    #[test]
    fn sessions_are_isolated_per_conversation() {
        let store = SessionStore::new("/srv");
        store.set_working_directory(CHAT, PathBuf::from("/tmp"));
        store.arm_terminal(CHAT, MessageId(7));

        let other = store.get(ConversationId(43));
        assert_eq!(other.working_directory, PathBuf::from("/srv"));
        assert_eq!(other.gate_state(), GateState::Off);
        assert_eq!(store.working_directory(CHAT), PathBuf::from("/tmp"));
    }

    #[test]
    fn only_the_latest_prompt_is_eligible() {
        let store = SessionStore::new("/srv");
        store.arm_terminal(CHAT, MessageId(1));
        assert!(store.is_eligible_reply(CHAT, Some(MessageId(1))));

        store.disarm_terminal(CHAT);
        assert!(!store.is_eligible_reply(CHAT, Some(MessageId(1))));

        store.arm_terminal(CHAT, MessageId(2));
        assert!(!store.is_eligible_reply(CHAT, Some(MessageId(1))));
        assert!(store.is_eligible_reply(CHAT, Some(MessageId(2))));
        assert!(!store.is_eligible_reply(CHAT, None));
    }

    #[test]
    fn reset_forgets_everything() {
        let store = SessionStore::new("/srv");
        store.arm_terminal(CHAT, MessageId(9));
        store.set_working_directory(CHAT, PathBuf::from("/tmp"));
        store.reset();

        assert_eq!(store.gate_state(CHAT), GateState::Off);
        assert_eq!(store.working_directory(CHAT), PathBuf::from("/srv"));
    }

    #[test]
    fn conversation_lock_is_shared_per_id() {
        let store = SessionStore::new("/srv");
        let first = store.conversation_lock(CHAT);
        let second = store.conversation_lock(CHAT);
        let other = store.conversation_lock(ConversationId(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
