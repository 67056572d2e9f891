//! Reply-correlation gate: decides which inbound messages may execute commands.

use tracing::debug;

use crate::session::{ConversationId, MessageId, SenderId, SessionStore};

/// Who may issue commands.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OwnerPolicy {
    /// Every sender counts as the owner. Configured with owner id `0`.
    Unrestricted,
    Only(SenderId),
}

impl OwnerPolicy {
    pub fn from_owner_id(owner_id: i64) -> Self {
        if owner_id == 0 {
            Self::Unrestricted
        } else {
            Self::Only(SenderId(owner_id))
        }
    }

    pub fn is_owner(&self, sender: SenderId) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Only(owner) => *owner == sender,
        }
    }

    /// Identity used for commands that originate locally rather than from the chat channel.
    pub fn principal(&self) -> SenderId {
        match self {
            Self::Unrestricted => SenderId(0),
            Self::Only(owner) => *owner,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplyGate {
    owner: OwnerPolicy,
}

impl ReplyGate {
    pub fn new(owner: OwnerPolicy) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> OwnerPolicy {
        self.owner
    }

    pub fn authorize(&self, sender: SenderId) -> bool {
        self.owner.is_owner(sender)
    }

    /// Returns the command text when a plain-text message is an eligible reply to the armed
    /// prompt of its conversation.
    pub fn admit<'a>(
        &self,
        store: &SessionStore,
        conversation: ConversationId,
        sender: SenderId,
        reply_to: Option<MessageId>,
        text: &'a str,
    ) -> Option<&'a str> {
        if !self.authorize(sender) {
            debug!(conversation = %conversation, sender = sender.0, "ignoring text from non-owner");
            return None;
        }
        if !store.is_eligible_reply(conversation, reply_to) {
            debug!(
                conversation = %conversation,
                reply_to = ?reply_to,
                "ignoring text that does not reply to the armed prompt"
            );
            return None;
        }
        Some(text.trim())
    }

    pub fn arm(&self, store: &SessionStore, conversation: ConversationId, prompt_id: MessageId) {
        store.arm_terminal(conversation, prompt_id);
    }

    pub fn disarm(&self, store: &SessionStore, conversation: ConversationId) {
        store.disarm_terminal(conversation);
    }
}
