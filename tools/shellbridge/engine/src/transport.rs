use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{ConversationId, MessageId, SenderId};

/// Messages delivered by the chat adapter. Command names and arguments arrive already
/// tokenized.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Command {
        conversation_id: ConversationId,
        sender_id: SenderId,
        message_id: MessageId,
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Text {
        conversation_id: ConversationId,
        sender_id: SenderId,
        message_id: MessageId,
        #[serde(default)]
        reply_to: Option<MessageId>,
        text: String,
    },
}

impl InboundMessage {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Command {
                conversation_id, ..
            }
            | Self::Text {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Send {
        conversation_id: ConversationId,
        message_id: MessageId,
        reply_to: Option<MessageId>,
        text: String,
    },
    Error {
        message: String,
    },
}

/// Outbound half of the chat channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message and returns the id it was assigned.
    async fn send(
        &self,
        conversation: ConversationId,
        reply_to: Option<MessageId>,
        text: &str,
    ) -> Result<MessageId>;
}

/// Forwards messages to a frontend writer task. Message ids are allocated here and reported
/// in each [`OutboundEvent::Send`]; the counter is shared across connections so a reconnecting
/// adapter never sees an id reused.
pub struct ChannelTransport {
    events: mpsc::UnboundedSender<OutboundEvent>,
    next_message_id: Arc<AtomicI64>,
}

impl ChannelTransport {
    pub fn new(
        events: mpsc::UnboundedSender<OutboundEvent>,
        next_message_id: Arc<AtomicI64>,
    ) -> Self {
        Self {
            events,
            next_message_id,
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        conversation: ConversationId,
        reply_to: Option<MessageId>,
        text: &str,
    ) -> Result<MessageId> {
        let message_id = MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.events
            .send(OutboundEvent::Send {
                conversation_id: conversation,
                message_id,
                reply_to,
                text: text.to_owned(),
            })
            .context("frontend writer is gone")?;
        Ok(message_id)
    }
}

/// Prints messages to stdout for the local console mode.
#[derive(Default)]
pub struct ConsoleTransport {
    next_message_id: AtomicI64,
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(
        &self,
        _conversation: ConversationId,
        _reply_to: Option<MessageId>,
        text: &str,
    ) -> Result<MessageId> {
        let message_id = MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}")?;
        stdout.flush()?;
        Ok(message_id)
    }
}
