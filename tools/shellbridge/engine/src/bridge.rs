use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::format::{MAX_MESSAGE_CHARS, render, split_chunks};
use crate::gate::ReplyGate;
use crate::interpreter::CommandInterpreter;
use crate::session::{ConversationId, MessageId, SenderId, SessionStore};
use crate::transport::{InboundMessage, Transport};

pub const USAGE: &str = "Shell bridge active.\n\
/term on  -> reply mode: reply to the prompt message to run commands\n\
/term off -> leave reply mode\n\
/r <cmd>  -> run a command directly\n\
/id       -> show this conversation id\n\
Examples: ls, cd .., pwd, df -h";
pub const PROMPT_TEXT: &str = "Terminal mode ON. Reply to this message to run commands.";
pub const TERM_OFF_TEXT: &str = "Terminal mode OFF.";
pub const TERM_USAGE: &str = "usage: term on | term off";
pub const RUN_USAGE: &str = "usage: r <command>";
pub const REFUSAL: &str = "Not allowed.";

#[derive(Debug, Clone, Eq, PartialEq)]
enum OperatorCommand {
    Start,
    Id,
    TermOn,
    TermOff,
    TermUsage,
    Run(String),
    Unknown(String),
}

impl OperatorCommand {
    fn parse(name: &str, args: &[String]) -> Self {
        match name.trim_start_matches('/').to_lowercase().as_str() {
            "start" => Self::Start,
            "id" => Self::Id,
            "term" => match args.first().map(|arg| arg.to_lowercase()).as_deref() {
                Some("on") => Self::TermOn,
                Some("off") => Self::TermOff,
                _ => Self::TermUsage,
            },
            "r" => Self::Run(args.join(" ")),
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// Routes inbound messages through the gate, the interpreter, the formatter and the audit log.
pub struct Bridge {
    store: SessionStore,
    gate: ReplyGate,
    interpreter: CommandInterpreter,
    audit: AuditLog,
}

impl Bridge {
    pub fn new(
        store: SessionStore,
        gate: ReplyGate,
        interpreter: CommandInterpreter,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            gate,
            interpreter,
            audit,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn gate(&self) -> &ReplyGate {
        &self.gate
    }

    /// Handles one inbound message to completion. Messages of the same conversation are
    /// handled one at a time.
    pub async fn handle(&self, message: InboundMessage, transport: &dyn Transport) {
        let lock = self.store.conversation_lock(message.conversation_id());
        let _guard = lock.lock().await;

        match message {
            InboundMessage::Command {
                conversation_id,
                sender_id,
                message_id,
                name,
                args,
            } => {
                let command = OperatorCommand::parse(&name, &args);
                self.handle_command(conversation_id, sender_id, message_id, command, transport)
                    .await;
            }
            InboundMessage::Text {
                conversation_id,
                sender_id,
                message_id,
                reply_to,
                text,
            } => {
                let admitted =
                    self.gate
                        .admit(&self.store, conversation_id, sender_id, reply_to, &text);
                if let Some(command) = admitted {
                    self.execute(conversation_id, message_id, command, transport)
                        .await;
                }
            }
        }
    }

    async fn handle_command(
        &self,
        conversation: ConversationId,
        sender: SenderId,
        message_id: MessageId,
        command: OperatorCommand,
        transport: &dyn Transport,
    ) {
        let owner = self.gate.authorize(sender);

        match command {
            OperatorCommand::Start => {
                self.reply(transport, conversation, message_id, USAGE).await;
            }
            OperatorCommand::Id => {
                let text = format!("conversation id: {conversation}");
                self.reply(transport, conversation, message_id, &text).await;
            }
            OperatorCommand::TermOn | OperatorCommand::TermOff | OperatorCommand::TermUsage
                if !owner =>
            {
                info!(conversation = %conversation, sender = sender.0, "refused term command from non-owner");
                self.reply(transport, conversation, message_id, REFUSAL).await;
            }
            OperatorCommand::TermOn => {
                match transport
                    .send(conversation, Some(message_id), PROMPT_TEXT)
                    .await
                {
                    Ok(prompt_id) => {
                        self.gate.arm(&self.store, conversation, prompt_id);
                        info!(conversation = %conversation, prompt_id = %prompt_id, "terminal mode armed");
                    }
                    Err(err) => {
                        warn!(?err, conversation = %conversation, "failed to send terminal prompt");
                    }
                }
            }
            OperatorCommand::TermOff => {
                self.gate.disarm(&self.store, conversation);
                info!(conversation = %conversation, "terminal mode disarmed");
                self.reply(transport, conversation, message_id, TERM_OFF_TEXT)
                    .await;
            }
            OperatorCommand::TermUsage => {
                self.reply(transport, conversation, message_id, TERM_USAGE)
                    .await;
            }
            OperatorCommand::Run(_) if !owner => {
                debug!(conversation = %conversation, sender = sender.0, "ignoring run command from non-owner");
            }
            OperatorCommand::Run(line) => {
                if line.trim().is_empty() {
                    self.reply(transport, conversation, message_id, RUN_USAGE)
                        .await;
                    return;
                }
                self.execute(conversation, message_id, &line, transport)
                    .await;
            }
            OperatorCommand::Unknown(name) => {
                debug!(conversation = %conversation, command = %name, "ignoring unknown command");
            }
        }
    }

    async fn execute(
        &self,
        conversation: ConversationId,
        message_id: MessageId,
        line: &str,
        transport: &dyn Transport,
    ) {
        let line = line.trim();
        let Some(result) = self
            .interpreter
            .interpret(&self.store, conversation, line)
            .await
        else {
            return;
        };

        info!(
            conversation = %conversation,
            command = %line,
            exit_code = result.exit_code,
            "command finished"
        );

        let block = render(
            &result.working_directory_after,
            line,
            result.exit_code,
            &result.output,
        );
        self.reply(transport, conversation, message_id, &block).await;
        self.audit.record(&block).await;
    }

    /// Sends `text` as one or more chunks replying to `message_id`. Failures are logged and do
    /// not stop the remaining chunks.
    async fn reply(
        &self,
        transport: &dyn Transport,
        conversation: ConversationId,
        message_id: MessageId,
        text: &str,
    ) {
        for chunk in split_chunks(text, MAX_MESSAGE_CHARS) {
            if let Err(err) = transport.send(conversation, Some(message_id), &chunk).await {
                warn!(?err, conversation = %conversation, "failed to send reply chunk");
            }
        }
    }
}
