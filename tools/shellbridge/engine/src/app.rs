use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::audit::AuditLog;
use crate::bridge::Bridge;
use crate::cli::{Cli, Mode};
use crate::config::RuntimeConfig;
use crate::executor::ProcessExecutor;
use crate::gate::ReplyGate;
use crate::interpreter::CommandInterpreter;
use crate::session::{ConversationId, MessageId, SessionStore};
use crate::transport::{ChannelTransport, ConsoleTransport, InboundMessage, OutboundEvent};

const DEFAULT_SOCKET_PATH: &str = "/tmp/shellbridge.sock";
const DEFAULT_PID_PATH: &str = "/tmp/shellbridge.pid";
const CONSOLE_CONVERSATION: ConversationId = ConversationId(0);

struct PidFileGuard {
    path: String,
    pid: u32,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return,
        };

        let parsed = content.trim().parse::<u32>().ok();
        if parsed == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub fn build_bridge(cfg: &RuntimeConfig) -> Bridge {
    let executor = ProcessExecutor::new(
        cfg.shell.clone(),
        cfg.shell_args.clone(),
        cfg.command_timeout,
    );
    Bridge::new(
        SessionStore::new(cfg.cwd.clone()),
        ReplyGate::new(cfg.owner),
        CommandInterpreter::new(executor),
        AuditLog::new(cfg.audit_log_path.clone()),
    )
}

pub async fn run(cli: Cli) -> Result<()> {
    let cfg = RuntimeConfig::load_from_env()?.with_timeout_secs(cli.timeout_secs)?;
    cfg.preflight()?;
    tracing::info!(
        owner = ?cfg.owner,
        shell = %cfg.shell,
        shell_args = ?cfg.shell_args,
        timeout_secs = cfg.command_timeout.as_secs(),
        audit_log = %cfg.audit_log_path.display(),
        cwd = %cfg.cwd.display(),
        "starting shellbridge runtime",
    );

    let bridge = Arc::new(build_bridge(&cfg));

    match cli.mode {
        Mode::Cli => run_cli(cli, bridge).await,
        Mode::Server => run_server(cli, bridge).await,
    }
}

async fn run_cli(cli: Cli, bridge: Arc<Bridge>) -> Result<()> {
    let transport = ConsoleTransport::default();
    let mut next_message_id = 0_i64;
    let mut console_message = |line: &str| {
        next_message_id += 1;
        InboundMessage::Command {
            conversation_id: CONSOLE_CONVERSATION,
            sender_id: bridge.gate().owner().principal(),
            message_id: MessageId(next_message_id),
            name: "r".to_owned(),
            args: vec![line.to_owned()],
        }
    };

    if let Some(command) = cli.command {
        let message = console_message(&command);
        bridge.handle(message, &transport).await;
        return Ok(());
    }

    println!("Enter a command (Ctrl-D to exit):");
    print!("> ");
    std::io::stdout().flush()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            let message = console_message(line);
            bridge.handle(message, &transport).await;
            println!();
        }
        print!("> ");
        std::io::stdout().flush()?;
    }

    Ok(())
}

async fn run_server(cli: Cli, bridge: Arc<Bridge>) -> Result<()> {
    let socket_path = cli
        .socket_path
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_owned());

    if Path::new(&socket_path).exists() {
        tokio::fs::remove_file(&socket_path)
            .await
            .with_context(|| format!("failed to remove existing socket {socket_path}"))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind unix socket {socket_path}"))?;

    let pid_path =
        std::env::var("SHELLBRIDGE_PID_PATH").unwrap_or_else(|_| DEFAULT_PID_PATH.to_owned());
    let pid = std::process::id();
    std::fs::write(&pid_path, format!("{pid}\n"))
        .with_context(|| format!("failed to write pid file {pid_path}"))?;
    let _pid_guard = PidFileGuard {
        path: pid_path.clone(),
        pid,
    };

    tracing::info!(socket_path = %socket_path, "adapter socket is ready");
    tracing::info!(pid, pid_file = %pid_path, "engine pid file is ready");
    println!("shellbridge-engine listening on {socket_path}");

    let message_ids = Arc::new(AtomicI64::new(0));
    loop {
        let (stream, _) = listener.accept().await.context("socket accept failed")?;
        if let Err(err) = handle_adapter_connection(stream, bridge.clone(), message_ids.clone()).await
        {
            tracing::error!(?err, "adapter connection failed");
        }
    }
}

/// Serves one chat adapter connection: line-delimited JSON [`InboundMessage`]s in,
/// line-delimited JSON [`OutboundEvent`]s out. Each message is handled on its own task.
pub async fn handle_adapter_connection(
    stream: UnixStream,
    bridge: Arc<Bridge>,
    message_ids: Arc<AtomicI64>,
) -> Result<()> {
    tracing::info!("adapter connected");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    let writer_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(?err, "failed to serialize outbound event");
                    continue;
                }
            };

            if let Err(err) = write_half.write_all(line.as_bytes()).await {
                tracing::error!(?err, "failed to write event to adapter socket");
                break;
            }
            if let Err(err) = write_half.write_all(b"\n").await {
                tracing::error!(?err, "failed to delimit outbound event line");
                break;
            }
            if let Err(err) = write_half.flush().await {
                tracing::error!(?err, "failed to flush adapter socket");
                break;
            }
        }
    });

    let transport = Arc::new(ChannelTransport::new(event_tx.clone(), message_ids));
    let mut tasks = Vec::new();

    while let Some(line) = reader.next_line().await.context("socket read failed")? {
        if line.trim().is_empty() {
            continue;
        }

        let message: InboundMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                let _ = event_tx.send(OutboundEvent::Error {
                    message: format!("invalid message payload: {err}"),
                });
                continue;
            }
        };

        tracing::debug!(
            conversation = %message.conversation_id(),
            "received message from adapter"
        );

        let bridge = bridge.clone();
        let transport = transport.clone();
        tasks.push(tokio::spawn(async move {
            bridge.handle(message, transport.as_ref()).await;
        }));
        tasks.retain(|task| !task.is_finished());
    }

    for task in tasks {
        if let Err(err) = task.await {
            tracing::error!(?err, "message handler panicked");
        }
    }

    tracing::info!("adapter disconnected");
    drop(transport);
    drop(event_tx);
    let _ = writer_task.await;
    Ok(())
}
