use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Bytes kept per stream. Anything past this is read and dropped so the child never blocks on
/// a full pipe. Comfortably above what a result block can show, even for 4-byte UTF-8.
pub const OUTPUT_CAPTURE_LIMIT: usize = 16 * 1024;

/// Outcome of one shell invocation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExecOutcome {
    /// The process exited before the deadline. `output` is stdout, then a `\n` separator when
    /// both streams are non-empty, then stderr. `truncated` is set when either stream went past
    /// [`OUTPUT_CAPTURE_LIMIT`].
    Completed {
        exit_code: i32,
        output: Vec<u8>,
        truncated: bool,
    },
    /// The deadline passed; the process group was killed and any partial output discarded.
    TimedOut,
    /// The shell could not be started.
    SpawnFailed(String),
}

#[derive(Debug, Default)]
struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: String,
    shell_args: Vec<String>,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(shell: impl Into<String>, shell_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            shell_args,
            timeout,
        }
    }

    pub async fn run(&self, command: &str, cwd: &Path) -> ExecOutcome {
        info!(
            command = %command,
            cwd = %cwd.display(),
            shell = %self.shell,
            timeout_ms = self.timeout.as_millis() as u64,
            "running shell command",
        );

        let mut process = Command::new(&self.shell);
        process
            .args(&self.shell_args)
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a timeout can take down everything the shell started.
        #[cfg(unix)]
        process.process_group(0);

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(?err, shell = %self.shell, "failed to spawn shell");
                return ExecOutcome::SpawnFailed(err.to_string());
            }
        };
        let pid = child.id();

        match tokio::time::timeout(self.timeout, capture(&mut child)).await {
            Ok(Ok((status, stdout, stderr))) => {
                let exit_code = map_exit_status(status);
                debug!(
                    exit_code,
                    stdout_bytes = stdout.bytes.len(),
                    stderr_bytes = stderr.bytes.len(),
                    truncated = stdout.truncated || stderr.truncated,
                    "shell command finished"
                );
                ExecOutcome::Completed {
                    exit_code,
                    truncated: stdout.truncated || stderr.truncated,
                    output: merge_streams(stdout.bytes, stderr.bytes),
                }
            }
            Ok(Err(err)) => {
                warn!(?err, "failed to collect shell command output");
                terminate(&mut child, pid).await;
                ExecOutcome::SpawnFailed(err.to_string())
            }
            Err(_) => {
                warn!(command = %command, pid = ?pid, "shell command timed out");
                terminate(&mut child, pid).await;
                ExecOutcome::TimedOut
            }
        }
    }
}

async fn capture(
    child: &mut Child,
) -> std::io::Result<(ExitStatus, CapturedStream, CapturedStream)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::try_join!(
        child.wait(),
        read_bounded(stdout, OUTPUT_CAPTURE_LIMIT),
        read_bounded(stderr, OUTPUT_CAPTURE_LIMIT)
    )
}

/// Reads `reader` to EOF, keeping at most `limit` bytes.
async fn read_bounded<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
) -> std::io::Result<CapturedStream> {
    let mut captured = CapturedStream::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut buf = vec![0_u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(captured)
}

/// Kills the shell's whole process group, then reaps the shell.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    #[cfg(not(unix))]
    let _ = pid;

    match child.try_wait() {
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(err) = child.kill().await {
                warn!(?err, "failed to kill shell command");
            }
        }
        Err(err) => warn!(?err, "failed to inspect shell command state"),
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg takes no pointers; the group id is the one assigned to our own child.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(?err, pgid, "failed to kill shell process group");
        }
    }
}

pub fn merge_streams(mut stdout: Vec<u8>, stderr: Vec<u8>) -> Vec<u8> {
    if !stdout.is_empty() && !stderr.is_empty() {
        stdout.push(b'\n');
    }
    stdout.extend_from_slice(&stderr);
    stdout
}

/// Decodes captured bytes, substituting U+FFFD for invalid sequences.
pub fn decode_output(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn map_exit_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    0
}
