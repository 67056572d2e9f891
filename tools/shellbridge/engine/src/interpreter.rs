use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::executor::{ExecOutcome, ProcessExecutor, decode_output};
use crate::format::{MAX_MESSAGE_CHARS, TRUNCATION_MARKER};
use crate::session::{ConversationId, SessionStore};

pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const TIMEOUT_MARKER: &str = "TIMEOUT";
pub const FAILURE_EXIT_CODE: i32 = 1;

const CD_OK: &str = "(cd ok)";
const CD_NOT_FOUND: &str = "cd: directory not found";
const CD_INVALID: &str = "cd: invalid arguments";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub working_directory_after: PathBuf,
    pub output: String,
}

impl ExecutionResult {
    fn new(exit_code: i32, working_directory_after: PathBuf, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            working_directory_after,
            output: output.into(),
        }
    }
}

/// What a raw command line resolves to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Invocation<'a> {
    Empty,
    Pwd,
    /// Arguments after the `cd` token, still unsplit.
    Cd(&'a str),
    Shell(&'a str),
}

pub fn classify(line: &str) -> Invocation<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Invocation::Empty;
    }
    if line == "pwd" {
        return Invocation::Pwd;
    }
    if let Some(rest) = line.strip_prefix("cd") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return Invocation::Cd(rest.trim_start());
        }
    }
    Invocation::Shell(line)
}

pub struct CommandInterpreter {
    executor: ProcessExecutor,
}

impl CommandInterpreter {
    pub fn new(executor: ProcessExecutor) -> Self {
        Self { executor }
    }

    /// Runs one command line for `conversation`. Returns `None` for an empty line.
    pub async fn interpret(
        &self,
        store: &SessionStore,
        conversation: ConversationId,
        line: &str,
    ) -> Option<ExecutionResult> {
        let cwd = store.working_directory(conversation);

        let result = match classify(line) {
            Invocation::Empty => return None,
            Invocation::Pwd => {
                let shown = cwd.display().to_string();
                ExecutionResult::new(0, cwd, shown)
            }
            Invocation::Cd(args) => change_directory(store, conversation, cwd, args),
            Invocation::Shell(command) => {
                let outcome = self.executor.run(command, &cwd).await;
                outcome_to_result(outcome, cwd)
            }
        };

        Some(result)
    }
}

fn change_directory(
    store: &SessionStore,
    conversation: ConversationId,
    cwd: PathBuf,
    args: &str,
) -> ExecutionResult {
    let Some(words) = shlex::split(args) else {
        return ExecutionResult::new(FAILURE_EXIT_CODE, cwd, CD_INVALID);
    };

    let home = dirs::home_dir();
    let target = resolve_cd_target(
        &cwd,
        words.first().map(String::as_str),
        home.as_deref(),
        user_home,
    );

    match target {
        Some(path) if path.is_dir() => {
            info!(conversation = %conversation, path = %path.display(), "working directory changed");
            store.set_working_directory(conversation, path.clone());
            ExecutionResult::new(0, path, CD_OK)
        }
        other => {
            debug!(conversation = %conversation, target = ?other, "cd target is not a directory");
            ExecutionResult::new(FAILURE_EXIT_CODE, cwd, CD_NOT_FOUND)
        }
    }
}

/// Resolves a `cd` argument against `cwd`. No argument means the home directory; `~` and
/// `~/...` use `home`, `~name` and `~name/...` use `lookup_user`. An unknown user leaves the
/// argument literal. Returns `None` when the home directory is needed but unknown.
pub fn resolve_cd_target(
    cwd: &Path,
    arg: Option<&str>,
    home: Option<&Path>,
    lookup_user: impl Fn(&str) -> Option<PathBuf>,
) -> Option<PathBuf> {
    let arg = arg.unwrap_or("~");
    let expanded = match arg.strip_prefix('~') {
        Some("") => home?.to_path_buf(),
        Some(rest) => {
            let (user, tail) = rest.split_once('/').unwrap_or((rest, ""));
            if user.is_empty() {
                home?.join(tail)
            } else {
                match lookup_user(user) {
                    Some(user_home) => user_home.join(tail),
                    None => PathBuf::from(arg),
                }
            }
        }
        None => PathBuf::from(arg),
    };

    Some(normalize(&cwd.join(expanded)))
}

/// Home directory of a local account, from the password database.
#[cfg(unix)]
pub fn user_home(name: &str) -> Option<PathBuf> {
    use std::ffi::{CStr, CString, OsStr};
    use std::os::unix::ffi::OsStrExt;

    let name = CString::new(name).ok()?;
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        // SAFETY: every pointer refers to a live local; `buf.len()` is the real buffer size and
        // `entry` is only read after getpwnam_r reports success through `found`.
        let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
        let mut found: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                name.as_ptr(),
                &mut entry,
                buf.as_mut_ptr(),
                buf.len(),
                &mut found,
            )
        };
        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || found.is_null() || entry.pw_dir.is_null() {
            return None;
        }
        // SAFETY: pw_dir points into `buf`, which is still alive and NUL-terminated by libc.
        let dir = unsafe { CStr::from_ptr(entry.pw_dir) };
        return Some(PathBuf::from(OsStr::from_bytes(dir.to_bytes())));
    }
}

#[cfg(not(unix))]
pub fn user_home(_name: &str) -> Option<PathBuf> {
    None
}

/// Collapses `.` and `..` lexically without touching the file system.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    normalized.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn outcome_to_result(outcome: ExecOutcome, cwd: PathBuf) -> ExecutionResult {
    match outcome {
        ExecOutcome::Completed {
            exit_code,
            output,
            truncated,
        } => {
            let text = decode_output(&output);
            let text = text.trim();
            if truncated {
                ExecutionResult::new(exit_code, cwd, mark_capture_limit(text))
            } else {
                ExecutionResult::new(exit_code, cwd, text)
            }
        }
        ExecOutcome::TimedOut => ExecutionResult::new(TIMEOUT_EXIT_CODE, cwd, TIMEOUT_MARKER),
        ExecOutcome::SpawnFailed(reason) => ExecutionResult::new(
            FAILURE_EXIT_CODE,
            cwd,
            format!("failed to run command: {reason}"),
        ),
    }
}

/// Output cut at the capture limit still has to say so when it fits in one block.
fn mark_capture_limit(text: &str) -> String {
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return text.to_owned();
    }
    let keep = MAX_MESSAGE_CHARS - TRUNCATION_MARKER.chars().count();
    let head = match text.char_indices().nth(keep) {
        Some((cut, _)) => &text[..cut],
        None => text,
    };
    format!("{head}{TRUNCATION_MARKER}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const CHAT: ConversationId = ConversationId(1);

    fn interpreter(timeout: Duration) -> CommandInterpreter {
        CommandInterpreter::new(ProcessExecutor::new(
            "/bin/sh",
            vec!["-c".to_owned()],
            timeout,
        ))
    }

    fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().canonicalize().expect("canonicalize");
        (dir, path)
    }

    #[test]
    fn classify_separates_builtins_from_shell() {
        assert_eq!(classify("   "), Invocation::Empty);
        assert_eq!(classify(" pwd "), Invocation::Pwd);
        assert_eq!(classify("cd"), Invocation::Cd(""));
        assert_eq!(classify("cd  ../x"), Invocation::Cd("../x"));
        assert_eq!(classify("cdrom"), Invocation::Shell("cdrom"));
        assert_eq!(classify("pwd -P"), Invocation::Shell("pwd -P"));
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    fn no_users(_: &str) -> Option<PathBuf> {
        None
    }

    #[test]
    fn cd_target_expands_home() {
        let home = Path::new("/home/op");
        let cwd = Path::new("/var/log");
        assert_eq!(
            resolve_cd_target(cwd, None, Some(home), no_users),
            Some(PathBuf::from("/home/op"))
        );
        assert_eq!(
            resolve_cd_target(cwd, Some("~/src/.."), Some(home), no_users),
            Some(PathBuf::from("/home/op"))
        );
        assert_eq!(
            resolve_cd_target(cwd, Some(".."), Some(home), no_users),
            Some(PathBuf::from("/var"))
        );
        assert_eq!(
            resolve_cd_target(cwd, Some("/etc"), Some(home), no_users),
            Some(PathBuf::from("/etc"))
        );
        assert_eq!(resolve_cd_target(cwd, None, None, no_users), None);
    }

    #[test]
    fn cd_target_expands_other_users_homes() {
        let cwd = Path::new("/var/log");
        let lookup = |name: &str| (name == "deploy").then(|| PathBuf::from("/srv/deploy"));
        assert_eq!(
            resolve_cd_target(cwd, Some("~deploy"), None, lookup),
            Some(PathBuf::from("/srv/deploy"))
        );
        assert_eq!(
            resolve_cd_target(cwd, Some("~deploy/releases/../app"), None, lookup),
            Some(PathBuf::from("/srv/deploy/app"))
        );
        assert_eq!(
            resolve_cd_target(cwd, Some("~ghost/x"), None, lookup),
            Some(PathBuf::from("/var/log/~ghost/x"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn user_home_reads_the_password_database() {
        let root = user_home("root").expect("root has a home directory");
        assert!(root.is_absolute());
        assert_eq!(user_home("shellbridge-no-such-user"), None);
        assert_eq!(user_home("bad\0name"), None);
    }

    #[tokio::test]
    async fn cd_then_pwd_reports_the_new_directory() {
        let (_guard, root) = canonical_tempdir();
        std::fs::create_dir(root.join("sub dir")).expect("mkdir");
        let store = SessionStore::new(&root);
        let interpreter = interpreter(Duration::from_secs(5));

        let cd = interpreter
            .interpret(&store, CHAT, "cd 'sub dir'")
            .await
            .expect("result");
        let expected = root.join("sub dir");
        assert_eq!(cd, ExecutionResult::new(0, expected.clone(), "(cd ok)"));

        let pwd = interpreter
            .interpret(&store, CHAT, "pwd")
            .await
            .expect("result");
        assert_eq!(pwd.exit_code, 0);
        assert_eq!(pwd.working_directory_after, expected);
        assert_eq!(pwd.output, expected.display().to_string());
    }

    #[tokio::test]
    async fn cd_to_a_missing_directory_changes_nothing() {
        let (_guard, root) = canonical_tempdir();
        let store = SessionStore::new(&root);
        let interpreter = interpreter(Duration::from_secs(5));

        let result = interpreter
            .interpret(&store, CHAT, "cd does-not-exist")
            .await
            .expect("result");
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output, "cd: directory not found");
        assert_eq!(result.working_directory_after, root);
        assert_eq!(store.working_directory(CHAT), root);
    }

    #[tokio::test]
    async fn cd_to_a_file_is_rejected() {
        let (_guard, root) = canonical_tempdir();
        std::fs::write(root.join("plain.txt"), "x").expect("write");
        let store = SessionStore::new(&root);

        let result = interpreter(Duration::from_secs(5))
            .interpret(&store, CHAT, "cd plain.txt")
            .await
            .expect("result");
        assert_eq!(result.exit_code, 1);
        assert_eq!(store.working_directory(CHAT), root);
    }

    #[tokio::test]
    async fn cd_with_unbalanced_quotes_is_rejected() {
        let (_guard, root) = canonical_tempdir();
        let store = SessionStore::new(&root);

        let result = interpreter(Duration::from_secs(5))
            .interpret(&store, CHAT, "cd 'oops")
            .await
            .expect("result");
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output, "cd: invalid arguments");
    }

    #[tokio::test]
    async fn directory_removed_after_cd_is_revalidated() {
        let (_guard, root) = canonical_tempdir();
        std::fs::create_dir(root.join("gone")).expect("mkdir");
        let store = SessionStore::new(&root);
        let interpreter = interpreter(Duration::from_secs(5));

        std::fs::remove_dir(root.join("gone")).expect("rmdir");
        let result = interpreter
            .interpret(&store, CHAT, "cd gone")
            .await
            .expect("result");
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn empty_line_is_a_no_op() {
        let store = SessionStore::new("/");
        let result = interpreter(Duration::from_secs(5))
            .interpret(&store, CHAT, "  ")
            .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn shell_commands_run_in_the_session_directory() {
        let (_guard, root) = canonical_tempdir();
        let store = SessionStore::new(&root);

        let result = interpreter(Duration::from_secs(5))
            .interpret(&store, CHAT, "pwd -P; echo oops >&2; exit 2")
            .await
            .expect("result");
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.output, format!("{}\n\noops", root.display()));
        assert_eq!(result.working_directory_after, root);
    }

    #[tokio::test]
    async fn timeouts_map_to_exit_code_124() {
        let (_guard, root) = canonical_tempdir();
        let store = SessionStore::new(&root);

        let result = interpreter(Duration::from_millis(150))
            .interpret(&store, CHAT, "echo fast; sleep 5")
            .await
            .expect("result");
        assert_eq!(result, ExecutionResult::new(124, root, "TIMEOUT"));
    }

    #[tokio::test]
    async fn missing_shell_reports_failure_and_keeps_the_directory() {
        let (_guard, root) = canonical_tempdir();
        let store = SessionStore::new(&root);
        let interpreter = CommandInterpreter::new(ProcessExecutor::new(
            "/nonexistent/shellbridge-shell",
            vec!["-c".to_owned()],
            Duration::from_secs(5),
        ));

        let result = interpreter
            .interpret(&store, CHAT, "echo unreachable")
            .await
            .expect("result");
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);
        assert!(
            result.output.starts_with("failed to run command:"),
            "unexpected output: {}",
            result.output
        );
        assert_eq!(result.working_directory_after, root);
        assert_eq!(store.working_directory(CHAT), root);
    }

    #[tokio::test]
    async fn output_past_the_capture_limit_is_marked() {
        let (_guard, root) = canonical_tempdir();
        let store = SessionStore::new(&root);

        // Mostly whitespace, so the trimmed text fits in one block.
        let result = interpreter(Duration::from_secs(30))
            .interpret(&store, CHAT, "echo head; head -c 1000000 /dev/zero | tr '\\0' ' '")
            .await
            .expect("result");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, format!("head{TRUNCATION_MARKER}"));
    }

    #[test]
    fn capture_marker_keeps_the_block_within_one_message() {
        let text = "w".repeat(MAX_MESSAGE_CHARS);
        let marked = mark_capture_limit(&text);
        assert_eq!(marked.chars().count(), MAX_MESSAGE_CHARS);
        assert!(marked.ends_with(TRUNCATION_MARKER));

        let long = "w".repeat(MAX_MESSAGE_CHARS + 1);
        assert_eq!(mark_capture_limit(&long), long);
    }
}
