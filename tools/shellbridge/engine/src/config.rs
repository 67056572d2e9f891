use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::gate::OwnerPolicy;

const DEFAULT_SHELL_COMMAND: &str = "/bin/sh -c";
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_AUDIT_LOG: &str = "bot.log";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub owner: OwnerPolicy,
    pub command_timeout: Duration,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub audit_log_path: PathBuf,
    pub cwd: PathBuf,
}

impl RuntimeConfig {
    pub fn load_from_env() -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to resolve current working directory")?;
        Self::from_lookup(|key| std::env::var(key).ok(), cwd)
    }

    pub fn from_lookup<F>(lookup: F, cwd: PathBuf) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let owner_raw = read("SHELLBRIDGE_OWNER_ID").context(
            "SHELLBRIDGE_OWNER_ID must be set before starting shellbridge (use 0 to allow every sender)",
        )?;
        let owner_id = owner_raw
            .parse::<i64>()
            .with_context(|| format!("SHELLBRIDGE_OWNER_ID is not an integer: {owner_raw}"))?;

        let command_timeout = match read("SHELLBRIDGE_CMD_TIMEOUT") {
            Some(raw) => parse_timeout(&raw)
                .with_context(|| format!("invalid SHELLBRIDGE_CMD_TIMEOUT: {raw}"))?,
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let shell_line =
            read("SHELLBRIDGE_SHELL").unwrap_or_else(|| DEFAULT_SHELL_COMMAND.to_owned());
        let parts = shlex::split(&shell_line)
            .with_context(|| format!("could not parse SHELLBRIDGE_SHELL: {shell_line}"))?;
        let Some((shell, shell_args)) = parts.split_first() else {
            bail!("SHELLBRIDGE_SHELL resolved to an empty command");
        };

        let audit_log_path = read("SHELLBRIDGE_AUDIT_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_LOG));

        Ok(Self {
            owner: OwnerPolicy::from_owner_id(owner_id),
            command_timeout,
            shell: shell.clone(),
            shell_args: shell_args.to_vec(),
            audit_log_path,
            cwd,
        })
    }

    pub fn with_timeout_secs(mut self, timeout_secs: Option<u64>) -> Result<Self> {
        if let Some(secs) = timeout_secs {
            if secs == 0 {
                bail!("--timeout-secs must be greater than zero");
            }
            self.command_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    pub fn preflight(&self) -> Result<()> {
        if !self.cwd.is_dir() {
            bail!("working directory does not exist: {}", self.cwd.display());
        }

        if self.shell.contains('/') {
            let candidate = PathBuf::from(&self.shell);
            if !candidate.exists() {
                bail!("shell does not exist: {}", candidate.display());
            }
            return Ok(());
        }

        which::which(&self.shell).with_context(|| {
            format!(
                "shell not found on PATH: {} (set SHELLBRIDGE_SHELL to override)",
                self.shell
            )
        })?;

        Ok(())
    }
}

fn parse_timeout(raw: &str) -> Result<Duration> {
    let secs = raw.parse::<u64>().context("expected a whole number of seconds")?;
    if secs == 0 {
        bail!("timeout must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}
