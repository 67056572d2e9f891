use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum Mode {
    Cli,
    Server,
}

#[derive(Debug, Parser)]
#[command(name = "shellbridge-engine")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Server)]
    pub mode: Mode,

    #[arg(long)]
    pub socket_path: Option<String>,

    /// Run one command in console mode and exit.
    #[arg(long)]
    pub command: Option<String>,

    /// Overrides SHELLBRIDGE_CMD_TIMEOUT.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}
