use crate::config::RuntimeKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "overseer", about = "A supervisor for long-running scripts", version)]
pub struct Cli {
    /// Supervisor base directory (default: $OVERSEER_HOME or the user data dir)
    #[arg(long, global = true, value_name = "DIR")]
    pub base_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the supervisor in the foreground
    Run,
    /// List programs with their state
    #[command(visible_alias = "ls")]
    List,
    /// Show a page of a program's log
    Log {
        name: String,
        #[arg(long, default_value_t = crate::log::DEFAULT_PAGE_LINES)]
        lines: usize,
        /// Lines to skip back from the end of the log
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Start a program, clearing its broken state
    Start { name: String },
    /// Stop and disable a program
    Stop { name: String },
    /// Restart a program, clearing its broken state
    Restart { name: String },
    /// Register a program whose code is already on disk
    Add {
        name: String,
        script: String,
        #[command(flatten)]
        options: ProgramArgs,
        #[arg(long)]
        venv: Option<String>,
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Remove a stopped program, its logs and uploaded code
    Remove { name: String },
    /// Change a program's settings
    Edit {
        name: String,
        #[arg(long, value_name = "NEW_NAME")]
        rename: Option<String>,
        #[arg(long)]
        script: Option<String>,
        #[arg(long = "type", value_name = "TYPE")]
        kind: Option<RuntimeKind>,
        #[arg(long)]
        enabled: Option<bool>,
        /// New comment; an empty string clears it
        #[arg(long)]
        comment: Option<String>,
        /// New environment path; an empty string clears it
        #[arg(long)]
        venv: Option<String>,
        /// New working directory; an empty string clears it
        #[arg(long)]
        cwd: Option<String>,
        /// Replacement argument string, split like a shell would
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,
        /// Replacement KEY=VALUE entries
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Remove every environment entry
        #[arg(long, conflicts_with = "env")]
        clear_env: bool,
    },
    /// Install a new program from a zip archive
    Upload {
        name: String,
        archive: PathBuf,
        #[arg(long)]
        script: String,
        #[command(flatten)]
        options: ProgramArgs,
    },
    /// Replace a stopped uploaded program's code with a new zip archive
    Update { name: String, archive: PathBuf },
    /// Re-read overseer.toml and programs.toml
    Reload,
    /// Reset restart counters for one program, or all
    Reset { name: Option<String> },
    /// Shut the supervisor down, leaving programs running
    Kill,
}

/// Options shared by `add` and `upload`.
#[derive(Debug, Args)]
pub struct ProgramArgs {
    #[arg(long = "type", value_name = "TYPE", default_value = "python")]
    pub kind: RuntimeKind,
    /// Register without starting
    #[arg(long)]
    pub disabled: bool,
    #[arg(long)]
    pub comment: Option<String>,
    /// Argument string, split like a shell would
    #[arg(long, allow_hyphen_values = true)]
    pub args: Option<String>,
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}

/// Splits an argument string with shell quoting rules.
pub fn split_args(args: Option<&str>) -> Result<Vec<String>, shell_words::ParseError> {
    match args {
        Some(args) => shell_words::split(args),
        None => Ok(Vec::new()),
    }
}
