//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keypace - per-key admission control and paced execution
#[derive(Parser)]
#[command(
    name = "kp",
    about = "Rate-limited, one-at-a-time execution per work key across replicas",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit work for a key (the admission call)
    Submit {
        #[arg(value_name = "WORK_KEY")]
        work_key: String,

        /// Number of requests to submit back to back
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the scheduler loop until Ctrl-C
    Worker {
        /// Overrides replica-id from the config
        #[arg(long)]
        replica_id: Option<String>,

        /// Overrides scheduler.max-concurrent from the config
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Submit, then process the queue until idle (batch mode)
    Run {
        #[arg(value_name = "WORK_KEY")]
        work_key: String,

        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Show the coordination state of a key
    Status {
        #[arg(value_name = "WORK_KEY")]
        work_key: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show recent completion log entries
    Log {
        /// Only this work key
        #[arg(short, long)]
        key: Option<String>,

        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,
    },

    /// Show queue statistics
    Queue {
        /// List dead-lettered items
        #[arg(long)]
        dead: bool,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Where `kp` writes its log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keypace")
        .join("logs")
        .join("kp.log")
}

/// Output format for submit/status/queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
