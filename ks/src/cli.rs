//! CLI argument parsing for the keystore inspection tool

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ks")]
#[command(author, version, about = "Inspect keypace coordination state", long_about = None)]
pub struct Cli {
    /// Path to the coordination store database
    #[arg(short, long, default_value_os_t = default_store_path())]
    pub store: PathBuf,

    /// Path to the work queue database
    #[arg(short, long, default_value_os_t = default_queue_path())]
    pub queue: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read a key
    Get {
        #[arg(required = true)]
        key: String,
    },

    /// Write a key
    Set {
        #[arg(required = true)]
        key: String,

        #[arg(required = true)]
        value: String,

        /// Expiry in milliseconds (default: never)
        #[arg(short, long)]
        ttl_ms: Option<u64>,
    },

    /// Atomically increment a counter
    Incr {
        #[arg(required = true)]
        key: String,

        /// Expiry applied when the counter is created
        #[arg(short, long, default_value = "60000")]
        ttl_ms: u64,
    },

    /// Delete a key
    Del {
        #[arg(required = true)]
        key: String,
    },

    /// Remove expired keys
    Purge,

    /// Show work queue counts
    QueueStats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List dead-lettered queue items
    Dead {
        /// Maximum items to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keypace")
}

pub fn default_store_path() -> PathBuf {
    data_dir().join("store.db")
}

pub fn default_queue_path() -> PathBuf {
    data_dir().join("queue.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incr_default_ttl() {
        let cli = Cli::parse_from(["ks", "incr", "keypace:123:count:1"]);
        assert!(matches!(cli.command, Command::Incr { ttl_ms: 60000, .. }));
    }

    #[test]
    fn test_parse_store_override() {
        let cli = Cli::parse_from(["ks", "--store", "/tmp/s.db", "purge"]);
        assert_eq!(cli.store, PathBuf::from("/tmp/s.db"));
        assert!(matches!(cli.command, Command::Purge));
    }
}
