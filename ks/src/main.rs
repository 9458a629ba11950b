use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use keystore::cli::{Cli, Command};
use keystore::{KvStore, QueuePolicy, SqliteStore, WorkQueue};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    Ok(())
}

fn open_store(cli: &Cli) -> Result<SqliteStore> {
    SqliteStore::open(&cli.store).context(format!("Failed to open store {}", cli.store.display()))
}

fn open_queue(cli: &Cli) -> Result<WorkQueue> {
    WorkQueue::open(&cli.queue, QueuePolicy::default()).context(format!("Failed to open queue {}", cli.queue.display()))
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    info!("ks starting");

    match &cli.command {
        Command::Get { key } => {
            let mut store = open_store(&cli)?;
            match store.get(key)? {
                Some(value) => {
                    let ttl = store
                        .ttl(key)?
                        .map(|t| format!("{}ms", t.as_millis()))
                        .unwrap_or_else(|| "no expiry".to_string());
                    println!("{} {}", value, format!("({})", ttl).dimmed());
                }
                None => println!("{}", "(nil)".dimmed()),
            }
        }
        Command::Set { key, value, ttl_ms } => {
            let mut store = open_store(&cli)?;
            store.set(key, value, ttl_ms.map(Duration::from_millis))?;
            println!("{} {}", "✓".green(), key.cyan());
        }
        Command::Incr { key, ttl_ms } => {
            let mut store = open_store(&cli)?;
            let value = store.incr_with_ttl(key, Duration::from_millis(*ttl_ms))?;
            println!("{}", value);
        }
        Command::Del { key } => {
            let mut store = open_store(&cli)?;
            if store.delete(key)? {
                println!("{} Deleted {}", "✓".green(), key.cyan());
            } else {
                println!("{}", "(not found)".dimmed());
            }
        }
        Command::Purge => {
            let mut store = open_store(&cli)?;
            let removed = store.purge_expired()?;
            println!("{} Purged {} expired keys", "✓".green(), removed);
        }
        Command::QueueStats { json } => {
            let mut queue = open_queue(&cli)?;
            let stats = queue.stats()?;
            if *json {
                println!("{}", serde_json::to_string(&stats)?);
                return Ok(());
            }
            println!("Queue: {}", cli.queue.display().to_string().cyan());
            println!("  Ready:   {}", stats.ready);
            println!("  Delayed: {}", stats.delayed);
            println!("  Leased:  {}", stats.leased);
            println!("  Dead:    {}", stats.dead.to_string().red());
        }
        Command::Dead { limit } => {
            let mut queue = open_queue(&cli)?;
            let items = queue.dead_letters(*limit)?;
            if items.is_empty() {
                println!("No dead-lettered items");
            }
            for item in items {
                println!(
                    "{} {} attempts={} {}",
                    item.id.yellow(),
                    item.work_key.cyan(),
                    item.attempts,
                    item.last_error.unwrap_or_default().dimmed()
                );
            }
        }
    }

    Ok(())
}
