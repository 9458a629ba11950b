//! kp - keypace command line
//!
//! Submits work, runs the scheduler loop and inspects coordination state.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use keypace::cli::{Cli, Command, OutputFormat, get_log_path};
use keypace::{AdmissionResult, App, Config, read_completions};

fn parse_level(level_str: Option<&str>) -> tracing::Level {
    match level_str.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, to_stderr: bool) -> Result<()> {
    // Priority: CLI --log-level > config file > INFO
    let level = parse_level(cli_log_level.or(config_log_level));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_stderr {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        let log_path = get_log_path();
        if let Some(log_dir) = log_path.parent() {
            fs::create_dir_all(log_dir).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.log_stderr)
        .context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Submit {
            work_key,
            count,
            format,
        } => cmd_submit(&config, &work_key, count, format).await,
        Command::Worker {
            replica_id,
            concurrency,
        } => {
            if replica_id.is_some() {
                config.replica_id = replica_id;
            }
            if let Some(n) = concurrency {
                config.scheduler.max_concurrent = n;
            }
            cmd_worker(&config).await
        }
        Command::Run { work_key, count } => cmd_run(&config, &work_key, count).await,
        Command::Status { work_key, format } => cmd_status(&config, &work_key, format).await,
        Command::Log { key, lines } => cmd_log(&config, key.as_deref(), lines),
        Command::Queue { dead, format } => cmd_queue(&config, dead, format).await,
    }
}

fn print_result(index: usize, result: &AdmissionResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(result)?),
        OutputFormat::Text => {
            let line = match result {
                AdmissionResult::Admitted => "admitted".green().to_string(),
                AdmissionResult::AdmittedDelayed { delay_ms } => {
                    format!("{} ({}ms)", "admitted, delayed".yellow(), delay_ms)
                }
                AdmissionResult::Rejected { reason } => format!("{}: {}", "rejected".red(), reason),
                AdmissionResult::TransientFailure { reason } => {
                    format!("{}: {}", "transient failure".red().bold(), reason)
                }
            };
            println!("{:>4}  {}", index + 1, line);
        }
    }
    Ok(())
}

async fn submit_all(app: &App, work_key: &str, count: usize, format: OutputFormat) -> Result<Vec<AdmissionResult>> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let result = app.submit(work_key).await;
        print_result(i, &result, format)?;
        results.push(result);
    }
    Ok(results)
}

async fn cmd_submit(config: &Config, work_key: &str, count: usize, format: OutputFormat) -> Result<()> {
    let app = App::open(config)?;
    let results = submit_all(&app, work_key, count, format).await?;

    if results.iter().any(|r| matches!(r, AdmissionResult::Rejected { .. } | AdmissionResult::TransientFailure { .. })) {
        return Err(eyre::eyre!("Not every request was admitted"));
    }
    Ok(())
}

async fn cmd_worker(config: &Config) -> Result<()> {
    let app = App::open(config)?;
    println!(
        "{} replica {} (concurrency {})",
        "Worker started:".green(),
        app.replica_id(),
        config.scheduler.max_concurrent
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    let stats = app.worker().run(shutdown_rx).await;
    println!(
        "{} {} completed, {} failed, {} dead-lettered",
        "Worker stopped:".yellow(),
        stats.completed,
        stats.failed,
        stats.dead_lettered
    );
    Ok(())
}

async fn cmd_run(config: &Config, work_key: &str, count: usize) -> Result<()> {
    let app = App::open(config)?;
    submit_all(&app, work_key, count, OutputFormat::Text).await?;

    println!("{}", "Processing queue...".cyan());
    let stats = app.worker().run_until_idle().await?;
    println!(
        "{} {} completed, {} failed, {} lock retries, {}ms spacing wait",
        "Done:".green(),
        stats.completed,
        stats.failed,
        stats.lock_retries,
        stats.spacing_wait.as_millis()
    );
    println!("Completion log: {}", config.executor.log_path().display());
    Ok(())
}

async fn cmd_status(config: &Config, work_key: &str, format: OutputFormat) -> Result<()> {
    let app = App::open(config)?;
    let status = app.status(work_key).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => println!("{}", status),
    }
    Ok(())
}

fn cmd_log(config: &Config, key: Option<&str>, lines: usize) -> Result<()> {
    let path: PathBuf = config.executor.log_path();
    let records = read_completions(&path, key).context(format!("Failed to read {}", path.display()))?;
    if records.is_empty() {
        println!("{}", "No completions recorded".dimmed());
        return Ok(());
    }

    let skip = records.len().saturating_sub(lines);
    for record in &records[skip..] {
        println!(
            "{}  {:<20}  {}",
            record.completed_at.to_rfc3339().dimmed(),
            record.work_key.bold(),
            record.replica
        );
    }
    Ok(())
}

async fn cmd_queue(config: &Config, dead: bool, format: OutputFormat) -> Result<()> {
    let app = App::open(config)?;
    let stats = app.queue().stats().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("Ready:    {}", stats.ready);
            println!("Delayed:  {}", stats.delayed);
            println!("Leased:   {}", stats.leased);
            println!("Dead:     {}", stats.dead);
        }
    }

    if dead {
        let items = app.queue().dead_letters(50).await?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            OutputFormat::Text => {
                for item in items {
                    println!(
                        "{}  {}  attempts={}  {}",
                        item.id.dimmed(),
                        item.work_key.bold(),
                        item.attempts,
                        item.last_error.unwrap_or_default().red()
                    );
                }
            }
        }
    }
    Ok(())
}
