mod client;
mod commands;
mod config;
mod console_paths;
mod error_index;
mod event_log;
mod events;
mod journal;
mod monitor;
mod poller;
mod push;
mod reducer;
mod session;
mod tiers;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use client::ForgeClient;
use commands::ConsoleCommand;
use config::ConsoleConfig;
use event_log::EventLog;
use journal::{LogEntry, LogLevel};
use monitor::{MonitorEvent, SessionMonitor};
use session::Session;

#[derive(Parser)]
#[command(name = "forge-console")]
#[command(about = "Line console for observing and steering a remote forge build session")]
#[command(version)]
struct Cli {
    /// Session to attach to
    session_id: String,

    /// Forge backend base URL (overrides the config file)
    #[arg(long)]
    server: Option<String>,

    /// Seconds between reconciliation polls (clamped to 2-5)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Alternate config file (default: ~/.forge-console/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Show debug and thinking journal lines
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConsoleConfig::load(path)?,
        None => ConsoleConfig::load_or_default()?,
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(secs) = cli.poll_interval {
        config.poll_interval_secs = secs;
    }
    if cli.debug {
        config.show_debug = true;
    }

    let logs_dir = console_paths::session_logs_dir(&cli.session_id)?;
    let event_log = Arc::new(EventLog::new(&cli.session_id, &logs_dir)?);
    let client = Arc::new(ForgeClient::new(&config.server_url)?);

    println!(
        "attaching to session {} at {}",
        cli.session_id, config.server_url
    );
    println!("event log: {}", event_log.path().display());
    println!("type commands (start, pause, resume, stop, ...); 'quit' to detach");

    let (journal_tx, journal_rx) = mpsc::unbounded_channel();
    let (monitor, intake_tx, _snapshot_rx) = SessionMonitor::start(
        &cli.session_id,
        client,
        &config,
        Arc::clone(&event_log),
        journal_tx,
    );

    let printer = tokio::spawn(print_journal(journal_rx, config.show_debug));
    let input = tokio::spawn(read_operator_input(intake_tx));

    let session = monitor.run().await;

    input.abort();
    printer.abort();
    print_summary(&session);
    Ok(())
}

/// Renders journal entries as they stream out of the reducer.
async fn print_journal(mut journal_rx: mpsc::UnboundedReceiver<LogEntry>, show_debug: bool) {
    while let Some(entry) = journal_rx.recv().await {
        if !show_debug && matches!(entry.level, LogLevel::Debug | LogLevel::Thinking) {
            continue;
        }
        println!("{}", render_entry(&entry));
    }
}

fn render_entry(entry: &LogEntry) -> String {
    let time = entry.timestamp.format("%H:%M:%S");
    match entry.level {
        LogLevel::Info => format!("[{}] [{}] {}", time, entry.source, entry.message),
        other => format!(
            "[{}] [{}] {}: {}",
            time,
            entry.source,
            other.as_str(),
            entry.message
        ),
    }
}

/// Reads operator lines from stdin and funnels them into the monitor.
///
/// EOF detaches the console the same way 'quit' does.
async fn read_operator_input(intake: mpsc::UnboundedSender<MonitorEvent>) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
                    let _ = intake.send(MonitorEvent::Shutdown);
                    return;
                }
                match ConsoleCommand::parse(line) {
                    Ok(command) => {
                        if intake.send(MonitorEvent::Operator(command)).is_err() {
                            return;
                        }
                    }
                    Err(reason) => eprintln!("error: {}", reason),
                }
            }
            Ok(None) => {
                let _ = intake.send(MonitorEvent::Shutdown);
                return;
            }
            Err(err) => {
                eprintln!("stdin error: {}", err);
                let _ = intake.send(MonitorEvent::Shutdown);
                return;
            }
        }
    }
}

fn print_summary(session: &Session) {
    println!();
    println!(
        "session {}: {} | units {}/{} | tokens {} | cost ${:.2}",
        session.id,
        session.status,
        session.completed_units,
        session.total_units,
        session.tokens_total().total,
        session.cost_estimate
    );
    let open: Vec<_> = session.errors.open_entries().collect();
    if !open.is_empty() {
        println!("open errors:");
        for error in open {
            println!(
                "  {}  x{}  [{}] {}",
                error.fingerprint, error.occurrence_count, error.source, error.message
            );
        }
    }
}
