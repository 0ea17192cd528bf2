//! Vigil CLI - host anti-malware scanning and quarantine management.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use vigil_core::{ConfigService, ThreatAction, VigilEvent};
use vigil_pipeline::{ChangeKind, EventSink, FileEvent, VigilService};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Vigil - host-based anti-malware engine")]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "vigil-data/config.json")]
    config: PathBuf,

    /// Data directory for signatures, prevalence, and quarantine.
    #[arg(long, default_value = "vigil-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan paths on demand and report threats
    Scan {
        /// Files or directories to scan
        paths: Vec<PathBuf>,
    },
    /// Watch directories with real-time protection (polling adapter)
    Watch {
        /// Directories to watch
        roots: Vec<PathBuf>,
    },
    /// Manage the quarantine store
    Quarantine {
        #[command(subcommand)]
        command: QuarantineCommands,
    },
    /// List or resolve pending threat decisions
    Threats {
        #[command(subcommand)]
        command: ThreatCommands,
    },
    /// Import signature records from a CSV file
    Import {
        /// CSV file: sha256,md5,name,family,threat_level[,description[,source]]
        csv: PathBuf,
    },
    /// Show service status
    Status,
}

#[derive(Subcommand)]
enum QuarantineCommands {
    /// List quarantined entries
    List,
    /// Restore an entry to its original (or a given) path
    Restore {
        /// Entry id
        id: Uuid,
        /// Alternative restore path
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// Permanently delete an entry
    Delete {
        /// Entry id
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum ThreatCommands {
    /// List detections waiting for a decision
    List,
    /// Resolve a pending detection
    Resolve {
        /// Event id from `threats list`
        event_id: Uuid,
        /// quarantine | delete | allow
        action: String,
        /// With allow: also add the hash to the allowlist
        #[arg(long)]
        allowlist: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(ConfigService::load(&cli.config)?);
    let service = VigilService::new(config, &cli.data_dir)?;

    match cli.command {
        Commands::Scan { paths } => scan(&service, paths).await?,
        Commands::Watch { roots } => watch(&service, roots).await?,
        Commands::Quarantine { command } => quarantine(&service, command)?,
        Commands::Threats { command } => threats(&service, command)?,
        Commands::Import { csv } => {
            let summary = service.signature_db().import_csv_file(&csv)?;
            service.signature_db().save()?;
            println!("imported {} records ({} skipped)", summary.imported, summary.skipped);
        }
        Commands::Status => {
            let status = service.status();
            println!("real-time:         {}", if status.realtime_enabled { "on" } else { "off" });
            println!("pending events:    {}", status.pending_events);
            println!("pending decisions: {}", status.pending_decisions);
            println!("quarantined:       {}", status.quarantine_entries);
            println!("files scanned:     {}", status.files_scanned);
            println!("threats found:     {}", status.threats_found);
        }
    }

    service.flush();
    Ok(())
}

async fn scan(service: &VigilService, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    anyhow::ensure!(!paths.is_empty(), "nothing to scan");
    let mut rx = service.subscribe();
    let job_id = service.scan_path(paths);

    loop {
        match rx.recv().await.context("event stream closed")? {
            VigilEvent::ThreatDetected {
                path,
                name,
                risk_score,
                auto_quarantined,
                ..
            } => {
                println!(
                    "THREAT  {:<60} score={risk_score:<3} {} {}",
                    path.display(),
                    name.unwrap_or_else(|| "-".into()),
                    if auto_quarantined { "[quarantined]" } else { "" },
                );
            }
            VigilEvent::ScanProgress { scanned, total, .. } => {
                eprintln!("... {scanned}/{total}");
            }
            VigilEvent::ScanError { path, kind } => {
                eprintln!("error   {}: {kind}", path.display());
            }
            VigilEvent::ScanCompleted {
                job_id: done,
                scanned,
                threats_found,
                duration,
            } if done == job_id => {
                println!("scanned {scanned} files, {threats_found} threat(s), {duration:.1?}");
                return Ok(());
            }
            _ => {}
        }
    }
}

async fn watch(service: &VigilService, roots: Vec<PathBuf>) -> anyhow::Result<()> {
    anyhow::ensure!(!roots.is_empty(), "nothing to watch");
    service.enable_realtime();
    let sink = service.event_sink().expect("real-time just enabled");

    let poller = tokio::spawn(poll_roots(roots.clone(), sink));
    println!("watching {} root(s), ctrl-c to stop", roots.len());

    let mut rx = service.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => {
                if let Ok(VigilEvent::ThreatDetected { path, name, risk_score, auto_quarantined, failure, .. }) = event {
                    match failure {
                        None => println!(
                            "THREAT  {:<60} score={risk_score:<3} {} {}",
                            path.display(),
                            name.unwrap_or_else(|| "-".into()),
                            if auto_quarantined { "[quarantined]" } else { "" },
                        ),
                        Some(failure) => println!("THREAT  {} (action failed: {failure})", path.display()),
                    }
                }
            }
        }
    }

    poller.abort();
    service.disable_realtime();
    Ok(())
}

/// Minimal watcher adapter: polls mtimes once a second. Platform change
/// notification APIs plug into the same [`EventSink`].
async fn poll_roots(roots: Vec<PathBuf>, sink: EventSink) {
    let mut seen: HashMap<PathBuf, SystemTime> = HashMap::new();
    loop {
        for root in &roots {
            for entry in walk(root) {
                let Ok(meta) = entry.metadata() else { continue };
                let Ok(mtime) = meta.modified() else { continue };
                let path = entry.path();
                match seen.insert(path.clone(), mtime) {
                    None => sink.submit(FileEvent::now(path, ChangeKind::Created)),
                    Some(prev) if prev != mtime => {
                        sink.submit(FileEvent::now(path, ChangeKind::Modified));
                    }
                    Some(_) => {}
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn walk(root: &PathBuf) -> Vec<std::fs::DirEntry> {
    let mut files = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry);
            }
        }
    }
    files
}

fn quarantine(service: &VigilService, command: QuarantineCommands) -> anyhow::Result<()> {
    match command {
        QuarantineCommands::List => {
            let entries = service.list_quarantine();
            if entries.is_empty() {
                println!("quarantine is empty");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{}  {}  score={:<3} {}  {}",
                    entry.id,
                    entry.quarantined_at.format("%Y-%m-%d %H:%M"),
                    entry.risk_score,
                    entry.threat_name.as_deref().unwrap_or("-"),
                    if entry.restored {
                        "restored".to_string()
                    } else {
                        entry.original_path.display().to_string()
                    },
                );
            }
        }
        QuarantineCommands::Restore { id, to } => {
            let path = service.restore_quarantine(id, to.as_deref())?;
            println!("restored to {}", path.display());
        }
        QuarantineCommands::Delete { id } => {
            service.delete_quarantine(id)?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

fn threats(service: &VigilService, command: ThreatCommands) -> anyhow::Result<()> {
    match command {
        ThreatCommands::List => {
            let pending = service.list_pending_threats();
            if pending.is_empty() {
                println!("no pending threats");
                return Ok(());
            }
            for summary in pending {
                println!(
                    "{}  {}  score={:<3} recommended={:?}",
                    summary.event_id,
                    summary.path.display(),
                    summary.risk_score,
                    summary.recommended,
                );
            }
        }
        ThreatCommands::Resolve {
            event_id,
            action,
            allowlist,
        } => {
            let action = match action.as_str() {
                "quarantine" => ThreatAction::Quarantine,
                "delete" => ThreatAction::Delete,
                "allow" => ThreatAction::Allow,
                other => anyhow::bail!("unknown action '{other}' (quarantine|delete|allow)"),
            };
            service.resolve_threat(event_id, action, allowlist)?;
            println!("resolved {event_id}");
        }
    }
    Ok(())
}
