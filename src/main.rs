use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promptr_sync::config::SyncConfig;
use promptr_sync::connection::{ConnectionManager, Credential, WebSocketTransport};
use promptr_sync::interpreter::{Phase, PhaseEvent, PhaseView, STEPS};
use promptr_sync::progress::ProgressEstimate;
use promptr_sync::pull::{HttpSnapshotSource, PollTarget, PollingFallback, Pulled, SnapshotSource};
use promptr_sync::snapshot::{ProjectId, WorkflowSnapshot};
use promptr_sync::structured_logger::StructuredLogger;
use promptr_sync::sync_paths;
use promptr_sync::tracker::{ProjectTracker, PushSide, TrackerOptions};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How often `watch` prints the running estimate.
const PROGRESS_PRINT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "promptr-sync")]
#[command(about = "Follow prompt-generation workflows over push and pull channels")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("PROMPTR_SYNC_GIT_SHA"), ")"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.promptr-sync/config.yaml, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bearer token for the API and the push channel
    #[arg(long, global = true, env = "PROMPTR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Poll only; never open the push connection
    #[arg(long, global = true)]
    no_push: bool,

    /// Write diagnostics to stderr instead of the debug log file
    #[arg(long, global = true)]
    log_stderr: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow one project until it completes or fails
    Watch { id: ProjectId },
    /// Print the current state of one project
    Status { id: ProjectId },
    /// List projects
    List {
        /// Keep polling and reprint on change
        #[arg(long)]
        follow: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_stderr);

    let config = SyncConfig::resolve(cli.config.as_deref())?;
    tracing::debug!(api_url = %config.api_url, push_url = %config.push_url, "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    runtime.block_on(run(cli, config))
}

fn init_logging(to_stderr: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("promptr_sync=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if to_stderr {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    }

    let file = sync_paths::debug_log_path().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))
    });
    match file {
        Ok(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => eprintln!("[promptr-sync] Warning: logging disabled: {:#}", e),
    }
}

async fn run(cli: Cli, config: SyncConfig) -> Result<()> {
    let credential = cli
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(Credential::new);
    let source: Arc<dyn SnapshotSource> =
        Arc::new(HttpSnapshotSource::new(&config.api_url, credential.clone()));

    match cli.command {
        Commands::Status { id } => {
            let snapshot = source.fetch_project(id).await?;
            for line in render_snapshot(&snapshot) {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::List { follow } => list(source, &config, follow).await,
        Commands::Watch { id } => {
            let credential = if cli.no_push { None } else { credential };
            watch(id, source, credential, &config).await
        }
    }
}

async fn list(source: Arc<dyn SnapshotSource>, config: &SyncConfig, follow: bool) -> Result<()> {
    if !follow {
        print_overview(&source.list_projects().await?);
        return Ok(());
    }

    let poller = PollingFallback::new(source, config.polling.stale_after_failures, None);
    let mut state = poller.state();
    poller.start(PollTarget::Overview, config.polling.overview_interval());

    let mut printed: Option<Vec<WorkflowSnapshot>> = None;
    let mut was_stale = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                if current.stale != was_stale {
                    was_stale = current.stale;
                    if was_stale {
                        println!(
                            "! project list may be out of date ({} failed refreshes)",
                            current.consecutive_failures
                        );
                    }
                }
                if let Some(Pulled::Overview(projects)) = current.snapshot {
                    if printed.as_ref() != Some(&projects) {
                        print_overview(&projects);
                        printed = Some(projects);
                    }
                }
            }
        }
    }
    poller.stop();
    Ok(())
}

async fn watch(
    id: ProjectId,
    source: Arc<dyn SnapshotSource>,
    credential: Option<Credential>,
    config: &SyncConfig,
) -> Result<()> {
    let logger = if config.structured_log {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = sync_paths::session_logs_dir(&session_id)?;
        Some(Arc::new(StructuredLogger::new(&session_id, &dir)?))
    } else {
        None
    };

    // Kept alive for the whole watch; dropping it closes the connection
    let mut manager = None;
    let push = match credential {
        Some(credential) => {
            let transport = Arc::new(WebSocketTransport::new(&config.push_url)?);
            let (mut m, signals) = ConnectionManager::new(transport, config.reconnect.policy());
            let push = m
                .connect(Some(credential))
                .map(|handle| PushSide { handle, signals });
            manager = Some(m);
            push
        }
        None => {
            println!("Push channel disabled; following by polling only.");
            None
        }
    };

    let (tracker, mut events) =
        ProjectTracker::spawn(source, push, TrackerOptions::from_config(config), logger);
    tracker.track(Some(id));

    let mut view = tracker.view();
    let mut connected = tracker.connected();
    let mut stale = tracker.stale();
    let progress = tracker.progress();
    let mut progress_print = tokio::time::interval(PROGRESS_PRINT_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = view.changed() => {
                if let Some(view) = view.borrow_and_update().clone() {
                    for line in render_view(&view) {
                        println!("{}", line);
                    }
                }
            }
            Ok(()) = connected.changed() => {
                let live = *connected.borrow_and_update();
                if live {
                    println!("~ live updates connected");
                } else {
                    println!("~ live updates disconnected; polling");
                }
            }
            Ok(()) = stale.changed() => {
                if *stale.borrow_and_update() {
                    println!("! server unreachable; showing last known state");
                }
            }
            _ = progress_print.tick() => {
                if let Some(estimate) = progress.borrow().as_ref() {
                    println!("{}", render_progress(estimate));
                }
            }
            Some(event) = events.recv() => match event {
                PhaseEvent::WorkflowCompleted { results_path, .. } => {
                    println!("Done. Results: {}", results_path);
                    break;
                }
                PhaseEvent::WorkflowFailed { error, .. } => {
                    println!("Failed: {}", error);
                    break;
                }
                PhaseEvent::PhaseChanged { .. } => {}
            },
        }
    }

    tracker.shutdown().await;
    if let Some(mut manager) = manager {
        manager.disconnect();
    }
    Ok(())
}

fn render_step(phase: Phase) -> Option<String> {
    phase
        .step()
        .map(|i| format!("[{}/{}] {}", i + 1, STEPS.len(), STEPS[i]))
}

fn render_view(view: &PhaseView) -> Vec<String> {
    let mut lines = Vec::new();
    let header = match render_step(view.phase) {
        Some(step) => format!("#{} {} {}", view.project_id, step, view.phase.description()),
        None => format!("#{} {}", view.project_id, view.phase.description()),
    };
    lines.push(header);

    if !view.questions.is_empty() {
        lines.push(format!("  {} question(s) waiting for your answers:", view.questions.len()));
        for q in &view.questions {
            lines.push(format!("  {}. [{}] {}", q.number, q.topic, q.text));
        }
    }
    if view.phase == Phase::AwaitingApproval {
        if let Some(stack) = &view.tech_stack {
            for (category, items) in stack {
                lines.push(format!("  {}: {}", category, items.join(", ")));
            }
        }
        if view.spec_md.is_some() {
            lines.push("  Architecture spec ready for review.".to_string());
        }
    }
    if let Some(error) = &view.error {
        lines.push(format!("  Error: {}", error));
    }
    lines
}

fn render_snapshot(snapshot: &WorkflowSnapshot) -> Vec<String> {
    let phase = Phase::from_snapshot(snapshot);
    let view = PhaseView::derive(phase, snapshot);
    let mut lines = vec![format!("{} ({})", snapshot.title, snapshot.status)];
    lines.extend(render_view(&view));
    lines.push(format!("  Refinements left: {}", view.refinements_remaining));
    if let Some(updated) = &snapshot.updated_at {
        lines.push(format!("  Updated: {}", updated));
    }
    lines
}

fn render_progress(estimate: &ProgressEstimate) -> String {
    format!(
        "  {:>3.0}% {}",
        estimate.elapsed_ratio * 100.0,
        estimate.remaining
    )
}

fn print_overview(projects: &[WorkflowSnapshot]) {
    if projects.is_empty() {
        println!("No projects.");
        return;
    }
    for snapshot in projects {
        let phase = Phase::from_snapshot(snapshot);
        println!("{:>6}  {:<24}  {}", snapshot.id, phase.key(), snapshot.title);
    }
}
