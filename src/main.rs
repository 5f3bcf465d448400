use std::io::Write;
use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chief_of_staff::agents::{AgentRegistry, AgentRunner, CommandRunner, DetachedRunner};
use chief_of_staff::config::AppConfig;
use chief_of_staff::daemon::{Daemon, DaemonDeps, ProcFsMetrics};
use chief_of_staff::events::{DaemonEvent, EventBus};
use chief_of_staff::state::StateStore;
use chief_of_staff::tasks::TaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    tokio::fs::create_dir_all(&config.data_dir).await?;

    eprintln!("Chief of Staff v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", config.data_dir.display());
    match &config.agent_command {
        Some(cmd) => eprintln!("   Agent command: {cmd}"),
        None => eprintln!("   Agent command: none (events on stdout for an external runner)"),
    }
    if let Some(dir) = &config.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }

    // ── Stores ───────────────────────────────────────────────────────────
    let events = EventBus::new(config.event_capacity);
    let state = Arc::new(StateStore::new(config.state_path(), events.clone()));
    let tasks = Arc::new(TaskStore::new(
        config.user_tasks_path(),
        config.system_tasks_path(),
        events.clone(),
    ));
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&state),
        events.clone(),
        config.agent_logs_dir(),
    ));

    // ── Runner ───────────────────────────────────────────────────────────
    let runner: Arc<dyn AgentRunner> = match &config.agent_command {
        Some(command) => {
            let runner = CommandRunner::new(
                command.clone(),
                config.data_dir.clone(),
                Arc::clone(&registry),
                Arc::clone(&tasks),
            );
            runner.spawn_listener(&events);
            runner
        }
        None => {
            spawn_event_printer(&events);
            Arc::new(DetachedRunner)
        }
    };

    // ── Daemon ───────────────────────────────────────────────────────────
    let daemon = Daemon::new(DaemonDeps {
        state,
        tasks,
        registry,
        runner,
        metrics: Arc::new(ProcFsMetrics::new()),
        events,
    });

    let report = daemon.start().await?;
    eprintln!(
        "   Recovered: {} zombie agent(s), {} orphaned task(s)\n",
        report.zombies.cleaned.len(),
        report.orphaned_tasks.len()
    );

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    daemon.stop().await?;
    Ok(())
}

/// Console logging, plus a daily rolling file when `COS_LOG_DIR` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chief-of-staff.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    guard
}

/// Dispatch-only mode: every event except raw agent output goes to stdout as
/// one JSON line.
fn spawn_event_printer(events: &EventBus) {
    let mut stream = events.stream();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(DaemonEvent::AgentOutput { .. }) => continue,
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Event printer lagged");
                    continue;
                }
            };
            if let Ok(line) = serde_json::to_string(&event) {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{line}");
                let _ = stdout.flush();
            }
        }
    });
}
