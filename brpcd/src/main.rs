use anyhow::{Context, Result};
use brpc_core::config::Config;
use brpc_core::metrics::windows::WindowManagerProbe;
use brpc_core::reporter::DiscordIpcReporter;
use brpc_core::{run_daemon, ReadyCallback, StatusCallback};
use brpc_core::utils::process::{wait_for_any_process, PRESENCE_CLIENTS};
use brpcd::cli::Args;
use brpcd::daemonize::daemonize;
use brpcd::pidfile::{self, KillOutcome, PidFile, PID_FILE};
use brpcd::systemd;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Как часто проверять, запущен ли Discord.
const CLIENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// После скольких секунд ожидания подсказывать про `-f`.
const CLIENT_HINT_AFTER: Duration = Duration::from_secs(20);

fn main() -> Result<()> {
    let args = Args::parse();

    if args.kill {
        return kill_running();
    }

    let config = args.load_config()?;
    init_tracing(config.debug);

    // Проверяем до fork, чтобы сообщение увидел пользователь в терминале
    if let Some(pid) = pidfile::read_pid(Path::new(PID_FILE))? {
        if pidfile::is_alive(pid) {
            anyhow::bail!(
                "An instance of brpc is already running (PID {}). Use `brpc -k` to kill it before starting a new one.",
                pid
            );
        }
    }

    // Без дисплея и сокета композитора работать не с чем: выходим, пока есть терминал
    drop(WindowManagerProbe::connect()?);

    if !args.foreground {
        daemonize()?;
    }
    let pid_file = PidFile::acquire(PID_FILE)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let result = runtime.block_on(serve(config));

    pid_file.release();
    result
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn kill_running() -> Result<()> {
    match pidfile::kill_running(Path::new(PID_FILE))? {
        KillOutcome::Killed(pid) => println!("Killed running brpc process (PID: {}).", pid),
        KillOutcome::NotRunning => println!("No running brpc process found."),
    }
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(
        "Starting brpc {} (client_id = {})",
        env!("CARGO_PKG_VERSION"),
        config.client_id
    );

    // Создаём канал для graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Создаём задачу для обработки сигналов завершения
    let mut sigterm = signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
        }
        systemd::notify_stopping();
        let _ = shutdown_tx.send(true);
    });

    if !config.ignore_discord_check {
        let found = wait_for_any_process(
            PRESENCE_CLIENTS,
            CLIENT_POLL_INTERVAL,
            CLIENT_HINT_AFTER,
            &mut shutdown_rx,
        )
        .await?;
        if !found {
            tracing::info!("Exiting...");
            return Ok(());
        }
    }

    let probe = tokio::task::spawn_blocking(WindowManagerProbe::connect)
        .await
        .context("Window probe initialization task failed")??;
    tracing::debug!(?probe, "Window backend ready");

    let reporter = DiscordIpcReporter::new(config.client_id.clone());
    let on_ready: ReadyCallback = Box::new(|| {
        if let Err(e) = systemd::notify_ready() {
            tracing::debug!("systemd notify skipped: {:#}", e);
        }
    });
    let on_status: StatusCallback = Box::new(systemd::notify_status);

    run_daemon(
        config,
        Arc::new(probe),
        reporter,
        shutdown_rx,
        Some(on_ready),
        Some(on_status),
    )
    .await?;

    tracing::info!("Exiting...");
    Ok(())
}
