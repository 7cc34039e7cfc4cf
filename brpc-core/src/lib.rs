pub mod classify;
pub mod config;
pub mod metrics;
pub mod reporter;
pub mod scheduler;
pub mod state;
pub mod utils;

use anyhow::{Context, Result};
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classify::assets::{AssetResolver, AssetRules};
use crate::metrics::distro::DistroIdentifier;
use crate::metrics::system::MetricsSampler;
use crate::metrics::windows::ActiveWindowProbe;
use crate::reporter::{PresenceReporter, ReporterError};
use crate::scheduler::{presence_loop, usage_loop, LoopSettings};
use crate::state::PresenceStateStore;

/// Callback функция для уведомления о готовности демона (например, для systemd notify).
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// Callback функция для обновления статуса демона (например, для systemd notify).
pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Период главного цикла: разбор ответов клиента и пересылка новых записей.
pub const CALLBACK_INTERVAL: Duration = Duration::from_millis(16);

/// Сколько ждать остановки циклов после сигнала завершения.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Откуда демон берёт данные о машине.
///
/// По умолчанию `/proc` и `/etc`; тесты подставляют временные каталоги.
#[derive(Debug, Default)]
pub struct HostSources {
    pub sampler: MetricsSampler,
    pub distro: DistroIdentifier,
}

/// Запускает демон с системными путями.
///
/// См. [`run_daemon_with`].
pub async fn run_daemon<R: PresenceReporter>(
    config: Config,
    probe: Arc<dyn ActiveWindowProbe>,
    reporter: R,
    shutdown_rx: watch::Receiver<bool>,
    on_ready: Option<ReadyCallback>,
    on_status_update: Option<StatusCallback>,
) -> Result<()> {
    run_daemon_with(
        config,
        HostSources::default(),
        probe,
        reporter,
        shutdown_rx,
        on_ready,
        on_status_update,
    )
    .await
}

/// Главный цикл демона.
///
/// Запускает usage- и presence-циклы, затем каждые [`CALLBACK_INTERVAL`]
/// отдаёт reporter'у новую запись (если она появилась) и вызывает
/// `run_callbacks`. Ошибки reporter'а не останавливают демон.
///
/// После сигнала завершения ждёт циклы не дольше [`SHUTDOWN_GRACE`],
/// отменяет оставшиеся и закрывает reporter.
///
/// # Ошибки
///
/// Возвращает ошибку только если не удалось собрать таблицы алиасов.
pub async fn run_daemon_with<R: PresenceReporter>(
    config: Config,
    sources: HostSources,
    probe: Arc<dyn ActiveWindowProbe>,
    mut reporter: R,
    mut shutdown_rx: watch::Receiver<bool>,
    on_ready: Option<ReadyCallback>,
    on_status_update: Option<StatusCallback>,
) -> Result<()> {
    info!(
        "Initializing brpc daemon (usage_sleep = {} ms, update_sleep = {} ms, small image = {})",
        config.usage_sleep_ms, config.update_sleep_ms, !config.no_small_image
    );

    let rules = AssetRules::builtin().context("Failed to compile built-in alias tables")?;
    let resolver = Arc::new(AssetResolver::new(rules));
    let store = Arc::new(PresenceStateStore::new());
    let settings = LoopSettings::from_config(&config);
    let (records_tx, mut records_rx) = watch::channel(None);

    let usage = tokio::spawn(usage_loop(
        sources.sampler,
        sources.distro,
        Arc::clone(&probe),
        Arc::clone(&store),
        settings,
        shutdown_rx.clone(),
    ));
    let presence = tokio::spawn(presence_loop(
        probe,
        resolver,
        Arc::clone(&store),
        records_tx,
        settings,
        shutdown_rx.clone(),
    ));

    info!("brpc daemon started, entering main loop");

    // Вызываем callback уведомления о готовности (например, для systemd notify)
    if let Some(ref callback) = on_ready {
        callback();
    }

    let mut ticker = tokio::time::interval(CALLBACK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut health = ReporterHealth::default();

    loop {
        if *shutdown_rx.borrow_and_update() {
            info!("Shutdown signal received, exiting main loop");
            break;
        }

        // Закрытый канал значит, что presence-цикл завершился: записей больше не будет
        if records_rx.has_changed().unwrap_or(false) {
            let record = records_rx.borrow_and_update().clone();
            if let Some(record) = record {
                health.observe(reporter.update(&record));
                if let Some(ref callback) = on_status_update {
                    callback(&record.details);
                }
            }
        }
        health.observe(reporter.run_callbacks());

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    warn!("Shutdown channel closed, exiting main loop");
                    break;
                }
            }
        }
    }

    stop_loops([("usage", usage), ("presence", presence)]).await;
    reporter.close();
    info!("brpc daemon stopped");
    Ok(())
}

/// Ждёт циклы до общего дедлайна и отменяет те, что не успели.
async fn stop_loops<const N: usize>(loops: [(&str, JoinHandle<()>); N]) {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    for (name, mut handle) in loops {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => debug!("{} loop finished", name),
            Ok(Err(e)) => warn!("{} loop panicked or was cancelled: {}", name, e),
            Err(_) => {
                warn!(
                    "{} loop did not stop within {:?}, aborting",
                    name, SHUTDOWN_GRACE
                );
                handle.abort();
            }
        }
    }
}

/// Логирует ошибки reporter'а без спама: первая ошибка в `warn`, повторы в `debug`.
#[derive(Debug)]
struct ReporterHealth {
    healthy: bool,
}

impl Default for ReporterHealth {
    fn default() -> Self {
        Self { healthy: true }
    }
}

impl ReporterHealth {
    fn observe(&mut self, result: Result<(), ReporterError>) {
        match result {
            Ok(()) => {
                if !self.healthy {
                    info!("Presence reporter recovered");
                    self.healthy = true;
                }
            }
            Err(e) if self.healthy => {
                warn!("Presence reporter error: {} (will retry)", e);
                self.healthy = false;
            }
            Err(e) => debug!("Presence reporter still failing: {}", e),
        }
    }
}
