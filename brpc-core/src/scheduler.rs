//! Два цикла опроса.
//!
//! - **usage**: один раз определяет дистрибутив, оконный менеджер и время
//!   загрузки, затем по кругу меряет память и CPU.
//! - **presence**: ждёт первых замеров, затем раз в `update_sleep` опрашивает
//!   активное окно, собирает [`PresenceRecord`] и кладёт его в канал, откуда
//!   его забирает главный цикл.
//!
//! Оба цикла проверяют флаг завершения после каждого блокирующего шага.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classify::assets::{AssetResolver, WindowAsset};
use crate::config::Config;
use crate::metrics::distro::DistroIdentifier;
use crate::metrics::system::MetricsSampler;
use crate::metrics::windows::{ActiveWindowProbe, UNKNOWN_WINDOW_MANAGER};
use crate::state::{HostInfo, PresenceRecord, PresenceStateStore};

/// Сколько ждать ответа от бекенда окон, прежде чем считать тик пустым.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Параметры циклов из конфигурации.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub usage_sleep: Duration,
    pub update_sleep: Duration,
    pub no_small_image: bool,
    pub probe_timeout: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            usage_sleep: Duration::from_millis(config.usage_sleep_ms),
            update_sleep: Duration::from_millis(config.update_sleep_ms),
            no_small_image: config.no_small_image,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

/// Спит `duration` или до сигнала завершения. `true`, если пора выходить.
///
/// Закрытый канал тоже считается сигналом завершения.
pub async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow_and_update() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown_rx.borrow(),
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

/// Блокирующий опрос бекенда окон в пуле `spawn_blocking` с ограничением по времени.
///
/// Зависший вызов продолжает занимать поток и после таймаута, поэтому новый
/// вызов не запускается, пока предыдущий не вернулся.
struct BlockingProbe {
    probe: Arc<dyn ActiveWindowProbe>,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
}

impl BlockingProbe {
    fn new(probe: Arc<dyn ActiveWindowProbe>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run<F>(&self, what: &str, call: F) -> Option<String>
    where
        F: FnOnce(&dyn ActiveWindowProbe) -> String + Send + 'static,
    {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Window probe ({}) still running, skipping tick", what);
            return None;
        }

        let probe = Arc::clone(&self.probe);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            call(probe.as_ref())
        });
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(name)) => Some(name),
            Ok(Err(e)) => {
                warn!("Window probe task ({}) failed: {}", what, e);
                None
            }
            Err(_) => {
                warn!("Window probe ({}) timed out after {:?}", what, self.timeout);
                None
            }
        }
    }
}

/// Снимает флаг "опрос идёт" при выходе из задачи, в том числе при панике.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Цикл замера CPU и памяти.
pub async fn usage_loop(
    mut sampler: MetricsSampler,
    distro: DistroIdentifier,
    probe: Arc<dyn ActiveWindowProbe>,
    store: Arc<PresenceStateStore>,
    settings: LoopSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let probe = BlockingProbe::new(probe, settings.probe_timeout);
    let host = HostInfo {
        distro: distro.identify(),
        window_manager: probe
            .run("window manager", |p| p.window_manager_name())
            .await
        .unwrap_or_else(|| UNKNOWN_WINDOW_MANAGER.to_string()),
        start_timestamp: sampler.boot_timestamp(),
    };
    info!(
        distro = %host.distro,
        window_manager = %host.window_manager,
        start = host.start_timestamp,
        "Host detected"
    );
    store.publish_host(host);

    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }

        let mem = sampler.sample_memory();
        store.publish_memory(mem);

        let cpu = tokio::select! {
            cpu = sampler.sample_cpu() => cpu,
            _ = shutdown_rx.changed() => break,
        };
        if store.publish_cpu(cpu) {
            debug!(cpu, mem, "Usage sampled");
        } else {
            debug!(mem, "CPU sample dropped, keeping previous value");
        }

        if sleep_or_shutdown(settings.usage_sleep, &mut shutdown_rx).await {
            break;
        }
    }
    debug!("Usage loop stopped");
}

/// Цикл сборки статуса. Каждый тик кладёт свежую запись в `records`.
pub async fn presence_loop(
    probe: Arc<dyn ActiveWindowProbe>,
    resolver: Arc<AssetResolver>,
    store: Arc<PresenceStateStore>,
    records: watch::Sender<Option<PresenceRecord>>,
    settings: LoopSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = store.wait_until_sampled() => {}
        _ = shutdown_rx.wait_for(|stop| *stop) => {
            debug!("Presence loop stopped before first sample");
            return;
        }
    }

    let host = store.host().unwrap_or_default();
    let large_asset = resolver.resolve_distro(&host.distro);
    debug!(image = %large_asset.image_key, text = %large_asset.display_text, "Distro asset resolved");

    let probe = BlockingProbe::new(probe, settings.probe_timeout);
    let mut small_asset = WindowAsset::default();
    loop {
        if sleep_or_shutdown(settings.update_sleep, &mut shutdown_rx).await {
            break;
        }

        if !settings.no_small_image {
            // Таймаут или сбой задачи = нет окна на этом тике
            let window = probe
                .run("active window", |p| p.probe_active_window())
                .await
                .unwrap_or_default();

            if window != store.active_window() {
                small_asset = resolver.resolve_window(&window);
                debug!(
                    window = %window,
                    image = %small_asset.image_key,
                    "Active window changed"
                );
                store.set_active_window(&window);
            }
        }

        let record = PresenceRecord::compose(
            &store.metrics(),
            &host,
            small_asset.clone(),
            large_asset.clone(),
        );
        // Отдаём запись на каждом тике, даже если она не изменилась
        records.send_replace(Some(record));
    }
    debug!("Presence loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::assets::AssetRules;
    use crate::metrics::system::ProcPaths;
    use crate::metrics::windows::StaticWindowIntrospector;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn settings(no_small_image: bool) -> LoopSettings {
        LoopSettings {
            usage_sleep: Duration::from_millis(20),
            update_sleep: Duration::from_millis(10),
            no_small_image,
            probe_timeout: Duration::from_millis(500),
        }
    }

    fn resolver() -> Arc<AssetResolver> {
        Arc::new(AssetResolver::new(AssetRules::builtin().expect("rules")).with_version("test"))
    }

    fn sampled_store(distro: &str) -> Arc<PresenceStateStore> {
        let store = Arc::new(PresenceStateStore::new());
        store.publish_host(HostInfo {
            distro: distro.to_string(),
            window_manager: "Hyprland".to_string(),
            start_timestamp: 1_700_000_000,
        });
        store.publish_memory(50.0);
        store.publish_cpu(25.0);
        store
    }

    /// Бекенд, который отдаёт окна из списка по очереди и считает вызовы.
    struct ScriptedProbe {
        windows: Mutex<Vec<&'static str>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(windows: &[&'static str]) -> Self {
            let mut windows = windows.to_vec();
            windows.reverse();
            Self {
                windows: Mutex::new(windows),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ActiveWindowProbe for ScriptedProbe {
        fn probe_active_window(&self) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut windows = self.windows.lock().expect("lock");
            let next = if windows.len() > 1 {
                windows.pop()
            } else {
                windows.last().copied()
            };
            next.unwrap_or_default().to_string()
        }

        fn window_manager_name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn write_stat(dir: &Path, ticks: u64) {
        let tmp = dir.join("stat.tmp");
        fs::write(&tmp, format!("cpu  {} 0 {} {}\n", ticks, ticks, ticks * 2)).expect("write stat");
        fs::rename(&tmp, dir.join("stat")).expect("rename stat");
    }

    /// Бекенд, который отвечает с задержкой.
    struct SlowProbe {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ActiveWindowProbe for SlowProbe {
        fn probe_active_window(&self) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            "Firefox".to_string()
        }

        fn window_manager_name(&self) -> String {
            "slow".to_string()
        }
    }

    #[tokio::test]
    async fn hung_probe_is_not_restarted_until_it_returns() {
        let slow = Arc::new(SlowProbe {
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let probe = BlockingProbe::new(slow.clone(), Duration::from_millis(20));

        for _ in 0..3 {
            assert_eq!(probe.run("active window", |p| p.probe_active_window()).await, None);
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

        let probe = BlockingProbe {
            timeout: Duration::from_secs(5),
            ..probe
        };
        assert_eq!(
            probe.run("active window", |p| p.probe_active_window()).await,
            Some("Firefox".to_string())
        );
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sleep_or_shutdown_reports_signal() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(5), &mut rx).await);

        tx.send(true).expect("send");
        assert!(sleep_or_shutdown(Duration::from_secs(30), &mut rx).await);

        drop(tx);
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(sleep_or_shutdown(Duration::from_secs(30), &mut rx).await);
    }

    #[tokio::test]
    async fn presence_loop_publishes_composed_record() {
        let store = sampled_store("Arch Linux");
        let probe: Arc<dyn ActiveWindowProbe> =
            Arc::new(StaticWindowIntrospector::new(Some("Firefox"), None));
        let (records_tx, mut records_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(presence_loop(
            probe,
            resolver(),
            Arc::clone(&store),
            records_tx,
            settings(false),
            shutdown_rx,
        ));

        let record = tokio::time::timeout(
            Duration::from_secs(5),
            records_rx.wait_for(|r| r.is_some()),
        )
        .await
        .expect("record in time")
        .expect("channel open")
        .clone()
        .expect("record");

        assert_eq!(record.details, "CPU: 25% | RAM: 50%");
        assert_eq!(record.state, "WM: Hyprland");
        assert_eq!(record.small_asset.image_key, "firefox");
        assert_eq!(record.small_asset.display_text, "Firefox");
        assert_eq!(record.large_asset.image_key, "archlinux");
        assert_eq!(record.large_asset.display_text, "Arch Linux / Better-RPC++ test");
        assert_eq!(record.start_timestamp, 1_700_000_000);
        assert_eq!(store.active_window(), "Firefox");

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits")
            .expect("join");
    }

    #[tokio::test]
    async fn presence_loop_hands_over_unchanged_record_every_tick() {
        let store = sampled_store("Arch Linux");
        let probe: Arc<dyn ActiveWindowProbe> =
            Arc::new(StaticWindowIntrospector::new(Some("Firefox"), None));
        let (records_tx, mut records_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(presence_loop(
            probe,
            resolver(),
            Arc::clone(&store),
            records_tx,
            settings(false),
            shutdown_rx,
        ));

        let mut seen = Vec::new();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), records_rx.changed())
                .await
                .expect("tick in time")
                .expect("channel open");
            seen.push(records_rx.borrow_and_update().clone().expect("record"));
        }
        assert!(seen.windows(2).all(|pair| pair[0] == pair[1]));

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits")
            .expect("join");
    }

    #[tokio::test]
    async fn presence_loop_skips_probe_without_small_image() {
        let store = sampled_store("Ubuntu");
        let scripted = Arc::new(ScriptedProbe::new(&["kitty"]));
        let probe: Arc<dyn ActiveWindowProbe> = scripted.clone();
        let (records_tx, mut records_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(presence_loop(
            probe,
            resolver(),
            Arc::clone(&store),
            records_tx,
            settings(true),
            shutdown_rx,
        ));

        let record = tokio::time::timeout(
            Duration::from_secs(5),
            records_rx.wait_for(|r| r.is_some()),
        )
        .await
        .expect("record in time")
        .expect("channel open")
        .clone()
        .expect("record");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(record.small_asset, WindowAsset::default());
        assert_eq!(record.large_asset.image_key, "ubuntu");
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn presence_loop_follows_window_changes() {
        let store = sampled_store("Fedora");
        let probe: Arc<dyn ActiveWindowProbe> =
            Arc::new(ScriptedProbe::new(&["kitty", "kitty", "", "Code"]));
        let (records_tx, mut records_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(presence_loop(
            probe,
            resolver(),
            Arc::clone(&store),
            records_tx,
            settings(false),
            shutdown_rx,
        ));

        let record = tokio::time::timeout(
            Duration::from_secs(5),
            records_rx.wait_for(|r| {
                r.as_ref()
                    .is_some_and(|r| r.small_asset.display_text == "Code")
            }),
        )
        .await
        .expect("window change observed")
        .expect("channel open")
        .clone()
        .expect("record");

        assert_eq!(record.small_asset.image_key, "vscode");
        assert_eq!(store.active_window(), "Code");

        shutdown_tx.send(true).expect("shutdown");
        handle.await.expect("join");
    }

    #[tokio::test]
    async fn presence_loop_exits_before_first_sample_on_shutdown() {
        let store = Arc::new(PresenceStateStore::new());
        let probe: Arc<dyn ActiveWindowProbe> = Arc::new(StaticWindowIntrospector::default());
        let (records_tx, records_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(presence_loop(
            probe,
            resolver(),
            store,
            records_tx,
            settings(false),
            shutdown_rx,
        ));
        shutdown_tx.send(true).expect("shutdown");

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits")
            .expect("join");
        assert!(records_rx.borrow().is_none());
    }

    #[tokio::test]
    async fn usage_loop_publishes_host_and_samples() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 1000000 kB\nMemAvailable: 250000 kB\n",
        )
        .expect("meminfo");
        fs::write(dir.path().join("uptime"), "100.0 50.0\n").expect("uptime");
        fs::write(dir.path().join("os-release"), "NAME=\"Ubuntu\"\n").expect("os-release");
        write_stat(dir.path(), 1);

        // Счётчики растут, пока идёт замер
        let stat_dir = dir.path().to_path_buf();
        let ticker = tokio::spawn(async move {
            for ticks in 2.. {
                tokio::time::sleep(Duration::from_millis(5)).await;
                write_stat(&stat_dir, ticks);
            }
        });

        let sampler = MetricsSampler::new(ProcPaths::new(dir.path()))
            .with_sample_window(Duration::from_millis(50));
        let distro = DistroIdentifier::new(
            dir.path().join("lsb-release"),
            dir.path().join("os-release"),
        );
        let probe: Arc<dyn ActiveWindowProbe> = Arc::new(ScriptedProbe::new(&[]));
        let store = Arc::new(PresenceStateStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(usage_loop(
            sampler,
            distro,
            probe,
            Arc::clone(&store),
            settings(false),
            shutdown_rx,
        ));

        let metrics = tokio::time::timeout(Duration::from_secs(5), store.wait_until_sampled())
            .await
            .expect("sampled in time");
        assert_eq!(metrics.mem_percent, 75.0);
        // busy = 2 * dt, idle = 2 * dt
        assert_eq!(metrics.cpu_percent, 50.0);

        let host = store.host().expect("host published");
        assert_eq!(host.distro, "Ubuntu");
        assert_eq!(host.window_manager, "scripted");
        assert!(host.start_timestamp > 0);

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits")
            .expect("join");
        ticker.abort();
    }
}
