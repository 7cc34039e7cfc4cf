//! Загрузка CPU и памяти из `/proc`.
//!
//! CPU считается по двум снимкам кумулятивных счётчиков `/proc/stat`,
//! снятым с интервалом в одну секунду. Память берётся из `/proc/meminfo`.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Значение "ещё не измерено" / "замер отброшен".
pub const INVALID_SAMPLE: f64 = -1.0;

/// Интервал между двумя снимками `/proc/stat` при замере CPU.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Сырые счётчики CPU из первой строки `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CpuCounterSnapshot {
    pub user_ticks: u64,
    pub user_low_ticks: u64,
    pub sys_ticks: u64,
    pub idle_ticks: u64,
}

impl CpuCounterSnapshot {
    /// Загрузка CPU в процентах относительно предыдущего снимка.
    ///
    /// Возвращает `None`, если какой-либо счётчик уменьшился (переполнение
    /// или сброс). Если за интервал не прошло ни одного тика, загрузка 0.
    ///
    /// ```rust
    /// use brpc_core::metrics::system::CpuCounterSnapshot;
    ///
    /// let prev = CpuCounterSnapshot { user_ticks: 100, user_low_ticks: 0, sys_ticks: 50, idle_ticks: 850 };
    /// let cur = CpuCounterSnapshot { user_ticks: 130, user_low_ticks: 0, sys_ticks: 70, idle_ticks: 900 };
    /// assert_eq!(cur.busy_percent_since(&prev), Some(50.0));
    ///
    /// let wrapped = CpuCounterSnapshot { user_ticks: 10, ..cur };
    /// assert_eq!(wrapped.busy_percent_since(&prev), None);
    /// ```
    pub fn busy_percent_since(&self, prev: &CpuCounterSnapshot) -> Option<f64> {
        let user = self.user_ticks.checked_sub(prev.user_ticks)?;
        let user_low = self.user_low_ticks.checked_sub(prev.user_low_ticks)?;
        let sys = self.sys_ticks.checked_sub(prev.sys_ticks)?;
        let idle = self.idle_ticks.checked_sub(prev.idle_ticks)?;

        let busy = user.saturating_add(user_low).saturating_add(sys);
        let total = busy.saturating_add(idle);
        if total == 0 {
            return Some(0.0);
        }

        Some(busy as f64 * 100.0 / total as f64)
    }
}

/// Последние значения CPU/памяти. `-1` означает "ещё не измерено".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampledMetrics {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

impl SampledMetrics {
    pub fn unsampled() -> Self {
        Self {
            cpu_percent: INVALID_SAMPLE,
            mem_percent: INVALID_SAMPLE,
        }
    }

    /// Оба значения получены хотя бы один раз.
    pub fn is_ready(&self) -> bool {
        self.cpu_percent >= 0.0 && self.mem_percent >= 0.0
    }
}

impl Default for SampledMetrics {
    fn default() -> Self {
        Self::unsampled()
    }
}

/// Пути к файлам /proc, чтобы их можно было подменить в тестах.
#[derive(Debug, Clone)]
pub struct ProcPaths {
    pub stat: PathBuf,
    pub meminfo: PathBuf,
    pub uptime: PathBuf,
}

impl ProcPaths {
    /// Создаёт `ProcPaths` относительно указанного корня (`/proc` или тестовой директории).
    pub fn new(proc_root: impl AsRef<Path>) -> Self {
        let root = proc_root.as_ref();
        Self {
            stat: root.join("stat"),
            meminfo: root.join("meminfo"),
            uptime: root.join("uptime"),
        }
    }
}

impl Default for ProcPaths {
    fn default() -> Self {
        Self::new("/proc")
    }
}

/// Источник CPU/памяти для usage-цикла.
///
/// Хранит последний снятый снимок счётчиков. Вызывать `sample_cpu` должен
/// только один владелец (usage-цикл), поэтому состояние живёт в `&mut self`.
#[derive(Debug)]
pub struct MetricsSampler {
    paths: ProcPaths,
    sample_window: Duration,
    last_counters: Option<CpuCounterSnapshot>,
}

impl MetricsSampler {
    pub fn new(paths: ProcPaths) -> Self {
        Self {
            paths,
            sample_window: CPU_SAMPLE_WINDOW,
            last_counters: None,
        }
    }

    /// Переопределяет интервал между снимками (для тестов).
    pub fn with_sample_window(mut self, window: Duration) -> Self {
        self.sample_window = window;
        self
    }

    /// Последний снятый снимок счётчиков CPU.
    pub fn last_counters(&self) -> Option<CpuCounterSnapshot> {
        self.last_counters
    }

    /// Процент занятой памяти: `100 * (total - available) / total`.
    ///
    /// Возвращает `0.0`, если `/proc/meminfo` не читается или `MemTotal` равен нулю.
    pub fn sample_memory(&self) -> f64 {
        let contents = match read_file(&self.paths.meminfo) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("{:#}", e);
                return 0.0;
            }
        };
        memory_percent(&contents)
    }

    /// Загрузка CPU за одну секунду.
    ///
    /// Снимает счётчики, ждёт `sample_window`, снимает их снова. При уменьшении
    /// любого счётчика возвращает `-1`. Последний снимок запоминается в любом
    /// случае, даже если замер отброшен.
    pub async fn sample_cpu(&mut self) -> f64 {
        let first = match self.read_counters() {
            Some(counters) => counters,
            None => return INVALID_SAMPLE,
        };
        self.last_counters = Some(first);

        tokio::time::sleep(self.sample_window).await;

        let second = match self.read_counters() {
            Some(counters) => counters,
            None => return INVALID_SAMPLE,
        };
        self.advance(second)
    }

    /// Считает процент относительно сохранённого снимка и сдвигает его на `current`.
    fn advance(&mut self, current: CpuCounterSnapshot) -> f64 {
        let percent = match self.last_counters {
            Some(prev) => current.busy_percent_since(&prev),
            None => None,
        };
        self.last_counters = Some(current);

        match percent {
            Some(percent) => percent,
            None => {
                debug!(?current, "CPU counters went backwards, dropping sample");
                INVALID_SAMPLE
            }
        }
    }

    fn read_counters(&self) -> Option<CpuCounterSnapshot> {
        match read_file(&self.paths.stat).and_then(|contents| parse_cpu_counters(&contents)) {
            Ok(counters) => Some(counters),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        }
    }

    /// UNIX-время загрузки системы: текущее время минус `/proc/uptime`.
    pub fn boot_timestamp(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let uptime = read_file(&self.paths.uptime)
            .and_then(|contents| parse_uptime(&contents))
            .unwrap_or_else(|e| {
                warn!("{:#}", e);
                0.0
            });
        now - uptime as i64
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new(ProcPaths::default())
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| {
        format!(
            "Не удалось прочитать системный файл {}: проверьте, что файл существует и доступен для чтения",
            path.display()
        )
    })
}

/// Процент занятой памяти по содержимому `/proc/meminfo`.
pub fn memory_percent(contents: &str) -> f64 {
    let mut total: u64 = 0;
    let mut available: u64 = 0;

    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            _ => {}
        }
    }

    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(available) as f64 * 100.0 / total as f64
}

fn parse_cpu_counters(contents: &str) -> Result<CpuCounterSnapshot> {
    let line = contents
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| {
            anyhow!(
                "Не найдена строка с общими CPU счетчиками в /proc/stat. \
                 Ожидаемый формат: 'cpu <user> <nice> <system> <idle> ...'"
            )
        })?;

    let mut fields = line.split_whitespace().skip(1);
    let mut parse_field = |name: &str| -> Result<u64> {
        fields
            .next()
            .ok_or_else(|| anyhow!("Поле '{}' отсутствует в строке CPU в /proc/stat", name))?
            .parse::<u64>()
            .with_context(|| {
                format!(
                    "Некорректное значение поля '{}' в /proc/stat: ожидается целое число (u64)",
                    name
                )
            })
    };

    Ok(CpuCounterSnapshot {
        user_ticks: parse_field("user")?,
        user_low_ticks: parse_field("nice")?,
        sys_ticks: parse_field("system")?,
        idle_ticks: parse_field("idle")?,
    })
}

fn parse_uptime(contents: &str) -> Result<f64> {
    contents
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("Пустой /proc/uptime"))?
        .parse::<f64>()
        .context("Некорректное значение в /proc/uptime: ожидается число секунд")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROC_STAT: &str = "cpu  2255 34 2290 22625563 6290 127 456 0 0 0\n\
cpu0 1132 17 1441 11311777 3675 33 226 0 0 0\n";

    fn snapshot(user: u64, nice: u64, sys: u64, idle: u64) -> CpuCounterSnapshot {
        CpuCounterSnapshot {
            user_ticks: user,
            user_low_ticks: nice,
            sys_ticks: sys,
            idle_ticks: idle,
        }
    }

    fn fake_proc(stat: &str, meminfo: &str) -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("stat"), stat).expect("write stat");
        fs::write(dir.path().join("meminfo"), meminfo).expect("write meminfo");
        fs::write(dir.path().join("uptime"), "3600.25 7000.00\n").expect("write uptime");
        dir
    }

    #[test]
    fn parses_first_four_cpu_counters() {
        let counters = parse_cpu_counters(PROC_STAT).expect("counters");
        assert_eq!(counters, snapshot(2255, 34, 2290, 22625563));
    }

    #[test]
    fn parse_fails_without_aggregate_cpu_line() {
        assert!(parse_cpu_counters("cpu0 1 2 3 4\n").is_err());
        assert!(parse_cpu_counters("cpu  1 2\n").is_err());
    }

    #[test]
    fn busy_percent_counts_user_nice_and_system() {
        let prev = snapshot(100, 10, 40, 850);
        let cur = snapshot(120, 20, 50, 910);
        // busy = 20 + 10 + 10 = 40, total = 40 + 60 = 100
        assert_eq!(cur.busy_percent_since(&prev), Some(40.0));
    }

    #[test]
    fn busy_percent_stays_in_range_for_monotonic_counters() {
        let prev = snapshot(5, 5, 5, 5);
        for (du, dn, ds, di) in [(0, 0, 0, 1), (1, 0, 0, 0), (7, 3, 9, 0), (100, 200, 300, 400)] {
            let cur = snapshot(5 + du, 5 + dn, 5 + ds, 5 + di);
            let percent = cur.busy_percent_since(&prev).expect("percent");
            assert!((0.0..=100.0).contains(&percent), "{percent}");
        }
    }

    #[test]
    fn busy_percent_is_zero_for_identical_snapshots() {
        let same = snapshot(5, 5, 5, 5);
        assert_eq!(same.busy_percent_since(&same), Some(0.0));
    }

    #[test]
    fn busy_percent_rejects_any_decreasing_counter() {
        let prev = snapshot(100, 100, 100, 100);
        assert_eq!(snapshot(99, 100, 100, 100).busy_percent_since(&prev), None);
        assert_eq!(snapshot(100, 99, 100, 100).busy_percent_since(&prev), None);
        assert_eq!(snapshot(100, 100, 99, 100).busy_percent_since(&prev), None);
        assert_eq!(snapshot(100, 100, 100, 99).busy_percent_since(&prev), None);
    }

    #[test]
    fn advance_reports_invalid_and_still_moves_carried_snapshot() {
        let mut sampler = MetricsSampler::new(ProcPaths::new("/nonexistent"));
        sampler.last_counters = Some(snapshot(500, 0, 500, 500));

        let wrapped = snapshot(10, 0, 10, 10);
        assert_eq!(sampler.advance(wrapped), INVALID_SAMPLE);
        assert_eq!(sampler.last_counters(), Some(wrapped));

        let next = snapshot(20, 0, 20, 30);
        assert_eq!(sampler.advance(next), 50.0);
        assert_eq!(sampler.last_counters(), Some(next));
    }

    #[test]
    fn memory_percent_matches_meminfo() {
        let meminfo = "MemTotal:       1000000 kB\nMemFree:         100000 kB\nMemAvailable:    250000 kB\n";
        assert_eq!(memory_percent(meminfo), 75.0);
    }

    #[test]
    fn memory_percent_is_zero_when_total_is_zero_or_missing() {
        assert_eq!(memory_percent("MemTotal: 0 kB\nMemAvailable: 0 kB\n"), 0.0);
        assert_eq!(memory_percent("MemAvailable: 1234 kB\n"), 0.0);
        assert_eq!(memory_percent(""), 0.0);
    }

    #[test]
    fn sample_memory_reads_meminfo_file() {
        let dir = fake_proc(PROC_STAT, "MemTotal: 1000000 kB\nMemAvailable: 250000 kB\n");
        let sampler = MetricsSampler::new(ProcPaths::new(dir.path()));
        assert_eq!(sampler.sample_memory(), 75.0);
    }

    #[test]
    fn sample_memory_is_zero_for_missing_file() {
        let sampler = MetricsSampler::new(ProcPaths::new("/nonexistent/proc"));
        assert_eq!(sampler.sample_memory(), 0.0);
    }

    #[tokio::test]
    async fn sample_cpu_is_zero_when_counters_do_not_move() {
        let dir = fake_proc(PROC_STAT, "MemTotal: 1 kB\n");
        let mut sampler = MetricsSampler::new(ProcPaths::new(dir.path()))
            .with_sample_window(Duration::from_millis(5));
        assert_eq!(sampler.sample_cpu().await, 0.0);
        assert!(sampler.last_counters().is_some());
    }

    #[tokio::test]
    async fn sample_cpu_detects_counter_regression() {
        let dir = fake_proc("cpu  1000 0 1000 1000\n", "MemTotal: 1 kB\n");
        let stat = dir.path().join("stat");
        let mut sampler = MetricsSampler::new(ProcPaths::new(dir.path()))
            .with_sample_window(Duration::from_millis(300));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(stat, "cpu  10 0 10 10\n").expect("rewrite stat");
        });

        assert_eq!(sampler.sample_cpu().await, INVALID_SAMPLE);
        writer.await.expect("writer");
        assert_eq!(sampler.last_counters(), Some(snapshot(10, 0, 10, 10)));
    }

    #[tokio::test]
    async fn sample_cpu_reports_busy_share() {
        let dir = fake_proc("cpu  100 0 100 800\n", "MemTotal: 1 kB\n");
        let stat = dir.path().join("stat");
        let mut sampler = MetricsSampler::new(ProcPaths::new(dir.path()))
            .with_sample_window(Duration::from_millis(300));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(stat, "cpu  150 0 150 900\n").expect("rewrite stat");
        });

        assert_eq!(sampler.sample_cpu().await, 50.0);
        writer.await.expect("writer");
    }

    #[test]
    fn boot_timestamp_subtracts_uptime() {
        let dir = fake_proc(PROC_STAT, "MemTotal: 1 kB\n");
        let sampler = MetricsSampler::new(ProcPaths::new(dir.path()));
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs() as i64;
        let boot = sampler.boot_timestamp();
        assert!((now - 3600 - boot).abs() <= 2, "boot={boot} now={now}");
    }

    #[test]
    fn sampled_metrics_readiness() {
        assert!(!SampledMetrics::unsampled().is_ready());
        assert!(!SampledMetrics { cpu_percent: 3.0, mem_percent: -1.0 }.is_ready());
        assert!(SampledMetrics { cpu_percent: 0.0, mem_percent: 12.5 }.is_ready());
    }
}
