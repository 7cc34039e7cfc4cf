//! Общее состояние между usage-циклом и presence-циклом.
//!
//! Каждое поле хранится в своём `watch`-канале: писатель один, читателей
//! сколько угодно, читатель всегда видит последнее записанное значение целиком.
//! История не хранится.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::classify::assets::{DistroAsset, WindowAsset};
use crate::metrics::system::SampledMetrics;

/// Данные о машине, которые определяются один раз при старте usage-цикла.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub distro: String,
    pub window_manager: String,
    /// UNIX-время загрузки системы.
    pub start_timestamp: i64,
}

/// Хранилище последних значений.
///
/// Писатели: usage-цикл (CPU, память, [`HostInfo`]) и presence-цикл
/// (последнее активное окно).
#[derive(Debug)]
pub struct PresenceStateStore {
    metrics: watch::Sender<SampledMetrics>,
    host: watch::Sender<Option<HostInfo>>,
    active_window: watch::Sender<String>,
}

impl PresenceStateStore {
    pub fn new() -> Self {
        Self {
            metrics: watch::Sender::new(SampledMetrics::unsampled()),
            host: watch::Sender::new(None),
            active_window: watch::Sender::new(String::new()),
        }
    }

    pub fn metrics(&self) -> SampledMetrics {
        *self.metrics.borrow()
    }

    pub fn publish_memory(&self, mem_percent: f64) {
        self.metrics.send_modify(|m| m.mem_percent = mem_percent);
    }

    /// Записывает CPU. Отброшенный замер (`< 0`) не затирает прошлое значение.
    ///
    /// Возвращает `false`, если значение было отброшено.
    pub fn publish_cpu(&self, cpu_percent: f64) -> bool {
        if cpu_percent < 0.0 || cpu_percent.is_nan() {
            return false;
        }
        self.metrics.send_modify(|m| m.cpu_percent = cpu_percent);
        true
    }

    /// Ждёт, пока CPU и память будут измерены хотя бы по разу.
    pub async fn wait_until_sampled(&self) -> SampledMetrics {
        let mut rx = self.metrics.subscribe();
        let ready = rx.wait_for(SampledMetrics::is_ready).await.map(|m| *m);
        ready.unwrap_or_else(|_| self.metrics())
    }

    pub fn publish_host(&self, host: HostInfo) {
        self.host.send_replace(Some(host));
    }

    /// Данные о машине, если usage-цикл уже их определил.
    pub fn host(&self) -> Option<HostInfo> {
        self.host.borrow().clone()
    }

    pub fn set_active_window(&self, name: &str) {
        self.active_window.send_if_modified(|current| {
            if current == name {
                return false;
            }
            *current = name.to_string();
            true
        });
    }

    pub fn active_window(&self) -> String {
        self.active_window.borrow().clone()
    }
}

impl Default for PresenceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Статус, который отдаётся наружу на каждом тике presence-цикла.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub details: String,
    pub state: String,
    pub small_asset: WindowAsset,
    pub large_asset: DistroAsset,
    pub start_timestamp: i64,
}

impl PresenceRecord {
    /// Собирает запись: `CPU: N% | RAM: M%`, `WM: <имя>` и картинки.
    pub fn compose(
        metrics: &SampledMetrics,
        host: &HostInfo,
        small_asset: WindowAsset,
        large_asset: DistroAsset,
    ) -> Self {
        Self {
            details: format!(
                "CPU: {}% | RAM: {}%",
                display_percent(metrics.cpu_percent),
                display_percent(metrics.mem_percent)
            ),
            state: format!("WM: {}", host.window_manager),
            small_asset,
            large_asset,
            start_timestamp: host.start_timestamp,
        }
    }
}

fn display_percent(value: f64) -> i64 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn new_store_is_unsampled() {
        let store = PresenceStateStore::new();
        assert!(!store.metrics().is_ready());
        assert_eq!(store.host(), None);
        assert_eq!(store.active_window(), "");
    }

    #[test]
    fn invalid_cpu_sample_keeps_previous_value() {
        let store = PresenceStateStore::new();
        assert!(store.publish_cpu(42.5));
        assert!(!store.publish_cpu(-1.0));
        assert_eq!(store.metrics().cpu_percent, 42.5);
    }

    #[test]
    fn last_write_wins() {
        let store = PresenceStateStore::new();
        store.publish_memory(10.0);
        store.publish_memory(20.0);
        store.set_active_window("kitty");
        store.set_active_window("firefox");
        assert_eq!(store.metrics().mem_percent, 20.0);
        assert_eq!(store.active_window(), "firefox");
    }

    #[tokio::test]
    async fn wait_until_sampled_returns_once_both_values_exist() {
        let store = Arc::new(PresenceStateStore::new());
        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.publish_memory(55.0);
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.publish_cpu(12.0);
        });

        let metrics = tokio::time::timeout(Duration::from_secs(5), store.wait_until_sampled())
            .await
            .expect("metrics become ready");
        assert_eq!(metrics.mem_percent, 55.0);
        assert_eq!(metrics.cpu_percent, 12.0);
    }

    #[test]
    fn compose_formats_details_and_state() {
        let host = HostInfo {
            distro: "Arch Linux".to_string(),
            window_manager: "Hyprland".to_string(),
            start_timestamp: 1_700_000_000,
        };
        let metrics = SampledMetrics {
            cpu_percent: 37.9,
            mem_percent: 61.2,
        };
        let small = WindowAsset {
            image_key: "firefox".to_string(),
            display_text: "Firefox".to_string(),
        };
        let record = PresenceRecord::compose(&metrics, &host, small.clone(), DistroAsset::default());

        assert_eq!(record.details, "CPU: 37% | RAM: 61%");
        assert_eq!(record.state, "WM: Hyprland");
        assert_eq!(record.small_asset, small);
        assert_eq!(record.start_timestamp, 1_700_000_000);
    }

    #[test]
    fn compose_never_shows_negative_percentages() {
        let record = PresenceRecord::compose(
            &SampledMetrics::unsampled(),
            &HostInfo::default(),
            WindowAsset::default(),
            DistroAsset::default(),
        );
        assert_eq!(record.details, "CPU: 0% | RAM: 0%");
    }
}
