use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Системный конфиг, используется, если нет пользовательского.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/brpc/config.yml";

/// Пользовательский конфиг относительно `$HOME`.
pub const USER_CONFIG_RELATIVE: &str = ".config/brpc/config.yml";

/// Application ID для Discord по умолчанию.
pub const DEFAULT_CLIENT_ID: &str = "934099338374824007";

const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Пауза между замерами CPU/памяти (мс). Сам замер CPU занимает ещё ~1 с.
    pub usage_sleep_ms: u64,
    /// Пауза между обновлениями статуса и опросом активного окна (мс).
    pub update_sleep_ms: u64,
    /// Не ждать запуска Discord/Vesktop при старте.
    pub ignore_discord_check: bool,
    /// Не показывать маленькую картинку (активное окно) и не опрашивать окна.
    pub no_small_image: bool,
    pub debug: bool,
    pub client_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            usage_sleep_ms: 5000,
            update_sleep_ms: 300,
            ignore_discord_check: false,
            no_small_image: false,
            debug: false,
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        // Пустой файл тоже валиден: всё по умолчанию
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&data)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?
        };
        cfg.validate()
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(cfg)
    }

    /// Пользовательский конфиг, затем системный, затем значения по умолчанию.
    pub fn discover() -> Result<Self> {
        let user = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(USER_CONFIG_RELATIVE));
        Self::discover_in(user.as_deref(), Path::new(SYSTEM_CONFIG_PATH))
    }

    pub fn discover_in(user: Option<&Path>, system: &Path) -> Result<Self> {
        for candidate in user.into_iter().chain(std::iter::once(system)) {
            if candidate.exists() {
                debug!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }
        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.usage_sleep_ms > 0,
            "usage_sleep_ms must be positive (got {})",
            self.usage_sleep_ms
        );
        ensure!(
            self.usage_sleep_ms <= MAX_SLEEP_MS,
            "usage_sleep_ms must be <= {MAX_SLEEP_MS} ms (got {})",
            self.usage_sleep_ms
        );
        ensure!(
            self.update_sleep_ms > 0,
            "update_sleep_ms must be positive (got {})",
            self.update_sleep_ms
        );
        ensure!(
            self.update_sleep_ms <= MAX_SLEEP_MS,
            "update_sleep_ms must be <= {MAX_SLEEP_MS} ms (got {})",
            self.update_sleep_ms
        );
        ensure!(
            !self.client_id.is_empty() && self.client_id.bytes().all(|b| b.is_ascii_digit()),
            "client_id must be a decimal application id (got {:?})",
            self.client_id
        );
        Ok(())
    }
}
