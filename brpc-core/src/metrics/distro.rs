//! Определение дистрибутива по `/etc/lsb-release` или `/etc/os-release`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Имя, которое возвращается, если ни один release-файл не найден.
pub const FALLBACK_DISTRO: &str = "Linux";

static LSB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^DISTRIB_ID="?([a-zA-Z0-9 ]+)"?"#).expect("valid DISTRIB_ID regex"));

static OS_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^NAME="?([a-zA-Z0-9 ]+)"?"#).expect("valid NAME regex"));

/// Читает метаданные дистрибутива один раз при старте демона.
#[derive(Debug, Clone)]
pub struct DistroIdentifier {
    pub lsb_release: PathBuf,
    pub os_release: PathBuf,
}

impl DistroIdentifier {
    pub fn new(lsb_release: impl Into<PathBuf>, os_release: impl Into<PathBuf>) -> Self {
        Self {
            lsb_release: lsb_release.into(),
            os_release: os_release.into(),
        }
    }

    /// Человекочитаемое имя дистрибутива.
    ///
    /// Приоритет у `lsb-release` (`DISTRIB_ID=...`), затем `os-release`
    /// (`NAME=...`, ключ с начала строки). Если нет ни одного файла,
    /// возвращается `"Linux"`. Если файл есть, но строки с ключом нет,
    /// возвращается пустая строка.
    pub fn identify(&self) -> String {
        let (path, regex) = if self.lsb_release.exists() {
            (&self.lsb_release, &*LSB_ID)
        } else if self.os_release.exists() {
            (&self.os_release, &*OS_NAME)
        } else {
            warn!(
                "Neither {} nor {} was found, reporting distro as {}",
                self.lsb_release.display(),
                self.os_release.display(),
                FALLBACK_DISTRO
            );
            return FALLBACK_DISTRO.to_string();
        };

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Не удалось прочитать {}: {}", path.display(), e);
                return String::new();
            }
        };

        let name = contents
            .lines()
            .find_map(|line| regex.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        debug!(path = %path.display(), distro = %name, "Identified distribution");
        name
    }
}

impl Default for DistroIdentifier {
    fn default() -> Self {
        Self::new("/etc/lsb-release", "/etc/os-release")
    }
}
