//! Сопоставление имён окон и дистрибутивов с ключами картинок.
//!
//! Таблицы алиасов компилируются один раз при старте в [`AssetRules`] и дальше
//! только читаются. Порядок правил в таблице важен: побеждает первое
//! совпавшее правило, специфичность не учитывается.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ключ картинки для окна, которое не удалось опознать.
pub const GENERIC_WINDOW_IMAGE: &str = "file";

/// Ключ картинки для дистрибутива, который не удалось опознать.
pub const GENERIC_DISTRO_IMAGE: &str = "tux";

/// Подпись продукта в тексте большой картинки.
pub const PRODUCT_NAME: &str = "Better-RPC++";

/// Приложения, для которых есть собственная картинка под тем же именем.
pub const KNOWN_APPS: &[&str] = &[
    "blender", "chrome", "chromium", "discord", "dolphin", "firefox", "gimp", "hl2_linux", "hoi4",
    "konsole", "lutris", "st", "steam", "surf", "vscode", "worldbox", "xterm",
];

/// Алиасы приложений. Сопоставляются с именем класса в нижнем регистре.
pub const APP_ALIASES: &[(&str, &str)] = &[
    ("vscodium", "vscode"),
    ("code", "vscode"),
    ("code - [a-z]+", "vscode"),
    ("stardew valley", "stardewvalley"),
    ("minecraft [a-z0-9.]+", "minecraft"),
    (r"lunar client [a-z0-9\(\)\.\-/]+", "minecraft"),
    ("telegram(desktop)?", "telegram"),
    (r"terraria\.bin\.x86_64", "terraria"),
    ("u?xterm", "xterm"),
    ("vivaldi(-stable)?", "vivaldi"),
];

/// Алиасы дистрибутивов в словаре `DISTRIB_ID` из lsb-release.
pub const DISTRO_LSB_ALIASES: &[(&str, &str)] = &[
    ("Arch|Artix", "archlinux"),
    ("LinuxMint", "lmint"),
    ("Gentoo", "gentoo"),
    ("Ubuntu", "ubuntu"),
    ("ManjaroLinux", "manjaro"),
];

/// Алиасы дистрибутивов в словаре `NAME` из os-release.
pub const DISTRO_OS_ALIASES: &[(&str, &str)] = &[
    ("Arch Linux", "archlinux"),
    ("Linux Mint", "lmint"),
    ("Gentoo", "gentoo"),
    ("Ubuntu", "ubuntu"),
    ("Manjaro Linux", "manjaro"),
];

/// Картинка + подпись для окна или дистрибутива.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub image_key: String,
    pub display_text: String,
}

/// Маленькая картинка: активное окно.
pub type WindowAsset = Asset;

/// Большая картинка: дистрибутив.
pub type DistroAsset = Asset;

/// Одно правило алиаса. Паттерн должен совпасть со строкой целиком.
#[derive(Debug, Clone)]
pub struct AliasRule {
    pattern: Regex,
    canonical_key: String,
}

impl AliasRule {
    pub fn canonical_key(&self) -> &str {
        &self.canonical_key
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

/// Упорядоченный набор правил алиасов.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    rules: Vec<AliasRule>,
}

impl AliasTable {
    /// Компилирует таблицу `(паттерн, ключ)` в порядке объявления.
    pub fn compile(entries: &[(&str, &str)], case_insensitive: bool) -> Result<Self> {
        let rules = entries
            .iter()
            .map(|(pattern, key)| {
                let anchored = format!("^(?:{pattern})$");
                let regex = RegexBuilder::new(&anchored)
                    .case_insensitive(case_insensitive)
                    .build()
                    .with_context(|| format!("Некорректный паттерн алиаса '{pattern}' для '{key}'"))?;
                Ok(AliasRule {
                    pattern: regex,
                    canonical_key: (*key).to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Ключ первого правила, совпавшего со строкой целиком.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(name))
            .map(AliasRule::canonical_key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Скомпилированные правила для [`AssetResolver`].
#[derive(Debug, Clone, Default)]
pub struct AssetRules {
    pub known_apps: HashSet<String>,
    pub app_aliases: AliasTable,
    pub distro_lsb_aliases: AliasTable,
    pub distro_os_aliases: AliasTable,
}

impl AssetRules {
    /// Встроенные таблицы. Алиасы приложений чувствительны к регистру
    /// (имя окна приводится к нижнему регистру заранее), алиасы
    /// дистрибутивов нет.
    pub fn builtin() -> Result<Self> {
        Self::compile(KNOWN_APPS, APP_ALIASES, DISTRO_LSB_ALIASES, DISTRO_OS_ALIASES)
    }

    pub fn compile(
        known_apps: &[&str],
        app_aliases: &[(&str, &str)],
        distro_lsb_aliases: &[(&str, &str)],
        distro_os_aliases: &[(&str, &str)],
    ) -> Result<Self> {
        Ok(Self {
            known_apps: known_apps.iter().map(|app| app.to_lowercase()).collect(),
            app_aliases: AliasTable::compile(app_aliases, false)
                .context("Не удалось скомпилировать алиасы приложений")?,
            distro_lsb_aliases: AliasTable::compile(distro_lsb_aliases, true)
                .context("Не удалось скомпилировать lsb-алиасы дистрибутивов")?,
            distro_os_aliases: AliasTable::compile(distro_os_aliases, true)
                .context("Не удалось скомпилировать os-release алиасы дистрибутивов")?,
        })
    }
}

/// Превращает сырые имена в стабильные ключи картинок.
///
/// Не хранит изменяемого состояния: одинаковый вход всегда даёт одинаковый
/// результат.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    rules: AssetRules,
    version: String,
}

impl AssetResolver {
    pub fn new(rules: AssetRules) -> Self {
        Self {
            rules,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Версия в подписи дистрибутива (для тестов и сборок с другим номером).
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn rules(&self) -> &AssetRules {
        &self.rules
    }

    /// Картинка для класса активного окна.
    ///
    /// Пустое имя даёт пустой ассет. Подпись всегда равна исходному имени,
    /// ключ ищется без учёта регистра: известное приложение, затем первый
    /// совпавший алиас, иначе `"file"`.
    pub fn resolve_window(&self, raw_name: &str) -> WindowAsset {
        if raw_name.is_empty() {
            return WindowAsset::default();
        }

        let name = raw_name.to_lowercase();
        let image_key = if self.rules.known_apps.contains(&name) {
            name
        } else {
            self.rules
                .app_aliases
                .resolve(&name)
                .unwrap_or(GENERIC_WINDOW_IMAGE)
                .to_string()
        };

        WindowAsset {
            image_key,
            display_text: raw_name.to_string(),
        }
    }

    /// Картинка для дистрибутива.
    ///
    /// Сначала lsb-алиасы, и только если ни один не совпал, os-release алиасы:
    /// у двух файлов разные названия для одних и тех же дистрибутивов.
    pub fn resolve_distro(&self, raw_name: &str) -> DistroAsset {
        let image_key = self
            .rules
            .distro_lsb_aliases
            .resolve(raw_name)
            .or_else(|| self.rules.distro_os_aliases.resolve(raw_name))
            .unwrap_or(GENERIC_DISTRO_IMAGE)
            .to_string();

        DistroAsset {
            image_key,
            display_text: format!("{} / {} {}", raw_name, PRODUCT_NAME, self.version),
        }
    }
}
