//! Аргументы командной строки и их наложение на конфиг.

use anyhow::{Context, Result};
use brpc_core::config::Config;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "brpc",
    version,
    about = "Better-RPC++: CPU, RAM, active window and distro as Discord rich presence"
)]
pub struct Args {
    /// Остановить запущенный экземпляр и выйти
    #[arg(short, long)]
    pub kill: bool,

    /// Не ждать запуска Discord/Vesktop
    #[arg(short = 'f', long)]
    pub ignore_discord: bool,

    /// Подробный лог
    #[arg(long)]
    pub debug: bool,

    /// Пауза между замерами CPU/RAM, мс
    #[arg(long, value_name = "MS")]
    pub usage_sleep: Option<u64>,

    /// Пауза между обновлениями статуса, мс
    #[arg(long, value_name = "MS")]
    pub update_sleep: Option<u64>,

    /// Не показывать картинку активного окна
    #[arg(long)]
    pub no_small_image: bool,

    /// Путь к конфигу (по умолчанию ~/.config/brpc/config.yml, затем /etc/brpc/config.yml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Не уходить в фон
    #[arg(long)]
    pub foreground: bool,
}

impl Args {
    /// Загружает конфиг (явный путь или поиск по умолчанию) и накладывает флаги.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::discover()?,
        };
        self.apply_to(&mut config);
        config
            .validate()
            .context("invalid command line overrides")?;
        Ok(config)
    }

    /// Флаги командной строки важнее значений из файла.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ms) = self.usage_sleep {
            config.usage_sleep_ms = ms;
        }
        if let Some(ms) = self.update_sleep {
            config.update_sleep_ms = ms;
        }
        config.ignore_discord_check |= self.ignore_discord;
        config.no_small_image |= self.no_small_image;
        config.debug |= self.debug;
    }
}
