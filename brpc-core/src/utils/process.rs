//! Поиск процессов по командной строке.
//!
//! Используется при старте демона, чтобы дождаться клиента Discord
//! (или Vesktop), которому отправляется статус.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use tokio::sync::watch;
use tracing::{debug, info};

/// Процессы, которые принимают статус через IPC.
pub const PRESENCE_CLIENTS: &[&str] = &["discord", "vesktop"];

/// Шаблон поиска по имени: совпадение в любом месте командной строки, без учёта регистра.
pub fn name_pattern(name: &str) -> Result<Regex> {
    RegexBuilder::new(name)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Некорректный шаблон имени процесса '{name}'"))
}

/// Совпадает ли командная строка (аргументы через NUL) с шаблоном.
///
/// Аргументы склеиваются через пробел, как в `ps -o args`.
pub fn cmdline_matches(args: &[String], pattern: &Regex) -> bool {
    !args.is_empty() && pattern.is_match(&args.join(" "))
}

/// Есть ли в `/proc` процесс с подходящей командной строкой.
pub fn process_running(pattern: &Regex) -> bool {
    process_running_in(Path::new("/proc"), pattern)
}

/// То же, что [`process_running`], но с произвольным корнем procfs.
///
/// Процессы, которые завершились во время обхода или недоступны по правам,
/// пропускаются.
pub fn process_running_in(proc_root: &Path, pattern: &Regex) -> bool {
    let processes = match procfs::process::all_processes_with_root(proc_root) {
        Ok(processes) => processes,
        Err(e) => {
            debug!(root = %proc_root.display(), error = %e, "Failed to enumerate processes");
            return false;
        }
    };

    for process in processes.flatten() {
        let Ok(args) = process.cmdline() else {
            continue;
        };
        if cmdline_matches(&args, pattern) {
            debug!(pid = process.pid, cmdline = %args.join(" "), "Found process");
            return true;
        }
    }
    false
}

/// Ждёт, пока не появится любой из процессов `names`.
///
/// Проверяет раз в `poll`, после `hint_after` ожидания пишет подсказку в лог.
/// Возвращает `Ok(false)`, если пришёл сигнал завершения.
pub async fn wait_for_any_process(
    names: &[&str],
    poll: Duration,
    hint_after: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let patterns = names
        .iter()
        .map(|name| name_pattern(name))
        .collect::<Result<Vec<_>>>()?;
    let mut waited = Duration::ZERO;

    loop {
        if patterns.iter().any(process_running) {
            return Ok(true);
        }
        if waited > hint_after {
            info!(
                "None of {:?} is running. Maybe skip this check with --ignore-discord or -f?",
                names
            );
        }
        info!("Waiting for {}...", names.join(" or "));

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(false);
                }
            }
        }
        waited += poll;
    }
}
