//! Уход в фон: fork, новая сессия, stdio в `/dev/null`.
//!
//! Вызывается до создания tokio runtime: после fork в дочернем процессе
//! остаётся только вызывающий поток.

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, fork, setsid, ForkResult};
use std::os::fd::RawFd;

const STDIO_FDS: [RawFd; 3] = [0, 1, 2];

/// Форкается; родитель завершается с кодом 0, ребёнок продолжает работу
/// лидером новой сессии без терминала.
pub fn daemonize() -> Result<()> {
    // SAFETY: runtime и другие потоки ещё не созданы
    match unsafe { fork() }.context("Failed to fork process")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("Failed to create new session")?;
    redirect_stdio("/dev/null")
}

/// Перенаправляет stdin/stdout/stderr в файл (обычно `/dev/null`).
pub fn redirect_stdio(path: &str) -> Result<()> {
    let fd: RawFd = open(path, OFlag::O_RDWR, Mode::empty())
        .with_context(|| format!("Failed to open {}", path))?;
    for target in STDIO_FDS {
        dup2(fd, target).with_context(|| format!("Failed to redirect fd {} to {}", target, path))?;
    }
    if !STDIO_FDS.contains(&fd) {
        close(fd).context("Failed to close temporary descriptor")?;
    }
    Ok(())
}
