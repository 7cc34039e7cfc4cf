//! PID-файл: не даёт запустить второй экземпляр и позволяет `brpc -k`
//! найти работающий демон.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PID_FILE: &str = "/tmp/brpc.pid";

/// PID из файла. `None`, если файла нет или в нём не число.
pub fn read_pid(path: &Path) -> Result<Option<Pid>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read PID file {}", path.display()))
        }
    };
    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(Pid::from_raw(pid))),
        _ => {
            warn!(path = %path.display(), "PID file contains garbage: {:?}", contents.trim());
            Ok(None)
        }
    }
}

/// Жив ли процесс (проба сигналом 0). `EPERM` значит, что процесс есть, но чужой.
pub fn is_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Владение PID-файлом. Файл удаляется при `release` или drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    released: bool,
}

impl PidFile {
    /// Записывает PID текущего процесса.
    ///
    /// Если в файле записан живой процесс, возвращает ошибку; устаревший файл
    /// перезаписывается.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let own = Pid::this();
        if let Some(pid) = read_pid(&path)? {
            if pid != own && is_alive(pid) {
                bail!(
                    "An instance of brpc is already running (PID {}). Use `brpc -k` to kill it before starting a new one.",
                    pid
                );
            }
            debug!(pid = pid.as_raw(), "Removing stale PID file");
        }

        fs::write(&path, format!("{}\n", own))
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        debug!(path = %path.display(), pid = own.as_raw(), "PID file written");
        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "PID file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Не удалось удалить PID-файл {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Что сделал `brpc -k`.
#[derive(Debug, PartialEq, Eq)]
pub enum KillOutcome {
    Killed(Pid),
    NotRunning,
}

/// Отправляет SIGTERM процессу из PID-файла и удаляет файл.
pub fn kill_running(path: &Path) -> Result<KillOutcome> {
    let Some(pid) = read_pid(path)? else {
        return Ok(KillOutcome::NotRunning);
    };
    if !is_alive(pid) {
        let _ = fs::remove_file(path);
        return Ok(KillOutcome::NotRunning);
    }

    kill(pid, Signal::SIGTERM)
        .with_context(|| format!("Failed to kill process (PID: {})", pid))?;
    let _ = fs::remove_file(path);
    Ok(KillOutcome::Killed(pid))
}
