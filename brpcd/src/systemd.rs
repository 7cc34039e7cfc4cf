//! Модуль для интеграции с systemd через sd-notify.
//!
//! Предоставляет функции для отправки уведомлений systemd о состоянии демона:
//! - READY=1 - когда циклы опроса запущены
//! - STATUS=... - строка статуса (последняя запись CPU/RAM)
//! - STOPPING=1 - при завершении
//!
//! Вне systemd (нет `NOTIFY_SOCKET`) уведомления просто никуда не уходят.
//!
//! # Примеры использования
//!
//! ```no_run
//! use brpcd::systemd;
//!
//! if let Err(e) = systemd::notify_ready() {
//!     eprintln!("Failed to notify systemd: {}", e);
//! }
//! systemd::notify_status("CPU: 12% | RAM: 40%");
//! ```

use anyhow::{Context, Result};
use libsystemd::daemon::NotifyState;

/// Максимальная длина статуса для `systemctl status`.
const MAX_STATUS_LEN: usize = 200;

/// Отправляет systemd уведомление READY=1.
///
/// Ошибку можно безопасно игнорировать, если демон не запущен под systemd.
pub fn notify_ready() -> Result<()> {
    libsystemd::daemon::notify(false, &[NotifyState::Ready])
        .context("Failed to send READY notification to systemd")?;
    Ok(())
}

/// Отправляет systemd уведомление STATUS=... Ошибки игнорируются.
pub fn notify_status(status: &str) {
    let state = NotifyState::Status(truncate_status(status).to_string());
    let _ = libsystemd::daemon::notify(false, &[state]);
}

/// Отправляет systemd уведомление STOPPING=1. Ошибки игнорируются.
pub fn notify_stopping() {
    let _ = libsystemd::daemon::notify(false, &[NotifyState::Stopping]);
}

/// Обрезает статус до [`MAX_STATUS_LEN`] байт по границе символа.
fn truncate_status(status: &str) -> &str {
    if status.len() <= MAX_STATUS_LEN {
        return status;
    }
    let mut end = MAX_STATUS_LEN;
    while !status.is_char_boundary(end) {
        end -= 1;
    }
    &status[..end]
}
