//! Отправка статуса наружу.
//!
//! Ядро знает только трейт [`PresenceReporter`]: главный цикл передаёт в
//! `update` последнюю собранную запись и раз в тик вызывает `run_callbacks`,
//! чтобы клиент разобрал накопившиеся ответы.
//!
//! # Компоненты
//!
//! - **discord**: Локальный IPC-протокол Discord ([`DiscordIpcReporter`])
//! - [`LogReporter`]: Пишет записи в лог, для отладки и тестов

pub mod discord;

pub use discord::DiscordIpcReporter;

use std::io;
use thiserror::Error;
use tracing::{debug, info};

use crate::state::PresenceRecord;

/// Ошибки клиента статуса. Все они временные: следующий `update` пробует снова.
#[derive(Debug, Error)]
pub enum ReporterError {
    /// Ни один сокет `discord-ipc-N` не принял подключение
    #[error("Discord IPC socket not found (checked {checked} paths)")]
    SocketNotFound { checked: usize },

    #[error("Discord IPC I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Discord IPC payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Некорректный кадр (неизвестный opcode, слишком длинное тело)
    #[error("Discord IPC protocol error: {0}")]
    Protocol(String),

    /// Discord закрыл соединение (opcode CLOSE или EOF)
    #[error("Discord closed the IPC connection: {0}")]
    Closed(String),
}

/// Внешний клиент, которому отдаётся статус.
pub trait PresenceReporter: Send {
    /// Отправляет новую запись. Не ждёт ответа.
    fn update(&mut self, record: &PresenceRecord) -> Result<(), ReporterError>;

    /// Разбирает пришедшие ответы без блокировки.
    fn run_callbacks(&mut self) -> Result<(), ReporterError>;

    /// Закрывает сессию. Вызывается один раз при завершении.
    fn close(&mut self);
}

/// Reporter, который только пишет записи в лог и запоминает их.
#[derive(Debug, Default)]
pub struct LogReporter {
    history: Vec<PresenceRecord>,
    callbacks_run: u64,
    closed: bool,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Все записи, переданные в `update`, в порядке поступления.
    pub fn history(&self) -> &[PresenceRecord] {
        &self.history
    }

    pub fn callbacks_run(&self) -> u64 {
        self.callbacks_run
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PresenceReporter for LogReporter {
    fn update(&mut self, record: &PresenceRecord) -> Result<(), ReporterError> {
        info!(
            details = %record.details,
            state = %record.state,
            small_image = %record.small_asset.image_key,
            large_image = %record.large_asset.image_key,
            start = record.start_timestamp,
            "Presence update"
        );
        self.history.push(record.clone());
        Ok(())
    }

    fn run_callbacks(&mut self) -> Result<(), ReporterError> {
        self.callbacks_run += 1;
        Ok(())
    }

    fn close(&mut self) {
        debug!(updates = self.history.len(), "LogReporter closed");
        self.closed = true;
    }
}

/// Чтобы `Box<dyn PresenceReporter>` можно было передать туда, где ждут обобщённый reporter.
impl<R: PresenceReporter + ?Sized> PresenceReporter for Box<R> {
    fn update(&mut self, record: &PresenceRecord) -> Result<(), ReporterError> {
        (**self).update(record)
    }

    fn run_callbacks(&mut self) -> Result<(), ReporterError> {
        (**self).run_callbacks()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
