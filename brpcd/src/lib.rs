//! Обвязка демона brpc: командная строка, PID-файл, уход в фон и systemd.
//!
//! Вся логика опроса живёт в `brpc-core`, здесь только запуск процесса.

pub mod cli;
pub mod daemonize;
pub mod pidfile;
pub mod systemd;
