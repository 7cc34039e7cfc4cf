//! Модуль для сбора состояния машины.
//!
//! # Компоненты
//!
//! - **system**: Загрузка CPU и памяти из /proc
//! - **distro**: Имя дистрибутива из lsb-release / os-release
//! - **windows**: Активное окно и оконный менеджер (выбор стратегии)
//! - **windows_hyprland**: IPC-сокет композитора
//! - **windows_x11**: Свойства корневого окна X11 (EWMH)

pub mod distro;
pub mod system;
pub mod windows;
pub mod windows_hyprland;
pub mod windows_x11;
