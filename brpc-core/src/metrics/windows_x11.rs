//! X11-бекенд для WindowIntrospector через EWMH (Extended Window Manager Hints).
//!
//! Использует x11rb для подключения к X-серверу. Активное окно берётся из
//! `_NET_ACTIVE_WINDOW` корневого окна, его класс из `WM_CLASS`, имя
//! оконного менеджера из цепочки `_NET_SUPPORTING_WM_CHECK` -> `_NET_WM_NAME`.

use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{Atom, AtomEnum, ConnectionExt, Window};
use x11rb::rust_connection::RustConnection;

use crate::metrics::windows::WindowIntrospector;

/// X11-интроспектор активного окна.
pub struct X11Introspector {
    connection: RustConnection,
    root: Window,
    // Кэшируем атомы, чтобы не делать intern_atom на каждом тике
    net_active_window: Atom,
    net_supporting_wm_check: Atom,
    net_wm_name: Atom,
    utf8_string: Atom,
}

impl X11Introspector {
    /// Подключается к X-серверу из `DISPLAY`.
    ///
    /// Возвращает ошибку, если X-сервер недоступен.
    pub fn new() -> Result<Self> {
        let (connection, screen_num) = x11rb::connect(None).with_context(|| {
            "Не удалось подключиться к X-серверу: проверьте, что X-сервер запущен и переменная DISPLAY установлена"
        })?;

        let root = connection.setup().roots[screen_num].root;

        let net_active_window = Self::intern_atom(&connection, b"_NET_ACTIVE_WINDOW")?;
        let net_supporting_wm_check = Self::intern_atom(&connection, b"_NET_SUPPORTING_WM_CHECK")?;
        let net_wm_name = Self::intern_atom(&connection, b"_NET_WM_NAME")?;
        let utf8_string = Self::intern_atom(&connection, b"UTF8_STRING")?;

        tracing::debug!(
            protocol_major = connection.setup().protocol_major_version,
            "Connected to X server"
        );

        Ok(Self {
            connection,
            root,
            net_active_window,
            net_supporting_wm_check,
            net_wm_name,
            utf8_string,
        })
    }

    fn intern_atom(connection: &RustConnection, name: &[u8]) -> Result<Atom> {
        let atom_name = String::from_utf8_lossy(name);
        let reply = connection
            .intern_atom(false, name)
            .with_context(|| format!("Не удалось зарегистрировать X11 атом '{}'", atom_name))?
            .reply()
            .with_context(|| {
                format!("Не удалось получить ответ от X-сервера для атома '{}'", atom_name)
            })?;
        Ok(reply.atom)
    }

    /// Читает свойство-окно (тип WINDOW) с указанного окна.
    fn window_property(&self, window: Window, property: Atom) -> Result<Option<Window>> {
        let reply = self
            .connection
            .get_property(false, window, property, AtomEnum::WINDOW, 0, 1)
            .context("Не удалось запросить свойство окна у X-сервера")?
            .reply()
            .context("Не удалось получить ответ X-сервера на запрос свойства окна")?;

        Ok(reply
            .value32()
            .and_then(|mut values| values.next())
            .filter(|&window| window != x11rb::NONE))
    }

    /// Активное окно через `_NET_ACTIVE_WINDOW`.
    fn active_window(&self) -> Result<Option<Window>> {
        self.window_property(self.root, self.net_active_window)
            .context("Не удалось получить _NET_ACTIVE_WINDOW: проверьте, что оконный менеджер поддерживает EWMH")
    }

    /// Класс окна из `WM_CLASS` (`instance\0class\0`).
    fn window_class(&self, window: Window) -> Result<Option<String>> {
        let reply = self
            .connection
            .get_property(false, window, AtomEnum::WM_CLASS, AtomEnum::STRING, 0, 1024)
            .with_context(|| format!("Не удалось запросить WM_CLASS для окна {:#x}", window))?
            .reply()
            .with_context(|| format!("Не удалось получить WM_CLASS для окна {:#x}", window))?;

        Ok(reply.value8().and_then(|bytes| parse_wm_class(&bytes.collect::<Vec<u8>>())))
    }

    fn utf8_property(&self, window: Window, property: Atom) -> Result<Option<String>> {
        let reply = self
            .connection
            .get_property(false, window, property, self.utf8_string, 0, 1024)
            .context("Не удалось запросить UTF-8 свойство у X-сервера")?
            .reply()
            .context("Не удалось получить UTF-8 свойство от X-сервера")?;

        Ok(reply
            .value8()
            .map(|bytes| String::from_utf8_lossy(&bytes.collect::<Vec<u8>>()).into_owned())
            .filter(|s| !s.is_empty()))
    }
}

impl WindowIntrospector for X11Introspector {
    fn active_window_class(&self) -> Result<Option<String>> {
        match self.active_window()? {
            Some(window) => self.window_class(window),
            None => Ok(None),
        }
    }

    fn window_manager_name(&self) -> Result<Option<String>> {
        let Some(check_window) = self.window_property(self.root, self.net_supporting_wm_check)? else {
            return Ok(None);
        };
        self.utf8_property(check_window, self.net_wm_name)
    }
}

/// Достаёт класс (вторую часть) из значения `WM_CLASS`.
///
/// Если класса нет, используется instance.
pub fn parse_wm_class(raw: &[u8]) -> Option<String> {
    let mut parts = raw
        .split(|&b| b == 0)
        .map(|part| String::from_utf8_lossy(part).into_owned());
    let instance = parts.next().filter(|s| !s.is_empty());
    let class = parts.next().filter(|s| !s.is_empty());
    class.or(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wm_class_prefers_class_over_instance() {
        assert_eq!(parse_wm_class(b"navigator\0firefox\0"), Some("firefox".to_string()));
        assert_eq!(parse_wm_class(b"code\0Code\0"), Some("Code".to_string()));
    }

    #[test]
    fn wm_class_falls_back_to_instance() {
        assert_eq!(parse_wm_class(b"xterm\0"), Some("xterm".to_string()));
        assert_eq!(parse_wm_class(b"xterm"), Some("xterm".to_string()));
    }

    #[test]
    fn empty_wm_class_is_none() {
        assert_eq!(parse_wm_class(b""), None);
        assert_eq!(parse_wm_class(b"\0\0"), None);
    }

    #[test]
    fn test_x11_introspector_creation() {
        // Если X-сервер недоступен (CI), это нормально
        match X11Introspector::new() {
            Ok(introspector) => {
                let _: &dyn WindowIntrospector = &introspector;
                let _ = introspector.active_window_class();
                let _ = introspector.window_manager_name();
            }
            Err(_) => {}
        }
    }
}
