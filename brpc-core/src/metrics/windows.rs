//! Определение активного окна и оконного менеджера.
//!
//! Две взаимоисключающие стратегии: IPC-сокет композитора (Hyprland) и
//! свойства корневого окна X11. Стратегия выбирается заново на каждом вызове
//! по окружению, наружу всегда отдаётся строка (пустая, если окна нет или
//! запрос не удался).

pub use crate::metrics::windows_hyprland::HyprlandIntrospector;
pub use crate::metrics::windows_x11::X11Introspector;

use anyhow::{bail, Result};
use std::fmt;
use tracing::{debug, warn};

/// Имя оконного менеджера, если его не удалось определить.
pub const UNKNOWN_WINDOW_MANAGER: &str = "Unknown";

/// Общий интерфейс для бекендов, которые умеют назвать активное окно.
pub trait WindowIntrospector: Send + Sync {
    /// Класс окна в фокусе, `None` если фокуса нет.
    fn active_window_class(&self) -> Result<Option<String>>;

    /// Имя оконного менеджера/композитора, если бекенд его знает.
    fn window_manager_name(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// То, что нужно циклам опроса: имена без ошибок.
pub trait ActiveWindowProbe: Send + Sync {
    /// Класс окна в фокусе или пустая строка.
    fn probe_active_window(&self) -> String;

    fn window_manager_name(&self) -> String;
}

/// Стратегия, выбранная для текущего вызова.
pub enum ProbeStrategy<'a> {
    Compositor(HyprlandIntrospector),
    Property(&'a X11Introspector),
}

impl ProbeStrategy<'_> {
    fn introspector(&self) -> &dyn WindowIntrospector {
        match self {
            ProbeStrategy::Compositor(hyprland) => hyprland,
            ProbeStrategy::Property(x11) => *x11,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ProbeStrategy::Compositor(_) => "compositor-socket",
            ProbeStrategy::Property(_) => "x11-property",
        }
    }
}

type CompositorLocator = Box<dyn Fn() -> Option<HyprlandIntrospector> + Send + Sync>;

/// Точка входа для presence-цикла: "какое окно сейчас в фокусе".
pub struct WindowManagerProbe {
    x11: Option<X11Introspector>,
    locate_compositor: CompositorLocator,
}

impl fmt::Debug for WindowManagerProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowManagerProbe")
            .field("x11", &self.x11.is_some())
            .finish_non_exhaustive()
    }
}

impl WindowManagerProbe {
    /// Пробует оба бекенда.
    ///
    /// Ошибка возвращается только если недоступны и сокет композитора, и
    /// X-сервер: без них демону нечего опрашивать.
    pub fn connect() -> Result<Self> {
        let x11 = match X11Introspector::new() {
            Ok(x11) => Some(x11),
            Err(e) => {
                debug!("X11 backend unavailable: {:#}", e);
                None
            }
        };
        let probe = Self::new(x11);

        if probe.x11.is_none() && (probe.locate_compositor)().is_none() {
            bail!(
                "Can't open display: ни X-сервер (DISPLAY), ни IPC-сокет композитора \
                 ($XDG_RUNTIME_DIR/hypr/$HYPRLAND_INSTANCE_SIGNATURE) недоступны"
            );
        }
        Ok(probe)
    }

    /// Зонд с заданным X11-бекендом; композитор ищется в окружении.
    pub fn new(x11: Option<X11Introspector>) -> Self {
        Self {
            x11,
            locate_compositor: Box::new(HyprlandIntrospector::from_env),
        }
    }

    /// Подменяет поиск сокета композитора (для тестов и нестандартных путей).
    pub fn with_compositor_locator<F>(mut self, locate: F) -> Self
    where
        F: Fn() -> Option<HyprlandIntrospector> + Send + Sync + 'static,
    {
        self.locate_compositor = Box::new(locate);
        self
    }

    /// Выбирает стратегию для текущего вызова: сокет композитора, если он
    /// найден, иначе X11.
    pub fn strategy(&self) -> Option<ProbeStrategy<'_>> {
        if let Some(hyprland) = (self.locate_compositor)() {
            return Some(ProbeStrategy::Compositor(hyprland));
        }
        self.x11.as_ref().map(ProbeStrategy::Property)
    }

    /// Класс активного окна или пустая строка. Никогда не возвращает ошибку.
    pub fn probe_active_window(&self) -> String {
        match self.strategy() {
            Some(strategy) => {
                let name = probe_with(strategy.introspector());
                debug!(strategy = strategy.name(), window = %name, "Probed active window");
                name
            }
            None => {
                debug!("No window backend available for this tick");
                String::new()
            }
        }
    }

    /// Имя оконного менеджера: бекенд, затем `XDG_CURRENT_DESKTOP`, затем `"Unknown"`.
    pub fn window_manager_name(&self) -> String {
        let from_backend = self.strategy().and_then(|strategy| {
            match strategy.introspector().window_manager_name() {
                Ok(name) => name,
                Err(e) => {
                    warn!("Не удалось определить оконный менеджер: {:#}", e);
                    None
                }
            }
        });

        from_backend
            .or_else(|| std::env::var("XDG_CURRENT_DESKTOP").ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_WINDOW_MANAGER.to_string())
    }
}

impl ActiveWindowProbe for WindowManagerProbe {
    fn probe_active_window(&self) -> String {
        WindowManagerProbe::probe_active_window(self)
    }

    fn window_manager_name(&self) -> String {
        WindowManagerProbe::window_manager_name(self)
    }
}

/// Опрашивает бекенд, сводя ошибки и отсутствие окна к пустой строке.
pub fn probe_with(introspector: &dyn WindowIntrospector) -> String {
    match introspector.active_window_class() {
        Ok(Some(class)) => class,
        Ok(None) => String::new(),
        Err(e) => {
            warn!("Не удалось получить активное окно: {:#}", e);
            String::new()
        }
    }
}

/// Бекенд с заранее заданным ответом (для тестов).
#[derive(Debug, Clone, Default)]
pub struct StaticWindowIntrospector {
    active: Option<String>,
    window_manager: Option<String>,
}

impl StaticWindowIntrospector {
    pub fn new(active: Option<&str>, window_manager: Option<&str>) -> Self {
        Self {
            active: active.map(str::to_string),
            window_manager: window_manager.map(str::to_string),
        }
    }
}

impl WindowIntrospector for StaticWindowIntrospector {
    fn active_window_class(&self) -> Result<Option<String>> {
        Ok(self.active.clone())
    }

    fn window_manager_name(&self) -> Result<Option<String>> {
        Ok(self.window_manager.clone())
    }
}

impl ActiveWindowProbe for StaticWindowIntrospector {
    fn probe_active_window(&self) -> String {
        probe_with(self)
    }

    fn window_manager_name(&self) -> String {
        self.window_manager
            .clone()
            .unwrap_or_else(|| UNKNOWN_WINDOW_MANAGER.to_string())
    }
}
