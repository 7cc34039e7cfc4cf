//! Бекенд WindowIntrospector для композиторов с текстовым IPC через Unix-сокет (Hyprland).
//!
//! Путь к сокету: `$XDG_RUNTIME_DIR/hypr/$HYPRLAND_INSTANCE_SIGNATURE/.socket2.sock`.
//! Запрос `activewindow`, в ответе ищется `activewindow>>CLASS,TITLE`.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::metrics::windows::WindowIntrospector;

pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";
pub const INSTANCE_SIGNATURE_ENV: &str = "HYPRLAND_INSTANCE_SIGNATURE";

const ACTIVE_WINDOW_COMMAND: &[u8] = b"activewindow";
const ACTIVE_WINDOW_MARKER: &str = "activewindow>>";
const RESPONSE_BUFFER_SIZE: usize = 8192;

/// Таймаут на запись и чтение сокета, чтобы зависший композитор не
/// останавливал presence-цикл.
pub const DEFAULT_IPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Путь к сокету по значениям двух переменных окружения.
pub fn socket_path_from(runtime_dir: Option<OsString>, signature: Option<OsString>) -> Option<PathBuf> {
    let runtime_dir = runtime_dir.filter(|v| !v.is_empty())?;
    let signature = signature.filter(|v| !v.is_empty())?;
    Some(
        PathBuf::from(runtime_dir)
            .join("hypr")
            .join(signature)
            .join(".socket2.sock"),
    )
}

/// Достаёт класс окна между маркером `activewindow>>` и следующей запятой.
pub fn parse_active_window(response: &str) -> Option<String> {
    let start = response.find(ACTIVE_WINDOW_MARKER)? + ACTIVE_WINDOW_MARKER.len();
    let rest = &response[start..];
    let end = rest.find(',')?;
    Some(rest[..end].to_string())
}

/// Клиент IPC-сокета композитора.
#[derive(Debug, Clone)]
pub struct HyprlandIntrospector {
    socket_path: PathBuf,
    timeout: Duration,
}

impl HyprlandIntrospector {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_IPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Интроспектор из окружения, если обе переменные заданы и сокет существует.
    pub fn from_env() -> Option<Self> {
        let path = socket_path_from(
            std::env::var_os(RUNTIME_DIR_ENV),
            std::env::var_os(INSTANCE_SIGNATURE_ENV),
        )?;
        if !path.exists() {
            debug!(path = %path.display(), "Compositor IPC socket not found");
            return None;
        }
        Some(Self::new(path))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Отправляет `activewindow` и возвращает сырой ответ.
    pub fn query(&self) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "Не удалось подключиться к IPC-сокету композитора {}",
                self.socket_path.display()
            )
        })?;
        stream
            .set_read_timeout(Some(self.timeout))
            .context("Не удалось установить таймаут чтения IPC-сокета")?;
        stream
            .set_write_timeout(Some(self.timeout))
            .context("Не удалось установить таймаут записи IPC-сокета")?;

        stream
            .write_all(ACTIVE_WINDOW_COMMAND)
            .context("Не удалось отправить команду в IPC-сокет композитора")?;

        let mut buffer = vec![0u8; RESPONSE_BUFFER_SIZE];
        let read = stream
            .read(&mut buffer)
            .context("Не удалось прочитать ответ IPC-сокета композитора")?;
        if read == 0 {
            bail!("IPC-сокет композитора закрыл соединение без ответа");
        }

        let response = String::from_utf8_lossy(&buffer[..read]).into_owned();
        debug!(%response, "Compositor IPC raw response");
        Ok(response)
    }
}

impl WindowIntrospector for HyprlandIntrospector {
    fn active_window_class(&self) -> Result<Option<String>> {
        let response = self.query()?;
        let class = parse_active_window(&response);
        if class.is_none() {
            debug!("No active window found in compositor response");
        }
        Ok(class)
    }

    fn window_manager_name(&self) -> Result<Option<String>> {
        Ok(Some("Hyprland".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    fn serve_once(dir: &TempDir, reply: &'static [u8]) -> (PathBuf, thread::JoinHandle<Vec<u8>>) {
        let path = dir.path().join(".socket2.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = vec![0u8; 64];
            let n = stream.read(&mut request).expect("read request");
            request.truncate(n);
            stream.write_all(reply).expect("write reply");
            request
        });
        (path, handle)
    }

    #[test]
    fn socket_path_requires_both_variables() {
        assert_eq!(
            socket_path_from(Some("/run/user/1000".into()), Some("abc_123".into())),
            Some(PathBuf::from("/run/user/1000/hypr/abc_123/.socket2.sock"))
        );
        assert_eq!(socket_path_from(None, Some("abc".into())), None);
        assert_eq!(socket_path_from(Some("/run/user/1000".into()), None), None);
        assert_eq!(socket_path_from(Some("".into()), Some("abc".into())), None);
    }

    #[test]
    fn parses_class_between_marker_and_comma() {
        assert_eq!(
            parse_active_window("workspace>>2\nactivewindow>>kitty,~/src\n"),
            Some("kitty".to_string())
        );
        assert_eq!(parse_active_window("activewindow>>,\n"), Some(String::new()));
    }

    #[test]
    fn malformed_response_yields_none() {
        assert_eq!(parse_active_window("workspace>>2\n"), None);
        assert_eq!(parse_active_window("activewindow>>kitty"), None);
        assert_eq!(parse_active_window(""), None);
    }

    #[test]
    fn queries_socket_and_parses_reply() {
        let dir = TempDir::new().expect("tempdir");
        let (path, server) = serve_once(&dir, b"activewindow>>firefox,Mozilla Firefox\n");

        let introspector = HyprlandIntrospector::new(&path);
        assert_eq!(
            introspector.active_window_class().expect("query"),
            Some("firefox".to_string())
        );
        assert_eq!(server.join().expect("server"), ACTIVE_WINDOW_COMMAND.to_vec());
    }

    #[test]
    fn unreachable_socket_is_an_error() {
        let introspector = HyprlandIntrospector::new("/nonexistent/hypr/sig/.socket2.sock");
        assert!(introspector.active_window_class().is_err());
    }

    #[test]
    fn empty_reply_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let (path, server) = serve_once(&dir, b"");

        let result = HyprlandIntrospector::new(&path).query();
        server.join().expect("server");
        assert!(result.is_err());
    }

    #[test]
    fn silent_compositor_times_out() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".socket2.sock");
        let listener = UnixListener::bind(&path).expect("bind");
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let introspector = HyprlandIntrospector::new(&path).with_timeout(Duration::from_millis(100));
        assert!(introspector.query().is_err());
        server.join().expect("server");
    }
}
