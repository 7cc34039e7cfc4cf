//! Клиент локального IPC Discord (rich presence).
//!
//! Discord (и Vesktop) слушают Unix-сокет `discord-ipc-N` в runtime-каталоге
//! пользователя. Кадр: `opcode: u32 LE`, `length: u32 LE`, затем JSON.
//! После подключения отправляется handshake, и только после события `READY`
//! можно слать команды `SET_ACTIVITY`.
//!
//! Клиент не блокирует главный цикл: сокет неблокирующий, ответы разбираются
//! в [`PresenceReporter::run_callbacks`], последняя неотправленная запись
//! хранится до установления соединения.

use serde_json::{json, Map, Value};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PresenceReporter, ReporterError};
use crate::state::PresenceRecord;

pub const OP_HANDSHAKE: u32 = 0;
pub const OP_FRAME: u32 = 1;
pub const OP_CLOSE: u32 = 2;
pub const OP_PING: u32 = 3;
pub const OP_PONG: u32 = 4;

const RPC_VERSION: u32 = 1;
const IPC_SOCKET_COUNT: u32 = 10;
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Пауза между попытками подключения, пока Discord недоступен.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Сколько ждать, пока Discord заберёт кадр из сокета.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Подкаталоги, в которых сокет лежит у flatpak-сборок.
const SANDBOX_SUBDIRS: &[&str] = &[
    "",
    "app/com.discordapp.Discord",
    ".flatpak/dev.vencord.Vesktop/xdg-run",
];

/// Каталоги, где может лежать сокет: `$XDG_RUNTIME_DIR` (или `/run/user/<uid>`),
/// `$TMPDIR`, `/tmp`.
pub fn runtime_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    match std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => dirs.push(PathBuf::from(dir)),
        None => {
            // SAFETY: getuid не принимает аргументов и всегда успешен
            let uid = unsafe { libc::getuid() };
            dirs.push(PathBuf::from(format!("/run/user/{uid}")));
        }
    }
    if let Some(tmp) = std::env::var_os("TMPDIR").filter(|v| !v.is_empty()) {
        dirs.push(PathBuf::from(tmp));
    }
    dirs.push(PathBuf::from("/tmp"));
    dirs.dedup();
    dirs
}

/// Все пути `discord-ipc-0..9` в заданных каталогах, в порядке перебора.
pub fn candidate_socket_paths(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for dir in dirs {
        for subdir in SANDBOX_SUBDIRS {
            let base = if subdir.is_empty() {
                dir.clone()
            } else {
                dir.join(subdir)
            };
            for n in 0..IPC_SOCKET_COUNT {
                paths.push(base.join(format!("discord-ipc-{n}")));
            }
        }
    }
    paths
}

pub fn encode_frame(opcode: u32, payload: &Value) -> Result<Vec<u8>, ReporterError> {
    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ReporterError::Protocol(format!(
            "frame body too large: {} bytes",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Собирает кадры из потока байт, который приходит кусками.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Следующий полный кадр, `None` если данных пока недостаточно.
    pub fn next_frame(&mut self) -> Result<Option<(u32, Value)>, ReporterError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let opcode = u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
        let len = u32::from_le_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ReporterError::Protocol(format!(
                "frame length {len} exceeds {MAX_FRAME_LEN}"
            )));
        }
        if self.buffer.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let body: Vec<u8> = self.buffer.drain(..FRAME_HEADER_LEN + len).skip(FRAME_HEADER_LEN).collect();
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)?
        };
        Ok(Some((opcode, payload)))
    }
}

/// Объект `activity` для `SET_ACTIVITY`. Картинки с пустым ключом не передаются.
pub fn activity_payload(record: &PresenceRecord) -> Value {
    let mut assets = Map::new();
    if !record.large_asset.image_key.is_empty() {
        assets.insert("large_image".into(), json!(record.large_asset.image_key));
        assets.insert("large_text".into(), json!(record.large_asset.display_text));
    }
    if !record.small_asset.image_key.is_empty() {
        assets.insert("small_image".into(), json!(record.small_asset.image_key));
        assets.insert("small_text".into(), json!(record.small_asset.display_text));
    }

    let mut activity = Map::new();
    activity.insert("details".into(), json!(record.details));
    activity.insert("state".into(), json!(record.state));
    activity.insert("timestamps".into(), json!({ "start": record.start_timestamp }));
    if !assets.is_empty() {
        activity.insert("assets".into(), Value::Object(assets));
    }
    activity.insert("type".into(), json!(0));
    Value::Object(activity)
}

pub fn set_activity_command(pid: u32, record: &PresenceRecord, nonce: &str) -> Value {
    json!({
        "cmd": "SET_ACTIVITY",
        "args": {
            "pid": pid,
            "activity": activity_payload(record),
        },
        "nonce": nonce,
    })
}

/// Пишет кадр целиком в блокирующем режиме (с таймаутом) и возвращает сокет
/// в неблокирующий режим для чтения ответов.
///
/// Ошибка означает, что в сокет могла уйти только часть кадра: соединение
/// после этого использовать нельзя.
pub fn write_frame(stream: &mut UnixStream, frame: &[u8]) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.write_all(frame)?;
    stream.set_nonblocking(true)
}

/// Presence-клиент поверх `discord-ipc-N`.
#[derive(Debug)]
pub struct DiscordIpcReporter {
    client_id: String,
    socket_override: Option<PathBuf>,
    stream: Option<UnixStream>,
    ready: bool,
    decoder: FrameDecoder,
    pending: Option<PresenceRecord>,
    /// Последняя запись, принятая текущим соединением.
    last_sent: Option<PresenceRecord>,
    next_connect_attempt: Option<Instant>,
    pid: u32,
}

impl DiscordIpcReporter {
    /// Клиент, который ищет сокет в стандартных каталогах.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            socket_override: None,
            stream: None,
            ready: false,
            decoder: FrameDecoder::new(),
            pending: None,
            last_sent: None,
            next_connect_attempt: None,
            pid: std::process::id(),
        }
    }

    /// Клиент с фиксированным путём к сокету.
    pub fn with_socket_path(client_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut reporter = Self::new(client_id);
        reporter.socket_override = Some(path.into());
        reporter
    }

    /// Соединение установлено и Discord прислал `READY`.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Есть запись, которая ещё не ушла в Discord.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn candidates(&self) -> Vec<PathBuf> {
        match &self.socket_override {
            Some(path) => vec![path.clone()],
            None => candidate_socket_paths(&runtime_dirs()),
        }
    }

    fn connect(&mut self) -> Result<(), ReporterError> {
        let candidates = self.candidates();
        let (path, mut stream) = candidates
            .iter()
            .find_map(|path| UnixStream::connect(path).ok().map(|s| (path, s)))
            .ok_or(ReporterError::SocketNotFound {
                checked: candidates.len(),
            })?;

        let handshake = encode_frame(
            OP_HANDSHAKE,
            &json!({ "v": RPC_VERSION, "client_id": self.client_id }),
        )?;
        write_frame(&mut stream, &handshake)?;

        debug!(path = %path.display(), "Connected to Discord IPC socket, handshake sent");
        self.decoder.clear();
        self.stream = Some(stream);
        self.ready = false;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("Discord IPC connection dropped");
        }
        self.ready = false;
        self.decoder.clear();
        self.last_sent = None;
    }

    fn send(&mut self, opcode: u32, payload: &Value) -> Result<(), ReporterError> {
        let frame = encode_frame(opcode, payload)?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(ReporterError::Closed("not connected".to_string()));
        };
        if let Err(e) = write_frame(stream, &frame) {
            self.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Подключается (с паузой между попытками) и отправляет отложенную запись,
    /// если соединение уже готово.
    fn flush(&mut self) -> Result<(), ReporterError> {
        if self.pending.is_none() {
            return Ok(());
        }

        if self.stream.is_none() {
            let now = Instant::now();
            if self.next_connect_attempt.is_some_and(|at| now < at) {
                return Ok(());
            }
            if let Err(e) = self.connect() {
                self.next_connect_attempt = Some(now + RECONNECT_INTERVAL);
                return Err(e);
            }
            self.next_connect_attempt = None;
        }
        if !self.ready {
            return Ok(());
        }

        if let Some(record) = self.pending.take() {
            let nonce = Uuid::new_v4().to_string();
            let command = set_activity_command(self.pid, &record, &nonce);
            if let Err(e) = self.send(OP_FRAME, &command) {
                self.pending = Some(record);
                return Err(e);
            }
            debug!(%nonce, details = %record.details, "SET_ACTIVITY sent");
            self.last_sent = Some(record);
        }
        Ok(())
    }

    /// Читает всё, что уже пришло в сокет, не блокируясь.
    fn drain_socket(&mut self) -> Result<(), ReporterError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.disconnect();
                    return Err(ReporterError::Closed("EOF".to_string()));
                }
                Ok(n) => self.decoder.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            }
        }

        loop {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.disconnect();
                    return Err(e);
                }
            };
            self.handle_frame(frame)?;
        }
    }

    fn handle_frame(&mut self, (opcode, payload): (u32, Value)) -> Result<(), ReporterError> {
        match opcode {
            OP_FRAME => {
                let cmd = payload.get("cmd").and_then(Value::as_str).unwrap_or_default();
                let evt = payload.get("evt").and_then(Value::as_str);
                match (cmd, evt) {
                    ("DISPATCH", Some("READY")) => {
                        let user = payload
                            .pointer("/data/user/username")
                            .and_then(Value::as_str)
                            .unwrap_or("?");
                        info!("Connected to Discord as {}", user);
                        self.ready = true;
                    }
                    (_, Some("ERROR")) => {
                        let message = payload
                            .pointer("/data/message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error");
                        debug!(cmd, "Failed updating activity: {}", message);
                    }
                    ("SET_ACTIVITY", _) => {
                        debug!(nonce = ?payload.get("nonce"), "Succeeded updating activity");
                    }
                    _ => debug!(cmd, ?evt, "Ignoring Discord IPC message"),
                }
                Ok(())
            }
            OP_PING => self.send(OP_PONG, &payload),
            OP_PONG => Ok(()),
            OP_CLOSE => {
                let message = payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("no reason")
                    .to_string();
                self.disconnect();
                Err(ReporterError::Closed(message))
            }
            other => {
                self.disconnect();
                Err(ReporterError::Protocol(format!("unexpected opcode {other}")))
            }
        }
    }
}

impl PresenceReporter for DiscordIpcReporter {
    fn update(&mut self, record: &PresenceRecord) -> Result<(), ReporterError> {
        // Discord уже показывает эту запись: повторять SET_ACTIVITY незачем
        if self.pending.is_none() && self.last_sent.as_ref() == Some(record) {
            return Ok(());
        }
        self.pending = Some(record.clone());
        self.flush()
    }

    fn run_callbacks(&mut self) -> Result<(), ReporterError> {
        self.drain_socket()?;
        self.flush()
    }

    fn close(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.send(OP_CLOSE, &json!({})) {
                warn!("Failed to close Discord IPC session: {}", e);
            }
        }
        self.disconnect();
        self.pending = None;
    }
}
