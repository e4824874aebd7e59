/// mpv channels: one mpv process per deck, driven over its JSON IPC socket.
///
/// Architecture:
///
/// ```text
///   MpvLauncher::start()
///         │
///         ├── spawn `mpv --idle=no --start=<offset> <file>`
///         ├── poll for the IPC socket (connect timeout)
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event                     → dropped (debug log)
/// ```
///
/// mpv exits by itself when the file ends, so a clean exit the controller did
/// not ask for is reported as `Exited(Some(0))`.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use station_core::config::MpvConfig;
use station_core::platform;

use crate::channel::{ChannelError, ChannelLauncher, ChannelState, PlaybackChannel};

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Distinguishes successive processes started under the same deck label.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// How long a stopped channel gets to exit after `quit` before it is killed.
pub const QUIT_GRACE: Duration = Duration::from_secs(2);

// ── internal channel types ────────────────────────────────────────────────────

type Reply = Result<Value, String>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<Reply>,
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Cloneable handle to one channel's writer task.
#[derive(Clone)]
pub struct MpvHandle {
    label: Arc<str>,
    tx: mpsc::Sender<PendingRequest>,
    reply_timeout: Duration,
}

impl MpvHandle {
    /// Send a command and wait for its reply.  `what` names the command in
    /// timeout errors.
    async fn send(&self, command: Value, what: &str) -> Result<Value, ChannelError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg).map_err(|e| self.ipc(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.ipc("writer task gone".to_string()))?;

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Err(_) => Err(ChannelError::PropertyTimeout {
                label: self.label.to_string(),
                name: what.to_string(),
                after: self.reply_timeout,
            }),
            Ok(Err(_)) => Err(self.ipc(format!("reply channel dropped req={}", req_id))),
            Ok(Ok(Err(message))) => Err(self.ipc(message)),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    fn ipc(&self, message: String) -> ChannelError {
        ChannelError::Ipc {
            label: self.label.to_string(),
            message,
        }
    }

    pub async fn get_property(&self, name: &str) -> Result<Option<Value>, ChannelError> {
        match self.send(json!(["get_property", name]), name).await {
            Ok(resp) => Ok(resp.get("data").cloned().filter(|v| !v.is_null())),
            // Normal for time-pos until the file is loaded.
            Err(ChannelError::Ipc { message, .. }) if message == "property unavailable" => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_volume(&self, volume: u8) -> Result<(), ChannelError> {
        let pct = volume.min(100) as f64;
        self.send(json!(["set_property", "volume", pct]), "volume")
            .await?;
        Ok(())
    }

    pub async fn quit(&self) -> Result<(), ChannelError> {
        self.send(json!(["quit"]), "quit").await?;
        Ok(())
    }
}

fn start_io_tasks<S>(label: Arc<str>, stream: S, reply_timeout: Duration) -> MpvHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(label.clone(), write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(label.clone(), reader, pending));

    MpvHandle {
        label,
        tx: cmd_tx,
        reply_timeout,
    }
}

/// Poll for the IPC endpoint until it accepts a connection or `timeout` passes.
#[cfg(unix)]
async fn connect_ipc(
    label: &str,
    socket_name: &str,
    timeout: Duration,
    reply_timeout: Duration,
) -> Result<MpvHandle, ChannelError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(stream) = UnixStream::connect(socket_name).await {
            debug!("mpv {}: connected to {}", label, socket_name);
            return Ok(start_io_tasks(label.into(), stream, reply_timeout));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ChannelError::ConnectTimeout {
                label: label.to_string(),
                after: timeout,
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(windows)]
async fn connect_ipc(
    label: &str,
    socket_name: &str,
    timeout: Duration,
    reply_timeout: Duration,
) -> Result<MpvHandle, ChannelError> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            debug!("mpv {}: connected to {}", label, pipe_path);
            return Ok(start_io_tasks(label.into(), client, reply_timeout));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ChannelError::ConnectTimeout {
                label: label.to_string(),
                after: timeout,
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(label: Arc<str>, mut reader: BufReader<R>, pending: PendingMap)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv {} reader: connection closed", label);
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv {} reader: invalid json '{}': {}", label, trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) else {
                    debug!("mpv {} reader: event {}", label, trimmed);
                    continue;
                };
                let mut map = pending.lock().await;
                if let Some(tx) = map.remove(&req_id) {
                    let result = match val["error"].as_str() {
                        Some("success") => Ok(val),
                        Some(err) => Err(err.to_string()),
                        None => Err("unknown error".to_string()),
                    };
                    let _ = tx.send(result);
                } else {
                    debug!("mpv {} reader: response for unknown req={}", label, req_id);
                }
            }
            Err(e) => {
                warn!("mpv {} reader: read error: {}", label, e);
                fail_pending(&pending, &format!("read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(reason.to_string()));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    label: Arc<str>,
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: PendingMap,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv {} writer: write error: {}", label, e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(format!("write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv {} writer: task exiting", label);
}

// ── channel ───────────────────────────────────────────────────────────────────

pub struct MpvChannel {
    label: String,
    socket_name: String,
    handle: MpvHandle,
    child: Mutex<Child>,
    state: Mutex<ChannelState>,
}

#[async_trait]
impl PlaybackChannel for MpvChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn state(&self) -> ChannelState {
        let mut state = self.state.lock().await;
        if !state.is_exited() {
            if let Ok(Some(status)) = self.child.lock().await.try_wait() {
                *state = ChannelState::Exited(status.code());
            }
        }
        *state
    }

    async fn set_volume(&self, volume: u8) -> Result<(), ChannelError> {
        self.handle.set_volume(volume).await
    }

    async fn get_property(&self, name: &str) -> Result<Option<Value>, ChannelError> {
        let value = self.handle.get_property(name).await?;
        if name == "time-pos" && value.as_ref().and_then(|v| v.as_f64()).unwrap_or(0.0) > 0.0 {
            let mut state = self.state.lock().await;
            if *state == ChannelState::Starting {
                *state = ChannelState::Running;
            }
        }
        Ok(value)
    }

    async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            if state.is_exited() {
                return;
            }
            *state = ChannelState::Stopping;
        }
        if let Err(e) = self.handle.quit().await {
            debug!("mpv {}: quit not acknowledged: {}", self.label, e);
        }

        let code = {
            let mut child = self.child.lock().await;
            match tokio::time::timeout(QUIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => {
                    warn!("mpv {}: did not quit, killing", self.label);
                    let _ = child.kill().await;
                    None
                }
            }
        };
        *self.state.lock().await = ChannelState::Exited(code);
        remove_socket(&self.socket_name).await;
        debug!("mpv {}: stopped ({:?})", self.label, code);
    }
}

#[cfg(unix)]
async fn remove_socket(socket_name: &str) {
    let _ = tokio::fs::remove_file(socket_name).await;
}

#[cfg(windows)]
async fn remove_socket(_socket_name: &str) {}

// ── launcher ──────────────────────────────────────────────────────────────────

pub struct MpvLauncher {
    binary: PathBuf,
    config: MpvConfig,
}

impl MpvLauncher {
    pub fn new(config: MpvConfig) -> anyhow::Result<Self> {
        let binary = platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: using {:?}", binary);
        Ok(Self { binary, config })
    }
}

#[async_trait]
impl ChannelLauncher for MpvLauncher {
    async fn start(
        &self,
        label: &str,
        path: &Path,
        offset_secs: f64,
        volume: u8,
    ) -> Result<Box<dyn PlaybackChannel>, ChannelError> {
        let instance = format!("{}-{}", label, NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
        let socket_name = platform::mpv_socket_name(&instance);
        remove_socket(&socket_name).await;

        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("--no-video")
            .arg("--idle=no")
            .arg("--no-terminal")
            .arg(platform::mpv_socket_arg(&instance))
            .arg(format!("--volume={}", volume.min(100)))
            .arg(format!("--start={:.3}", offset_secs.max(0.0)))
            .args(&self.config.extra_args)
            .arg("--")
            .arg(path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ChannelError::Spawn {
            label: instance.clone(),
            program: self.binary.display().to_string(),
            source,
        })?;
        debug!("mpv {}: spawned for {:?} at {:.1}s vol {}", instance, path, offset_secs, volume);

        let handle = match connect_ipc(
            &instance,
            &socket_name,
            self.config.connect_timeout(),
            self.config.property_timeout(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill().await;
                remove_socket(&socket_name).await;
                return Err(e);
            }
        };

        Ok(Box::new(MpvChannel {
            label: instance,
            socket_name,
            handle,
            child: Mutex::new(child),
            state: Mutex::new(ChannelState::Starting),
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Minimal mpv stand-in: answers `get_property time-pos` with "property
    /// unavailable" once, then 1.5; ignores `volume` so it times out.
    async fn fake_mpv(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        let mut asked = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["request_id"].as_u64().unwrap();
            let command = req["command"].clone();
            if command[1] == "volume" {
                continue;
            }
            asked += 1;
            let reply = if asked == 1 {
                json!({"request_id": id, "error": "property unavailable"})
            } else {
                json!({"request_id": id, "error": "success", "data": 1.5})
            };
            let mut raw = reply.to_string();
            raw.push('\n');
            write_half.write_all(b"{\"event\":\"playback-restart\"}\n").await.unwrap();
            write_half.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_property_roundtrip_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mpv.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(fake_mpv(listener));

        let handle = connect_ipc(
            "deck-a",
            socket.to_str().unwrap(),
            Duration::from_secs(1),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert_eq!(handle.get_property("time-pos").await.unwrap(), None);
        assert_eq!(handle.get_property("time-pos").await.unwrap(), Some(json!(1.5)));
        match handle.set_volume(50).await {
            Err(ChannelError::PropertyTimeout { name, .. }) => assert_eq!(name, "volume"),
            other => panic!("expected property timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("missing.sock");
        let result = connect_ipc(
            "deck-b",
            socket.to_str().unwrap(),
            Duration::from_millis(120),
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(ChannelError::ConnectTimeout { .. })));
    }
}
