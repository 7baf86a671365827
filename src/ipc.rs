//! JSON-line IPC to the external player. One frame out
//! (`{"command":[...]}\n`), one frame back (`{"data":...,"error":"..."}`),
//! over a unix socket, a named pipe, or loopback TCP depending on OS.

use crate::error::{Error, Result};
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient};

/// TCP endpoints draw uniformly from this fixed range. It is shared loopback
/// real estate, so the range never grows without a matching doc change.
pub const TCP_PORT_MIN: u16 = 19000;
pub const TCP_PORT_MAX: u16 = 19999;

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEndpoint {
    #[cfg(unix)]
    Unix(std::path::PathBuf),
    #[cfg(windows)]
    Pipe(String),
    Tcp(std::net::SocketAddr),
}

impl IpcEndpoint {
    /// Fresh endpoint for one player session: pid plus a random tag keeps
    /// concurrent sessions from colliding.
    pub fn generate() -> Self {
        #[cfg(unix)]
        {
            IpcEndpoint::Unix(std::env::temp_dir().join(format!(
                "plexcli-mpv-{}-{:08x}.sock",
                std::process::id(),
                rand::thread_rng().gen::<u32>()
            )))
        }
        #[cfg(windows)]
        {
            IpcEndpoint::Pipe(format!(
                r"\\.\pipe\plexcli-mpv-{}-{:08x}",
                std::process::id(),
                rand::thread_rng().gen::<u32>()
            ))
        }
        #[cfg(not(any(unix, windows)))]
        {
            Self::generate_tcp()
        }
    }

    /// Portable fallback transport.
    pub fn generate_tcp() -> Self {
        let port = rand::thread_rng().gen_range(TCP_PORT_MIN..=TCP_PORT_MAX);
        IpcEndpoint::Tcp(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Value for the player's `--input-ipc-server` flag.
    pub fn player_arg(&self) -> String {
        match self {
            #[cfg(unix)]
            IpcEndpoint::Unix(path) => format!("unix://{}", path.display()),
            #[cfg(windows)]
            IpcEndpoint::Pipe(name) => format!("pipe://{name}"),
            IpcEndpoint::Tcp(addr) => format!("tcp://{addr}"),
        }
    }
}

#[derive(Debug)]
enum Transport {
    #[cfg(unix)]
    Unix(BufStream<UnixStream>),
    #[cfg(windows)]
    Pipe(BufStream<NamedPipeClient>),
    Tcp(BufStream<TcpStream>),
}

impl Transport {
    async fn connect(endpoint: &IpcEndpoint) -> std::io::Result<Self> {
        match endpoint {
            #[cfg(unix)]
            IpcEndpoint::Unix(path) => {
                Ok(Transport::Unix(BufStream::new(UnixStream::connect(path).await?)))
            }
            #[cfg(windows)]
            IpcEndpoint::Pipe(name) => {
                Ok(Transport::Pipe(BufStream::new(ClientOptions::new().open(name)?)))
            }
            IpcEndpoint::Tcp(addr) => {
                Ok(Transport::Tcp(BufStream::new(TcpStream::connect(addr).await?)))
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => {
                s.write_all(line.as_bytes()).await?;
                s.write_all(b"\n").await?;
                s.flush().await
            }
            #[cfg(windows)]
            Transport::Pipe(s) => {
                s.write_all(line.as_bytes()).await?;
                s.write_all(b"\n").await?;
                s.flush().await
            }
            Transport::Tcp(s) => {
                s.write_all(line.as_bytes()).await?;
                s.write_all(b"\n").await?;
                s.flush().await
            }
        }
    }

    async fn read_line(&mut self, buf: &mut String) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Transport::Unix(s) => s.read_line(buf).await,
            #[cfg(windows)]
            Transport::Pipe(s) => s.read_line(buf).await,
            Transport::Tcp(s) => s.read_line(buf).await,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcCommand {
    pub command: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct IpcResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: String,
}

/// Property queries the progress tracker needs, abstracted so tests can
/// script the player side.
pub trait PlayerHandle: Send + Sync {
    fn time_pos(&self) -> impl Future<Output = Result<f64>> + Send;
    fn duration(&self) -> impl Future<Output = Result<f64>> + Send;
    fn paused(&self) -> impl Future<Output = Result<bool>> + Send;
    fn playlist_pos(&self) -> impl Future<Output = Result<i64>> + Send;
    fn filename(&self) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug)]
pub struct PlayerIpc {
    conn: Mutex<Transport>,
    endpoint: IpcEndpoint,
}

impl PlayerIpc {
    /// The player creates its endpoint lazily after spawn, so connecting
    /// retries up to 50 times at 100 ms intervals. Cancellation is polled
    /// between retries so a player that exits early aborts the wait.
    pub async fn connect(endpoint: &IpcEndpoint, cancel: &CancellationToken) -> Result<Self> {
        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match Transport::connect(endpoint).await {
                Ok(conn) => {
                    debug!("player IPC connected on attempt {attempt}");
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        endpoint: endpoint.clone(),
                    });
                }
                Err(e) => last_error = e.to_string(),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(CONNECT_RETRY) => {}
            }
        }
        Err(Error::Transport(format!(
            "player IPC endpoint never appeared: {last_error}"
        )))
    }

    /// One command out, exactly one newline-terminated response in. The
    /// mutex serialises whole send+receive pairs; there is no pipelining.
    pub async fn command(&self, args: Vec<Value>) -> Result<Value> {
        let frame = serde_json::to_string(&IpcCommand { command: args })?;
        let mut conn = self.conn.lock().await;
        conn.write_line(&frame).await?;

        let mut line = String::new();
        let n = conn.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Transport("player closed the IPC channel".to_string()));
        }
        let response: IpcResponse = serde_json::from_str(line.trim_end())
            .map_err(|e| Error::Protocol(format!("bad IPC frame: {e}")))?;
        if response.error != "success" {
            return Err(Error::Protocol(format!("player error: {}", response.error)));
        }
        Ok(response.data)
    }

    pub async fn get_property(&self, name: &str) -> Result<Value> {
        self.command(vec![json!("get_property"), json!(name)]).await
    }

    async fn get_f64(&self, name: &str) -> Result<f64> {
        match self.get_property(name).await? {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| property_mismatch(name, "float")),
            _ => Err(property_mismatch(name, "float")),
        }
    }
}

fn property_mismatch(name: &str, expected: &str) -> Error {
    Error::Protocol(format!("property {name}: expected {expected}"))
}

impl PlayerHandle for PlayerIpc {
    async fn time_pos(&self) -> Result<f64> {
        self.get_f64("time-pos").await
    }

    async fn duration(&self) -> Result<f64> {
        self.get_f64("duration").await
    }

    async fn paused(&self) -> Result<bool> {
        match self.get_property("pause").await? {
            Value::Bool(b) => Ok(b),
            _ => Err(property_mismatch("pause", "bool")),
        }
    }

    async fn playlist_pos(&self) -> Result<i64> {
        match self.get_property("playlist-pos").await? {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| property_mismatch("playlist-pos", "integer")),
            _ => Err(property_mismatch("playlist-pos", "integer")),
        }
    }

    async fn filename(&self) -> Result<String> {
        match self.get_property("filename").await? {
            Value::String(s) => Ok(s),
            _ => Err(property_mismatch("filename", "string")),
        }
    }
}

impl Drop for PlayerIpc {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let IpcEndpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
        #[cfg(not(unix))]
        let _ = &self.endpoint;
    }
}
