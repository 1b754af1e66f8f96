//! IPC between the CLI and the daemon
//!
//! Newline-delimited JSON over a Unix domain socket. Each request gets exactly
//! one response, except `watch`, which keeps the connection open and streams a
//! `connections` line per published snapshot.

use anyhow::{Context, Result};
use revtun_core::{
    ConnectionSpec, ConnectionStatus, ConnectionUpdate, ErrorKind, ErrorPayload, TunnelError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Longest line either side will buffer, newline included
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// IPC request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Check the daemon is alive
    Ping,

    /// All connections with live status
    List,

    /// One connection
    Get { name: String },

    /// Register a new connection (inactive)
    Add { connection: ConnectionSpec },

    /// Partially update a connection
    Update {
        name: String,
        changes: ConnectionUpdate,
    },

    /// Stop and delete a connection
    Remove { name: String },

    Start { name: String },

    Stop { name: String },

    /// Stream status snapshots until the client disconnects
    Watch,
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,

    Connections { connections: Vec<ConnectionStatus> },

    Connection { connection: ConnectionStatus },

    /// Success acknowledgment
    Ok { message: Option<String> },

    /// Structured failure
    Error { kind: ErrorKind, message: String },
}

impl From<TunnelError> for IpcResponse {
    fn from(err: TunnelError) -> Self {
        let ErrorPayload { kind, message } = err.into();
        IpcResponse::Error { kind, message }
    }
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        IpcResponse::Ok {
            message: Some(message.into()),
        }
    }
}

async fn write_line<T: Serialize>(stream: &mut BufReader<UnixStream>, value: &T) -> Result<()> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');

    stream
        .get_mut()
        .write_all(json.as_bytes())
        .await
        .context("Failed to write to socket")?;
    stream
        .get_mut()
        .flush()
        .await
        .context("Failed to flush socket")?;

    Ok(())
}

/// Read one line; `None` when the peer closed the connection
///
/// A line longer than [`MAX_LINE_BYTES`] is discarded and reported as an
/// error, leaving the stream at the start of the next line.
async fn read_line(stream: &mut BufReader<UnixStream>) -> Result<Option<String>> {
    let mut line = Vec::new();
    let bytes_read = (&mut *stream)
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', &mut line)
        .await
        .context("Failed to read from socket")?;

    if bytes_read == 0 {
        return Ok(None);
    }
    if bytes_read == MAX_LINE_BYTES && line.last() != Some(&b'\n') {
        skip_line(stream).await?;
        anyhow::bail!("Message exceeds {} bytes", MAX_LINE_BYTES);
    }

    let line = String::from_utf8(line).context("Message is not valid UTF-8")?;
    Ok(Some(line))
}

/// Drop buffered input up to and including the next newline
async fn skip_line(stream: &mut BufReader<UnixStream>) -> Result<()> {
    loop {
        let buf = stream
            .fill_buf()
            .await
            .context("Failed to read from socket")?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(end) => {
                stream.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                stream.consume(len);
            }
        }
    }
}

/// IPC client for CLI to connect to daemon
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    /// Connect to the daemon socket at `path`
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.with_context(|| {
            format!(
                "Failed to connect to daemon socket at {:?} (is `revtun daemon` running?)",
                path
            )
        })?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive a response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        write_line(&mut self.stream, req)
            .await
            .context("Failed to send request")?;
        self.next_response()
            .await?
            .context("Daemon closed the connection")
    }

    /// Next streamed response; `None` once the daemon hangs up
    pub async fn next_response(&mut self) -> Result<Option<IpcResponse>> {
        let Some(line) = read_line(&mut self.stream).await? else {
            return Ok(None);
        };

        let response: IpcResponse =
            serde_json::from_str(&line).context("Failed to parse response")?;
        Ok(Some(response))
    }
}

/// IPC server for daemon to listen for CLI connections
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind to the socket at `path`, replacing a stale one
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another daemon is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// A single IPC connection from a client
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Receive a request; `None` when the client closed the connection
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        let Some(line) = read_line(&mut self.stream).await? else {
            return Ok(None);
        };

        let request: IpcRequest = serde_json::from_str(&line).context("Failed to parse request")?;
        Ok(Some(request))
    }

    /// Send a response to the client
    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        write_line(&mut self.stream, response).await
    }
}

/// Print connections as a table to stdout
pub fn print_connections_table(connections: &[ConnectionStatus]) {
    if connections.is_empty() {
        println!("No connections configured.");
        return;
    }

    println!(
        "{:<16} {:<8} {:<8} {:<32} STATUS",
        "NAME", "LOCAL", "REMOTE", "DESTINATION"
    );

    for status in connections {
        let spec = &status.spec;
        let state = if status.active {
            "● Running"
        } else {
            "○ Stopped"
        };

        println!(
            "{:<16} {:<8} {:<8} {:<32} {}",
            spec.name,
            format!(":{}", spec.local_port),
            format!(":{}", spec.remote_port),
            format!("{}:{}", spec.destination(), spec.ssh_port),
            state
        );
    }
}

/// Print every field of one connection
pub fn print_connection_details(status: &ConnectionStatus) {
    let spec = &status.spec;
    println!("Name:                    {}", spec.name);
    println!(
        "Status:                  {}",
        if status.active { "running" } else { "stopped" }
    );
    println!("Local port:              {}", spec.local_port);
    println!("Remote port:             {}", spec.remote_port);
    println!("Remote host:             {}", spec.remote_host);
    println!(
        "Remote user:             {}",
        spec.remote_user.as_deref().unwrap_or("-")
    );
    println!("Key:                     {}", spec.credential_path.display());
    println!("SSH port:                {}", spec.ssh_port);
    println!(
        "Keepalive interval:      {}s",
        spec.keepalive_interval_seconds
    );
    println!("Exit on forward failure: {}", spec.exit_on_forward_failure);
}
