//! IPC Server - Unix socket server for control clients
//!
//! Handles incoming connections and dispatches commands to the
//! CacheDaemon.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::daemon::CacheDaemon;
use crate::ipc::protocol::{parse_command, serialize_response, Command, Response, PROTOCOL_VERSION};

/// IPC Server that listens for control commands
pub struct IpcServer {
    daemon: Arc<CacheDaemon>,
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    pub fn new(daemon: Arc<CacheDaemon>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            daemon,
            socket_path: socket_path.into(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", self.socket_path))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let daemon = Arc::clone(&self.daemon);
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, daemon, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    daemon: Arc<CacheDaemon>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                debug!(command = %trimmed, "Received command");

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &daemon).await,
                    Err(e) => {
                        error!(error = %e, command = %trimmed, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Process a command and return a response
async fn process_command(command: Command, daemon: &CacheDaemon) -> Response {
    match command {
        Command::Warm { url } => {
            info!(url = %url, "Processing warm command");

            match daemon.warm(&url).await {
                Ok(bytes) => Response::Success {
                    message: Some(format!("Cached {} bytes of {}", bytes, url)),
                },
                Err(e) => Response::Error {
                    error: format!("Warm failed: {:#}", e),
                },
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");

            let status = daemon.status().await;
            Response::Status {
                version: PROTOCOL_VERSION,
                healthy: true,
                entries: status.entries,
                warming: status.warming,
                stats: status.stats,
            }
        }

        Command::Purge => {
            info!("Processing purge command");

            match daemon.purge().await {
                Ok(report) => Response::Purged {
                    scanned: report.scanned,
                    removed: report.removed,
                    bytes_freed: report.bytes_freed,
                },
                Err(e) => Response::Error {
                    error: format!("Purge failed: {:#}", e),
                },
            }
        }
    }
}
