// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local Unix socket listener.
//!
//! A reporting process connects, writes its current status and closes the
//! connection. Each non-empty payload becomes one [`StatusEvent`]. Nothing is
//! written back to the peer.
//!
//! Connections are handled one at a time so events reach the key updater in
//! the order they were accepted. Failures of the listening socket itself are
//! reported on a separate fatal channel and end the accept loop.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ListenerConfig;
use crate::event::StatusEvent;

/// Unix sockets are limited to 108 bytes on Linux; keep a margin.
const MAX_SOCKET_PATH_BYTES: usize = 100;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid socket path {path}: {source}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to read from connection: {0}")]
    Read(#[source] io::Error),
    #[error("socket file {0} was removed or replaced")]
    SocketRemoved(PathBuf),
    #[error("failed to inspect socket file {path}: {source}")]
    SocketCheck {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Validates a Unix socket path: non-empty, absolute, free of NUL bytes and
/// short enough for `sun_path`.
pub fn validate_socket_path(path: &Path) -> io::Result<()> {
    let raw = path.as_os_str().as_bytes();
    if raw.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path cannot be empty",
        ));
    }
    if raw.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path cannot contain null bytes",
        ));
    }
    if raw.len() > MAX_SOCKET_PATH_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Unix socket path too long: {} bytes (maximum {MAX_SOCKET_PATH_BYTES} bytes)",
                raw.len()
            ),
        ));
    }
    if !path.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unix socket path must be absolute, got {}", path.display()),
        ));
    }
    Ok(())
}

/// Removes a leftover socket file from a previous run. Symlinks are refused
/// so the listener never deletes something it does not own.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is a symlink, refusing to remove it", path.display()),
        ));
    }
    if metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is a directory", path.display()),
        ));
    }
    debug!("listener: removing stale socket file {}", path.display());
    std::fs::remove_file(path)
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "listener: failed to remove socket file {}: {e}",
            path.display()
        ),
    }
}

/// Removes the socket file on drop, unless it has been replaced by another
/// file in the meantime.
#[derive(Debug)]
struct SocketFileGuard {
    path: PathBuf,
    inode: u64,
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        match std::fs::symlink_metadata(&self.path) {
            Ok(metadata) if metadata.ino() == self.inode => remove_socket_file(&self.path),
            Ok(_) => debug!(
                "listener: {} belongs to someone else, leaving it",
                self.path.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "listener: failed to inspect socket file {}: {e}",
                self.path.display()
            ),
        }
    }
}

struct Running {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
    _socket_file: SocketFileGuard,
}

/// Bridges the local socket to the status event stream.
pub struct LocalListener {
    config: ListenerConfig,
    events_tx: mpsc::UnboundedSender<StatusEvent>,
    fatal_tx: mpsc::UnboundedSender<ListenerError>,
    running: Option<Running>,
}

impl LocalListener {
    pub fn new(
        config: ListenerConfig,
        events_tx: mpsc::UnboundedSender<StatusEvent>,
        fatal_tx: mpsc::UnboundedSender<ListenerError>,
    ) -> Self {
        Self {
            config,
            events_tx,
            fatal_tx,
            running: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Binds the socket and spawns the accept loop. On error nothing is left
    /// behind. Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), ListenerError> {
        if self.running.is_some() {
            debug!("listener: already started");
            return Ok(());
        }
        let path = self.config.socket_path.clone();

        validate_socket_path(&path).map_err(|source| ListenerError::InvalidPath {
            path: path.clone(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            if !parent.is_dir() {
                return Err(ListenerError::InvalidPath {
                    path: path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("parent directory {} does not exist", parent.display()),
                    ),
                });
            }
        }
        remove_stale_socket(&path).map_err(|source| ListenerError::Bind {
            path: path.clone(),
            source,
        })?;

        let listener = UnixListener::bind(&path).map_err(|source| ListenerError::Bind {
            path: path.clone(),
            source,
        })?;
        let inode = match std::fs::symlink_metadata(&path) {
            Ok(metadata) => metadata.ino(),
            Err(source) => {
                drop(listener);
                remove_socket_file(&path);
                return Err(ListenerError::Bind { path, source });
            }
        };
        let socket_file = SocketFileGuard {
            path: path.clone(),
            inode,
        };

        let cancel_token = CancellationToken::new();
        let accept_loop = AcceptLoop {
            listener,
            socket_path: path.clone(),
            inode,
            max_payload_bytes: self.config.max_payload_bytes,
            read_timeout: self.config.read_timeout,
            socket_check_interval: self.config.socket_check_interval,
            events_tx: self.events_tx.clone(),
            fatal_tx: self.fatal_tx.clone(),
            cancel_token: cancel_token.clone(),
        };
        let task = tokio::spawn(accept_loop.run().in_current_span());

        info!("listener: listening on {}", path.display());
        self.running = Some(Running {
            cancel_token,
            task,
            _socket_file: socket_file,
        });
        Ok(())
    }

    /// Closes the socket and waits for the accept loop to exit. Idempotent,
    /// and a no-op when `start` failed. No event is published after it returns.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel_token.cancel();
        if let Err(e) = running.task.await {
            error!("listener: accept loop ended abnormally: {e}");
        }
        info!("listener: stopped");
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel_token.cancel();
        }
    }
}

struct AcceptLoop {
    listener: UnixListener,
    socket_path: PathBuf,
    inode: u64,
    max_payload_bytes: usize,
    read_timeout: Duration,
    socket_check_interval: Duration,
    events_tx: mpsc::UnboundedSender<StatusEvent>,
    fatal_tx: mpsc::UnboundedSender<ListenerError>,
    cancel_token: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        let mut socket_check = interval(self.socket_check_interval);
        socket_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        socket_check.tick().await; // first tick is immediate

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                _ = socket_check.tick() => self.check_socket_file(),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.handle_connection(stream).await,
                    Err(e) => Err(ListenerError::Accept(e)),
                },
            };

            if let Err(err) = result {
                error!("listener: {err}");
                if self.fatal_tx.send(err).is_err() {
                    debug!("listener: nobody is watching for fatal errors");
                }
                break;
            }
        }
        debug!("listener: accept loop exited");
    }

    fn check_socket_file(&self) -> Result<(), ListenerError> {
        match std::fs::symlink_metadata(&self.socket_path) {
            Ok(metadata) if metadata.ino() == self.inode => Ok(()),
            Ok(_) => Err(ListenerError::SocketRemoved(self.socket_path.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ListenerError::SocketRemoved(self.socket_path.clone()))
            }
            Err(source) => Err(ListenerError::SocketCheck {
                path: self.socket_path.clone(),
                source,
            }),
        }
    }

    /// Reads one payload until the peer closes. Per-connection problems are
    /// logged and dropped; only unexpected transport errors are returned.
    async fn handle_connection(&self, stream: UnixStream) -> Result<(), ListenerError> {
        debug!("listener: accepted connection");
        let mut payload = Vec::new();
        // one extra byte tells an oversized payload apart from one at the limit
        let mut reader = stream.take(self.max_payload_bytes as u64 + 1);

        let read = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Ok(()),
            read = timeout(self.read_timeout, reader.read_to_end(&mut payload)) => read,
        };

        match read {
            Err(_) => {
                warn!(
                    "listener: dropping connection, no EOF within {:?}",
                    self.read_timeout
                );
                return Ok(());
            }
            Ok(Err(e)) if is_peer_close(&e) => {
                debug!("listener: peer closed the connection early: {e}");
            }
            Ok(Err(e)) => return Err(ListenerError::Read(e)),
            Ok(Ok(_)) => {}
        }

        if payload.len() > self.max_payload_bytes {
            warn!(
                "listener: dropping payload larger than {} bytes",
                self.max_payload_bytes
            );
            return Ok(());
        }
        if payload.is_empty() {
            debug!("listener: ignoring empty payload");
            return Ok(());
        }
        if self.cancel_token.is_cancelled() {
            return Ok(());
        }

        debug!("listener: received {} bytes", payload.len());
        if self.events_tx.send(StatusEvent::new(payload)).is_err() {
            warn!("listener: key updater is gone, status dropped");
        }
        Ok(())
    }
}

fn is_peer_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
