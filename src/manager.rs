//! Sub-process Server Manager
//!
//! Spawns an auxiliary process that speaks the framed protocol over its own
//! stdio, verifies it with the `initialize` handshake, restarts it lazily
//! when it is found dead, and tears it down idempotently. Spawn or
//! handshake failures degrade to a `None` client — "feature temporarily
//! unavailable" — and never propagate into the parent process.
//!
//! The manager is exclusively owned: every state transition goes through
//! `&mut self`. The client it returns is `Arc` and safe from any task,
//! because it owns its own correlation registry.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::client::ServiceClient;
use crate::connection::{Connection, ConnectionConfig};
use crate::dispatch::DispatchTable;
use crate::error::SpawnError;
use crate::process::{configure_process_group, kill_tree};

/// Distinct log-file suffix per spawned child, so several children of the
/// same kind never write to one log.
static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Executable to spawn.
    pub command: PathBuf,
    /// Extra arguments placed before the engine-owned flags.
    pub args: Vec<String>,
    /// Child kind, used in log lines.
    pub label: String,
    /// Number of `-v` flags passed to the child.
    pub verbosity: u8,
    /// Log-file stem handed to the child as `--log-file=<stem>.<n><ext>`.
    pub log_file: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub initialize_timeout: Duration,
    /// Default bound for requests issued through the returned client.
    pub request_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(command: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            label: label.into(),
            verbosity: 0,
            log_file: None,
            cwd: None,
            initialize_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    NotStarted,
    Starting,
    Running,
}

struct ChildHandle {
    child: Child,
    pid: u32,
    client: Arc<ServiceClient>,
    connection: Connection,
}

pub struct ServerManager {
    config: ManagerConfig,
    dispatch: Arc<DispatchTable>,
    state: ManagerState,
    handle: Option<ChildHandle>,
}

impl ServerManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_dispatch(config, DispatchTable::new())
    }

    /// `table` serves requests and notifications the child sends back to
    /// this process.
    pub fn with_dispatch(config: ManagerConfig, table: DispatchTable) -> Self {
        Self {
            config,
            dispatch: Arc::new(table),
            state: ManagerState::NotStarted,
            handle: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Get the typed client, spawning the child on first use and lazily
    /// respawning it if the pid is found dead. Death is detected here, on
    /// next use — there is no background poll.
    pub async fn get_client(&mut self) -> Option<Arc<ServiceClient>> {
        if let Some(handle) = &mut self.handle {
            match handle.child.try_wait() {
                Ok(None) => return Some(Arc::clone(&handle.client)),
                Ok(Some(status)) => {
                    tracing::warn!(
                        "{} (pid {}) exited with {}; respawning on demand",
                        self.config.label,
                        handle.pid,
                        status
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "{} liveness check failed: {}; respawning on demand",
                        self.config.label,
                        e
                    );
                }
            }
            if let Some(dead) = self.handle.take() {
                dead.connection.abort();
            }
            self.state = ManagerState::NotStarted;
        }

        match self.spawn_child().await {
            Ok(handle) => {
                let client = Arc::clone(&handle.client);
                self.handle = Some(handle);
                self.state = ManagerState::Running;
                Some(client)
            }
            Err(e) => {
                tracing::error!("failed to start {}: {}", self.config.label, e);
                self.state = ManagerState::NotStarted;
                None
            }
        }
    }

    async fn spawn_child(&mut self) -> Result<ChildHandle, SpawnError> {
        self.state = ManagerState::Starting;

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        for _ in 0..self.config.verbosity {
            command.arg("-v");
        }
        if let Some(stem) = &self.config.log_file {
            command.arg(format!("--log-file={}", instance_log_path(stem).display()));
        }
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_process_group(&mut command);

        tracing::info!(
            "starting {}: {} {:?}",
            self.config.label,
            self.config.command.display(),
            self.config.args
        );

        let mut child = command.spawn().map_err(|e| {
            SpawnError::Start(format!("{}: {}", self.config.command.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Start("failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Start("failed to get stdout".to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Start("child exited before its pid was read".to_string()))?;

        let connection = Connection::spawn(
            stdout,
            stdin,
            Arc::clone(&self.dispatch),
            ConnectionConfig {
                label: self.config.label.clone(),
                request_timeout: self.config.request_timeout,
            },
        );
        let client = Arc::new(ServiceClient::new(
            connection.endpoint(),
            pid,
            self.config.label.clone(),
        ));

        match client
            .initialize(std::process::id(), self.config.initialize_timeout)
            .await
        {
            Ok(info) => {
                tracing::info!("{} ready: {} (pid {})", self.config.label, info.name, pid);
                Ok(ChildHandle {
                    child,
                    pid,
                    client,
                    connection,
                })
            }
            Err(e) => {
                match captured_stderr(&mut child).await {
                    Some(tail) if !tail.is_empty() => tracing::error!(
                        "{} initialize failed: {}; stderr: {}",
                        self.config.label,
                        e,
                        tail
                    ),
                    _ => tracing::error!("{} initialize failed: {}", self.config.label, e),
                }
                kill_tree(pid);
                let _ = child.start_kill();
                let _ = timeout(Duration::from_secs(5), child.wait()).await;
                connection.abort();
                Err(SpawnError::Handshake(e))
            }
        }
    }

    /// Graceful teardown: the protocol shutdown/exit sequence, then an
    /// unconditional kill of the process tree. A no-op if no client was
    /// ever created; safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        self.teardown(true).await;
    }

    /// Same teardown as `shutdown`; kept as a separate entry point because
    /// callers distinguish "orderly stop" from "stop now" at their level.
    pub async fn exit(&mut self) {
        self.teardown(true).await;
    }

    /// Immediate teardown without the protocol goodbye. Returns the manager
    /// to `NotStarted` from any state.
    pub async fn dispose(&mut self) {
        self.teardown(false).await;
    }

    async fn teardown(&mut self, graceful: bool) {
        let Some(mut handle) = self.handle.take() else {
            self.state = ManagerState::NotStarted;
            return;
        };

        if graceful {
            handle
                .client
                .send_shutdown_sequence(Duration::from_secs(2))
                .await;
        }

        // Unconditional, whether or not the goodbye succeeded.
        kill_tree(handle.pid);
        let _ = handle.child.start_kill();
        match timeout(Duration::from_secs(5), handle.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("{} exited: {}", self.config.label, status),
            Ok(Err(e)) => tracing::warn!("{} wait error: {}", self.config.label, e),
            Err(_) => tracing::warn!("{} did not exit after kill", self.config.label),
        }
        handle.connection.abort();

        self.state = ManagerState::NotStarted;
        tracing::info!("{} stopped", self.config.label);
    }
}

fn instance_log_path(stem: &Path) -> PathBuf {
    let n = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    match stem.extension().and_then(|e| e.to_str()) {
        Some(ext) => stem.with_extension(format!("{}.{}", n, ext)),
        None => stem.with_extension(n.to_string()),
    }
}

/// Best-effort stderr tail for diagnostics, only once the child exited (a
/// live child keeps the pipe open and would block us).
async fn captured_stderr(child: &mut Child) -> Option<String> {
    match child.try_wait() {
        Ok(Some(_)) => {
            let mut stderr = child.stderr.take()?;
            let mut buf = Vec::new();
            let _ = timeout(Duration::from_millis(500), stderr.read_to_end(&mut buf)).await;
            let start = buf.len().saturating_sub(2000);
            Some(String::from_utf8_lossy(&buf[start..]).trim().to_string())
        }
        _ => None,
    }
}
