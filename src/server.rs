//! Server
//!
//! The child side of the protocol: serves a dispatch table over stdio or
//! TCP and implements the lifecycle contract every server in the family
//! honors — answer `initialize` (remembering the parent pid for the
//! watchdog), answer `shutdown`, terminate on `exit`, and self-terminate
//! when the parent process vanishes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::connection::{Connection, ConnectionConfig};
use crate::dispatch::{DispatchTable, Outcome};
use crate::process;
use crate::protocol::methods;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in the `initialize` response.
    pub name: String,
    /// Default request bound for connections this server accepts.
    pub request_timeout: Duration,
    /// How often the watchdog probes the parent pid.
    pub parent_poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            request_timeout: Duration::from_secs(30),
            parent_poll: Duration::from_secs(3),
        }
    }
}

struct ServerState {
    shutting_down: AtomicBool,
}

pub struct Server {
    table: Arc<DispatchTable>,
    config: ServerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Wrap an application dispatch table, adding the lifecycle methods.
    pub fn new(mut table: DispatchTable, config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let state = Arc::new(ServerState {
            shutting_down: AtomicBool::new(false),
        });
        register_lifecycle(&mut table, &config, state, shutdown_tx.clone());
        Self {
            table: Arc::new(table),
            config,
            shutdown_tx,
        }
    }

    /// Handle for triggering shutdown out-of-band (signal handlers, tests).
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn table(&self) -> Arc<DispatchTable> {
        Arc::clone(&self.table)
    }

    /// Serve one connection on this process's stdin/stdout until the
    /// stream closes or `exit` (or the watchdog) fires.
    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        let connection = Connection::spawn(
            tokio::io::stdin(),
            tokio::io::stdout(),
            Arc::clone(&self.table),
            self.connection_config("stdio".to_string()),
        );
        tracing::info!("{} serving on stdio", self.config.name);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = connection.join() => tracing::debug!("stdio connection closed"),
            _ = shutdown_rx.recv() => tracing::info!("shutdown signal received"),
        }
        Ok(())
    }

    /// Accept TCP connections and serve each over its own connection,
    /// sharing one dispatch table.
    pub async fn serve_tcp(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("{} listening on {}", self.config.name, listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!("connection from {}", peer);
                            let (read, write) = stream.into_split();
                            // Tasks detach and serve until the peer hangs up.
                            let _connection = Connection::spawn(
                                read,
                                write,
                                Arc::clone(&self.table),
                                self.connection_config(peer.to_string()),
                            );
                        }
                        Err(e) => tracing::warn!("accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    fn connection_config(&self, label: String) -> ConnectionConfig {
        ConnectionConfig {
            label,
            request_timeout: self.config.request_timeout,
        }
    }
}

fn register_lifecycle(
    table: &mut DispatchTable,
    config: &ServerConfig,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let name = config.name.clone();
    let parent_poll = config.parent_poll;
    let watchdog_tx = shutdown_tx.clone();
    table.register(methods::INITIALIZE, move |params, _ctx| {
        let parent_pid = params
            .as_ref()
            .and_then(|p| p.get("processId"))
            .and_then(Value::as_u64)
            .map(|p| p as u32);
        if let Some(pid) = parent_pid {
            tracing::debug!("initialized by parent pid {}", pid);
            let _watchdog = process::watch_parent(pid, watchdog_tx.clone(), parent_poll);
        } else {
            tracing::debug!("initialized without a parent pid; watchdog disabled");
        }
        Outcome::Sync(Ok(json!({
            "name": name.clone(),
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
        })))
    });

    let shutdown_state = Arc::clone(&state);
    table.register(methods::SHUTDOWN, move |_params, _ctx| {
        shutdown_state.shutting_down.store(true, Ordering::Release);
        Outcome::Sync(Ok(Value::Null))
    });

    table.register(methods::EXIT, move |_params, _ctx| {
        if !state.shutting_down.load(Ordering::Acquire) {
            tracing::debug!("exit received without a prior shutdown");
        }
        let _ = shutdown_tx.send(());
        Outcome::Sync(Ok(Value::Null))
    });

    table.register(methods::PING, |_params, _ctx| {
        Outcome::Sync(Ok(json!({ "pong": true })))
    });
}
