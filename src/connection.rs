//! Connection
//!
//! Wires a frame codec, matcher registry, dispatcher, and endpoint over one
//! byte-stream pair. Each connection runs exactly two tasks: a reader loop
//! that routes inbound messages, and a writer loop that drains the outbound
//! FIFO queue — the queue is the single writer the codec requires, so
//! frames leave in enqueue order and never interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, write_message};
use crate::dispatch::{DispatchTable, Dispatcher};
use crate::endpoint::Endpoint;
use crate::matcher::MatcherRegistry;
use crate::protocol::Message;

/// Per-connection context, injected at construction.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Short name used in log lines ("stdio", "robot-ls", ...).
    pub label: String,
    /// Default bound for `Endpoint::request`.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            label: "peer".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }
}

/// Cheap handle onto a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl OutboundSender {
    /// Enqueue a message for the writer task. Fails (returning the message
    /// back) once the writer is gone.
    pub fn send(&self, message: Message) -> Result<(), Message> {
        self.tx.send(message).map_err(|e| e.0)
    }

    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

pub struct Connection {
    endpoint: Arc<Endpoint>,
    registry: Arc<MatcherRegistry>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    /// Start serving a stream pair. The returned connection may be dropped;
    /// the reader/writer tasks keep serving until the stream closes.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        table: Arc<DispatchTable>,
        config: ConnectionConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = OutboundSender::channel();
        let registry = Arc::new(MatcherRegistry::new());
        let endpoint = Arc::new(Endpoint::new(
            Arc::clone(&registry),
            outbound.clone(),
            config.request_timeout,
        ));
        let dispatcher = Dispatcher::new(table, outbound);

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, config.label.clone()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&registry),
            dispatcher,
            config.label,
        ));

        Self {
            endpoint,
            registry,
            reader_task,
            writer_task,
        }
    }

    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    pub fn is_closed(&self) -> bool {
        self.registry.is_finished()
    }

    /// Wait until the reader loop exits (clean EOF or fatal read error).
    /// The mandatory matcher flush has already run by the time this
    /// returns. The writer task winds down on its own once the last
    /// outbound handle drops.
    pub async fn join(self) {
        let _ = self.reader_task.await;
    }

    /// Tear the connection down immediately: stop both tasks and flush the
    /// registry so every blocked waiter unblocks.
    pub fn abort(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
        self.registry.finish();
    }
}

async fn read_loop<R>(
    reader: R,
    registry: Arc<MatcherRegistry>,
    dispatcher: Dispatcher,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.read_message().await {
            Ok(Some(message)) => {
                let claimed = registry.on_message(&message);
                if claimed {
                    continue;
                }
                if message.method().is_some() {
                    dispatcher.dispatch(message);
                } else if let Message::Response(response) = message {
                    tracing::debug!(
                        "{}: response for unknown request id {} (may have timed out)",
                        label,
                        response.id
                    );
                }
            }
            Ok(None) => {
                tracing::debug!("{}: stream closed", label);
                break;
            }
            Err(e) => {
                tracing::warn!("{}: fatal read error: {}", label, e);
                break;
            }
        }
    }
    // Mandatory on any exit path: every still-registered matcher is
    // notified with the null payload so no waiter hangs.
    registry.finish();
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<Message>, label: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::warn!("{}: write error: {}", label, e);
            break;
        }
    }
    tracing::trace!("{}: writer stopped", label);
}
