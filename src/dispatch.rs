//! Method Dispatch
//!
//! Routes inbound request/notification method names to handlers. A handler
//! answers synchronously or returns a deferred future executed on a
//! background task, so expensive work runs off the reader loop while id
//! correlation still ties the eventual response to the original request.
//!
//! Independent feature modules register prefixed sub-tables into one shared
//! table; a single process hosts many unrelated features this way instead
//! of one monolithic match.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::connection::OutboundSender;
use crate::protocol::{Message, Request, RequestId, Response, RpcError, methods};

/// Context handed to every handler invocation.
pub struct RequestContext {
    /// The request id; `None` for notifications.
    pub id: Option<RequestId>,
    /// Cooperative cancellation token for this invocation. Long-running
    /// handlers poll it via `checkpoint` at safe points.
    pub token: CancelToken,
    /// Outbound queue of the connection, for handlers that emit
    /// notifications of their own (progress, logs).
    pub outbound: OutboundSender,
}

/// What a handler produced: an immediate result, or a future whose output
/// becomes the eventual response.
pub enum Outcome {
    Sync(Result<Value, RpcError>),
    Deferred(BoxFuture<'static, Result<Value, RpcError>>),
}

type Handler = Box<dyn Fn(Option<Value>, RequestContext) -> Outcome + Send + Sync>;

/// Method name → handler table, immutable once serving starts.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>, RequestContext) -> Outcome + Send + Sync + 'static,
    {
        let method = method.into();
        if self.handlers.insert(method.clone(), Box::new(handler)).is_some() {
            tracing::warn!("handler for '{}' was replaced", method);
        }
    }

    /// Merge a feature module's sub-table under its method-name prefix.
    pub fn register_module(&mut self, module: &dyn Module) {
        let prefix = module.prefix();
        for (name, handler) in module.table().handlers {
            self.handlers.insert(format!("{}/{}", prefix, name), handler);
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }
}

/// An independent feature (linting, completions, work-item listing, ...)
/// contributing its handlers under a private prefix.
pub trait Module {
    fn prefix(&self) -> &'static str;
    fn table(&self) -> DispatchTable;
}

/// Per-connection dispatcher: the shared table plus this connection's
/// in-flight cancellation tokens.
pub struct Dispatcher {
    table: Arc<DispatchTable>,
    inflight: Arc<Mutex<HashMap<RequestId, CancelToken>>>,
    outbound: OutboundSender,
}

impl Dispatcher {
    pub fn new(table: Arc<DispatchTable>, outbound: OutboundSender) -> Self {
        Self {
            table,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            outbound,
        }
    }

    /// Route one method-bearing message (or drop an unclaimed response).
    pub fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => self.dispatch_request(request),
            Message::Notification(note) => {
                // A cancel is handled by the dispatcher itself, out-of-band
                // of the table, since it targets an in-flight invocation.
                if note.method == methods::CANCEL_REQUEST {
                    self.handle_cancel(note.params.as_ref());
                } else {
                    self.dispatch_notification(&note.method, note.params);
                }
            }
            Message::Response(response) => {
                tracing::debug!(
                    "response for unknown request id {} (may have timed out)",
                    response.id
                );
            }
        }
    }

    fn dispatch_request(&self, request: Request) {
        let Request {
            id, method, params, ..
        } = request;

        let Some(handler) = self.table.get(&method) else {
            tracing::debug!("unknown method '{}'", method);
            send_response(&self.outbound, id, Err(RpcError::method_not_found(&method)));
            return;
        };

        let token = CancelToken::new();
        lock_inflight(&self.inflight).insert(id.clone(), token.clone());

        let ctx = RequestContext {
            id: Some(id.clone()),
            token,
            outbound: self.outbound.clone(),
        };

        // Handler errors, sync or deferred, stop at the dispatch boundary:
        // they become error responses, never a torn connection.
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(params, ctx)));
        match outcome {
            Ok(Outcome::Sync(result)) => {
                lock_inflight(&self.inflight).remove(&id);
                send_response(&self.outbound, id, result);
            }
            Ok(Outcome::Deferred(fut)) => {
                let inflight = Arc::clone(&self.inflight);
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(fut).catch_unwind().await.unwrap_or_else(|_| {
                        tracing::error!("deferred handler for '{}' panicked", method);
                        Err(RpcError::internal_error(&format!(
                            "handler for '{}' panicked",
                            method
                        )))
                    });
                    lock_inflight(&inflight).remove(&id);
                    send_response(&outbound, id, result);
                });
            }
            Err(_) => {
                tracing::error!("handler for '{}' panicked", method);
                lock_inflight(&self.inflight).remove(&id);
                send_response(
                    &self.outbound,
                    id,
                    Err(RpcError::internal_error(&format!(
                        "handler for '{}' panicked",
                        method
                    ))),
                );
            }
        }
    }

    fn dispatch_notification(&self, method: &str, params: Option<Value>) {
        let Some(handler) = self.table.get(method) else {
            // Unknown notifications are dropped, never surfaced as errors.
            tracing::trace!("unhandled notification: {}", method);
            return;
        };

        let ctx = RequestContext {
            id: None,
            token: CancelToken::new(),
            outbound: self.outbound.clone(),
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(params, ctx))) {
            Ok(Outcome::Sync(Ok(_))) => {}
            Ok(Outcome::Sync(Err(err))) => {
                tracing::debug!("notification '{}' handler failed: {}", method, err);
            }
            Ok(Outcome::Deferred(fut)) => {
                let method = method.to_string();
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(RpcError::internal_error("handler panicked")));
                    if let Err(err) = result {
                        tracing::debug!("notification '{}' handler failed: {}", method, err);
                    }
                });
            }
            Err(_) => tracing::error!("notification handler '{}' panicked", method),
        }
    }

    fn handle_cancel(&self, params: Option<&Value>) {
        let target = params
            .and_then(|p| p.get("id"))
            .cloned()
            .and_then(|v| serde_json::from_value::<RequestId>(v).ok());

        match target {
            Some(id) => {
                let token = lock_inflight(&self.inflight).get(&id).cloned();
                match token {
                    Some(token) => {
                        tracing::debug!("cancel requested for in-flight request {}", id);
                        token.cancel();
                    }
                    None => tracing::debug!("cancel for unknown or finished request {}", id),
                }
            }
            None => tracing::debug!("$/cancelRequest without a usable id"),
        }
    }
}

fn lock_inflight(
    inflight: &Mutex<HashMap<RequestId, CancelToken>>,
) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancelToken>> {
    inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn send_response(outbound: &OutboundSender, id: RequestId, result: Result<Value, RpcError>) {
    let response = match result {
        Ok(value) => Response::success(id, value),
        Err(error) => Response::error(id, error),
    };
    if outbound.send(Message::Response(response)).is_err() {
        tracing::warn!("response dropped: outbound queue is closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Notification;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn dispatcher(table: DispatchTable) -> (Dispatcher, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = OutboundSender::channel();
        (Dispatcher::new(Arc::new(table), outbound), rx)
    }

    fn expect_response(rx: &mut mpsc::UnboundedReceiver<Message>) -> Response {
        match rx.try_recv().expect("a response should have been queued") {
            Message::Response(resp) => resp,
            other => panic!("unexpected outbound message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_request_yields_method_not_found() {
        let (dispatcher, mut rx) = dispatcher(DispatchTable::new());

        dispatcher.dispatch(Message::Request(Request::new(
            "22",
            "invalidMessageSent",
            Some(json!({"x": 1})),
        )));

        let resp = expect_response(&mut rx);
        assert_eq!(resp.id, RequestId::String("22".to_string()));
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_unknown_notification_is_dropped_silently() {
        let (dispatcher, mut rx) = dispatcher(DispatchTable::new());

        dispatcher.dispatch(Message::Notification(Notification::new(
            "invalidMessageSent",
            Some(json!({"x": 1})),
        )));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_handler_result_is_sent_back() {
        let mut table = DispatchTable::new();
        table.register("double", |params, _ctx| {
            let n = params
                .as_ref()
                .and_then(|p| p.get("n"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Outcome::Sync(Ok(json!({"doubled": n * 2})))
        });
        let (dispatcher, mut rx) = dispatcher(table);

        dispatcher.dispatch(Message::Request(Request::new(1, "double", Some(json!({"n": 21})))));

        let resp = expect_response(&mut rx);
        assert_eq!(resp.result, Some(json!({"doubled": 42})));
    }

    #[tokio::test]
    async fn test_deferred_handler_result_becomes_response() {
        let mut table = DispatchTable::new();
        table.register("slowly", |_params, _ctx| {
            Outcome::Deferred(Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("done"))
            }))
        });
        let (dispatcher, mut rx) = dispatcher(table);

        dispatcher.dispatch(Message::Request(Request::new(7, "slowly", None)));

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            Message::Response(resp) => {
                assert_eq!(resp.id, RequestId::Number(7));
                assert_eq!(resp.result, Some(json!("done")));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_trips_token_of_inflight_deferred_handler() {
        let mut table = DispatchTable::new();
        table.register("wait", |_params, ctx| {
            let token = ctx.token.clone();
            Outcome::Deferred(Box::pin(async move {
                token.cancelled().await;
                token.checkpoint("wait", "main loop")?;
                Ok(json!("never"))
            }))
        });
        let (dispatcher, mut rx) = dispatcher(table);

        dispatcher.dispatch(Message::Request(Request::new(3, "wait", None)));
        dispatcher.dispatch(Message::Notification(Notification::new(
            methods::CANCEL_REQUEST,
            Some(json!({"id": 3})),
        )));

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            Message::Response(resp) => {
                let err = resp.error.expect("cancelled, not a result");
                assert_eq!(err.code, -32800);
                assert_eq!(err.message, "wait cancelled (inside main loop)");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_for_finished_request_is_harmless() {
        let mut table = DispatchTable::new();
        table.register("quick", |_params, _ctx| Outcome::Sync(Ok(Value::Null)));
        let (dispatcher, mut rx) = dispatcher(table);

        dispatcher.dispatch(Message::Request(Request::new(1, "quick", None)));
        let _ = expect_response(&mut rx);

        dispatcher.dispatch(Message::Notification(Notification::new(
            methods::CANCEL_REQUEST,
            Some(json!({"id": 1})),
        )));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error_response() {
        let mut table = DispatchTable::new();
        table.register("explode", |_params, _ctx| panic!("boom"));
        let (dispatcher, mut rx) = dispatcher(table);

        dispatcher.dispatch(Message::Request(Request::new(9, "explode", None)));

        let resp = expect_response(&mut rx);
        assert_eq!(resp.error.unwrap().code, -32603);
    }

    #[test]
    fn test_module_registration_prefixes_method_names() {
        struct Probe;
        impl Module for Probe {
            fn prefix(&self) -> &'static str {
                "probe"
            }
            fn table(&self) -> DispatchTable {
                let mut table = DispatchTable::new();
                table.register("ping", |_p, _c| Outcome::Sync(Ok(Value::Null)));
                table.register("trace", |_p, _c| Outcome::Sync(Ok(Value::Null)));
                table
            }
        }

        let mut table = DispatchTable::new();
        table.register_module(&Probe);

        assert!(table.contains("probe/ping"));
        assert!(table.contains("probe/trace"));
        assert!(!table.contains("ping"));
        assert_eq!(table.method_names(), vec!["probe/ping", "probe/trace"]);
    }
}
