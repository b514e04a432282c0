//! Endpoint
//!
//! The bidirectional facade of one connection: fire-and-forget
//! notifications, correlated requests with timeouts, and structural
//! pattern waits, all built on the matcher registry and the single
//! outbound writer queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout;

use crate::cancel::CancelToken;
use crate::connection::OutboundSender;
use crate::error::EndpointError;
use crate::matcher::{MatchWait, MatcherRegistry, MessagePattern};
use crate::protocol::{Message, Notification, Request, methods};

/// Label used in error phases for pattern waits, which have no method name.
const PATTERN_WAIT: &str = "<pattern wait>";

pub struct Endpoint {
    registry: Arc<MatcherRegistry>,
    outbound: OutboundSender,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl Endpoint {
    pub(crate) fn new(
        registry: Arc<MatcherRegistry>,
        outbound: OutboundSender,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            outbound,
            // Ids are monotonic per connection and never reused while a
            // matcher might still reference them.
            next_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    /// Enqueue a fire-and-forget notification; no matcher is created.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EndpointError> {
        self.outbound
            .send(Message::Notification(Notification::new(method, params)))
            .map_err(|_| EndpointError::WriteFailed {
                method: method.to_string(),
            })
    }

    /// Send a request and await its response, bounded by the connection's
    /// default timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, EndpointError> {
        self.request_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Send a request and await its response, bounded by `limit`.
    ///
    /// A local timeout never cancels the remote handler and never removes
    /// server-side state; the matcher is unregistered, so a late response
    /// is simply dropped.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value, EndpointError> {
        let (id, wait) = self.send_request(method, params)?;

        match timeout(limit, wait).await {
            Ok(delivery) => resolve(method, delivery),
            Err(_) => {
                self.registry.unregister_id(id);
                Err(EndpointError::Timeout {
                    method: method.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// Like `request_with_timeout`, but when `cancel` trips, a
    /// `$/cancelRequest` referencing this request's id is forwarded to the
    /// peer and the call keeps waiting for the (typically -32800) response
    /// the cancelled handler produces at its next poll point.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
        cancel: CancelToken,
    ) -> Result<Value, EndpointError> {
        let (id, mut wait) = self.send_request(method, params)?;

        tokio::select! {
            delivery = &mut wait => resolve(method, delivery),
            _ = cancel.cancelled() => {
                let _ = self.notify(
                    methods::CANCEL_REQUEST,
                    Some(serde_json::json!({ "id": id })),
                );
                match timeout(limit, &mut wait).await {
                    Ok(delivery) => resolve(method, delivery),
                    Err(_) => {
                        self.registry.unregister_id(id);
                        Err(EndpointError::Timeout {
                            method: method.to_string(),
                            timeout: limit,
                        })
                    }
                }
            }
            _ = tokio::time::sleep(limit) => {
                self.registry.unregister_id(id);
                Err(EndpointError::Timeout {
                    method: method.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// Request with the response deserialized into `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, EndpointError> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| EndpointError::Protocol(e.to_string()))
    }

    /// Wait for the next inbound message matching `pattern`. The matcher
    /// stays registered until it matches or the connection closes.
    pub async fn wait_for(&self, pattern: MessagePattern) -> Result<Message, EndpointError> {
        let Some((_token, wait)) = self.registry.obtain_pattern_matcher(pattern) else {
            return Err(EndpointError::Closed {
                method: PATTERN_WAIT.to_string(),
            });
        };
        match wait.await {
            Ok(Some(message)) => Ok(message),
            Ok(None) | Err(_) => Err(EndpointError::Closed {
                method: PATTERN_WAIT.to_string(),
            }),
        }
    }

    /// Pattern wait bounded by `limit`; the matcher is unregistered on
    /// expiry.
    pub async fn wait_for_with_timeout(
        &self,
        pattern: MessagePattern,
        limit: Duration,
    ) -> Result<Message, EndpointError> {
        let Some((token, wait)) = self.registry.obtain_pattern_matcher(pattern) else {
            return Err(EndpointError::Closed {
                method: PATTERN_WAIT.to_string(),
            });
        };
        match timeout(limit, wait).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(_) => Err(EndpointError::Closed {
                method: PATTERN_WAIT.to_string(),
            }),
            Err(_) => {
                self.registry.unregister_pattern(token);
                Err(EndpointError::Timeout {
                    method: PATTERN_WAIT.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.is_finished()
    }

    fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(u64, MatchWait), EndpointError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let Some(wait) = self.registry.obtain_id_matcher(id) else {
            return Err(EndpointError::Closed {
                method: method.to_string(),
            });
        };

        let request = Request::new(id, method, params);
        tracing::trace!("request {}: {}", id, method);

        if self.outbound.send(Message::Request(request)).is_err() {
            self.registry.unregister_id(id);
            return Err(EndpointError::WriteFailed {
                method: method.to_string(),
            });
        }

        Ok((id, wait))
    }
}

fn resolve(
    method: &str,
    delivery: Result<Option<Message>, tokio::sync::oneshot::error::RecvError>,
) -> Result<Value, EndpointError> {
    match delivery {
        Ok(Some(Message::Response(response))) => {
            response.into_result().map_err(EndpointError::from)
        }
        Ok(Some(other)) => Err(EndpointError::Protocol(format!(
            "id matcher for '{}' delivered a non-response message ({:?})",
            method,
            other.method()
        ))),
        // Null sentinel: the registry flushed on stream close.
        Ok(None) | Err(_) => Err(EndpointError::Closed {
            method: method.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestId, Response};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn endpoint() -> (Arc<Endpoint>, Arc<MatcherRegistry>, mpsc::UnboundedReceiver<Message>) {
        let registry = Arc::new(MatcherRegistry::new());
        let (outbound, rx) = OutboundSender::channel();
        let endpoint = Arc::new(Endpoint::new(
            Arc::clone(&registry),
            outbound,
            Duration::from_secs(5),
        ));
        (endpoint, registry, rx)
    }

    #[tokio::test]
    async fn test_request_resolves_with_its_response() {
        let (endpoint, registry, mut rx) = endpoint();

        let call = tokio::spawn({
            let endpoint = Arc::clone(&endpoint);
            async move { endpoint.request("ping", None).await }
        });

        // The request reaches the outbound queue with id 1.
        let sent = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let id = sent.id().unwrap().clone();
        assert_eq!(id, RequestId::Number(1));

        registry.on_message(&Message::Response(Response::success(id, json!({"pong": true}))));

        let value = call.await.unwrap().unwrap();
        assert_eq!(value, json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic() {
        let (endpoint, registry, mut rx) = endpoint();

        for expected in 1..=3u64 {
            let call = tokio::spawn({
                let endpoint = Arc::clone(&endpoint);
                async move { endpoint.request("ping", None).await }
            });
            let sent = rx.recv().await.unwrap();
            assert_eq!(sent.id().unwrap().as_number(), Some(expected));
            registry.on_message(&Message::Response(Response::success(
                RequestId::Number(expected),
                json!(null),
            )));
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_write_failed_when_queue_is_gone() {
        let (endpoint, _registry, rx) = endpoint();
        drop(rx);

        let err = endpoint.request("ping", None).await.unwrap_err();
        assert!(matches!(err, EndpointError::WriteFailed { .. }));
    }

    #[tokio::test]
    async fn test_closed_when_registry_already_finished() {
        let (endpoint, registry, _rx) = endpoint();
        registry.finish();

        let err = endpoint.request("ping", None).await.unwrap_err();
        assert!(matches!(err, EndpointError::Closed { .. }));
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_timeout_unregisters_matcher_and_drops_late_response() {
        let (endpoint, registry, _rx) = endpoint();

        let err = endpoint
            .request_with_timeout("slow", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Timeout { .. }));

        // The late response finds no matcher.
        let late = Message::Response(Response::success(RequestId::Number(1), json!(null)));
        assert!(!registry.on_message(&late));
    }

    #[tokio::test]
    async fn test_error_response_surfaces_as_rpc_error() {
        let (endpoint, registry, mut rx) = endpoint();

        let call = tokio::spawn({
            let endpoint = Arc::clone(&endpoint);
            async move { endpoint.request("nope", None).await }
        });
        let sent = rx.recv().await.unwrap();
        let id = sent.id().unwrap().clone();
        registry.on_message(&Message::Response(Response::error(
            id,
            crate::protocol::RpcError::method_not_found("nope"),
        )));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), -32601);
    }

    #[tokio::test]
    async fn test_cancel_forwards_cancel_request_to_peer() {
        let (endpoint, registry, mut rx) = endpoint();
        let cancel = CancelToken::new();

        let call = tokio::spawn({
            let endpoint = Arc::clone(&endpoint);
            let cancel = cancel.clone();
            async move {
                endpoint
                    .request_with_cancel("host/sleep", None, Duration::from_secs(5), cancel)
                    .await
            }
        });

        let sent = rx.recv().await.unwrap();
        let id = sent.id().unwrap().clone();

        cancel.cancel();

        // The endpoint forwards $/cancelRequest for the same id.
        let forwarded = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.method(), Some(methods::CANCEL_REQUEST));

        // The peer answers with the reserved cancellation error.
        registry.on_message(&Message::Response(Response::error(
            id,
            crate::protocol::RpcError::cancelled("host/sleep", "wait loop"),
        )));

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_matches_notification_pattern() {
        let (endpoint, registry, _rx) = endpoint();

        let call = tokio::spawn({
            let endpoint = Arc::clone(&endpoint);
            async move {
                endpoint
                    .wait_for_with_timeout(
                        MessagePattern::new().field("method", "host/event"),
                        Duration::from_secs(5),
                    )
                    .await
            }
        });

        // Let the waiter register before the event arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.on_message(&Message::Notification(Notification::new(
            "host/event",
            Some(json!({"kind": "end"})),
        )));

        let message = call.await.unwrap().unwrap();
        assert_eq!(message.method(), Some("host/event"));
    }

    #[tokio::test]
    async fn test_notify_creates_no_matcher() {
        let (endpoint, registry, mut rx) = endpoint();

        endpoint.notify("host/log", Some(json!({"message": "hi"}))).unwrap();
        let sent = rx.recv().await.unwrap();
        assert!(sent.id().is_none());

        // Nothing pending: finishing flushes zero matchers and a stray
        // response is unclaimed.
        registry.finish();
        assert!(!registry.on_message(&Message::Response(Response::success(
            RequestId::Number(1),
            json!(null)
        ))));
    }
}
