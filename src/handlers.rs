//! Host Feature Module
//!
//! The built-in feature set of `framelink-host`, registered under the
//! `host/` prefix: a status probe, an echo, a deferred cancellable sleep,
//! and a log sink for peers that forward their log lines. Doubles as the
//! reference for how feature modules compose into one dispatch table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::dispatch::{DispatchTable, Module, Outcome};
use crate::protocol::{LogSeverity, RpcError};

pub struct HostModule {
    started: Instant,
    served: Arc<AtomicU64>,
}

impl HostModule {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            served: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for HostModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for HostModule {
    fn prefix(&self) -> &'static str {
        "host"
    }

    fn table(&self) -> DispatchTable {
        let mut table = DispatchTable::new();

        let started = self.started;
        let served = Arc::clone(&self.served);
        table.register("status", move |_params, _ctx| {
            let count = served.fetch_add(1, Ordering::Relaxed) + 1;
            Outcome::Sync(Ok(json!({
                "pid": std::process::id(),
                "uptime_secs": started.elapsed().as_secs(),
                "served": count,
            })))
        });

        let served = Arc::clone(&self.served);
        table.register("echo", move |params, _ctx| {
            served.fetch_add(1, Ordering::Relaxed);
            Outcome::Sync(Ok(params.unwrap_or(Value::Null)))
        });

        let served = Arc::clone(&self.served);
        table.register("sleep", move |params, ctx| {
            served.fetch_add(1, Ordering::Relaxed);
            let token = ctx.token.clone();
            Outcome::Deferred(Box::pin(async move {
                let millis = params
                    .as_ref()
                    .and_then(|p| p.get("duration_ms"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| RpcError::invalid_params("duration_ms (u64) is required"))?;

                let deadline = Instant::now() + Duration::from_millis(millis);
                // The token is polled every iteration; observing the trip
                // aborts with the reserved error, never a partial result.
                while Instant::now() < deadline {
                    token.checkpoint("host/sleep", "wait loop")?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
                }

                Ok(json!({ "slept_ms": millis }))
            }))
        });

        table.register("log", |params, _ctx| {
            let params = params.unwrap_or(Value::Null);
            let message = params.get("message").and_then(Value::as_str).unwrap_or("");
            let severity = params
                .get("type")
                .cloned()
                .and_then(|v| serde_json::from_value::<LogSeverity>(v).ok())
                .unwrap_or(LogSeverity::Log);
            match severity {
                LogSeverity::Error => tracing::error!("peer: {}", message),
                LogSeverity::Warning => tracing::warn!("peer: {}", message),
                LogSeverity::Info => tracing::info!("peer: {}", message),
                LogSeverity::Log => tracing::debug!("peer: {}", message),
            }
            Outcome::Sync(Ok(Value::Null))
        });

        table
    }
}
