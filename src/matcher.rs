//! Matcher Registry
//!
//! Correlates inbound messages to outstanding local waiters, either by
//! request id or by a structural field pattern. Every matcher leaves the
//! table exactly once: on match, on the stream-close flush, or by explicit
//! unregister. Waiters are notified outside the table lock so a callback
//! re-entering the registry can never deadlock it.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::Message;

/// A field→value predicate over the serialized message object.
/// All named fields must be present and equal for the pattern to match.
#[derive(Debug, Clone, Default)]
pub struct MessagePattern {
    fields: BTreeMap<String, Value>,
}

impl MessagePattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    fn matches(&self, message: &Value) -> bool {
        self.fields
            .iter()
            .all(|(name, expected)| message.get(name) == Some(expected))
    }
}

/// Wait handle delivered `Some(message)` on match, `None` when the
/// connection closed first (the null sentinel).
pub type MatchWait = oneshot::Receiver<Option<Message>>;

type MatchSender = oneshot::Sender<Option<Message>>;

#[derive(Default)]
struct PendingTable {
    // Ids are allocated monotonically, so a BTreeMap keeps insertion order.
    by_id: BTreeMap<u64, MatchSender>,
    patterns: Vec<(u64, MessagePattern, MatchSender)>,
    next_token: u64,
    finished: bool,
}

/// Per-connection registry of outstanding waiters.
pub struct MatcherRegistry {
    inner: Mutex<PendingTable>,
}

impl Default for MatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PendingTable::default()),
        }
    }

    /// Register a waiter for the response bearing `id`.
    ///
    /// Returns `None` when the registry already finished (connection
    /// closed), signaling the caller to fail fast instead of waiting.
    pub fn obtain_id_matcher(&self, id: u64) -> Option<MatchWait> {
        let mut table = self.lock();
        if table.finished {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let replaced = table.by_id.insert(id, tx);
        debug_assert!(replaced.is_none(), "request id {} reused while pending", id);
        Some(rx)
    }

    /// Register a waiter for the next message matching `pattern`.
    ///
    /// Returns the matcher token (for `unregister_pattern`) and the wait
    /// handle, or `None` when the registry already finished. A pattern that
    /// never matches is only reclaimed by the stream-close flush.
    pub fn obtain_pattern_matcher(&self, pattern: MessagePattern) -> Option<(u64, MatchWait)> {
        let mut table = self.lock();
        if table.finished {
            return None;
        }
        let token = table.next_token;
        table.next_token += 1;
        let (tx, rx) = oneshot::channel();
        table.patterns.push((token, pattern, tx));
        Some((token, rx))
    }

    /// Remove an id matcher without notifying it (local timeout path).
    pub fn unregister_id(&self, id: u64) -> bool {
        self.lock().by_id.remove(&id).is_some()
    }

    /// Remove a pattern matcher without notifying it.
    pub fn unregister_pattern(&self, token: u64) -> bool {
        let mut table = self.lock();
        let before = table.patterns.len();
        table.patterns.retain(|(t, _, _)| *t != token);
        table.patterns.len() != before
    }

    /// Route one inbound message to its waiters.
    ///
    /// Pattern matchers are tested first, in insertion order; every match
    /// is removed and notified (several patterns may match one message).
    /// Then, if the message carries an id, the id matcher for that id is
    /// popped and notified. One message can satisfy a pattern matcher and
    /// an id matcher at once; both see it.
    ///
    /// Returns whether an id matcher claimed the message.
    pub fn on_message(&self, message: &Message) -> bool {
        let mut pattern_hits: Vec<MatchSender> = Vec::new();
        let mut id_hit: Option<MatchSender> = None;

        {
            let mut table = self.lock();

            if !table.patterns.is_empty() {
                let as_value = serde_json::to_value(message).unwrap_or(Value::Null);
                let mut index = 0;
                while index < table.patterns.len() {
                    if table.patterns[index].1.matches(&as_value) {
                        pattern_hits.push(table.patterns.remove(index).2);
                    } else {
                        index += 1;
                    }
                }
            }

            if let Some(key) = message.id().and_then(|id| id.as_number()) {
                id_hit = table.by_id.remove(&key);
            }
        }

        for tx in pattern_hits {
            let _ = tx.send(Some(message.clone()));
        }

        match id_hit {
            Some(tx) => {
                let _ = tx.send(Some(message.clone()));
                true
            }
            None => false,
        }
    }

    /// Terminal flush: notify every still-registered matcher with the null
    /// payload exactly once, then refuse further registrations. Blocked
    /// waiters always unblock; this is mandatory, not best-effort.
    pub fn finish(&self) {
        let (ids, patterns) = {
            let mut table = self.lock();
            if table.finished {
                return;
            }
            table.finished = true;
            let ids: Vec<MatchSender> = std::mem::take(&mut table.by_id).into_values().collect();
            let patterns: Vec<MatchSender> = std::mem::take(&mut table.patterns)
                .into_iter()
                .map(|(_, _, tx)| tx)
                .collect();
            (ids, patterns)
        };

        let flushed = ids.len() + patterns.len();
        if flushed > 0 {
            tracing::debug!("flushing {} pending matchers on close", flushed);
        }

        for tx in ids.into_iter().chain(patterns) {
            let _ = tx.send(None);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
