//! Per-performance ownership of peer connections and their inbound buffers.
//!
//! Each connected alias gets an append-only queue that the provider's delivery
//! threads write into from the moment the connection is established. The
//! performer drains those queues synchronously when it reaches a cue, so
//! traffic for one alias is never lost while a step for another alias runs.

use crate::composition::AccountReference;
use crate::errors::ConductorError;
use crate::logging::append_run_log;
use crate::matcher::Rule;
use crate::runtime::{ConnectionProvider, MessageCallback, PeerHandle};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Generation counter bumped on every inbound delivery and on cancellation.
#[derive(Debug, Default)]
pub struct Wakeup {
    generation: Mutex<u64>,
    signal: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.lock().map(|g| *g).unwrap_or(0)
    }

    pub fn notify(&self) {
        if let Ok(mut generation) = self.generation.lock() {
            *generation = generation.wrapping_add(1);
        }
        self.signal.notify_all();
    }

    /// Block until the generation moves past `seen` or `timeout` elapses.
    pub fn wait_past(&self, seen: u64, timeout: Duration) {
        let Ok(guard) = self.generation.lock() else {
            return;
        };
        let _ = self
            .signal
            .wait_timeout_while(guard, timeout, |generation| *generation == seen);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub seq: u64,
    pub raw: String,
    pub consumed: bool,
}

#[derive(Debug, Default)]
struct AliasQueue {
    next_seq: u64,
    /// One past the last cue match; later cues never look behind it.
    cue_cursor: u64,
    messages: Vec<InboundMessage>,
    last_observed: Option<String>,
}

impl AliasQueue {
    fn push(&mut self, raw: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push(InboundMessage {
            seq,
            raw,
            consumed: false,
        });
    }
}

/// Outcome of one pass over an alias queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub matched: Option<String>,
    /// First sequence number not yet examined by this pass.
    pub next_seq: u64,
}

pub struct PeerSessionRegistry {
    provider: Arc<dyn ConnectionProvider>,
    identifiers: HashMap<String, String>,
    handles: BTreeMap<String, PeerHandle>,
    queues: HashMap<String, Arc<Mutex<AliasQueue>>>,
    wakeup: Arc<Wakeup>,
}

impl PeerSessionRegistry {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        accounts: &[AccountReference],
        wakeup: Arc<Wakeup>,
    ) -> Self {
        Self {
            provider,
            identifiers: accounts
                .iter()
                .map(|account| (account.alias.clone(), account.identifier.clone()))
                .collect(),
            handles: BTreeMap::new(),
            queues: HashMap::new(),
            wakeup,
        }
    }

    pub fn wakeup(&self) -> Arc<Wakeup> {
        Arc::clone(&self.wakeup)
    }

    pub fn is_connected(&self, alias: &str) -> bool {
        self.handles.contains_key(alias)
    }

    pub fn connected_aliases(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn ensure_connected(&mut self, alias: &str) -> Result<PeerHandle, ConductorError> {
        if let Some(handle) = self.handles.get(alias) {
            return Ok(handle.clone());
        }
        let identifier = self
            .identifiers
            .get(alias)
            .filter(|identifier| !identifier.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                ConductorError::PeerUnavailable(format!("alias {alias} has no identifier"))
            })?;

        let handle = self.provider.connect(&identifier)?;
        let callback = self.delivery_callback(alias);
        if let Err(err) = self.provider.on_message(&handle, callback) {
            let _ = self.provider.disconnect(&handle);
            return Err(err);
        }
        append_run_log(
            "info",
            "registry.peer.connected",
            json!({
                "alias": alias,
                "identifier": identifier,
                "handle": handle.id,
            }),
        );
        self.handles.insert(alias.to_string(), handle.clone());
        Ok(handle)
    }

    /// Tear down `alias`'s connection. Disconnecting an alias that is not
    /// connected is a no-op.
    pub fn disconnect(&mut self, alias: &str) -> Result<(), ConductorError> {
        let Some(handle) = self.handles.remove(alias) else {
            append_run_log(
                "debug",
                "registry.peer.disconnect_skipped",
                json!({ "alias": alias }),
            );
            return Ok(());
        };
        let result = self.provider.disconnect(&handle);
        append_run_log(
            if result.is_ok() { "info" } else { "warn" },
            "registry.peer.disconnected",
            json!({
                "alias": alias,
                "handle": handle.id,
                "error": result.as_ref().err().map(ToString::to_string),
            }),
        );
        result
    }

    pub fn send(&mut self, alias: &str, raw: &str) -> Result<(), ConductorError> {
        let handle = self.ensure_connected(alias)?;
        self.provider.send(&handle, raw)
    }

    /// Snapshot of everything received on `alias` so far.
    pub fn inbound(&self, alias: &str) -> Vec<InboundMessage> {
        self.queues
            .get(alias)
            .and_then(|queue| queue.lock().ok().map(|q| q.messages.clone()))
            .unwrap_or_default()
    }

    /// Examine unconsumed messages in arrival order, starting at `from_seq` or
    /// the alias's cue cursor, whichever is later. The first one satisfying
    /// `rule` is consumed, moves the cursor past it and becomes the alias's
    /// last observed message.
    pub fn scan(&self, alias: &str, rule: &Rule, from_seq: u64) -> Result<Scan, ConductorError> {
        let Some(queue) = self.queues.get(alias) else {
            return Ok(Scan {
                matched: None,
                next_seq: from_seq,
            });
        };
        let mut queue = queue
            .lock()
            .map_err(|_| ConductorError::MatchEvaluation("inbound queue poisoned".to_string()))?;
        let next_seq = queue.next_seq;
        let start = from_seq.max(queue.cue_cursor);
        let mut hit = None;
        for (index, message) in queue.messages.iter().enumerate() {
            if message.consumed || message.seq < start {
                continue;
            }
            if rule.matches(&message.raw)? {
                hit = Some(index);
                break;
            }
        }
        let Some(index) = hit else {
            return Ok(Scan {
                matched: None,
                next_seq,
            });
        };
        let message = &mut queue.messages[index];
        message.consumed = true;
        let raw = message.raw.clone();
        let seq = message.seq;
        queue.cue_cursor = seq + 1;
        queue.last_observed = Some(raw.clone());
        Ok(Scan {
            matched: Some(raw),
            next_seq: seq + 1,
        })
    }

    /// The message an assertion for `alias` evaluates: the last cue match, or
    /// the most recent inbound message when no cue has matched yet.
    pub fn last_observed(&self, alias: &str) -> Option<String> {
        let queue = self.queues.get(alias)?.lock().ok()?;
        queue
            .last_observed
            .clone()
            .or_else(|| queue.messages.last().map(|message| message.raw.clone()))
    }

    /// Disconnect every alias still connected. Returns the aliases torn down.
    pub fn teardown(&mut self) -> Vec<String> {
        let aliases = self.connected_aliases();
        for alias in &aliases {
            let _ = self.disconnect(alias);
        }
        aliases
    }

    fn delivery_callback(&mut self, alias: &str) -> MessageCallback {
        let queue = Arc::clone(self.queues.entry(alias.to_string()).or_default());
        let wakeup = Arc::clone(&self.wakeup);
        Arc::new(move |raw: String| {
            if let Ok(mut queue) = queue.lock() {
                queue.push(raw);
            }
            wakeup.notify();
        })
    }
}

impl Drop for PeerSessionRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}
