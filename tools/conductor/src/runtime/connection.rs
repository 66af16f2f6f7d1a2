//! The connection provider seam: how the engine reaches live protocol peers.
//!
//! The engine never talks to a socket directly. It asks a `ConnectionProvider`
//! to connect an account identifier, send raw frames on the returned handle and
//! deliver inbound frames to a callback. Deliveries happen on the provider's own
//! threads, concurrently with whatever step the performer is executing.

use crate::errors::ConductorError;
use crate::types::PeerStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Callback invoked once per inbound raw message.
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub id: u64,
    pub identifier: String,
}

pub trait ConnectionProvider: Send + Sync {
    fn connect(&self, identifier: &str) -> Result<PeerHandle, ConductorError>;
    fn disconnect(&self, handle: &PeerHandle) -> Result<(), ConductorError>;
    fn send(&self, handle: &PeerHandle, raw: &str) -> Result<(), ConductorError>;
    /// Register the inbound callback for `handle`. Frames received before
    /// registration are delivered on registration.
    fn on_message(&self, handle: &PeerHandle, callback: MessageCallback)
        -> Result<(), ConductorError>;
    fn status(&self, handle: &PeerHandle) -> PeerStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedMessage {
    pub delay: Duration,
    pub raw: String,
}

impl ScriptedMessage {
    pub fn after_ms(delay_ms: u64, raw: impl Into<String>) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct ReplyRule {
    from: String,
    trigger: String,
    to: String,
    messages: Vec<ScriptedMessage>,
}

struct FakeConnection {
    identifier: String,
    status: PeerStatus,
    callback: Option<MessageCallback>,
    pending: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    live: HashMap<u64, FakeConnection>,
    connect_failures: HashMap<String, String>,
    send_failures: HashMap<String, String>,
    on_connect: HashMap<String, Vec<ScriptedMessage>>,
    replies: Vec<ReplyRule>,
    connects: Vec<String>,
    disconnects: Vec<String>,
    sends: Vec<(String, String)>,
}

/// Scriptable in-memory peer network.
#[derive(Default, Clone)]
pub struct FakeConnectionProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnectionProvider {
    pub fn fail_connect(&self, identifier: &str, message: &str) {
        self.with_state(|state| {
            state
                .connect_failures
                .insert(identifier.to_string(), message.to_string());
        });
    }

    pub fn fail_send(&self, identifier: &str, message: &str) {
        self.with_state(|state| {
            state
                .send_failures
                .insert(identifier.to_string(), message.to_string());
        });
    }

    /// Messages delivered to `identifier` after each successful connect.
    pub fn script_on_connect(&self, identifier: &str, messages: Vec<ScriptedMessage>) {
        self.with_state(|state| {
            state
                .on_connect
                .entry(identifier.to_string())
                .or_default()
                .extend(messages);
        });
    }

    /// When `from` sends a frame containing `trigger`, deliver `messages` to `to`.
    pub fn reply_on_send(
        &self,
        from: &str,
        trigger: &str,
        to: &str,
        messages: Vec<ScriptedMessage>,
    ) {
        self.with_state(|state| {
            state.replies.push(ReplyRule {
                from: from.to_string(),
                trigger: trigger.to_string(),
                to: to.to_string(),
                messages,
            });
        });
    }

    /// Deliver `raw` right now to every live connection of `identifier`.
    pub fn push_inbound(&self, identifier: &str, raw: &str) {
        let handles = self.live_handles_for(identifier);
        for handle_id in handles {
            deliver(&self.state, handle_id, raw.to_string());
        }
    }

    /// Deliver `raw` to every live connection of `identifier` after `delay`.
    pub fn schedule_inbound(&self, identifier: &str, message: ScriptedMessage) {
        for handle_id in self.live_handles_for(identifier) {
            deliver_later(Arc::clone(&self.state), handle_id, message.clone());
        }
    }

    pub fn connects(&self) -> Vec<String> {
        self.read_state(|state| state.connects.clone())
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.read_state(|state| state.disconnects.clone())
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.read_state(|state| state.sends.clone())
    }

    pub fn live_connections(&self) -> usize {
        self.read_state(|state| {
            state
                .live
                .values()
                .filter(|conn| conn.status == PeerStatus::Connected)
                .count()
        })
    }

    fn live_handles_for(&self, identifier: &str) -> Vec<u64> {
        self.read_state(|state| {
            let mut ids = state
                .live
                .iter()
                .filter(|(_, conn)| {
                    conn.identifier == identifier && conn.status == PeerStatus::Connected
                })
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.sort_unstable();
            ids
        })
    }

    fn with_state(&self, apply: impl FnOnce(&mut FakeState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    fn read_state<T: Default>(&self, read: impl FnOnce(&FakeState) -> T) -> T {
        self.state
            .lock()
            .map(|state| read(&state))
            .unwrap_or_default()
    }
}

fn deliver(state: &Arc<Mutex<FakeState>>, handle_id: u64, raw: String) {
    let callback = {
        let Ok(mut guard) = state.lock() else {
            return;
        };
        let Some(conn) = guard.live.get_mut(&handle_id) else {
            return;
        };
        if conn.status != PeerStatus::Connected {
            return;
        }
        match &conn.callback {
            Some(callback) => Arc::clone(callback),
            None => {
                conn.pending.push(raw);
                return;
            }
        }
    };
    callback(raw);
}

fn deliver_later(state: Arc<Mutex<FakeState>>, handle_id: u64, message: ScriptedMessage) {
    thread::spawn(move || {
        thread::sleep(message.delay);
        deliver(&state, handle_id, message.raw);
    });
}

impl ConnectionProvider for FakeConnectionProvider {
    fn connect(&self, identifier: &str) -> Result<PeerHandle, ConductorError> {
        let (handle, scripted) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ConductorError::PeerUnavailable("fake lock poisoned".to_string()))?;
            if let Some(message) = state.connect_failures.get(identifier) {
                return Err(ConductorError::PeerUnavailable(format!(
                    "{identifier}: {message}"
                )));
            }
            state.next_handle += 1;
            let handle = PeerHandle {
                id: state.next_handle,
                identifier: identifier.to_string(),
            };
            state.live.insert(
                handle.id,
                FakeConnection {
                    identifier: identifier.to_string(),
                    status: PeerStatus::Connected,
                    callback: None,
                    pending: Vec::new(),
                },
            );
            state.connects.push(identifier.to_string());
            let scripted = state.on_connect.get(identifier).cloned().unwrap_or_default();
            (handle, scripted)
        };
        for message in scripted {
            deliver_later(Arc::clone(&self.state), handle.id, message);
        }
        Ok(handle)
    }

    fn disconnect(&self, handle: &PeerHandle) -> Result<(), ConductorError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConductorError::PeerUnavailable("fake lock poisoned".to_string()))?;
        let conn = state.live.get_mut(&handle.id).ok_or_else(|| {
            ConductorError::PeerUnavailable(format!("unknown handle {}", handle.id))
        })?;
        conn.status = PeerStatus::Disconnected;
        conn.callback = None;
        state.disconnects.push(handle.identifier.clone());
        Ok(())
    }

    fn send(&self, handle: &PeerHandle, raw: &str) -> Result<(), ConductorError> {
        let triggered = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ConductorError::SendFailed("fake lock poisoned".to_string()))?;
            let connected = state
                .live
                .get(&handle.id)
                .is_some_and(|conn| conn.status == PeerStatus::Connected);
            if !connected {
                return Err(ConductorError::SendFailed(format!(
                    "{} is not connected",
                    handle.identifier
                )));
            }
            if let Some(message) = state.send_failures.get(&handle.identifier) {
                return Err(ConductorError::SendFailed(message.clone()));
            }
            state
                .sends
                .push((handle.identifier.clone(), raw.to_string()));
            state
                .replies
                .iter()
                .filter(|rule| rule.from == handle.identifier && raw.contains(&rule.trigger))
                .cloned()
                .collect::<Vec<_>>()
        };
        for rule in triggered {
            for message in rule.messages {
                self.schedule_inbound(&rule.to, message);
            }
        }
        Ok(())
    }

    fn on_message(
        &self,
        handle: &PeerHandle,
        callback: MessageCallback,
    ) -> Result<(), ConductorError> {
        let pending = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ConductorError::PeerUnavailable("fake lock poisoned".to_string()))?;
            let conn = state.live.get_mut(&handle.id).ok_or_else(|| {
                ConductorError::PeerUnavailable(format!("unknown handle {}", handle.id))
            })?;
            conn.callback = Some(Arc::clone(&callback));
            std::mem::take(&mut conn.pending)
        };
        for raw in pending {
            callback(raw);
        }
        Ok(())
    }

    fn status(&self, handle: &PeerHandle) -> PeerStatus {
        self.read_state(|state| {
            state
                .live
                .get(&handle.id)
                .map(|conn| conn.status)
                .unwrap_or(PeerStatus::Disconnected)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn frames_received_before_subscription_are_flushed_on_subscribe() {
        let fake = FakeConnectionProvider::default();
        let handle = fake.connect("alice@example.com").expect("connect");
        fake.push_inbound("alice@example.com", "<presence/>");

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        fake.on_message(
            &handle,
            Arc::new(move |raw| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(raw);
                }
            }),
        )
        .expect("subscribe");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).expect("flushed"),
            "<presence/>"
        );
    }

    #[test]
    fn reply_rules_fire_on_matching_sends_only() {
        let fake = FakeConnectionProvider::default();
        fake.reply_on_send(
            "alice",
            "ping",
            "alice",
            vec![ScriptedMessage::after_ms(0, "<iq type='result'>pong</iq>")],
        );
        let handle = fake.connect("alice").expect("connect");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        fake.on_message(
            &handle,
            Arc::new(move |raw| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(raw);
                }
            }),
        )
        .expect("subscribe");

        fake.send(&handle, "<message>hello</message>").expect("send");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        fake.send(&handle, "<iq>ping</iq>").expect("send");
        assert!(rx
            .recv_timeout(Duration::from_secs(1))
            .expect("reply")
            .contains("pong"));
        assert_eq!(fake.sends().len(), 2);
    }

    #[test]
    fn sends_after_disconnect_fail() {
        let fake = FakeConnectionProvider::default();
        let handle = fake.connect("bob").expect("connect");
        fake.disconnect(&handle).expect("disconnect");
        assert_eq!(fake.status(&handle), PeerStatus::Disconnected);
        let err = fake.send(&handle, "<message/>").expect_err("must fail");
        assert!(matches!(err, ConductorError::SendFailed(_)));
        assert_eq!(fake.disconnects(), vec!["bob".to_string()]);
    }

    #[test]
    fn injected_connect_failures_surface_as_peer_unavailable() {
        let fake = FakeConnectionProvider::default();
        fake.fail_connect("carol", "auth rejected");
        let err = fake.connect("carol").expect_err("must fail");
        assert_eq!(err.to_string(), "peer unavailable: carol: auth rejected");
    }
}
