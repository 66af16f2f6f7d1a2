//! Live recording: acts on real peers and captures each successful action as
//! a step in the underlying composer.

use crate::composer::Composer;
use crate::composition::Composition;
use crate::errors::ConductorError;
use crate::logging::append_run_log;
use crate::matcher;
use crate::runtime::{ConnectionProvider, PeerHandle};
use crate::types::{AssertionType, MatchType};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub struct RecordingSession {
    provider: Arc<dyn ConnectionProvider>,
    composer: Composer,
    peers: BTreeMap<String, PeerHandle>,
    observed: HashMap<String, Arc<Mutex<Vec<String>>>>,
}

impl RecordingSession {
    pub fn begin(
        provider: Arc<dyn ConnectionProvider>,
        mut composer: Composer,
    ) -> Result<Self, ConductorError> {
        composer.start()?;
        Ok(Self::wrap(provider, composer))
    }

    pub fn resume(
        provider: Arc<dyn ConnectionProvider>,
        mut composer: Composer,
        composition: &Composition,
    ) -> Result<Self, ConductorError> {
        composer.start_from_existing(composition)?;
        Ok(Self::wrap(provider, composer))
    }

    fn wrap(provider: Arc<dyn ConnectionProvider>, composer: Composer) -> Self {
        Self {
            provider,
            composer,
            peers: BTreeMap::new(),
            observed: HashMap::new(),
        }
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    pub fn connect(&mut self, alias: &str, identifier: &str) -> Result<String, ConductorError> {
        if self.peers.contains_key(alias) {
            return Err(ConductorError::PeerUnavailable(format!(
                "{alias} is already connected"
            )));
        }
        let handle = self.provider.connect(identifier)?;
        let sink = Arc::clone(self.observed.entry(alias.to_string()).or_default());
        let subscribed = self.provider.on_message(
            &handle,
            Arc::new(move |raw: String| {
                if let Ok(mut seen) = sink.lock() {
                    seen.push(raw);
                }
            }),
        );
        if let Err(err) = subscribed {
            let _ = self.provider.disconnect(&handle);
            return Err(err);
        }
        self.peers.insert(alias.to_string(), handle);
        captured(self.composer.capture_connect(alias, identifier))
    }

    pub fn send(
        &mut self,
        alias: &str,
        xml: &str,
        generated_ids: BTreeMap<String, String>,
    ) -> Result<String, ConductorError> {
        let handle = self.peers.get(alias).ok_or_else(|| {
            ConductorError::SendFailed(format!("{alias} is not connected"))
        })?;
        matcher::check_well_formed(xml).map_err(ConductorError::SendFailed)?;
        self.provider.send(handle, xml)?;
        captured(self.composer.capture_send(alias, xml, generated_ids))
    }

    pub fn disconnect(&mut self, alias: &str) -> Result<String, ConductorError> {
        let handle = self.peers.get(alias).cloned().ok_or_else(|| {
            ConductorError::PeerUnavailable(format!("{alias} is not connected"))
        })?;
        self.provider.disconnect(&handle)?;
        self.peers.remove(alias);
        captured(self.composer.capture_disconnect(alias))
    }

    pub fn cue(
        &mut self,
        alias: &str,
        match_type: MatchType,
        expression: &str,
        timeout_ms: u64,
    ) -> Result<String, ConductorError> {
        captured(
            self.composer
                .add_cue(alias, match_type, expression, timeout_ms),
        )
    }

    pub fn assert(
        &mut self,
        alias: &str,
        assertion_type: AssertionType,
        expression: &str,
        expected: Option<&str>,
    ) -> Result<String, ConductorError> {
        captured(
            self.composer
                .add_assertion(alias, assertion_type, expression, expected),
        )
    }

    /// Messages received on `alias` since it was first connected.
    pub fn observed(&self, alias: &str) -> Vec<String> {
        self.observed
            .get(alias)
            .and_then(|seen| seen.lock().ok().map(|seen| seen.clone()))
            .unwrap_or_default()
    }

    /// Disconnect live peers and produce the composition, if any step was
    /// recorded.
    pub fn finish(mut self) -> Option<Composition> {
        self.release_peers();
        self.composer.stop()
    }

    pub fn abandon(mut self) {
        self.release_peers();
        self.composer.cancel();
    }

    fn release_peers(&mut self) {
        for (alias, handle) in std::mem::take(&mut self.peers) {
            if let Err(err) = self.provider.disconnect(&handle) {
                append_run_log(
                    "warn",
                    "recorder.peer.disconnect_failed",
                    json!({ "alias": alias, "error": err.to_string() }),
                );
            }
        }
    }
}

fn captured(step_id: Option<String>) -> Result<String, ConductorError> {
    step_id.ok_or_else(|| {
        ConductorError::InvalidComposition("recording session is closed".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComposerConfig;
    use crate::runtime::{FakeClock, FakeConnectionProvider, ScriptedMessage};
    use std::time::{Duration, Instant};

    fn session(fake: &FakeConnectionProvider) -> RecordingSession {
        let composer = Composer::new(Arc::new(FakeClock::default()), ComposerConfig::default());
        RecordingSession::begin(Arc::new(fake.clone()), composer).expect("begin")
    }

    #[test]
    fn live_actions_are_captured_only_when_they_succeed() {
        let fake = FakeConnectionProvider::default();
        fake.fail_send("alice@example.com", "stream closed");
        let mut recording = session(&fake);
        recording
            .connect("alice", "alice@example.com")
            .expect("connect");
        assert!(recording.send("alice", "<iq/>", BTreeMap::new()).is_err());
        assert!(recording.send("alice", "<iq>", BTreeMap::new()).is_err());
        recording
            .cue("alice", MatchType::Contains, "pong", 1_000)
            .expect("cue");

        let composition = recording.finish().expect("composition");
        let kinds = composition
            .steps
            .iter()
            .map(|step| step.action.kind())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["connect", "cue"]);
        assert_eq!(fake.disconnects(), vec!["alice@example.com".to_string()]);
    }

    #[test]
    fn inbound_traffic_is_observable_while_recording() {
        let fake = FakeConnectionProvider::default();
        fake.reply_on_send(
            "alice@example.com",
            "ping",
            "alice@example.com",
            vec![ScriptedMessage::after_ms(0, "<iq type='result'>pong</iq>")],
        );
        let mut recording = session(&fake);
        recording
            .connect("alice", "alice@example.com")
            .expect("connect");
        recording
            .send("alice", "<iq><ping/></iq>", BTreeMap::new())
            .expect("send");

        let started = Instant::now();
        while recording.observed("alice").is_empty() && started.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            recording.observed("alice"),
            vec!["<iq type='result'>pong</iq>".to_string()]
        );
        recording.abandon();
        assert_eq!(fake.live_connections(), 0);
    }
}
