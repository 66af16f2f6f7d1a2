use conductor::composer::Composer;
use conductor::config::{ComposerConfig, PerformerConfig};
use conductor::performer::{CancelToken, Performer};
use conductor::recorder::RecordingSession;
use conductor::runtime::{FakeClock, FakeConnectionProvider, ProductionClock, ScriptedMessage};
use conductor::store::{ConductorStore, Repository};
use conductor::types::{AssertionType, MatchType, PerformanceStatus};
use std::collections::BTreeMap;
use std::sync::Arc;

const ALICE: &str = "alice@example.com";

fn ping_network() -> FakeConnectionProvider {
    let fake = FakeConnectionProvider::default();
    fake.reply_on_send(
        ALICE,
        "urn:xmpp:ping",
        ALICE,
        vec![ScriptedMessage::after_ms(
            20,
            "<iq id='ping1' type='result' from='example.com'/>",
        )],
    );
    fake
}

#[test]
fn recorded_session_replays_against_a_fresh_network() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ConductorStore::open(&temp.path().join("conductor.db")).expect("open store");
    let clock = FakeClock::new(1_700_000_000_000);

    let recording_network = ping_network();
    let composer = Composer::new(Arc::new(clock.clone()), ComposerConfig::default());
    let mut session =
        RecordingSession::begin(Arc::new(recording_network.clone()), composer).expect("begin");
    session
        .composer_mut()
        .set_details("ping pong", "records a ping round trip");
    session.connect("alice", ALICE).expect("connect");
    session
        .send(
            "alice",
            "<iq id='ping1' type='get'><ping xmlns='urn:xmpp:ping'/></iq>",
            BTreeMap::from([("corrId".to_string(), "ping1".to_string())]),
        )
        .expect("send");
    session
        .cue("alice", MatchType::Id, "corrId", 0)
        .expect("cue");
    session
        .assert("alice", AssertionType::Equals, "@type", Some("result"))
        .expect("assert");
    let composition = session.finish().expect("composition");

    assert_eq!(composition.steps.len(), 4);
    assert_eq!(composition.name, "ping pong");
    assert_eq!(recording_network.disconnects(), vec![ALICE.to_string()]);
    store.save(&composition).expect("save composition");

    let loaded = store
        .load_composition(&composition.id)
        .expect("load")
        .expect("stored composition");
    assert_eq!(loaded, composition);

    let replay_network = ping_network();
    let performer = Performer::new(
        Arc::new(replay_network.clone()),
        Arc::new(ProductionClock),
        PerformerConfig::default(),
    );
    let performance = performer
        .run(&loaded, &CancelToken::new())
        .expect("perform");
    assert_eq!(performance.status, PerformanceStatus::Passed);
    assert_eq!(performance.summary.passed, 4);
    store.save(&performance).expect("save performance");

    let history = store.performances_for(&composition.id).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, performance.id);
    // Connected implicitly, so teardown releases it.
    assert_eq!(replay_network.disconnects(), vec![ALICE.to_string()]);
}

#[test]
fn resuming_a_composition_bumps_its_version() {
    let clock = FakeClock::new(1_700_000_000_000);
    let network = ping_network();

    let composer = Composer::new(Arc::new(clock.clone()), ComposerConfig::default());
    let mut first = RecordingSession::begin(Arc::new(network.clone()), composer).expect("begin");
    first.connect("alice", ALICE).expect("connect");
    let original = first.finish().expect("composition");

    clock.advance(5_000);
    let composer = Composer::new(Arc::new(clock.clone()), ComposerConfig::default());
    let mut second =
        RecordingSession::resume(Arc::new(network.clone()), composer, &original).expect("resume");
    second.connect("alice", ALICE).expect("connect again");
    second
        .send("alice", "<presence/>", BTreeMap::new())
        .expect("send");
    let extended = second.finish().expect("extended");

    assert_eq!(extended.id, original.id);
    assert_eq!(extended.version, original.version + 1);
    assert_eq!(extended.created, original.created);
    assert_eq!(extended.updated, original.updated + 5_000);
    assert_eq!(extended.steps.len(), 3);
    assert!(extended.validate().is_ok());
}

#[test]
fn abandoned_recording_produces_nothing_and_releases_peers() {
    let network = ping_network();
    let composer = Composer::new(Arc::new(ProductionClock), ComposerConfig::default());
    let mut session = RecordingSession::begin(Arc::new(network.clone()), composer).expect("begin");
    session.connect("alice", ALICE).expect("connect");
    session.abandon();
    assert_eq!(network.live_connections(), 0);
}
