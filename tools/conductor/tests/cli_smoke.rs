use assert_cmd::cargo::cargo_bin_cmd;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

fn stdout_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf8")
}

fn stderr_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(assert.get_output().stderr.clone()).expect("utf8")
}

fn import(dir: &Path, file: &str) {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(dir)
        .arg("import")
        .arg(fixture(&format!("compositions/{file}")));
    cmd.assert().success();
}

/// One-connection line server answering every ping with `<iq type='{reply_type}'/>`.
fn spawn_ping_server(reply_type: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut writer = stream.try_clone().expect("clone stream");
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else {
                return;
            };
            if line.contains("urn:xmpp:ping") {
                let reply = format!("<iq id='ping1' type='{reply_type}' from='example.com'/>\n");
                if writer.write_all(reply.as_bytes()).is_err() {
                    return;
                }
            }
        }
    });
    addr
}

fn write_endpoint_config(dir: &Path, addr: &str) -> String {
    let path = dir.join("conductor.toml");
    std::fs::write(
        &path,
        format!("[transport.endpoints]\n\"alice@example.com\" = \"{addr}\"\n"),
    )
    .expect("write config");
    path.display().to_string()
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    for subcommand in ["list", "import", "export", "delete", "perform", "history"] {
        assert!(stdout.contains(subcommand), "missing {subcommand}");
    }
    assert!(stdout.contains("--store"));
}

#[test]
fn empty_store_lists_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(temp.path()).arg("list");
    let out = cmd.assert().success();
    assert!(stdout_of(&out).contains("no compositions"));
    assert!(temp.path().join(".conductor/conductor.db").exists());
}

#[test]
fn import_list_export_and_delete_round_through_the_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    import(temp.path(), "ping.json");
    import(temp.path(), "batch.json");

    let mut list = cargo_bin_cmd!("conductor");
    list.current_dir(temp.path()).arg("list");
    let out = list.assert().success();
    let stdout = stdout_of(&out);
    let lines = stdout.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("comp-ping  v1  5 steps  ping pong"));
    assert!(lines[1].contains("presence broadcast"));
    assert!(lines[2].contains("room join"));

    let exported = temp.path().join("ping-export.json");
    let mut export = cargo_bin_cmd!("conductor");
    export
        .current_dir(temp.path())
        .arg("export")
        .arg("comp-ping")
        .arg("--out")
        .arg(&exported);
    export.assert().success();
    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&exported).expect("read export"))
            .expect("parse export");
    assert_eq!(document["id"], "comp-ping");
    assert_eq!(document["steps"][1]["payload"]["generatedIds"]["corrId"], "ping1");

    let mut delete = cargo_bin_cmd!("conductor");
    delete
        .current_dir(temp.path())
        .arg("delete")
        .arg("comp-ping");
    delete.assert().success();

    let mut relist = cargo_bin_cmd!("conductor");
    relist.current_dir(temp.path()).arg("list");
    let out = relist.assert().success();
    assert!(!stdout_of(&out).contains("comp-ping"));
}

#[test]
fn invalid_composition_is_rejected_on_import() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(temp.path())
        .arg("import")
        .arg(fixture("compositions/unknown_alias.json"));
    let out = cmd.assert().failure();
    assert!(stderr_of(&out).contains("unknown account alias mallory"));
}

#[test]
fn missing_composition_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    for args in [["perform", "nope"], ["export", "nope"], ["delete", "nope"]] {
        let mut cmd = cargo_bin_cmd!("conductor");
        cmd.current_dir(temp.path()).args(args);
        let out = cmd.assert().failure();
        assert!(stderr_of(&out).contains("composition nope not found"));
    }
}

#[test]
fn malformed_endpoint_config_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(temp.path())
        .arg("--config")
        .arg(fixture("configs/invalid-endpoint.toml"))
        .arg("list");
    let out = cmd.assert().failure();
    assert!(stderr_of(&out).contains("must be host:port"));
}

#[test]
fn perform_against_a_live_peer_passes_and_lands_in_history() {
    let temp = tempfile::tempdir().expect("tempdir");
    import(temp.path(), "ping.json");
    let config = write_endpoint_config(temp.path(), &spawn_ping_server("result"));

    let mut perform = cargo_bin_cmd!("conductor");
    perform
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("perform")
        .arg("comp-ping");
    let out = perform.assert().success();
    let stdout = stdout_of(&out);
    assert!(stdout.starts_with("ping pong (comp-ping) PASSED passed=5 failed=0 total=5"));
    assert!(stdout.contains("Wait for the ping result"));

    let mut history = cargo_bin_cmd!("conductor");
    history
        .current_dir(temp.path())
        .arg("history")
        .arg("comp-ping");
    let out = history.assert().success();
    assert!(stdout_of(&out).contains("comp-ping  passed  5/5 passed"));
}

#[test]
fn failed_assertion_exits_with_performance_failure_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    import(temp.path(), "ping.json");
    let config = write_endpoint_config(temp.path(), &spawn_ping_server("error"));

    let mut perform = cargo_bin_cmd!("conductor");
    perform
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("perform")
        .arg("comp-ping")
        .arg("--json");
    let out = perform.assert().code(2);
    let report: serde_json::Value = serde_json::from_str(&stdout_of(&out)).expect("json report");
    assert_eq!(report["status"], "failed");
    assert_eq!(report["summary"]["failed"], 1);
    assert_eq!(report["stepResults"][3]["status"], "failed");
    assert_eq!(
        report["stepResults"][3]["assertionResults"][0]["actual"],
        "error"
    );
    assert_eq!(report["stepResults"][4]["status"], "passed");
}

#[test]
fn unreachable_peer_records_an_errored_performance() {
    let temp = tempfile::tempdir().expect("tempdir");
    import(temp.path(), "ping.json");
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    let config = write_endpoint_config(temp.path(), &closed);

    let mut perform = cargo_bin_cmd!("conductor");
    perform
        .current_dir(temp.path())
        .arg("--config")
        .arg(&config)
        .arg("perform")
        .arg("comp-ping");
    let out = perform.assert().code(2);
    let stdout = stdout_of(&out);
    assert!(stdout.contains("FAILED passed=0 failed=1 total=5"));
    assert!(stdout.contains("error: peer unavailable"));
    assert_eq!(stdout.matches("skipped").count(), 4);
}
