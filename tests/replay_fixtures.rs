mod common;

use std::sync::Arc;
use std::time::Duration;

use netcollect::catalog::Layer;
use netcollect::coordinator::{CollectionCoordinator, RunContext};
use netcollect::device::Device;
use netcollect::error::ConnectError;
use netcollect::report::{CommandStatus, RunStatus};
use netcollect::session::{
    ConnectionManager, Connector, ReplayConnector, SessionEvent, SessionRecorder, SessionReplayer,
};
use tokio_util::sync::CancellationToken;

use common::{MockConnector, Script, fleet, test_config};

const FIXTURE: &str = r#"{"ts_ms":1,"event":{"kind":"command_output","device":"r1","command":"terminal length 0","success":true,"content":""}}
{"ts_ms":2,"event":{"kind":"command_output","device":"r1","command":"terminal width 0","success":true,"content":""}}
{"ts_ms":3,"event":{"kind":"session_opened","device":"r1","connect_retries":0}}

{"ts_ms":4,"event":{"kind":"command_output","device":"r1","command":"show clock","success":true,"content":"*10:00:00.000 UTC Mon Oct 19 2026"}}
{"ts_ms":5,"event":{"kind":"command_output","device":"r1","command":"show clock","success":true,"content":"*10:00:05.000 UTC Mon Oct 19 2026"}}
{"ts_ms":6,"event":{"kind":"command_output","device":"r1","command":"show ip bgp","success":false,"content":"BGP table version is 1","failure":"timeout","error":"exec command timeout: no prompt within 600s"}}
{"ts_ms":7,"event":{"kind":"session_closed","device":"r1","reason":"unhealthy"}}
"#;

#[test]
fn fixture_replays_outputs_in_order_and_repeats_the_last() {
    let mut replayer = SessionReplayer::from_jsonl(FIXTURE).expect("load fixture");

    let first = replayer.replay_next("r1", "show clock").expect("first");
    let second = replayer.replay_next("r1", "show clock").expect("second");
    let third = replayer.replay_next("r1", "show clock").expect("third");

    assert!(first.content.starts_with("*10:00:00"));
    assert!(second.content.starts_with("*10:00:05"));
    assert_eq!(second, third);
}

#[test]
fn fixture_replays_recorded_timeout_with_partial_output() {
    let mut replayer = SessionReplayer::from_jsonl(FIXTURE).expect("load fixture");
    match replayer.replay_next("r1", "show ip bgp") {
        Err(ConnectError::ExecTimeout(partial)) => assert_eq!(partial, "BGP table version is 1"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn fixture_reports_mismatch_for_unrecorded_command() {
    let mut replayer = SessionReplayer::from_jsonl(FIXTURE).expect("load fixture");
    let err = replayer.replay_next("r1", "show inventory").unwrap_err();
    assert!(matches!(err, ConnectError::ReplayMismatchError(_)));
    assert!(!replayer.knows_device("r9"));
}

#[tokio::test]
async fn replay_connector_serves_the_pool() {
    let connector: Arc<dyn Connector> =
        Arc::new(ReplayConnector::from_jsonl(FIXTURE).expect("fixture"));
    let config = test_config(std::path::Path::new("unused"), 2);
    let manager = ConnectionManager::new(connector, &config, None);

    let r1 = Device::new("r1", "192.0.2.1", Some("ios"));
    let mut session = manager.acquire(&r1).await.expect("acquire");
    let output = manager
        .execute(&mut session, "show clock", Duration::from_secs(1))
        .await
        .expect("show clock");
    assert!(output.success);
    manager.release(session).await;

    let unknown = Device::new("r9", "192.0.2.9", Some("ios"));
    let err = manager.acquire(&unknown).await.unwrap_err();
    assert_eq!(err.failure_kind(), netcollect::error::FailureKind::Transport);
    manager.shutdown().await;
}

#[test]
fn recorder_round_trips_through_jsonl() {
    let recorder = SessionRecorder::from_jsonl(FIXTURE).expect("load fixture");
    let r1 = recorder.entries_for("r1").expect("entries");
    assert_eq!(r1.len(), 7);
    assert!(matches!(r1[2].event, SessionEvent::SessionOpened { .. }));

    let again = SessionRecorder::from_jsonl(&recorder.to_jsonl().expect("jsonl")).expect("reload");
    assert_eq!(again.entries().expect("entries").len(), 7);
}

#[tokio::test]
async fn recorded_run_replays_offline_with_identical_artifacts() {
    let live_dir = tempfile::tempdir().expect("tempdir");
    let connector = MockConnector::new()
        .script("r2", Script::default().with_output("show ip bgp summary", "% BGP not active"));
    let mut config = test_config(live_dir.path(), 2);
    config.record_sessions = true;
    let layers = vec![Layer::Health, Layer::Bgp];

    let context = RunContext::new(config, Arc::new(connector)).expect("context");
    let live = CollectionCoordinator::new(context)
        .with_layers(layers.clone())
        .run(fleet(2), CancellationToken::new())
        .await
        .expect("live run");
    assert_eq!(live.status, RunStatus::Complete);

    let mut transcript = String::new();
    for host in ["r1", "r2"] {
        let jsonl = std::fs::read_to_string(live.run_dir.join(host).join("session.jsonl"))
            .expect("transcript");
        assert!(jsonl.contains("\"session_opened\""));
        transcript.push_str(&jsonl);
    }

    let replay_dir = tempfile::tempdir().expect("tempdir");
    let replay = ReplayConnector::from_jsonl(&transcript).expect("replay connector");
    let context =
        RunContext::new(test_config(replay_dir.path(), 2), Arc::new(replay)).expect("context");
    let offline = CollectionCoordinator::new(context)
        .with_layers(layers)
        .run(fleet(2), CancellationToken::new())
        .await
        .expect("replayed run");
    assert_eq!(offline.status, RunStatus::Complete);
    assert_eq!(offline.stats, live.stats);

    for device in &live.devices {
        for (layer, report) in &device.layers {
            let replayed = offline.layer(&device.device_id, *layer).expect("layer");
            for (a, b) in report.commands.iter().zip(&replayed.commands) {
                assert_eq!(a.status, b.status, "{}", a.command);
                assert_eq!(a.parse_status, b.parse_status, "{}", a.command);
                let (Some(pa), Some(pb)) = (&a.raw_artifact, &b.raw_artifact) else {
                    panic!("{} has no raw artifact", a.command);
                };
                assert_eq!(
                    std::fs::read(live.run_dir.join(pa)).expect("live artifact"),
                    std::fs::read(offline.run_dir.join(pb)).expect("replayed artifact"),
                );
            }
        }
    }
    let summary = offline.layer("r2", Layer::Bgp).expect("r2 bgp");
    assert_eq!(summary.commands[0].status, CommandStatus::NotConfigured);
}
