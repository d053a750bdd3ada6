//! Cancelling a turn mid-tool-call: the subprocess group dies promptly, the
//! log ends with a canceled lifecycle event, and no dangling final assistant
//! answer is written.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;
use std::time::Instant;

use common::finish;
use common::sse_response;
use common::test_config;
use common::tool_call_delta;
use pretty_assertions::assert_eq;
use sable_core::runloop::Op;
use sable_core::runloop::RunEventMsg;
use sable_core::runloop::Sable;
use sable_core::store::EventStore;
use sable_protocol::LifecycleStatus;
use sable_protocol::SessionId;
use sable_protocol::workspace_key;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::matchers::method;
use wiremock::matchers::path;

const SLEEP_MARKER: u64 = 987_654;

/// Scan /proc for a live process whose cmdline carries the marker.
fn marker_process_alive() -> bool {
    let needle = format!("sleep {SLEEP_MARKER}");
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path().join("cmdline");
        let Ok(raw) = std::fs::read(&path) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        if cmdline.contains(&needle) {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn cancel_mid_tool_call_kills_subprocess_and_records_lifecycle() {
    let server = MockServer::start().await;
    let args = format!("{{\"command\":\"sleep {SLEEP_MARKER}\"}}");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            tool_call_delta("c1", "BASH", &args),
            finish("tool_calls"),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let home = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let config = test_config(home.path(), workspace.path(), &server.uri());
    let (agent, _session) = Sable::spawn(config, None).await.unwrap();

    agent
        .submit(Op::UserTurn {
            text: "sleep for a while".to_string(),
        })
        .await
        .unwrap();

    // Wait for the tool call to actually start, then cancel.
    loop {
        match agent.next_event().await.unwrap().msg {
            RunEventMsg::ToolCallBegin { .. } => break,
            RunEventMsg::Error { message, code } => panic!("turn failed [{code}]: {message}"),
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancel_at = Instant::now();
    agent.submit(Op::Interrupt).await.unwrap();

    // The turn reports canceled...
    loop {
        match agent.next_event().await.unwrap().msg {
            RunEventMsg::Canceled => break,
            RunEventMsg::TurnComplete { .. } => panic!("canceled turn must not complete"),
            _ => {}
        }
    }

    // ...and the subprocess is gone within two seconds.
    let deadline = cancel_at + Duration::from_secs(2);
    loop {
        if !marker_process_alive() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "sleep subprocess survived past the kill deadline"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Log ends with `lifecycle: canceled`; the assistant never produced a
    // final text answer for this turn.
    let store = EventStore::new(
        home.path().join("sessions"),
        &workspace_key(workspace.path()),
    );
    let session = SessionId::new("sable", "local", "itest").unwrap();
    let events = store.list_events(&session).await.unwrap();

    let last = events.last().unwrap();
    assert!(last.is_lifecycle());
    assert_eq!(
        LifecycleStatus::Canceled,
        last.lifecycle().unwrap().status
    );

    let final_answers = events
        .iter()
        .filter(|e| {
            !e.is_partial()
                && !e.is_lifecycle()
                && e.message.role() == sable_protocol::Role::Assistant
                && e.message.tool_calls().is_empty()
        })
        .count();
    assert_eq!(0, final_answers);
}
