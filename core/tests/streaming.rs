//! End-to-end turns against a mock provider: a streamed text answer and a
//! full tool-call round trip, with the event log checked afterwards.

#![allow(clippy::unwrap_used)]

mod common;

use common::SequenceResponder;
use common::finish;
use common::sse_response;
use common::test_config;
use common::text_delta;
use common::tool_call_delta;
use pretty_assertions::assert_eq;
use sable_core::runloop::Op;
use sable_core::runloop::RunEventMsg;
use sable_core::runloop::Sable;
use sable_core::runloop::tool_responses_are_paired;
use sable_core::store::EventStore;
use sable_protocol::Event;
use sable_protocol::Message;
use sable_protocol::Role;
use sable_protocol::workspace_key;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::matchers::method;
use wiremock::matchers::path;

async fn drive_turn(agent: &Sable, text: &str) -> (String, String) {
    agent
        .submit(Op::UserTurn {
            text: text.to_string(),
        })
        .await
        .unwrap();

    let mut deltas = String::new();
    loop {
        match agent.next_event().await.unwrap().msg {
            RunEventMsg::AnswerDelta(delta) => deltas.push_str(&delta),
            RunEventMsg::TurnComplete { text } => return (deltas, text),
            RunEventMsg::Error { message, code } => panic!("turn failed [{code}]: {message}"),
            _ => {}
        }
    }
}

async fn read_log(config_home: &std::path::Path, workspace: &std::path::Path) -> Vec<Event> {
    let store = EventStore::new(config_home.join("sessions"), &workspace_key(workspace));
    let session = sable_protocol::SessionId::new("sable", "local", "itest").unwrap();
    store.list_events(&session).await.unwrap()
}

#[tokio::test]
async fn happy_streaming_turn_logs_partials_then_final() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            text_delta("He"),
            text_delta("llo"),
            finish("stop"),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let home = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let config = test_config(home.path(), workspace.path(), &server.uri());
    let (agent, _session) = Sable::spawn(config, None).await.unwrap();

    let (deltas, final_text) = drive_turn(&agent, "say hi").await;
    assert_eq!("Hello", deltas);
    assert_eq!("Hello", final_text);

    let events = read_log(home.path(), workspace.path()).await;
    let conversational: Vec<&Event> =
        events.iter().filter(|e| !e.is_lifecycle()).collect();

    // user → two partial assistant chunks → one non-partial assistant.
    assert_eq!(4, conversational.len());
    assert_eq!(Role::User, conversational[0].message.role());
    assert!(conversational[1].is_partial());
    assert_eq!(Some("answer"), conversational[1].channel());
    assert_eq!("He", conversational[1].message.text());
    assert!(conversational[2].is_partial());
    assert_eq!("llo", conversational[2].message.text());
    assert!(!conversational[3].is_partial());
    assert_eq!("Hello", conversational[3].message.text());

    // Partial subsumption: chunk concatenation equals the final text.
    let concat: String = conversational[1..3]
        .iter()
        .map(|e| e.message.text())
        .collect();
    assert_eq!(concat, conversational[3].message.text());
}

#[tokio::test]
async fn tool_call_round_trip_feeds_result_back_to_model() {
    let server = MockServer::start().await;
    let responses = SequenceResponder::new(vec![
        sse_response(&[
            tool_call_delta("c1", "READ", "{\"path\":\"README.md\"}"),
            finish("tool_calls"),
        ]),
        sse_response(&[text_delta("Your README says Hi."), finish("stop")]),
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(responses)
        .expect(2)
        .mount(&server)
        .await;

    let home = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("README.md"), "# Hi\nsecond\nthird\n").unwrap();
    let config = test_config(home.path(), workspace.path(), &server.uri());
    let (agent, _session) = Sable::spawn(config, None).await.unwrap();

    let (_deltas, final_text) = drive_turn(&agent, "read README").await;
    assert_eq!("Your README says Hi.", final_text);

    let events = read_log(home.path(), workspace.path()).await;
    let conversational: Vec<&Event> = events
        .iter()
        .filter(|e| !e.is_lifecycle() && !e.is_partial())
        .collect();

    // user → assistant(tool_calls) → tool(result) → assistant(text).
    assert_eq!(4, conversational.len());
    let calls = conversational[1].message.tool_calls();
    assert_eq!(1, calls.len());
    assert_eq!("c1", calls[0].id);
    assert_eq!("READ", calls[0].name);

    let Message::Tool { tool_response } = &conversational[2].message else {
        panic!("expected tool message, got {:?}", conversational[2].message);
    };
    assert_eq!("c1", tool_response.id);
    assert_eq!("READ", tool_response.name);
    assert!(
        tool_response.result["content"]
            .as_str()
            .unwrap()
            .contains("# Hi")
    );
    assert_eq!(1, tool_response.result["start_line"]);

    assert_eq!("Your README says Hi.", conversational[3].message.text());
    assert!(tool_responses_are_paired(&events));

    // The model input on the second call includes the tool message.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(2, requests.len());
    let second_body = String::from_utf8_lossy(&requests[1].body);
    assert!(second_body.contains("\"tool_call_id\":\"c1\""));
    assert!(second_body.contains("\"role\":\"tool\""));
}
