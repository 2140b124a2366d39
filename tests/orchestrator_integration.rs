//! End-to-end orchestrator behaviour with scripted backends: fan-out and
//! merge ordering, guardrails, failure isolation, cancellation, deadline
//! and heartbeat cadence.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tandem::adapter::{BackendError, ModelBackend};
use tandem::error::ApiError;
use tandem::events::StreamEvent;
use tandem::history::{ContentBlock, Role};
use tandem::orchestrator::Orchestrator;
use tandem::session::SessionStore;

use common::{test_registry, text, tool_use, usage, MockBackend, Round};

const DEADLINE: Duration = Duration::from_secs(25);

fn store_for(backends: &[Arc<MockBackend>]) -> SessionStore {
    SessionStore::new(backends.iter().map(|b| b.model_id().to_string()).collect())
}

fn orchestrator_for(backends: &[Arc<MockBackend>], deadline: Duration) -> Orchestrator {
    let dyn_backends: Vec<Arc<dyn ModelBackend>> = backends
        .iter()
        .map(|b| Arc::clone(b) as Arc<dyn ModelBackend>)
        .collect();
    Orchestrator::new(dyn_backends, test_registry(), deadline)
}

fn events_for<'a>(events: &'a [StreamEvent], model: &str) -> Vec<&'a StreamEvent> {
    events
        .iter()
        .filter(|e| e.model_id() == Some(model))
        .collect()
}

#[tokio::test]
async fn happy_path_merges_all_models() {
    let alpha = MockBackend::new(
        "model-alpha",
        vec![
            Round::Deltas(vec![tool_use("t1", "search_quran"), usage(100, 5)]),
            Round::Deltas(vec![text("Patience "), text("is a virtue."), usage(150, 30)]),
        ],
    );
    let beta = MockBackend::new(
        "model-beta",
        vec![Round::Deltas(vec![text("Sabr."), usage(90, 10)])],
    );
    let backends = vec![alpha, beta];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("What does the Quran say about patience?");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    for model in ["model-alpha", "model-beta"] {
        let seq = events_for(&events, model);
        assert!(
            matches!(seq.first(), Some(StreamEvent::Start { .. })),
            "{model}: start must come first"
        );
        assert!(
            seq.last().unwrap().is_terminal(),
            "{model}: terminal event must come last"
        );

        // Exactly one ttft, before every token.
        let ttft_count = seq
            .iter()
            .filter(|e| matches!(e, StreamEvent::Ttft { .. }))
            .count();
        assert_eq!(ttft_count, 1, "{model}: exactly one ttft");
        let ttft_pos = seq
            .iter()
            .position(|e| matches!(e, StreamEvent::Ttft { .. }))
            .unwrap();
        let first_token_pos = seq
            .iter()
            .position(|e| matches!(e, StreamEvent::Token { .. }))
            .unwrap();
        assert!(ttft_pos < first_token_pos, "{model}: ttft precedes tokens");
    }

    // Alpha ran one tool round: tool events precede its ttft.
    let alpha_seq = events_for(&events, "model-alpha");
    assert!(matches!(alpha_seq[1], StreamEvent::ToolStart { tool_name, .. } if tool_name == "search_quran"));
    assert!(matches!(alpha_seq[2], StreamEvent::ToolEnd { .. }));
    assert!(alpha_seq
        .iter()
        .any(|e| matches!(e, StreamEvent::Citations { citations, .. } if citations.len() == 1)));
    assert!(alpha_seq.iter().any(
        |e| matches!(e, StreamEvent::Done { tokens_in, tokens_out, .. } if *tokens_in == 250 && *tokens_out == 35)
    ));

    // Post-generation commit: one user and one assistant turn per model,
    // every tool_use paired with a tool_result.
    for model in ["model-alpha", "model-beta"] {
        let history = session.history(model);
        assert_eq!(history.len(), 2, "{model}: user + assistant");
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }
    let alpha_history = session.history("model-alpha");
    let alpha_turn = &alpha_history[1];
    let uses: Vec<_> = alpha_turn
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(uses, vec!["t1"]);
    assert!(alpha_turn.blocks.iter().any(|b| matches!(
        b,
        ContentBlock::ToolResult(r) if r.tool_use_id == "t1" && !r.blocks.is_empty()
    )));
}

#[tokio::test]
async fn empty_vendor_response_is_start_then_done() {
    let backend = MockBackend::new("model-empty", vec![Round::Deltas(vec![usage(10, 0)])]);
    let backends = vec![backend];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("hello");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    let seq = events_for(&events, "model-empty");
    assert_eq!(seq.len(), 2);
    assert!(matches!(seq[0], StreamEvent::Start { .. }));
    assert!(
        matches!(seq[1], StreamEvent::Done { tokens_out: 0, .. }),
        "no ttft, no tokens: {seq:?}"
    );
}

#[tokio::test]
async fn one_model_failing_does_not_stop_the_others() {
    let broken = MockBackend::new(
        "model-broken",
        vec![Round::ConnectError(BackendError::Api {
            status: 401,
            message: "invalid api key".to_string(),
        })],
    );
    let healthy = MockBackend::new(
        "model-healthy",
        vec![Round::Deltas(vec![text("fine"), usage(1, 1)])],
    );
    let backends = vec![broken, healthy];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    let broken_seq = events_for(&events, "model-broken");
    assert_eq!(broken_seq.len(), 2);
    assert!(matches!(broken_seq[0], StreamEvent::Start { .. }));
    assert!(matches!(
        broken_seq[1],
        StreamEvent::Error { retry_after_ms: None, .. }
    ));

    let healthy_seq = events_for(&events, "model-healthy");
    assert!(matches!(healthy_seq.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn fourth_consecutive_same_tool_call_is_refused() {
    let same_tool_round =
        || Round::Deltas(vec![tool_use("t", "search_quran"), usage(10, 2)]);
    let backend = MockBackend::new(
        "model-loopy",
        vec![
            same_tool_round(),
            same_tool_round(),
            same_tool_round(),
            // Forced-answer round: tools disabled, model must answer.
            Round::Deltas(vec![text("Based on the verses found, patience..."), usage(10, 20)]),
        ],
    );
    let backends = vec![backend.clone()];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    let tool_starts = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolStart { .. }))
        .count();
    assert_eq!(tool_starts, 3, "no fourth tool_start");

    // The fourth vendor round was submitted with tool use disallowed and a
    // coaching user message appended.
    let allow_tools = backend.allow_tools_seen.lock().unwrap().clone();
    assert_eq!(allow_tools, vec![true, true, true, false]);
    let histories = backend.histories_seen.lock().unwrap();
    let last_submission = histories.last().unwrap();
    let coaching = last_submission.last().unwrap();
    assert_eq!(coaching.role, Role::User);
    assert!(coaching.text().contains("Do not call any more tools"));

    // The final assistant text still arrived.
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::Token { content, .. } if content.contains("Based on the verses"))
    ));
}

#[tokio::test]
async fn tool_call_cap_stops_at_ten() {
    // One round requesting twelve calls with alternating names so only the
    // total cap can bind; two are dropped, the next round is forced.
    let mut deltas = Vec::new();
    for i in 0..12 {
        let name = if i % 2 == 0 { "search_quran" } else { "search_hadith" };
        deltas.push(tool_use(&format!("t{i}"), name));
    }
    deltas.push(usage(10, 2));

    let backend = MockBackend::new(
        "model-greedy",
        vec![
            Round::Deltas(deltas),
            Round::Deltas(vec![text("answer from what I have"), usage(10, 10)]),
        ],
    );
    let backends = vec![backend.clone()];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    let tool_starts = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolStart { .. }))
        .count();
    assert_eq!(tool_starts, 10, "hard cap of ten tool calls");

    let allow_tools = backend.allow_tools_seen.lock().unwrap().clone();
    assert_eq!(allow_tools, vec![true, false]);

    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn cancel_commits_partial_output_and_frees_the_session() {
    let backend = MockBackend::new(
        "model-slow",
        vec![Round::DeltasThenHang(vec![text("partial answer")])],
    );
    let backends = vec![backend];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (handle, events) = orchestrator.begin(&session).expect("begin");
    let collector = tokio::spawn(events.collect::<Vec<StreamEvent>>());

    // A second begin while streaming is refused.
    assert!(matches!(
        orchestrator.begin(&session),
        Err(ApiError::BusySession)
    ));

    // Give the adapter a moment to emit the partial text.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(orchestrator.cancel(&session).await);
    assert!(handle.is_done());
    // Cancelling again is a no-op.
    assert!(!orchestrator.cancel(&session).await);

    let events = collector.await.expect("join");
    // Cancellation still terminates the model's event sequence.
    let seq = events_for(&events, "model-slow");
    assert!(
        matches!(seq.last(), Some(StreamEvent::Error { error, retry_after_ms: None, .. }) if error == "cancelled"),
        "cancelled model must end with a terminal error: {seq:?}"
    );
    assert_eq!(
        seq.iter().filter(|e| e.is_terminal()).count(),
        1,
        "exactly one terminal event per model"
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::Token { content, .. } if content == "partial answer")));

    // Partial assistant content was committed, and the session is free.
    let history = session.history("model-slow");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Assistant);
    assert!(history[1].text().contains("partial answer"));

    assert!(orchestrator.begin(&session).is_ok());
}

#[tokio::test(start_paused = true)]
async fn deadline_produces_terminal_error_for_that_model_only() {
    let hung = MockBackend::new("model-hung", vec![Round::DeltasThenHang(vec![])]);
    let quick = MockBackend::new(
        "model-quick",
        vec![Round::Deltas(vec![text("done"), usage(1, 1)])],
    );
    let backends = vec![hung, quick];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, Duration::from_millis(200));

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    let hung_seq = events_for(&events, "model-hung");
    assert!(matches!(
        hung_seq.last(),
        Some(StreamEvent::Error { error, retry_after_ms: None, .. }) if error == "deadline exceeded"
    ));

    let quick_seq = events_for(&events, "model-quick");
    assert!(matches!(quick_seq.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test(start_paused = true)]
async fn transient_connect_failure_is_retried_once() {
    let backend = MockBackend::new(
        "model-flaky",
        vec![
            Round::ConnectError(BackendError::Network("connection reset".to_string())),
            Round::Deltas(vec![text("recovered"), usage(5, 5)]),
        ],
    );
    let backends = vec![backend.clone()];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test(start_paused = true)]
async fn second_transient_failure_is_terminal_with_retry_hint() {
    let backend = MockBackend::new(
        "model-flaky",
        vec![
            Round::ConnectError(BackendError::Network("reset".to_string())),
            Round::ConnectError(BackendError::Network("reset again".to_string())),
        ],
    );
    let backends = vec![backend];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error { retry_after_ms: Some(_), .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn heartbeats_flow_while_a_model_is_still_streaming() {
    let backend = MockBackend::new("model-hung", vec![Round::DeltasThenHang(vec![])]);
    let backends = vec![backend];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, Duration::from_secs(3600))
        .with_heartbeat_interval(Duration::from_millis(100));

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let collector = tokio::spawn(events.collect::<Vec<StreamEvent>>());

    tokio::time::sleep(Duration::from_millis(550)).await;
    assert!(orchestrator.cancel(&session).await);

    let events = collector.await.expect("join");
    let heartbeats = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Heartbeat { .. }))
        .count();
    assert!(heartbeats >= 4, "expected steady heartbeats, got {heartbeats}");
}

#[tokio::test]
async fn tool_failure_recovers_into_an_error_document() {
    // "search_mawsuah" is not registered, so the invocation fails; the
    // adapter must convert that into an error tool_result and continue.
    let backend = MockBackend::new(
        "model-a",
        vec![
            Round::Deltas(vec![tool_use("t1", "search_mawsuah"), usage(5, 1)]),
            Round::Deltas(vec![text("answering without that source"), usage(5, 5)]),
        ],
    );
    let backends = vec![backend];
    let store = store_for(&backends);
    let orchestrator = orchestrator_for(&backends, DEADLINE);

    let session = store.create().expect("create");
    session.append_user("q");

    let (_handle, events) = orchestrator.begin(&session).expect("begin");
    let events: Vec<StreamEvent> = events.collect().await;

    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));

    let history = session.history("model-a");
    let result = history[1]
        .blocks
        .iter()
        .find_map(|b| match b {
            ContentBlock::ToolResult(r) => Some(r),
            _ => None,
        })
        .expect("tool result committed");
    assert!(result.is_error);
    assert!(!result.blocks.is_empty(), "error result still carries a document");
}
