//! End-to-end session scenarios against a scripted provider and a real
//! local environment.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kestrel::chat::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, FinishReason, StreamEvent, Tool,
};
use kestrel::error::LLMError;
use kestrel::retry::RetryPolicy;
use kestrel::stream::ChatStream;
use kestrel::{LLMClient, ToolCall, Usage};
use kestrel_agent::config::SessionConfig;
use kestrel_agent::env::LocalEnv;
use kestrel_agent::ExecutionEnv;
use kestrel_agent::error::{AgentError, ToolError};
use kestrel_agent::events::{SessionEvent, SessionEventKind};
use kestrel_agent::profile::Profile;
use kestrel_agent::session::Session;
use kestrel_agent::tools::builtins::register_builtins;
use kestrel_agent::tools::{ToolCtx, ToolExecutor, ToolRegistry};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted reply: a canned assistant message or a canned error.
enum Step {
    Respond(ChatMessage),
    Fail(LLMError),
}

struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    /// Requests whose user text contains the marker are served from this
    /// side script; lets one provider back a parent and its sub-agent
    /// deterministically.
    child_marker: Option<String>,
    child_script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            child_marker: None,
            child_script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn with_child_script(self: Arc<Self>, marker: &str, steps: Vec<Step>) -> Arc<Self> {
        let mut this = Arc::into_inner(self).unwrap();
        this.child_marker = Some(marker.to_string());
        this.child_script = Mutex::new(steps.into());
        Arc::new(this)
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock()[index].clone()
    }
}

fn assistant_text(text: &str) -> Step {
    Step::Respond(ChatMessage::assistant().text(text).build())
}

fn assistant_calls(text: &str, calls: Vec<ToolCall>) -> Step {
    let mut builder = ChatMessage::assistant();
    if !text.is_empty() {
        builder = builder.text(text);
    }
    for call in calls {
        builder = builder.tool_call(call);
    }
    Step::Respond(builder.build())
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        _cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let for_child = self.child_marker.as_deref().is_some_and(|marker| {
            request
                .messages
                .iter()
                .any(|m| m.role == ChatRole::User && m.text().contains(marker))
        });
        let step = if for_child {
            self.child_script
                .lock()
                .pop_front()
                .unwrap_or_else(|| assistant_text("child script exhausted"))
        } else {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| assistant_text("script exhausted"))
        };
        match step {
            Step::Fail(err) => Err(err),
            Step::Respond(message) => {
                let finish_reason = if message.tool_calls().is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                };
                Ok(ChatResponse {
                    id: format!("resp_{}", self.call_count()),
                    provider: "scripted".into(),
                    model: request.model.clone(),
                    message,
                    finish_reason,
                    finish_reason_raw: None,
                    usage: Usage::default(),
                    raw: None,
                })
            }
        }
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream, LLMError> {
        let response = self.complete(cancel, request).await?;
        let (tx, stream) = ChatStream::channel(cancel.child_token());
        tokio::spawn(async move {
            tx.send(StreamEvent::Finish {
                finish_reason: response.finish_reason,
                usage: response.usage.clone(),
                response: Box::new(response),
            })
            .await;
        });
        Ok(stream)
    }
}

struct Fixture {
    _dir: TempDir,
    session: Arc<Session>,
    provider: Arc<ScriptedProvider>,
    events: mpsc::Receiver<SessionEvent>,
    env: Arc<LocalEnv>,
}

async fn fixture(steps: Vec<Step>, config: SessionConfig, profile: Profile) -> Fixture {
    fixture_with(steps, config, profile, |_| {}).await
}

async fn fixture_with(
    steps: Vec<Step>,
    config: SessionConfig,
    profile: Profile,
    setup: impl FnOnce(&ToolRegistry),
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let env = Arc::new(LocalEnv::new(dir.path()));
    let provider = ScriptedProvider::new(steps);
    let client = Arc::new(
        LLMClient::builder().provider(provider.clone() as Arc<dyn ChatProvider>).build(),
    );
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry).unwrap();
    setup(&registry);

    let session =
        Session::new(config, Arc::new(profile), env.clone(), client, registry).await;
    let events = session.take_events().unwrap();
    Fixture { _dir: dir, session, provider, events, env }
}

fn profile() -> Profile {
    let mut profile = Profile::new("scripted", "test-model");
    profile.context_window = 1_000_000;
    profile
}

/// Drain everything currently buffered on the event channel.
fn drain(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

/// Assert `expected` appears as an ordered subsequence of `actual`.
fn assert_subsequence(actual: &[&'static str], expected: &[&'static str]) {
    let mut iter = actual.iter();
    for want in expected {
        assert!(
            iter.any(|got| got == want),
            "missing {:?} in order within {:?}",
            want,
            actual
        );
    }
}

#[tokio::test]
async fn natural_completion_returns_text_with_bracketed_events() {
    let mut fx = fixture(vec![assistant_text("hello")], SessionConfig::default(), profile()).await;

    let cancel = CancellationToken::new();
    let output = fx.session.process_input(&cancel, "hi").await.unwrap();
    assert_eq!(output, "hello");

    fx.session.close().await;
    let events = drain(&mut fx.events);
    assert_subsequence(
        &kinds(&events),
        &[
            "session_start",
            "user_input",
            "assistant_text_start",
            "assistant_text_delta",
            "assistant_text_end",
            "session_end",
        ],
    );
    let delta = events
        .iter()
        .find_map(|e| match &e.kind {
            SessionEventKind::AssistantTextDelta { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(delta, "hello");
}

#[tokio::test]
async fn tool_loop_writes_file_and_feeds_result_back() {
    let fx = fixture(
        vec![
            assistant_calls(
                "writing",
                vec![ToolCall::function(
                    "call_1",
                    "write_file",
                    "{\"file_path\":\"hello.txt\",\"content\":\"Hello\"}",
                )],
            ),
            assistant_text("ok"),
        ],
        SessionConfig::default(),
        profile(),
    )
    .await;

    let cancel = CancellationToken::new();
    let output = fx.session.process_input(&cancel, "write hello.txt").await.unwrap();
    assert_eq!(output, "ok");

    let content = fx.env.read_file("hello.txt", None, None).await.unwrap();
    assert_eq!(content, "Hello");

    // The second request carries the tool result back to the model.
    let second = fx.provider.request(1);
    let tool_message = second
        .messages
        .iter()
        .find(|m| m.role == ChatRole::Tool)
        .expect("tool message present");
    let results = tool_message.tool_results();
    assert_eq!(results[0].tool_call_id, "call_1");
    assert!(!results[0].is_error);
}

/// A tool that blocks until both participants arrive, proving concurrency.
struct BarrierTool {
    barrier: Arc<tokio::sync::Barrier>,
}

#[async_trait]
impl ToolExecutor for BarrierTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "slow",
            "Waits for its twin",
            json!({"type": "object", "properties": {"tag": {"type": "string"}}}),
        )
    }

    async fn execute(&self, _ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        self.barrier.wait().await;
        Ok(json!(format!("done {}", args.get("tag").and_then(Value::as_str).unwrap_or("?"))))
    }
}

#[tokio::test]
async fn parallel_round_runs_tools_concurrently() {
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let mut parallel_profile = profile();
    parallel_profile.supports_parallel_tool_calls = true;

    let fx = fixture_with(
        vec![
            assistant_calls(
                "",
                vec![
                    ToolCall::function("call_a", "slow", "{\"tag\":\"a\"}"),
                    ToolCall::function("call_b", "slow", "{\"tag\":\"b\"}"),
                ],
            ),
            assistant_text("ok"),
        ],
        SessionConfig::default(),
        parallel_profile,
        |registry| {
            registry.register(Arc::new(BarrierTool { barrier: barrier.clone() })).unwrap();
        },
    )
    .await;

    let cancel = CancellationToken::new();
    // Sequential execution would deadlock on the barrier; the timeout turns
    // that into a test failure instead of a hang.
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        fx.session.process_input(&cancel, "run both"),
    )
    .await
    .expect("tools ran concurrently")
    .unwrap();
    assert_eq!(output, "ok");
}

#[tokio::test]
async fn loop_detection_injects_steering() {
    let glob_call = || ToolCall::function("call_g", "glob", "{\"pattern\":\"*.go\",\"path\":\".\"}");
    let mut config = SessionConfig::default();
    config.loop_detection_window = 3;

    let mut fx = fixture(
        vec![
            assistant_calls("", vec![glob_call()]),
            assistant_calls("", vec![glob_call()]),
            assistant_calls("", vec![glob_call()]),
            assistant_text("ok"),
        ],
        config,
        profile(),
    )
    .await;

    let cancel = CancellationToken::new();
    let output = fx.session.process_input(&cancel, "find go files").await.unwrap();
    assert_eq!(output, "ok");

    let events = drain(&mut fx.events);
    let loop_event = events
        .iter()
        .find_map(|e| match &e.kind {
            SessionEventKind::LoopDetection { fingerprint, repeats } => {
                Some((fingerprint.clone(), *repeats))
            }
            _ => None,
        })
        .expect("loop_detection emitted");
    assert!(loop_event.0.contains("glob:"));
    assert_eq!(loop_event.1, 3);

    let history = fx.session.history_snapshot();
    let steering = history
        .iter()
        .find(|t| t.kind == kestrel_agent::session::TurnKind::Steering)
        .expect("steering turn recorded");
    assert!(steering.message.text().starts_with("Loop detection:"));
    assert_eq!(steering.message.role, ChatRole::User);

    // The request after the third round carries the steering as user text.
    let fourth = fx.provider.request(3);
    assert!(
        fourth
            .messages
            .iter()
            .any(|m| m.role == ChatRole::User && m.text().starts_with("Loop detection:")),
        "steering materialized into the next request"
    );
}

#[tokio::test]
async fn context_window_warning_fires_once_for_small_windows() {
    let mut tiny = profile();
    tiny.context_window = 10;
    let mut fx =
        fixture(vec![assistant_text("hi")], SessionConfig::default(), tiny).await;
    let cancel = CancellationToken::new();
    fx.session.process_input(&cancel, "0123456789012345678901234567890123456789").await.unwrap();

    let events = drain(&mut fx.events);
    let warnings: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            SessionEventKind::Warning { message } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("% of context window"), "{}", warnings[0]);

    // A roomy window stays quiet.
    let mut fx = fixture(vec![assistant_text("hi")], SessionConfig::default(), profile()).await;
    fx.session.process_input(&cancel, "0123456789012345678901234567890123456789").await.unwrap();
    let events = drain(&mut fx.events);
    assert!(
        !events.iter().any(|e| matches!(e.kind, SessionEventKind::Warning { .. })),
        "no warning for a large window"
    );
}

#[tokio::test]
async fn transient_429_retries_until_success() {
    let retryable =
        || LLMError::from_http_status("scripted", 429, "rate limited", None, None);
    let mut config = SessionConfig::default();
    config.retry = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter: false,
    };

    let fx = fixture(
        vec![Step::Fail(retryable()), Step::Fail(retryable()), assistant_text("ok")],
        config,
        profile(),
    )
    .await;

    let cancel = CancellationToken::new();
    let output = fx.session.process_input(&cancel, "hi").await.unwrap();
    assert_eq!(output, "ok");
    assert_eq!(fx.provider.call_count(), 3);
    assert!(!fx.session.is_closed());
}

#[tokio::test]
async fn non_retryable_error_closes_the_session() {
    let mut fx = fixture(
        vec![Step::Fail(LLMError::from_http_status("scripted", 401, "bad key", None, None))],
        SessionConfig::default(),
        profile(),
    )
    .await;

    let cancel = CancellationToken::new();
    let err = fx.session.process_input(&cancel, "hi").await.unwrap_err();
    assert!(matches!(err, AgentError::Llm(_)));
    assert!(fx.session.is_closed());
    assert_eq!(fx.provider.call_count(), 1);

    let events = drain(&mut fx.events);
    let names = kinds(&events);
    assert_subsequence(&names, &["session_start", "user_input", "error", "session_end"]);
}

#[tokio::test]
async fn repeated_malformed_tool_calls_abort_the_input() {
    // Two concatenated top-level JSON objects: invalid arguments.
    let malformed =
        || ToolCall::function("call_m", "glob", "{\"pattern\":\"*.c\"}{\"path\":\"...\"}");
    let mut config = SessionConfig::default();
    config.repeated_malformed_tool_call_limit = 2;

    let mut fx = fixture(
        vec![
            assistant_calls("", vec![malformed()]),
            assistant_calls("", vec![malformed()]),
            assistant_text("ok"),
        ],
        config,
        profile(),
    )
    .await;

    let cancel = CancellationToken::new();
    let err = fx.session.process_input(&cancel, "go").await.unwrap_err();
    match err {
        AgentError::RepeatedMalformedToolCalls { repeats, limit } => {
            assert_eq!(repeats, 2);
            assert_eq!(limit, 2);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(fx.provider.call_count() < 3, "aborted before a third request");

    let events = drain(&mut fx.events);
    let error = events
        .iter()
        .find_map(|e| match &e.kind {
            SessionEventKind::Error { message } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(error.contains("repeated malformed tool calls detected"));

    // The tool results that led here carry the contract substring.
    let tool_end = events
        .iter()
        .find_map(|e| match &e.kind {
            SessionEventKind::ToolCallEnd { full_output, is_error, .. } if *is_error => {
                Some(full_output.clone())
            }
            _ => None,
        })
        .unwrap();
    assert!(tool_end.contains("invalid tool arguments JSON"));
}

/// A tool that sleeps until cancelled.
struct HangingTool;

#[async_trait]
impl ToolExecutor for HangingTool {
    fn definition(&self) -> Tool {
        Tool::function("hang", "Blocks until cancelled", json!({"type": "object"}))
    }

    async fn execute(&self, ctx: &ToolCtx, _args: Value) -> Result<Value, ToolError> {
        ctx.cancel.cancelled().await;
        Err(ToolError::ExecutionFailed("cancelled".to_string()))
    }
}

#[tokio::test]
async fn abort_mid_tool_closes_with_ordered_events() {
    let mut fx = fixture_with(
        vec![assistant_calls("", vec![ToolCall::function("call_h", "hang", "{}")])],
        SessionConfig::default(),
        profile(),
        |registry| {
            registry.register(Arc::new(HangingTool)).unwrap();
        },
    )
    .await;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_clone.cancel();
    });

    let err = fx.session.process_input(&cancel, "hang").await.unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert!(fx.session.is_closed());

    let events = drain(&mut fx.events);
    let names = kinds(&events);
    assert_subsequence(&names, &["tool_call_end", "error", "session_end"]);
    let error_pos = names.iter().position(|n| *n == "error").unwrap();
    let end_pos = names.iter().position(|n| *n == "session_end").unwrap();
    assert!(error_pos < end_pos);
}

#[tokio::test]
async fn steering_is_drained_after_tool_results() {
    let mut fx = fixture(
        vec![
            assistant_calls("", vec![ToolCall::function("call_1", "ls", "{}")]),
            assistant_text("done"),
        ],
        SessionConfig::default(),
        profile(),
    )
    .await;

    fx.session.steer("be brief");
    fx.session.steer("   "); // blank: dropped
    let cancel = CancellationToken::new();
    let output = fx.session.process_input(&cancel, "look around").await.unwrap();
    assert_eq!(output, "done");

    let events = drain(&mut fx.events);
    let steered: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            SessionEventKind::SteeringInjected { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(steered, vec!["be brief".to_string()]);

    let second = fx.provider.request(1);
    assert!(
        second.messages.iter().any(|m| m.role == ChatRole::User && m.text() == "be brief"),
        "steering became a user message on the next request"
    );
}

#[tokio::test]
async fn follow_ups_run_after_the_current_input_and_outputs_join() {
    let fx = fixture(
        vec![assistant_text("first"), assistant_text("second")],
        SessionConfig::default(),
        profile(),
    )
    .await;

    fx.session.follow_up("and then?");
    let cancel = CancellationToken::new();
    let output = fx.session.process_input(&cancel, "start").await.unwrap();
    assert_eq!(output, "first\nsecond");
    assert_eq!(fx.provider.call_count(), 2);
}

#[tokio::test]
async fn turn_limit_is_enforced() {
    let glob_call = || ToolCall::function("call_g", "glob", "{\"pattern\":\"*.rs\"}");
    let mut config = SessionConfig::default();
    config.max_turns = 2;

    let mut fx = fixture(
        vec![
            assistant_calls("", vec![glob_call()]),
            assistant_calls("", vec![glob_call()]),
            assistant_text("never reached"),
        ],
        config,
        profile(),
    )
    .await;

    let cancel = CancellationToken::new();
    let err = fx.session.process_input(&cancel, "go").await.unwrap_err();
    assert!(matches!(err, AgentError::TurnLimit { .. }));

    let events = drain(&mut fx.events);
    assert!(events.iter().any(|e| matches!(e.kind, SessionEventKind::TurnLimit { .. })));
}

#[tokio::test]
async fn close_is_idempotent_with_exactly_one_session_end() {
    let mut fx = fixture(vec![], SessionConfig::default(), profile()).await;
    fx.session.close().await;
    fx.session.close().await;

    let events = drain(&mut fx.events);
    let ends = events
        .iter()
        .filter(|e| matches!(e.kind, SessionEventKind::SessionEnd))
        .count();
    assert_eq!(ends, 1);

    let cancel = CancellationToken::new();
    let err = fx.session.process_input(&cancel, "hi").await.unwrap_err();
    assert!(matches!(err, AgentError::SessionClosed));
}

#[tokio::test]
async fn sub_agent_spawn_and_auto_close_with_parent() {
    use kestrel_agent::subagent::register_subagent_tools;

    let dir = TempDir::new().unwrap();
    let env = Arc::new(LocalEnv::new(dir.path()));
    let provider = ScriptedProvider::new(vec![
        assistant_calls(
            "",
            vec![ToolCall::function("call_s", "spawn_agent", "{\"task\":\"child task\"}")],
        ),
        assistant_text("parent done"),
    ])
    .with_child_script("child task", vec![assistant_text("child done")]);
    let client = Arc::new(
        LLMClient::builder().provider(provider.clone() as Arc<dyn ChatProvider>).build(),
    );
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry).unwrap();
    register_subagent_tools(&registry).unwrap();

    let session = Session::new(
        SessionConfig::default(),
        Arc::new(profile()),
        env,
        client,
        registry,
    )
    .await;
    let mut events = session.take_events().unwrap();

    let cancel = CancellationToken::new();
    let output = session.process_input(&cancel, "delegate").await.unwrap();
    assert_eq!(output, "parent done");

    // The spawn tool reported the child id as JSON.
    let collected = drain(&mut events);
    let spawn_output = collected
        .iter()
        .find_map(|e| match &e.kind {
            SessionEventKind::ToolCallEnd { tool_name, full_output, .. }
                if tool_name == "spawn_agent" =>
            {
                Some(full_output.clone())
            }
            _ => None,
        })
        .unwrap();
    let value: Value = serde_json::from_str(&spawn_output).unwrap();
    assert!(value.get("agent_id").and_then(Value::as_str).is_some());
    assert_eq!(value["status"], "running");

    session.close().await;
    let collected = drain(&mut events);
    assert!(
        collected
            .iter()
            .any(|e| matches!(e.kind, SessionEventKind::SessionEnd) && e.session_id == session.id()),
        "parent session_end emitted"
    );
}
