//! The tool-round state machine driving one input to completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use kestrel::ToolCall;
use kestrel::chat::ChatMessage;
use kestrel::error::LLMError;
use kestrel::retry::{TokioSleeper, retry};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{ProcessingGuard, Session, Turn, TurnKind};
use crate::error::AgentError;
use crate::events::SessionEventKind;
use crate::tools::{ToolCtx, ToolExecResult};

/// Steering text injected when the loop detector fires.
const LOOP_STEERING: &str =
    "Loop detection: you are repeating the same tool calls. Stop and change approach.";

/// Size of `tool_call_output_delta` chunks over the full output.
const OUTPUT_DELTA_CHUNK: usize = 4000;

impl Session {
    /// Process one input to completion, then any queued follow-ups, and
    /// return the assistant outputs joined with newlines. On error the
    /// outputs accumulated so far remain available via
    /// [`Session::last_output`].
    #[instrument(name = "session.process_input", skip(self, cancel, input), fields(session_id = %self.id()))]
    pub async fn process_input(
        &self,
        cancel: &CancellationToken,
        input: &str,
    ) -> Result<String, AgentError> {
        if self.is_closed() {
            return Err(AgentError::SessionClosed);
        }
        let _run = self.run_lock.lock().await;
        if self.is_closed() {
            return Err(AgentError::SessionClosed);
        }
        let _processing = ProcessingGuard::new(self);

        // The initial cancellation check forcibly closes the session; later
        // per-round checks do the same per the close-on-any-cancellation
        // policy.
        if cancel.is_cancelled() {
            self.emit(SessionEventKind::Error { message: "operation cancelled".into() }).await;
            self.close().await;
            return Err(AgentError::Cancelled);
        }

        let mut outputs: Vec<String> = Vec::new();
        let mut pending = VecDeque::from([input.to_string()]);
        while let Some(next) = pending.pop_front() {
            match self.run_single_input(cancel, &next).await {
                Ok(text) => {
                    if !text.is_empty() {
                        outputs.push(text);
                    }
                }
                Err(err) => {
                    self.set_last_output(outputs.join("\n"));
                    return Err(err);
                }
            }
            while let Some(follow_up) = self.follow_ups.lock().pop_front() {
                pending.push_back(follow_up);
            }
        }

        let joined = outputs.join("\n");
        self.set_last_output(joined.clone());
        Ok(joined)
    }

    async fn run_single_input(
        &self,
        cancel: &CancellationToken,
        input: &str,
    ) -> Result<String, AgentError> {
        self.emit(SessionEventKind::UserInput { text: input.to_string() }).await;
        self.history.lock().push(Turn {
            kind: TurnKind::UserInput,
            message: ChatMessage::user().text(input).build(),
        });

        let max_rounds = self.config.lock().max_tool_rounds_per_input;
        let mut context_warned = false;
        let mut loop_warned = false;
        let mut loop_tracker = FingerprintTracker::default();
        let mut malformed_tracker = FingerprintTracker::default();

        for round in 0..max_rounds {
            if cancel.is_cancelled() {
                self.emit(SessionEventKind::Error { message: "operation cancelled".into() })
                    .await;
                self.close().await;
                return Err(AgentError::Cancelled);
            }

            let turns = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
            let max_turns = self.config.lock().max_turns;
            if max_turns > 0 && turns > max_turns {
                self.emit(SessionEventKind::TurnLimit { turns, max_turns }).await;
                return Err(AgentError::TurnLimit { turns, max_turns });
            }

            let request = self.build_request();
            debug!(
                "session {} round {} calling {} with {} messages",
                self.id(),
                round,
                request.provider,
                request.messages.len()
            );

            let policy = self.config.lock().retry.clone();
            let response = match retry(&policy, &TokioSleeper, cancel, || {
                self.client.complete(cancel, &request)
            })
            .await
            {
                Ok(response) => response,
                Err(err) => return Err(self.fail_llm(err).await),
            };

            if !context_warned {
                context_warned = self.maybe_warn_context(&request).await;
            }

            let text = response.text();
            self.emit(SessionEventKind::AssistantTextStart).await;
            self.emit(SessionEventKind::AssistantTextDelta { text: text.clone() }).await;
            self.emit(SessionEventKind::AssistantTextEnd { text: text.clone() }).await;
            self.history
                .lock()
                .push(Turn { kind: TurnKind::Assistant, message: response.message.clone() });

            let calls: Vec<ToolCall> =
                response.message.tool_calls().into_iter().cloned().collect();
            if calls.is_empty() {
                return Ok(text);
            }

            let loop_detection = {
                let config = self.config.lock();
                config.loop_detection.then_some(config.loop_detection_window)
            };
            if let Some(window) = loop_detection {
                let fingerprint = fingerprint_calls(&calls);
                let repeats = loop_tracker.observe(&fingerprint);
                if repeats >= window && !loop_warned {
                    loop_warned = true;
                    warn!("session {} loop detected after {} repeats", self.id(), repeats);
                    self.emit(SessionEventKind::LoopDetection { fingerprint, repeats }).await;
                    self.history.lock().push(Turn {
                        kind: TurnKind::Steering,
                        message: ChatMessage::user().text(LOOP_STEERING).build(),
                    });
                    self.emit(SessionEventKind::SteeringInjected {
                        text: LOOP_STEERING.to_string(),
                    })
                    .await;
                }
            }

            let results = self.execute_round(cancel, &calls).await;

            if let Some(err) = self.check_malformed(&calls, &results, &mut malformed_tracker).await
            {
                return Err(err);
            }

            {
                let mut history = self.history.lock();
                for result in &results {
                    history.push(Turn {
                        kind: TurnKind::Tool,
                        message: ChatMessage::tool_result_named(
                            &result.call_id,
                            &result.tool_name,
                            result.output.clone(),
                            result.is_error,
                        ),
                    });
                }
            }

            loop {
                let steering = self.steering.lock().pop_front();
                let Some(steering) = steering else { break };
                self.history.lock().push(Turn {
                    kind: TurnKind::Steering,
                    message: ChatMessage::user().text(&steering).build(),
                });
                self.emit(SessionEventKind::SteeringInjected { text: steering }).await;
            }
        }

        Err(AgentError::MaxToolRounds)
    }

    /// Emit, warn on context exhaustion, close on non-retryable errors,
    /// and map to the agent error space.
    async fn fail_llm(&self, err: LLMError) -> AgentError {
        self.emit(SessionEventKind::Error { message: err.to_string() }).await;
        if matches!(err, LLMError::ContextLength(_)) {
            self.emit(SessionEventKind::Warning { message: "Context length exceeded".into() })
                .await;
        }
        if !err.retryable() {
            self.close().await;
        }
        if err.is_cancellation() {
            AgentError::Cancelled
        } else {
            AgentError::Llm(err)
        }
    }

    /// Character-approximated context check, emitted at most once per
    /// input: chars / 4 against 80% of the profile's window.
    async fn maybe_warn_context(&self, request: &kestrel::chat::ChatRequest) -> bool {
        let window = self.profile.context_window_size();
        if window == 0 {
            return false;
        }
        let chars: usize = request.messages.iter().map(|m| m.approx_chars()).sum();
        let approx_tokens = chars / 4;
        if approx_tokens * 10 <= window * 8 {
            return false;
        }
        let percent = ((approx_tokens as f64 / window as f64) * 100.0).round() as u64;
        self.emit(SessionEventKind::Warning {
            message: format!("Context usage at ~{}% of context window", percent),
        })
        .await;
        true
    }

    /// Run a round's calls: concurrently when the profile allows parallel
    /// tool calls and more than one call arrived, else in order.
    async fn execute_round(
        &self,
        cancel: &CancellationToken,
        calls: &[ToolCall],
    ) -> Vec<ToolExecResult> {
        let ctx = self.tool_ctx(cancel);
        if self.profile.supports_parallel_tool_calls && calls.len() > 1 {
            let futures: Vec<_> =
                calls.iter().map(|call| self.run_one_call(ctx.clone(), call.clone())).collect();
            futures::future::join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.run_one_call(ctx.clone(), call.clone()).await);
            }
            results
        }
    }

    #[instrument(name = "session.tool_call", skip(self, ctx, call), fields(tool_name = %call.function.name, call_id = %call.id))]
    async fn run_one_call(&self, ctx: ToolCtx, call: ToolCall) -> ToolExecResult {
        self.emit(SessionEventKind::ToolCallStart {
            tool_name: call.function.name.clone(),
            call_id: call.id.clone(),
            arguments: call.function.arguments.clone(),
        })
        .await;

        let result = self.registry.execute_call(&ctx, &call).await;

        // A uniform streaming shape even for non-streaming tools: the full
        // output goes out in fixed-size chunks.
        for chunk in chunk_str(&result.full_output, OUTPUT_DELTA_CHUNK) {
            self.emit(SessionEventKind::ToolCallOutputDelta {
                tool_name: result.tool_name.clone(),
                call_id: result.call_id.clone(),
                chunk: chunk.to_string(),
            })
            .await;
        }

        self.emit(SessionEventKind::ToolCallEnd {
            tool_name: result.tool_name.clone(),
            call_id: result.call_id.clone(),
            is_error: result.is_error,
            full_output: result.full_output.clone(),
        })
        .await;

        result
    }

    /// Fingerprint the calls whose results flag malformed argument JSON;
    /// identical consecutive rounds trip the abort threshold.
    async fn check_malformed(
        &self,
        calls: &[ToolCall],
        results: &[ToolExecResult],
        tracker: &mut FingerprintTracker,
    ) -> Option<AgentError> {
        let malformed: Vec<ToolCall> = calls
            .iter()
            .zip(results)
            .filter(|(_, result)| result.output.contains("invalid tool arguments JSON"))
            .map(|(call, _)| call.clone())
            .collect();

        if malformed.is_empty() {
            tracker.reset();
            return None;
        }

        let limit = self.config.lock().repeated_malformed_tool_call_limit;
        let repeats = tracker.observe(&fingerprint_calls(&malformed));
        if repeats >= limit {
            let message =
                format!("repeated malformed tool calls detected (repeats={} limit={})", repeats, limit);
            self.emit(SessionEventKind::Error { message }).await;
            return Some(AgentError::RepeatedMalformedToolCalls { repeats, limit });
        }
        None
    }

    fn tool_ctx(&self, cancel: &CancellationToken) -> ToolCtx {
        let overrides = self.config.lock().tool_output_limits.clone();
        ToolCtx {
            cancel: cancel.clone(),
            env: self.env.clone(),
            agents: self.agent_handle(),
            output_overrides: Arc::new(overrides),
        }
    }
}

/// Stable fingerprint of a round's tool calls: `name:sha256(args)[:16];`
/// joined in call order.
pub fn fingerprint_calls(calls: &[ToolCall]) -> String {
    let mut fingerprint = String::new();
    for call in calls {
        let digest = Sha256::digest(call.function.arguments.as_bytes());
        fingerprint.push_str(&call.function.name);
        fingerprint.push(':');
        fingerprint.push_str(&hex::encode(&digest[..8]));
        fingerprint.push(';');
    }
    fingerprint
}

/// Counts identical consecutive observations.
#[derive(Debug, Default)]
struct FingerprintTracker {
    previous: Option<String>,
    count: u32,
}

impl FingerprintTracker {
    /// Record a fingerprint; returns how many consecutive times it has
    /// now been seen.
    fn observe(&mut self, fingerprint: &str) -> u32 {
        if self.previous.as_deref() == Some(fingerprint) {
            self.count += 1;
        } else {
            self.previous = Some(fingerprint.to_string());
            self.count = 1;
        }
        self.count
    }

    fn reset(&mut self) {
        self.previous = None;
        self.count = 0;
    }
}

/// Split on char boundaries into chunks of at most `max` bytes.
fn chunk_str(s: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = s;
    while rest.len() > max {
        let mut split = max;
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        let (head, tail) = rest.split_at(split);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() || chunks.is_empty() && !s.is_empty() {
        chunks.push(rest);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::function("id", name, args)
    }

    #[test]
    fn fingerprint_is_stable_and_order_sensitive() {
        let a = vec![call("glob", "{\"p\":1}"), call("grep", "{\"q\":2}")];
        let b = vec![call("glob", "{\"p\":1}"), call("grep", "{\"q\":2}")];
        let reversed = vec![call("grep", "{\"q\":2}"), call("glob", "{\"p\":1}")];
        let different_args = vec![call("glob", "{\"p\":9}"), call("grep", "{\"q\":2}")];

        assert_eq!(fingerprint_calls(&a), fingerprint_calls(&b));
        assert_ne!(fingerprint_calls(&a), fingerprint_calls(&reversed));
        assert_ne!(fingerprint_calls(&a), fingerprint_calls(&different_args));
        assert!(fingerprint_calls(&a).contains("glob:"));
    }

    #[test]
    fn tracker_counts_consecutive_runs() {
        let mut tracker = FingerprintTracker::default();
        assert_eq!(tracker.observe("x"), 1);
        assert_eq!(tracker.observe("x"), 2);
        assert_eq!(tracker.observe("y"), 1);
        assert_eq!(tracker.observe("y"), 2);
        tracker.reset();
        assert_eq!(tracker.observe("y"), 1);
    }

    #[test]
    fn chunking_respects_boundaries() {
        let chunks = chunk_str("abcdef", 4);
        assert_eq!(chunks, vec!["abcd", "ef"]);

        // Multi-byte chars never split mid-codepoint.
        let s = "ééééé"; // 2 bytes each
        let chunks = chunk_str(s, 3);
        assert!(chunks.iter().all(|c| c.len() <= 3));
        assert_eq!(chunks.concat(), s);

        assert!(chunk_str("", 4).is_empty());
    }
}
