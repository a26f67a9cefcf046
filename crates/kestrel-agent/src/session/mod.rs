//! The stateful driver of tool rounds.
//!
//! A session owns its history, steering and follow-up queues, event
//! channel sender and sub-agents. Callers may invoke [`Session::steer`],
//! [`Session::follow_up`], [`Session::set_reasoning_effort`] and
//! [`Session::close`] concurrently with [`Session::process_input`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use kestrel::LLMClient;
use kestrel::chat::{ChatMessage, ReasoningEffort};
use log::debug;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::env::{EnvSnapshot, ExecutionEnv};
use crate::events::{SessionEvent, SessionEventKind};
use crate::profile::Profile;
use crate::subagent::SubAgentSupervisor;
use crate::tools::ToolRegistry;

mod prompt;
mod run;

pub use run::fingerprint_calls;

/// Event channel capacity. Lifecycle events block on a full buffer rather
/// than dropping.
pub const EVENT_BUFFER: usize = 256;

/// One history entry. Steering is distinct for observability but is
/// materialized as a user-role message when requests are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    UserInput,
    Steering,
    Assistant,
    Tool,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub kind: TurnKind,
    pub message: ChatMessage,
}

/// A live conversational session.
pub struct Session {
    id: String,
    pub(crate) config: Mutex<SessionConfig>,
    pub(crate) profile: Arc<Profile>,
    pub(crate) env: Arc<dyn ExecutionEnv>,
    pub(crate) client: Arc<LLMClient>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) snapshot: EnvSnapshot,
    pub(crate) history: Mutex<Vec<Turn>>,
    events_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    pub(crate) steering: Mutex<VecDeque<String>>,
    pub(crate) follow_ups: Mutex<VecDeque<String>>,
    pub(crate) supervisor: SubAgentSupervisor,
    pub(crate) depth: usize,
    closed: AtomicBool,
    pub(crate) turns: AtomicU64,
    processing: watch::Sender<bool>,
    last_output: Mutex<String>,
    pub(crate) self_weak: Weak<Session>,
    /// Serializes process_input; steering and follow-ups queue meanwhile.
    pub(crate) run_lock: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a root session. Captures the environment snapshot (including
    /// git state when available) once, then emits `session_start`.
    pub async fn new(
        config: SessionConfig,
        profile: Arc<Profile>,
        env: Arc<dyn ExecutionEnv>,
        client: Arc<LLMClient>,
        registry: Arc<ToolRegistry>,
    ) -> Arc<Session> {
        Self::with_depth(config, profile, env, client, registry, 0).await
    }

    pub(crate) async fn with_depth(
        config: SessionConfig,
        profile: Arc<Profile>,
        env: Arc<dyn ExecutionEnv>,
        client: Arc<LLMClient>,
        registry: Arc<ToolRegistry>,
        depth: usize,
    ) -> Arc<Session> {
        let snapshot = EnvSnapshot::capture(env.as_ref()).await;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (processing, _) = watch::channel(false);

        let session = Arc::new_cyclic(|weak| Session {
            id: Uuid::new_v4().to_string(),
            config: Mutex::new(config),
            profile,
            env,
            client,
            registry,
            snapshot,
            history: Mutex::new(Vec::new()),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            steering: Mutex::new(VecDeque::new()),
            follow_ups: Mutex::new(VecDeque::new()),
            supervisor: SubAgentSupervisor::new(),
            depth,
            closed: AtomicBool::new(false),
            turns: AtomicU64::new(0),
            processing,
            last_output: Mutex::new(String::new()),
            self_weak: weak.clone(),
            run_lock: tokio::sync::Mutex::new(()),
        });
        session.emit(SessionEventKind::SessionStart).await;
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hand out the event receiver; only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    /// Output of the most recent input, also kept when an input errors.
    pub fn last_output(&self) -> String {
        self.last_output.lock().clone()
    }

    pub(crate) fn set_last_output(&self, output: String) {
        *self.last_output.lock() = output;
    }

    /// Enqueue user-role guidance picked up after the current round's tool
    /// results. No-op on blank input or a closed session.
    pub fn steer(&self, message: impl Into<String>) {
        let message = message.into();
        if message.trim().is_empty() || self.is_closed() {
            return;
        }
        self.steering.lock().push_back(message);
    }

    /// Enqueue a whole follow-up input processed after the current input
    /// completes. No-op on blank input or a closed session.
    pub fn follow_up(&self, message: impl Into<String>) {
        let message = message.into();
        if message.trim().is_empty() || self.is_closed() {
            return;
        }
        self.follow_ups.lock().push_back(message);
    }

    /// Atomically update the reasoning effort for the next LLM request.
    /// In-flight requests are unaffected.
    pub fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) {
        self.config.lock().reasoning_effort = effort;
    }

    /// Idempotent: the first call closes sub-agents, emits `session_end`,
    /// and drops the channel sender; later calls return immediately.
    /// Emissions racing close are best-effort and never panic.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing session {}", self.id);
        self.supervisor.close_all().await;
        let sender = self.events_tx.lock().take();
        if let Some(sender) = sender {
            let _ = sender
                .send(SessionEvent::new(&self.id, SessionEventKind::SessionEnd))
                .await;
        }
    }

    pub(crate) async fn emit(&self, kind: SessionEventKind) {
        let sender = self.events_tx.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(SessionEvent::new(&self.id, kind)).await;
        }
    }

    /// A sender clone for tasks that emit concurrently with the loop.
    pub(crate) fn event_sender(&self) -> Option<mpsc::Sender<SessionEvent>> {
        self.events_tx.lock().clone()
    }

    pub(crate) fn mark_processing(&self, busy: bool) {
        let _ = self.processing.send_replace(busy);
    }

    pub(crate) fn is_processing(&self) -> bool {
        *self.processing.borrow()
    }

    /// Wait until the session goes idle, returning the latest assistant
    /// output; `None` on timeout.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.processing.subscribe();
        let wait = tokio::time::timeout(timeout, async {
            loop {
                if !*rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        match wait {
            Ok(()) => Some(self.last_output()),
            Err(_) => None,
        }
    }

    /// Session-lifetime count of LLM calls.
    pub fn turns(&self) -> u64 {
        self.turns.load(Ordering::SeqCst)
    }

    /// Snapshot of the history for inspection.
    pub fn history_snapshot(&self) -> Vec<Turn> {
        self.history.lock().clone()
    }
}

/// Flips the processing flag for the duration of one `process_input`.
pub(crate) struct ProcessingGuard<'a> {
    session: &'a Session,
}

impl<'a> ProcessingGuard<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        session.mark_processing(true);
        Self { session }
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.session.mark_processing(false);
    }
}
