//! Request assembly: system prompt plus materialized history.

use kestrel::chat::{ChatMessage, ChatRequest};

use super::Session;

impl Session {
    /// Build the next LLM request from profile, config and history.
    /// Steering turns already carry user-role messages, so the history
    /// maps onto the wire unchanged.
    pub(crate) fn build_request(&self) -> ChatRequest {
        let config = self.config.lock().clone();
        let tools = self.profile.tool_definitions(&self.registry);
        let system = self.profile.build_system_prompt(
            &self.snapshot,
            &tools,
            &config.project_docs,
            config.user_instruction_override.as_deref(),
        );

        let mut messages = vec![ChatMessage::system().text(system).build()];
        messages.extend(self.history.lock().iter().map(|turn| turn.message.clone()));

        ChatRequest {
            provider: self.profile.provider.clone(),
            model: self.profile.model.clone(),
            messages,
            tools,
            tool_choice: None,
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            stop_sequences: Vec::new(),
            reasoning_effort: config.reasoning_effort,
            response_format: None,
            provider_options: config.provider_options.clone(),
            metadata: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use kestrel::chat::{
        ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, FinishReason,
        ReasoningEffort,
    };
    use kestrel::error::LLMError;
    use kestrel::stream::ChatStream;
    use kestrel::{LLMClient, Usage};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use crate::config::SessionConfig;
    use crate::env::LocalEnv;
    use crate::profile::Profile;
    use crate::session::{Session, Turn, TurnKind};
    use crate::tools::ToolRegistry;
    use crate::tools::builtins::register_builtins;

    struct NoopProvider;

    #[async_trait]
    impl ChatProvider for NoopProvider {
        fn name(&self) -> &str {
            "noop"
        }

        async fn complete(
            &self,
            _cancel: &CancellationToken,
            request: &ChatRequest,
        ) -> Result<ChatResponse, LLMError> {
            Ok(ChatResponse {
                id: "resp".into(),
                provider: "noop".into(),
                model: request.model.clone(),
                message: ChatMessage::assistant().text("ok").build(),
                finish_reason: FinishReason::Stop,
                finish_reason_raw: None,
                usage: Usage::default(),
                raw: None,
            })
        }

        async fn stream(
            &self,
            _cancel: &CancellationToken,
            _request: &ChatRequest,
        ) -> Result<ChatStream, LLMError> {
            Err(LLMError::configuration("noop", "streaming not scripted"))
        }
    }

    async fn session(config: SessionConfig) -> (TempDir, Arc<Session>) {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(LocalEnv::new(dir.path()));
        let client = Arc::new(LLMClient::builder().provider(Arc::new(NoopProvider)).build());
        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry).unwrap();
        let session = Session::new(
            config,
            Arc::new(Profile::new("noop", "test-model")),
            env,
            client,
            registry,
        )
        .await;
        (dir, session)
    }

    #[tokio::test]
    async fn request_leads_with_system_and_materializes_steering_as_user() {
        let (_dir, session) = session(SessionConfig::default()).await;
        session.history.lock().extend([
            Turn {
                kind: TurnKind::UserInput,
                message: ChatMessage::user().text("find the bug").build(),
            },
            Turn {
                kind: TurnKind::Assistant,
                message: ChatMessage::assistant().text("looking").build(),
            },
            Turn {
                kind: TurnKind::Steering,
                message: ChatMessage::user().text("focus on the parser").build(),
            },
        ]);

        let request = session.build_request();
        assert_eq!(request.provider, "noop");
        assert_eq!(request.model, "test-model");
        assert_eq!(request.messages[0].role, ChatRole::System);
        assert!(request.messages[0].text().contains("<environment>"));
        assert_eq!(request.messages[1].text(), "find the bug");
        // Steering rides as a plain user message on the wire.
        assert_eq!(request.messages[3].role, ChatRole::User);
        assert_eq!(request.messages[3].text(), "focus on the parser");
        assert!(!request.tools.is_empty(), "registry tools advertised");
    }

    #[tokio::test]
    async fn reasoning_effort_update_lands_on_the_next_request() {
        let (_dir, session) = session(SessionConfig::default()).await;
        assert_eq!(session.build_request().reasoning_effort, None);

        session.set_reasoning_effort(Some(ReasoningEffort::High));
        assert_eq!(session.build_request().reasoning_effort, Some(ReasoningEffort::High));
    }

    #[tokio::test]
    async fn user_instruction_override_closes_the_system_prompt() {
        let mut config = SessionConfig::default();
        config.user_instruction_override = Some("never touch CI config".to_string());
        let (_dir, session) = session(config).await;

        let request = session.build_request();
        let system = request.messages[0].text();
        assert!(system.trim_end().ends_with("never touch CI config"));
    }
}
