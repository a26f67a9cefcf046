//! Provider routing with alias normalization and the middleware chain.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatProvider, ChatRequest, ChatResponse};
use crate::error::LLMError;
use crate::middleware::{CompleteNext, Middleware, StreamNext};
use crate::stream::ChatStream;

/// Alias table applied to provider names after trimming and lowercasing.
fn default_aliases() -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    aliases.insert("gemini".to_string(), "google".to_string());
    aliases.insert("z-ai".to_string(), "zai".to_string());
    aliases.insert("moonshot".to_string(), "kimi".to_string());
    aliases
}

/// Routes requests to registered adapters through the middleware onion.
pub struct LLMClient {
    /// Registration order matters: an unset request provider falls back to
    /// the first registered adapter.
    providers: Vec<(String, Arc<dyn ChatProvider>)>,
    middlewares: Vec<Arc<dyn Middleware>>,
    aliases: HashMap<String, String>,
}

impl LLMClient {
    pub fn builder() -> LLMClientBuilder {
        LLMClientBuilder::default()
    }

    fn resolve(&self, name: &str) -> Result<&Arc<dyn ChatProvider>, LLMError> {
        let trimmed = name.trim().to_lowercase();
        if trimmed.is_empty() {
            return self
                .providers
                .first()
                .map(|(_, p)| p)
                .ok_or_else(|| LLMError::configuration("", "no providers registered"));
        }
        let canonical = self.aliases.get(&trimmed).map(String::as_str).unwrap_or(&trimmed);
        self.providers
            .iter()
            .find(|(key, _)| key == canonical)
            .map(|(_, p)| p)
            .ok_or_else(|| {
                LLMError::configuration("", format!("unknown provider: {:?}", name))
            })
    }

    /// Canonical provider key a request will route to.
    pub fn canonical_provider(&self, name: &str) -> Result<String, LLMError> {
        self.resolve(name).map(|p| p.name().to_string())
    }

    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError> {
        request.validate()?;
        let provider = self.resolve(&request.provider)?;
        debug!("complete via provider {} model {}", provider.name(), request.model);
        CompleteNext { middlewares: &self.middlewares, provider: provider.as_ref() }
            .run(cancel, request)
            .await
    }

    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream, LLMError> {
        request.validate()?;
        let provider = self.resolve(&request.provider)?;
        debug!("stream via provider {} model {}", provider.name(), request.model);
        StreamNext { middlewares: &self.middlewares, provider: provider.as_ref() }
            .run(cancel, request)
            .await
    }
}

/// Builder pattern for configuring an [`LLMClient`].
#[derive(Default)]
pub struct LLMClientBuilder {
    providers: Vec<(String, Arc<dyn ChatProvider>)>,
    middlewares: Vec<Arc<dyn Middleware>>,
    aliases: HashMap<String, String>,
}

impl LLMClientBuilder {
    /// Register an adapter under its canonical key. Re-registering a key
    /// replaces the prior adapter.
    pub fn provider(mut self, adapter: Arc<dyn ChatProvider>) -> Self {
        let key = adapter.name().to_lowercase();
        if let Some(slot) = self.providers.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = adapter;
        } else {
            self.providers.push((key, adapter));
        }
        self
    }

    /// Append a middleware; earlier registrations wrap later ones.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Add an alias on top of the defaults.
    pub fn alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.aliases.insert(from.into().to_lowercase(), to.into().to_lowercase());
        self
    }

    pub fn build(mut self) -> LLMClient {
        let mut aliases = default_aliases();
        aliases.extend(self.aliases.drain());
        LLMClient {
            providers: self.providers,
            middlewares: self.middlewares,
            aliases,
        }
    }
}
