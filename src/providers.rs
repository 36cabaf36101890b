//! Provider capability resolution.
//!
//! Each request may carry its own embedder and chat model. Resolution is
//! overrides first, then per-process defaults. The scheduler holds the
//! latest overrides for a resource only while a worker is active.

use std::sync::Arc;

use crate::chat::ChatModel;
use crate::embedder::Embedder;

/// Resolved providers a pipeline or driver runs with.
#[derive(Clone)]
pub struct Capabilities {
    pub embedder: Arc<dyn Embedder>,
    pub chat: Arc<dyn ChatModel>,
}

impl Capabilities {
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>, chat: Arc<dyn ChatModel>) -> Self {
        Self { embedder, chat }
    }

    /// Apply per-request overrides on top of these defaults.
    #[must_use]
    pub fn with_overrides(&self, overrides: &Overrides) -> Self {
        Self {
            embedder: overrides
                .embedder
                .clone()
                .unwrap_or_else(|| self.embedder.clone()),
            chat: overrides.chat.clone().unwrap_or_else(|| self.chat.clone()),
        }
    }
}

/// Per-request provider selection; `None` keeps the process default.
#[derive(Clone, Default)]
pub struct Overrides {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub chat: Option<Arc<dyn ChatModel>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, FinishReason, ModelStep, ToolSpec, Usage};
    use crate::error::Result;
    use async_trait::async_trait;

    struct NamedEmbedder(&'static str);

    #[async_trait]
    impl Embedder for NamedEmbedder {
        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
            Ok(texts.iter().map(|_| Some(vec![0.0])).collect())
        }
        fn model_name(&self) -> &str {
            self.0
        }
        fn dims(&self) -> usize {
            1
        }
    }

    struct NamedChat(&'static str);

    #[async_trait]
    impl ChatModel for NamedChat {
        fn model_name(&self) -> &str {
            self.0
        }
        async fn step(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ModelStep> {
            Ok(ModelStep {
                text: String::new(),
                reasoning: None,
                tool_calls: Vec::new(),
                finish: FinishReason::Stop,
                usage: Usage::default(),
            })
        }
    }

    #[test]
    fn overrides_win_over_defaults() {
        let defaults = Capabilities::new(
            Arc::new(NamedEmbedder("default-embed")),
            Arc::new(NamedChat("default-chat")),
        );

        let resolved = defaults.with_overrides(&Overrides::default());
        assert_eq!(resolved.embedder.model_name(), "default-embed");
        assert_eq!(resolved.chat.model_name(), "default-chat");

        let resolved = defaults.with_overrides(&Overrides {
            embedder: Some(Arc::new(NamedEmbedder("custom-embed"))),
            chat: None,
        });
        assert_eq!(resolved.embedder.model_name(), "custom-embed");
        assert_eq!(resolved.chat.model_name(), "default-chat");
    }
}
