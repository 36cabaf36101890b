//! Shared fixtures: stub providers and an engine wired over a temp home.
//!
//! Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ctxpack::chat::{ChatMessage, ChatModel, FinishReason, ModelStep, ToolSpec, Usage};
use ctxpack::config::Config;
use ctxpack::db;
use ctxpack::embedder::Embedder;
use ctxpack::error::{Error, Result};
use ctxpack::providers::Capabilities;
use ctxpack::repo::Materializer;
use ctxpack::scheduler::Scheduler;
use ctxpack::search::SearchEngine;

/// Embedder that maps texts mentioning "beta" onto the all-ones vector
/// and everything else onto a distinct axis.
pub struct BetaEmbedder;

#[async_trait]
impl Embedder for BetaEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        Ok(texts
            .iter()
            .map(|t| {
                Some(if t.contains("beta") {
                    vec![1.0, 1.0, 1.0]
                } else {
                    vec![1.0, 0.0, 0.0]
                })
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "beta-stub"
    }

    fn dims(&self) -> usize {
        3
    }
}

/// Embedder that fails the batch at `fail_batch` (0-based call index)
/// and succeeds otherwise.
pub struct FlakyEmbedder {
    pub calls: AtomicUsize,
    pub fail_batch: usize,
}

impl FlakyEmbedder {
    pub fn new(fail_batch: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_batch,
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_batch {
            return Err(Error::Upstream("embedding backend unavailable".to_string()));
        }
        Ok(texts.iter().map(|_| Some(vec![1.0, 0.0, 0.0])).collect())
    }

    fn model_name(&self) -> &str {
        "flaky-stub"
    }

    fn dims(&self) -> usize {
        3
    }
}

/// Chat model that replays a scripted sequence of steps.
pub struct ScriptedChat {
    steps: std::sync::Mutex<std::collections::VecDeque<ModelStep>>,
}

impl ScriptedChat {
    pub fn new(steps: Vec<ModelStep>) -> Self {
        Self {
            steps: std::sync::Mutex::new(steps.into()),
        }
    }

    pub fn text_step(text: &str) -> ModelStep {
        ModelStep {
            text: text.to_string(),
            reasoning: None,
            tool_calls: Vec::new(),
            finish: FinishReason::Stop,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    pub fn tool_step(name: &str, input: serde_json::Value) -> ModelStep {
        ModelStep {
            text: String::new(),
            reasoning: None,
            tool_calls: vec![ctxpack::chat::ToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                input,
            }],
            finish: FinishReason::ToolCalls,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn step(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ModelStep> {
        let mut steps = self.steps.lock().unwrap();
        Ok(steps
            .pop_front()
            .unwrap_or_else(|| Self::text_step("out of script")))
    }
}

/// Chat model that never responds; used to exercise cancellation.
pub struct StallingChat;

#[async_trait]
impl ChatModel for StallingChat {
    fn model_name(&self) -> &str {
        "stalling"
    }

    async fn step(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ModelStep> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(Error::Upstream("unreachable".to_string()))
    }
}

pub fn caps(embedder: Arc<dyn Embedder>, chat: Arc<dyn ChatModel>) -> Capabilities {
    Capabilities::new(embedder, chat)
}

/// A fully wired engine over a fresh temp home and in-memory database.
pub struct TestEngine {
    pub pool: sqlx::SqlitePool,
    pub config: Arc<Config>,
    pub materializer: Arc<Materializer>,
    pub scheduler: Scheduler,
    pub search: Arc<SearchEngine>,
    pub home: tempfile::TempDir,
}

pub async fn engine(defaults: Capabilities) -> TestEngine {
    let home = tempfile::TempDir::new().unwrap();
    let config = Arc::new(Config {
        home: home.path().to_path_buf(),
        ..Config::default()
    });
    config.ensure_home().unwrap();

    let pool = db::connect_memory().await.unwrap();
    let materializer = Arc::new(Materializer::new(&config));
    let scheduler = Scheduler::new(&pool, config.clone(), materializer.clone(), defaults);
    let search = Arc::new(SearchEngine::new(&pool, &config, materializer.clone()));

    TestEngine {
        pool,
        config,
        materializer,
        scheduler,
        search,
        home,
    }
}

/// Wait until the scheduler has no active worker for the resource.
pub async fn wait_for_drain(scheduler: &Scheduler, resource_id: &str) {
    for _ in 0..300 {
        if !scheduler.is_active(resource_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scheduler did not drain for {resource_id}");
}

pub fn rg_available() -> bool {
    std::process::Command::new("rg")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
