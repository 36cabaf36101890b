//! Agent driver: quick answer, exploration, and deep research.
//!
//! All three entry points share one shape: build a system prompt
//! describing the scoped resources and tools, bound the step budget, run
//! the model loop executing tool calls between turns, and either buffer
//! the full outcome or stream events.
//!
//! Streaming producers emit a `ping` heartbeat every 5 seconds, always
//! finish with exactly one terminal event (`done` or `error`), and stop —
//! cancelling in-flight model and tool calls — when the consumer
//! disconnects. The background update check attached to a stream runs
//! exactly once per stream, whatever the terminal condition was.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::chat::{ChatMessage, FinishReason, ToolCall, Usage};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::StreamEvent;
use crate::models::{Resource, SearchOptions, SearchResult};
use crate::providers::Capabilities;
use crate::repo::Materializer;
use crate::resources::ResourceStore;
use crate::search::SearchEngine;
use crate::tools::{ToolContext, ToolRegistry};
use crate::update_check::UpdateChecker;

/// Step budgets per mode.
pub const EXPLORE_STEP_BUDGET: u32 = 20;
pub const DEEP_RESEARCH_STEP_BUDGET: u32 = 50;

const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Agent mode, persisted on research jobs and used for prompt selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Quick,
    Explore,
    DeepResearch,
}

/// One recorded model turn.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: u32,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<serde_json::Value>,
    pub finish: FinishReason,
}

/// Buffered result of an agent run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub text: String,
    pub sources: Vec<SearchResult>,
    pub steps: Vec<StepRecord>,
    pub usage: Usage,
}

pub struct AgentDriver {
    resources: ResourceStore,
    search: Arc<SearchEngine>,
    materializer: Arc<Materializer>,
    config: Arc<Config>,
    update_checker: Arc<UpdateChecker>,
}

impl AgentDriver {
    #[must_use]
    pub fn new(
        pool: &SqlitePool,
        config: Arc<Config>,
        materializer: Arc<Materializer>,
        search: Arc<SearchEngine>,
        update_checker: Arc<UpdateChecker>,
    ) -> Self {
        Self {
            resources: ResourceStore::new(pool.clone()),
            search,
            materializer,
            config,
            update_checker,
        }
    }

    async fn scope(&self, owner: Option<&str>, resource_ids: &[String]) -> Result<Vec<Resource>> {
        let resources = self.resources.list(owner, resource_ids).await?;
        if resources.is_empty() {
            return Err(Error::NotFound("no resources in scope".to_string()));
        }
        Ok(resources)
    }

    fn tool_context(&self, owner: Option<&str>, resources: Vec<Resource>, caps: &Capabilities) -> ToolContext {
        ToolContext {
            search: self.search.clone(),
            materializer: self.materializer.clone(),
            config: self.config.clone(),
            caps: caps.clone(),
            owner: owner.map(ToString::to_string),
            resources,
        }
    }

    /// One retrieval pass, one model call, no tools.
    pub async fn quick_answer(
        &self,
        owner: Option<&str>,
        resource_ids: &[String],
        query: &str,
        caps: &Capabilities,
    ) -> Result<AgentOutcome> {
        let resources = self.scope(owner, resource_ids).await?;
        let sources = self.retrieve(owner, &resources, query, caps).await?;

        let system = system_prompt(&resources, AgentMode::Quick);
        let prompt = quick_prompt(&sources, query);
        let step = caps
            .chat
            .step(&[ChatMessage::System(system), ChatMessage::User(prompt)], &[])
            .await?;

        Ok(AgentOutcome {
            text: step.text.clone(),
            sources,
            steps: vec![StepRecord {
                step: 1,
                text: step.text,
                reasoning: step.reasoning,
                tool_calls: Vec::new(),
                tool_results: Vec::new(),
                finish: step.finish,
            }],
            usage: step.usage,
        })
    }

    /// Tool-driven exploration, step budget 20.
    pub async fn explore(
        &self,
        owner: Option<&str>,
        resource_ids: &[String],
        query: &str,
        caps: &Capabilities,
    ) -> Result<AgentOutcome> {
        let resources = self.scope(owner, resource_ids).await?;
        let ctx = self.tool_context(owner, resources.clone(), caps);
        let system = system_prompt(&resources, AgentMode::Explore);
        self.run_loop(&system, query, EXPLORE_STEP_BUDGET, &ctx, caps, None)
            .await
    }

    /// Tool-driven research with broader coverage, step budget 50.
    pub async fn deep_research(
        &self,
        owner: Option<&str>,
        resource_ids: &[String],
        query: &str,
        caps: &Capabilities,
    ) -> Result<AgentOutcome> {
        let resources = self.scope(owner, resource_ids).await?;
        let ctx = self.tool_context(owner, resources.clone(), caps);
        let system = system_prompt(&resources, AgentMode::DeepResearch);
        self.run_loop(&system, query, DEEP_RESEARCH_STEP_BUDGET, &ctx, caps, None)
            .await
    }

    /// Streaming variant of [`Self::quick_answer`].
    #[must_use]
    pub fn quick_answer_stream(
        self: &Arc<Self>,
        owner: Option<String>,
        resource_ids: Vec<String>,
        query: String,
        caps: Capabilities,
    ) -> ReceiverStream<StreamEvent> {
        self.stream(owner, resource_ids, query, caps, AgentMode::Quick)
    }

    /// Streaming variant of [`Self::explore`].
    #[must_use]
    pub fn explore_stream(
        self: &Arc<Self>,
        owner: Option<String>,
        resource_ids: Vec<String>,
        query: String,
        caps: Capabilities,
    ) -> ReceiverStream<StreamEvent> {
        self.stream(owner, resource_ids, query, caps, AgentMode::Explore)
    }

    /// Streaming variant of [`Self::deep_research`].
    #[must_use]
    pub fn deep_research_stream(
        self: &Arc<Self>,
        owner: Option<String>,
        resource_ids: Vec<String>,
        query: String,
        caps: Capabilities,
    ) -> ReceiverStream<StreamEvent> {
        self.stream(owner, resource_ids, query, caps, AgentMode::DeepResearch)
    }

    fn stream(
        self: &Arc<Self>,
        owner: Option<String>,
        resource_ids: Vec<String>,
        query: String,
        caps: Capabilities,
        mode: AgentMode,
    ) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel::<StreamEvent>(32);
        let driver = Arc::clone(self);

        tokio::spawn(async move {
            let model = caps.chat.model_name().to_string();
            let mut sink = EventSink::new(tx.clone());

            let work = driver.stream_inner(&mut sink, owner.as_deref(), &resource_ids, &query, &caps, mode);
            tokio::pin!(work);

            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await; // the first tick fires immediately

            // Heartbeats and the work future share the channel; a closed
            // receiver cancels everything in flight.
            let outcome = loop {
                tokio::select! {
                    result = &mut work => break Some(result),
                    _ = ping.tick() => {
                        if tx.send(StreamEvent::Ping).await.is_err() {
                            break None;
                        }
                    }
                    () = tx.closed() => break None,
                }
            };

            match outcome {
                Some(Ok(())) => {
                    let _ = tx.send(StreamEvent::Done { model }).await;
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
                // Consumer disconnected: no further events.
                None => {}
            }

            // Attached side effect, exactly once per stream terminal.
            driver.schedule_update_check(owner.as_deref(), &resource_ids).await;
        });

        ReceiverStream::new(rx)
    }

    async fn stream_inner(
        &self,
        sink: &mut EventSink,
        owner: Option<&str>,
        resource_ids: &[String],
        query: &str,
        caps: &Capabilities,
        mode: AgentMode,
    ) -> Result<()> {
        let resources = self.scope(owner, resource_ids).await?;
        sink.send(StreamEvent::Start {
            model: caps.chat.model_name().to_string(),
        })
        .await?;

        match mode {
            AgentMode::Quick => {
                let sources = self.retrieve(owner, &resources, query, caps).await?;
                sink.send(StreamEvent::Sources {
                    sources: sources.clone(),
                })
                .await?;

                let system = system_prompt(&resources, AgentMode::Quick);
                let prompt = quick_prompt(&sources, query);
                let step = caps
                    .chat
                    .step(&[ChatMessage::System(system), ChatMessage::User(prompt)], &[])
                    .await?;
                if !step.text.is_empty() {
                    sink.text_delta(step.text).await?;
                }
                Ok(())
            }
            AgentMode::Explore | AgentMode::DeepResearch => {
                let budget = if mode == AgentMode::Explore {
                    EXPLORE_STEP_BUDGET
                } else {
                    DEEP_RESEARCH_STEP_BUDGET
                };
                let ctx = self.tool_context(owner, resources.clone(), caps);
                let system = system_prompt(&resources, mode);
                self.run_loop(&system, query, budget, &ctx, caps, Some(sink))
                    .await?;
                Ok(())
            }
        }
    }

    /// The shared model/tool loop. With a sink, events are emitted as the
    /// loop progresses; the buffered outcome is returned either way.
    async fn run_loop(
        &self,
        system: &str,
        query: &str,
        budget: u32,
        ctx: &ToolContext,
        caps: &Capabilities,
        mut sink: Option<&mut EventSink>,
    ) -> Result<AgentOutcome> {
        let registry = ToolRegistry::with_builtins();
        let specs = registry.specs();

        let mut messages = vec![
            ChatMessage::System(system.to_string()),
            ChatMessage::User(query.to_string()),
        ];
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut usage = Usage::default();
        let mut sources: Vec<SearchResult> = Vec::new();
        let mut seen_sources: HashSet<String> = HashSet::new();
        let mut final_text = String::new();

        for step_no in 1..=budget {
            let step = caps.chat.step(&messages, &specs).await?;
            usage.add(step.usage);

            if !step.text.is_empty() {
                if let Some(sink) = sink.as_deref_mut() {
                    sink.text_delta(step.text.clone()).await?;
                }
            }

            let mut record = StepRecord {
                step: step_no,
                text: step.text.clone(),
                reasoning: step.reasoning.clone(),
                tool_calls: step.tool_calls.clone(),
                tool_results: Vec::new(),
                finish: step.finish,
            };

            if step.tool_calls.is_empty() {
                final_text = step.text;
                steps.push(record);
                break;
            }

            messages.push(ChatMessage::Assistant {
                text: step.text.clone(),
                tool_calls: step.tool_calls.clone(),
            });

            for call in &step.tool_calls {
                if let Some(sink) = sink.as_deref_mut() {
                    sink.tool_call(call.name.clone(), call.input.clone()).await?;
                }

                let output = match registry.find(&call.name) {
                    Some(tool) => match tool.execute(call.input.clone(), ctx).await {
                        Ok(output) => output,
                        Err(e) => serde_json::json!({ "error": e.to_string() }),
                    },
                    None => serde_json::json!({ "error": format!("unknown tool: {}", call.name) }),
                };

                if call.name == "search" {
                    collect_sources(&output, &mut sources, &mut seen_sources);
                }

                if let Some(sink) = sink.as_deref_mut() {
                    sink.tool_result(call.name.clone(), output.clone()).await?;
                }
                record.tool_results.push(output.clone());
                messages.push(ChatMessage::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output,
                });
            }

            final_text = step.text;
            steps.push(record);
        }

        Ok(AgentOutcome {
            text: final_text,
            sources,
            steps,
            usage,
        })
    }

    async fn retrieve(
        &self,
        owner: Option<&str>,
        resources: &[Resource],
        query: &str,
        caps: &Capabilities,
    ) -> Result<Vec<SearchResult>> {
        let opts = SearchOptions {
            resource_ids: resources.iter().map(|r| r.id.clone()).collect(),
            alpha: self.config.search.alpha,
            top_k: self.config.search.top_k,
            ..SearchOptions::new(query)
        };
        self.search.search(owner, opts, caps).await
    }

    async fn schedule_update_check(&self, owner: Option<&str>, resource_ids: &[String]) {
        let ids = if resource_ids.is_empty() {
            match self.resources.list(owner, &[]).await {
                Ok(resources) => resources.into_iter().map(|r| r.id).collect(),
                Err(e) => {
                    tracing::warn!("update check scoping failed: {e}");
                    return;
                }
            }
        } else {
            resource_ids.to_vec()
        };
        self.update_checker.schedule(ids);
    }
}

/// Sends stream events, tracking tool-step numbering. Step numbers
/// increment when a tool-call follows an event of a different kind;
/// consecutive tool events share a step.
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    step: u32,
    last_was_tool: bool,
}

impl EventSink {
    fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            step: 0,
            last_was_tool: false,
        }
    }

    async fn send(&mut self, event: StreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::Upstream("stream consumer disconnected".to_string()))
    }

    async fn text_delta(&mut self, text: String) -> Result<()> {
        self.last_was_tool = false;
        self.send(StreamEvent::TextDelta { text }).await
    }

    async fn tool_call(&mut self, name: String, input: serde_json::Value) -> Result<()> {
        if !self.last_was_tool {
            self.step += 1;
        }
        self.last_was_tool = true;
        let step = self.step;
        self.send(StreamEvent::ToolCall { step, name, input }).await
    }

    async fn tool_result(&mut self, name: String, output: serde_json::Value) -> Result<()> {
        self.last_was_tool = true;
        let step = self.step;
        self.send(StreamEvent::ToolResult { step, name, output })
            .await
    }
}

fn system_prompt(resources: &[Resource], mode: AgentMode) -> String {
    let mut prompt = String::from(
        "You are a code research assistant answering questions about indexed \
         source repositories.\n\nAvailable resources:\n",
    );
    for r in resources {
        prompt.push_str(&format!(
            "- {} (id: {}, kind: {}, status: {:?})",
            r.name,
            r.id,
            r.kind.as_str(),
            r.status()
        ));
        if let Some(notes) = &r.notes {
            prompt.push_str(&format!(" — {notes}"));
        }
        prompt.push('\n');
    }

    match mode {
        AgentMode::Quick => prompt.push_str(
            "\nAnswer from the retrieved context provided in the question. \
             Cite file paths and line ranges.\n",
        ),
        AgentMode::Explore => prompt.push_str(
            "\nUse the search, grep, read, list, and glob tools to explore the \
             resources and answer the question. Cite file paths and line \
             ranges for every claim.\n",
        ),
        AgentMode::DeepResearch => prompt.push_str(
            "\nResearch the question thoroughly: cover every resource in \
             scope, cross-check findings with the grep and read tools, and \
             survey related modules before concluding. Prefer breadth first, \
             then depth. Cite file paths and line ranges for every claim, and \
             structure the final answer with headings.\n",
        ),
    }
    prompt
}

fn quick_prompt(sources: &[SearchResult], query: &str) -> String {
    let mut prompt = String::from("Retrieved context:\n\n");
    for (i, s) in sources.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {} {}:{}-{}\n{}\n\n",
            i + 1,
            s.resource_name,
            s.filepath,
            s.line_start,
            s.line_end,
            s.text
        ));
    }
    prompt.push_str(&format!("Question: {query}"));
    prompt
}

/// Accumulate unique sources from a search tool output, keyed by chunk id
/// with the positional key as fallback.
fn collect_sources(
    output: &serde_json::Value,
    sources: &mut Vec<SearchResult>,
    seen: &mut HashSet<String>,
) {
    let Some(results) = output.get("results").and_then(|r| r.as_array()) else {
        return;
    };
    for item in results {
        let chunk_id = item
            .get("chunk_id")
            .and_then(|c| c.as_str())
            .map(ToString::to_string);
        let resource_id = item
            .get("resource_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let filepath = item
            .get("filepath")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let line_start = item
            .get("line_start")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);

        let key = chunk_id
            .clone()
            .unwrap_or_else(|| format!("{resource_id}:{filepath}:{line_start}"));
        if !seen.insert(key) {
            continue;
        }

        let match_type = item
            .get("match_type")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(crate::models::MatchType::Text);
        sources.push(SearchResult {
            chunk_id,
            resource_id,
            resource_name: item
                .get("resource_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            filepath,
            line_start,
            line_end: item
                .get("line_end")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(line_start),
            text: item
                .get("preview")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            score: item
                .get("score")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            match_type,
            match_sources: match match_type {
                crate::models::MatchType::Hybrid => {
                    vec!["text".to_string(), "vector".to_string()]
                }
                crate::models::MatchType::Text => vec!["text".to_string()],
                crate::models::MatchType::Vector => vec!["vector".to_string()],
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_sources_dedupes_by_key() {
        let output = serde_json::json!({
            "results": [
                { "chunk_id": "c1", "resource_id": "r1", "resource_name": "demo",
                  "filepath": "a.rs", "line_start": 1, "line_end": 5,
                  "score": 0.5, "match_type": "vector", "preview": "alpha" },
                { "chunk_id": "c1", "resource_id": "r1", "resource_name": "demo",
                  "filepath": "a.rs", "line_start": 1, "line_end": 5,
                  "score": 0.5, "match_type": "vector", "preview": "alpha" },
                { "chunk_id": null, "resource_id": "r1", "resource_name": "demo",
                  "filepath": "b.rs", "line_start": 10, "line_end": 20,
                  "score": 0.2, "match_type": "text", "preview": "beta" },
            ]
        });
        let mut sources = Vec::new();
        let mut seen = HashSet::new();
        collect_sources(&output, &mut sources, &mut seen);
        collect_sources(&output, &mut sources, &mut seen);

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].chunk_id.as_deref(), Some("c1"));
        assert_eq!(sources[1].fusion_key(), "r1:b.rs:10");
        assert_eq!(sources[1].match_sources, vec!["text"]);
    }

    #[test]
    fn system_prompt_lists_resources() {
        let resource = Resource {
            id: "r-1".to_string(),
            owner_id: None,
            name: "demo".to_string(),
            scope: crate::models::Scope::Global,
            project_key: String::new(),
            kind: crate::models::ResourceKind::Local,
            url: None,
            path: Some("/tmp/demo".to_string()),
            branch: None,
            commit: None,
            paths: Vec::new(),
            notes: Some("test fixture".to_string()),
            content_status: crate::models::ContentStatus::Ready,
            vector_status: crate::models::VectorStatus::Ready,
            content_error: None,
            vector_error: None,
            chunk_count: 2,
            last_synced_at: None,
            last_indexed_at: None,
            last_local_commit: None,
            last_remote_commit: None,
            update_available: false,
            last_update_check_at: None,
            created_at: 0,
            updated_at: 0,
        };

        let prompt = system_prompt(&[resource], AgentMode::Explore);
        assert!(prompt.contains("demo"));
        assert!(prompt.contains("r-1"));
        assert!(prompt.contains("test fixture"));
        assert!(prompt.contains("grep"));

        let deep = system_prompt(&[], AgentMode::DeepResearch);
        assert!(deep.contains("thoroughly"));
    }

    #[test]
    fn quick_prompt_embeds_context_blocks() {
        let source = SearchResult {
            chunk_id: None,
            resource_id: "r1".to_string(),
            resource_name: "demo".to_string(),
            filepath: "src/auth.rs".to_string(),
            line_start: 12,
            line_end: 30,
            text: "fn login() {}".to_string(),
            score: 0.4,
            match_type: crate::models::MatchType::Hybrid,
            match_sources: vec!["text".to_string(), "vector".to_string()],
        };
        let prompt = quick_prompt(&[source], "how does login work?");
        assert!(prompt.contains("src/auth.rs:12-30"));
        assert!(prompt.contains("fn login() {}"));
        assert!(prompt.ends_with("Question: how does login work?"));
    }
}
