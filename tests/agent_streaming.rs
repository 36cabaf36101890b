//! Agent driver tests: buffered runs, event streams, cancellation, and
//! the attached update check.

mod common;

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

use common::{caps, engine, ScriptedChat, StallingChat, TestEngine};
use ctxpack::agent::AgentDriver;
use ctxpack::chat::{ChatMessage, ChatModel, ModelStep, ToolSpec};
use ctxpack::error::{Error, Result};
use ctxpack::events::StreamEvent;
use ctxpack::models::{ContentStatus, NewResource, ResourceKind};
use ctxpack::repo::GitProbe;
use ctxpack::resources::ResourceStore;
use ctxpack::update_check::UpdateChecker;

/// Counts head probes so tests can assert the update check ran once.
struct CountingProbe {
    head_calls: AtomicUsize,
}

#[async_trait]
impl GitProbe for CountingProbe {
    async fn head_commit(&self, _dir: &Path) -> Option<String> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        Some("deadbeef01".to_string())
    }
    async fn remote_head(&self, _url: &str, _branch: &str) -> Option<String> {
        Some("deadbeef02".to_string())
    }
}

struct FailingChat;

#[async_trait]
impl ChatModel for FailingChat {
    fn model_name(&self) -> &str {
        "failing"
    }
    async fn step(&self, _: &[ChatMessage], _: &[ToolSpec]) -> Result<ModelStep> {
        Err(Error::Upstream("model unavailable".to_string()))
    }
}

struct Fixture {
    engine: TestEngine,
    driver: Arc<AgentDriver>,
    probe: Arc<CountingProbe>,
    resource_id: String,
}

/// Engine plus driver over one ready git resource with a materialized
/// (empty) checkout directory and a counting probe.
async fn fixture(chat: Arc<dyn ChatModel>) -> Fixture {
    let capabilities = caps(Arc::new(common::BetaEmbedder), chat);
    let engine = engine(capabilities).await;

    let resources = ResourceStore::new(engine.pool.clone());
    let resource = resources
        .create(NewResource {
            name: "repo".to_string(),
            kind: Some(ResourceKind::Git),
            url: Some("https://example.com/repo.git".to_string()),
            branch: Some("main".to_string()),
            ..NewResource::default()
        })
        .await
        .unwrap();
    resources
        .set_content_status(&resource.id, ContentStatus::Ready, None)
        .await
        .unwrap();
    std::fs::create_dir_all(engine.config.repos_dir().join(&resource.id)).unwrap();
    std::fs::write(
        engine.config.repos_dir().join(&resource.id).join("a.txt"),
        "alpha\n",
    )
    .unwrap();

    let probe = Arc::new(CountingProbe {
        head_calls: AtomicUsize::new(0),
    });
    let checker = Arc::new(UpdateChecker::new(
        resources,
        probe.clone(),
        engine.config.repos_dir(),
    ));
    let driver = Arc::new(AgentDriver::new(
        &engine.pool,
        engine.config.clone(),
        engine.materializer.clone(),
        engine.search.clone(),
        checker,
    ));

    Fixture {
        engine,
        driver,
        probe,
        resource_id: resource.id,
    }
}

fn chat_caps(chat: Arc<dyn ChatModel>) -> ctxpack::providers::Capabilities {
    caps(Arc::new(common::BetaEmbedder), chat)
}

#[tokio::test]
async fn explore_buffered_records_steps_and_tool_results() {
    let chat: Arc<dyn ChatModel> = Arc::new(ScriptedChat::new(vec![
        ScriptedChat::tool_step("list", serde_json::json!({})),
        ScriptedChat::text_step("one file: a.txt"),
    ]));
    let fixture = fixture(chat.clone()).await;

    let outcome = fixture
        .driver
        .explore(
            None,
            &[fixture.resource_id.clone()],
            "what files exist?",
            &chat_caps(chat),
        )
        .await
        .unwrap();

    assert_eq!(outcome.text, "one file: a.txt");
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].tool_calls.len(), 1);
    assert_eq!(outcome.steps[0].tool_calls[0].name, "list");
    let files = &outcome.steps[0].tool_results[0]["files"];
    assert_eq!(files[0], "a.txt");
    assert!(outcome.usage.input_tokens > 0);
}

#[tokio::test]
async fn explore_stream_emits_ordered_events_and_terminal_done() {
    let chat: Arc<dyn ChatModel> = Arc::new(ScriptedChat::new(vec![
        ScriptedChat::tool_step("list", serde_json::json!({})),
        ScriptedChat::text_step("done exploring"),
    ]));
    let fixture = fixture(chat.clone()).await;

    let mut stream = fixture.driver.explore_stream(
        None,
        vec![fixture.resource_id.clone()],
        "what files exist?".to_string(),
        chat_caps(chat),
    );

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert!(matches!(events[0], StreamEvent::Start { .. }));
    assert!(matches!(
        events[1],
        StreamEvent::ToolCall { step: 1, ref name, .. } if name == "list"
    ));
    assert!(matches!(
        events[2],
        StreamEvent::ToolResult { step: 1, ref name, .. } if name == "list"
    ));
    assert!(matches!(
        events[3],
        StreamEvent::TextDelta { ref text } if text == "done exploring"
    ));
    assert!(matches!(events[4], StreamEvent::Done { .. }));
    assert_eq!(events.len(), 5);

    // Exactly one terminal event, and it is the last one.
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);

    // The attached update check ran exactly once.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.probe.head_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_error_is_terminal_and_still_schedules_update_check() {
    let chat: Arc<dyn ChatModel> = Arc::new(FailingChat);
    let fixture = fixture(chat.clone()).await;

    let mut stream = fixture.driver.explore_stream(
        None,
        vec![fixture.resource_id.clone()],
        "anything".to_string(),
        chat_caps(chat),
    );

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert!(matches!(events[0], StreamEvent::Start { .. }));
    assert!(matches!(
        events.last().unwrap(),
        StreamEvent::Error { message } if message.contains("model unavailable")
    ));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.probe.head_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnecting_after_tool_call_cancels_and_checks_once() {
    let chat: Arc<dyn ChatModel> = Arc::new(ScriptedChat::new(vec![
        ScriptedChat::tool_step("list", serde_json::json!({})),
        ScriptedChat::text_step("never observed"),
    ]));
    let fixture = fixture(chat.clone()).await;

    let mut stream = fixture.driver.explore_stream(
        None,
        vec![fixture.resource_id.clone()],
        "what files exist?".to_string(),
        chat_caps(chat),
    );

    // Consume up to the first tool-call, then disconnect.
    loop {
        match stream.next().await {
            Some(StreamEvent::ToolCall { .. }) => break,
            Some(_) => {}
            None => panic!("stream ended before a tool-call"),
        }
    }
    drop(stream);

    // The producer stops and the side effect still runs exactly once.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fixture.probe.head_calls.load(Ordering::SeqCst), 1);

    let resources = ResourceStore::new(fixture.engine.pool.clone());
    let after = resources.get(&fixture.resource_id).await.unwrap();
    assert!(after.update_available);
    assert_eq!(after.last_local_commit.as_deref(), Some("deadbeef01"));
    assert_eq!(after.last_remote_commit.as_deref(), Some("deadbeef02"));
}

#[tokio::test(start_paused = true)]
async fn idle_stream_heartbeats_every_five_seconds() {
    let chat: Arc<dyn ChatModel> = Arc::new(StallingChat);
    let fixture = fixture(chat.clone()).await;

    let mut stream = fixture.driver.explore_stream(
        None,
        vec![fixture.resource_id.clone()],
        "anything".to_string(),
        chat_caps(chat),
    );

    assert!(matches!(
        stream.next().await,
        Some(StreamEvent::Start { .. })
    ));
    // Paused time auto-advances to the ping ticks.
    assert!(matches!(stream.next().await, Some(StreamEvent::Ping)));
    assert!(matches!(stream.next().await, Some(StreamEvent::Ping)));
}

#[tokio::test]
async fn quick_answer_stream_emits_sources_then_text() {
    // A local resource that is not content-ready: retrieval comes back
    // empty without consulting either subtrack's backends.
    let chat: Arc<dyn ChatModel> =
        Arc::new(ScriptedChat::new(vec![ScriptedChat::text_step(
            "no indexed context yet",
        )]));
    let capabilities = caps(Arc::new(common::BetaEmbedder), chat.clone());
    let engine = engine(capabilities.clone()).await;

    let resources = ResourceStore::new(engine.pool.clone());
    let resource = resources
        .create(NewResource {
            name: "fresh".to_string(),
            kind: Some(ResourceKind::Local),
            path: Some("/tmp/fresh".to_string()),
            ..NewResource::default()
        })
        .await
        .unwrap();

    let probe = Arc::new(CountingProbe {
        head_calls: AtomicUsize::new(0),
    });
    let checker = Arc::new(UpdateChecker::new(
        resources,
        probe,
        engine.config.repos_dir(),
    ));
    let driver = Arc::new(AgentDriver::new(
        &engine.pool,
        engine.config.clone(),
        engine.materializer.clone(),
        engine.search.clone(),
        checker,
    ));

    let mut stream = driver.quick_answer_stream(
        None,
        vec![resource.id],
        "what is this?".to_string(),
        capabilities,
    );

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert!(matches!(events[0], StreamEvent::Start { .. }));
    assert!(matches!(events[1], StreamEvent::Sources { ref sources } if sources.is_empty()));
    assert!(matches!(
        events[2],
        StreamEvent::TextDelta { ref text } if text == "no indexed context yet"
    ));
    assert!(matches!(events[3], StreamEvent::Done { .. }));
}

#[tokio::test]
async fn async_research_job_persists_the_outcome() {
    let chat: Arc<dyn ChatModel> = Arc::new(ScriptedChat::new(vec![
        ScriptedChat::tool_step("list", serde_json::json!({})),
        ScriptedChat::text_step("the repository holds one file"),
    ]));
    let fixture = fixture(chat.clone()).await;

    let store = ctxpack::research::ResearchStore::new(fixture.engine.pool.clone());
    let job = store
        .create(
            None,
            "what does the repo contain?",
            &[fixture.resource_id.clone()],
            &ctxpack::models::ResearchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, ctxpack::models::ResearchStatus::Queued);

    ctxpack::research::spawn_research(
        store.clone(),
        fixture.driver.clone(),
        job.clone(),
        chat_caps(chat),
    );

    let mut done = None;
    for _ in 0..300 {
        let row = store.get(&job.id).await.unwrap();
        if matches!(
            row.status,
            ctxpack::models::ResearchStatus::Completed | ctxpack::models::ResearchStatus::Failed
        ) {
            done = Some(row);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let done = done.expect("research job never finished");
    assert_eq!(done.status, ctxpack::models::ResearchStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["text"], "the repository holds one file");
    assert!(result["steps"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn quick_answer_buffered_returns_text_and_sources() {
    let chat: Arc<dyn ChatModel> =
        Arc::new(ScriptedChat::new(vec![ScriptedChat::text_step(
            "nothing indexed yet",
        )]));
    let capabilities = caps(Arc::new(common::BetaEmbedder), chat.clone());
    let engine = engine(capabilities.clone()).await;

    let resources = ResourceStore::new(engine.pool.clone());
    let resource = resources
        .create(NewResource {
            name: "fresh".to_string(),
            kind: Some(ResourceKind::Local),
            path: Some("/tmp/fresh".to_string()),
            ..NewResource::default()
        })
        .await
        .unwrap();

    let probe = Arc::new(CountingProbe {
        head_calls: AtomicUsize::new(0),
    });
    let checker = Arc::new(UpdateChecker::new(
        resources,
        probe,
        engine.config.repos_dir(),
    ));
    let driver = AgentDriver::new(
        &engine.pool,
        engine.config.clone(),
        engine.materializer.clone(),
        engine.search.clone(),
        checker,
    );

    let outcome = driver
        .quick_answer(None, &[resource.id], "what is this?", &capabilities)
        .await
        .unwrap();
    assert_eq!(outcome.text, "nothing indexed yet");
    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.steps.len(), 1);
    assert!(outcome.steps[0].tool_calls.is_empty());
}
