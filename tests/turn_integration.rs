//! 回合级集成测试：Mock 模型 + Mock 提供方 + 内存会话存储

use std::sync::Arc;
use std::time::Duration;

use itinera::config::AppConfig;
use itinera::core::{TurnError, TurnRequest, STOPPED_RESPONSE};
use itinera::itinerary::{ImageMode, SourceRecord};
use itinera::llm::{
    LlmBackends, LlmError, MockLlmClient, MockReply, ModelCandidate, ModelTaskRouter, StabilityTier,
    TaskName,
};
use itinera::memory::Message;
use itinera::providers::{
    MockGeocoder, MockImageSynthesizer, MockPhotoSearch, MockVideoSource, Providers,
};
use itinera::session::{MemorySessionStore, SessionStatus, SessionStore, StepLedger, StepStatus};
use itinera::{Orchestrator, TurnEvent};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

const SESSION: &str = "trip-1";
const OWNER: &str = "alice";
const VIDEO_URL: &str = "https://youtu.be/kyoto1";

fn kyoto_source() -> SourceRecord {
    SourceRecord {
        id: "kyoto1".into(),
        url: VIDEO_URL.into(),
        title: "One day in Kyoto".into(),
        author: Some("Wanderer".into()),
        description: Some("Fushimi Inari at dawn, Kinkaku-ji after lunch".into()),
        thumbnail_url: None,
        provider: "YouTube".into(),
    }
}

fn providers(video: MockVideoSource) -> Providers {
    Providers {
        video: Arc::new(video),
        geocoder: Arc::new(
            MockGeocoder::new()
                .with_place("Fushimi Inari Taisha, Kyoto", 34.967, 135.772)
                .with_place("Kinkaku-ji, Kyoto", 35.039, 135.729),
        ),
        photos: Arc::new(MockPhotoSearch::new()),
        images: Arc::new(MockImageSynthesizer::new()),
    }
}

fn orchestrator(llm: Arc<MockLlmClient>, store: Arc<MemorySessionStore>, video: MockVideoSource) -> Orchestrator {
    Orchestrator::builder(AppConfig::default())
        .with_router(ModelTaskRouter::defaults().with_provider("mock"))
        .with_backends(LlmBackends::new().with("mock", llm))
        .with_providers(providers(video))
        .with_store(store)
        .with_preview_dir("out")
        .build()
}

fn drain(rx: &mut UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn script_full_trip(llm: &MockLlmClient) {
    llm.push_text(format!(r#"{{"tool": "fetch_video", "args": {{"url": "{VIDEO_URL}"}}}}"#))
        .push_text(r#"{"tool": "extract_itinerary", "args": {}}"#)
        .push_text(
            r#"{"title": "Kyoto in a day", "blocks": [
                {"type": "spot", "day": 1, "title": "Fushimi Inari", "place_query": "Fushimi Inari Taisha, Kyoto", "time_hint": "dawn"},
                {"type": "meal", "day": 1, "title": "Lunch in Nishiki Market"},
                {"type": "spot", "day": 1, "title": "Golden Pavilion", "place_query": "Kinkaku-ji, Kyoto"}
            ]}"#,
        )
        .push_text(r#"{"tool": "resolve_locations", "args": {}}"#)
        .push_text(r#"{"tool": "search_images", "args": {}}"#)
        .push_text(r#"{"tool": "summarize_trip", "args": {}}"#)
        .push_text("Shrine gates at dawn, market lunch, a golden temple in the afternoon.")
        .push_text(r#"{"tool": "render_document", "args": {}}"#)
        .push_text("Your Kyoto itinerary is ready.");
}

#[tokio::test]
async fn test_full_turn_persists_ledger_and_snapshot() {
    let llm = Arc::new(MockLlmClient::new());
    script_full_trip(&llm);
    let store = Arc::new(MemorySessionStore::new());
    let orch = orchestrator(
        llm.clone(),
        store.clone(),
        MockVideoSource::new().with_record(kyoto_source()),
    );
    let (tx, mut rx) = unbounded_channel();

    let request = TurnRequest::new(vec![Message::user(format!("Plan my trip from {VIDEO_URL}"))])
        .with_session(SESSION, OWNER);
    let outcome = orch
        .run_turn(request, &CancellationToken::new(), Some(&tx))
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.response, "Your Kyoto itinerary is ready.");
    assert!(!outcome.compacted);
    let doc = outcome.document.clone().unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.preview_path, "out/trip-1/v1.md");
    assert_eq!(doc.image_mode, Some(ImageMode::Searched));
    assert!(doc.markdown.contains("Golden Pavilion"));
    assert_eq!(llm.call_count(), 9);

    let steps = store.list_steps(SESSION, OWNER).await.unwrap();
    let tools: Vec<&str> = steps.iter().map(|s| s.tool_name.as_str()).collect();
    assert_eq!(
        tools,
        [
            "fetch_video",
            "extract_itinerary",
            "resolve_locations",
            "search_images",
            "summarize_trip",
            "render_document"
        ]
    );
    assert!(steps.iter().all(|s| s.status == StepStatus::Success));

    assert_eq!(store.get_status(SESSION, OWNER).await.unwrap(), SessionStatus::Completed);
    let snapshot = store.get_snapshot(SESSION, OWNER).await.unwrap().unwrap();
    assert_eq!(snapshot.blocks.len(), 3);
    assert_eq!(snapshot.spot_blocks.len(), 2);
    assert!(snapshot.spot_blocks.iter().all(|s| s.is_resolved()));
    assert_eq!(snapshot.rendered_document.map(|d| d.version), Some(1));

    let messages = store.load_messages(SESSION, OWNER).await.unwrap();
    assert_eq!(messages.len(), outcome.messages.len());
    assert_eq!(messages.last().map(|m| m.content.as_str()), Some("Your Kyoto itinerary is ready."));

    let events = drain(&mut rx);
    let tool_calls = events
        .iter()
        .filter(|e| matches!(e, TurnEvent::ToolCall { .. }))
        .count();
    assert_eq!(tool_calls, 6);
    assert!(events.contains(&TurnEvent::MessageDone));
    assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. } | TurnEvent::Stopped)));
}

#[tokio::test]
async fn test_second_turn_hydrates_from_snapshot() {
    let llm = Arc::new(MockLlmClient::new());
    script_full_trip(&llm);
    let store = Arc::new(MemorySessionStore::new());
    let video = MockVideoSource::new().with_record(kyoto_source());
    let orch = orchestrator(llm.clone(), store.clone(), video);

    let first = orch
        .run_turn(
            TurnRequest::new(vec![Message::user(format!("Plan my trip from {VIDEO_URL}"))])
                .with_session(SESSION, OWNER),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    // 第二回合消息超过 12 条，先做一次压缩摘要
    llm.push_text("- User planned a day in Kyoto from a video.")
        .push_text("The document is already up to date.");
    let mut messages = first.messages.clone();
    messages.push(Message::user("Is everything done?"));
    let second = orch
        .run_turn(
            TurnRequest::new(messages).with_session(SESSION, OWNER),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(second.compacted);
    assert_eq!(second.response, "The document is already up to date.");
    assert_eq!(second.document.map(|d| d.version), Some(1));

    let calls = llm.calls();
    let planner_system = calls.last().unwrap().system_text();
    assert!(planner_system.contains("3 blocks, 2 spots (2 with coordinates)"));
    assert!(planner_system.contains("document: version 1"));
    assert!(planner_system.contains("User planned a day in Kyoto"));
    assert!(planner_system.contains("video: One day in Kyoto"));
}

#[tokio::test]
async fn test_cancellation_marks_step_and_session() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_text(format!(r#"{{"tool": "fetch_video", "args": {{"url": "{VIDEO_URL}"}}}}"#));
    let store = Arc::new(MemorySessionStore::new());
    let orch = orchestrator(
        llm.clone(),
        store.clone(),
        MockVideoSource::new()
            .with_record(kyoto_source())
            .with_delay(Duration::from_secs(30)),
    );
    let (tx, mut rx) = unbounded_channel();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = orch
        .run_turn(
            TurnRequest::new(vec![Message::user("Plan it")]).with_session(SESSION, OWNER),
            &cancel,
            Some(&tx),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Cancelled);
    assert_eq!(outcome.response, STOPPED_RESPONSE);
    assert_eq!(store.get_status(SESSION, OWNER).await.unwrap(), SessionStatus::Cancelled);

    let steps = store.list_steps(SESSION, OWNER).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Cancelled);
    assert!(drain(&mut rx).contains(&TurnEvent::Stopped));
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_fallback_model_after_construction_failure() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_text("Happy to help with your trip.");
    let mut route = ModelTaskRouter::defaults()
        .with_provider("mock")
        .resolve(TaskName::Orchestrate)
        .clone();
    route.primary = ModelCandidate::new("absent", "gpt-4.1", StabilityTier::Stable);
    route.fallback = Some(ModelCandidate::new("mock", "deepseek-chat", StabilityTier::Stable));
    let router = ModelTaskRouter::defaults().with_provider("mock").with_route(route);

    let orch = Orchestrator::builder(AppConfig::default())
        .with_router(router)
        .with_backends(LlmBackends::new().with("mock", llm.clone()))
        .with_providers(providers(MockVideoSource::new()))
        .build();
    let (tx, mut rx) = unbounded_channel();

    let outcome = orch
        .run_turn(
            TurnRequest::new(vec![Message::user("hi")]),
            &CancellationToken::new(),
            Some(&tx),
        )
        .await
        .unwrap();

    assert_eq!(outcome.response, "Happy to help with your trip.");
    assert_eq!(outcome.model_used.label, "mock/deepseek-chat");
    assert_eq!(llm.calls()[0].model_id, "deepseek-chat");
    assert!(drain(&mut rx).contains(&TurnEvent::FallbackModel {
        model: "mock/deepseek-chat".into()
    }));
}

#[tokio::test]
async fn test_model_failure_marks_session_errored() {
    let llm = Arc::new(
        MockLlmClient::new().with_default(MockReply::Fail(LlmError::Transport(
            "upstream 503 at /v1/chat".into(),
        ))),
    );
    let store = Arc::new(MemorySessionStore::new());
    let orch = orchestrator(llm.clone(), store.clone(), MockVideoSource::new());
    let (tx, mut rx) = unbounded_channel();

    let err = orch
        .run_turn(
            TurnRequest::new(vec![Message::user("Plan it")]).with_session(SESSION, OWNER),
            &CancellationToken::new(),
            Some(&tx),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::Task(_)));
    // 主模型与回退各 2 次（max_retries = 1）
    assert_eq!(llm.call_count(), 4);
    assert_eq!(store.get_status(SESSION, OWNER).await.unwrap(), SessionStatus::Error);
    assert!(store.error_message(SESSION).await.is_some());

    let events = drain(&mut rx);
    let text = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Error { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap();
    assert!(!text.contains("503"));
}

#[tokio::test]
async fn test_session_owned_by_someone_else_is_rejected() {
    let llm = Arc::new(MockLlmClient::new());
    let store = Arc::new(MemorySessionStore::new());
    store.mark_completed(SESSION, "bob").await.unwrap();
    let orch = orchestrator(llm.clone(), store.clone(), MockVideoSource::new());

    let err = orch
        .run_turn(
            TurnRequest::new(vec![Message::user("Plan it")]).with_session(SESSION, OWNER),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::Store(_)));
    assert_eq!(llm.call_count(), 0);
}
