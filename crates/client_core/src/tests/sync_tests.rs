use super::*;
use crate::{
    api::format_cursor,
    realtime::ConnectionState,
    request::RequestClient,
    session::SessionManager,
    store::{CredentialStore, MemoryCredentialStore},
    test_support::{at, chat_frame, message, spawn_router, RealtimePeer, CLOSE_SIGNAL},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use shared::{
    domain::{credential_keys, MessageId},
    error::ErrorCode,
    protocol::CreateConversationRequest,
};
use std::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicUsize},
    time::Duration,
};
use storage::Storage;

#[derive(Default)]
struct ApiState {
    history: std::sync::Mutex<HashMap<String, Vec<Message>>>,
    delays: std::sync::Mutex<HashMap<String, Duration>>,
    cursors: std::sync::Mutex<Vec<(String, Option<String>)>>,
    fail_history: AtomicBool,
    fail_send: AtomicBool,
    sent: AtomicUsize,
}

impl ApiState {
    fn set_history(&self, conversation: &str, messages: Vec<Message>) {
        self.history
            .lock()
            .expect("history")
            .insert(conversation.to_string(), messages);
    }

    fn delay(&self, conversation: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delays")
            .insert(conversation.to_string(), delay);
    }

    fn cursors(&self) -> Vec<(String, Option<String>)> {
        self.cursors.lock().expect("cursors").clone()
    }
}

type ApiShared = Arc<ApiState>;

async fn history(
    State(state): State<ApiShared>,
    Path(conversation): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<serde_json::Value>)> {
    let next = params.get("next").cloned();
    state
        .cursors
        .lock()
        .expect("cursors")
        .push((conversation.clone(), next.clone()));
    let delay = state.delays.lock().expect("delays").get(&conversation).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if state.fail_history.load(Ordering::SeqCst) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": "internal", "message": "history unavailable"})),
        ));
    }
    let after = next.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .expect("cursor is rfc3339")
            .with_timezone(&Utc)
    });
    let messages = state
        .history
        .lock()
        .expect("history")
        .get(&conversation)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|m| after.map_or(true, |after| m.created_at >= after))
        .collect();
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<ApiShared>,
    Path(conversation): Path<String>,
    Json(outgoing): Json<OutgoingMessage>,
) -> Result<Json<Message>, (StatusCode, Json<serde_json::Value>)> {
    if state.fail_send.load(Ordering::SeqCst) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": "internal", "message": "send rejected"})),
        ));
    }
    let n = state.sent.fetch_add(1, Ordering::SeqCst) as i64 + 1;
    let message = Message {
        id: MessageId::new(format!("sent-{n}")),
        conversation_id: ConversationId::new(conversation.as_str()),
        sender_id: UserId::new("me"),
        content: outgoing.content,
        attachments: outgoing.attachments,
        created_at: at(10_000 + n),
        updated_at: at(10_000 + n),
    };
    state
        .history
        .lock()
        .expect("history")
        .entry(conversation)
        .or_default()
        .push(message.clone());
    Ok(Json(message))
}

async fn create_conversation(Json(body): Json<CreateConversationRequest>) -> Json<Conversation> {
    Json(crate::test_support::conversation(&format!("dm-{}", body.opponent_id)))
}

async fn list_conversations() -> Json<Vec<Conversation>> {
    let mut older = crate::test_support::conversation("c-old");
    older.updated_at = at(1_000);
    let mut newer = crate::test_support::conversation("c-new");
    newer.updated_at = at(5_000);
    Json(vec![older, newer])
}

/// The SQLite cache with a switch that makes message writes fail.
struct SwitchableCache {
    inner: Arc<Storage>,
    reject_writes: AtomicBool,
}

#[async_trait::async_trait]
impl MessageStore for SwitchableCache {
    async fn upsert_messages(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> ClientResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Storage("disk full".into()));
        }
        MessageStore::upsert_messages(self.inner.as_ref(), conversation_id, messages).await
    }

    async fn query_messages(&self, conversation_id: &ConversationId) -> ClientResult<Vec<Message>> {
        MessageStore::query_messages(self.inner.as_ref(), conversation_id).await
    }

    async fn latest_message_time(
        &self,
        conversation_id: &ConversationId,
    ) -> ClientResult<Option<DateTime<Utc>>> {
        MessageStore::latest_message_time(self.inner.as_ref(), conversation_id).await
    }

    async fn delete_messages(&self, conversation_id: &ConversationId) -> ClientResult<()> {
        MessageStore::delete_messages(self.inner.as_ref(), conversation_id).await
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> ClientResult<()> {
        MessageStore::upsert_conversation(self.inner.as_ref(), conversation).await
    }

    async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        MessageStore::list_conversations(self.inner.as_ref()).await
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    storage: Arc<Storage>,
    cache: Arc<SwitchableCache>,
    api: ApiShared,
    peer: RealtimePeer,
}

async fn harness() -> Harness {
    let api = Arc::new(ApiState::default());
    let app = Router::new()
        .route("/chats", get(list_conversations).post(create_conversation))
        .route("/chats/:conversation_id", get(history).post(post_message))
        .with_state(api.clone());
    let api_url = spawn_router(app).await;
    let peer = RealtimePeer::spawn().await;

    let credentials = Arc::new(MemoryCredentialStore::new());
    credentials
        .set(credential_keys::ACCESS_TOKEN, "access")
        .await
        .expect("seed access");
    credentials
        .set(credential_keys::REFRESH_TOKEN, "refresh")
        .await
        .expect("seed refresh");
    let session = SessionManager::new(credentials, Duration::from_secs(300));
    let client =
        RequestClient::new(&api_url, Arc::clone(&session), Duration::from_secs(5)).expect("client");
    let realtime = RealtimeChannel::new(&peer.ws_url, session, Duration::from_secs(2));
    let storage = Arc::new(Storage::new("sqlite::memory:").await.expect("storage"));
    let cache = Arc::new(SwitchableCache {
        inner: storage.clone(),
        reject_writes: AtomicBool::new(false),
    });
    let engine = SyncEngine::new(ChatApi::new(client), cache.clone(), realtime);

    Harness {
        engine,
        storage,
        cache,
        api,
        peer,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// How many times `id` was handed to observers as a new message.
fn publications(events: &[SyncEvent], id: &str) -> usize {
    events
        .iter()
        .map(|event| match event {
            SyncEvent::TimelineUpdated { messages, .. } => {
                messages.iter().filter(|m| m.id.as_str() == id).count()
            }
            SyncEvent::MessageReceived { message, .. } if message.id.as_str() == id => 1,
            _ => 0,
        })
        .sum()
}

async fn timeline_ids(engine: &SyncEngine, conversation: &ConversationId) -> Vec<String> {
    ids(&engine.timeline(conversation).await.expect("timeline"))
}

/// Conversations whose timeline is currently held in memory.
async fn resident_timelines(engine: &SyncEngine) -> Vec<String> {
    let mut resident: Vec<String> = engine
        .timelines
        .lock()
        .await
        .keys()
        .map(|id| id.to_string())
        .collect();
    resident.sort();
    resident
}

#[tokio::test]
async fn first_open_shows_cache_then_merges_server_history() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.storage
        .upsert_messages(&c1, &[message("m1", "c1", 100), message("m2", "c1", 200)])
        .await
        .expect("seed cache");
    h.api.set_history(
        "c1",
        vec![
            message("m1", "c1", 100),
            message("m2", "c1", 200),
            message("m3", "c1", 300),
            message("m4", "c1", 400),
        ],
    );

    let cached = h.engine.enter_conversation(&c1).await.expect("enter");
    assert_eq!(ids(&cached), ["m1", "m2"]);

    eventually("server history merged", || async {
        timeline_ids(&h.engine, &c1).await.len() == 4
    })
    .await;
    assert_eq!(timeline_ids(&h.engine, &c1).await, ["m1", "m2", "m3", "m4"]);
    assert_eq!(
        h.api.cursors(),
        [("c1".to_string(), Some(format_cursor(at(201))))]
    );
    assert_eq!(
        ids(&h.storage.query_messages(&c1).await.expect("cache")),
        ["m1", "m2", "m3", "m4"]
    );
}

#[tokio::test]
async fn cursor_is_absent_on_first_sync_and_follows_the_latest_message() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.api.set_history(
        "c1",
        vec![message("m1", "c1", 100), message("m2", "c1", 250)],
    );

    assert_eq!(h.engine.sync_from_server(&c1).await.expect("first"), 2);
    assert_eq!(h.engine.sync_from_server(&c1).await.expect("repeat"), 0);

    assert_eq!(
        h.api.cursors(),
        [
            ("c1".to_string(), None),
            ("c1".to_string(), Some(format_cursor(at(251)))),
        ]
    );
    assert_eq!(timeline_ids(&h.engine, &c1).await, ["m1", "m2"]);
}

#[tokio::test]
async fn realtime_message_during_sync_is_shown_once() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    let m3 = message("m3", "c1", 300);
    h.api.set_history(
        "c1",
        vec![message("m1", "c1", 100), m3.clone(), message("m4", "c1", 400)],
    );
    h.api.delay("c1", Duration::from_millis(400));
    let mut events = h.engine.subscribe();

    h.engine.enter_conversation(&c1).await.expect("enter");
    eventually("realtime connected", || async {
        h.engine.realtime().status().is_connected_to(&c1)
    })
    .await;
    h.peer.push(chat_frame(&m3));
    h.peer.push(chat_frame(&message("m5", "c1", 500)));

    eventually("history and pushes merged", || async {
        timeline_ids(&h.engine, &c1).await.len() == 4
    })
    .await;
    // Let any straggling work finish before counting publications.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(timeline_ids(&h.engine, &c1).await, ["m1", "m3", "m4", "m5"]);
    let events = drain(&mut events);
    assert_eq!(publications(&events, "m3"), 1);
    assert_eq!(publications(&events, "m5"), 1);
    assert_eq!(h.storage.query_messages(&c1).await.expect("cache").len(), 4);
}

#[tokio::test]
async fn switching_conversations_discards_stale_history() {
    let h = harness().await;
    let a = ConversationId::new("a");
    let b = ConversationId::new("b");
    h.api.set_history("a", vec![message("a1", "a", 100)]);
    h.api.delay("a", Duration::from_millis(300));
    h.api.set_history("b", vec![message("b1", "b", 100)]);

    h.engine.enter_conversation(&a).await.expect("enter a");
    let engine = Arc::clone(&h.engine);
    let explicit = tokio::spawn({
        let a = a.clone();
        async move { engine.sync_from_server(&a).await }
    });
    // Give the explicit sync time to issue its request.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.enter_conversation(&b).await.expect("enter b");

    assert_eq!(explicit.await.expect("join").expect("stale sync"), 0);
    eventually("b synced", || async {
        timeline_ids(&h.engine, &b).await == ["b1"]
    })
    .await;
    assert!(h.storage.query_messages(&a).await.expect("cache").is_empty());
    assert!(timeline_ids(&h.engine, &a).await.is_empty());
    assert_eq!(h.engine.active_conversation(), Some(b.clone()));
    eventually("realtime moved to b", || async {
        h.engine.realtime().status().is_connected_to(&b)
    })
    .await;
}

#[tokio::test]
async fn failed_send_leaves_no_trace() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.api.fail_send.store(true, Ordering::SeqCst);
    let mut events = h.engine.subscribe();

    let err = h
        .engine
        .send_message(Some("hello".into()), Vec::new(), &c1)
        .await
        .expect_err("rejected");
    assert_eq!(
        err,
        ClientError::Http {
            status: 500,
            code: ErrorCode::Internal,
            message: "send rejected".into()
        }
    );
    assert!(timeline_ids(&h.engine, &c1).await.is_empty());
    assert!(h.storage.query_messages(&c1).await.expect("cache").is_empty());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn delivered_message_is_returned_when_caching_it_fails() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.cache.reject_writes.store(true, Ordering::SeqCst);
    let mut events = h.engine.subscribe();

    let sent = h
        .engine
        .send_message(Some("hello".into()), Vec::new(), &c1)
        .await
        .expect("delivered");

    assert_eq!(h.api.sent.load(Ordering::SeqCst), 1);
    assert_eq!(timeline_ids(&h.engine, &c1).await, [sent.id.to_string()]);
    assert!(h.storage.query_messages(&c1).await.expect("cache").is_empty());
    assert_eq!(publications(&drain(&mut events), sent.id.as_str()), 1);
}

#[tokio::test]
async fn empty_messages_are_rejected_before_sending() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");

    for content in [None, Some("   ".to_string())] {
        let err = h
            .engine
            .send_message(content, Vec::new(), &c1)
            .await
            .expect_err("empty");
        assert!(matches!(err, ClientError::Chat(_)), "got {err:?}");
    }
    assert_eq!(h.api.sent.load(Ordering::SeqCst), 0);

    let sent = h
        .engine
        .send_message(None, vec!["https://cdn.example/p.png".into()], &c1)
        .await
        .expect("attachment only");
    assert_eq!(sent.attachments.len(), 1);
    assert_eq!(sent.content, None);
}

#[tokio::test]
async fn sent_message_is_not_republished_by_its_realtime_echo() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.engine.enter_conversation(&c1).await.expect("enter");
    eventually("realtime connected", || async {
        h.engine.realtime().status().is_connected_to(&c1)
    })
    .await;
    let mut events = h.engine.subscribe();

    let sent = h
        .engine
        .send_message(Some("hi".into()), Vec::new(), &c1)
        .await
        .expect("sent");
    assert_eq!(timeline_ids(&h.engine, &c1).await, [sent.id.to_string()]);

    h.peer.push(chat_frame(&sent));
    h.peer.push(chat_frame(&message("marker", "c1", 20_000)));
    eventually("marker received", || async {
        timeline_ids(&h.engine, &c1).await.len() == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(&mut events);
    assert_eq!(publications(&events, sent.id.as_str()), 1);
    assert_eq!(publications(&events, "marker"), 1);
    assert!(!h.engine.on_realtime_message(sent.clone()).await.expect("ingest"));
}

#[tokio::test]
async fn delete_all_local_clears_cache_and_timeline() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.storage
        .upsert_messages(&c1, &[message("m1", "c1", 100)])
        .await
        .expect("seed");
    h.api.set_history("c1", vec![message("m1", "c1", 100)]);
    assert_eq!(ids(&h.engine.load_local(&c1).await.expect("load")), ["m1"]);
    let mut events = h.engine.subscribe();

    h.engine.delete_all_local(&c1).await.expect("delete");

    assert!(timeline_ids(&h.engine, &c1).await.is_empty());
    assert!(h.storage.query_messages(&c1).await.expect("cache").is_empty());
    let cleared = drain(&mut events).into_iter().any(|event| {
        matches!(event, SyncEvent::TimelineCleared { conversation_id } if conversation_id == c1)
    });
    assert!(cleared);

    // Without a cached message the next sync starts from scratch.
    assert_eq!(h.engine.sync_from_server(&c1).await.expect("resync"), 1);
    assert_eq!(h.api.cursors().last().cloned(), Some(("c1".to_string(), None)));
}

#[tokio::test]
async fn sync_failure_keeps_the_local_timeline() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.storage
        .upsert_messages(&c1, &[message("m1", "c1", 100)])
        .await
        .expect("seed");
    h.api.fail_history.store(true, Ordering::SeqCst);
    let mut events = h.engine.subscribe();

    let cached = h.engine.enter_conversation(&c1).await.expect("enter");
    assert_eq!(ids(&cached), ["m1"]);

    let failure = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await.expect("event") {
                SyncEvent::SyncFailed {
                    conversation_id,
                    error,
                } => break (conversation_id, error),
                _ => continue,
            }
        }
    })
    .await
    .expect("failure published");
    assert_eq!(failure.0, c1);
    assert!(matches!(failure.1, ClientError::Http { status: 500, .. }));
    assert_eq!(timeline_ids(&h.engine, &c1).await, ["m1"]);
}

#[tokio::test]
async fn open_conversation_caches_the_result() {
    let h = harness().await;

    let conversation = h
        .engine
        .open_conversation(&UserId::new("peer"))
        .await
        .expect("open");
    assert_eq!(conversation.id.as_str(), "dm-peer");

    let local = h.engine.local_conversations().await.expect("local");
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, conversation.id);
}

#[tokio::test]
async fn refreshed_conversations_are_listed_most_recent_first() {
    let h = harness().await;

    let listed = h.engine.refresh_conversations().await.expect("refresh");
    let listed: Vec<_> = listed.iter().map(|c| c.id.to_string()).collect();
    assert_eq!(listed, ["c-new", "c-old"]);
}

#[tokio::test]
async fn leave_and_resume_drive_the_realtime_connection() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    h.api.set_history("c1", vec![message("m1", "c1", 100)]);

    h.engine.enter_conversation(&c1).await.expect("enter");
    eventually("connected", || async {
        h.engine.realtime().status().is_connected_to(&c1)
    })
    .await;

    // A remote close is not retried until the caller resumes.
    h.peer.push(CLOSE_SIGNAL);
    eventually("remote close observed", || async {
        h.engine.realtime().status().state == ConnectionState::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.peer.connections(), 1);

    h.engine.resume().await;
    eventually("reconnected", || async {
        h.engine.realtime().status().is_connected_to(&c1)
    })
    .await;
    assert_eq!(h.peer.connections(), 2);
    eventually("re-synced", || async { h.api.cursors().len() == 2 }).await;

    h.engine.leave_conversation().await;
    assert_eq!(h.engine.active_conversation(), None);
    assert_eq!(
        h.engine.realtime().status().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn connection_changes_are_forwarded_to_observers() {
    let h = harness().await;
    let c1 = ConversationId::new("c1");
    let mut events = h.engine.subscribe();

    h.engine.enter_conversation(&c1).await.expect("enter");

    let connected = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let SyncEvent::ConnectionChanged(status) = events.recv().await.expect("event") {
                if status.is_connected_to(&c1) {
                    break status;
                }
            }
        }
    })
    .await
    .expect("connected status forwarded");
    assert_eq!(connected.conversation_id, Some(c1));
}

#[tokio::test]
async fn only_the_active_conversation_keeps_a_timeline_in_memory() {
    let h = harness().await;
    let a = ConversationId::new("a");
    let b = ConversationId::new("b");
    let c = ConversationId::new("c");
    h.storage
        .upsert_messages(&a, &[message("a1", "a", 100)])
        .await
        .expect("seed");

    h.engine.enter_conversation(&a).await.expect("enter a");
    assert_eq!(resident_timelines(&h.engine).await, ["a"]);

    h.engine.enter_conversation(&b).await.expect("enter b");
    assert_eq!(resident_timelines(&h.engine).await, ["b"]);

    // Clearing a conversation that is not open does not keep it resident.
    h.engine.load_local(&c).await.expect("load c");
    h.engine.delete_all_local(&c).await.expect("delete c");
    assert_eq!(resident_timelines(&h.engine).await, ["b"]);

    h.engine.leave_conversation().await;
    assert!(resident_timelines(&h.engine).await.is_empty());

    // An evicted timeline is rebuilt from the cache.
    assert_eq!(timeline_ids(&h.engine, &a).await, ["a1"]);
}
