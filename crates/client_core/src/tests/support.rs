//! Fixtures shared by the crate's unit tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationId, CredentialPair, MessageId, UserId},
    protocol::{Conversation, Message, RealtimeEvent, SignInCredential, UserRef},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
};

use crate::{
    error::{ClientError, ClientResult},
    session::TokenRefresher,
};

/// Text that makes the realtime peer close every open socket.
pub const CLOSE_SIGNAL: &str = "__close__";

pub const BASE_MS: i64 = 1_714_557_600_000;

pub fn at(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(BASE_MS + offset_ms)
        .single()
        .expect("timestamp")
}

pub fn message(id: &str, conversation: &str, offset_ms: i64) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new("peer"),
        content: Some(format!("body of {id}")),
        attachments: Vec::new(),
        created_at: at(offset_ms),
        updated_at: at(offset_ms),
    }
}

pub fn chat_frame(message: &Message) -> String {
    serde_json::to_string(&RealtimeEvent::Chat(message.clone())).expect("frame")
}

pub fn conversation(id: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        participants: vec![
            UserRef {
                id: UserId::new("me"),
                nickname: None,
                profile_image: None,
            },
            UserRef {
                id: UserId::new("peer"),
                nickname: Some("peer".into()),
                profile_image: None,
            },
        ],
        created_at: at(0),
        updated_at: at(0),
        last_message: None,
        last_message_at: None,
    }
}

/// Serves `app` on an ephemeral localhost port and returns its `http://` base.
pub async fn spawn_router(app: Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Scripted refresh transport that counts how often it is hit.
pub struct TestRefresher {
    pub calls: AtomicUsize,
    pub delay: Duration,
    outcomes: Mutex<Vec<ClientResult<CredentialPair>>>,
    fallback: ClientResult<CredentialPair>,
}

impl TestRefresher {
    pub fn succeeding(access: &str, refresh: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            outcomes: Mutex::new(Vec::new()),
            fallback: Ok(CredentialPair::new(access, refresh)),
        })
    }

    pub fn failing(err: ClientError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
            outcomes: Mutex::new(Vec::new()),
            fallback: Err(err),
        })
    }

    /// Outcomes handed out in order before falling back to the default.
    pub fn scripted(outcomes: Vec<ClientResult<CredentialPair>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
            outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
            fallback: Err(ClientError::RefreshFailed("script exhausted".into())),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for TestRefresher {
    async fn refresh_tokens(&self, _refresh_token: &str) -> ClientResult<CredentialPair> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match self.outcomes.lock().await.pop() {
            Some(outcome) => outcome,
            None => self.fallback.clone(),
        }
    }

    async fn exchange_sign_in(
        &self,
        _credential: &SignInCredential,
    ) -> ClientResult<CredentialPair> {
        self.fallback.clone()
    }
}

struct PeerState {
    connections: AtomicUsize,
    auth_headers: std::sync::Mutex<Vec<Option<String>>>,
    push: broadcast::Sender<String>,
    received: mpsc::UnboundedSender<(String, String)>,
}

/// Websocket peer serving `/chats/{id}`. Text pushed through [`Self::push`]
/// goes to every open socket; frames sent by clients land in `received`.
pub struct RealtimePeer {
    state: Arc<PeerState>,
    pub received: mpsc::UnboundedReceiver<(String, String)>,
    pub ws_url: String,
}

impl RealtimePeer {
    pub async fn spawn() -> Self {
        let (push, _) = broadcast::channel(64);
        let (received_tx, received) = mpsc::unbounded_channel();
        let state = Arc::new(PeerState {
            connections: AtomicUsize::new(0),
            auth_headers: std::sync::Mutex::new(Vec::new()),
            push,
            received: received_tx,
        });
        let app = Router::new()
            .route("/chats/:conversation_id", get(upgrade_socket))
            .with_state(state.clone());
        let http_url = spawn_router(app).await;
        Self {
            state,
            received,
            ws_url: http_url.replacen("http://", "ws://", 1),
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        self.state
            .push
            .send(text.into())
            .expect("a socket is listening");
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.state.auth_headers.lock().expect("headers").clone()
    }
}

async fn upgrade_socket(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    State(state): State<Arc<PeerState>>,
    headers: HeaderMap,
) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.auth_headers.lock().expect("headers").push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let push = state.push.subscribe();
    let received = state.received.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, conversation_id, push, received))
}

async fn serve_socket(
    mut socket: WebSocket,
    conversation_id: String,
    mut push: broadcast::Receiver<String>,
    received: mpsc::UnboundedSender<(String, String)>,
) {
    loop {
        tokio::select! {
            pushed = push.recv() => {
                let Ok(text) = pushed else { break };
                if text == CLOSE_SIGNAL {
                    let _ = socket.send(WsFrame::Close(None)).await;
                    break;
                }
                if socket.send(WsFrame::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsFrame::Text(text))) => {
                        let _ = received.send((conversation_id.clone(), text));
                    }
                    Some(Ok(WsFrame::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
