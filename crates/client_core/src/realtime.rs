use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::ConversationId,
    protocol::{Message, OutgoingMessage, RealtimeCommand, RealtimeEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::{AbortHandle, JoinHandle},
};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header::AUTHORIZATION, HeaderValue},
        Message as WsMessage,
    },
};
use tracing::{debug, info, warn};

use crate::session::SessionManager;

const INBOUND_CAPACITY: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub conversation_id: Option<ConversationId>,
    pub state: ConnectionState,
}

impl ChannelStatus {
    pub fn is_connected_to(&self, conversation_id: &ConversationId) -> bool {
        self.state == ConnectionState::Connected
            && self.conversation_id.as_ref() == Some(conversation_id)
    }
}

/// A chat message pushed by the server on an active connection.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub conversation_id: ConversationId,
    pub message: Message,
}

struct ActiveConnection {
    conversation_id: ConversationId,
    connection_id: u64,
    outbound: mpsc::UnboundedSender<RealtimeCommand>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ActiveConnection {
    /// Stops reading immediately; the writer gets a short grace period to
    /// deliver a close frame once its queue is dropped.
    fn shutdown(self) {
        self.reader.abort();
        drop(self.outbound);
        let writer = self.writer;
        tokio::spawn(async move {
            let abort = writer.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                abort.abort();
            }
        });
    }
}

/// What the channel currently owns. The lock around it is never held while
/// a handshake is in progress.
#[derive(Default)]
enum Slot {
    #[default]
    Idle,
    Handshaking {
        conversation_id: ConversationId,
        connection_id: u64,
        handshake: AbortHandle,
    },
    Open(ActiveConnection),
}

impl Slot {
    fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Slot::Idle => None,
            Slot::Handshaking {
                conversation_id, ..
            } => Some(conversation_id),
            Slot::Open(active) => Some(&active.conversation_id),
        }
    }

    fn is_handshaking(&self, id: u64) -> bool {
        matches!(self, Slot::Handshaking { connection_id, .. } if *connection_id == id)
    }

    fn open(&self) -> Option<&ActiveConnection> {
        match self {
            Slot::Open(active) => Some(active),
            _ => None,
        }
    }

    fn close(self) {
        match self {
            Slot::Idle => {}
            Slot::Handshaking {
                conversation_id,
                handshake,
                ..
            } => {
                debug!(conversation_id = %conversation_id, "realtime: cancelling handshake");
                handshake.abort();
            }
            Slot::Open(active) => active.shutdown(),
        }
    }
}

/// Websocket connection to one conversation at a time.
///
/// Never returns errors: failures are reported through the status channel.
pub struct RealtimeChannel {
    base_url: String,
    session: Arc<SessionManager>,
    connect_timeout: Duration,
    slot: Mutex<Slot>,
    status: watch::Sender<ChannelStatus>,
    messages: broadcast::Sender<InboundMessage>,
    next_connection_id: AtomicU64,
}

impl RealtimeChannel {
    /// `base_url` is the `ws://` or `wss://` root; connections go to
    /// `{base_url}/chats/{conversation_id}`.
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionManager>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ChannelStatus::default());
        let (messages, _) = broadcast::channel(INBOUND_CAPACITY);
        Arc::new(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            connect_timeout,
            slot: Mutex::new(Slot::Idle),
            status,
            messages,
            next_connection_id: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_status(&self) -> WatchStream<ChannelStatus> {
        WatchStream::new(self.status.subscribe())
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    pub fn message_stream(&self) -> BroadcastStream<InboundMessage> {
        BroadcastStream::new(self.messages.subscribe())
    }

    /// The conversation with an open connection, if any.
    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.slot
            .lock()
            .await
            .open()
            .map(|active| active.conversation_id.clone())
    }

    fn set_status(&self, conversation_id: Option<ConversationId>, state: ConnectionState) {
        let next = ChannelStatus {
            conversation_id,
            state,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn build_request(&self, conversation_id: &ConversationId) -> Result<Request, String> {
        let url = format!("{}/chats/{}", self.base_url, conversation_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| format!("invalid realtime url {url}: {err}"))?;
        match self.session.get_access_token().await {
            Ok(token) => match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    request.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(err) => warn!("realtime: access token is not a valid header value: {err}"),
            },
            Err(err) => debug!("realtime: connecting without credential: {err}"),
        }
        Ok(request)
    }

    /// Opens the connection for `conversation_id`, replacing any connection
    /// to a different conversation, and waits for the handshake to settle.
    /// A connection to the same conversation, open or still handshaking, is
    /// left alone.
    pub async fn connect(self: &Arc<Self>, conversation_id: &ConversationId) {
        let handshake = {
            let mut slot = self.slot.lock().await;
            if slot.conversation_id() == Some(conversation_id) {
                debug!(conversation_id = %conversation_id, "realtime: already connected");
                return;
            }
            let previous = std::mem::take(&mut *slot);
            if let Some(previous_id) = previous.conversation_id() {
                info!(conversation_id = %previous_id, "realtime: closing previous connection");
            }
            previous.close();

            let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_status(Some(conversation_id.clone()), ConnectionState::Connecting);

            // Detached: a dropped caller must not leave the slot handshaking.
            let handshake =
                tokio::spawn(Arc::clone(self).open(conversation_id.clone(), connection_id));
            *slot = Slot::Handshaking {
                conversation_id: conversation_id.clone(),
                connection_id,
                handshake: handshake.abort_handle(),
            };
            handshake
        };

        if let Err(err) = handshake.await {
            if err.is_cancelled() {
                debug!(conversation_id = %conversation_id, "realtime: handshake cancelled");
            } else {
                warn!(conversation_id = %conversation_id, "realtime: handshake task failed: {err}");
            }
        }
    }

    async fn open(self: Arc<Self>, conversation_id: ConversationId, connection_id: u64) {
        let request = match self.build_request(&conversation_id).await {
            Ok(request) => request,
            Err(reason) => {
                warn!(conversation_id = %conversation_id, "realtime: {reason}");
                self.fail_handshake(connection_id, conversation_id, reason).await;
                return;
            }
        };

        let stream = match tokio::time::timeout(self.connect_timeout, connect_async(request)).await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => {
                warn!(conversation_id = %conversation_id, "realtime: handshake failed: {err}");
                let reason = err.to_string();
                self.fail_handshake(connection_id, conversation_id, reason).await;
                return;
            }
            Err(_) => {
                warn!(conversation_id = %conversation_id, "realtime: handshake timed out");
                let reason = "handshake timed out".to_string();
                self.fail_handshake(connection_id, conversation_id, reason).await;
                return;
            }
        };

        let mut slot = self.slot.lock().await;
        if !slot.is_handshaking(connection_id) {
            debug!(
                conversation_id = %conversation_id,
                connection_id,
                "realtime: dropping superseded connection"
            );
            return;
        }

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RealtimeCommand>();

        let writer_conversation = conversation_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(
                            conversation_id = %writer_conversation,
                            "realtime: failed to encode outbound event: {err}"
                        );
                        continue;
                    }
                };
                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                    warn!(conversation_id = %writer_conversation, "realtime: send failed: {err}");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader_conversation = conversation_id.clone();
        let inbound = self.messages.clone();
        let channel: Weak<Self> = Arc::downgrade(&self);
        let reader = tokio::spawn(async move {
            let mut end_state = ConnectionState::Disconnected;
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        publish_frame(&inbound, &reader_conversation, &text);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            conversation_id = %reader_conversation,
                            "realtime: receive failed: {err}"
                        );
                        end_state = ConnectionState::Error(err.to_string());
                        break;
                    }
                }
            }
            if let Some(channel) = channel.upgrade() {
                channel.finish_connection(connection_id, end_state).await;
            }
        });

        *slot = Slot::Open(ActiveConnection {
            conversation_id: conversation_id.clone(),
            connection_id,
            outbound,
            reader,
            writer,
        });
        info!(conversation_id = %conversation_id, connection_id, "realtime: connected");
        self.set_status(Some(conversation_id), ConnectionState::Connected);
    }

    /// Records a failed handshake unless it was already cancelled or replaced.
    async fn fail_handshake(
        &self,
        connection_id: u64,
        conversation_id: ConversationId,
        reason: String,
    ) {
        let mut slot = self.slot.lock().await;
        if slot.is_handshaking(connection_id) {
            *slot = Slot::Idle;
            self.set_status(Some(conversation_id), ConnectionState::Error(reason));
        }
    }

    /// Called by a reader task when its socket ends. A connection that was
    /// already replaced leaves the current state alone.
    async fn finish_connection(&self, connection_id: u64, state: ConnectionState) {
        let mut slot = self.slot.lock().await;
        let Some(current) = slot.open() else {
            return;
        };
        if current.connection_id != connection_id {
            return;
        }
        let conversation_id = current.conversation_id.clone();
        if let Slot::Open(ended) = std::mem::take(&mut *slot) {
            drop(ended.outbound);
        }
        info!(conversation_id = %conversation_id, connection_id, "realtime: connection ended");
        let conversation = match state {
            ConnectionState::Error(_) => Some(conversation_id),
            _ => None,
        };
        self.set_status(conversation, state);
    }

    /// Emits a chat event on the active connection. Returns `false` when no
    /// connection to `conversation_id` is open.
    pub async fn send(&self, payload: &OutgoingMessage, conversation_id: &ConversationId) -> bool {
        let slot = self.slot.lock().await;
        match slot.open() {
            Some(current) if current.conversation_id == *conversation_id => current
                .outbound
                .send(RealtimeCommand::Chat(payload.clone()))
                .is_ok(),
            _ => false,
        }
    }

    /// Tears down the active connection or cancels a pending handshake. Safe
    /// to call when disconnected.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        let previous = std::mem::take(&mut *slot);
        if let Some(conversation_id) = previous.conversation_id() {
            info!(conversation_id = %conversation_id, "realtime: disconnecting");
        }
        previous.close();
        self.set_status(None, ConnectionState::Disconnected);
    }
}

fn publish_frame(
    inbound: &broadcast::Sender<InboundMessage>,
    conversation_id: &ConversationId,
    text: &str,
) {
    match serde_json::from_str::<RealtimeEvent>(text) {
        Ok(RealtimeEvent::Chat(message)) => {
            if message.conversation_id != *conversation_id {
                debug!(
                    conversation_id = %conversation_id,
                    message_conversation = %message.conversation_id,
                    "realtime: dropping message for another conversation"
                );
                return;
            }
            debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "realtime: message received"
            );
            let _ = inbound.send(InboundMessage {
                conversation_id: conversation_id.clone(),
                message,
            });
        }
        Err(err) => {
            warn!(conversation_id = %conversation_id, "realtime: dropping malformed frame: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
