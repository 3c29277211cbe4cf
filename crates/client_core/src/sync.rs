use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use chrono::Duration as ChronoDuration;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, Message, OutgoingMessage},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch, Mutex, OwnedMutexGuard,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    error::{ClientError, ClientResult},
    realtime::{ChannelStatus, RealtimeChannel},
    store::MessageStore,
    timeline::Timeline,
};

const EVENT_CAPACITY: usize = 256;

/// Notifications for UI observers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Messages newly merged into a timeline from the cache, a server sync or
    /// a successful send.
    TimelineUpdated {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    /// A realtime message that was not yet in the timeline.
    MessageReceived {
        conversation_id: ConversationId,
        message: Message,
    },
    TimelineCleared {
        conversation_id: ConversationId,
    },
    SyncFailed {
        conversation_id: ConversationId,
        error: ClientError,
    },
    ConnectionChanged(ChannelStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveTicket {
    conversation_id: ConversationId,
    generation: u64,
}

/// Merges the local cache, cursor-based server history and realtime pushes
/// into one deduplicated, ordered timeline per conversation.
pub struct SyncEngine {
    api: ChatApi,
    store: Arc<dyn MessageStore>,
    realtime: Arc<RealtimeChannel>,
    timelines: Mutex<HashMap<ConversationId, Arc<Mutex<Timeline>>>>,
    active: watch::Sender<Option<ActiveTicket>>,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        api: ChatApi,
        store: Arc<dyn MessageStore>,
        realtime: Arc<RealtimeChannel>,
    ) -> Arc<Self> {
        let (active, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            api,
            store,
            realtime,
            timelines: Mutex::new(HashMap::new()),
            active,
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active
            .borrow()
            .as_ref()
            .map(|ticket| ticket.conversation_id.clone())
    }

    fn is_current(&self, conversation_id: &ConversationId, generation: u64) -> bool {
        self.active.borrow().as_ref().is_some_and(|ticket| {
            ticket.conversation_id == *conversation_id && ticket.generation == generation
        })
    }

    fn current_generation(&self, conversation_id: &ConversationId) -> Option<u64> {
        self.active
            .borrow()
            .as_ref()
            .filter(|ticket| ticket.conversation_id == *conversation_id)
            .map(|ticket| ticket.generation)
    }

    fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn timeline_handle(&self, conversation_id: &ConversationId) -> Arc<Mutex<Timeline>> {
        let mut timelines = self.timelines.lock().await;
        Arc::clone(timelines.entry(conversation_id.clone()).or_default())
    }

    /// Locks the conversation's timeline, loading the cache into it first if
    /// that has not happened yet. Every cache write for the conversation
    /// happens while this guard is held.
    async fn lock_timeline(
        &self,
        conversation_id: &ConversationId,
    ) -> ClientResult<OwnedMutexGuard<Timeline>> {
        let mut timeline = self.timeline_handle(conversation_id).await.lock_owned().await;
        if !timeline.is_hydrated() {
            let cached = self.store.query_messages(conversation_id).await?;
            timeline.merge(cached);
            timeline.mark_hydrated();
        }
        Ok(timeline)
    }

    /// Snapshot of the materialized timeline.
    pub async fn timeline(&self, conversation_id: &ConversationId) -> ClientResult<Vec<Message>> {
        Ok(self.lock_timeline(conversation_id).await?.items().to_vec())
    }

    /// Creates or fetches the conversation with `participant_id` and caches it.
    pub async fn open_conversation(&self, participant_id: &UserId) -> ClientResult<Conversation> {
        let conversation = self.api.create_conversation(participant_id).await?;
        self.store.upsert_conversation(&conversation).await?;
        info!(
            conversation_id = %conversation.id,
            participant_id = %participant_id,
            "sync: conversation opened"
        );
        Ok(conversation)
    }

    /// Pulls the conversation list from the server into the cache and returns
    /// the cached list, most recently updated first.
    pub async fn refresh_conversations(&self) -> ClientResult<Vec<Conversation>> {
        let conversations = self.api.list_conversations().await?;
        for conversation in &conversations {
            self.store.upsert_conversation(conversation).await?;
        }
        debug!(count = conversations.len(), "sync: conversations refreshed");
        self.store.list_conversations().await
    }

    pub async fn local_conversations(&self) -> ClientResult<Vec<Conversation>> {
        self.store.list_conversations().await
    }

    /// Reads the cached messages (oldest first) and merges them into the
    /// timeline.
    pub async fn load_local(&self, conversation_id: &ConversationId) -> ClientResult<Vec<Message>> {
        let handle = self.timeline_handle(conversation_id).await;
        let mut timeline = handle.lock().await;
        let cached = self.store.query_messages(conversation_id).await?;
        let inserted = timeline.merge(cached.iter().cloned());
        timeline.mark_hydrated();
        drop(timeline);

        debug!(
            conversation_id = %conversation_id,
            cached = cached.len(),
            "sync: local cache loaded"
        );
        if !inserted.is_empty() {
            self.publish(SyncEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
                messages: inserted,
            });
        }
        Ok(cached)
    }

    /// Fetches messages newer than the latest cached one, persists them and
    /// merges them. Returns how many were new to the timeline.
    pub async fn sync_from_server(&self, conversation_id: &ConversationId) -> ClientResult<usize> {
        let generation = self.current_generation(conversation_id);
        self.sync_for(conversation_id, generation).await
    }

    /// `generation` ties the sync to one activation of the conversation; the
    /// result is dropped if the conversation was left or re-entered meanwhile.
    async fn sync_for(
        &self,
        conversation_id: &ConversationId,
        generation: Option<u64>,
    ) -> ClientResult<usize> {
        let is_stale = |engine: &Self| {
            generation.is_some_and(|generation| !engine.is_current(conversation_id, generation))
        };

        let cursor = self
            .store
            .latest_message_time(conversation_id)
            .await?
            .map(|latest| latest + ChronoDuration::milliseconds(1));
        debug!(conversation_id = %conversation_id, cursor = ?cursor, "sync: fetching history");
        let fetched = self.api.fetch_messages(conversation_id, cursor).await?;

        if is_stale(self) {
            debug!(conversation_id = %conversation_id, "sync: discarding stale history");
            return Ok(0);
        }
        let mut timeline = self.lock_timeline(conversation_id).await?;
        if is_stale(self) {
            debug!(conversation_id = %conversation_id, "sync: discarding stale history");
            return Ok(0);
        }

        self.store
            .upsert_messages(conversation_id, &fetched)
            .await?;
        let inserted = timeline.merge(fetched);
        drop(timeline);

        let count = inserted.len();
        info!(conversation_id = %conversation_id, new_messages = count, "sync: history synced");
        if count > 0 {
            self.publish(SyncEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
                messages: inserted,
            });
        }
        Ok(count)
    }

    /// Sends through the API. Only a message the server accepted is cached
    /// and shown.
    pub async fn send_message(
        &self,
        content: Option<String>,
        attachments: Vec<String>,
        conversation_id: &ConversationId,
    ) -> ClientResult<Message> {
        let content = content.filter(|text| !text.trim().is_empty());
        if content.is_none() && attachments.is_empty() {
            return Err(ClientError::Chat(
                "a message needs content or at least one attachment".into(),
            ));
        }

        let outgoing = OutgoingMessage {
            content,
            attachments,
        };
        let message = self.api.send_message(conversation_id, &outgoing).await?;
        info!(conversation_id = %conversation_id, message_id = %message.id, "sync: message sent");
        self.record_sent(conversation_id, &message).await;
        Ok(message)
    }

    /// The server already holds `message`, so local failures from here on
    /// are logged rather than returned.
    async fn record_sent(&self, conversation_id: &ConversationId, message: &Message) {
        let mut timeline = match self.lock_timeline(conversation_id).await {
            Ok(timeline) => timeline,
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    "sync: sent message left out of the timeline: {err}"
                );
                return;
            }
        };
        if let Err(err) = self
            .store
            .upsert_messages(conversation_id, std::slice::from_ref(message))
            .await
        {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "sync: failed to cache sent message: {err}"
            );
        }
        let inserted = timeline.merge([message.clone()]);
        drop(timeline);

        if !inserted.is_empty() {
            self.publish(SyncEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
                messages: inserted,
            });
        }
    }

    /// Persists a pushed message and publishes it unless the timeline already
    /// holds its id. Returns whether it was new.
    pub async fn on_realtime_message(&self, message: Message) -> ClientResult<bool> {
        let conversation_id = message.conversation_id.clone();
        let mut timeline = self.lock_timeline(&conversation_id).await?;
        self.store
            .upsert_messages(&conversation_id, std::slice::from_ref(&message))
            .await?;
        if timeline.contains(&message.id) {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "sync: realtime duplicate"
            );
            return Ok(false);
        }
        timeline.merge([message.clone()]);
        drop(timeline);

        self.publish(SyncEvent::MessageReceived {
            conversation_id,
            message,
        });
        Ok(true)
    }

    /// Removes the conversation's cached messages and empties its timeline.
    pub async fn delete_all_local(&self, conversation_id: &ConversationId) -> ClientResult<()> {
        let handle = self.timeline_handle(conversation_id).await;
        let mut timeline = handle.lock().await;
        self.store.delete_messages(conversation_id).await?;
        timeline.clear();
        drop(timeline);
        if self.active_conversation().as_ref() != Some(conversation_id) {
            self.timelines.lock().await.remove(conversation_id);
        }

        info!(conversation_id = %conversation_id, "sync: local messages deleted");
        self.publish(SyncEvent::TimelineCleared {
            conversation_id: conversation_id.clone(),
        });
        Ok(())
    }

    /// Makes `conversation_id` the active conversation: stops work for the
    /// previous one, loads the cache, then syncs with the server and follows
    /// realtime pushes in the background. Returns the cached messages.
    pub async fn enter_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> ClientResult<Vec<Message>> {
        let generation = self.activate(conversation_id).await;
        info!(conversation_id = %conversation_id, generation, "sync: entering conversation");
        let cached = self.load_local(conversation_id).await?;
        self.spawn_conversation_tasks(conversation_id, generation).await;
        Ok(cached)
    }

    /// Stops background work and closes the realtime connection.
    pub async fn leave_conversation(&self) {
        let previous = self.active.send_replace(None);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.abort_tasks().await;
        self.evict_inactive_timelines().await;
        self.realtime.disconnect().await;
        if let Some(previous) = previous {
            info!(conversation_id = %previous.conversation_id, "sync: left conversation");
        }
    }

    /// Foreground trigger: reconnects realtime and re-syncs the active
    /// conversation. Does nothing when no conversation is active.
    pub async fn resume(self: &Arc<Self>) {
        let Some(conversation_id) = self.active_conversation() else {
            debug!("sync: resume with no active conversation");
            return;
        };
        let generation = self.activate(&conversation_id).await;
        info!(conversation_id = %conversation_id, generation, "sync: resuming");
        self.spawn_conversation_tasks(&conversation_id, generation)
            .await;
    }

    async fn activate(&self, conversation_id: &ConversationId) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.send_replace(Some(ActiveTicket {
            conversation_id: conversation_id.clone(),
            generation,
        }));
        self.abort_tasks().await;
        self.evict_inactive_timelines().await;
        generation
    }

    /// Only the active conversation keeps its timeline in memory; others are
    /// rebuilt from the cache on next use.
    async fn evict_inactive_timelines(&self) {
        let active = self.active_conversation();
        let mut timelines = self.timelines.lock().await;
        timelines.retain(|conversation_id, _| active.as_ref() == Some(conversation_id));
    }

    async fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }
    }

    async fn spawn_conversation_tasks(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        generation: u64,
    ) {
        // Receivers are created before anything connects so no transition or
        // push is missed.
        let mut statuses = self.realtime.status_receiver();
        let mut inbound = self.realtime.subscribe_messages();
        let mut handles = Vec::with_capacity(3);

        let events = self.events.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let status = statuses.borrow_and_update().clone();
                let _ = events.send(SyncEvent::ConnectionChanged(status));
                if statuses.changed().await.is_err() {
                    break;
                }
            }
        }));

        let engine: Weak<Self> = Arc::downgrade(self);
        let id = conversation_id.clone();
        handles.push(tokio::spawn(async move {
            let Some(this) = engine.upgrade() else {
                return;
            };
            if let Err(err) = this.sync_for(&id, Some(generation)).await {
                if this.is_current(&id, generation) {
                    warn!(conversation_id = %id, "sync: server sync failed: {err}");
                    this.publish(SyncEvent::SyncFailed {
                        conversation_id: id,
                        error: err,
                    });
                }
            }
        }));

        let engine: Weak<Self> = Arc::downgrade(self);
        let realtime = Arc::clone(&self.realtime);
        let id = conversation_id.clone();
        handles.push(tokio::spawn(async move {
            realtime.connect(&id).await;
            loop {
                let received = inbound.recv().await;
                let Some(this) = engine.upgrade() else {
                    break;
                };
                match received {
                    Ok(pushed) if pushed.conversation_id == id => {
                        if let Err(err) = this.on_realtime_message(pushed.message).await {
                            warn!(
                                conversation_id = %id,
                                "sync: failed to ingest realtime message: {err}"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            conversation_id = %id,
                            skipped,
                            "sync: realtime ingest lagged; re-syncing"
                        );
                        if let Err(err) = this.sync_for(&id, Some(generation)).await {
                            this.publish(SyncEvent::SyncFailed {
                                conversation_id: id.clone(),
                                error: err,
                            });
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let mut tasks = self.tasks.lock().await;
        if self.is_current(conversation_id, generation) {
            tasks.extend(handles);
        } else {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
