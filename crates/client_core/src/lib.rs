use std::sync::Arc;

use anyhow::{Context, Result};
use shared::protocol::SignInCredential;
use storage::Storage;
use tracing::info;

pub mod api;
pub mod config;
pub mod error;
pub mod realtime;
pub mod request;
pub mod session;
pub mod store;
pub mod sync;
pub mod timeline;

pub use api::ChatApi;
pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, ClientResult};
pub use realtime::{ChannelStatus, ConnectionState, InboundMessage, RealtimeChannel};
pub use request::{ApiRequest, ApiResponse, RequestClient};
pub use session::{SessionManager, TokenRefresher};
pub use store::{CredentialStore, MemoryCredentialStore, MessageStore};
pub use sync::{SyncEngine, SyncEvent};
pub use timeline::Timeline;

/// The wired client: one session, one request client bound to it as the
/// refresh transport, one realtime channel and the sync engine on top.
pub struct ChatCore {
    session: Arc<SessionManager>,
    requests: Arc<RequestClient>,
    realtime: Arc<RealtimeChannel>,
    sync: Arc<SyncEngine>,
}

impl ChatCore {
    pub fn new(
        settings: &ClientSettings,
        credentials: Arc<dyn CredentialStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let session = SessionManager::new(credentials, settings.access_token_ttl());
        let requests = RequestClient::new(
            settings.api_base_url.as_str(),
            Arc::clone(&session),
            settings.request_timeout(),
        )
        .context("failed to build http client")?;
        let realtime = RealtimeChannel::new(
            settings.realtime_base_url()?,
            Arc::clone(&session),
            settings.connect_timeout(),
        );
        let sync = SyncEngine::new(
            ChatApi::new(Arc::clone(&requests)),
            messages,
            Arc::clone(&realtime),
        );
        Ok(Self {
            session,
            requests,
            realtime,
            sync,
        })
    }

    /// Opens the SQLite cache at `settings.database_url` and uses it for both
    /// credentials and messages.
    pub async fn open(settings: &ClientSettings) -> Result<Self> {
        let storage = Arc::new(Storage::new(&settings.database_url).await?);
        info!(api = %settings.api_base_url, "client: local cache ready");
        Self::new(settings, storage.clone(), storage)
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn requests(&self) -> &Arc<RequestClient> {
        &self.requests
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    pub async fn sign_in(&self, credential: &SignInCredential) -> ClientResult<()> {
        self.session.sign_in(credential).await
    }

    /// Leaves the active conversation and forgets the stored credentials.
    pub async fn sign_out(&self) -> ClientResult<()> {
        self.sync.leave_conversation().await;
        self.session.sign_out().await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
