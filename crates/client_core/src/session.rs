use std::{
    sync::{Arc, OnceLock, Weak},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use shared::{
    domain::{credential_keys, CredentialPair},
    protocol::SignInCredential,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ClientError, ClientResult},
    store::CredentialStore,
};

pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Network side of credential renewal. Implemented by the request client; the
/// session manager only ever holds it through a [`Weak`] handle.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns [`ClientError::SessionExpired`] when the refresh token itself
    /// was rejected.
    async fn refresh_tokens(&self, refresh_token: &str) -> ClientResult<CredentialPair>;
    async fn exchange_sign_in(&self, credential: &SignInCredential)
        -> ClientResult<CredentialPair>;
}

type InflightRefresh = Shared<BoxFuture<'static, ClientResult<String>>>;

struct CachedAccessToken {
    value: String,
    obtained_at: Instant,
}

/// Owns the access/refresh credential pair.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
    cached: RwLock<Option<CachedAccessToken>>,
    /// Serializes every read and write of the credential keys.
    store_io: Mutex<()>,
    inflight: Mutex<Option<InflightRefresh>>,
    refresher: OnceLock<Weak<dyn TokenRefresher>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CredentialStore>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            ttl,
            cached: RwLock::new(None),
            store_io: Mutex::new(()),
            inflight: Mutex::new(None),
            refresher: OnceLock::new(),
        })
    }

    /// Binds the transport used for refresh and sign-in. Only the first
    /// binding takes effect.
    pub fn bind_refresher(&self, refresher: Weak<dyn TokenRefresher>) {
        if self.refresher.set(refresher).is_err() {
            warn!("session: refresh transport already bound; ignoring rebind");
        }
    }

    fn refresher(&self) -> ClientResult<Arc<dyn TokenRefresher>> {
        self.refresher
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ClientError::RefreshFailed("refresh transport unavailable".into()))
    }

    pub async fn get_access_token(&self) -> ClientResult<String> {
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.obtained_at.elapsed() < self.ttl {
                    return Ok(cached.value.clone());
                }
            }
        }

        let _io = self.store_io.lock().await;
        let value = self.store.get(credential_keys::ACCESS_TOKEN).await?;
        *self.cached.write().await = Some(CachedAccessToken {
            value: value.clone(),
            obtained_at: Instant::now(),
        });
        Ok(value)
    }

    pub async fn has_session(&self) -> bool {
        let _io = self.store_io.lock().await;
        self.store.get(credential_keys::REFRESH_TOKEN).await.is_ok()
    }

    /// Renews the access token. Concurrent callers share one refresh task and
    /// all receive its outcome.
    pub async fn refresh(self: &Arc<Self>) -> ClientResult<String> {
        let task = {
            let mut inflight = self.inflight.lock().await;
            match inflight.as_ref() {
                Some(existing) => {
                    debug!("session: joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let manager = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        let result = manager.perform_refresh().await;
                        manager.inflight.lock().await.take();
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|err| {
                            Err(ClientError::RefreshFailed(format!(
                                "refresh task did not complete: {err}"
                            )))
                        })
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(shared.clone());
                    shared
                }
            }
        };

        task.await
    }

    async fn perform_refresh(&self) -> ClientResult<String> {
        let refresh_token = {
            let _io = self.store_io.lock().await;
            match self.store.get(credential_keys::REFRESH_TOKEN).await {
                Ok(token) => token,
                Err(ClientError::NotFound(_)) => return Err(ClientError::AuthenticationRequired),
                Err(err) => return Err(err),
            }
        };
        let refresher = self.refresher()?;

        info!("session: refreshing access token");
        match refresher.refresh_tokens(&refresh_token).await {
            Ok(pair) => {
                self.persist_pair(&pair).await?;
                info!("session: access token refreshed");
                Ok(pair.access_token)
            }
            Err(ClientError::SessionExpired) => {
                warn!("session: refresh token rejected; clearing stored credentials");
                if let Err(err) = self.delete_credentials().await {
                    error!("session: failed to clear credentials after expiry: {err}");
                }
                Err(ClientError::SessionExpired)
            }
            Err(ClientError::RefreshFailed(reason)) => {
                warn!("session: refresh failed: {reason}");
                Err(ClientError::RefreshFailed(reason))
            }
            Err(err) => {
                warn!("session: refresh failed: {err}");
                Err(ClientError::RefreshFailed(err.to_string()))
            }
        }
    }

    async fn persist_pair(&self, pair: &CredentialPair) -> ClientResult<()> {
        let _io = self.store_io.lock().await;
        self.store
            .set(credential_keys::ACCESS_TOKEN, &pair.access_token)
            .await?;
        self.store
            .set(credential_keys::REFRESH_TOKEN, &pair.refresh_token)
            .await?;
        *self.cached.write().await = Some(CachedAccessToken {
            value: pair.access_token.clone(),
            obtained_at: Instant::now(),
        });
        Ok(())
    }

    pub async fn save_credentials(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> ClientResult<()> {
        self.persist_pair(&CredentialPair::new(access_token, refresh_token))
            .await
    }

    pub async fn delete_credentials(&self) -> ClientResult<()> {
        let _io = self.store_io.lock().await;
        self.cached.write().await.take();
        self.store.delete(credential_keys::ACCESS_TOKEN).await?;
        self.store.delete(credential_keys::REFRESH_TOKEN).await?;
        Ok(())
    }

    pub async fn sign_in(&self, credential: &SignInCredential) -> ClientResult<()> {
        let refresher = self.refresher()?;
        info!(provider = credential.provider(), "session: signing in");
        let pair = refresher.exchange_sign_in(credential).await?;
        self.persist_pair(&pair).await
    }

    pub async fn sign_out(&self) -> ClientResult<()> {
        info!("session: signing out");
        self.delete_credentials().await
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
