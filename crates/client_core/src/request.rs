use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::CredentialPair,
    protocol::{RefreshRequest, SignInCredential, TokenResponse},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, ClientResult},
    session::{SessionManager, TokenRefresher},
};

/// A replayable description of one API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    refresh_call: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            refresh_call: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> ClientResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Marks the call as a credential refresh: an unauthorized response is
    /// final and never triggers another refresh.
    pub fn as_refresh_call(mut self) -> Self {
        self.refresh_call = true;
        self
    }

    pub fn is_refresh_call(&self) -> bool {
        self.refresh_call
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> ClientResult<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            ClientError::InvalidResponse(format!("failed to decode response body: {err}"))
        })
    }

    fn into_result(self) -> ClientResult<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ClientError::from_status(self.status, &self.body))
        }
    }
}

/// Issues API calls, attaching the bearer credential and recovering once from
/// an expired access token.
pub struct RequestClient {
    http: Client,
    base_url: String,
    session: Arc<SessionManager>,
}

impl RequestClient {
    /// Builds the client and binds it as the session's refresh transport.
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<SessionManager>,
        timeout: Duration,
    ) -> ClientResult<Arc<Self>> {
        let http = Client::builder().timeout(timeout).build()?;
        let client = Arc::new(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        });
        let refresher: Weak<dyn TokenRefresher> =
            Arc::downgrade(&client) as Weak<dyn TokenRefresher>;
        client.session.bind_refresher(refresher);
        Ok(client)
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send(
        &self,
        request: &ApiRequest,
        requires_auth: bool,
    ) -> ClientResult<ApiResponse> {
        let token = if requires_auth {
            match self.session.get_access_token().await {
                Ok(token) => Some(token),
                Err(err) => {
                    debug!(path = request.path(), "request: no usable credential: {err}");
                    return Err(ClientError::AuthenticationRequired);
                }
            }
        } else {
            None
        };

        let response = self.execute(request, token.as_deref()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return response.into_result();
        }

        if request.is_refresh_call() {
            return Err(ClientError::SessionExpired);
        }
        if !requires_auth {
            return Err(ClientError::AuthenticationRequired);
        }

        info!(
            method = %request.method(),
            path = request.path(),
            "request: unauthorized; refreshing session and retrying once"
        );
        let fresh_token = self.session.refresh().await?;
        let retried = self.execute(request, Some(&fresh_token)).await?;
        if retried.status == StatusCode::UNAUTHORIZED {
            warn!(
                method = %request.method(),
                path = request.path(),
                "request: still unauthorized after refresh"
            );
            return Err(ClientError::AuthenticationRequired);
        }
        retried.into_result()
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        requires_auth: bool,
    ) -> ClientResult<T> {
        self.send(request, requires_auth).await?.json()
    }

    /// Like [`Self::send`] but ignores the response body.
    pub async fn send_empty(
        &self,
        request: &ApiRequest,
        requires_auth: bool,
    ) -> ClientResult<()> {
        self.send(request, requires_auth).await.map(|_| ())
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> ClientResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        debug!(
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            "request: completed"
        );
        Ok(ApiResponse { status, body })
    }
}

#[async_trait]
impl TokenRefresher for RequestClient {
    async fn refresh_tokens(&self, refresh_token: &str) -> ClientResult<CredentialPair> {
        let request = ApiRequest::post("/auth/refresh")
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })?
            .as_refresh_call();
        match self.send_json::<TokenResponse>(&request, false).await {
            Ok(tokens) => Ok(CredentialPair::new(tokens.access_token, tokens.refresh_token)),
            Err(err) if err.rejects_refresh_token() => {
                debug!("request: refresh token rejected: {err}");
                Err(ClientError::SessionExpired)
            }
            Err(err) => Err(err),
        }
    }

    async fn exchange_sign_in(
        &self,
        credential: &SignInCredential,
    ) -> ClientResult<CredentialPair> {
        let request = ApiRequest::post("/auth/signin").json(credential)?;
        let tokens: TokenResponse = self.send_json(&request, false).await?;
        Ok(CredentialPair::new(tokens.access_token, tokens.refresh_token))
    }
}

#[cfg(test)]
#[path = "tests/request_tests.rs"]
mod tests;
