//! HTTP client for the sync wire protocol.

use crate::error::SyncError;
use crate::sync::{
    PullRequest, PullResponse, PushRequest, PushResponse, RegisterRequest, RegisterResponse,
    RemoteAccessor, RetrieveCredentialsRequest, RetrieveCredentialsResponse,
    StoreCredentialsRequest, WireError,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn map_http_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::Transport(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        SyncError::Transport(format!("Connection error: {}", error))
    } else {
        SyncError::Transport(format!("HTTP error: {}", error))
    }
}

/// Error for a non-success response, preferring the server's error body.
fn error_from_response(status: StatusCode, body: &str) -> SyncError {
    if let Ok(wire) = serde_json::from_str::<WireError>(body) {
        return wire.into_error();
    }
    match status.as_u16() {
        404 => SyncError::NotFound(body.to_string()),
        409 => SyncError::Conflict(body.to_string()),
        401 | 403 => SyncError::Untrusted(body.to_string()),
        _ => SyncError::Transport(format!("Request failed with status {}: {}", status, body)),
    }
}

/// Remote reached over HTTP with JSON bodies.
pub struct HttpRemoteAccessor {
    client: Client,
    base_url: String,
}

impl HttpRemoteAccessor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<Req>(&self, endpoint: &str, body: &Req) -> Result<reqwest::Response, SyncError>
    where
        Req: Serialize + ?Sized,
    {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(url = %url, "Sending sync request");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(error_from_response(status, &body));
        }
        Ok(response)
    }

    async fn post<Req, Resp>(&self, endpoint: &str, body: &Req) -> Result<Resp, SyncError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send(endpoint, body)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl RemoteAccessor for HttpRemoteAccessor {
    async fn pull(&self, request: PullRequest) -> Result<PullResponse, SyncError> {
        self.post("pull", &request).await
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse, SyncError> {
        self.post("push", &request).await
    }

    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, SyncError> {
        self.post("register", &request).await
    }

    async fn store_credentials(&self, request: StoreCredentialsRequest) -> Result<(), SyncError> {
        self.send("credentials/store", &request).await?;
        Ok(())
    }

    async fn retrieve_credentials(
        &self,
        request: RetrieveCredentialsRequest,
    ) -> Result<RetrieveCredentialsResponse, SyncError> {
        self.post("credentials/retrieve", &request).await
    }
}
