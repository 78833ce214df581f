//! How the edge layer reaches the ingest service: in-process or over the
//! `/api/v1/messages/send` RPC of another node.

use std::sync::Arc;

use async_trait::async_trait;
use courier_api::SendResponse;
use courier_ingest::{AcceptReceipt, AcceptRequest, IngestError, IngestService};
use reqwest::StatusCode;

#[async_trait]
pub trait IngestClient: Send + Sync {
    async fn send(&self, req: AcceptRequest) -> Result<AcceptReceipt, IngestError>;
}

/// Calls the ingest service of this process on the blocking pool.
pub struct LocalIngest {
    service: Arc<IngestService>,
}

impl LocalIngest {
    pub fn new(service: Arc<IngestService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl IngestClient for LocalIngest {
    async fn send(&self, req: AcceptRequest) -> Result<AcceptReceipt, IngestError> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.accept(&req))
            .await
            .map_err(|e| IngestError::Internal(format!("ingest task failed: {e}")))?
    }
}

pub struct HttpIngestClient {
    client: reqwest::Client,
    url: String,
    bearer_token: String,
}

impl HttpIngestClient {
    pub fn new(client: reqwest::Client, base_url: &str, bearer_token: String) -> Self {
        Self {
            client,
            url: format!("{}/api/v1/messages/send", base_url.trim_end_matches('/')),
            bearer_token,
        }
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn send(&self, req: AcceptRequest) -> Result<AcceptReceipt, IngestError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.bearer_token)
            .json(&req)
            .send()
            .await
            .map_err(|e| IngestError::Unavailable(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| IngestError::Unavailable(e.to_string()))?;
        let body: Option<SendResponse> = serde_json::from_str(&text).ok();

        if status.is_success() {
            return match body {
                Some(SendResponse {
                    msg_id,
                    seq_id,
                    error: None,
                }) => Ok(AcceptReceipt { msg_id, seq_id }),
                _ => Err(IngestError::Internal(format!("unexpected ingest reply: {text}"))),
            };
        }

        let message = body.and_then(|b| b.error).unwrap_or(text);
        Err(error_for_status(status, message, &req))
    }
}

fn error_for_status(status: StatusCode, message: String, req: &AcceptRequest) -> IngestError {
    match status {
        StatusCode::BAD_REQUEST => IngestError::Validation(message),
        StatusCode::FORBIDDEN => IngestError::PermissionDenied {
            sender: req.sender.clone(),
            session_id: req.session_id.clone(),
        },
        StatusCode::SERVICE_UNAVAILABLE => IngestError::Unavailable(message),
        StatusCode::UNAUTHORIZED => IngestError::Internal(format!("ingest rejected node token: {message}")),
        other => IngestError::Internal(format!("{other}: {message}")),
    }
}
