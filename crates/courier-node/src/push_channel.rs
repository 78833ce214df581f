//! Push channels -- how a batch of push tasks reaches an edge node.

use std::sync::Arc;

use async_trait::async_trait;
use courier_api::PushSink;
use courier_protocol::{PushBatch, PushBatchResponse};

use crate::membership::EdgeNode;
use crate::push_router::PushError;

#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Send one batch. Returns the number of packets the node delivered.
    async fn send(&self, batch: PushBatch) -> Result<usize, PushError>;
}

/// POST `{push_url}/api/v1/push` on a peer node.
pub struct HttpPushChannel {
    client: reqwest::Client,
    url: String,
    bearer_token: String,
}

impl HttpPushChannel {
    pub fn new(client: reqwest::Client, push_url: &str, bearer_token: String) -> Self {
        Self {
            client,
            url: format!("{}/api/v1/push", push_url.trim_end_matches('/')),
            bearer_token,
        }
    }
}

#[async_trait]
impl PushChannel for HttpPushChannel {
    async fn send(&self, batch: PushBatch) -> Result<usize, PushError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.bearer_token)
            .json(&batch)
            .send()
            .await
            .map_err(|e| PushError::Channel(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PushError::Channel(format!("{status}: {text}")));
        }

        let body: PushBatchResponse = resp
            .json()
            .await
            .map_err(|e| PushError::Channel(e.to_string()))?;
        Ok(body.delivered)
    }
}

/// Hand-off to this node's own connection registry.
pub struct LocalPushChannel {
    sink: Arc<dyn PushSink>,
}

impl LocalPushChannel {
    pub fn new(sink: Arc<dyn PushSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PushChannel for LocalPushChannel {
    async fn send(&self, batch: PushBatch) -> Result<usize, PushError> {
        Ok(self.sink.deliver(batch.tasks).await)
    }
}

/// Builds the channel for a newly discovered node.
pub trait ChannelFactory: Send + Sync {
    fn channel_for(&self, node: &EdgeNode) -> Arc<dyn PushChannel>;
}

/// Local channel for our own node id, HTTP for everyone else.
pub struct DefaultChannelFactory {
    local_node_id: String,
    local_sink: Arc<dyn PushSink>,
    client: reqwest::Client,
    bearer_token: String,
}

impl DefaultChannelFactory {
    pub fn new(local_node_id: String, local_sink: Arc<dyn PushSink>, bearer_token: String) -> Self {
        Self {
            local_node_id,
            local_sink,
            client: reqwest::Client::new(),
            bearer_token,
        }
    }
}

impl ChannelFactory for DefaultChannelFactory {
    fn channel_for(&self, node: &EdgeNode) -> Arc<dyn PushChannel> {
        if node.node_id == self.local_node_id {
            Arc::new(LocalPushChannel::new(self.local_sink.clone()))
        } else {
            Arc::new(HttpPushChannel::new(
                self.client.clone(),
                &node.push_url,
                self.bearer_token.clone(),
            ))
        }
    }
}
