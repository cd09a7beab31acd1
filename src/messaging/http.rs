//! HTTP transport.
//!
//! Every envelope is POSTed as JSON to [`ENDPOINT_MESSAGE`] on the target's HTTP
//! address, which the [`AddressBook`] (normally the gossip membership) resolves.
//! Fire-and-forget sends retry with jittered exponential backoff; requests make a single
//! attempt bounded by the caller's timeout, so a caller never gets a silent retry.

use super::channel::{MessageChannel, unwrap_reply};
use super::dispatcher::MessageDispatcher;
use super::envelope::Envelope;
use crate::cluster::types::NodeId;
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};

use async_trait::async_trait;
use axum::{Extension, Json, Router, http::StatusCode, routing::post};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const ENDPOINT_MESSAGE: &str = "/internal/message";

/// Resolves a node to the address its HTTP transport listens on.
pub trait AddressBook: Send + Sync {
    fn http_addr(&self, node: &NodeId) -> Option<SocketAddr>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageRequest {
    pub from: NodeId,
    pub expects_reply: bool,
    pub envelope: Envelope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub reply: Option<Envelope>,
}

pub struct HttpChannel {
    local: NodeId,
    addresses: Arc<dyn AddressBook>,
    dispatcher: Arc<MessageDispatcher>,
    http_client: reqwest::Client,
    retry_attempts: usize,
    retry_timeout: Duration,
}

impl HttpChannel {
    pub fn new(local: NodeId, addresses: Arc<dyn AddressBook>, config: &FabricConfig) -> Arc<Self> {
        Arc::new(Self {
            local,
            addresses,
            dispatcher: MessageDispatcher::new(),
            http_client: reqwest::Client::new(),
            retry_attempts: config.http_retry_attempts.max(1),
            retry_timeout: config.http_timeout(),
        })
    }

    /// Routes serving the receive side of this channel.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(ENDPOINT_MESSAGE, post(handle_message))
            .layer(Extension(self.clone()))
    }

    fn url_for(&self, node: &NodeId) -> Result<String> {
        let addr = self
            .addresses
            .http_addr(node)
            .ok_or_else(|| FabricError::NodeUnreachable(node.clone()))?;
        Ok(format!("http://{}{}", addr, ENDPOINT_MESSAGE))
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> anyhow::Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    // Jitter keeps retries from several senders apart
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    fn deliver_locally(&self, envelope: Envelope) {
        let dispatcher = self.dispatcher.clone();
        let from = self.local.clone();
        tokio::spawn(async move {
            let kind = envelope.kind();
            if let Err(e) = dispatcher.dispatch(from, envelope).await {
                tracing::warn!("Local handler for {} failed: {:#}", kind, e);
            }
        });
    }
}

#[async_trait]
impl MessageChannel for HttpChannel {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<()> {
        if *to == self.local {
            self.deliver_locally(envelope);
            return Ok(());
        }

        let url = self.url_for(to)?;
        let kind = envelope.kind();
        let payload = MessageRequest {
            from: self.local.clone(),
            expects_reply: false,
            envelope,
        };

        let response = self
            .post_with_retry(url, &payload, self.retry_timeout, self.retry_attempts)
            .await
            .map_err(|e| {
                tracing::warn!("Sending {} to {} failed: {}", kind, to, e);
                FabricError::NodeUnreachable(to.clone())
            })?;

        if !response.status().is_success() {
            return Err(FabricError::Transport(format!(
                "{} to {} rejected: {}",
                kind,
                to,
                response.status()
            )));
        }

        Ok(())
    }

    async fn request(&self, to: &NodeId, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        if *to == self.local {
            let reply = tokio::time::timeout(
                timeout,
                self.dispatcher.handle_request(self.local.clone(), envelope),
            )
            .await
            .map_err(|_| FabricError::Timeout(format!("local request after {:?}", timeout)))?;
            return unwrap_reply(reply);
        }

        let url = self.url_for(to)?;
        let kind = envelope.kind();
        let payload = MessageRequest {
            from: self.local.clone(),
            expects_reply: true,
            envelope,
        };

        let response = self
            .http_client
            .post(url)
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FabricError::Timeout(format!("{} to {} after {:?}", kind, to, timeout))
                } else {
                    FabricError::NodeUnreachable(to.clone())
                }
            })?;

        if !response.status().is_success() {
            return Err(FabricError::Transport(format!(
                "{} to {} rejected: {}",
                kind,
                to,
                response.status()
            )));
        }

        let body: MessageResponse = response
            .json()
            .await
            .map_err(|e| FabricError::Transport(e.to_string()))?;

        let reply = body
            .reply
            .ok_or_else(|| FabricError::Transport(format!("{} to {} returned no reply", kind, to)))?;

        unwrap_reply(reply)
    }
}

pub async fn handle_message(
    Extension(channel): Extension<Arc<HttpChannel>>,
    Json(req): Json<MessageRequest>,
) -> (StatusCode, Json<MessageResponse>) {
    if req.expects_reply {
        let reply = channel.dispatcher.handle_request(req.from, req.envelope).await;
        return (StatusCode::OK, Json(MessageResponse { reply: Some(reply) }));
    }

    let dispatcher = channel.dispatcher.clone();
    tokio::spawn(async move {
        let kind = req.envelope.kind();
        if let Err(e) = dispatcher.dispatch(req.from.clone(), req.envelope).await {
            tracing::warn!("Handler for {} from {} failed: {:#}", kind, req.from, e);
        }
    });

    (StatusCode::ACCEPTED, Json(MessageResponse { reply: None }))
}
