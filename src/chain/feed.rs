//! New-head subscription feeds.
//!
//! A feed is a cancellable producer that pushes [`ChainNotification`]s into a
//! bounded channel. It does not consume rate-limiter budget for the
//! subscription itself. [`WsHeadFeed`] uses `eth_subscribe("newHeads")`;
//! [`PollingHeadFeed`] is the fallback when no websocket endpoint is configured.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::access::ChainAccess;
use super::error::ChainError;
use super::types::{BlockHead, parse_hex_u64};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainNotification {
    NewHead(BlockHead),
    /// Transport ended; no further notifications follow on this handle
    Disconnected(String),
}

/// Receiving end of a running subscription. Dropping it stops the producer.
pub struct FeedHandle {
    rx: mpsc::Receiver<ChainNotification>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn new(rx: mpsc::Receiver<ChainNotification>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// `None` once the producer is gone
    pub async fn next(&mut self) -> Option<ChainNotification> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
pub trait BlockFeed: Send + Sync {
    async fn subscribe(&self, capacity: usize) -> Result<FeedHandle, ChainError>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// WebSocket newHeads
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsHeader {
    number: String,
    hash: String,
    parent_hash: String,
}

#[derive(Deserialize)]
struct WsParams {
    result: WsHeader,
}

#[derive(Deserialize)]
struct WsNotification {
    method: Option<String>,
    params: Option<WsParams>,
}

pub struct WsHeadFeed {
    url: String,
}

impl WsHeadFeed {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

fn parse_head_message(text: &str) -> Result<Option<BlockHead>, ChainError> {
    let notification: WsNotification =
        serde_json::from_str(text).map_err(|e| ChainError::Parse(e.to_string()))?;
    if notification.method.as_deref() != Some("eth_subscription") {
        return Ok(None);
    }
    let Some(params) = notification.params else {
        return Ok(None);
    };
    Ok(Some(BlockHead {
        number: parse_hex_u64(&params.result.number)?,
        hash: params.result.hash.to_lowercase(),
        parent_hash: params.result.parent_hash.to_lowercase(),
    }))
}

#[async_trait]
impl BlockFeed for WsHeadFeed {
    async fn subscribe(&self, capacity: usize) -> Result<FeedHandle, ChainError> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChainError::Subscription(format!("connect {}: {}", self.url, e)))?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        });
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ChainError::Subscription(e.to_string()))?;

        // First reply carries the subscription id or an error
        let subscription_id = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let reply: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| ChainError::Parse(e.to_string()))?;
                    if let Some(error) = reply.get("error") {
                        return Err(ChainError::Subscription(error.to_string()));
                    }
                    if let Some(id) = reply.get("result").and_then(|r| r.as_str()) {
                        break id.to_string();
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ChainError::Subscription(e.to_string())),
                None => return Err(ChainError::Subscription("closed before subscribe".into())),
            }
        };
        info!(url = %self.url, subscription_id, "Subscribed to newHeads");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            let reason = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => match parse_head_message(&text) {
                        Ok(Some(head)) => {
                            if tx.send(ChainNotification::NewHead(head)).await.is_err() {
                                debug!("Head consumer gone, closing subscription");
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Ignoring malformed subscription message"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break format!("closed by server: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            warn!(reason, "newHeads subscription lost");
            let _ = tx.send(ChainNotification::Disconnected(reason)).await;
        });

        Ok(FeedHandle::new(rx, Some(task)))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

// ============================================================================
// Polling fallback
// ============================================================================

pub struct PollingHeadFeed {
    access: Arc<ChainAccess>,
    interval: Duration,
}

impl PollingHeadFeed {
    pub fn new(access: Arc<ChainAccess>, interval: Duration) -> Self {
        Self { access, interval }
    }
}

#[async_trait]
impl BlockFeed for PollingHeadFeed {
    async fn subscribe(&self, capacity: usize) -> Result<FeedHandle, ChainError> {
        let access = self.access.clone();
        let period = self.interval;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut last_seen: Option<u64> = None;
            loop {
                ticker.tick().await;
                let head = match access.block_number().await {
                    Ok(height) if last_seen.is_some_and(|seen| seen == height) => continue,
                    Ok(height) => access.block_by_number(height).await,
                    Err(e) => Err(e),
                };
                match head {
                    Ok(Some(head)) => {
                        last_seen = Some(head.number);
                        if tx.send(ChainNotification::NewHead(head)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Head polling failed");
                        let _ = tx.send(ChainNotification::Disconnected(e.to_string())).await;
                        return;
                    }
                }
            }
        });

        Ok(FeedHandle::new(rx, Some(task)))
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}
