//! Legacy HTTP+SSE transport: a persistent `GET` SSE connection delivers
//! an initial `endpoint` event naming the URL to `POST` requests to, and
//! subsequent JSON-RPC responses arrive as `message` events on the same
//! stream, correlated back to requests by id.

use super::UpstreamTransport;
use crate::error::{Error, Result};
use crate::mcp::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

type PendingMap = Arc<Mutex<HashMap<serde_json::Value, oneshot::Sender<JsonRpcResponse>>>>;

pub struct SseTransport {
    sse_endpoint: String,
    client: Client,
    post_endpoint: Option<String>,
    pending: PendingMap,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(endpoint: String) -> Self {
        Self {
            sse_endpoint: endpoint,
            client: Client::new(),
            post_endpoint: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader_task: None,
        }
    }
}

#[async_trait]
impl UpstreamTransport for SseTransport {
    async fn connect(&mut self) -> Result<()> {
        let response = self
            .client
            .get(&self.sse_endpoint)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!("sse endpoint returned {}", response.status())));
        }

        let mut stream = response.bytes_stream().eventsource();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let pending = self.pending.clone();
        let base = self.sse_endpoint.clone();

        let reader_task = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            while let Some(event) = stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(_) => break,
                };
                match event.event.as_str() {
                    "endpoint" => {
                        let resolved = resolve_endpoint(&base, event.data.trim());
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(resolved);
                        }
                    }
                    _ => {
                        if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                            if let Some(id) = response.id.clone() {
                                if let Some(tx) = pending.lock().await.remove(&id) {
                                    let _ = tx.send(response);
                                }
                            }
                        }
                    }
                }
            }
        });

        self.post_endpoint = Some(
            tokio::time::timeout(std::time::Duration::from_secs(10), endpoint_rx)
                .await
                .map_err(|_| Error::Timeout("no endpoint event from sse upstream".into()))?
                .map_err(|_| Error::Transport("sse stream closed before endpoint event".into()))?,
        );
        self.reader_task = Some(reader_task);
        Ok(())
    }

    async fn request(&mut self, req: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let endpoint = self
            .post_endpoint
            .as_ref()
            .ok_or_else(|| Error::Unavailable("not connected".into()))?;
        let id = req.id.clone().ok_or_else(|| Error::Validation("request id required".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let status = self
            .client
            .post(endpoint)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .status();
        if !status.is_success() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Transport(format!("post to upstream returned {status}")));
        }

        match tokio::time::timeout(std::time::Duration::from_secs(30), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Unavailable("upstream closed before responding".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout("upstream request timed out".into()))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.post_endpoint = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.post_endpoint.is_some()
    }
}

fn resolve_endpoint(base: &str, data: &str) -> String {
    match reqwest::Url::parse(base).and_then(|b| b.join(data)) {
        Ok(url) => url.to_string(),
        Err(_) => data.to_string(),
    }
}
