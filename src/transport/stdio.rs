//! stdio transport: the upstream is a child process, requests and
//! responses framed with a `Content-Length` header, matching the teacher's
//! framing on the server side of the same protocol.

use super::UpstreamTransport;
use crate::error::{Error, Result};
use crate::mcp::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};

type PendingMap = Arc<Mutex<HashMap<serde_json::Value, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    child: Option<Child>,
    stdin: Option<tokio::process::ChildStdin>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    pending: PendingMap,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            child: None,
            stdin: None,
            reader_task: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn read_framed(reader: &mut BufReader<tokio::process::ChildStdout>) -> Result<Option<JsonRpcResponse>> {
        let mut header = String::new();
        loop {
            header.clear();
            let n = reader.read_line(&mut header).await?;
            if n == 0 {
                return Ok(None);
            }
            if header.trim().is_empty() {
                continue;
            }
            break;
        }
        let content_length: usize = header
            .strip_prefix("Content-Length:")
            .ok_or_else(|| Error::Transport(format!("expected Content-Length header, got: {header}")))?
            .trim()
            .parse()
            .map_err(|_| Error::Transport(format!("invalid Content-Length: {header}")))?;

        let mut separator = String::new();
        reader.read_line(&mut separator).await?;

        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf).await?;
        let response: JsonRpcResponse = serde_json::from_slice(&buf)?;
        Ok(Some(response))
    }
}

#[async_trait]
impl UpstreamTransport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("spawn {}: {e}", self.command)))?;

        let stdin = child.stdin.take().ok_or_else(|| Error::Transport("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Transport("no stdout".into()))?;
        let mut reader = BufReader::new(stdout);
        let pending = self.pending.clone();

        let reader_task = tokio::spawn(async move {
            loop {
                match Self::read_framed(&mut reader).await {
                    Ok(Some(response)) => {
                        if let Some(id) = response.id.clone() {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(response);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        });

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.reader_task = Some(reader_task);
        Ok(())
    }

    async fn request(&mut self, req: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::Unavailable("not connected".into()))?;
        let id = req.id.clone().ok_or_else(|| Error::Validation("request id required".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let body = serde_json::to_vec(&req)?;
        let frame = format!("Content-Length: {}\r\n\r\n", body.len());
        stdin.write_all(frame.as_bytes()).await.map_err(|e| Error::Transport(e.to_string()))?;
        stdin.write_all(&body).await.map_err(|e| Error::Transport(e.to_string()))?;
        stdin.flush().await.map_err(|e| Error::Transport(e.to_string()))?;

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
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
            let _ = child.start_kill();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }
}
