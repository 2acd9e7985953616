//! HTTP and streamable-HTTP (SSE) adapters. Both relay one JSON-RPC frame
//! per call over `reqwest`; the SSE variant keeps a background task reading
//! `data:` lines off a standing connection instead of opening one POST per
//! request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::error::{GatewayError, GatewayResult};
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::model::{Template, Transport};

use super::{connection_closed, generate_request_id, AdapterEvent, PendingCalls, TransportAdapter};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct HttpAdapter {
    client: reqwest::Client,
    endpoint: tokio::sync::RwLock<Option<String>>,
    streaming: tokio::sync::RwLock<bool>,
    pending: Arc<PendingCalls>,
    events: broadcast::Sender<AdapterEvent>,
    connected: AtomicBool,
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAdapter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client: reqwest::Client::new(),
            endpoint: tokio::sync::RwLock::new(None),
            streaming: tokio::sync::RwLock::new(false),
            pending: Arc::new(PendingCalls::new()),
            events,
            connected: AtomicBool::new(false),
        }
    }

    async fn start_sse(&self, endpoint: String) -> GatewayResult<()> {
        let response = self
            .client
            .get(&endpoint)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|err| GatewayError::ConnectionClosed(err.to_string()))?;

        let pending = self.pending.clone();
        let events_tx = self.events.clone();
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(bytes) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(data) {
                        Ok(response) => {
                            // First frame matching an id wins; `resolve` is a
                            // one-shot removal so later duplicate ids are
                            // naturally ignored.
                            pending.resolve(response.clone());
                            let _ = events_tx.send(AdapterEvent::Received(response));
                        }
                        Err(err) => tracing::warn!(%err, data, "discarding malformed SSE frame"),
                    }
                }
            }
            let _ = events_tx.send(AdapterEvent::Disconnect { code: None, signal: None });
            pending.fail_all("sse stream ended");
        });
        Ok(())
    }
}

#[async_trait]
impl TransportAdapter for HttpAdapter {
    async fn connect(&self, template: &Template) -> GatewayResult<()> {
        let endpoint = template
            .endpoint
            .clone()
            .ok_or_else(|| GatewayError::BadInput("http template missing endpoint".into()))?;

        *self.endpoint.write().await = Some(endpoint.clone());
        let streaming = template.transport == Transport::StreamableHttp;
        *self.streaming.write().await = streaming;

        if streaming {
            self.start_sse(endpoint).await?;
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.fail_all("disconnect");
        *self.endpoint.write().await = None;
        let _ = self.events.send(AdapterEvent::Disconnect { code: None, signal: None });
        Ok(())
    }

    async fn send(&self, msg: JsonRpcRequest) -> GatewayResult<()> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::NotConnected("http adapter not connected".into()))?;

        if *self.streaming.read().await {
            // The SSE channel carries responses; the request itself is still
            // a plain POST to the same endpoint (initiating the call).
            self.client
                .post(&endpoint)
                .json(&msg)
                .send()
                .await
                .map_err(|err| GatewayError::ConnectionClosed(err.to_string()))?;
        } else {
            self.client
                .post(&endpoint)
                .json(&msg)
                .send()
                .await
                .map_err(|err| GatewayError::ConnectionClosed(err.to_string()))?;
        }

        let _ = self.events.send(AdapterEvent::Sent(msg));
        Ok(())
    }

    async fn send_and_receive(&self, mut msg: JsonRpcRequest, timeout_ms: u64) -> GatewayResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected("http adapter not connected".into()));
        }

        let id = match &msg.id {
            Some(id) => id.clone(),
            None => {
                let generated = serde_json::json!(generate_request_id(crate::model::now_ms()));
                msg.id = Some(generated.clone());
                generated
            }
        };

        if *self.streaming.read().await {
            let rx = self.pending.register(id.clone());
            self.send(msg).await?;
            return self.await_with_timeout(rx, timeout_ms, &id).await;
        }

        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or_else(|| GatewayError::NotConnected("http adapter not connected".into()))?;

        let request_fut = self.client.post(&endpoint).json(&msg).send();
        let response = if timeout_ms == 0 {
            request_fut.await
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), request_fut)
                .await
                .map_err(|_| GatewayError::RequestTimeout(format!("request timeout for message {id}")))?
        }
        .map_err(|err| GatewayError::ConnectionClosed(err.to_string()))?;

        let _ = self.events.send(AdapterEvent::Sent(msg));

        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|err| GatewayError::Upstream {
                code: -32000,
                message: format!("malformed response body: {err}"),
                data: None,
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

impl HttpAdapter {
    async fn await_with_timeout(
        &self,
        rx: tokio::sync::oneshot::Receiver<JsonRpcResponse>,
        timeout_ms: u64,
        id: &serde_json::Value,
    ) -> GatewayResult<JsonRpcResponse> {
        if timeout_ms == 0 {
            return rx.await.map_err(|_| connection_closed(id));
        }
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(connection_closed(id)),
            Err(_) => {
                self.pending.cancel(id);
                Err(GatewayError::RequestTimeout(format!("request timeout for message {id}")))
            }
        }
    }
}

