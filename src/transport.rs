//! Transport client: request/response calls and server-pushed event streams.
//!
//! [`Transport`] is the seam the rest of the crate is generic over. The
//! reqwest-backed [`HttpTransport`] talks to the real backend; the mock
//! backend in [`crate::mock`] implements the same trait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::RoundtableConfig;
use crate::error::{Result, RoundtableError};
use crate::sse::{SseDecoder, SseFrame};
use crate::wire::{Envelope, END_EVENT};

/// Events buffered between the producer task and the consumer.
pub const STREAM_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// A call against a path relative to the transport's base endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest { method: Method::Get, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        ApiRequest { method: Method::Post, path: path.into(), query: Vec::new(), body: Some(body) }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Last value for `key`, matching URL query semantics.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event streams
// ---------------------------------------------------------------------------

/// One server-pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A `data:` payload, still JSON-encoded.
    Message(String),
    /// The backend's explicit end-of-stream signal.
    End,
}

pub type StreamItem = Result<StreamEvent>;

/// Cloneable handle that closes an [`EventStream`] from anywhere.
///
/// Closing is synchronous: the flag flips and the producer task is aborted
/// before `close` returns. The socket itself is torn down when the aborted
/// task is dropped by the runtime.
#[derive(Debug, Clone)]
pub struct StreamCloser {
    signal: Arc<watch::Sender<bool>>,
    abort: Option<AbortHandle>,
}

impl StreamCloser {
    pub fn close(&self) {
        self.signal.send_replace(true);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.signal.borrow()
    }
}

/// Lazy, non-restartable sequence of server-pushed events.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamItem>,
    closed_rx: watch::Receiver<bool>,
    closer: StreamCloser,
}

impl EventStream {
    /// Run `producer` on its own task, feeding the returned stream.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<StreamItem>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(producer(tx));
        Self::build(rx, Some(task.abort_handle()))
    }

    /// Wrap a channel whose sender is driven elsewhere.
    pub fn from_receiver(rx: mpsc::Receiver<StreamItem>) -> Self {
        Self::build(rx, None)
    }

    fn build(rx: mpsc::Receiver<StreamItem>, abort: Option<AbortHandle>) -> Self {
        let (signal, closed_rx) = watch::channel(false);
        EventStream { rx, closed_rx, closer: StreamCloser { signal: Arc::new(signal), abort } }
    }

    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Next event, or `None` once the stream ended or was closed.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.closer.is_closed() {
            self.rx.close();
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed_rx.wait_for(|closed| *closed) => {
                self.rx.close();
                None
            }
            item = self.rx.recv() => item,
        }
    }

    /// Stop delivery and release the producer.
    pub fn close(&mut self) {
        self.closer.close();
        self.rx.close();
    }

    /// Take whatever was already received but not yet consumed.
    ///
    /// Works after [`close`](Self::close): it never waits for new events.
    pub fn drain_buffered(&mut self) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.closer.close();
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Request/response plus streaming access to one backend.
pub trait Transport: Send + Sync + 'static {
    /// Issue a call and unwrap the `{code, msg, data}` envelope.
    fn request(&self, request: ApiRequest) -> impl Future<Output = Result<Value>> + Send;

    /// Open a server-push channel for `request` (always a GET).
    fn open_stream(&self, request: ApiRequest) -> impl Future<Output = Result<EventStream>> + Send;

    /// Human-readable endpoint, used in reports and logs.
    fn endpoint(&self) -> String;
}

impl<T: Transport> Transport for Arc<T> {
    fn request(&self, request: ApiRequest) -> impl Future<Output = Result<Value>> + Send {
        (**self).request(request)
    }

    fn open_stream(&self, request: ApiRequest) -> impl Future<Output = Result<EventStream>> + Send {
        (**self).open_stream(request)
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// reqwest-backed transport for the real backend.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// The request timeout applies per non-streaming call only; streams are
    /// bounded by the connect timeout and then live as long as the backend
    /// keeps them open.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration, connect_timeout: Duration) -> Self {
        // Client::builder() can fail in extreme environments; fall back to a
        // default client instead of panicking.
        let client = Client::builder().connect_timeout(connect_timeout).build().unwrap_or_default();
        HttpTransport { base_url: base_url.into(), client, request_timeout }
    }

    pub fn from_config(config: &RoundtableConfig) -> Self {
        Self::new(config.base_url.clone(), config.request_timeout(), config.connect_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn timeout_ms(&self) -> u64 {
        self.request_timeout.as_millis() as u64
    }
}

impl Transport for HttpTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        let url = self.url(&request.path);
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), &url)
            .timeout(self.request_timeout)
            .query(&request.query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RoundtableError::from_reqwest(&e, &url, self.timeout_ms()))?;

        if !response.status().is_success() {
            return Err(RoundtableError::Http { status: response.status().as_u16(), url });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RoundtableError::from_reqwest(&e, &url, self.timeout_ms()))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| RoundtableError::Decode { url: url.clone(), detail: e.to_string() })?;

        debug!(method = %request.method, url = %url, code = envelope.code, "request completed");
        envelope.into_outcome().into_result()
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<EventStream> {
        let url = self.url(&request.path);
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .query(&request.query)
            .send()
            .await
            .map_err(|e| RoundtableError::from_reqwest(&e, &url, self.timeout_ms()))?;

        if !response.status().is_success() {
            return Err(RoundtableError::Http { status: response.status().as_u16(), url });
        }

        debug!(url = %url, "event stream opened");
        Ok(EventStream::spawn(move |tx| pump_sse(response, tx)))
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

async fn pump_sse(response: reqwest::Response, tx: mpsc::Sender<StreamItem>) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(RoundtableError::Stream(e.to_string()))).await;
                return;
            }
        };
        for frame in decoder.push(&chunk) {
            if tx.send(Ok(frame_to_event(frame))).await.is_err() {
                return;
            }
        }
    }

    if let Some(frame) = decoder.finish() {
        let _ = tx.send(Ok(frame_to_event(frame))).await;
    }
}

fn frame_to_event(frame: SseFrame) -> StreamEvent {
    if frame.event.as_deref() == Some(END_EVENT) {
        StreamEvent::End
    } else {
        StreamEvent::Message(frame.data)
    }
}
