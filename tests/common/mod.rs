//! Shared fixtures: a transport whose streams are driven by the test.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use roundtable::error::{Result, RoundtableError};
use roundtable::transport::{ApiRequest, EventStream, StreamEvent, StreamItem, Transport};
use roundtable::wire::{CHAT_NEW_PATH, MODEL_LIST_PATH, PERSON_LIST_PATH};
use roundtable::Expert;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn experts(n: usize) -> Vec<Expert> {
    (0..n).map(|i| Expert::new(format!("Expert {i}"), format!("Role {i}"))).collect()
}

pub fn reply(name: &str, content: &str) -> StreamItem {
    Ok(StreamEvent::Message(json!({ "code": 0, "role": name, "content": content }).to_string()))
}

/// Transport whose event streams are fed by the test through
/// [`ScriptedTransport::next_stream`].
pub struct ScriptedTransport {
    failure: Mutex<Option<RoundtableError>>,
    stall: AtomicBool,
    creates: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<ApiRequest>>,
    opened_tx: mpsc::UnboundedSender<mpsc::Sender<StreamItem>>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<mpsc::Sender<StreamItem>>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        ScriptedTransport {
            failure: Mutex::new(None),
            stall: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            opened_tx,
            opened_rx: tokio::sync::Mutex::new(opened_rx),
        }
    }

    /// Every call fails with `err` until cleared.
    pub fn failing(err: RoundtableError) -> Self {
        let t = Self::new();
        t.set_failure(Some(err));
        t
    }

    /// Every request hangs for an hour.
    pub fn stalled() -> Self {
        let t = Self::new();
        t.stall.store(true, Ordering::SeqCst);
        t
    }

    pub fn set_failure(&self, err: Option<RoundtableError>) {
        *self.failure.lock().expect("lock") = err;
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().expect("lock").clone()
    }

    /// Sender for the next stream the code under test opens.
    pub async fn next_stream(&self) -> mpsc::Sender<StreamItem> {
        let mut rx = self.opened_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("a stream was opened")
            .expect("transport alive")
    }

    fn failure(&self) -> Option<RoundtableError> {
        self.failure.lock().expect("lock").clone()
    }
}

impl Transport for ScriptedTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("lock").push(request.clone());
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(err) = self.failure() {
            return Err(err);
        }
        match request.path.as_str() {
            CHAT_NEW_PATH => {
                let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "chatID": format!("chat-{n}") }))
            }
            MODEL_LIST_PATH => Ok(json!(["scripted-model"])),
            PERSON_LIST_PATH => Ok(serde_json::to_value(experts(5)).expect("personas")),
            other => Err(RoundtableError::Application { code: 404, message: format!("no route {other}") }),
        }
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<EventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("lock").push(request);
        if let Some(err) = self.failure() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = self.opened_tx.send(tx);
        Ok(EventStream::from_receiver(rx))
    }

    fn endpoint(&self) -> String {
        "scripted://backend".to_string()
    }
}
