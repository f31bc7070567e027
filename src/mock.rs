//! In-process stand-in for the discussion backend.
//!
//! Serves the same paths as the real backend with simulated latency, so the
//! rest of the crate can run unchanged when no server is reachable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog::{builtin_catalog, Expert, MIN_ROSTER};
use crate::config::MockConfig;
use crate::error::{Result, RoundtableError};
use crate::now_ms;
use crate::transport::{ApiRequest, EventStream, Method, StreamEvent, Transport};
use crate::wire::{
    NewChatRequest, CHAT_EMOTION_PATH, CHAT_NEW_PATH, CHAT_STREAM_PATH, MODEL_LIST_PATH, PERSON_ADD_PATH,
    PERSON_LIST_PATH,
};

pub const MOCK_ENDPOINT: &str = "mock://roundtable";

pub const MOCK_MODELS: &[&str] = &[
    "Qwen/QwQ-32B",
    "Qwen/Qwen2.5-72B-Instruct",
    "meta-llama/Llama-3.1-70B-Instruct",
    "anthropic/claude-3-haiku",
    "openai/gpt-4o-mini",
];

const REPLY_TEMPLATES: &[&str] = &[
    "On \"{topic}\", I would start from first principles: what does the user actually need, and what can we remove?",
    "\"{topic}\" is really a question about long-term incentives. Get those right and the details follow.",
    "My instinct on \"{topic}\" is to run a small, cheap experiment before committing to any grand plan.",
    "Everyone is looking at \"{topic}\" from the technical side. The harder problem is the people involved.",
    "For \"{topic}\" I'd look for the simplest model that explains most of what we see, then test its edges.",
];

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Simulated backend with per-session rosters.
#[derive(Debug)]
pub struct MockTransport {
    config: MockConfig,
    sessions: Mutex<HashMap<String, Vec<String>>>,
    personas: Mutex<Vec<Expert>>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        MockTransport {
            config,
            sessions: Mutex::new(HashMap::new()),
            personas: Mutex::new(builtin_catalog()),
        }
    }

    pub fn instant() -> Self {
        Self::new(MockConfig::instant())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn roster_for(&self, session_id: &str) -> Option<Vec<String>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).get(session_id).cloned()
    }

    fn create_session(&self, body: Option<&Value>) -> Result<Value> {
        let req: NewChatRequest = body
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| RoundtableError::Application { code: 400, message: format!("bad chat request: {e}") })?
            .ok_or_else(|| RoundtableError::Application { code: 400, message: "missing chat request body".into() })?;

        let id = new_chat_id();
        debug!(chat_id = %id, model = %req.model, experts = req.people.len(), "mock session created");
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).insert(id.clone(), req.people);
        Ok(json!({ "chatID": id }))
    }

    fn add_persona(&self, body: Option<&Value>) -> Result<Value> {
        let mut expert: Expert = body
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| RoundtableError::Application { code: 400, message: format!("bad persona: {e}") })?
            .unwrap_or_default();
        if expert.name.trim().is_empty() {
            return Err(RoundtableError::Application { code: 400, message: "persona name is required".into() });
        }

        let mut personas = self.personas.lock().unwrap_or_else(|p| p.into_inner());
        expert.id = Some(Value::from(personas.len() as u64 + 1));
        expert.created_at = Some(now_ms().to_string());
        personas.push(expert.clone());
        serde_json::to_value(expert).map_err(|e| RoundtableError::Application { code: 500, message: e.to_string() })
    }

    fn emotion(&self, request: &ApiRequest) -> Result<Value> {
        let id = request.query_value("chatID").unwrap_or_default();
        let names = self
            .roster_for(id)
            .ok_or_else(|| RoundtableError::Application { code: 404, message: format!("unknown chat '{id}'") })?;
        let mut rng = rand::thread_rng();
        let scores: serde_json::Map<String, Value> = names
            .into_iter()
            .map(|name| {
                let score = (rng.gen_range(0.3..0.95_f64) * 100.0).round() / 100.0;
                (name, Value::from(score))
            })
            .collect();
        Ok(Value::Object(scores))
    }

    async fn latency(&self) {
        pause(self.config.latency_ms).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockConfig::default())
    }
}

impl Transport for MockTransport {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        self.latency().await;
        match (request.method, request.path.as_str()) {
            (Method::Get, MODEL_LIST_PATH) => Ok(json!(MOCK_MODELS)),
            (Method::Get, PERSON_LIST_PATH) => {
                let personas = self.personas.lock().unwrap_or_else(|p| p.into_inner()).clone();
                serde_json::to_value(personas)
                    .map_err(|e| RoundtableError::Application { code: 500, message: e.to_string() })
            }
            (Method::Post, PERSON_ADD_PATH) => self.add_persona(request.body.as_ref()),
            (Method::Post, CHAT_NEW_PATH) => self.create_session(request.body.as_ref()),
            (Method::Get, CHAT_EMOTION_PATH) => self.emotion(&request),
            (method, path) => {
                Err(RoundtableError::Application { code: 404, message: format!("no mock route for {method} {path}") })
            }
        }
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<EventStream> {
        if request.path != CHAT_STREAM_PATH {
            return Err(RoundtableError::Application {
                code: 404,
                message: format!("no mock stream at {}", request.path),
            });
        }
        self.latency().await;

        let topic = request.query_value("message").unwrap_or_default().to_string();
        let chat_id = request.query_value("chatID").unwrap_or_default();
        let names = self.roster_for(chat_id).unwrap_or_else(|| {
            builtin_catalog().into_iter().take(MIN_ROSTER).map(|e| e.name).collect()
        });

        let replies: Vec<String> = {
            let mut rng = rand::thread_rng();
            names
                .iter()
                .map(|name| {
                    let template = REPLY_TEMPLATES.choose(&mut rng).copied().unwrap_or(REPLY_TEMPLATES[0]);
                    json!({ "code": 0, "role": name, "content": template.replace("{topic}", &topic) }).to_string()
                })
                .collect()
        };
        let interval = self.config.reply_interval_ms;
        let end_delay = self.config.end_delay_ms;

        Ok(EventStream::spawn(move |tx| async move {
            for reply in replies {
                pause(interval).await;
                if tx.send(Ok(StreamEvent::Message(reply))).await.is_err() {
                    return;
                }
            }
            pause(end_delay).await;
            let _ = tx.send(Ok(StreamEvent::End)).await;
        }))
    }

    fn endpoint(&self) -> String {
        MOCK_ENDPOINT.to_string()
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// `chat_<epoch ms>_<9 base-36 chars>`
fn new_chat_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9).map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char).collect();
    format!("chat_{}_{}", now_ms(), suffix)
}
