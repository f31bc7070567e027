use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FailureKind, RoundtableError};

// -- Backend paths ----------------------------------------------------------

pub const CHAT_NEW_PATH: &str = "/chat/new";
pub const CHAT_STREAM_PATH: &str = "/chat/chat";
pub const CHAT_EMOTION_PATH: &str = "/chat/emotion";
pub const MODEL_LIST_PATH: &str = "/model/list";
pub const PERSON_LIST_PATH: &str = "/person/list";
pub const PERSON_ADD_PATH: &str = "/person/add";

/// SSE event name the backend uses to signal end-of-stream.
pub const END_EVENT: &str = "end";

/// Envelope `code` meaning success.
pub const SUCCESS_CODE: i64 = 0;

// -- Response envelope ------------------------------------------------------

/// The `{code, msg, data}` wrapper every non-streaming call returns.
///
/// Some endpoints (session creation) put their payload next to `code`
/// instead of under `data`; those fields land in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn success(data: Value, msg: &str) -> Self {
        Envelope { code: SUCCESS_CODE, msg: Some(msg.to_string()), data: Some(data), extra: Map::new() }
    }

    pub fn into_outcome(self) -> ApiOutcome {
        if self.code != SUCCESS_CODE {
            return ApiOutcome::Failure {
                kind: FailureKind::ApplicationError,
                code: self.code,
                message: self.msg.unwrap_or_else(|| "request failed".to_string()),
            };
        }
        let data = match self.data {
            Some(data) if !data.is_null() => data,
            _ if self.extra.is_empty() => Value::Null,
            _ => Value::Object(self.extra),
        };
        ApiOutcome::Success { data }
    }
}

/// Tagged result at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Success { data: Value },
    Failure { kind: FailureKind, code: i64, message: String },
}

impl ApiOutcome {
    pub fn into_result(self) -> Result<Value, RoundtableError> {
        match self {
            ApiOutcome::Success { data } => Ok(data),
            ApiOutcome::Failure { code, message, .. } => {
                Err(RoundtableError::Application { code, message })
            }
        }
    }
}

// -- Session / chat types ---------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChatRequest {
    pub model: String,
    pub people: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChatResponse {
    #[serde(rename = "chatID", alias = "chatId", alias = "sessionId")]
    pub chat_id: String,
}

/// Payload of one streamed `data:` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatEventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Name of the expert who spoke.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// -- OpenAI-compatible completion types -------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

impl CompletionMessage {
    pub fn system(content: impl Into<String>) -> Self {
        CompletionMessage { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        CompletionMessage { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<CompletionMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionErrorBody {
    pub error: Option<CompletionErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionErrorDetail {
    pub message: String,
}
