//! Conversation sessions and the mapping from stream events to turns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Roster;
use crate::error::{Result, RoundtableError};
use crate::now_ms;
use crate::transport::{ApiRequest, EventStream, Transport};
use crate::wire::{ChatEventPayload, NewChatRequest, NewChatResponse, CHAT_NEW_PATH, CHAT_STREAM_PATH, SUCCESS_CODE};

/// A backend conversation, reusable across rounds by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub experts: Vec<String>,
    pub model: String,
    pub created_at_ms: u64,
    /// True when the id was supplied by the caller rather than created.
    pub reused: bool,
}

/// One expert utterance within a round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub expert_name: String,
    pub role_label: String,
    pub content: String,
    pub timestamp_ms: u64,
    pub turn_id: String,
}

pub struct SessionManager<T> {
    transport: Arc<T>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        SessionManager { transport }
    }

    /// Reuse `existing` as-is, or create a fresh session for `roster`.
    ///
    /// Creation is a single `POST /chat/new`; no stream is opened here.
    pub async fn ensure_session(&self, existing: Option<&str>, roster: &Roster, model: &str) -> Result<Session> {
        if let Some(id) = existing.map(str::trim).filter(|id| !id.is_empty()) {
            debug!(chat_id = %id, "reusing session");
            return Ok(Session {
                id: id.to_string(),
                experts: roster.names(),
                model: model.to_string(),
                created_at_ms: now_ms(),
                reused: true,
            });
        }

        let body = serde_json::to_value(NewChatRequest { model: model.to_string(), people: roster.names() })
            .map_err(|e| RoundtableError::InvalidInput(e.to_string()))?;
        let data = self.transport.request(ApiRequest::post(CHAT_NEW_PATH, body)).await?;
        let created: NewChatResponse = serde_json::from_value(data).map_err(|e| RoundtableError::Decode {
            url: CHAT_NEW_PATH.to_string(),
            detail: format!("no chat id in response: {e}"),
        })?;
        if created.chat_id.trim().is_empty() {
            return Err(RoundtableError::Decode { url: CHAT_NEW_PATH.to_string(), detail: "empty chat id".into() });
        }

        info!(chat_id = %created.chat_id, model = %model, experts = roster.len(), "session created");
        Ok(Session {
            id: created.chat_id,
            experts: roster.names(),
            model: model.to_string(),
            created_at_ms: now_ms(),
            reused: false,
        })
    }

    pub async fn open_stream(&self, session: &Session, topic: &str) -> Result<EventStream> {
        self.transport.open_stream(stream_request(session, topic)).await
    }
}

/// `GET /chat/chat?chatID=<id>&message=<topic>`
pub fn stream_request(session: &Session, topic: &str) -> ApiRequest {
    ApiRequest::get(CHAT_STREAM_PATH).with_query("chatID", session.id.clone()).with_query("message", topic)
}

/// Map one `data:` payload to a turn.
///
/// Returns `Ok(None)` for frames that carry no utterance and for senders that
/// are not part of `roster`.
pub fn parse_event(data: &str, roster: &Roster) -> Result<Option<Turn>> {
    let payload: ChatEventPayload =
        serde_json::from_str(data).map_err(|e| RoundtableError::Stream(format!("malformed event payload: {e}")))?;

    if let Some(code) = payload.code.filter(|c| *c != SUCCESS_CODE) {
        return Err(RoundtableError::Application {
            code,
            message: payload.msg.unwrap_or_else(|| format!("stream reported error code {code}")),
        });
    }

    let (Some(name), Some(content)) = (payload.role, payload.content) else {
        return Ok(None);
    };
    if name.trim().is_empty() || content.is_empty() {
        return Ok(None);
    }

    let Some(expert) = roster.get(&name) else {
        warn!(expert = %name, "ignoring reply from expert outside the roster");
        return Ok(None);
    };

    Ok(Some(Turn {
        role_label: expert.role_label().to_string(),
        expert_name: name,
        content,
        timestamp_ms: now_ms(),
        turn_id: uuid::Uuid::new_v4().to_string(),
    }))
}
