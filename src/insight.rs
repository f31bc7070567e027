//! Insight synthesis from finished discussions, and their persistence.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::discussion::{DiscussionRound, RoundStatus};
use crate::error::{Result, RoundtableError};
use crate::now_ms;
use crate::session::Turn;
use crate::wire::{CompletionErrorBody, CompletionMessage, CompletionRequest, CompletionResponse};

/// Key under which insights live in the persisted store.
pub const INSIGHTS_NAMESPACE: &str = "creative_insights";
pub const PLACEHOLDER_CATEGORY: &str = "Core viewpoint";
pub const PLACEHOLDER_CONTENT_CHARS: usize = 50;
pub const RECENT_INSIGHTS: usize = 5;

const SYSTEM_PROMPT: &str =
    "You are a creative analyst who distills the core insights from a diverse expert discussion.";

/// A distilled takeaway from a discussion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub title: String,
    pub content: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub topic: String,
    pub experts: Vec<String>,
    pub timestamp_ms: u64,
    pub id: String,
}

/// Shape the model is asked to return for each insight.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
struct DraftInsight {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DraftEnvelope {
    insights: Vec<DraftInsight>,
}

// ---------------------------------------------------------------------------
// Completion client
// ---------------------------------------------------------------------------

/// One non-streaming chat completion.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(&self, messages: Vec<CompletionMessage>) -> impl Future<Output = Result<String>> + Send;
}

/// OpenAI-compatible `chat/completions` client.
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    client: Client,
    config: LlmConfig,
    model: String,
}

impl ChatCompletionClient {
    /// `default_model` is used when the config names no synthesis model.
    pub fn new(config: LlmConfig, default_model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();
        let model = config.model.clone().unwrap_or_else(|| default_model.into());
        ChatCompletionClient { client, config, model }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl CompletionClient for ChatCompletionClient {
    async fn complete(&self, messages: Vec<CompletionMessage>) -> Result<String> {
        let url = self.config.endpoint.as_str();
        let request = CompletionRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
        };

        let mut builder = self.client.post(url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| RoundtableError::from_reqwest(&e, url, self.config.timeout_ms))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RoundtableError::from_reqwest(&e, url, self.config.timeout_ms))?;

        if !status.is_success() {
            let reported = serde_json::from_slice::<CompletionErrorBody>(&bytes)
                .ok()
                .and_then(|body| body.error)
                .map(|detail| detail.message);
            return Err(match reported {
                Some(message) => RoundtableError::Application { code: i64::from(status.as_u16()), message },
                None => RoundtableError::Http { status: status.as_u16(), url: url.to_string() },
            });
        }

        let body: CompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| RoundtableError::Decode { url: url.to_string(), detail: e.to_string() })?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| RoundtableError::Decode { url: url.to_string(), detail: "no choices".into() })
    }
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

pub struct InsightSynthesizer<C> {
    client: C,
}

impl<C: CompletionClient> InsightSynthesizer<C> {
    pub fn new(client: C) -> Self {
        InsightSynthesizer { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Insights for a completed round.
    pub async fn synthesize(&self, round: &DiscussionRound) -> Result<Vec<Insight>> {
        if round.status != RoundStatus::Complete {
            return Err(RoundtableError::InvalidState(format!(
                "insights need a complete round, this one is {}",
                round.status
            )));
        }
        self.synthesize_transcript(&round.topic, &round.roster.names(), &round.turns).await
    }

    /// Insights for an arbitrary transcript, e.g. a multi-round conversation.
    ///
    /// An empty transcript yields nothing and sends no request. A response
    /// that cannot be parsed degrades to one placeholder insight.
    pub async fn synthesize_transcript(&self, topic: &str, experts: &[String], turns: &[Turn]) -> Result<Vec<Insight>> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }

        let messages = vec![CompletionMessage::system(SYSTEM_PROMPT), CompletionMessage::user(build_prompt(topic, turns))];
        let raw = self.client.complete(messages).await?;
        let drafts = parse_drafts(&raw, topic);
        debug!(topic = %topic, insights = drafts.len(), "insights synthesized");

        let stamped = now_ms();
        Ok(drafts
            .into_iter()
            .map(|d| Insight {
                title: d.title,
                content: d.content,
                category: d.category,
                priority: d.priority,
                topic: topic.to_string(),
                experts: experts.to_vec(),
                timestamp_ms: stamped,
                id: uuid::Uuid::new_v4().to_string(),
            })
            .collect())
    }
}

pub fn build_prompt(topic: &str, turns: &[Turn]) -> String {
    let viewpoints = turns
        .iter()
        .map(|t| format!("{}({}): {}", t.expert_name, t.role_label, t.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Based on the expert discussion below, produce 3-5 discussion results.\n\n\
         Topic: {topic}\n\n\
         Expert viewpoints:\n{viewpoints}\n\n\
         Requirements:\n\
         1. Each result is short and forceful, one sentence each\n\
         2. Reflect deep thinking rather than technical detail\n\
         3. Capture the core viewpoints of the discussion\n\
         4. Include actionable suggestions\n\n\
         Reply in JSON:\n\
         {{\n  \"insights\": [\n    {{\n      \"title\": \"short title\",\n      \
         \"content\": \"one sentence result\",\n      \
         \"category\": \"Core viewpoint|Key insight|Conclusion|Action item|New idea\",\n      \
         \"priority\": \"high|medium|low\"\n    }}\n  ]\n}}"
    )
}

fn parse_drafts(raw: &str, topic: &str) -> Vec<DraftInsight> {
    let parsed = extract_json_block(raw)
        .ok_or_else(|| "no JSON object in response".to_string())
        .and_then(|block| serde_json::from_str::<DraftEnvelope>(block).map_err(|e| e.to_string()));

    match parsed {
        Ok(envelope) => envelope.insights,
        Err(reason) => {
            warn!(reason = %reason, "insight response not parseable, using placeholder");
            vec![placeholder(raw, topic)]
        }
    }
}

fn placeholder(raw: &str, topic: &str) -> DraftInsight {
    DraftInsight {
        title: format!("{topic} - discussion result"),
        content: raw.chars().take(PLACEHOLDER_CONTENT_CHARS).collect(),
        category: PLACEHOLDER_CATEGORY.to_string(),
        priority: None,
    }
}

/// First balanced `{...}` block in `text`, ignoring braces inside strings.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    insights: Vec<Insight>,
    /// Other namespaces found in the file, written back untouched.
    other: Map<String, Value>,
}

/// Most-recent-first insight collection, optionally backed by a JSON file.
#[derive(Debug)]
pub struct InsightStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl InsightStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let mut root: Map<String, Value> = if text.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&text)
                    .map_err(|e| RoundtableError::Persistence(format!("{}: {e}", path.display())))?
            };
            let insights = match root.remove(INSIGHTS_NAMESPACE) {
                Some(value) => serde_json::from_value(value)
                    .map_err(|e| RoundtableError::Persistence(format!("{INSIGHTS_NAMESPACE}: {e}")))?,
                None => Vec::new(),
            };
            StoreState { insights, other: root }
        } else {
            StoreState::default()
        };
        debug!(path = %path.display(), insights = state.insights.len(), "insight store opened");
        Ok(InsightStore { path: Some(path), state: Mutex::new(state) })
    }

    pub fn in_memory() -> Self {
        InsightStore { path: None, state: Mutex::new(StoreState::default()) }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put `insights` in front of the existing ones, keeping their order,
    /// and rewrite the file.
    pub fn prepend(&self, insights: Vec<Insight>) -> Result<()> {
        if insights.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        let added = insights.len();
        let mut next = insights;
        next.extend(state.insights.iter().cloned());
        // memory only changes once the file write succeeded
        if let Some(path) = &self.path {
            persist(path, &next, &state.other)?;
        }
        state.insights = next;
        info!(added, total = state.insights.len(), "insights stored");
        Ok(())
    }

    pub fn all(&self) -> Vec<Insight> {
        self.lock().insights.clone()
    }

    pub fn recent(&self, n: usize) -> Vec<Insight> {
        self.lock().insights.iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().insights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn persist(path: &Path, insights: &[Insight], other: &Map<String, Value>) -> Result<()> {
    let mut root = other.clone();
    let insights = serde_json::to_value(insights).map_err(|e| RoundtableError::Persistence(e.to_string()))?;
    root.insert(INSIGHTS_NAMESPACE.to_string(), insights);
    let bytes = serde_json::to_vec_pretty(&root).map_err(|e| RoundtableError::Persistence(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(title: &str) -> Insight {
        Insight {
            title: title.into(),
            content: "c".into(),
            category: "Key insight".into(),
            priority: Some("high".into()),
            topic: "t".into(),
            experts: vec!["A".into()],
            timestamp_ms: 1,
            id: title.into(),
        }
    }

    #[test]
    fn test_extract_json_block_skips_prose() {
        let text = "Sure! Here you go:\n{\"insights\": []}\nHope that helps {not json}";
        assert_eq!(extract_json_block(text), Some("{\"insights\": []}"));
    }

    #[test]
    fn test_extract_json_block_ignores_braces_in_strings() {
        let text = r#"{"a": "close } and open { and \" quote", "b": {"c": 1}} trailing"#;
        assert_eq!(extract_json_block(text), Some(r#"{"a": "close } and open { and \" quote", "b": {"c": 1}}"#));
    }

    #[test]
    fn test_extract_json_block_unbalanced() {
        assert_eq!(extract_json_block("{\"a\": 1"), None);
        assert_eq!(extract_json_block("no braces"), None);
    }

    #[test]
    fn test_parse_drafts_reads_insights() {
        let drafts = parse_drafts(
            "```json\n{\"insights\":[{\"title\":\"T\",\"content\":\"C\",\"category\":\"Key insight\",\"priority\":\"high\"}]}\n```",
            "topic",
        );
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "T");
        assert_eq!(drafts[0].priority.as_deref(), Some("high"));
    }

    #[test]
    fn test_parse_drafts_placeholder_on_garbage() {
        let raw = "I could not think of anything useful to say about this, sorry about that.";
        let drafts = parse_drafts(raw, "Tea");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Tea - discussion result");
        assert_eq!(drafts[0].category, PLACEHOLDER_CATEGORY);
        assert_eq!(drafts[0].content.chars().count(), PLACEHOLDER_CONTENT_CHARS);
        assert!(raw.starts_with(&drafts[0].content));
    }

    #[test]
    fn test_parse_drafts_placeholder_when_insights_key_missing() {
        let drafts = parse_drafts("{\"results\": []}", "Tea");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].content, "{\"results\": []}");
    }

    #[test]
    fn test_build_prompt_lists_turns_in_order() {
        let turns = vec![
            Turn { expert_name: "A".into(), role_label: "R1".into(), content: "one".into(), timestamp_ms: 0, turn_id: "1".into() },
            Turn { expert_name: "B".into(), role_label: "R2".into(), content: "two".into(), timestamp_ms: 0, turn_id: "2".into() },
        ];
        let prompt = build_prompt("Tea", &turns);
        assert!(prompt.contains("Topic: Tea"));
        assert!(prompt.contains("A(R1): one\n\nB(R2): two"));
        assert!(prompt.contains("\"insights\""));
    }

    #[test]
    fn test_in_memory_store_prepends_most_recent_first() {
        let store = InsightStore::in_memory();
        store.prepend(vec![insight("a"), insight("b")]).expect("prepend");
        store.prepend(vec![insight("c")]).expect("prepend");
        let titles: Vec<_> = store.all().into_iter().map(|i| i.title).collect();
        assert_eq!(titles, vec!["c", "a", "b"]);
        assert_eq!(store.recent(2).len(), 2);
        assert!(store.path().is_none());
    }

    #[test]
    fn test_file_store_round_trips_and_keeps_other_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"theme": "dark"}"#).expect("seed");

        let store = InsightStore::open(&path).expect("open");
        assert!(store.is_empty());
        store.prepend(vec![insight("x")]).expect("prepend");

        let reopened = InsightStore::open(&path).expect("reopen");
        assert_eq!(reopened.len(), 1);
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(raw["theme"], "dark");
        assert_eq!(raw[INSIGHTS_NAMESPACE][0]["timestampMs"], 1);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "file").expect("seed");
        // the parent of the store path is a regular file, so every write fails
        let store = InsightStore::open(blocker.join("store.json")).expect("open");

        let err = store.prepend(vec![insight("lost")]).unwrap_err();
        assert!(matches!(err, RoundtableError::Persistence(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_store_is_persistence_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, "[not an object").expect("seed");
        assert!(matches!(InsightStore::open(&path), Err(RoundtableError::Persistence(_))));
    }
}
