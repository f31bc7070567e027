//! Tests for insight synthesis and the persisted insight store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use proptest::prelude::*;
use roundtable::catalog::{Expert, Roster};
use roundtable::discussion::{CompletionPath, DiscussionRound, RoundStatus};
use roundtable::error::{Result, RoundtableError};
use roundtable::insight::*;
use roundtable::session::{Session, Turn};
use roundtable::wire::CompletionMessage;

/// Completion client that returns a canned reply and records the prompt.
struct Canned {
    reply: std::result::Result<String, RoundtableError>,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl Canned {
    fn ok(reply: &str) -> Self {
        Canned { reply: Ok(reply.to_string()), calls: AtomicUsize::new(0), last_prompt: Mutex::new(None) }
    }

    fn err(err: RoundtableError) -> Self {
        Canned { reply: Err(err), calls: AtomicUsize::new(0), last_prompt: Mutex::new(None) }
    }
}

impl CompletionClient for Canned {
    async fn complete(&self, messages: Vec<CompletionMessage>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().expect("lock") = messages.last().map(|m| m.content.clone());
        self.reply.clone()
    }
}

fn turn(name: &str, role: &str, content: &str) -> Turn {
    Turn {
        expert_name: name.into(),
        role_label: role.into(),
        content: content.into(),
        timestamp_ms: 0,
        turn_id: format!("{name}-{content}"),
    }
}

fn round(turns: Vec<Turn>, status: RoundStatus) -> DiscussionRound {
    let roster = Roster::new(vec![
        Expert::new("Ada", "Analyst"),
        Expert::new("Brian", "Builder"),
        Expert::new("Cleo", "Critic"),
    ])
    .expect("roster");
    DiscussionRound {
        id: "r1".into(),
        topic: "Remote work".into(),
        session: Session {
            id: "chat-1".into(),
            experts: roster.names(),
            model: "m".into(),
            created_at_ms: 0,
            reused: false,
        },
        roster,
        turns,
        status,
        completed_via: Some(CompletionPath::BackendEnded),
        failure: None,
    }
}

fn transcript() -> Vec<Turn> {
    vec![
        turn("Ada", "Analyst", "Measure output, not hours."),
        turn("Brian", "Builder", "Tools matter less than habits."),
        turn("Cleo", "Critic", "Loneliness is the hidden cost."),
    ]
}

#[tokio::test]
async fn test_well_formed_response_yields_stamped_insights() {
    let reply = r#"Here is the analysis:
{"insights": [
  {"title": "Outcomes over hours", "content": "Judge results.", "category": "Key insight", "priority": "high"},
  {"title": "Mind the people", "content": "Plan for isolation.", "category": "Action item", "priority": "medium"}
]}"#;
    let synth = InsightSynthesizer::new(Canned::ok(reply));
    let insights = synth.synthesize(&round(transcript(), RoundStatus::Complete)).await.expect("insights");

    assert_eq!(insights.len(), 2);
    assert_eq!(insights[0].title, "Outcomes over hours");
    assert_eq!(insights[1].priority.as_deref(), Some("medium"));
    for insight in &insights {
        assert_eq!(insight.topic, "Remote work");
        assert_eq!(insight.experts, vec!["Ada", "Brian", "Cleo"]);
        assert!(insight.timestamp_ms > 0);
    }
    assert_ne!(insights[0].id, insights[1].id);
}

#[tokio::test]
async fn test_prompt_carries_topic_and_ordered_transcript() {
    let synth = InsightSynthesizer::new(Canned::ok("{\"insights\": []}"));
    synth.synthesize(&round(transcript(), RoundStatus::Complete)).await.expect("insights");
    let prompt = synth.client().last_prompt.lock().expect("lock").clone().expect("prompt");
    assert!(prompt.contains("Remote work"));
    let ada = prompt.find("Ada(Analyst): Measure output").expect("ada");
    let cleo = prompt.find("Cleo(Critic): Loneliness").expect("cleo");
    assert!(ada < cleo);
}

#[tokio::test]
async fn test_malformed_output_degrades_to_single_placeholder() {
    let raw = "The experts broadly agreed that remote work is here to stay, with caveats about culture.";
    let synth = InsightSynthesizer::new(Canned::ok(raw));
    let insights = synth.synthesize(&round(transcript(), RoundStatus::Complete)).await.expect("never errors");

    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].title, "Remote work - discussion result");
    assert_eq!(insights[0].category, PLACEHOLDER_CATEGORY);
    assert!(insights[0].content.chars().count() <= PLACEHOLDER_CONTENT_CHARS);
    assert!(raw.starts_with(&insights[0].content));
}

#[tokio::test]
async fn test_empty_transcript_makes_no_request() {
    let synth = InsightSynthesizer::new(Canned::ok("unused"));
    let insights = synth.synthesize(&round(Vec::new(), RoundStatus::Complete)).await.expect("ok");
    assert!(insights.is_empty());
    assert_eq!(synth.client().calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_request_failure_propagates() {
    let synth = InsightSynthesizer::new(Canned::err(RoundtableError::Timeout { context: "llm".into(), after_ms: 60_000 }));
    let err = synth.synthesize(&round(transcript(), RoundStatus::Complete)).await.unwrap_err();
    assert!(matches!(err, RoundtableError::Timeout { .. }));
}

#[tokio::test]
async fn test_unfinished_round_is_rejected() {
    let synth = InsightSynthesizer::new(Canned::ok("{}"));
    let err = synth.synthesize(&round(transcript(), RoundStatus::Cancelled)).await.unwrap_err();
    assert!(matches!(err, RoundtableError::InvalidState(_)));
    assert_eq!(synth.client().calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_store_persists_across_reopen_most_recent_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("insights.json");
    let make = |title: &str| Insight {
        title: title.into(),
        content: "c".into(),
        category: "Key insight".into(),
        priority: None,
        topic: "t".into(),
        experts: vec![],
        timestamp_ms: 0,
        id: title.into(),
    };

    let store = InsightStore::open(&path).expect("open");
    store.prepend(vec![make("old")]).expect("prepend");
    store.prepend((0..6).map(|i| make(&format!("new{i}"))).collect()).expect("prepend");

    let reopened = InsightStore::open(&path).expect("reopen");
    assert_eq!(reopened.len(), 7);
    let recent: Vec<String> = reopened.recent(RECENT_INSIGHTS).into_iter().map(|i| i.title).collect();
    assert_eq!(recent, vec!["new0", "new1", "new2", "new3", "new4"]);
    assert_eq!(reopened.all().last().map(|i| i.title.clone()), Some("old".to_string()));
}

proptest! {
    #[test]
    fn test_placeholder_content_never_exceeds_limit(raw in "[^{]{0,200}") {
        let rt = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
        let insights = rt.block_on(async {
            InsightSynthesizer::new(Canned::ok(&raw))
                .synthesize_transcript("Topic", &[], &transcript())
                .await
        }).expect("never errors");
        prop_assert_eq!(insights.len(), 1);
        prop_assert!(insights[0].content.chars().count() <= PLACEHOLDER_CONTENT_CHARS);
        prop_assert!(raw.starts_with(&insights[0].content));
    }
}
