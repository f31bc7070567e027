//! Expert personas, rosters, and the backend directory calls around them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RoundtableError};
use crate::transport::{ApiRequest, Transport};
use crate::wire::{CHAT_EMOTION_PATH, MODEL_LIST_PATH, PERSON_ADD_PATH, PERSON_LIST_PATH};

pub const MIN_ROSTER: usize = 3;
pub const MAX_ROSTER: usize = 5;

/// Label used for a turn whose expert has no role.
pub const DEFAULT_ROLE_LABEL: &str = "Expert";

/// An expert persona.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expert {
    /// Backend-assigned id, absent for built-in personas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub specialty: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Template that seeds the model's behavior for this persona.
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Expert {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Expert { name: name.into(), role: role.into(), ..Default::default() }
    }

    pub fn role_label(&self) -> &str {
        if self.role.trim().is_empty() {
            DEFAULT_ROLE_LABEL
        } else {
            &self.role
        }
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Ordered set of 3–5 distinct experts taking part in one discussion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Roster {
    experts: Vec<Expert>,
}

impl Roster {
    pub fn new(experts: Vec<Expert>) -> Result<Self> {
        if !(MIN_ROSTER..=MAX_ROSTER).contains(&experts.len()) {
            return Err(RoundtableError::InvalidInput(format!(
                "a discussion needs {MIN_ROSTER}-{MAX_ROSTER} experts, got {}",
                experts.len()
            )));
        }
        let mut seen = HashSet::new();
        for expert in &experts {
            if expert.name.trim().is_empty() {
                return Err(RoundtableError::InvalidInput("expert name must not be empty".into()));
            }
            if !seen.insert(expert.name.as_str()) {
                return Err(RoundtableError::InvalidInput(format!(
                    "expert '{}' selected twice",
                    expert.name
                )));
            }
        }
        Ok(Roster { experts })
    }

    pub fn experts(&self) -> &[Expert] {
        &self.experts
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.experts.iter().map(|e| e.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Expert> {
        self.experts.iter().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// Outcome of [`RosterSelection::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionStatus {
    pub count: usize,
    pub can_proceed: bool,
    pub text: String,
}

/// Mutable picker from which a [`Roster`] is built.
#[derive(Debug, Clone, Default)]
pub struct RosterSelection {
    selected: Vec<Expert>,
}

impl RosterSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `expert`, or remove it when a same-named expert is already selected.
    ///
    /// Additions beyond [`MAX_ROSTER`] are ignored.
    pub fn toggle(&mut self, expert: Expert) {
        if let Some(pos) = self.selected.iter().position(|e| e.name == expert.name) {
            self.selected.remove(pos);
        } else if self.selected.len() < MAX_ROSTER {
            self.selected.push(expert);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.selected.retain(|e| e.name != name);
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn selected(&self) -> &[Expert] {
        &self.selected
    }

    pub fn status(&self) -> SelectionStatus {
        let count = self.selected.len();
        let (can_proceed, text) = if count < MIN_ROSTER {
            (false, format!("Select {MIN_ROSTER}-{MAX_ROSTER} experts ({count} selected)"))
        } else if count <= MAX_ROSTER {
            (true, format!("{count} experts selected, ready to discuss"))
        } else {
            (false, format!("At most {MAX_ROSTER} experts can be selected"))
        };
        SelectionStatus { count, can_proceed, text }
    }

    pub fn to_roster(&self) -> Result<Roster> {
        Roster::new(self.selected.clone())
    }
}

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

/// Personas available without a backend.
pub fn builtin_catalog() -> Vec<Expert> {
    const ENTRIES: &[(&str, &str, &str, &str, &str, &str, &str)] = &[
        ("Steve Jobs", "Godfather of Innovation", "product philosophy, user experience, innovative thinking", "perfectionist, revolutionary, minimalist", "🍎", "tech",
         "You speak as Steve Jobs: obsessed with product and user experience. Share your sharpest instinct."),
        ("Elon Musk", "Futurist", "disruptive innovation, technical breakthroughs, business vision", "audacious, techno-optimist, rule-breaking", "🚀", "tech",
         "You speak as Elon Musk: always thinking about how technology reshapes humanity's future."),
        ("Alan Turing", "Father of Computing", "algorithm design, artificial intelligence, logic", "rigorous, mathematical, far-sighted", "🤖", "tech",
         "You speak as Alan Turing: deep command of mathematics and logic."),
        ("John von Neumann", "Mathematical Genius", "system architecture, mathematical modelling, game theory", "prodigious, systematic, intuitive", "🧮", "tech",
         "You speak as John von Neumann: you see every problem as a system to be modelled."),
        ("Claude Shannon", "Father of Information Theory", "information theory, communication, modelling", "playful, precise, curious", "📡", "tech",
         "You speak as Claude Shannon: you reduce problems to signal, noise and bits."),
        ("Richard Feynman", "Physics Virtuoso", "theoretical physics, teaching, creative thinking", "irreverent, curious, plain-spoken", "🔬", "tech",
         "You speak as Richard Feynman: explain it simply or admit you don't understand it."),
        ("Warren Buffett", "Investing Sage", "value investing, risk assessment, long-term thinking", "patient, frugal, folksy", "💰", "business",
         "You speak as Warren Buffett: think in decades and margins of safety."),
        ("Jeff Bezos", "Customer Obsessive", "customer experience, long-term strategy, operations", "relentless, data-driven, long-term", "📦", "business",
         "You speak as Jeff Bezos: start from the customer and work backwards."),
        ("Kazuo Inamori", "Management Philosopher", "management philosophy, life wisdom, corporate spirit", "humble, principled, devoted", "🏢", "business",
         "You speak as Kazuo Inamori: business is a moral practice."),
        ("Peter Drucker", "Management Guru", "management, organization theory, knowledge work", "analytical, humane, pragmatic", "📚", "business",
         "You speak as Peter Drucker: ask what the right thing to do is."),
        ("Albert Einstein", "Master of Relativity", "theoretical physics, creative thinking, philosophy", "imaginative, skeptical, whimsical", "⚡", "science",
         "You speak as Albert Einstein: imagination matters more than knowledge."),
        ("Leonardo da Vinci", "Universal Genius", "cross-disciplinary thinking, art and science, design", "insatiably curious, observant, inventive", "🎭", "arts",
         "You speak as Leonardo da Vinci: connect art, nature and engineering."),
    ];

    ENTRIES
        .iter()
        .map(|(name, role, specialty, personality, avatar, category, prompt)| Expert {
            id: None,
            name: name.to_string(),
            role: role.to_string(),
            specialty: specialty.to_string(),
            personality: personality.to_string(),
            avatar: avatar.to_string(),
            category: category.to_string(),
            description: format!("{name}, {role}"),
            prompt: prompt.to_string(),
            created_at: None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Directory calls
// ---------------------------------------------------------------------------

pub async fn fetch_models<T: Transport>(transport: &T) -> Result<Vec<String>> {
    let data = transport.request(ApiRequest::get(MODEL_LIST_PATH)).await?;
    decode_or_empty(data, MODEL_LIST_PATH)
}

pub async fn fetch_personas<T: Transport>(transport: &T) -> Result<Vec<Expert>> {
    let data = transport.request(ApiRequest::get(PERSON_LIST_PATH)).await?;
    decode_or_empty(data, PERSON_LIST_PATH)
}

pub async fn add_persona<T: Transport>(transport: &T, expert: &Expert) -> Result<Expert> {
    let body = serde_json::to_value(expert)
        .map_err(|e| RoundtableError::InvalidInput(format!("unserializable persona: {e}")))?;
    let data = transport.request(ApiRequest::post(PERSON_ADD_PATH, body)).await?;
    decode(data, PERSON_ADD_PATH)
}

/// Per-expert sentiment scores for a session.
pub async fn fetch_emotion<T: Transport>(transport: &T, session_id: &str) -> Result<HashMap<String, f64>> {
    let request = ApiRequest::get(CHAT_EMOTION_PATH).with_query("chatID", session_id);
    let data = transport.request(request).await?;
    decode_or_empty(data, CHAT_EMOTION_PATH)
}

/// A success envelope without data means "nothing there", not a malformed reply.
fn decode_or_empty<D: serde::de::DeserializeOwned + Default>(data: Value, path: &str) -> Result<D> {
    if data.is_null() {
        return Ok(D::default());
    }
    decode(data, path)
}

fn decode<D: serde::de::DeserializeOwned>(data: Value, path: &str) -> Result<D> {
    serde_json::from_value(data)
        .map_err(|e| RoundtableError::Decode { url: path.to_string(), detail: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experts(n: usize) -> Vec<Expert> {
        (0..n).map(|i| Expert::new(format!("E{i}"), "role")).collect()
    }

    #[test]
    fn test_roster_accepts_three_to_five() {
        for n in MIN_ROSTER..=MAX_ROSTER {
            assert_eq!(Roster::new(experts(n)).expect("valid").len(), n);
        }
    }

    #[test]
    fn test_roster_rejects_sizes_outside_range() {
        for n in [0, 1, 2, 6, 7] {
            let err = Roster::new(experts(n)).unwrap_err();
            assert!(matches!(err, RoundtableError::InvalidInput(_)), "n={n}");
        }
    }

    #[test]
    fn test_roster_rejects_duplicates() {
        let mut list = experts(3);
        list[2].name = "E0".into();
        assert!(Roster::new(list).is_err());
    }

    #[test]
    fn test_roster_rejects_blank_name() {
        let mut list = experts(3);
        list[1].name = "  ".into();
        assert!(Roster::new(list).is_err());
    }

    #[test]
    fn test_roster_lookup_and_names() {
        let roster = Roster::new(experts(3)).expect("valid");
        assert_eq!(roster.names(), vec!["E0", "E1", "E2"]);
        assert!(roster.contains("E1"));
        assert!(!roster.contains("E9"));
        assert_eq!(roster.get("E2").map(|e| e.role.as_str()), Some("role"));
    }

    #[test]
    fn test_role_label_defaults() {
        assert_eq!(Expert::new("a", "").role_label(), DEFAULT_ROLE_LABEL);
        assert_eq!(Expert::new("a", "Sage").role_label(), "Sage");
    }

    #[test]
    fn test_selection_toggle_adds_and_removes() {
        let mut sel = RosterSelection::new();
        let e = Expert::new("Turing", "r");
        sel.toggle(e.clone());
        assert_eq!(sel.selected().len(), 1);
        sel.toggle(e);
        assert!(sel.selected().is_empty());
    }

    #[test]
    fn test_selection_caps_at_five() {
        let mut sel = RosterSelection::new();
        for e in experts(7) {
            sel.toggle(e);
        }
        assert_eq!(sel.selected().len(), MAX_ROSTER);
        assert!(sel.status().can_proceed);
        assert!(sel.to_roster().is_ok());
    }

    #[test]
    fn test_selection_status_below_minimum() {
        let mut sel = RosterSelection::new();
        sel.toggle(Expert::new("a", "r"));
        let status = sel.status();
        assert_eq!(status.count, 1);
        assert!(!status.can_proceed);
        assert!(status.text.contains("1 selected"));
        sel.remove("a");
        assert_eq!(sel.status().count, 0);
    }

    #[test]
    fn test_builtin_catalog_is_unique_and_complete() {
        let catalog = builtin_catalog();
        assert!(catalog.len() >= MAX_ROSTER);
        let names: HashSet<_> = catalog.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names.len(), catalog.len());
        assert!(catalog.iter().all(|e| !e.prompt.is_empty() && !e.role.is_empty()));
    }

    #[test]
    fn test_expert_wire_form_is_camel_case() {
        let mut e = Expert::new("Turing", "Father of Computing");
        e.created_at = Some("2024-01-01T00:00:00Z".into());
        let v = serde_json::to_value(&e).expect("ser");
        assert_eq!(v["createdAt"], "2024-01-01T00:00:00Z");
        assert!(v.get("id").is_none());
        let back: Expert = serde_json::from_str(r#"{"name":"X","id":17}"#).expect("deser");
        assert_eq!(back.id, Some(Value::from(17)));
        assert_eq!(back.role, "");
    }

    #[test]
    fn test_null_list_data_decodes_empty() {
        let models: Vec<String> = decode_or_empty(Value::Null, MODEL_LIST_PATH).expect("empty");
        assert!(models.is_empty());
        let personas: Vec<Expert> = decode_or_empty(Value::Null, PERSON_LIST_PATH).expect("empty");
        assert!(personas.is_empty());
        let scores: HashMap<String, f64> = decode_or_empty(Value::Null, CHAT_EMOTION_PATH).expect("empty");
        assert!(scores.is_empty());
    }

    #[test]
    fn test_wrong_shape_is_still_decode_error() {
        let err = decode_or_empty::<Vec<String>>(serde_json::json!({"a": 1}), MODEL_LIST_PATH).unwrap_err();
        assert!(matches!(err, RoundtableError::Decode { .. }));
    }
}
