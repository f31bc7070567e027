//! The roundtable facade: one object that owns the mode context, both
//! backends, the discussion engine, and the multi-round conversation state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{self, builtin_catalog, Expert};
use crate::config::RoundtableConfig;
use crate::discussion::{DiscussionEngine, DiscussionRequest, DiscussionRound, RoundCanceller, RoundHandle, RoundStatus};
use crate::error::{Result, RoundtableError};
use crate::insight::{ChatCompletionClient, CompletionClient, Insight, InsightStore, InsightSynthesizer, RECENT_INSIGHTS};
use crate::mock::MockTransport;
use crate::mode::{Backend, Mode, ModeSelector, RoundtableContext};
use crate::probe::{ConnectivityProbe, DiagnosticReport};
use crate::session::Turn;
use crate::startup::{InitReport, Initializer, Progress, StepOptions};
use crate::transport::{HttpTransport, Transport};

/// Outcome of [`Roundtable::test_connection`] and [`Roundtable::toggle_mock_mode`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionReport {
    pub mode: Mode,
    pub used_fallback: bool,
    pub models: Vec<String>,
    pub message: String,
}

/// A finished round plus whatever insights it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRound {
    pub round: DiscussionRound,
    pub insights: Vec<Insight>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Success,
}

/// A suggested fix derived from the current conversation state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub actions: Vec<String>,
}

impl Recommendation {
    fn new(severity: Severity, title: &str, description: &str, actions: &[&str]) -> Self {
        Recommendation {
            severity,
            title: title.to_string(),
            description: description.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Outcome of [`Roundtable::diagnose`].
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub mode: Mode,
    pub report: DiagnosticReport,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Default)]
struct Conversation {
    connected: bool,
    model: String,
    session_id: Option<String>,
    topic: String,
    experts: Vec<String>,
    history: Vec<Turn>,
    personas: Vec<Expert>,
    models: Vec<String>,
    active: Option<RoundCanceller>,
}

pub type RoutedBackend<R, M> = Backend<Arc<R>, M>;

pub struct Roundtable<R, M, C> {
    config: RoundtableConfig,
    context: Arc<RoundtableContext>,
    backend: Arc<RoutedBackend<R, M>>,
    engine: DiscussionEngine<RoutedBackend<R, M>>,
    selector: ModeSelector<Arc<R>>,
    synthesizer: InsightSynthesizer<C>,
    store: InsightStore,
    state: Mutex<Conversation>,
}

impl Roundtable<HttpTransport, MockTransport, ChatCompletionClient> {
    /// Wire up the production stack from configuration.
    pub fn from_config(config: RoundtableConfig) -> Result<Self> {
        let real = HttpTransport::from_config(&config);
        let mock = MockTransport::new(config.mock.clone());
        let completion = ChatCompletionClient::new(config.llm.clone(), config.default_model.clone());
        let store = match &config.insights_path {
            Some(path) => InsightStore::open(path)?,
            None => InsightStore::in_memory(),
        };
        Ok(Self::new(config, real, mock, completion, store))
    }
}

impl<R, M, C> Roundtable<R, M, C>
where
    R: Transport,
    M: Transport,
    C: CompletionClient,
{
    pub fn new(config: RoundtableConfig, real: R, mock: M, completion: C, store: InsightStore) -> Self {
        let context = Arc::new(RoundtableContext::new(Mode::Real, config.auto_fallback));
        let real = Arc::new(real);
        let backend = Arc::new(Backend::new(
            Arc::clone(&real),
            mock,
            Arc::clone(&context),
            config.fallback_after_failures,
        ));
        let engine = DiscussionEngine::new(Arc::clone(&context), Arc::clone(&backend))
            .with_grace(config.completion_grace());
        let selector = ModeSelector::new(ConnectivityProbe::new(real, config.probe_timeout()), Arc::clone(&context));

        let state = Conversation { model: config.default_model.clone(), ..Default::default() };
        Roundtable {
            config,
            context,
            backend,
            engine,
            selector,
            synthesizer: InsightSynthesizer::new(completion),
            store,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &RoundtableConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<RoundtableContext> {
        &self.context
    }

    pub fn backend(&self) -> &Arc<RoutedBackend<R, M>> {
        &self.backend
    }

    pub fn selector(&self) -> &ModeSelector<Arc<R>> {
        &self.selector
    }

    pub fn mode(&self) -> Mode {
        self.context.mode()
    }

    pub fn set_auto_fallback(&self, enabled: bool) {
        self.context.set_auto_fallback(enabled);
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn model(&self) -> String {
        self.lock().model.clone()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        self.lock().model = model.into();
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Turns of every completed round in the current conversation.
    pub fn history(&self) -> Vec<Turn> {
        self.lock().history.clone()
    }

    pub fn personas(&self) -> Vec<Expert> {
        self.lock().personas.clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.lock().models.clone()
    }

    /// Status of the round started last, `Idle` when there is none.
    pub fn round_status(&self) -> RoundStatus {
        self.lock().active.as_ref().map(RoundCanceller::status).unwrap_or_default()
    }

    fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    // -- connectivity -------------------------------------------------------

    /// Probe the real backend, pick a mode, and load the model list from
    /// whichever backend was chosen.
    pub async fn test_connection(&self) -> Result<ConnectionReport> {
        let selection = match self.selector.select_mode().await {
            Ok(selection) => selection,
            Err(e) => {
                self.set_connected(false);
                return Err(e);
            }
        };

        let models = match self.load_models().await {
            Ok(models) => models,
            Err(e) => {
                self.set_connected(false);
                return Err(e);
            }
        };
        self.set_connected(true);

        let message = if selection.used_fallback {
            "demo mode enabled (backend API unavailable)".to_string()
        } else {
            selection.probe.detail.clone()
        };
        info!(mode = %selection.mode, fallback = selection.used_fallback, models = models.len(), "connection established");
        Ok(ConnectionReport { mode: selection.mode, used_fallback: selection.used_fallback, models, message })
    }

    /// Flip between the mock and the real backend.
    ///
    /// Switching to real re-runs [`test_connection`](Self::test_connection),
    /// which may land back in mock mode when the backend is unreachable.
    pub async fn toggle_mock_mode(&self) -> Result<ConnectionReport> {
        match self.context.mode() {
            Mode::Real => {
                self.context.set_mode(Mode::Mock)?;
                match self.load_models().await {
                    Ok(models) => {
                        self.set_connected(true);
                        Ok(ConnectionReport {
                            mode: Mode::Mock,
                            used_fallback: false,
                            models,
                            message: "switched to demo mode".to_string(),
                        })
                    }
                    Err(e) => {
                        self.set_connected(false);
                        Err(e)
                    }
                }
            }
            Mode::Mock => {
                self.context.set_mode(Mode::Real)?;
                self.set_connected(false);
                self.test_connection().await
            }
        }
    }

    // -- directory ----------------------------------------------------------

    pub async fn load_models(&self) -> Result<Vec<String>> {
        let models = catalog::fetch_models(&*self.backend).await?;
        self.lock().models = models.clone();
        Ok(models)
    }

    /// Load personas; in real mode a failed load falls back to the built-in catalog.
    pub async fn load_personas(&self) -> Result<Vec<Expert>> {
        let personas = match catalog::fetch_personas(&*self.backend).await {
            Ok(personas) => personas,
            Err(e) if self.context.mode() == Mode::Real => {
                warn!(error = %e, "persona list unavailable, using built-in catalog");
                builtin_catalog()
            }
            Err(e) => return Err(e),
        };
        self.lock().personas = personas.clone();
        Ok(personas)
    }

    pub async fn add_persona(&self, expert: &Expert) -> Result<Expert> {
        let stored = catalog::add_persona(&*self.backend, expert).await?;
        self.load_personas().await?;
        Ok(stored)
    }

    pub async fn emotion(&self, session_id: &str) -> Result<HashMap<String, f64>> {
        catalog::fetch_emotion(&*self.backend, session_id).await
    }

    // -- discussion ---------------------------------------------------------

    /// Start a fresh conversation. History and session are replaced once the
    /// new round has started; a rejected start keeps them.
    pub async fn start_new_discussion(&self, topic: &str, experts: Vec<Expert>) -> Result<RoundHandle> {
        self.start_discussion(topic, experts, true).await
    }

    /// Another round in the current session.
    pub async fn continue_discussion(&self, topic: &str, experts: Vec<Expert>) -> Result<RoundHandle> {
        if self.current_session_id().is_none() {
            return Err(RoundtableError::InvalidInput(
                "no conversation to continue, start a new one".into(),
            ));
        }
        self.start_discussion(topic, experts, false).await
    }

    pub async fn start_discussion(&self, topic: &str, experts: Vec<Expert>, new_conversation: bool) -> Result<RoundHandle> {
        if !self.is_connected() {
            return Err(RoundtableError::InvalidState("test the connection before starting a discussion".into()));
        }
        if self.context.is_round_active() {
            return Err(RoundtableError::ConcurrentRound);
        }

        let request = {
            let state = self.lock();
            let request = DiscussionRequest::new(topic, experts, state.model.clone());
            match &state.session_id {
                Some(id) if !new_conversation => request.with_session(id.clone()),
                _ => request,
            }
        };

        // a rejected start leaves the current conversation untouched
        let handle = self.engine.start(request).await?;

        let mut state = self.lock();
        if new_conversation {
            state.history.clear();
        }
        if state.session_id.as_deref() != Some(handle.session_id()) {
            info!(chat_id = %handle.session_id(), "conversation session recorded");
            state.session_id = Some(handle.session_id().to_string());
        }
        state.topic = topic.trim().to_string();
        state.experts = handle.snapshot().roster.names();
        state.active = Some(handle.canceller());
        Ok(handle)
    }

    /// Cancel the running round. Returns false when nothing was running.
    pub fn cancel_discussion(&self) -> bool {
        let active = self.lock().active.clone();
        match active {
            Some(canceller) => canceller.cancel().is_ok(),
            None => false,
        }
    }

    /// Forget the session and history; a running round is cancelled.
    pub fn reset_conversation(&self) {
        self.cancel_discussion();
        let mut state = self.lock();
        state.session_id = None;
        state.history.clear();
        state.topic.clear();
        state.experts.clear();
        info!("conversation reset");
    }

    /// Wait for `handle`, fold a completed round into the history, and
    /// synthesize insights when enabled.
    ///
    /// Insight failures are logged; they never fail the round.
    pub async fn finish_round(&self, handle: RoundHandle) -> FinishedRound {
        let round = handle.wait().await;
        if round.status != RoundStatus::Complete {
            return FinishedRound { round, insights: Vec::new() };
        }

        let (topic, experts, transcript) = {
            let mut state = self.lock();
            state.history.extend(round.turns.iter().cloned());
            (state.topic.clone(), state.experts.clone(), state.history.clone())
        };
        if !self.config.auto_insights {
            return FinishedRound { round, insights: Vec::new() };
        }

        let insights = match self.synthesizer.synthesize_transcript(&topic, &experts, &transcript).await {
            Ok(insights) => insights,
            Err(e) => {
                warn!(error = %e, round_id = %round.id, "insight synthesis failed");
                Vec::new()
            }
        };
        if let Err(e) = self.store.prepend(insights.clone()) {
            warn!(error = %e, "insights could not be persisted");
        }
        FinishedRound { round, insights }
    }

    pub fn recent_insights(&self) -> Vec<Insight> {
        self.store.recent(RECENT_INSIGHTS)
    }

    pub fn insights(&self) -> &InsightStore {
        &self.store
    }

    // -- diagnostics --------------------------------------------------------

    /// Fixes for whatever the conversation is missing right now.
    ///
    /// Always returns at least one entry; a healthy state yields a single
    /// [`Severity::Success`].
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let state = self.lock();
        let mut out = Vec::new();

        if !state.connected {
            let check_backend = format!("check that the backend is running at {}", self.config.base_url);
            out.push(Recommendation::new(
                Severity::Error,
                "API connection failed",
                "the backend API service cannot be reached",
                &[check_backend.as_str(), "confirm the network connection", "try switching to demo mode"],
            ));
        }
        if state.personas.is_empty() {
            out.push(Recommendation::new(
                Severity::Warning,
                "expert personas missing",
                "no expert personas have been loaded",
                &["check the /person/list endpoint", "reload the persona list"],
            ));
        }
        if state.models.is_empty() {
            out.push(Recommendation::new(
                Severity::Warning,
                "model list missing",
                "no models have been loaded",
                &["check the /model/list endpoint", "confirm the backend model configuration", "reload the model list"],
            ));
        }
        if out.is_empty() {
            out.push(Recommendation::new(
                Severity::Success,
                "system healthy",
                "all components are working",
                &["every feature is available", "run the diagnostic again if something breaks"],
            ));
        }
        out
    }

    /// Check the real backend end to end and pair the result with recommendations.
    ///
    /// Leaves the mode and the loaded state untouched.
    pub async fn diagnose(&self) -> Diagnosis {
        let report = self.selector.probe().diagnostic_report().await;
        let recommendations = self.recommendations();
        info!(
            passed = report.passed,
            mode = %self.mode(),
            recommendations = recommendations.len(),
            "diagnosis complete"
        );
        Diagnosis { mode: self.mode(), report, recommendations }
    }

    // -- startup ------------------------------------------------------------

    /// Connection test, persona load, and model load, none of them fatal.
    pub async fn initialize(&self) -> Result<InitReport> {
        self.initialize_with_progress(|progress, step| {
            info!(step, current = progress.current, total = progress.total, "initializing");
        })
        .await
    }

    pub async fn initialize_with_progress<'a, F>(&'a self, progress: F) -> Result<InitReport>
    where
        F: FnMut(Progress, &str) + Send + 'a,
    {
        Initializer::new()
            .add_step("connection", StepOptions::optional(2, Duration::from_secs(8)), move || {
                async move { self.test_connection().await.map(|_| ()) }.boxed()
            })
            .add_step("personas", StepOptions::optional(3, Duration::from_secs(10)), move || {
                async move { self.load_personas().await.map(|_| ()) }.boxed()
            })
            .add_step("models", StepOptions::optional(2, Duration::from_secs(8)), move || {
                async move { self.load_models().await.map(|_| ()) }.boxed()
            })
            .on_progress(progress)
            .run()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::wire::CompletionMessage;

    struct NoCompletion;

    impl CompletionClient for NoCompletion {
        async fn complete(&self, _messages: Vec<CompletionMessage>) -> Result<String> {
            Err(RoundtableError::ConnectionRefused { url: "llm".into(), detail: "offline".into() })
        }
    }

    fn offline_roundtable() -> Roundtable<MockTransport, MockTransport, NoCompletion> {
        let config = RoundtableConfig { insights_path: None, completion_grace_ms: 0, ..Default::default() };
        Roundtable::new(
            config,
            MockTransport::new(MockConfig::instant()),
            MockTransport::new(MockConfig::instant()),
            NoCompletion,
            InsightStore::in_memory(),
        )
    }

    #[tokio::test]
    async fn test_start_requires_connection() {
        let rt = offline_roundtable();
        let err = rt.start_new_discussion("tea", builtin_catalog()[..3].to_vec()).await.unwrap_err();
        assert!(matches!(err, RoundtableError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_continue_without_session_is_invalid_input() {
        let rt = offline_roundtable();
        rt.test_connection().await.expect("connect");
        let err = rt.continue_discussion("tea", builtin_catalog()[..3].to_vec()).await.unwrap_err();
        assert!(matches!(err, RoundtableError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_synthesis_failure_does_not_fail_round() {
        let rt = offline_roundtable();
        rt.test_connection().await.expect("connect");
        let handle = rt.start_new_discussion("tea", builtin_catalog()[..3].to_vec()).await.expect("start");
        let finished = rt.finish_round(handle).await;
        assert_eq!(finished.round.status, RoundStatus::Complete);
        assert!(finished.insights.is_empty());
        assert_eq!(rt.history().len(), finished.round.turns.len());
        assert!(rt.recent_insights().is_empty());
    }

    #[test]
    fn test_cancel_without_round_is_noop() {
        let rt = offline_roundtable();
        assert!(!rt.cancel_discussion());
        assert_eq!(rt.round_status(), RoundStatus::Idle);
    }
}
