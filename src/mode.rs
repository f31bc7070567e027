//! Real/mock mode selection and the process-wide discussion context.
//!
//! ## Design
//! - [`RoundtableContext`] owns the mode flag and the active-round marker
//!   behind one mutex, so "switch mode" and "start a round" can never
//!   interleave.
//! - [`Backend`] is a [`Transport`] that routes every call to the real or
//!   the mock transport according to the current mode, and demotes itself to
//!   mock after repeated real-mode connectivity failures.
//! - [`ModeSelector`] runs the connectivity probe and applies the fallback
//!   policy at startup or on demand.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{FailureKind, Result, RoundtableError};
use crate::probe::{ConnectivityProbe, ProbeReport};
use crate::transport::{ApiRequest, EventStream, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Real,
    Mock,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Real => write!(f, "real"),
            Mode::Mock => write!(f, "mock"),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ContextState {
    mode: Mode,
    auto_fallback: bool,
    active_round: Option<String>,
}

/// Shared, single-writer state: current mode plus the "round in progress" marker.
#[derive(Debug)]
pub struct RoundtableContext {
    state: Mutex<ContextState>,
}

impl RoundtableContext {
    pub fn new(mode: Mode, auto_fallback: bool) -> Self {
        RoundtableContext {
            state: Mutex::new(ContextState { mode, auto_fallback, active_round: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn auto_fallback(&self) -> bool {
        self.lock().auto_fallback
    }

    pub fn set_auto_fallback(&self, enabled: bool) {
        self.lock().auto_fallback = enabled;
    }

    pub fn active_round(&self) -> Option<String> {
        self.lock().active_round.clone()
    }

    pub fn is_round_active(&self) -> bool {
        self.lock().active_round.is_some()
    }

    /// Switch mode, returning the previous one.
    ///
    /// Rejected with [`RoundtableError::ModeLocked`] while a round is active.
    pub fn set_mode(&self, mode: Mode) -> Result<Mode> {
        let mut state = self.lock();
        if state.active_round.is_some() {
            return Err(RoundtableError::ModeLocked);
        }
        let previous = std::mem::replace(&mut state.mode, mode);
        if previous != mode {
            info!(from = %previous, to = %mode, "mode changed");
        }
        Ok(previous)
    }

    /// Claim the round marker for `round_id`.
    ///
    /// The marker is released when the returned guard is dropped.
    pub fn begin_round(self: &Arc<Self>, round_id: &str) -> Result<RoundGuard> {
        let mut state = self.lock();
        if state.active_round.is_some() {
            return Err(RoundtableError::ConcurrentRound);
        }
        state.active_round = Some(round_id.to_string());
        Ok(RoundGuard { context: Arc::clone(self), round_id: round_id.to_string() })
    }

    fn end_round(&self, round_id: &str) {
        let mut state = self.lock();
        if state.active_round.as_deref() == Some(round_id) {
            state.active_round = None;
        }
    }
}

impl Default for RoundtableContext {
    fn default() -> Self {
        Self::new(Mode::Real, true)
    }
}

/// Holds the active-round marker; dropping it releases the marker.
#[derive(Debug)]
pub struct RoundGuard {
    context: Arc<RoundtableContext>,
    round_id: String,
}

impl RoundGuard {
    pub fn round_id(&self) -> &str {
        &self.round_id
    }
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        self.context.end_round(&self.round_id);
    }
}

// ---------------------------------------------------------------------------
// Backend router
// ---------------------------------------------------------------------------

/// Routes calls to the real or mock transport by the context's mode.
pub struct Backend<R, M> {
    real: R,
    mock: M,
    context: Arc<RoundtableContext>,
    consecutive_failures: AtomicU32,
    fallback_after: u32,
}

impl<R: Transport, M: Transport> Backend<R, M> {
    pub fn new(real: R, mock: M, context: Arc<RoundtableContext>, fallback_after: u32) -> Self {
        Backend { real, mock, context, consecutive_failures: AtomicU32::new(0), fallback_after: fallback_after.max(1) }
    }

    pub fn real(&self) -> &R {
        &self.real
    }

    pub fn mock(&self) -> &M {
        &self.mock
    }

    pub fn context(&self) -> &Arc<RoundtableContext> {
        &self.context
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn observe<V>(&self, result: &Result<V>) {
        let err = match result {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                return;
            }
            Err(e) if e.triggers_fallback() => e,
            Err(_) => return,
        };

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.fallback_after || !self.context.auto_fallback() {
            return;
        }
        match self.context.set_mode(Mode::Mock) {
            Ok(Mode::Real) => {
                warn!(
                    error = %err,
                    consecutive_failures = failures,
                    endpoint = %self.real.endpoint(),
                    "real backend failing repeatedly, falling back to mock"
                );
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Ok(Mode::Mock) => {}
            // a round is streaming; retry the switch on the next failure
            Err(_) => {}
        }
    }
}

impl<R: Transport, M: Transport> Transport for Backend<R, M> {
    async fn request(&self, request: ApiRequest) -> Result<Value> {
        match self.context.mode() {
            Mode::Real => {
                let result = self.real.request(request).await;
                self.observe(&result);
                result
            }
            Mode::Mock => self.mock.request(request).await,
        }
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<EventStream> {
        match self.context.mode() {
            Mode::Real => {
                let result = self.real.open_stream(request).await;
                self.observe(&result);
                result
            }
            Mode::Mock => self.mock.open_stream(request).await,
        }
    }

    fn endpoint(&self) -> String {
        match self.context.mode() {
            Mode::Real => self.real.endpoint(),
            Mode::Mock => self.mock.endpoint(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mode selector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ModeSelection {
    pub mode: Mode,
    /// True when the mock was chosen because the real backend was unreachable.
    pub used_fallback: bool,
    pub probe: ProbeReport,
}

pub struct ModeSelector<T> {
    probe: ConnectivityProbe<T>,
    context: Arc<RoundtableContext>,
}

impl<T: Transport> ModeSelector<T> {
    pub fn new(probe: ConnectivityProbe<T>, context: Arc<RoundtableContext>) -> Self {
        ModeSelector { probe, context }
    }

    pub fn probe(&self) -> &ConnectivityProbe<T> {
        &self.probe
    }

    /// Probe the real backend and set the mode accordingly.
    ///
    /// # Errors
    /// - `ModeLocked` while a round is active.
    /// - `Application` from the probe, which never triggers fallback.
    /// - The probe's connectivity failure when auto-fallback is disabled.
    pub async fn select_mode(&self) -> Result<ModeSelection> {
        if self.context.is_round_active() {
            return Err(RoundtableError::ModeLocked);
        }

        let report = self.probe.test_connection().await;
        if report.reachable {
            self.context.set_mode(Mode::Real)?;
            info!(latency_ms = report.latency_ms, "real backend selected");
            return Ok(ModeSelection { mode: Mode::Real, used_fallback: false, probe: report });
        }

        let failure = report.failure.clone().unwrap_or_else(|| RoundtableError::Network {
            url: "probe".to_string(),
            detail: report.detail.clone(),
        });
        if failure.kind() == FailureKind::ApplicationError {
            return Err(failure);
        }
        if !self.context.auto_fallback() {
            return Err(failure);
        }

        self.context.set_mode(Mode::Mock)?;
        warn!(error = %failure, "real backend unreachable, using mock backend");
        Ok(ModeSelection { mode: Mode::Mock, used_fallback: true, probe: report })
    }

    /// Manual override.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.context.set_mode(mode).map(|_| ())
    }
}
