//! Ordered startup steps with per-step timeouts and retries.

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::error::{Result, RoundtableError};

/// Base unit of the linear retry backoff (`unit × attempt`).
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    /// A failed required step aborts the whole sequence.
    pub required: bool,
    /// Extra attempts after the first, for timeouts only.
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for StepOptions {
    fn default() -> Self {
        StepOptions { required: false, max_retries: 2, timeout: Duration::from_secs(10) }
    }
}

impl StepOptions {
    pub fn optional(max_retries: u32, timeout: Duration) -> Self {
        StepOptions { required: false, max_retries, timeout }
    }

    pub fn required(max_retries: u32, timeout: Duration) -> Self {
        StepOptions { required: true, max_retries, timeout }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub name: String,
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<RoundtableError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitReport {
    /// True when at least one step succeeded.
    pub success: bool,
    pub total: usize,
    pub successful: usize,
    pub results: Vec<StepOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub percentage: u8,
}

type StepAction<'a> = Box<dyn FnMut() -> BoxFuture<'a, Result<()>> + Send + 'a>;
type ProgressFn<'a> = Box<dyn FnMut(Progress, &str) + Send + 'a>;

struct Step<'a> {
    name: String,
    options: StepOptions,
    action: StepAction<'a>,
}

/// Runs registered steps in order.
pub struct Initializer<'a> {
    steps: Vec<Step<'a>>,
    progress: Option<ProgressFn<'a>>,
    backoff_unit: Duration,
}

impl<'a> Default for Initializer<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Initializer<'a> {
    pub fn new() -> Self {
        Initializer { steps: Vec::new(), progress: None, backoff_unit: DEFAULT_BACKOFF_UNIT }
    }

    /// Register a step. `action` is called once per attempt.
    pub fn add_step<F>(mut self, name: impl Into<String>, options: StepOptions, action: F) -> Self
    where
        F: FnMut() -> BoxFuture<'a, Result<()>> + Send + 'a,
    {
        self.steps.push(Step { name: name.into(), options, action: Box::new(action) });
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Progress, &str) + Send + 'a,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in registration order.
    ///
    /// # Errors
    /// [`RoundtableError::Startup`] when a required step fails; optional
    /// failures are only recorded in the report.
    pub async fn run(mut self) -> Result<InitReport> {
        let total = self.steps.len();
        let mut results = Vec::with_capacity(total);
        info!(steps = total, "startup sequence begins");

        for (index, mut step) in std::mem::take(&mut self.steps).into_iter().enumerate() {
            if let Some(progress) = self.progress.as_mut() {
                let current = index + 1;
                let percentage = (current * 100 / total.max(1)) as u8;
                progress(Progress { current, total, percentage }, &step.name);
            }

            let outcome = run_step(&mut step, self.backoff_unit).await;
            if !outcome.success && step.options.required {
                let detail = outcome.error.as_ref().map(ToString::to_string).unwrap_or_default();
                return Err(RoundtableError::Startup { step: step.name, detail });
            }
            results.push(outcome);
        }

        let successful = results.iter().filter(|r| r.success).count();
        info!(successful, total, "startup sequence finished");
        Ok(InitReport { success: successful > 0, total, successful, results })
    }
}

async fn run_step(step: &mut Step<'_>, backoff_unit: Duration) -> StepOutcome {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        debug!(step = %step.name, attempt = attempts, "running startup step");

        let result = match tokio::time::timeout(step.options.timeout, (step.action)()).await {
            Ok(result) => result,
            Err(_) => Err(RoundtableError::Timeout {
                context: format!("startup step '{}'", step.name),
                after_ms: step.options.timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => {
                return StepOutcome {
                    name: step.name.clone(),
                    success: true,
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                }
            }
            Err(e) if e.is_retryable() && attempts <= step.options.max_retries => {
                let delay = backoff_unit * attempts;
                warn!(step = %step.name, attempt = attempts, error = %e, delay_ms = delay.as_millis() as u64, "startup step timed out, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(step = %step.name, attempts, error = %e, "startup step failed");
                return StepOutcome {
                    name: step.name.clone(),
                    success: false,
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e),
                };
            }
        }
    }
}
