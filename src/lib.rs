//! Expert-panel discussion orchestration.
//!
//! Pick 3–5 expert personas, pose a topic, and consume the discussion as it
//! streams in from the backend over server-sent events. When the backend is
//! unreachable the same flow runs against an in-process mock.
//!
//! The usual entry point is [`Roundtable`]; the lower layers
//! ([`DiscussionEngine`], [`ModeSelector`], [`Transport`]) are public for
//! callers that want to assemble their own stack.

pub mod catalog;
pub mod config;
pub mod discussion;
pub mod error;
pub mod insight;
pub mod mock;
pub mod mode;
pub mod probe;
pub mod roundtable;
pub mod session;
pub mod sse;
pub mod startup;
pub mod transport;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

pub use catalog::{builtin_catalog, Expert, Roster, RosterSelection, SelectionStatus};
pub use config::{LlmConfig, MockConfig, RoundtableConfig};
pub use discussion::{
    CompletionPath, DiscussionEngine, DiscussionRequest, DiscussionRound, RoundCanceller, RoundEvent, RoundHandle,
    RoundStatus,
};
pub use error::{FailureKind, Result, RoundtableError};
pub use insight::{ChatCompletionClient, CompletionClient, Insight, InsightStore, InsightSynthesizer};
pub use mock::MockTransport;
pub use mode::{Backend, Mode, ModeSelection, ModeSelector, RoundGuard, RoundtableContext};
pub use probe::{ConnectivityProbe, DiagnosticReport, EndpointCheck, HealthStatus, ProbeReport};
pub use roundtable::{ConnectionReport, Diagnosis, FinishedRound, Recommendation, Roundtable, Severity};
pub use session::{Session, SessionManager, Turn};
pub use startup::{InitReport, Initializer, Progress, StepOptions, StepOutcome};
pub use transport::{ApiRequest, EventStream, HttpTransport, Method, StreamCloser, StreamEvent, Transport};

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }
}
