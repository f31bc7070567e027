//! Discussion rounds: the streaming state machine.
//!
//! ## Lifecycle
//! `idle → pending → streaming → {complete | cancelled | failed}`
//!
//! A round is `pending` from session assignment until its stream opens. While
//! `streaming`, each inbound message becomes a [`Turn`]. The round completes
//! at the first of:
//! - every roster expert having spoken at least once; the stream is closed at
//!   once, buffered events are drained, and the round completes after a short
//!   grace delay ([`CompletionPath::AllExpertsReplied`]);
//! - the backend's explicit `end` event ([`CompletionPath::BackendEnded`]).
//!
//! All transitions go through one mutex per round and apply only from an
//! active state, so whichever terminal transition takes the lock first wins
//! and the others are no-ops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{Expert, Roster};
use crate::error::{Result, RoundtableError};
use crate::mode::{RoundGuard, RoundtableContext};
use crate::session::{parse_event, stream_request, Session, SessionManager, Turn};
use crate::transport::{StreamCloser, StreamEvent, Transport};

/// Delay between closing the stream and declaring an all-replied round complete.
pub const DEFAULT_COMPLETION_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    #[default]
    Idle,
    Pending,
    Streaming,
    Complete,
    Cancelled,
    Failed,
}

impl RoundStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RoundStatus::Pending | RoundStatus::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Complete | RoundStatus::Cancelled | RoundStatus::Failed)
    }
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoundStatus::Idle => "idle",
            RoundStatus::Pending => "pending",
            RoundStatus::Streaming => "streaming",
            RoundStatus::Complete => "complete",
            RoundStatus::Cancelled => "cancelled",
            RoundStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionPath {
    AllExpertsReplied,
    BackendEnded,
}

/// One topic prompt and the replies it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscussionRound {
    pub id: String,
    pub topic: String,
    pub roster: Roster,
    pub session: Session,
    pub turns: Vec<Turn>,
    pub status: RoundStatus,
    pub completed_via: Option<CompletionPath>,
    pub failure: Option<RoundtableError>,
}

impl DiscussionRound {
    /// Names of the experts who spoke at least once.
    pub fn speakers(&self) -> HashSet<&str> {
        self.turns.iter().map(|t| t.expert_name.as_str()).collect()
    }
}

/// Notifications published by a running round, in order.
///
/// Exactly one terminal variant (`Completed`, `Cancelled` or `Failed`) is
/// published, after which the channel closes.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    Opened,
    Turn(Turn),
    Completed(CompletionPath),
    Cancelled,
    Failed(RoundtableError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscussionRequest {
    pub topic: String,
    pub experts: Vec<Expert>,
    pub model: String,
    /// Continue this session instead of creating a new one.
    pub session_id: Option<String>,
}

impl DiscussionRequest {
    pub fn new(topic: impl Into<String>, experts: Vec<Expert>, model: impl Into<String>) -> Self {
        DiscussionRequest { topic: topic.into(), experts, model: model.into(), session_id: None }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Round cell
// ---------------------------------------------------------------------------

enum Terminal {
    Completed(CompletionPath),
    Cancelled,
    Failed(RoundtableError),
}

struct CellState {
    round: DiscussionRound,
    seen: HashSet<String>,
    guard: Option<RoundGuard>,
    closer: Option<StreamCloser>,
    events: Option<mpsc::UnboundedSender<RoundEvent>>,
}

impl CellState {
    fn publish(&self, event: RoundEvent) {
        if let Some(tx) = &self.events {
            // receiver gone just means nobody is listening
            let _ = tx.send(event);
        }
    }
}

/// Shared state of one round; every transition happens under its mutex.
struct RoundCell {
    state: Mutex<CellState>,
    status: watch::Sender<RoundStatus>,
}

impl RoundCell {
    fn new(round: DiscussionRound, guard: RoundGuard, events: mpsc::UnboundedSender<RoundEvent>) -> Self {
        let (status, _) = watch::channel(round.status);
        RoundCell {
            state: Mutex::new(CellState {
                round,
                seen: HashSet::new(),
                guard: Some(guard),
                closer: None,
                events: Some(events),
            }),
            status,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> RoundStatus {
        self.lock().round.status
    }

    fn snapshot(&self) -> DiscussionRound {
        self.lock().round.clone()
    }

    /// `pending → streaming`. Returns false (and closes the stream) if the
    /// round already left `pending`.
    fn mark_streaming(&self, closer: StreamCloser) -> bool {
        let mut state = self.lock();
        if state.round.status != RoundStatus::Pending {
            closer.close();
            return false;
        }
        state.round.status = RoundStatus::Streaming;
        state.closer = Some(closer);
        state.publish(RoundEvent::Opened);
        self.status.send_replace(RoundStatus::Streaming);
        debug!(round_id = %state.round.id, chat_id = %state.round.session.id, "round streaming");
        true
    }

    /// Append a turn while streaming. Returns the number of distinct
    /// speakers so far, or `None` when the round no longer accepts turns.
    fn append(&self, turn: Turn) -> Option<usize> {
        let mut state = self.lock();
        if state.round.status != RoundStatus::Streaming {
            return None;
        }
        debug!(round_id = %state.round.id, expert = %turn.expert_name, "turn received");
        state.seen.insert(turn.expert_name.clone());
        state.round.turns.push(turn.clone());
        state.publish(RoundEvent::Turn(turn));
        Some(state.seen.len())
    }

    fn finish(&self, terminal: Terminal) -> bool {
        let mut state = self.lock();
        Self::finish_locked(&mut state, &self.status, terminal)
    }

    fn finish_locked(state: &mut CellState, status: &watch::Sender<RoundStatus>, terminal: Terminal) -> bool {
        if !state.round.status.is_active() {
            return false;
        }
        if let Some(closer) = state.closer.take() {
            closer.close();
        }

        let (next, event) = match terminal {
            Terminal::Completed(path) => {
                state.round.completed_via = Some(path);
                info!(
                    round_id = %state.round.id,
                    via = ?path,
                    turns = state.round.turns.len(),
                    "round complete"
                );
                (RoundStatus::Complete, RoundEvent::Completed(path))
            }
            Terminal::Cancelled => {
                info!(round_id = %state.round.id, turns = state.round.turns.len(), "round cancelled");
                (RoundStatus::Cancelled, RoundEvent::Cancelled)
            }
            Terminal::Failed(err) => {
                warn!(round_id = %state.round.id, error = %err, "round failed");
                state.round.failure = Some(err.clone());
                (RoundStatus::Failed, RoundEvent::Failed(err))
            }
        };

        state.round.status = next;
        state.publish(event);
        // closes the event channel and releases the round marker
        state.events = None;
        state.guard = None;
        status.send_replace(next);
        true
    }

    fn cancel(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.round.status.is_active() {
            return Err(RoundtableError::InvalidState(format!(
                "cannot cancel a {} round",
                state.round.status
            )));
        }
        Self::finish_locked(&mut state, &self.status, Terminal::Cancelled);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Caller's view of a running round.
pub struct RoundHandle {
    id: String,
    session: Session,
    cell: Arc<RoundCell>,
    events: mpsc::UnboundedReceiver<RoundEvent>,
    status_rx: watch::Receiver<RoundStatus>,
    driver: JoinHandle<()>,
}

impl RoundHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Available as soon as the round starts, before any reply arrives.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn status(&self) -> RoundStatus {
        self.cell.status()
    }

    pub fn snapshot(&self) -> DiscussionRound {
        self.cell.snapshot()
    }

    /// Next notification; `None` once the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<RoundEvent> {
        self.events.recv().await
    }

    /// Stop the round. Valid only while `pending` or `streaming`.
    ///
    /// No turn is appended once this returns.
    pub fn cancel(&self) -> Result<()> {
        self.cell.cancel()
    }

    pub fn canceller(&self) -> RoundCanceller {
        RoundCanceller { round_id: self.id.clone(), cell: Arc::clone(&self.cell) }
    }

    /// Wait for a terminal state and return the final round.
    pub async fn wait(mut self) -> DiscussionRound {
        let _ = self.status_rx.wait_for(|s| s.is_terminal()).await;
        // the driver exits right after any terminal transition
        let _ = (&mut self.driver).await;
        self.cell.snapshot()
    }
}

impl std::fmt::Debug for RoundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundHandle")
            .field("id", &self.id)
            .field("session", &self.session.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Cancels a round from another task.
#[derive(Clone)]
pub struct RoundCanceller {
    round_id: String,
    cell: Arc<RoundCell>,
}

impl RoundCanceller {
    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    pub fn status(&self) -> RoundStatus {
        self.cell.status()
    }

    pub fn cancel(&self) -> Result<()> {
        self.cell.cancel()
    }
}

impl std::fmt::Debug for RoundCanceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundCanceller").field("round_id", &self.round_id).finish()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DiscussionEngine<T> {
    context: Arc<RoundtableContext>,
    transport: Arc<T>,
    sessions: SessionManager<T>,
    grace: Duration,
}

impl<T: Transport> DiscussionEngine<T> {
    pub fn new(context: Arc<RoundtableContext>, transport: Arc<T>) -> Self {
        DiscussionEngine {
            sessions: SessionManager::new(Arc::clone(&transport)),
            context,
            transport,
            grace: DEFAULT_COMPLETION_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn context(&self) -> &Arc<RoundtableContext> {
        &self.context
    }

    /// Start a round: validate, claim the round marker, assign a session, and
    /// hand streaming off to a driver task.
    ///
    /// # Errors
    /// - `InvalidInput` for a blank topic or a roster outside 3–5 distinct
    ///   experts; nothing is sent to the backend.
    /// - `ConcurrentRound` while another round is pending or streaming.
    /// - Any session-creation failure.
    pub async fn start(&self, request: DiscussionRequest) -> Result<RoundHandle> {
        let topic = request.topic.trim().to_string();
        if topic.is_empty() {
            return Err(RoundtableError::InvalidInput("topic must not be empty".into()));
        }
        let roster = Roster::new(request.experts)?;

        let round_id = uuid::Uuid::new_v4().to_string();
        let guard = self.context.begin_round(&round_id)?;
        // dropping `guard` on error releases the marker
        let session = self.sessions.ensure_session(request.session_id.as_deref(), &roster, &request.model).await?;

        info!(
            round_id = %round_id,
            chat_id = %session.id,
            reused = session.reused,
            experts = roster.len(),
            "round started"
        );

        let round = DiscussionRound {
            id: round_id.clone(),
            topic: topic.clone(),
            roster: roster.clone(),
            session: session.clone(),
            turns: Vec::new(),
            status: RoundStatus::Pending,
            completed_via: None,
            failure: None,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cell = Arc::new(RoundCell::new(round, guard, events_tx));
        let status_rx = cell.status.subscribe();

        let driver = tokio::spawn(drive(
            Arc::clone(&cell),
            Arc::clone(&self.transport),
            session.clone(),
            roster,
            topic,
            self.grace,
        ));

        Ok(RoundHandle { id: round_id, session, cell, events: events_rx, status_rx, driver })
    }
}

async fn until_terminal(rx: &mut watch::Receiver<RoundStatus>) {
    let _ = rx.wait_for(|s| s.is_terminal()).await;
}

async fn drive<T: Transport>(
    cell: Arc<RoundCell>,
    transport: Arc<T>,
    session: Session,
    roster: Roster,
    topic: String,
    grace: Duration,
) {
    let mut status_rx = cell.status.subscribe();

    let opened = tokio::select! {
        biased;
        _ = until_terminal(&mut status_rx) => return,
        opened = transport.open_stream(stream_request(&session, &topic)) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            cell.finish(Terminal::Failed(e));
            return;
        }
    };
    if !cell.mark_streaming(stream.closer()) {
        return;
    }

    loop {
        let item = tokio::select! {
            biased;
            _ = until_terminal(&mut status_rx) => return,
            item = stream.next() => item,
        };

        let data = match item {
            Some(Ok(StreamEvent::Message(data))) => data,
            Some(Ok(StreamEvent::End)) => {
                cell.finish(Terminal::Completed(CompletionPath::BackendEnded));
                return;
            }
            Some(Err(e)) => {
                cell.finish(Terminal::Failed(e));
                return;
            }
            None => {
                cell.finish(Terminal::Failed(RoundtableError::Stream(
                    "stream closed before the end event".into(),
                )));
                return;
            }
        };

        let turn = match parse_event(&data, &roster) {
            Ok(Some(turn)) => turn,
            Ok(None) => continue,
            Err(e) => {
                cell.finish(Terminal::Failed(e));
                return;
            }
        };

        match cell.append(turn) {
            None => return,
            Some(speakers) if speakers >= roster.len() => break,
            Some(_) => {}
        }
    }

    // Everyone has spoken: stop the stream, keep what was already buffered.
    stream.close();
    for item in stream.drain_buffered() {
        match item {
            Ok(StreamEvent::Message(data)) => {
                if let Ok(Some(turn)) = parse_event(&data, &roster) {
                    cell.append(turn);
                }
            }
            // end or errors after a deliberate close do not change the outcome
            Ok(StreamEvent::End) | Err(_) => {}
        }
    }

    tokio::select! {
        biased;
        _ = until_terminal(&mut status_rx) => return,
        _ = tokio::time::sleep(grace) => {}
    }
    cell.finish(Terminal::Completed(CompletionPath::AllExpertsReplied));
}
