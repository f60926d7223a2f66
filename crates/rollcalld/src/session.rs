//! Session controller: one capture loop at a time, started and stopped from
//! the request boundary.

use crate::engine::{
    run_capture, CaptureOutcome, CaptureResources, CaptureSettings, FailureReason, Roster,
    StopReason, StopSignal,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a capture session is already running")]
    AlreadyRunning,
    #[error("the capture loop ended on its own; stop the session to collect its report")]
    AwaitingStop,
    #[error("the previous capture loop has not released the camera yet")]
    PreviousLoopActive,
    #[error("no capture session is running")]
    NotRunning,
    #[error("a stop is already in progress")]
    StopInProgress,
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    /// The loop exited before anyone stopped it; its report awaits `stop`.
    Ended,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The loop observed the stop signal and exited.
    Completed { stopped_by: StopReason },
    /// The grace period ran out; identities are those seen before the deadline.
    TimedOutPartial,
    /// The loop ended on its own before being stopped.
    Failed { reason: FailureReason },
}

impl SessionOutcome {
    /// `None` means the loop thread went away without sending anything.
    fn from_loop(outcome: Option<CaptureOutcome>) -> Self {
        match outcome {
            Some(CaptureOutcome::Completed(stopped_by)) => Self::Completed { stopped_by },
            Some(CaptureOutcome::Failed(reason)) => Self::Failed { reason },
            None => Self::Failed {
                reason: FailureReason::LoopPanicked("capture thread exited without an outcome".into()),
            },
        }
    }
}

/// What `stop` hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub outcome: SessionOutcome,
    pub identities: Vec<String>,
    pub frames_processed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    /// Identities seen so far in the current session.
    pub identities: Vec<String>,
    pub frames_processed: u64,
    /// Set when the current loop has already exited, before any stop.
    pub loop_outcome: Option<SessionOutcome>,
    /// A timed-out loop is still draining and holds the camera.
    pub previous_loop_active: bool,
    pub last_report: Option<SessionReport>,
}

/// Where the loop's final outcome currently is.
enum LoopExit {
    Pending(oneshot::Receiver<CaptureOutcome>),
    /// Held by an in-flight `stop`.
    Awaited,
    Ended(SessionOutcome),
}

struct ActiveSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    signal: StopSignal,
    roster: Roster,
    exit: LoopExit,
}

impl ActiveSession {
    /// Pick up the outcome if the loop has already sent it.
    fn check_exit(&mut self) -> Option<&SessionOutcome> {
        if let LoopExit::Pending(done) = &mut self.exit {
            match done.try_recv() {
                Ok(outcome) => self.exit = LoopExit::Ended(SessionOutcome::from_loop(Some(outcome))),
                Err(TryRecvError::Closed) => self.exit = LoopExit::Ended(SessionOutcome::from_loop(None)),
                Err(TryRecvError::Empty) => {}
            }
        }
        match &self.exit {
            LoopExit::Ended(outcome) => Some(outcome),
            _ => None,
        }
    }
}

struct Inner {
    state: SessionState,
    active: Option<ActiveSession>,
    /// Roster of a loop abandoned by a timed-out stop.
    draining: Option<Roster>,
    last_report: Option<SessionReport>,
}

impl Inner {
    fn refresh(&mut self) {
        if self.state != SessionState::Running {
            return;
        }
        if let Some(outcome) = self.active.as_mut().and_then(ActiveSession::check_exit) {
            tracing::warn!(outcome = ?outcome, "capture loop ended before stop");
            self.state = SessionState::Ended;
        }
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A stop waiting on the loop. Dropping it mid-wait hands the receiver back
/// so a later `stop` can still collect the outcome.
struct PendingStop<'a> {
    inner: &'a Mutex<Inner>,
    done: Option<oneshot::Receiver<CaptureOutcome>>,
}

impl PendingStop<'_> {
    /// Wait up to `grace`; `None` means the loop did not answer in time.
    async fn wait(&mut self, grace: Duration) -> Option<SessionOutcome> {
        let done = self.done.as_mut()?;
        let result = tokio::time::timeout(grace, done).await;
        self.done = None;
        result.ok().map(|sent| SessionOutcome::from_loop(sent.ok()))
    }
}

impl Drop for PendingStop<'_> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        let mut inner = lock_inner(self.inner);
        if let Some(active) = inner.active.as_mut() {
            tracing::warn!(session = %active.id, "stop abandoned while waiting; session stays active");
            active.exit = LoopExit::Pending(done);
            inner.state = SessionState::Running;
        }
    }
}

pub struct SessionManager {
    resources: Arc<dyn CaptureResources>,
    settings: CaptureSettings,
    grace_period: Duration,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(
        resources: Arc<dyn CaptureResources>,
        settings: CaptureSettings,
        grace_period: Duration,
    ) -> Self {
        Self {
            resources,
            settings,
            grace_period,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                active: None,
                draining: None,
                last_report: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        let mut inner = lock_inner(&self.inner);
        inner.refresh();
        inner
    }

    /// Spawn a capture loop and return its session id without waiting for it
    /// to initialize.
    pub fn start(&self) -> Result<Uuid, SessionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Running | SessionState::Stopping => return Err(SessionError::AlreadyRunning),
            SessionState::Ended => return Err(SessionError::AwaitingStop),
            SessionState::Idle | SessionState::Stopped => {}
        }
        if inner.draining.as_ref().is_some_and(|r| !r.is_finished()) {
            return Err(SessionError::PreviousLoopActive);
        }
        inner.draining = None;

        let id = Uuid::new_v4();
        let signal = StopSignal::default();
        let roster = Roster::default();
        let (tx, done) = oneshot::channel();

        let resources = self.resources.clone();
        let settings = self.settings.clone();
        let loop_signal = signal.clone();
        let loop_roster = roster.clone();

        std::thread::Builder::new()
            .name("rollcall-capture".into())
            .spawn(move || {
                tracing::info!(session = %id, "capture thread started");
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_capture(resources.as_ref(), &settings, &loop_signal, &loop_roster)
                }))
                .unwrap_or_else(|payload| {
                    let detail = panic_message(payload.as_ref());
                    tracing::error!(session = %id, panic = %detail, "capture loop panicked");
                    CaptureOutcome::Failed(FailureReason::LoopPanicked(detail))
                });
                // Send first so a finished roster always has its outcome waiting.
                let _ = tx.send(outcome);
                loop_roster.mark_finished();
                tracing::info!(session = %id, "capture thread exiting");
            })?;

        inner.active = Some(ActiveSession {
            id,
            started_at: Utc::now(),
            signal,
            roster,
            exit: LoopExit::Pending(done),
        });
        inner.state = SessionState::Running;
        tracing::info!(session = %id, "session started");
        Ok(id)
    }

    /// Signal the loop, wait up to the grace period, and report.
    ///
    /// Cancel-safe: if the returned future is dropped before the loop
    /// answers, the session goes back to `Running`.
    pub async fn stop(&self) -> Result<SessionReport, SessionError> {
        let (mut pending, ended) = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Stopping => return Err(SessionError::StopInProgress),
                SessionState::Running | SessionState::Ended => {}
                SessionState::Idle | SessionState::Stopped => return Err(SessionError::NotRunning),
            }
            let Some(active) = inner.active.as_mut() else {
                return Err(SessionError::NotRunning);
            };
            active.signal.raise(StopReason::Caller);
            let (done, ended) = match std::mem::replace(&mut active.exit, LoopExit::Awaited) {
                LoopExit::Pending(done) => (Some(done), None),
                LoopExit::Ended(outcome) => (None, Some(outcome)),
                LoopExit::Awaited => return Err(SessionError::StopInProgress),
            };
            inner.state = SessionState::Stopping;
            (
                PendingStop {
                    inner: &self.inner,
                    done,
                },
                ended,
            )
        };

        let waited = match ended {
            Some(outcome) => Some(outcome),
            None => pending.wait(self.grace_period).await,
        };

        let mut inner = lock_inner(&self.inner);
        let Some(active) = inner.active.take() else {
            return Err(SessionError::NotRunning);
        };
        let outcome = waited.unwrap_or_else(|| {
            tracing::warn!(
                session = %active.id,
                grace_ms = self.grace_period.as_millis() as u64,
                "capture loop did not stop in time; returning partial roster"
            );
            SessionOutcome::TimedOutPartial
        });

        let report = SessionReport {
            session_id: active.id,
            started_at: active.started_at,
            stopped_at: Utc::now(),
            outcome,
            identities: active.roster.snapshot().into_iter().collect(),
            frames_processed: active.roster.frames_processed(),
        };

        if report.outcome == SessionOutcome::TimedOutPartial {
            inner.draining = Some(active.roster);
        }
        inner.state = SessionState::Stopped;
        inner.last_report = Some(report.clone());

        tracing::info!(
            session = %report.session_id,
            outcome = ?report.outcome,
            identities = report.identities.len(),
            frames = report.frames_processed,
            "session stopped"
        );
        Ok(report)
    }

    /// Ask the running loop to wind down without a caller stop. The roster is
    /// still collected by the next `stop`.
    pub fn quit_locally(&self) -> bool {
        let inner = self.lock();
        match &inner.active {
            Some(active) => active.signal.raise(StopReason::LocalQuit),
            None => false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn last_report(&self) -> Option<SessionReport> {
        self.lock().last_report.clone()
    }

    pub fn status(&self) -> StatusReport {
        let mut inner = self.lock();
        let state = inner.state;
        let (session_id, identities, frames_processed, loop_outcome) = match inner.active.as_mut() {
            Some(active) => (
                Some(active.id),
                active.roster.snapshot().into_iter().collect(),
                active.roster.frames_processed(),
                active.check_exit().cloned(),
            ),
            None => (None, Vec::new(), 0, None),
        };
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            state,
            session_id,
            identities,
            frames_processed,
            loop_outcome,
            previous_loop_active: inner.draining.as_ref().is_some_and(|r| !r.is_finished()),
            last_report: inner.last_report.clone(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into())
}
