//! Tracks the one-time bootstrap of the user's remote environment.

use std::time::{Duration, Instant};

use crate::channel::{ClientEvent, EventSink};
use crate::error::{Result, SessionError};
use crate::model::{InitProgress, InitStatusSnapshot};

#[derive(Clone, Debug, PartialEq)]
pub enum InitState {
    NotStarted,
    AwaitingDecision,
    Running {
        stage: String,
        percent: f64,
        message: String,
    },
    Failed {
        message: String,
    },
    Complete,
    /// Skipped or dismissed after completion; nothing more is shown this session.
    Dismissed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEffect {
    Updated,
    Failed(String),
    Completed,
    Ignored,
}

#[derive(Debug)]
pub struct InitTracker {
    state: InitState,
    completed_at: Option<Instant>,
    dismiss_after: Duration,
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

impl InitTracker {
    pub fn new(dismiss_after: Duration) -> Self {
        Self {
            state: InitState::NotStarted,
            completed_at: None,
            dismiss_after,
        }
    }

    pub fn state(&self) -> &InitState {
        &self.state
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self.state,
            InitState::NotStarted
                | InitState::AwaitingDecision
                | InitState::Failed { .. }
                | InitState::Dismissed
        )
    }

    pub fn request_status(&self, sink: &mut dyn EventSink) -> Result<()> {
        sink.emit(ClientEvent::CheckInitialization)
    }

    /// Applies the answer to a status query.
    pub fn on_status(&mut self, status: &InitStatusSnapshot) {
        if self.state == InitState::Dismissed {
            return;
        }
        self.state = if status.initialized {
            InitState::Complete
        } else if status.in_progress {
            let last = self.current_percent().unwrap_or(0.0);
            InitState::Running {
                stage: status.stage.clone().unwrap_or_default(),
                percent: clamp_percent(status.percent.unwrap_or(0.0)).max(last),
                message: status.message.clone().unwrap_or_default(),
            }
        } else {
            InitState::AwaitingDecision
        };
        tracing::debug!(state = ?self.state, "initialization status");
    }

    /// Environment reported ready by the login response; no status query needed.
    pub fn mark_initialized(&mut self) {
        self.state = InitState::Complete;
        self.completed_at = None;
    }

    pub fn mark_needs_decision(&mut self) {
        if self.state == InitState::NotStarted {
            self.state = InitState::AwaitingDecision;
        }
    }

    /// Emits a single start request.
    pub fn start(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        match self.state {
            InitState::Running { .. } => return Ok(()),
            InitState::Complete => {
                return Err(SessionError::validation("Environment is already initialized"))
            }
            _ => {}
        }
        sink.emit(ClientEvent::StartInitialization)?;
        tracing::info!("environment initialization started");
        self.state = InitState::Running {
            stage: "starting".to_string(),
            percent: 0.0,
            message: String::new(),
        };
        Ok(())
    }

    /// Declines the start prompt for the rest of the session.
    pub fn skip(&mut self) -> Result<()> {
        match self.state {
            InitState::AwaitingDecision => {
                self.state = InitState::Dismissed;
                Ok(())
            }
            InitState::Running { .. } => {
                Err(SessionError::validation("Initialization is already running"))
            }
            _ => Err(SessionError::validation("There is no initialization prompt to skip")),
        }
    }

    fn current_percent(&self) -> Option<f64> {
        match self.state {
            InitState::Running { percent, .. } => Some(percent),
            _ => None,
        }
    }

    /// Applies a progress report. Only a running bootstrap accepts one; a run
    /// the server already had going is picked up through [`Self::on_status`].
    pub fn on_progress(&mut self, progress: &InitProgress, now: Instant) -> ProgressEffect {
        if !matches!(self.state, InitState::Running { .. }) {
            tracing::debug!(stage = %progress.stage, state = ?self.state, "progress ignored");
            return ProgressEffect::Ignored;
        }
        match progress.stage.as_str() {
            "error" => {
                tracing::warn!(message = %progress.message, "environment initialization failed");
                self.state = InitState::Failed {
                    message: progress.message.clone(),
                };
                ProgressEffect::Failed(progress.message.clone())
            }
            "complete" => {
                tracing::info!("environment initialization complete");
                self.state = InitState::Complete;
                self.completed_at = Some(now);
                ProgressEffect::Completed
            }
            stage => {
                let incoming = clamp_percent(progress.percent);
                let percent = self.current_percent().unwrap_or(0.0).max(incoming);
                self.state = InitState::Running {
                    stage: stage.to_string(),
                    percent,
                    message: progress.message.clone(),
                };
                ProgressEffect::Updated
            }
        }
    }

    /// Dismisses a completed bootstrap after the grace period. Returns true
    /// when that happened on this call.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(done) = self.completed_at else {
            return false;
        };
        if self.state != InitState::Complete {
            self.completed_at = None;
            return false;
        }
        if now.saturating_duration_since(done) < self.dismiss_after {
            return false;
        }
        self.completed_at = None;
        self.state = InitState::Dismissed;
        true
    }

    /// After a reconnect, a bootstrap that was running must be re-queried.
    pub fn on_reconnected(&mut self, sink: &mut dyn EventSink) -> Result<()> {
        if matches!(self.state, InitState::Running { .. }) {
            self.request_status(sink)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.state = InitState::NotStarted;
        self.completed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_link::RecordingSink;

    fn progress(stage: &str, percent: f64) -> InitProgress {
        InitProgress {
            stage: stage.to_string(),
            percent,
            message: format!("{stage} {percent}"),
        }
    }

    fn running(tracker: &mut InitTracker) -> RecordingSink {
        let mut sink = RecordingSink::connected();
        tracker.on_status(&InitStatusSnapshot::default());
        assert_eq!(tracker.state(), &InitState::AwaitingDecision);
        tracker.start(&mut sink).unwrap();
        sink
    }

    #[test]
    fn start_emits_exactly_once() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        let mut sink = running(&mut tracker);
        tracker.start(&mut sink).unwrap();
        assert_eq!(sink.emitted, vec![ClientEvent::StartInitialization]);
    }

    #[test]
    fn start_while_disconnected_keeps_state() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        tracker.mark_needs_decision();
        let mut sink = RecordingSink {
            connected: false,
            emitted: Vec::new(),
        };
        assert_eq!(tracker.start(&mut sink), Err(SessionError::NotConnected));
        assert_eq!(tracker.state(), &InitState::AwaitingDecision);
    }

    #[test]
    fn percent_never_decreases_within_a_run() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        running(&mut tracker);
        let now = Instant::now();
        let mut shown = Vec::new();
        for p in [10.0, 40.0, 25.0, 140.0] {
            tracker.on_progress(&progress("download", p), now);
            if let InitState::Running { percent, .. } = tracker.state() {
                shown.push(*percent);
            }
        }
        assert_eq!(shown, vec![10.0, 40.0, 40.0, 100.0]);
    }

    #[test]
    fn error_stage_fails_and_allows_retry() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        let mut sink = running(&mut tracker);
        let now = Instant::now();
        tracker.on_progress(&progress("extract", 60.0), now);
        let effect = tracker.on_progress(&progress("error", 0.0), now);
        assert_eq!(effect, ProgressEffect::Failed("error 0".into()));
        assert!(tracker.can_start());

        tracker.start(&mut sink).unwrap();
        tracker.on_progress(&progress("download", 5.0), now);
        assert!(matches!(tracker.state(), InitState::Running { percent, .. } if *percent == 5.0));
    }

    #[test]
    fn complete_self_dismisses_after_grace_period() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        running(&mut tracker);
        let done = Instant::now();
        assert_eq!(
            tracker.on_progress(&progress("complete", 100.0), done),
            ProgressEffect::Completed
        );
        assert!(!tracker.tick(done + Duration::from_secs(1)));
        assert!(tracker.tick(done + Duration::from_secs(3)));
        assert_eq!(tracker.state(), &InitState::Dismissed);
    }

    #[test]
    fn skip_is_final_for_the_session() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        tracker.mark_needs_decision();
        tracker.skip().unwrap();
        tracker.on_status(&InitStatusSnapshot::default());
        assert_eq!(tracker.state(), &InitState::Dismissed);
        assert_eq!(
            tracker.on_progress(&progress("download", 1.0), Instant::now()),
            ProgressEffect::Ignored
        );
    }

    #[test]
    fn stray_progress_after_failure_is_ignored() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        running(&mut tracker);
        let now = Instant::now();
        tracker.on_progress(&progress("error", 0.0), now);
        assert_eq!(
            tracker.on_progress(&progress("extract", 30.0), now),
            ProgressEffect::Ignored
        );
        assert_eq!(
            tracker.state(),
            &InitState::Failed {
                message: "error 0".into()
            }
        );
        assert!(tracker.can_start());
    }

    #[test]
    fn progress_needs_user_confirmation_first() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        let now = Instant::now();
        assert_eq!(
            tracker.on_progress(&progress("download", 10.0), now),
            ProgressEffect::Ignored
        );
        assert_eq!(tracker.state(), &InitState::NotStarted);

        tracker.mark_needs_decision();
        assert_eq!(
            tracker.on_progress(&progress("download", 10.0), now),
            ProgressEffect::Ignored
        );
        assert_eq!(
            tracker.on_progress(&progress("complete", 100.0), now),
            ProgressEffect::Ignored
        );
        assert_eq!(tracker.state(), &InitState::AwaitingDecision);
    }

    #[test]
    fn skip_only_answers_the_prompt() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        assert!(matches!(tracker.skip(), Err(SessionError::Validation(_))));
        assert_eq!(tracker.state(), &InitState::NotStarted);

        tracker.mark_initialized();
        assert!(matches!(tracker.skip(), Err(SessionError::Validation(_))));
        assert_eq!(tracker.state(), &InitState::Complete);

        let mut tracker = InitTracker::new(Duration::from_secs(3));
        running(&mut tracker);
        tracker.on_progress(&progress("error", 0.0), Instant::now());
        assert!(tracker.skip().is_err());
        assert!(matches!(tracker.state(), InitState::Failed { .. }));
    }

    #[test]
    fn reconnect_requeries_running_bootstrap() {
        let mut tracker = InitTracker::new(Duration::from_secs(3));
        let mut sink = running(&mut tracker);
        tracker.on_reconnected(&mut sink).unwrap();
        assert_eq!(sink.emitted.last(), Some(&ClientEvent::CheckInitialization));
    }
}
