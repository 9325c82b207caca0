//! Terminal session controller.
//!
//! One logical shell per authenticated user. Input sent before the server has
//! announced a session is held until `terminal_started` arrives, for at most
//! the configured start timeout. Output is appended to a single transcript in
//! arrival order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::channel::{ClientEvent, EventSink};
use crate::error::{Result, SessionError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalState {
    Absent,
    Starting,
    Active { session_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held until the terminal session is up.
    Queued,
}

/// An input that could not be delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFailure {
    pub input: String,
    pub error: SessionError,
}

#[derive(Debug)]
struct QueuedInput {
    text: String,
}

#[derive(Debug)]
pub struct TerminalController {
    state: TerminalState,
    starting_since: Option<Instant>,
    queued: VecDeque<QueuedInput>,
    transcript: String,
    /// Bumped whenever the transcript is cleared.
    transcript_generation: u64,
    start_timeout: Duration,
    strict_session: bool,
}

impl TerminalController {
    pub fn new(start_timeout: Duration, strict_session: bool) -> Self {
        Self {
            state: TerminalState::Absent,
            starting_since: None,
            queued: VecDeque::new(),
            transcript: String::new(),
            transcript_generation: 0,
            start_timeout,
            strict_session,
        }
    }

    pub fn state(&self) -> &TerminalState {
        &self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            TerminalState::Active { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn transcript_generation(&self) -> u64 {
        self.transcript_generation
    }

    pub fn queued_inputs(&self) -> usize {
        self.queued.len()
    }

    /// Requests a terminal if none exists or is being started.
    pub fn ensure_started(&mut self, sink: &mut dyn EventSink, now: Instant) -> Result<()> {
        if self.state != TerminalState::Absent {
            return Ok(());
        }
        sink.emit(ClientEvent::StartTerminal)?;
        self.state = TerminalState::Starting;
        self.starting_since = Some(now);
        tracing::info!("terminal start requested");
        Ok(())
    }

    pub fn send_input(
        &mut self,
        sink: &mut dyn EventSink,
        text: &str,
        now: Instant,
    ) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Err(SessionError::validation("Command is empty"));
        }
        if !sink.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if matches!(self.state, TerminalState::Active { .. }) {
            sink.emit(ClientEvent::TerminalInput {
                input: text.to_string(),
            })?;
            return Ok(SendOutcome::Sent);
        }
        self.ensure_started(sink, now)?;
        self.queued.push_back(QueuedInput {
            text: text.to_string(),
        });
        Ok(SendOutcome::Queued)
    }

    /// Handles `terminal_started`: the session becomes active and held input is
    /// sent in submission order.
    pub fn on_started(&mut self, sink: &mut dyn EventSink, session_id: String) -> Vec<InputFailure> {
        tracing::info!(%session_id, "terminal started");
        self.state = TerminalState::Active { session_id };
        self.starting_since = None;
        let mut failures = Vec::new();
        while let Some(input) = self.queued.pop_front() {
            if let Err(error) = sink.emit(ClientEvent::TerminalInput {
                input: input.text.clone(),
            }) {
                failures.push(InputFailure {
                    input: input.text,
                    error,
                });
            }
        }
        failures
    }

    /// Appends pushed output verbatim. Returns false if the chunk was dropped
    /// because it belongs to a different session.
    pub fn on_output(&mut self, output: &str, terminal_id: Option<&str>) -> bool {
        if self.strict_session {
            if let (Some(current), Some(incoming)) = (self.session_id(), terminal_id) {
                if current != incoming {
                    tracing::debug!(current, incoming, "dropping output for another terminal");
                    return false;
                }
            }
        }
        self.transcript.push_str(output);
        true
    }

    /// The link went down: the session id is no longer valid and held input
    /// can no longer be delivered.
    pub fn on_disconnected(&mut self) -> Vec<InputFailure> {
        self.state = TerminalState::Absent;
        self.starting_since = None;
        self.fail_queued(SessionError::NotConnected)
    }

    /// Expires a start that has not been acknowledged in time.
    pub fn tick(&mut self, now: Instant) -> Vec<InputFailure> {
        let Some(since) = self.starting_since else {
            return Vec::new();
        };
        if now.saturating_duration_since(since) < self.start_timeout {
            return Vec::new();
        }
        tracing::warn!(timeout = ?self.start_timeout, "terminal did not start in time");
        self.state = TerminalState::Absent;
        self.starting_since = None;
        self.fail_queued(SessionError::StartTimeout(self.start_timeout))
    }

    fn fail_queued(&mut self, error: SessionError) -> Vec<InputFailure> {
        self.queued
            .drain(..)
            .map(|q| InputFailure {
                input: q.text,
                error: error.clone(),
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.state = TerminalState::Absent;
        self.starting_since = None;
        self.queued.clear();
        self.transcript.clear();
        self.transcript_generation = self.transcript_generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_link::RecordingSink;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn reset_starts_a_new_transcript_generation() {
        let mut term = TerminalController::new(TIMEOUT, false);
        term.on_output("héllo", None);
        let before = term.transcript_generation();
        term.reset();
        term.on_output("a much longer line", None);
        assert_ne!(term.transcript_generation(), before);
        assert_eq!(term.transcript(), "a much longer line");
    }

    #[test]
    fn send_while_disconnected_fails_without_queueing() {
        let mut term = TerminalController::new(TIMEOUT, false);
        let mut sink = RecordingSink {
            connected: false,
            emitted: Vec::new(),
        };
        let result = term.send_input(&mut sink, "ls", Instant::now());
        assert_eq!(result, Err(SessionError::NotConnected));
        assert_eq!(term.queued_inputs(), 0);
        assert!(sink.emitted.is_empty());
        assert_eq!(term.state(), &TerminalState::Absent);
    }

    #[test]
    fn empty_input_is_rejected_locally() {
        let mut term = TerminalController::new(TIMEOUT, false);
        let mut sink = RecordingSink::connected();
        assert!(matches!(
            term.send_input(&mut sink, "   ", Instant::now()),
            Err(SessionError::Validation(_))
        ));
        assert!(sink.emitted.is_empty());
    }

    #[test]
    fn first_input_starts_terminal_and_is_flushed_in_order() {
        let mut term = TerminalController::new(TIMEOUT, false);
        let mut sink = RecordingSink::connected();
        let now = Instant::now();
        assert_eq!(term.send_input(&mut sink, "ls", now), Ok(SendOutcome::Queued));
        assert_eq!(term.send_input(&mut sink, "pwd", now), Ok(SendOutcome::Queued));
        assert_eq!(sink.emitted, vec![ClientEvent::StartTerminal]);

        assert!(term.on_started(&mut sink, "t-1".into()).is_empty());
        assert_eq!(
            sink.emitted[1..],
            [
                ClientEvent::TerminalInput { input: "ls".into() },
                ClientEvent::TerminalInput { input: "pwd".into() },
            ]
        );
        assert_eq!(term.send_input(&mut sink, "whoami", now), Ok(SendOutcome::Sent));
        assert_eq!(term.session_id(), Some("t-1"));
    }

    #[test]
    fn ensure_started_is_idempotent() {
        let mut term = TerminalController::new(TIMEOUT, false);
        let mut sink = RecordingSink::connected();
        let now = Instant::now();
        term.ensure_started(&mut sink, now).unwrap();
        term.ensure_started(&mut sink, now).unwrap();
        assert_eq!(sink.emitted, vec![ClientEvent::StartTerminal]);
    }

    #[test]
    fn unacknowledged_start_fails_queued_input() {
        let mut term = TerminalController::new(TIMEOUT, false);
        let mut sink = RecordingSink::connected();
        let start = Instant::now();
        term.send_input(&mut sink, "ls", start).unwrap();
        assert!(term.tick(start + Duration::from_secs(1)).is_empty());

        let failures = term.tick(start + TIMEOUT);
        assert_eq!(
            failures,
            vec![InputFailure {
                input: "ls".into(),
                error: SessionError::StartTimeout(TIMEOUT),
            }]
        );
        assert_eq!(term.state(), &TerminalState::Absent);
    }

    #[test]
    fn output_is_appended_in_arrival_order() {
        let mut term = TerminalController::new(TIMEOUT, false);
        for chunk in ["a", "b", "c"] {
            term.on_output(chunk, None);
        }
        assert_eq!(term.transcript(), "abc");
    }

    #[test]
    fn disconnect_drops_session_and_fails_queue() {
        let mut term = TerminalController::new(TIMEOUT, false);
        let mut sink = RecordingSink::connected();
        term.send_input(&mut sink, "ls", Instant::now()).unwrap();
        let failures = term.on_disconnected();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, SessionError::NotConnected);
        assert_eq!(term.state(), &TerminalState::Absent);
    }

    #[test]
    fn strict_mode_gates_output_on_session_id() {
        let mut sink = RecordingSink::connected();
        let mut loose = TerminalController::new(TIMEOUT, false);
        loose.on_started(&mut sink, "t-2".into());
        assert!(loose.on_output("old", Some("t-1")));

        let mut strict = TerminalController::new(TIMEOUT, true);
        strict.on_started(&mut sink, "t-2".into());
        assert!(!strict.on_output("old", Some("t-1")));
        assert!(strict.on_output("new", Some("t-2")));
        assert!(strict.on_output("untagged", None));
        assert_eq!(strict.transcript(), "newuntagged");
    }
}
