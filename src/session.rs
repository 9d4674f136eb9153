use crate::checkpoint::Checkpoint;
use crate::quiz::Question;
use crate::scoring::{self, ScoreSummary};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizMode {
    Asynchronous,
    Synchronous,
}

impl QuizMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asynchronous" => Some(QuizMode::Asynchronous),
            "synchronous" => Some(QuizMode::Synchronous),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuizMode::Asynchronous => "asynchronous",
            QuizMode::Synchronous => "synchronous",
        }
    }
}

/// One state cell with guarded transitions. `Expired` is reachable from
/// `Answering` (and `Ready`, for an attempt that timed out before the first
/// answer); everything funnels through `Submitting` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Answering,
    Expired,
    Submitting,
    Completed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Ready => "ready",
            Phase::Answering => "answering",
            Phase::Expired => "expired",
            Phase::Submitting => "submitting",
            Phase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    QuestionOutOfRange { index: usize, count: usize },
    NotAnswering { phase: Phase },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::QuestionOutOfRange { index, count } => {
                write!(f, "question index {} out of range (0..{})", index, count)
            }
            SessionError::NotAnswering { phase } => {
                write!(f, "attempt is not accepting answers (state: {})", phase.as_str())
            }
        }
    }
}

/// Outcome of the submit guard. Only the first trigger proceeds; later
/// triggers get the already-computed result back as a no-op.
#[derive(Debug, Clone)]
pub enum SubmitGate {
    Proceed,
    AlreadyDone(ScoreSummary),
    InFlight,
}

/// One learner's in-memory attempt. Owns the delivered question list, the
/// answer map and the state cell; persistence stays with the caller.
pub struct QuizSession {
    pub assignment_id: String,
    pub student_id: String,
    pub mode: QuizMode,
    pub questions: Vec<Question>,
    pub identification_options: HashMap<usize, Vec<String>>,
    pub answers: HashMap<usize, String>,
    pub current_question_index: usize,
    pub time_limit_secs: Option<i64>,
    pub started_at: DateTime<Utc>,
    phase: Phase,
    result: Option<ScoreSummary>,
}

impl QuizSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assignment_id: String,
        student_id: String,
        mode: QuizMode,
        questions: Vec<Question>,
        identification_options: HashMap<usize, Vec<String>>,
        time_limit_secs: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            assignment_id,
            student_id,
            mode,
            questions,
            identification_options,
            answers: HashMap::new(),
            current_question_index: 0,
            time_limit_secs,
            started_at,
            phase: Phase::Ready,
            result: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn result(&self) -> Option<&ScoreSummary> {
        self.result.as_ref()
    }

    /// Apply saved progress before the first question is presented. The
    /// cursor is clamped so a stale checkpoint cannot point past the end.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        if self.phase != Phase::Ready {
            return;
        }
        self.answers = checkpoint
            .answers
            .into_iter()
            .filter(|(i, _)| *i < self.questions.len())
            .collect();
        self.current_question_index = checkpoint
            .current_question_index
            .min(self.questions.len().saturating_sub(1));
    }

    pub fn record_answer(&mut self, index: usize, answer: String) -> Result<(), SessionError> {
        match self.phase {
            Phase::Ready => self.phase = Phase::Answering,
            Phase::Answering => {}
            phase => return Err(SessionError::NotAnswering { phase }),
        }
        if index >= self.questions.len() {
            return Err(SessionError::QuestionOutOfRange {
                index,
                count: self.questions.len(),
            });
        }
        self.answers.insert(index, answer);
        Ok(())
    }

    /// Any target in range is accepted; the answer-before-next rule is a UI
    /// gate, not a controller invariant.
    pub fn navigate(&mut self, index: usize) -> Result<(), SessionError> {
        match self.phase {
            Phase::Ready => self.phase = Phase::Answering,
            Phase::Answering => {}
            phase => return Err(SessionError::NotAnswering { phase }),
        }
        if index >= self.questions.len() {
            return Err(SessionError::QuestionOutOfRange {
                index,
                count: self.questions.len(),
            });
        }
        self.current_question_index = index;
        Ok(())
    }

    pub fn checkpoint(&self, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint {
            answers: self.answers.clone(),
            current_question_index: self.current_question_index,
            timestamp: now.timestamp_millis(),
        }
    }

    /// Whole seconds left on the countdown, computed from the persisted
    /// start epoch. Reloading never restarts the clock.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        let limit = self.time_limit_secs?;
        let elapsed = now.signed_duration_since(self.started_at).num_seconds();
        Some((limit - elapsed).max(0))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.remaining_seconds(now), Some(0))
    }

    pub fn unanswered_count(&self) -> usize {
        (0..self.questions.len())
            .filter(|i| self.answers.get(i).map(|a| a.is_empty()).unwrap_or(true))
            .count()
    }

    /// Countdown expiry path: leave `Answering` before anything is persisted
    /// so a racing manual submit sees a non-answering state.
    pub fn mark_expired(&mut self) {
        if matches!(self.phase, Phase::Ready | Phase::Answering) {
            self.phase = Phase::Expired;
        }
    }

    pub fn begin_submit(&mut self) -> SubmitGate {
        match self.phase {
            Phase::Ready | Phase::Answering | Phase::Expired => {
                self.phase = Phase::Submitting;
                SubmitGate::Proceed
            }
            Phase::Submitting => SubmitGate::InFlight,
            Phase::Completed => match &self.result {
                Some(summary) => SubmitGate::AlreadyDone(*summary),
                None => SubmitGate::InFlight,
            },
        }
    }

    pub fn score(&self) -> ScoreSummary {
        scoring::score(&self.questions, &self.answers)
    }

    pub fn complete(&mut self, summary: ScoreSummary) {
        self.phase = Phase::Completed;
        self.result = Some(summary);
    }

    /// Persistence failed mid-submit: reopen the attempt so a retry can run
    /// with the checkpoint still in place.
    pub fn fail_submit(&mut self) {
        if self.phase == Phase::Submitting {
            self.phase = Phase::Answering;
        }
    }
}
