//! Session identity and the loop's state machine status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    FinalAnswer,
    Error,
    StepExhausted,
    LoopDetected,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    /// Terminal states whose answer was synthesized rather than planned.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            SessionStatus::Error | SessionStatus::StepExhausted | SessionStatus::LoopDetected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::FinalAnswer => "FINAL_ANSWER",
            SessionStatus::Error => "ERROR",
            SessionStatus::StepExhausted => "STEP_EXHAUSTED",
            SessionStatus::LoopDetected => "LOOP_DETECTED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step counter and status for one run of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Completed steps, starting at 0.
    pub step: usize,

    /// Fixed at start; never zero.
    pub max_steps: usize,

    pub status: SessionStatus,

    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, max_steps: usize) -> Self {
        Self {
            id,
            step: 0,
            max_steps: max_steps.max(1),
            status: SessionStatus::Running,
            started_at: Utc::now(),
        }
    }

    /// Running and still within budget.
    pub fn can_continue(&self) -> bool {
        self.status == SessionStatus::Running && self.step < self.max_steps
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
    }

    /// Steps left after the current one.
    pub fn remaining(&self) -> usize {
        self.max_steps.saturating_sub(self.step + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_is_raised_to_one() {
        let session = Session::new(SessionId::from("s"), 0);
        assert_eq!(session.max_steps, 1);
        assert!(session.can_continue());
    }

    #[test]
    fn budget_runs_out() {
        let mut session = Session::new(SessionId::new(), 2);
        assert_eq!(session.remaining(), 1);
        session.advance();
        assert_eq!(session.remaining(), 0);
        assert!(session.can_continue());
        session.advance();
        assert!(!session.can_continue());
    }

    #[test]
    fn status_flags() {
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::FinalAnswer.is_terminal());
        assert!(!SessionStatus::FinalAnswer.is_degraded());
        assert!(SessionStatus::LoopDetected.is_degraded());
        assert_eq!(
            serde_json::to_string(&SessionStatus::StepExhausted).unwrap(),
            "\"STEP_EXHAUSTED\""
        );
    }
}
