//! The status lattice shared by executions, stages, and tasks (spec §3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A status on the shared execution/stage/task status lattice.
///
/// `Redirect` is deliberately absent here: it is a transient task-only
/// signal from [`crate::model::task::TaskOutcomeStatus`] and is never
/// persisted as a `Status` (invariant 4, spec §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Running,
    Paused,
    Succeeded,
    FailedContinue,
    Skipped,
    Stopped,
    Terminal,
    Canceled,
}

impl Status {
    /// Terminal statuses per spec §3: SUCCEEDED, FAILED_CONTINUE, SKIPPED,
    /// STOPPED, TERMINAL, CANCELED.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::FailedContinue
                | Status::Skipped
                | Status::Stopped
                | Status::Terminal
                | Status::Canceled
        )
    }

    /// A "stage-complete" status for the purpose of downstream eligibility
    /// (spec §4.5 CompleteStage): SUCCEEDED, FAILED_CONTINUE, SKIPPED.
    pub fn is_stage_complete(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::FailedContinue | Status::Skipped
        )
    }

    /// Whether this status counts as a failure that should halt the
    /// enclosing execution (TERMINAL or CANCELED; FAILED_CONTINUE is
    /// explicitly non-fatal per spec §3).
    pub fn is_fatal(self) -> bool {
        matches!(self, Status::Terminal | Status::Canceled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotStarted => "NOT_STARTED",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Succeeded => "SUCCEEDED",
            Status::FailedContinue => "FAILED_CONTINUE",
            Status::Skipped => "SKIPPED",
            Status::Stopped => "STOPPED",
            Status::Terminal => "TERMINAL",
            Status::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_match_spec() {
        for s in [
            Status::Succeeded,
            Status::FailedContinue,
            Status::Skipped,
            Status::Stopped,
            Status::Terminal,
            Status::Canceled,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        for s in [Status::NotStarted, Status::Running, Status::Paused] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn stage_complete_excludes_stopped_terminal_canceled() {
        assert!(Status::Succeeded.is_stage_complete());
        assert!(Status::FailedContinue.is_stage_complete());
        assert!(Status::Skipped.is_stage_complete());
        assert!(!Status::Stopped.is_stage_complete());
        assert!(!Status::Terminal.is_stage_complete());
        assert!(!Status::Canceled.is_stage_complete());
    }

    #[test]
    fn fatal_is_only_terminal_and_canceled() {
        assert!(Status::Terminal.is_fatal());
        assert!(Status::Canceled.is_fatal());
        assert!(!Status::FailedContinue.is_fatal());
        assert!(!Status::Stopped.is_fatal());
    }
}
