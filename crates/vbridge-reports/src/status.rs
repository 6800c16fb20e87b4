use serde::{Deserialize, Serialize};
use std::fmt;
use vbridge_core::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    NotSolved,
    Pending,
    Processing,
    Solved,
    Failed,
    Corrupted,
    Cancelling,
    Cancelled,
    Terminated,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::NotSolved
    }
}

impl JobStatus {
    pub fn code(self) -> u8 {
        match self {
            JobStatus::NotSolved => 0,
            JobStatus::Pending => 1,
            JobStatus::Processing => 2,
            JobStatus::Solved => 3,
            JobStatus::Failed => 4,
            JobStatus::Corrupted => 5,
            JobStatus::Cancelling => 6,
            JobStatus::Cancelled => 7,
            JobStatus::Terminated => 8,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Solved
                | JobStatus::Failed
                | JobStatus::Corrupted
                | JobStatus::Cancelled
                | JobStatus::Terminated
        )
    }

    pub fn can_start_decision(self) -> bool {
        self == JobStatus::NotSolved || self.is_terminal()
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (from, Pending) => from.can_start_decision(),
            (Pending | NotSolved, Processing) => true,
            (Processing, Solved | Failed | Corrupted | Cancelling) => true,
            (Cancelling, Cancelled) => true,
            (from, Terminated) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(self, to: JobStatus) -> Result<JobStatus, BridgeError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(BridgeError::State(format!(
                "job can not move from {} to {}",
                self, to
            )))
        }
    }

    /// Gate run before any event touches the tree. Only the decision-start
    /// event is accepted before processing begins.
    pub fn check_event(self, decision_start: bool) -> Result<(), BridgeError> {
        match self {
            JobStatus::Cancelling | JobStatus::Cancelled | JobStatus::Terminated => Err(
                BridgeError::State(format!("job is {}, reports are not accepted", self)),
            ),
            JobStatus::Pending | JobStatus::NotSolved if decision_start => Ok(()),
            JobStatus::Processing if !decision_start => Ok(()),
            other => Err(BridgeError::State(format!(
                "{} event is not accepted while job is {}",
                if decision_start {
                    "decision start"
                } else {
                    "report"
                },
                other
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::NotSolved => "NOT_SOLVED",
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Solved => "SOLVED",
            JobStatus::Failed => "FAILED",
            JobStatus::Corrupted => "CORRUPTED",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}
