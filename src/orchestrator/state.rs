//! Session lifecycle state machine.
//!
//! `Pending -> Cloning -> Building -> Packaging -> Done`, with `Failed`
//! reachable from every non-terminal state. Terminal states have no exits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline state of one build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepted, waiting for a worker permit
    Pending,

    /// Fetching the repository and checking out the ref
    Cloning,

    /// Running the RPM toolchain in the sandbox
    Building,

    /// Collecting packages into the archive
    Packaging,

    /// Archive stored, reference issued
    Done,

    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Cloning => "cloning",
            SessionState::Building => "building",
            SessionState::Packaging => "packaging",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        }
    }

    /// Legal successors of this state.
    pub fn valid_next_states(&self) -> &'static [SessionState] {
        match self {
            SessionState::Pending => &[SessionState::Cloning, SessionState::Failed],
            SessionState::Cloning => &[SessionState::Building, SessionState::Failed],
            SessionState::Building => &[SessionState::Packaging, SessionState::Failed],
            SessionState::Packaging => &[SessionState::Done, SessionState::Failed],
            SessionState::Done | SessionState::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        self.valid_next_states().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
