//! Transaction-related data models.

use serde::{Deserialize, Serialize};

/// What the transaction body wants done with its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDecision {
    Commit,
    Rollback,
}

/// Lifecycle of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Init,
    Running,
    Committing,
    RollingBack,
    Finalized,
}

impl TransactionState {
    /// Check if the attempt has ended.
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized)
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Init, Running)
                | (Init, Finalized)
                | (Running, Committing)
                | (Running, RollingBack)
                | (Committing, RollingBack)
                | (Committing, Finalized)
                | (RollingBack, Finalized)
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Step of the transaction machinery that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    Acquire,
    Begin,
    Body,
    Commit,
    Rollback,
}

impl std::fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Acquire => "acquire",
            Self::Begin => "begin",
            Self::Body => "body",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Final result of `run_transaction`.
///
/// `success` is false when the machinery itself failed (acquire, BEGIN,
/// COMMIT, ROLLBACK, or a failing body). `committed` is true only after a
/// clean COMMIT round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionOutcome {
    pub success: bool,
    pub committed: bool,
}

impl TransactionOutcome {
    pub fn committed() -> Self {
        Self {
            success: true,
            committed: true,
        }
    }

    pub fn rolled_back() -> Self {
        Self {
            success: true,
            committed: false,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            committed: false,
        }
    }
}
