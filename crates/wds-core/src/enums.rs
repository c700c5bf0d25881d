//! Lifecycle enums and sequence counter names.
//!
//! All enums use `snake_case` serialization via `#[serde(rename_all = "snake_case")]`,
//! which is also the representation stored in SQL TEXT columns.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ExperimentState
// ---------------------------------------------------------------------------

/// Researcher-controlled lifecycle of an experiment.
///
/// Sessions snapshot this value twice: once when they are created and once
/// when they complete. Completion counts are always scoped to the experiment's
/// current value, so pilot completions never consume open-phase capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Open,
    #[default]
    Closed,
    Piloting,
}

impl ExperimentState {
    /// Whether an experiment in this state may admit participants at all.
    #[must_use]
    pub const fn accepts_participants(self) -> bool {
        matches!(self, Self::Open | Self::Piloting)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Piloting => "piloting",
        }
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// State of a participant session.
///
/// ```text
/// started → completed
///         → rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Started,
    Completed,
    Rejected,
}

impl SessionState {
    /// Valid next states from the current state.
    #[must_use]
    pub const fn allowed_next_states(self) -> &'static [Self] {
        match self {
            Self::Started => &[Self::Completed, Self::Rejected],
            Self::Completed | Self::Rejected => &[],
        }
    }

    /// Check whether transitioning to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next_states().contains(&next)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.allowed_next_states().is_empty()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SequenceCounter
// ---------------------------------------------------------------------------

/// Named per-experiment sequences. Each counter is independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SequenceCounter {
    SubjectId,
    DataPointNumber,
}

impl SequenceCounter {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubjectId => "subject_id",
            Self::DataPointNumber => "data_point_number",
        }
    }

    /// Table and column holding the values already handed out for this counter.
    #[must_use]
    pub const fn holder(self) -> (&'static str, &'static str) {
        match self {
            Self::SubjectId => ("participant_sessions", "subject_id"),
            Self::DataPointNumber => ("data_points", "number"),
        }
    }
}

impl fmt::Display for SequenceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
