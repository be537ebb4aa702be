//! Conflict-handling knobs shared by the create operations.

use serde::{Deserialize, Serialize};

/// What to do when a put targets an id that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    #[default]
    Raise,
    DoNothing,
}

/// What to do when a run targets a thread that does not exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfNotExists {
    #[default]
    Reject,
    Create,
}
