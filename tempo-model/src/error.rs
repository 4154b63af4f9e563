use std::fmt::{self, Display};

use crate::job::JobState;

/// Errors produced by model constructors and state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidSchedule(String),
    InvalidTransition { from: JobState, to: JobState },
    UnknownState(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidSchedule(msg) => {
                write!(f, "invalid schedule: {msg}")
            }
            ModelError::InvalidTransition { from, to } => {
                write!(f, "invalid job transition: {from} -> {to}")
            }
            ModelError::UnknownState(raw) => {
                write!(f, "unknown job state: {raw}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
