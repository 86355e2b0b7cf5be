//! Dialog state management
//!
//! Represents the states a dialog passes through in a scenario.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Represents the state of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// No dialog yet; the dialog-creating request may be in flight
    Initial,

    /// A 2xx has been matched to the dialog-creating transaction
    Established,

    /// Dialog has been terminated
    Terminated,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Initial => write!(f, "Initial"),
            DialogState::Established => write!(f, "Established"),
            DialogState::Terminated => write!(f, "Terminated"),
        }
    }
}

impl DialogState {
    /// Check if the dialog is established
    pub fn is_established(&self) -> bool {
        matches!(self, DialogState::Established)
    }

    /// Check if the dialog is terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated)
    }
}
