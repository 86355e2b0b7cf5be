use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the exchange this transaction represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// We sent the request and consume responses
    Client,
    /// We received the request and produce responses
    Server,
}

/// State of a transaction, following the RFC 3261 §17 state machines as far
/// as a scenario harness observes them (no retransmission timers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Client INVITE sent, nothing received yet
    Calling,
    /// Non-INVITE request sent or received, no response yet
    Trying,
    /// A provisional response has been exchanged
    Proceeding,
    /// Non-2xx final response to INVITE exchanged, ACK outstanding
    Completed,
    /// Finished; accepts no further responses
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }

    /// Whether a final response is still expected
    pub fn awaits_final(&self) -> bool {
        matches!(
            self,
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Calling => write!(f, "Calling"),
            TransactionState::Trying => write!(f, "Trying"),
            TransactionState::Proceeding => write!(f, "Proceeding"),
            TransactionState::Completed => write!(f, "Completed"),
            TransactionState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(TransactionState::Calling.awaits_final());
        assert!(TransactionState::Proceeding.awaits_final());
        assert!(!TransactionState::Completed.awaits_final());
        assert!(TransactionState::Terminated.is_terminated());
        assert_eq!(TransactionState::Proceeding.to_string(), "Proceeding");
    }
}
