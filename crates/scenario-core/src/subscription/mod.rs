//! Event subscriptions (RFC 6665) for the `reg` event package
//!
//! The notifier side is modelled by [`SubscriptionTracker`], the subscriber
//! side checks what it receives with [`NotifySequence`]. NOTIFY bodies are
//! [`RegInfo`] documents and are checked by the [`BodyValidator`]s collected
//! into a per-test [`ValidationCollector`].

pub mod reginfo;
pub mod sequence;
pub mod state;
pub mod tracker;
pub mod validation;

pub use reginfo::{
    AorRegistration, AorState, ContactEvent, ContactState, RegContact, RegInfo, RegInfoState,
    GRUUINFO_NS, REGINFO_CONTENT_TYPE, REGINFO_NS,
};
pub use sequence::NotifySequence;
pub use state::{SubscriptionState, SubscriptionStateHeader, TerminationReason};
pub use tracker::{Notification, SubscriptionRecord, SubscriptionTracker};
pub use validation::{BodyValidator, GruuInfoValidator, RegInfoValidator, ValidationCollector};

/// Event package tracked by the scenarios
pub const REG_EVENT: &str = "reg";
