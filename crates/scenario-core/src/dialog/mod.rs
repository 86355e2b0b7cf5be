//! Core dialog types
//!
//! - [`Dialog`]: tags, CSeq spaces, transactions and lifecycle of one call leg
//! - [`DialogState`]: dialog lifecycle states (Initial, Established, Terminated)
//! - [`dialog_utils`]: tag, branch and Call-ID generation
//!
//! ## Dialog Lifecycle
//!
//! ```text
//! Initial ──2xx to INVITE/SUBSCRIBE──▶ Established ──BYE/200──▶ Terminated
//!    │                                                              ▲
//!    └──────────── error final response + ACK ──────────────────────┘
//! ```
//!
//! `end_call()` moves any dialog to Terminated and releases its transactions.

pub mod dialog_impl;
pub mod dialog_state;
pub mod dialog_utils;

pub use dialog_impl::Dialog;
pub use dialog_state::DialogState;
pub use dialog_utils::{generate_branch, generate_call_id, generate_tag, is_valid_tag};
