//! Call-diversion rules and their evaluation
//!
//! - [`rules`]: the rule-set model users configure
//! - [`evaluator`]: first-match evaluation, the ringing timer behind
//!   `no-answer`, and the mapping from callee responses to conditions
//! - [`simservs`]: the XML document a rule set is published as

pub mod evaluator;
pub mod rules;
pub mod simservs;

pub use evaluator::{
    conditions_for_final_response, evaluate, is_valid_target_uri, DiversionOutcome, RingingTimer,
};
pub use rules::{CallConditions, DiversionCondition, DiversionRule, DiversionRuleSet};
