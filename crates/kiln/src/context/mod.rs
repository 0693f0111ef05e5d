//! Per-turn context budgeting.
//!
//! [`budget`] estimates the token footprint of a turn's system prompt,
//! skills, history and message, and trims the lowest-priority parts first
//! when the total exceeds [`ContextBudgetConfig::available`].

pub mod budget;

pub use budget::{
    BudgetReport, ContextBudgetConfig, ContextBudgetManager, SectionTokens, TrimmedContext,
    estimate_tokens,
};
