//! `AgentDesk` Core Library
//!
//! Shared functionality for `AgentDesk` components:
//! - NDJSON parsing for Claude Code stream-json protocol
//! - Configuration resolution and hierarchy
//! - Approval rules, their persistence, and tool risk heuristics
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod risk;
pub mod rules;
pub mod time;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use risk::RiskLevel;
pub use rules::{ApprovalRule, RuleCollection, RuleScope};
