//! Approval rule model and matching.
//!
//! Rules map a tool name (optionally narrowed by a regex over the serialized
//! tool arguments) to an allow/deny decision within a scope. Session rules are
//! consulted before global rules; within a bucket the first match wins.

mod store;

pub use store::{JsonRuleRepository, MemoryRuleRepository, RuleRepository};

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Lifetime of an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// A single matching invocation.
    #[default]
    Once,
    /// Every matching invocation in one session.
    Session,
    /// Every matching invocation in every session.
    Global,
}

/// Persisted approval decision for a tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRule {
    /// Rule identifier.
    pub id: String,
    /// Exact tool name this rule applies to.
    pub tool_name: String,
    /// Regex over the serialized tool arguments. `None` matches any arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_pattern: Option<String>,
    /// Allow (`true`) or deny (`false`).
    pub approved: bool,
    pub scope: RuleScope,
    /// Owning session; present iff `scope` is `Session`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl ApprovalRule {
    /// A rule applying to every session.
    pub fn global(tool_name: &str, args_pattern: Option<&str>, approved: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            args_pattern: args_pattern.map(String::from),
            approved,
            scope: RuleScope::Global,
            session_id: None,
            description: String::new(),
        }
    }

    /// A rule applying to one session.
    pub fn for_session(
        session_id: &str,
        tool_name: &str,
        args_pattern: Option<&str>,
        approved: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            args_pattern: args_pattern.map(String::from),
            approved,
            scope: RuleScope::Session,
            session_id: Some(session_id.to_string()),
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check the rule against a tool invocation.
    ///
    /// An unparsable pattern never matches.
    pub fn matches(&self, tool_name: &str, serialized_args: &str) -> bool {
        if self.tool_name != tool_name {
            return false;
        }
        let Some(pattern) = &self.args_pattern else {
            return true;
        };
        match Regex::new(pattern) {
            Ok(re) => re.is_match(serialized_args),
            Err(e) => {
                warn!(rule_id = %self.id, pattern, error = %e, "Ignoring rule with invalid pattern");
                false
            }
        }
    }

    fn same_key(&self, other: &Self) -> bool {
        self.tool_name == other.tool_name
            && self.args_pattern == other.args_pattern
            && self.scope == other.scope
            && self.session_id == other.session_id
    }

    fn validate(&self) -> Result<()> {
        if self.tool_name.is_empty() {
            return Err(Error::Rules("tool name must not be empty".into()));
        }
        if let Some(pattern) = &self.args_pattern {
            Regex::new(pattern)
                .map_err(|e| Error::Rules(format!("invalid args pattern {pattern:?}: {e}")))?;
        }
        match (self.scope, &self.session_id) {
            (RuleScope::Session, None) => Err(Error::Rules(format!(
                "session rule {} has no session id",
                self.id
            ))),
            (RuleScope::Global | RuleScope::Once, Some(_)) => Err(Error::Rules(format!(
                "rule {} carries a session id but is not session scoped",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// All persisted rules, as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCollection {
    #[serde(default)]
    pub global_rules: Vec<ApprovalRule>,
    #[serde(default)]
    pub session_rules: HashMap<String, Vec<ApprovalRule>>,
}

impl RuleCollection {
    /// Insert a rule, replacing any rule with the same
    /// `(tool_name, args_pattern, scope bucket)` key.
    ///
    /// Returns the replaced rule, if any.
    pub fn upsert(&mut self, rule: ApprovalRule) -> Result<Option<ApprovalRule>> {
        rule.validate()?;
        let bucket = match (&rule.scope, &rule.session_id) {
            (RuleScope::Session, Some(session_id)) => {
                self.session_rules.entry(session_id.clone()).or_default()
            }
            (RuleScope::Global, _) => &mut self.global_rules,
            _ => {
                return Err(Error::Rules(format!(
                    "rule {} with scope {:?} cannot be persisted",
                    rule.id, rule.scope
                )));
            }
        };

        let replaced = bucket
            .iter()
            .position(|existing| existing.same_key(&rule))
            .map(|idx| bucket.remove(idx));
        bucket.push(rule);
        Ok(replaced)
    }

    /// Find the first matching rule: session rules, then global rules.
    pub fn find_match(
        &self,
        session_id: &str,
        tool_name: &str,
        serialized_args: &str,
    ) -> Option<&ApprovalRule> {
        self.session_rules
            .get(session_id)
            .into_iter()
            .flatten()
            .chain(self.global_rules.iter())
            .find(|rule| rule.matches(tool_name, serialized_args))
    }

    /// Drop every rule owned by a session.
    pub fn remove_session(&mut self, session_id: &str) -> usize {
        self.session_rules
            .remove(session_id)
            .map_or(0, |rules| rules.len())
    }

    /// Remove a rule by id from any bucket.
    pub fn remove(&mut self, rule_id: &str) -> Option<ApprovalRule> {
        if let Some(idx) = self.global_rules.iter().position(|r| r.id == rule_id) {
            return Some(self.global_rules.remove(idx));
        }
        for rules in self.session_rules.values_mut() {
            if let Some(idx) = rules.iter().position(|r| r.id == rule_id) {
                return Some(rules.remove(idx));
            }
        }
        None
    }

    /// Total number of rules.
    pub fn len(&self) -> usize {
        self.global_rules.len() + self.session_rules.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
