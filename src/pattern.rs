//! # Pattern Matching
//!
//! Subscriptions declare interest through an [`EventPattern`]: a type
//! expression plus attribute constraints. The [`PatternMatcher`] evaluates
//! events against patterns as a pure function and may be shared freely across
//! concurrent dispatch paths; compiled type expressions are cached internally.
//!
//! ## Type Expressions
//!
//! - `build.failure` — literal match
//! - `*` — matches every event type
//! - `build.*` — every `*` matches zero or more characters, the rest is
//!   literal
//! - `!build.*` — leading `!` negates the remaining expression
//! - `regex:^(build|test)\.` — raw regular expression after the prefix
//!
//! Malformed expressions are rejected by [`PatternMatcher::validate`], which
//! the router calls at subscription time; `matches` itself never errors, a
//! broken expression simply matches nothing.

use std::collections::HashMap;
use std::fmt;

use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;
use tracing::trace;

use crate::event::{Event, Value};

/// Prefix selecting raw-regex interpretation of a type expression.
const REGEX_PREFIX: &str = "regex:";

/// Predicate over event type and payload attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct EventPattern {
    /// Type expression; see module docs for the accepted forms
    pub event_type: String,
    /// Required payload attributes; all must be present with equal values
    pub attributes: HashMap<String, Value>,
}

impl EventPattern {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            attributes: HashMap::new(),
        }
    }

    /// The universal pattern, matching every event.
    pub fn any() -> Self {
        Self::new("*")
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Checks the attribute constraints against an event payload.
    ///
    /// Every declared `(key, value)` must be present in the payload with an
    /// equal value; a missing key fails the whole match.
    pub fn matches_attributes(&self, payload: &HashMap<String, Value>) -> bool {
        self.attributes
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attributes.is_empty() {
            return write!(f, "{}", self.event_type);
        }
        let mut attrs: Vec<String> = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{}={:?}", k, v))
            .collect();
        attrs.sort();
        write!(f, "{}[{}]", self.event_type, attrs.join(", "))
    }
}

/// # PatternMatcher
///
/// Pure event-against-pattern evaluation with an internal cache of compiled
/// type expressions. Safe to call from any number of tasks concurrently.
#[derive(Default)]
pub struct PatternMatcher {
    regex_cache: DashMap<String, Regex>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks an event against a pattern.
    pub fn matches(&self, event: &Event, pattern: &EventPattern) -> bool {
        self.matches_event_type(&event.event_type, &pattern.event_type)
            && pattern.matches_attributes(&event.payload)
    }

    /// Checks an event type string against a type expression.
    pub fn matches_event_type(&self, event_type: &str, expression: &str) -> bool {
        if let Some(negated) = expression.strip_prefix('!') {
            return !self.matches_event_type(event_type, negated);
        }
        match self.compiled(expression) {
            Some(regex) => regex.is_match(event_type),
            None => {
                trace!(expression, "unmatchable type expression");
                false
            }
        }
    }

    /// Validates a pattern's type expression, compiling it eagerly.
    ///
    /// Called by the router when a subscription is created so that malformed
    /// patterns are rejected up front instead of silently matching nothing at
    /// publish time.
    pub fn validate(&self, pattern: &EventPattern) -> PatternResult<()> {
        let expression = pattern.event_type.strip_prefix('!').unwrap_or(&pattern.event_type);
        if expression.is_empty() {
            return Err(PatternError::InvalidExpression {
                expression: pattern.event_type.clone(),
                message: "type expression is empty".to_string(),
            });
        }
        Regex::new(&Self::to_regex(expression)).map_err(|e| PatternError::InvalidExpression {
            expression: pattern.event_type.clone(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn compiled(&self, expression: &str) -> Option<Regex> {
        if let Some(regex) = self.regex_cache.get(expression) {
            return Some(regex.clone());
        }
        let regex = Regex::new(&Self::to_regex(expression)).ok()?;
        self.regex_cache
            .insert(expression.to_string(), regex.clone());
        Some(regex)
    }

    fn to_regex(expression: &str) -> String {
        if let Some(raw) = expression.strip_prefix(REGEX_PREFIX) {
            return raw.to_string();
        }
        if expression == "*" {
            return ".*".to_string();
        }
        // Glob-style: `*` spans zero or more characters, the rest is literal.
        let escaped = regex::escape(expression).replace("\\*", ".*");
        format!("^{}$", escaped)
    }
}

#[derive(Error, Debug)]
pub enum PatternError {
    #[error("invalid pattern expression {expression:?}: {message}")]
    InvalidExpression { expression: String, message: String },
}

pub type PatternResult<T> = Result<T, PatternError>;
