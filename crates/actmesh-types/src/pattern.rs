//! Action patterns and pin sets.
//!
//! A [`Pattern`] is a set of `key:value` pairs naming an action, e.g.
//! `role:math,cmd:sum`. Keys are kept sorted so that the serialized form is
//! deterministic. A [`PinSet`] is the list of patterns a client forwards to
//! its peer.

use crate::error::PatternError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Pin value that matches any value for its key.
pub const WILDCARD: &str = "*";

/// Structured key identifying an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(BTreeMap<String, Value>);

impl Pattern {
    /// Create an empty pattern.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse the `key:value,key:value` text form.
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        text.parse()
    }

    /// Add or replace a pair, returning the pattern for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Add or replace a pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every pair of `pin` appears in this pattern.
    ///
    /// A pin value of `*` only requires the key to be present. An empty pin
    /// matches everything.
    pub fn matches(&self, pin: &Pattern) -> bool {
        pin.0.iter().all(|(key, expected)| match self.0.get(key) {
            Some(actual) => expected.as_str() == Some(WILDCARD) || actual == expected,
            None => false,
        })
    }
}

impl From<BTreeMap<String, Value>> for Pattern {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = BTreeMap::new();
        for segment in s.split(',').map(str::trim).filter(|seg| !seg.is_empty()) {
            let (key, raw) = segment
                .split_once(':')
                .ok_or_else(|| PatternError::MissingSeparator(segment.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(PatternError::EmptyKey(segment.to_string()));
            }
            map.insert(key.to_string(), parse_value(raw.trim()));
        }
        Ok(Self(map))
    }
}

/// Scalars that parse as JSON keep their JSON type; anything else is a string.
fn parse_value(raw: &str) -> Value {
    if let Some(quoted) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Value::String(quoted.to_string());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match value {
                Value::String(s) => write!(f, "{key}:{s}")?,
                other => write!(f, "{key}:{other}")?,
            }
        }
        Ok(())
    }
}

/// The patterns a client is authoritative for.
///
/// An empty set is a catch-all: every pattern routed to the client is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pins: Vec<Pattern>,
}

impl PinSet {
    pub fn new(pins: Vec<Pattern>) -> Self {
        Self { pins }
    }

    /// Parse a list of pins in text form.
    pub fn parse_all<S: AsRef<str>>(pins: &[S]) -> Result<Self, PatternError> {
        let pins = pins
            .iter()
            .map(|p| Pattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pins })
    }

    pub fn is_catch_all(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn pins(&self) -> &[Pattern] {
        &self.pins
    }

    /// Whether `pattern` belongs to this pin set.
    pub fn matches(&self, pattern: &Pattern) -> bool {
        self.is_catch_all() || self.pins.iter().any(|pin| pattern.matches(pin))
    }
}
