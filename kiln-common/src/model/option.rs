use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Value of a build option: a switch or a free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Str(String),
}

impl OptionValue {
    pub fn is_enabled(&self) -> bool {
        match self {
            OptionValue::Bool(b) => *b,
            OptionValue::Str(s) => !s.is_empty(),
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, OptionValue::Bool(_))
    }

    /// Compare against the textual form used in flags and predicates.
    pub fn matches_str(&self, raw: &str) -> bool {
        match self {
            OptionValue::Bool(b) => parse_bool(raw) == Some(*b),
            OptionValue::Str(s) => s == raw,
        }
    }
}

impl Default for OptionValue {
    fn default() -> Self {
        OptionValue::Bool(false)
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Str(s) => write!(f, "{s}"),
        }
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// A declared `option` of a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: OptionValue,
}

impl FormulaOption {
    pub fn switch(name: impl Into<String>, description: impl Into<String>, on: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: OptionValue::Bool(on),
        }
    }
}

/// Snapshot of every option of one formula after defaults and requests were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedOptions(BTreeMap<String, OptionValue>);

impl ResolvedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: OptionValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.0.get(name)
    }

    /// True when the option exists and is switched on (or is a non-empty string).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(OptionValue::is_enabled)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable identity of this option set, used to key installation records.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.0 {
            hasher.update(name.as_bytes());
            // Tag the kind so `Str("true")` and `Bool(true)` stay distinct.
            match value {
                OptionValue::Bool(_) => hasher.update(b"=b:"),
                OptionValue::Str(_) => hasher.update(b"=s:"),
            }
            hasher.update(value.to_string().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hex::encode(hasher.finalize());
        digest[..12].to_string()
    }

    /// Options whose value differs from the declared default.
    pub fn non_default<'a>(&'a self, declared: &'a [FormulaOption]) -> Vec<(&'a str, &'a OptionValue)> {
        declared
            .iter()
            .filter_map(|opt| {
                let value = self.0.get(&opt.name)?;
                (value != &opt.default).then_some((opt.name.as_str(), value))
            })
            .collect()
    }
}

impl fmt::Display for ResolvedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, value)| match value {
                OptionValue::Bool(true) => name.clone(),
                OptionValue::Bool(false) => format!("!{name}"),
                OptionValue::Str(s) => format!("{name}={s}"),
            })
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
