//! Model parameter files (`key=value` lines, `#` comments).

use std::collections::BTreeMap;
use std::path::Path;

use crate::{Error, Result};

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// `true`/`false`/`1`/`0` in any of their accepted spellings
    Bool(bool),
    /// Anything else, quotes stripped
    Text(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(true) => write!(f, "1"),
            ParamValue::Bool(false) => write!(f, "0"),
            ParamValue::Text(text) => write!(f, "{text}"),
        }
    }
}

/// Parsed contents of a model parameter file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelParams {
    params: BTreeMap<String, ParamValue>,
}

impl ModelParams {
    /// Read and parse a parameter file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "model config file does not exist: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} in {}", msg, path.display())),
            other => other,
        })
    }

    /// Parse parameter file contents.
    pub fn parse(content: &str) -> Result<Self> {
        let mut params = BTreeMap::new();
        for raw in content.lines() {
            let line = remove_comments(raw);
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) if !value.contains('=') => (key.trim(), value.trim()),
                Some(_) => {
                    return Err(Error::Config(format!(
                        "line '{line}' has more than one '='"
                    )))
                }
                None => {
                    return Err(Error::Config(format!(
                        "line '{line}' should match format key=value"
                    )))
                }
            };
            if key.is_empty() || value.is_empty() {
                return Err(Error::Config(format!(
                    "line '{line}' should match format key=value"
                )));
            }
            params.insert(key.to_string(), boolean_filter(value));
        }
        Ok(Self { params })
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the file held no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Strip a `#` comment and surrounding whitespace from a line.
pub fn remove_comments(line: &str) -> &str {
    match line.find('#') {
        Some(i) => line[..i].trim(),
        None => line.trim(),
    }
}

/// Strip surrounding double quotes, or single quotes if there are none.
pub fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    if value.contains('"') {
        value.trim_matches('"')
    } else if value.contains('\'') {
        value.trim_matches('\'')
    } else {
        value
    }
}

/// Interpret common boolean spellings, keeping anything else as text.
pub fn boolean_filter(value: &str) -> ParamValue {
    match strip_quotes(value) {
        "TRUE" | "True" | "true" | "1" => ParamValue::Bool(true),
        "FALSE" | "False" | "false" | "0" => ParamValue::Bool(false),
        other => ParamValue::Text(other.to_string()),
    }
}
