//! Run options passed through to the engine.
//!
//! Options are an insertion-ordered map from key to value. The engine
//! understands well over a hundred keys; the dispatch layer only interprets
//! the handful named by the constants below and forwards everything else.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};

/// Forward model name.
pub const MODEL: &str = "model";
/// Model group (plugin library) providing the model.
pub const MODEL_GROUP: &str = "model-group";
/// Inference method.
pub const METHOD: &str = "method";
/// Noise model.
pub const NOISE: &str = "noise";
/// Mapping of engine output name to display name.
pub const OUTPUT_RENAME: &str = "output-rename";
/// Name(s) of the main data item(s).
pub const DATA: &str = "data";
/// Name of the mask item.
pub const ROI: &str = "roi";
/// Resolved model group library, set internally.
pub const LOAD_MODELS: &str = "loadmodels";
/// Working directory for the engine, set internally.
pub const WORKING_DIR: &str = "indir";

/// Inference method that needs the whole volume at once.
pub const SPATIAL_METHOD: &str = "spatialvb";

/// A single option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Text(String),
    Int(i64),
    Float(f64),
    /// Option is set but carries no value.
    Flag,
    Mapping(BTreeMap<String, String>),
}

impl OptionValue {
    /// Text content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    fn from_json(key: &str, value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Flag,
            Value::Bool(true) => Self::Flag,
            Value::String(s) if s.is_empty() => Self::Flag,
            Value::String(s) => Self::Text(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::Object(map) => {
                let mut mapping = BTreeMap::new();
                for (k, v) in map {
                    let text = v.as_str().ok_or_else(|| {
                        Error::Config(format!("option '{}': mapping value for '{}' must be text", key, k))
                    })?;
                    mapping.insert(k.clone(), text.to_string());
                }
                Self::Mapping(mapping)
            }
            other => {
                return Err(Error::Config(format!(
                    "option '{}': unsupported value {}",
                    key, other
                )));
            }
        })
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Flag => Ok(()),
            Self::Mapping(map) => {
                let pairs: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                f.write_str(&pairs.join(","))
            }
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for OptionValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for OptionValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Insertion-ordered option map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    entries: Vec<(String, OptionValue)>,
}

impl RunOptions {
    /// Create an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from a JSON object.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Config("run options must be a JSON object".to_string()))?;
        let mut options = Self::new();
        for (key, v) in object {
            options.insert(key.clone(), OptionValue::from_json(key, v)?);
        }
        Ok(options)
    }

    /// Parse a `key=value` assignment. A bare `key` is a flag.
    pub fn parse_assignment(text: &str) -> Result<(String, OptionValue)> {
        let (key, value) = match text.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (text.trim(), None),
        };
        if key.is_empty() {
            return Err(Error::Config(format!("invalid option assignment '{}'", text)));
        }
        let value = match value {
            None | Some("") => OptionValue::Flag,
            Some(v) => {
                if let Ok(i) = v.parse::<i64>() {
                    OptionValue::Int(i)
                } else if let Ok(x) = v.parse::<f64>() {
                    OptionValue::Float(x)
                } else {
                    OptionValue::Text(v.to_string())
                }
            }
        };
        Ok((key.to_string(), value))
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Text value of an option, if present and textual.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace an option. Replacement keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Method option, or the empty string.
    pub fn method(&self) -> &str {
        self.get_str(METHOD).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<OptionValue>> FromIterator<(K, V)> for RunOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (k, v) in iter {
            options.insert(k, v);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_replaces_in_place() {
        let mut opts = RunOptions::new();
        opts.insert("model", "poly");
        opts.insert("method", "vb");
        opts.insert("model", "exp");

        let keys: Vec<_> = opts.keys().collect();
        assert_eq!(keys, vec!["model", "method"]);
        assert_eq!(opts.get_str("model"), Some("exp"));
    }

    #[test]
    fn test_remove() {
        let mut opts: RunOptions = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(opts.remove("a"), Some(OptionValue::Text("1".into())));
        assert_eq!(opts.remove("a"), None);
        assert_eq!(opts.len(), 1);
    }

    #[test]
    fn test_from_json() {
        let opts = RunOptions::from_json(&json!({
            "model": "poly",
            "degree": 2,
            "save-mean": "",
            "tau": 0.5,
            "output-rename": {"mean_c0": "intercept"}
        }))
        .unwrap();

        assert_eq!(opts.get("degree"), Some(&OptionValue::Int(2)));
        assert_eq!(opts.get("save-mean"), Some(&OptionValue::Flag));
        assert_eq!(opts.get("tau"), Some(&OptionValue::Float(0.5)));
        match opts.get(OUTPUT_RENAME) {
            Some(OptionValue::Mapping(m)) => assert_eq!(m["mean_c0"], "intercept"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(RunOptions::from_json(&json!([1, 2])).is_err());
        assert!(RunOptions::from_json(&json!({"x": [1]})).is_err());
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            RunOptions::parse_assignment("degree=3").unwrap(),
            ("degree".to_string(), OptionValue::Int(3))
        );
        assert_eq!(
            RunOptions::parse_assignment("save-mean").unwrap(),
            ("save-mean".to_string(), OptionValue::Flag)
        );
        assert_eq!(
            RunOptions::parse_assignment("method=spatialvb").unwrap().1,
            OptionValue::Text("spatialvb".into())
        );
        assert!(RunOptions::parse_assignment("=x").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(OptionValue::Flag.to_string(), "");
        assert_eq!(OptionValue::Int(2).to_string(), "2");
        assert_eq!(OptionValue::Float(1.5).to_string(), "1.5");
    }
}
