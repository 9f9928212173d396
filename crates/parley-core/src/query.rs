//! Query-string construction for REST calls.
//!
//! - nested objects flatten to dot-path keys (`a.b.c=value`)
//! - arrays encode as a bracketed comma list (`ids=[a,b]`)
//! - string inputs pass through untouched as a raw query string

use serde_json::Value;

use crate::{errors::Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Pair {
    key: String,
    value: Option<String>,
}

/// Encoded query string, kept as ordered pairs so pagination parameters can be
/// injected or replaced without re-parsing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryString {
    pairs: Vec<Pair>,
}

impl QueryString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON query description.
    ///
    /// `null` is empty, strings are taken as already-encoded raw query strings
    /// (a leading `?` is optional), objects are flattened. Anything else is a
    /// configuration error.
    pub fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::Null => Ok(Self::new()),
            Value::String(raw) => Ok(Self::parse_raw(raw)),
            Value::Object(map) => {
                let mut out = Self::new();
                for (k, v) in map {
                    out.flatten(k, v);
                }
                Ok(out)
            }
            other => Err(Error::Config(format!(
                "query must be an object or string, got {}",
                type_name(other)
            ))),
        }
    }

    fn parse_raw(raw: &str) -> Self {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        let pairs = raw
            .split('&')
            .filter(|s| !s.is_empty())
            .map(|seg| match seg.split_once('=') {
                Some((k, v)) => Pair {
                    key: k.to_string(),
                    value: Some(v.to_string()),
                },
                None => Pair {
                    key: seg.to_string(),
                    value: None,
                },
            })
            .collect();
        Self { pairs }
    }

    fn flatten(&mut self, key: &str, v: &Value) {
        match v {
            Value::Null => {}
            Value::Object(map) => {
                for (k, child) in map {
                    self.flatten(&format!("{key}.{k}"), child);
                }
            }
            Value::Array(items) => {
                let list = items.iter().map(encode_scalar).collect::<Vec<_>>().join(",");
                self.push_encoded(key, format!("[{list}]"));
            }
            scalar => {
                let encoded = encode_scalar(scalar);
                self.push_encoded(key, encoded);
            }
        }
    }

    fn push_encoded(&mut self, key: &str, value: String) {
        self.pairs.push(Pair {
            key: urlencoding::encode(key).into_owned(),
            value: Some(value),
        });
    }

    /// Set `key` to `value`, replacing any existing occurrence.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let key = urlencoding::encode(key).into_owned();
        let value = urlencoding::encode(&value.to_string()).into_owned();
        self.pairs.retain(|p| p.key != key);
        self.pairs.push(Pair {
            key,
            value: Some(value),
        });
    }

    /// Inject the `limit`/`offset` pagination parameters.
    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.set("limit", limit);
        self.set("offset", offset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Render with a leading `?`, or an empty string when there are no pairs.
    pub fn render(&self) -> String {
        if self.pairs.is_empty() {
            return String::new();
        }
        let body = self
            .pairs
            .iter()
            .map(|p| match &p.value {
                Some(v) => format!("{}={v}", p.key),
                None => p.key.clone(),
            })
            .collect::<Vec<_>>()
            .join("&");
        format!("?{body}")
    }
}

fn encode_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => urlencoding::encode(s).into_owned(),
        Value::Null => String::new(),
        // Numbers/bools render as-is; nested structures fall back to their JSON text.
        Value::Number(_) | Value::Bool(_) => v.to_string(),
        other => urlencoding::encode(&other.to_string()).into_owned(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(v: Value) -> String {
        QueryString::from_value(&v).unwrap().render()
    }

    #[test]
    fn flattens_nested_objects_to_dot_paths() {
        assert_eq!(
            render(json!({"a": {"b": {"c": "value"}}, "n": 3})),
            "?a.b.c=value&n=3"
        );
    }

    #[test]
    fn arrays_encode_as_bracketed_lists() {
        assert_eq!(render(json!({"ids": ["x", "y z", 3]})), "?ids=[x,y%20z,3]");
    }

    #[test]
    fn raw_strings_pass_through_with_question_mark() {
        assert_eq!(render(json!("a=1&b=2")), "?a=1&b=2");
        assert_eq!(render(json!("?a=1")), "?a=1");
        assert_eq!(render(json!("")), "");
    }

    #[test]
    fn nulls_are_skipped_and_empty_renders_nothing() {
        assert_eq!(render(json!({"a": null})), "");
        assert_eq!(render(Value::Null), "");
    }

    #[test]
    fn page_params_replace_existing_values() {
        let q = QueryString::from_value(&json!("status=open&limit=10"))
            .unwrap()
            .with_page(5, 15);
        assert_eq!(q.render(), "?status=open&limit=5&offset=15");
    }

    #[test]
    fn rejects_non_object_queries() {
        let err = QueryString::from_value(&json!(42)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
