//! Canonicalization of inference requests.
//!
//! Two requests that a provider would treat identically must produce the same
//! [`CanonicalRequest`]: object keys are sorted at every depth, run-volatile
//! top-level fields are stripped, and floating point noise is rounded away.
//! Array order and string whitespace are significant and preserved.

use std::collections::BTreeSet;

use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use url::Url;

use crate::error::InferenceError;
use crate::request::InferenceRequest;

/// Top-level body fields that vary from run to run without changing meaning.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "request_id",
    "client_request_id",
    "idempotency_key",
    "timestamp",
];

/// Decimal places kept for floats and decimal literals embedded in strings.
pub const DEFAULT_FLOAT_PRECISION: u32 = 5;

/// Base used to resolve endpoint-only URLs such as `/v1/chat/completions`.
const RELATIVE_BASE: &str = "http://recorded.invalid/";

const SUMMARY_BODY_LIMIT: usize = 240;

/// Stable representation of a request; the input to fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub method: String,
    /// URL path only. Scheme, host and port never participate.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<(String, String)>,
    pub body: Value,
}

impl CanonicalRequest {
    /// Compact JSON with sorted keys; the exact bytes that get hashed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "method": self.method,
            "endpoint": self.endpoint,
            "query": self.query,
            "body": sorted(&self.body),
        });
        // Value maps are rebuilt in sorted order, so serialization is stable
        // whether or not serde_json preserves insertion order.
        serde_json::to_vec(&sorted(&value)).unwrap_or_default()
    }

    /// Rebuilds a request from the canonical form. Normalizing the result
    /// yields `self` again.
    pub fn to_request(&self) -> InferenceRequest {
        let mut url = self.endpoint.clone();
        if !self.query.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.query.iter())
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        InferenceRequest::json(self.method.clone(), url, &self.body)
    }

    /// One-line, human-readable description used in replay-miss reports.
    pub fn summary(&self) -> String {
        let model = self
            .body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("-");
        let mut body = self.body.to_string();
        if body.len() > SUMMARY_BODY_LIMIT {
            let mut cut = SUMMARY_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push('…');
        }
        let query = if self.query.is_empty() {
            String::new()
        } else {
            let pairs: Vec<String> = self.query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("?{}", pairs.join("&"))
        };
        format!(
            "{} {}{query} model={model} body={body}",
            self.method, self.endpoint
        )
    }
}

/// Turns raw requests into [`CanonicalRequest`]s.
#[derive(Debug, Clone)]
pub struct Normalizer {
    volatile_fields: BTreeSet<String>,
    float_precision: u32,
    embedded_decimal: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(
            DEFAULT_VOLATILE_FIELDS.iter().map(|field| (*field).to_string()),
            DEFAULT_FLOAT_PRECISION,
        )
    }
}

impl Normalizer {
    pub fn new(volatile_fields: impl IntoIterator<Item = String>, float_precision: u32) -> Self {
        let pattern = format!(r"-?\d+\.\d{{{},}}", float_precision + 1);
        #[allow(clippy::expect_used)]
        let embedded_decimal = Regex::new(&pattern).expect("decimal pattern is valid");
        Self {
            volatile_fields: volatile_fields.into_iter().collect(),
            float_precision,
            embedded_decimal,
        }
    }

    pub fn volatile_fields(&self) -> impl Iterator<Item = &str> {
        self.volatile_fields.iter().map(String::as_str)
    }

    pub fn float_precision(&self) -> u32 {
        self.float_precision
    }

    /// Canonicalizes `request`. Pure; fails only on unparsable input.
    pub fn normalize(&self, request: &InferenceRequest) -> Result<CanonicalRequest, InferenceError> {
        let method = request.method.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(InferenceError::MalformedRequest(
                "request method is empty".to_string(),
            ));
        }

        let url = parse_url(&request.url)?;
        let mut query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        query.sort();

        let body: Value = serde_json::from_slice(&request.body).map_err(|e| {
            InferenceError::MalformedRequest(format!("request body is not valid JSON: {e}"))
        })?;
        if !body.is_object() {
            return Err(InferenceError::MalformedRequest(format!(
                "request body must be a JSON object, got {}",
                json_kind(&body)
            )));
        }

        Ok(CanonicalRequest {
            method,
            endpoint: url.path().to_string(),
            query,
            body: self.normalize_body(&body),
        })
    }

    /// Canonicalizes a JSON body: strips volatile top-level fields, then
    /// sorts keys and rounds decimals throughout.
    pub fn normalize_body(&self, body: &Value) -> Value {
        match body {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map
                    .keys()
                    .filter(|key| !self.volatile_fields.contains(key.as_str()))
                    .collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), self.canonicalize(&map[key]));
                }
                Value::Object(out)
            }
            other => self.canonicalize(other),
        }
    }

    fn canonicalize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), self.canonicalize(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.canonicalize(v)).collect()),
            Value::Number(number) => Value::Number(self.round_number(number)),
            Value::String(text) => Value::String(self.round_embedded_decimals(text)),
            Value::Bool(_) | Value::Null => value.clone(),
        }
    }

    fn round_number(&self, number: &Number) -> Number {
        if number.is_i64() || number.is_u64() {
            return number.clone();
        }
        let Some(float) = number.as_f64() else {
            return number.clone();
        };
        // Re-rounding the result must be a no-op.
        let precision = self.float_precision as usize;
        let rounded = match format!("{float:.precision$}").parse::<f64>() {
            Ok(rounded) if rounded == 0.0 => 0.0,
            Ok(rounded) => rounded,
            Err(_) => return number.clone(),
        };
        Number::from_f64(rounded).unwrap_or_else(|| number.clone())
    }

    fn round_embedded_decimals(&self, text: &str) -> String {
        let precision = self.float_precision as usize;
        self.embedded_decimal
            .replace_all(text, |caps: &Captures<'_>| {
                let literal = &caps[0];
                match literal.parse::<f64>() {
                    Ok(parsed) => format!("{parsed:.precision$}"),
                    Err(_) => literal.to_string(),
                }
            })
            .into_owned()
    }
}

fn parse_url(raw: &str) -> Result<Url, InferenceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InferenceError::MalformedRequest(
            "request URL is empty".to_string(),
        ));
    }
    let base = Url::parse(RELATIVE_BASE)
        .map_err(|e| InferenceError::MalformedRequest(format!("invalid base URL: {e}")))?;
    Url::options()
        .base_url(Some(&base))
        .parse(trimmed)
        .map_err(|e| InferenceError::MalformedRequest(format!("invalid request URL `{raw}`: {e}")))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Copy of `value` with object keys inserted in sorted order.
pub(crate) fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
