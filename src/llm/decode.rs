//! Lenient structured-text decoding
//!
//! Completions are untrusted text that usually, but not always, holds a JSON
//! object, sometimes wrapped in a markdown code fence. A [`LenientDecoder`] is
//! an ordered list of fallible attempts; the first one that succeeds wins.

use serde_json::Value;

use crate::error::{Result, ReverieError};

/// One way of turning completion text into a `T`
pub type Attempt<'a, T> = Box<dyn Fn(&str) -> Result<T> + Send + Sync + 'a>;

/// Ordered list of decode attempts, first success wins
pub struct LenientDecoder<'a, T> {
    attempts: Vec<(&'static str, Attempt<'a, T>)>,
}

impl<'a, T> Default for LenientDecoder<'a, T> {
    fn default() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }
}

impl<'a, T> LenientDecoder<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt; attempts run in insertion order
    pub fn attempt<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&str) -> Result<T> + Send + Sync + 'a,
    {
        self.attempts.push((name, Box::new(f)));
        self
    }

    /// Run the attempts in order and return the first success.
    ///
    /// When every attempt fails the error is a `Parse` error naming each
    /// attempt and why it failed.
    pub fn decode(&self, text: &str) -> Result<T> {
        let mut failures = Vec::with_capacity(self.attempts.len());
        for (name, attempt) in &self.attempts {
            match attempt(text) {
                Ok(value) => {
                    if !failures.is_empty() {
                        tracing::debug!("decoded completion via '{}' after {:?}", name, failures);
                    }
                    return Ok(value);
                }
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }
        Err(ReverieError::Parse(if failures.is_empty() {
            "no decode attempts configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

/// Strict: the trimmed text is a JSON object
pub fn json_object(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| ReverieError::Parse(format!("not JSON: {}", e)))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(ReverieError::Parse("JSON is not an object".to_string()))
    }
}

/// The body of a code fence, parsed as a JSON object
pub fn fenced_json_object(text: &str) -> Result<Value> {
    let body = strip_code_fence(text)
        .ok_or_else(|| ReverieError::Parse("no code fence".to_string()))?;
    json_object(body)
}

/// Strict first, then fenced: the default decoder for object responses
pub fn object_decoder<'a>() -> LenientDecoder<'a, Value> {
    LenientDecoder::new()
        .attempt("strict", json_object)
        .attempt("fenced", fenced_json_object)
}

/// Extract the body of a markdown code fence.
///
/// Handles a fence wrapping the whole text (closing fence optional) as well
/// as a fenced block surrounded by prose. Returns `None` without a fence.
pub fn strip_code_fence(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the language tag line ("json\n"); a tag with no newline is
        // "```json{...}"
        let body = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        let body = body.trim_end();
        let body = body.strip_suffix("```").unwrap_or(body);
        return Some(body.trim());
    }

    let fence_start = trimmed.find("```")?;
    let after_opening = &trimmed[fence_start + 3..];
    let body_start = after_opening.find('\n')? + 1;
    let body = &after_opening[body_start..];
    let closing = body.find("```")?;
    Some(body[..closing].trim())
}
