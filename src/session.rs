//! Per-user session state threaded through the actions of an iteration.
//!
//! Each [`VirtualUser`](../user/index.html) owns exactly one [`SessionState`]. While an
//! action runs, ownership of the session moves into the queued
//! [`Task`](../worker/struct.Task.html) and is handed back to the user when the task
//! completes, so only one executor can ever read or write a session at a time.
//!
//! Values stored in the session can be referenced from action urls, addresses, headers,
//! bodies and payloads with `${key}` placeholders.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;

/// Reserved key holding the generated identifier of the virtual user.
///
/// This is the only key that survives [`SessionState::reset`].
pub const UID_KEY: &str = "UID";

/// Keys starting with this prefix hold captured cookies, replayed on later requests.
pub const COOKIE_PREFIX: &str = "__cookie__";

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\$\{([^}]+)\}").expect("failed to compile placeholder regex");
}

/// Mutable key-value scratch space owned by one virtual user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    values: HashMap<String, String>,
}
impl SessionState {
    /// Create a session seeded with the given user identifier.
    pub fn new(uid: &str) -> Self {
        let mut values = HashMap::new();
        values.insert(UID_KEY.to_string(), uid.to_string());
        SessionState { values }
    }

    /// Clear everything but the `UID` at the start of an iteration.
    ///
    /// Captured cookies and extracted variables are scoped to a single iteration, so they
    /// are discarded here as well.
    pub fn reset(&mut self) {
        self.values.retain(|key, _| key == UID_KEY);
    }

    /// Merge a feeder record into the session, overwriting existing keys.
    pub fn merge(&mut self, record: &HashMap<String, String>) {
        for (key, value) in record {
            self.values.insert(key.to_string(), value.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|value| value.as_str())
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn uid(&self) -> Option<&str> {
        self.get(UID_KEY)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Store a cookie captured from a response.
    pub fn store_cookie(&mut self, name: &str, value: &str) {
        self.values
            .insert(format!("{}{}", COOKIE_PREFIX, name), value.to_string());
    }

    /// All captured cookies as `(name, value)` pairs, sorted by name.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        let mut cookies: Vec<(&str, &str)> = self
            .values
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(COOKIE_PREFIX)
                    .map(|name| (name, value.as_str()))
            })
            .collect();
        cookies.sort_unstable();
        cookies
    }

    /// Render captured cookies as the value of a `Cookie` request header.
    pub fn cookie_header(&self) -> Option<String> {
        let cookies = self.cookies();
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<String>>()
                .join("; "),
        )
    }

    /// Replace every `${key}` placeholder with the matching session value.
    ///
    /// Placeholders without a matching key are left in place untouched.
    pub fn substitute(&self, template: &str) -> String {
        if !template.contains("${") {
            return template.to_string();
        }
        PLACEHOLDER
            .replace_all(template, |captures: &Captures| {
                match self.values.get(&captures[1]) {
                    Some(value) => value.to_string(),
                    None => captures[0].to_string(),
                }
            })
            .into_owned()
    }
}
