//! Aggregation of per-session adaptor property requests.
//!
//! Sessions request integer property values scoped to a `(property, adaptor)`
//! pair; the effective value applied to the adaptor is the maximum over all
//! recorded sessions. The manager reapplies the effective value after every
//! mutation, including the bulk clear that runs when a session is released.

use std::collections::HashMap;

use crate::session::SessionId;

type PropertyKey = (String, String);

/// Table of outstanding property requests.
#[derive(Debug, Default)]
pub struct PropertyHandler {
    requests: HashMap<PropertyKey, HashMap<SessionId, i32>>,
}

impl PropertyHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` for `(property, adaptor)` on behalf of `session`,
    /// replacing the session's previous request for the pair.
    pub fn set_request(&mut self, session: SessionId, property: &str, adaptor: &str, value: i32) {
        self.requests
            .entry((property.to_string(), adaptor.to_string()))
            .or_default()
            .insert(session, value);
    }

    /// Drops every request held by `session` and returns the pairs that were
    /// affected, so their effective values can be recomputed.
    pub fn clear_requests(&mut self, session: SessionId) -> Vec<(String, String)> {
        let mut touched = Vec::new();
        self.requests.retain(|key, sessions| {
            if sessions.remove(&session).is_some() {
                touched.push(key.clone());
            }
            !sessions.is_empty()
        });
        touched
    }

    /// The effective value for a pair: the maximum over all sessions, or
    /// `None` when no request is recorded.
    pub fn highest_value(&self, property: &str, adaptor: &str) -> Option<i32> {
        self.requests
            .get(&(property.to_string(), adaptor.to_string()))
            .and_then(|sessions| sessions.values().max().copied())
    }
}
