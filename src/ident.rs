//! Identifier handling.
//!
//! Logical sensor identifiers may carry construction parameters:
//! `name[;key=value;key=value...]`. Parameters are honoured when the sensor
//! is constructed and stripped before any registry lookup. Chain and adaptor
//! identifiers never carry parameters; the stores assert this.

use std::collections::HashMap;

use tracing::warn;

/// Strips any `;key=value` parameter suffix, leaving the registry key.
pub fn clean_id(id: &str) -> String {
    match id.find(';') {
        Some(pos) => id[..pos].to_string(),
        None => id.to_string(),
    }
}

/// True when the identifier carries a parameter suffix.
pub fn has_parameters(id: &str) -> bool {
    id.contains(';')
}

/// Parses the `;key=value` pairs of an identifier.
///
/// Malformed pairs (missing `=`, empty key or value) are skipped with a
/// warning; the remaining pairs are still returned.
pub fn parse_parameters(id: &str) -> HashMap<String, String> {
    let mut parameters = HashMap::new();
    for pair in id.split(';').skip(1) {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                parameters.insert(key.to_string(), value.to_string());
            }
            _ => warn!(id, pair, "ignoring malformed identifier parameter"),
        }
    }
    parameters
}
