//! Selection of databases on a multi-database server by name pattern.
//!
//! Patterns are case-insensitive regular expressions with lookaround
//! support, so exclusions can be written as `^(?!test_)`.

use fancy_regex::Regex;
use tracing::debug;

fn compile(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match Regex::new(&format!("(?i){pattern}")) {
        Ok(regex) => Some(regex),
        Err(err) => {
            debug!(pattern = %pattern, error = %err, "Database pattern failed to compile");
            None
        }
    }
}

/// Keep the databases whose name matches `pattern` anywhere.
///
/// Input order and casing are preserved. An empty or invalid pattern
/// selects nothing.
pub fn filter_by_pattern(databases: &[String], pattern: &str) -> Vec<String> {
    let Some(regex) = compile(pattern) else {
        return Vec::new();
    };

    databases
        .iter()
        // A match that exceeds the backtrack limit counts as no match
        .filter(|name| regex.is_match(name.as_str()).unwrap_or(false))
        .cloned()
        .collect()
}

/// Whether `pattern` is non-empty and compiles.
pub fn is_valid_pattern(pattern: &str) -> bool {
    compile(pattern).is_some()
}
