//! The `Result` alias shared by every chime crate.
//!
//! Errors are `rootcause` reports over a plain context enum. A grid failure
//! starts as a `GridError`, gains a `StoreError` context naming the store
//! operation that hit it, and reaches the node with both layers attached.
//! Key and id parse errors in this crate use the same alias.

use rootcause::Report;

/// A result whose error is a report with context `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ParseKeyError, TriggerKey};

    fn parse_trigger_key(input: &str) -> Result<TriggerKey, ParseKeyError> {
        Ok(input.parse()?)
    }

    #[test]
    fn parse_failure_becomes_a_report() {
        let err = parse_trigger_key("no-group").unwrap_err();
        assert_eq!(
            err.current_context(),
            &ParseKeyError {
                input: "no-group".to_string()
            }
        );
    }

    #[test]
    fn parsed_key_passes_through() {
        let key = parse_trigger_key("reports.daily").unwrap();
        assert_eq!(key, TriggerKey::new("daily", "reports"));
    }
}
