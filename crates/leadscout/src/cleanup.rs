//! Best-effort cleanup.

use std::fmt::Display;

/// Runs a cleanup step whose failure must not abort the caller.
///
/// Errors are logged at `warn` under `label` and swallowed.
pub fn non_fatal<T, E, F>(label: &str, f: F) -> Option<T>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    match f() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("{} failed (ignored): {}", label, e);
            None
        }
    }
}
