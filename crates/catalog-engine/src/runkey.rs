//! Run-key normalization (`spec.md` §4.8).

use catalog_core::{EngineError, ErrorKind};

/// Normalizes a user-supplied run key: trim, lowercase, collapse internal
/// whitespace runs to a single `-`, reject empty. The normalized form is
/// what the partial unique index on `workflow_runs` actually enforces
/// uniqueness over — two run keys that differ only by case or whitespace
/// collide.
pub fn normalize(raw: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::new(ErrorKind::Validation, "runKey must not be empty"));
    }

    let mut normalized = String::with_capacity(trimmed.len());
    let mut last_was_space = false;
    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                normalized.push('-');
                last_was_space = true;
            }
        } else {
            normalized.push(ch.to_ascii_lowercase());
            last_was_space = false;
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_lowercases() {
        assert_eq!(normalize("  Daily-2025-01-05  ").unwrap(), "daily-2025-01-05");
    }

    #[test]
    fn collapses_internal_whitespace() {
        assert_eq!(normalize("daily   run   key").unwrap(), "daily-run-key");
        assert_eq!(normalize("daily\t run\nkey").unwrap(), "daily-run-key");
    }

    #[test]
    fn rejects_empty_or_whitespace_only() {
        assert!(normalize("").is_err());
        assert!(normalize("   ").is_err());
    }

    #[test]
    fn distinct_keys_that_differ_only_by_case_collide() {
        assert_eq!(normalize("Daily-2025-01-05").unwrap(), normalize("daily-2025-01-05").unwrap());
    }
}
