//! Entity-name rules.
//!
//! Names of scenes, projects, scene objects, action points, actions and
//! parameters end up as identifiers in generated program sources, so they
//! must be valid snake_case identifiers and must not collide with a
//! reserved word.

use crate::error::{Error, Result};

/// Reserved words of the script target language plus a few identifiers
/// the generated runtime claims for itself.
const RESERVED: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield", "print",
    "resources", "action_points", "scene", "project",
];

/// `true` for a non-empty snake_case identifier that is not reserved.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    head_ok
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&name)
}

/// Validate a user-supplied entity name, naming the offending entity kind
/// in the error message.
pub fn ensure_valid_name(kind: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid {kind} name: '{name}' (snake_case identifier required)."
        )))
    }
}

/// Object type ids are class-like: CamelCase, ASCII alphanumeric.
pub fn is_valid_type_id(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && id.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_accepted() {
        assert!(is_valid_name("gripper_left"));
        assert!(is_valid_name("_hidden"));
        assert!(is_valid_name("ap1"));
    }

    #[test]
    fn invalid_names_rejected() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("CamelCase"));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name("1starts_with_digit"));
        assert!(!is_valid_name("kebab-case"));
    }

    #[test]
    fn reserved_words_rejected() {
        assert!(!is_valid_name("class"));
        assert!(!is_valid_name("resources"));
    }

    #[test]
    fn type_ids() {
        assert!(is_valid_type_id("RandomActions"));
        assert!(!is_valid_type_id("random_actions"));
        assert!(!is_valid_type_id("Bad-Type"));
    }
}
