// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Family hashing: a short stable key grouping recurrences of the same event.
//!
//! Components are order-sensitive, so callers fix the component order per
//! entry type (the payload module always leads with the type name).
//!
//! ```
//! use scope_recorder::family::family_hash;
//!
//! let a = family_hash(["exception", "NoMethodError", "app/models/user.rb", "42"]);
//! let b = family_hash(["exception", "NoMethodError", "app/models/user.rb", "42"]);
//! assert_eq!(a, b);
//! assert_eq!(a.as_deref().map(str::len), Some(16));
//! assert_eq!(family_hash(["", ""]), None);
//! ```

use sha2::{Digest, Sha256};

/// Unit separator; cannot appear in ordinary class names, paths or SQL.
const SEPARATOR: &str = "\u{1f}";

/// Hex characters kept from the digest.
pub const FAMILY_HASH_LEN: usize = 16;

/// Hash the non-empty components in order. `None` when all are empty.
pub fn family_hash<I, S>(components: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let parts: Vec<S> = components
        .into_iter()
        .filter(|c| !c.as_ref().is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(SEPARATOR.as_bytes());
        }
        hasher.update(part.as_ref().as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FAMILY_HASH_LEN);
    Some(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = family_hash(["query", "SELECT * FROM users WHERE id = ?"]);
        let b = family_hash(["query", "SELECT * FROM users WHERE id = ?"]);
        assert_eq!(a, b);
        assert!(a.unwrap().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_order_sensitive() {
        assert_ne!(family_hash(["A", "B"]), family_hash(["B", "A"]));
    }

    #[test]
    fn test_all_empty_is_none() {
        assert_eq!(family_hash(Vec::<String>::new()), None);
        assert_eq!(family_hash(["", ""]), None);
    }

    #[test]
    fn test_empty_components_are_skipped() {
        assert_eq!(family_hash(["view", "", "users/index"]), family_hash(["view", "users/index"]));
    }

    #[test]
    fn test_separator_prevents_concatenation_collisions() {
        assert_ne!(family_hash(["ab", "c"]), family_hash(["a", "bc"]));
    }
}
