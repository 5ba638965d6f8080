#![forbid(unsafe_code)]

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Terminates the scope segment so that one id's prefix never matches another id.
pub const SCOPE_TERMINATOR: char = '|';

const DIGEST_BYTES: usize = 16;

pub mod ops {
    pub const BY_TAG: &str = "by_tag";
    pub const BY_TAGS: &str = "by_tags";
    pub const CHUNK_TAGS: &str = "chunk_tags";
    pub const CHILDREN: &str = "children";
    pub const DESCENDANTS: &str = "descendants";
    pub const ANCESTORS: &str = "ancestors";
    pub const SEARCH: &str = "search";
}

/// `<op>:<scope>|<digest>`; an empty scope is used for unscoped operations.
pub fn cache_key(op: &str, scope: &str, params: &Value) -> String {
    format!("{}{}", scope_prefix(op, scope), params_digest(params))
}

pub fn scope_prefix(op: &str, scope: &str) -> String {
    format!("{op}:{scope}{SCOPE_TERMINATOR}")
}

pub fn op_prefix(op: &str) -> String {
    format!("{op}:")
}

/// Truncated SHA-256 over the canonical JSON of the remaining parameters.
pub fn params_digest(params: &Value) -> String {
    let hash = Sha256::digest(params.to_string().as_bytes());
    hash.iter()
        .take(DIGEST_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_layout_and_prefixes() {
        let key = cache_key(ops::BY_TAG, "t1", &json!({"limit": 10, "offset": 0}));
        assert!(key.starts_with("by_tag:t1|"));
        assert_eq!(key.len(), "by_tag:t1|".len() + DIGEST_BYTES * 2);
        assert!(key.starts_with(&scope_prefix(ops::BY_TAG, "t1")));
        assert!(!key.starts_with(&scope_prefix(ops::BY_TAG, "t")));
        assert!(!key.starts_with(&op_prefix(ops::BY_TAGS)));
    }

    #[test]
    fn digest_ignores_object_key_order() {
        let a = json!({"offset": 0, "limit": 5});
        let b = json!({"limit": 5, "offset": 0});
        assert_eq!(params_digest(&a), params_digest(&b));
        assert_ne!(params_digest(&a), params_digest(&json!({"limit": 6, "offset": 0})));
    }
}
