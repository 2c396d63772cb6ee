//! Cache key derivation from query text and parameters.
//!
//! Two queries that differ only in whitespace or placeholder syntax sit on
//! the same cache line, so normalization runs before hashing and collisions
//! between functionally identical queries are intentional.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix for derived keys, so they are distinguishable from explicit ones
/// in logs and remote-tier dumps.
const DERIVED_PREFIX: &str = "q:";

/// Separator fed into the hasher between the query text and each parameter.
/// 0x00 cannot appear in the normalized query, so the framing is unambiguous.
const HASH_SEPARATOR: u8 = 0x00;

/// A stable cache key.
///
/// # Design
///
/// The private inner field means a `QueryKey` can only be built through
/// [`QueryKey::derive`] or [`QueryKey::explicit`], so every key in the system
/// went through the same normalization-then-hash pipeline or was deliberately
/// supplied by the caller. An explicit key always wins over derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    inner: String,
}

impl QueryKey {
    /// Derive a deterministic key from query text and its ordered parameters.
    ///
    /// The query is normalized (whitespace collapsed, positional placeholders
    /// canonicalized) before hashing, and each parameter's canonical JSON
    /// encoding is folded into the hash in order. Identical `(query, params)`
    /// always yields an identical key.
    pub fn derive(query: &str, params: &[Value]) -> Self {
        let normalized = normalize_query(query);

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        for param in params {
            hasher.update([HASH_SEPARATOR]);
            hasher.update(param.to_string().as_bytes());
        }

        Self {
            inner: format!("{DERIVED_PREFIX}{}", hex::encode(hasher.finalize())),
        }
    }

    /// Use a caller-supplied key verbatim. Overrides derivation.
    pub fn explicit(key: impl Into<String>) -> Self {
        Self { inner: key.into() }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// True if this key was derived from query text rather than supplied.
    pub fn is_derived(&self) -> bool {
        self.inner.starts_with(DERIVED_PREFIX)
    }

    /// Consume the key, returning the inner string.
    pub fn into_string(self) -> String {
        self.inner
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner)
    }
}

impl From<QueryKey> for String {
    fn from(key: QueryKey) -> Self {
        key.inner
    }
}

/// Normalize query text for key derivation.
///
/// - leading/trailing whitespace is trimmed
/// - interior whitespace runs collapse to a single space
/// - positional placeholders (`$1`, `$23`, `?`) canonicalize to `?`
///
/// Single-quoted string literals pass through untouched, including their
/// whitespace, so `WHERE name = 'a  b'` keeps its meaning. Normalization is
/// purely lexical; the cache never parses SQL.
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut in_literal = false;
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if in_literal {
            out.push(c);
            if c == '\'' {
                in_literal = false;
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }

        if pending_space {
            if !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
        }

        match c {
            '\'' => {
                in_literal = true;
                out.push(c);
            }
            '$' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                    chars.next();
                }
                out.push('?');
            }
            _ => out.push(c),
        }
    }

    out
}
