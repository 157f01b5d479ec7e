//! Checksum utilities for source change detection

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA256 checksum of source content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum from source text
    pub fn of_content(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    /// Combine several checksums into one.
    ///
    /// The inputs are sorted first, so the result does not depend on the
    /// order they were supplied in.
    pub fn combine<'a>(checksums: impl IntoIterator<Item = &'a Checksum>) -> Self {
        let mut parts: Vec<&str> = checksums.into_iter().map(|c| c.as_str()).collect();
        parts.sort_unstable();
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(b",");
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }

    /// Verify that content matches this checksum
    pub fn verify(&self, content: &str) -> bool {
        Self::of_content(content) == *self
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Checksum {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_consistency() {
        let content = "type FirstName inherits String";
        assert_eq!(Checksum::of_content(content), Checksum::of_content(content));
    }

    #[test]
    fn test_checksum_different_content() {
        let a = Checksum::of_content("type A inherits String");
        let b = Checksum::of_content("type B inherits String");
        assert_ne!(a, b);
    }

    #[test]
    fn test_checksum_verification() {
        let content = "model Person {}";
        let checksum = Checksum::of_content(content);
        assert!(checksum.verify(content));
        assert!(!checksum.verify("model Person { name : String }"));
    }

    #[test]
    fn test_combine_is_order_independent() {
        let a = Checksum::of_content("a");
        let b = Checksum::of_content("b");
        assert_eq!(Checksum::combine([&a, &b]), Checksum::combine([&b, &a]));
        assert_ne!(Checksum::combine([&a]), Checksum::combine([&a, &b]));
    }
}
