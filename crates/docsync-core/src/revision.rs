//! Revision codec
//!
//! Every stored document carries a `_rev` of the form `<height>-<hash>`.
//! The height counts accepted writes for the document's lifeline, the hash
//! identifies the writer (database token, replication identifier or
//! migrated content).

use crate::document::DocumentData;
use crate::{Error, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::fmt;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_64;

/// Parsed `<height>-<hash>` revision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    /// Number of accepted writes, starting at 1
    pub height: u64,
    /// Writer or content token
    pub hash: String,
}

impl Revision {
    /// Build a revision from its parts
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(rev: &str) -> Result<Self> {
        parse_revision(rev)
    }
}

/// Split a revision string on its single `-` separator
pub fn parse_revision(rev: &str) -> Result<Revision> {
    let mut parts = rev.split('-');
    let (Some(height), Some(hash), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::MalformedRevision(rev.to_string()));
    };
    let height = height
        .parse::<u64>()
        .map_err(|_| Error::MalformedRevision(rev.to_string()))?;
    Ok(Revision::new(height, hash))
}

/// Height component of a revision string
pub fn revision_height(rev: &str) -> Result<u64> {
    Ok(parse_revision(rev)?.height)
}

/// Hash component of a revision string, `None` when malformed
pub fn revision_hash(rev: &str) -> Option<String> {
    parse_revision(rev).ok().map(|r| r.hash)
}

/// Next revision for a write on top of `previous`
///
/// Deterministic: identical token and previous state always produce the
/// same revision string.
pub fn create_revision(writer_token: &str, previous: Option<&DocumentData>) -> Result<String> {
    if writer_token.is_empty() || writer_token.contains('-') {
        return Err(Error::validation(format!(
            "revision token '{writer_token}' must be non-empty and contain no '-'"
        )));
    }
    let height = match previous {
        Some(prev) => revision_height(&prev.rev)? + 1,
        None => 1,
    };
    Ok(Revision::new(height, writer_token).to_string())
}

/// Random lowercase alphanumeric token
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Stable hex hash of an arbitrary string, usable as a revision token
pub fn hash_token(input: &str) -> String {
    format!("{:016x}", xxh3_64(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_revision() {
        let rev = parse_revision("12-abcdef").unwrap();
        assert_eq!(rev.height, 12);
        assert_eq!(rev.hash, "abcdef");
        assert_eq!(rev.to_string(), "12-abcdef");
    }

    #[test]
    fn test_parse_malformed() {
        for bad in ["", "12", "a-b", "1-2-3", "-x"] {
            assert!(
                matches!(parse_revision(bad), Err(Error::MalformedRevision(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_create_revision_heights() {
        let first = create_revision("tok", None).unwrap();
        assert_eq!(first, "1-tok");

        let mut doc = DocumentData::default();
        doc.rev = first;
        assert_eq!(create_revision("other", Some(&doc)).unwrap(), "2-other");
    }

    #[test]
    fn test_create_revision_rejects_bad_token() {
        assert!(create_revision("", None).is_err());
        assert!(create_revision("a-b", None).is_err());
    }

    #[test]
    fn test_tokens() {
        let token = random_token(10);
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(hash_token("replication"), hash_token("replication"));
        assert_ne!(hash_token("a"), hash_token("b"));
    }

    proptest! {
        #[test]
        fn prop_height_increases_by_one(writes in 1usize..40, token in "[a-z0-9]{1,12}") {
            let mut doc = DocumentData::default();
            let mut previous: Option<DocumentData> = None;
            for expected in 1..=writes as u64 {
                doc.rev = create_revision(&token, previous.as_ref()).unwrap();
                prop_assert_eq!(revision_height(&doc.rev).unwrap(), expected);
                previous = Some(doc.clone());
            }
        }
    }
}
