//! Content-addressed names.
//!
//! Every object in the system is identified by a [`Hash`]: a type tag, the
//! hex sha-256 digest of the content, and the content length in bytes. The
//! tag tells the scheduler whether a name still needs reduction (`T`) or is
//! already a terminal blob (`V` plain value, `X` executable).
//!
//! A name may additionally carry an `#tag` suffix, which refers to one
//! declared output of a thunk *before* that output's concrete hash is known.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// What a hash names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// A computation that still needs reduction.
    Thunk,
    /// A terminal blob.
    Value,
    /// A terminal blob carrying the executable bit.
    Executable,
}

impl ObjectType {
    fn tag(self) -> char {
        match self {
            ObjectType::Thunk => 'T',
            ObjectType::Value => 'V',
            ObjectType::Executable => 'X',
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    #[error("hash '{0}' is too short")]
    TooShort(String),

    #[error("hash '{0}' has unknown type tag '{1}'")]
    UnknownTag(String, char),

    #[error("hash '{0}' has a malformed digest")]
    BadDigest(String),

    #[error("hash '{0}' has a malformed size suffix")]
    BadSize(String),

    #[error("hash '{0}' has an empty output tag")]
    EmptyOutputTag(String),
}

const DIGEST_LEN: usize = 64;

/// A validated content-addressed name.
///
/// The wire form is `<tag><64 hex chars><decimal size>[#<output tag>]`.
/// Hashes are immutable, cheap to clone, and compare by value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash(String);

impl Hash {
    /// Names `bytes` by content.
    pub fn of_bytes(kind: ObjectType, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        let digest = Sha256::digest(bytes);
        let mut name = String::with_capacity(1 + DIGEST_LEN + 20);
        name.push(kind.tag());
        name.push_str(&hex(&digest));
        name.push_str(&bytes.len().to_string());
        Hash(name)
    }

    /// Parses and validates a wire-form name.
    pub fn parse(s: &str) -> Result<Self, HashError> {
        let (base, tag) = match s.split_once('#') {
            Some((base, tag)) => (base, Some(tag)),
            None => (s, None),
        };

        if let Some(tag) = tag
            && tag.is_empty()
        {
            return Err(HashError::EmptyOutputTag(s.to_string()));
        }

        if !base.is_ascii() || base.len() < 1 + DIGEST_LEN + 1 {
            return Err(HashError::TooShort(s.to_string()));
        }

        let kind = base.chars().next().unwrap_or('?');
        if !matches!(kind, 'T' | 'V' | 'X') {
            return Err(HashError::UnknownTag(s.to_string(), kind));
        }

        let digest = &base[1..1 + DIGEST_LEN];
        if !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::BadDigest(s.to_string()));
        }

        let size = &base[1 + DIGEST_LEN..];
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HashError::BadSize(s.to_string()));
        }

        Ok(Hash(s.to_string()))
    }

    /// The object type of this name. A tagged reference `h#tag` names a
    /// not-yet-reduced output, so it classifies by its base.
    pub fn object_type(&self) -> ObjectType {
        match self.0.as_bytes()[0] {
            b'V' => ObjectType::Value,
            b'X' => ObjectType::Executable,
            _ => ObjectType::Thunk,
        }
    }

    pub fn is_thunk(&self) -> bool {
        self.object_type() == ObjectType::Thunk
    }

    /// True for names that need no further reduction.
    pub fn is_terminal(&self) -> bool {
        !self.is_thunk()
    }

    /// The content length embedded in the name.
    pub fn size(&self) -> u64 {
        self.base()[1 + DIGEST_LEN..].parse().unwrap_or(0)
    }

    /// The hex digest portion of the name.
    pub fn digest(&self) -> &str {
        &self.base()[1..1 + DIGEST_LEN]
    }

    /// The name without any `#tag` suffix.
    pub fn base(&self) -> &str {
        match self.0.split_once('#') {
            Some((base, _)) => base,
            None => &self.0,
        }
    }

    /// The output tag, when this name refers to a specific thunk output.
    pub fn output_tag(&self) -> Option<&str> {
        self.0.split_once('#').map(|(_, tag)| tag)
    }

    /// The untagged name of the underlying object.
    pub fn to_base(&self) -> Hash {
        match self.0.split_once('#') {
            Some((base, _)) => Hash(base.to_string()),
            None => self.clone(),
        }
    }

    /// The name under which the output `tag` of this thunk is cached.
    pub fn for_output(&self, tag: &str) -> Hash {
        Hash(format!("{}#{}", self.base(), tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.0)
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::parse(s)
    }
}

impl TryFrom<String> for Hash {
    type Error = HashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Hash::parse(&s)
    }
}

impl From<Hash> for String {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut acc = vec![0u8; bytes.len() * 2];

    for (i, &byte) in bytes.iter().enumerate() {
        acc[i * 2] = HEX[(byte >> 4) as usize];
        acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
    }

    String::from_utf8(acc).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_embed_type_and_size() {
        let hash = Hash::of_bytes(ObjectType::Value, b"hello");
        assert_eq!(hash.object_type(), ObjectType::Value);
        assert_eq!(hash.size(), 5);
        assert!(hash.is_terminal());

        let hash = Hash::of_bytes(ObjectType::Thunk, b"");
        assert_eq!(hash.size(), 0);
        assert!(hash.is_thunk());
    }

    #[test]
    fn equal_content_equal_name() {
        let a = Hash::of_bytes(ObjectType::Executable, b"binary");
        let b = Hash::of_bytes(ObjectType::Executable, b"binary");
        assert_eq!(a, b);

        let c = Hash::of_bytes(ObjectType::Value, b"binary");
        assert_ne!(a, c);
    }

    #[test]
    fn parse_round_trips() {
        let hash = Hash::of_bytes(ObjectType::Value, b"content");
        let parsed = Hash::parse(hash.as_str()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Hash::parse("V0123").is_err());
        assert!(Hash::parse(&format!("Q{}7", "a".repeat(64))).is_err());
        assert!(Hash::parse(&format!("T{}zz", "a".repeat(64))).is_err());
        assert!(Hash::parse(&format!("T{}", "a".repeat(64))).is_err());
        assert!(Hash::parse(&format!("T{}7#", "a".repeat(64))).is_err());
    }

    #[test]
    fn tagged_references_classify_by_base() {
        let thunk = Hash::of_bytes(ObjectType::Thunk, b"thunk");
        let out = thunk.for_output("out");

        assert!(out.is_thunk());
        assert_eq!(out.output_tag(), Some("out"));
        assert_eq!(out.base(), thunk.as_str());
        assert_eq!(out.size(), thunk.size());

        let parsed = Hash::parse(out.as_str()).unwrap();
        assert_eq!(parsed, out);
    }
}
