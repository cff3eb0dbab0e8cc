//! Core identifiers for the stampede build client.

use serde::{Deserialize, Serialize};

/// Fully-qualified build target, e.g. `//lib/core:core` or `cell//app:bin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTarget(String);

impl BuildTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the final `:` (used e.g. for `last/` symlink names).
    pub fn short_name(&self) -> &str {
        match self.0.rsplit_once(':') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }

    /// The cell prefix before `//`, empty for the root cell.
    pub fn cell_name(&self) -> &str {
        match self.0.split_once("//") {
            Some((cell, _)) => cell,
            None => "",
        }
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BuildTarget {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Stable small integer assigned to a cell root, in first-seen order.
///
/// The root cell always holds index 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct CellIndex(pub u32);

impl CellIndex {
    pub const ROOT: CellIndex = CellIndex(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CellIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier the coordinator assigns to a distributed build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StampedeId(pub String);

impl StampedeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StampedeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-length content digest of a rule's inputs.
///
/// Identical inputs yield byte-identical keys on any host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey([u8; 32]);

impl RuleKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn parse_hex(s: &str) -> Result<Self, HexError> {
        Ok(Self(hex::decode_fixed(s)?))
    }
}

impl std::fmt::Display for RuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for RuleKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RuleKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 digest of a file's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHash([u8; 32]);

impl FileHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn parse_hex(s: &str) -> Result<Self, HexError> {
        Ok(Self(hex::decode_fixed(s)?))
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for FileHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Mode requested from the remote coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistBuildMode {
    /// Remote workers build everything reachable from the top-level targets.
    #[default]
    RemoteBuild,
    /// Remote workers also materialize transitive outputs.
    DeepRemoteBuild,
}

impl std::fmt::Display for DistBuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteBuild => write!(f, "remote_build"),
            Self::DeepRemoteBuild => write!(f, "deep_remote_build"),
        }
    }
}

/// Output-materialization mode for the local build engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalBuildMode {
    /// Make the output of all transitive dependencies available.
    Deep,
    /// Only make the outputs of explicitly listed targets available.
    Shallow,
    /// Fetch unchanged outputs from the remote cache, build nothing locally.
    PopulateCache,
}

/// Invalid hex input for a fixed-length digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("expected {expected} hex chars, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("invalid hex char '{0}'")]
    BadChar(char),
}

/// Minimal hex codec for 32-byte digests; avoids pulling in a crate for
/// two functions.
pub(crate) mod hex {
    use super::HexError;

    const ALPHABET: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(ALPHABET[(b >> 4) as usize] as char);
            out.push(ALPHABET[(b & 0x0f) as usize] as char);
        }
        out
    }

    pub fn decode_fixed(s: &str) -> Result<[u8; 32], HexError> {
        if s.len() != 64 {
            return Err(HexError::BadLength {
                expected: 64,
                got: s.len(),
            });
        }
        let mut out = [0u8; 32];
        let mut chars = s.chars();
        for slot in out.iter_mut() {
            let hi = nibble(chars.next().unwrap_or('\0'))?;
            let lo = nibble(chars.next().unwrap_or('\0'))?;
            *slot = (hi << 4) | lo;
        }
        Ok(out)
    }

    fn nibble(c: char) -> Result<u8, HexError> {
        match c {
            '0'..='9' => Ok(c as u8 - b'0'),
            'a'..='f' => Ok(c as u8 - b'a' + 10),
            'A'..='F' => Ok(c as u8 - b'A' + 10),
            _ => Err(HexError::BadChar(c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_target_short_name() {
        assert_eq!(BuildTarget::new("//foo/bar:baz").short_name(), "baz");
        assert_eq!(BuildTarget::new("plain").short_name(), "plain");
    }

    #[test]
    fn test_build_target_cell_name() {
        assert_eq!(BuildTarget::new("//foo:bar").cell_name(), "");
        assert_eq!(BuildTarget::new("other//foo:bar").cell_name(), "other");
    }

    #[test]
    fn test_rule_key_hex_round_trip() {
        let key = RuleKey::from_bytes([0xab; 32]);
        let parsed = RuleKey::parse_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_rule_key_rejects_bad_hex() {
        assert!(matches!(
            RuleKey::parse_hex("zz"),
            Err(HexError::BadLength { .. })
        ));
        let bad = "g".repeat(64);
        assert!(matches!(
            RuleKey::parse_hex(&bad),
            Err(HexError::BadChar('g'))
        ));
    }

    #[test]
    fn test_file_hash_serde_is_hex_string() {
        let hash = FileHash::from_bytes([0x01; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: FileHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn test_cell_index_root_is_zero() {
        assert_eq!(CellIndex::ROOT.as_u32(), 0);
    }

    #[test]
    fn test_dist_build_mode_serde() {
        let json = serde_json::to_string(&DistBuildMode::RemoteBuild).unwrap();
        assert_eq!(json, "\"remote_build\"");
    }
}
