//! RPC metadata (headers and trailers).
//!
//! Metadata is an ordered multimap of lowercase ASCII keys to values. Keys
//! ending in `-bin` carry opaque bytes that travel base64-encoded on the
//! wire; all other keys carry printable-ASCII strings.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};

/// Base64 engine for `-bin` values: standard alphabet, padding optional on
/// decode (peers are allowed to omit it).
const WIRE_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable-ASCII string value (non-`-bin` keys).
    Ascii(String),
    /// Opaque byte value (`-bin` keys).
    Binary(Vec<u8>),
}

impl MetadataValue {
    /// Get the string form, if this is an ASCII value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    /// Get the byte form, if this is a binary value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Ascii(_) => None,
            MetadataValue::Binary(b) => Some(b),
        }
    }
}

/// Validation error raised to the caller on an illegal key or value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),
    #[error("invalid value for key {0:?}: not printable ASCII")]
    InvalidAsciiValue(String),
    #[error("key {0:?} requires a binary value")]
    ExpectedBinaryValue(String),
    #[error("key {0:?} requires an ASCII value")]
    ExpectedAsciiValue(String),
}

/// Per-entry decode problem reported out-of-band; the offending entry is
/// skipped and the call continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode metadata entry {key:?}: {reason}")]
pub struct MetadataDecodeError {
    pub key: String,
    pub reason: String,
}

/// Ordered multimap of metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

/// Check key shape: nonempty, `[0-9a-z_.-]+` after lowercasing.
fn validate_key(key: &str) -> Result<String, MetadataError> {
    let key = key.to_ascii_lowercase();
    if key.is_empty()
        || !key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err(MetadataError::InvalidKey(key));
    }
    Ok(key)
}

fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

fn validate_ascii_value(key: &str, value: &str) -> Result<(), MetadataError> {
    if value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        Ok(())
    } else {
        Err(MetadataError::InvalidAsciiValue(key.to_owned()))
    }
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string value for a non-`-bin` key.
    pub fn add(&mut self, key: &str, value: impl Into<String>) -> Result<(), MetadataError> {
        let key = validate_key(key)?;
        if is_binary_key(&key) {
            return Err(MetadataError::ExpectedBinaryValue(key));
        }
        let value = value.into();
        validate_ascii_value(&key, &value)?;
        self.entries.push((key, MetadataValue::Ascii(value)));
        Ok(())
    }

    /// Append a byte value for a `-bin` key.
    pub fn add_bin(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), MetadataError> {
        let key = validate_key(key)?;
        if !is_binary_key(&key) {
            return Err(MetadataError::ExpectedAsciiValue(key));
        }
        self.entries.push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// Replace all values for a non-`-bin` key.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), MetadataError> {
        let normalized = validate_key(key)?;
        self.entries.retain(|(k, _)| *k != normalized);
        self.add(&normalized, value)
    }

    /// Replace all values for a `-bin` key.
    pub fn set_bin(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), MetadataError> {
        let normalized = validate_key(key)?;
        self.entries.retain(|(k, _)| *k != normalized);
        self.add_bin(&normalized, value)
    }

    /// Drop all values for a key.
    pub fn remove(&mut self, key: &str) -> Result<(), MetadataError> {
        let normalized = validate_key(key)?;
        self.entries.retain(|(k, _)| *k != normalized);
        Ok(())
    }

    /// Get all values for a key. Never fails; empty when absent.
    pub fn get(&self, key: &str) -> Vec<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .collect()
    }

    /// Get the first string value for a key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).into_iter().find_map(|v| v.as_str())
    }

    /// Get the first byte value for a key.
    pub fn get_bin(&self, key: &str) -> Option<&[u8]> {
        self.get(key).into_iter().find_map(|v| v.as_bytes())
    }

    /// Check if a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Concatenate another metadata's values into self, per key.
    pub fn merge(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check if metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries (including duplicates).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Serialize to wire header pairs, one pair per value.
    ///
    /// Binary values are base64-encoded; ASCII values pass through.
    pub fn to_wire(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| {
                let wire_value = match v {
                    MetadataValue::Ascii(s) => s.clone(),
                    MetadataValue::Binary(b) => WIRE_B64.encode(b),
                };
                (k.clone(), wire_value)
            })
            .collect()
    }

    /// Deserialize from wire header pairs.
    ///
    /// Pseudo-headers (`:`-prefixed) are stripped. A `-bin` value arriving
    /// as a comma-joined string is split and each piece base64-decoded
    /// independently. Undecodable entries are skipped and reported in the
    /// returned error list.
    pub fn from_wire<'a, I>(pairs: I) -> (Self, Vec<MetadataDecodeError>)
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut metadata = Metadata::new();
        let mut errors = Vec::new();

        for (name, value) in pairs {
            if name.starts_with(':') {
                continue;
            }
            let key = match validate_key(name) {
                Ok(k) => k,
                Err(e) => {
                    errors.push(MetadataDecodeError {
                        key: name.to_owned(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if is_binary_key(&key) {
                let Ok(joined) = std::str::from_utf8(value) else {
                    errors.push(MetadataDecodeError {
                        key,
                        reason: "binary value is not valid base64 text".into(),
                    });
                    continue;
                };
                for piece in joined.split(',') {
                    match WIRE_B64.decode(piece.trim()) {
                        Ok(bytes) => metadata.entries.push((key.clone(), MetadataValue::Binary(bytes))),
                        Err(e) => errors.push(MetadataDecodeError {
                            key: key.clone(),
                            reason: format!("base64 decode failed: {}", e),
                        }),
                    }
                }
            } else {
                match std::str::from_utf8(value) {
                    Ok(s) if validate_ascii_value(&key, s).is_ok() => {
                        metadata.entries.push((key, MetadataValue::Ascii(s.to_owned())));
                    }
                    _ => errors.push(MetadataDecodeError {
                        key,
                        reason: "value is not printable ASCII".into(),
                    }),
                }
            }
        }

        (metadata, errors)
    }
}
