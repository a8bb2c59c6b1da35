//! Call metadata and the gRPC timeout header format.

use crate::error::CoreError;
use std::time::Duration;

/// Ordered metadata key/value pairs.
///
/// Unlike HTTP headers, gRPC custom metadata ordering is meaningful to
/// hosts, so entries are kept in insertion order and written to the wire
/// in that order. Keys are normalized to lowercase ASCII; duplicate keys
/// are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a flat alternating `[key, value, key, value, ...]` list,
    /// the shape scripting hosts hand over.
    ///
    /// An odd-length list is a configuration error.
    pub fn from_flat<S: AsRef<str>>(flat: &[S]) -> Result<Self, CoreError> {
        if flat.len() % 2 != 0 {
            return Err(CoreError::Metadata(format!(
                "metadata list must have even length, got {}",
                flat.len()
            )));
        }
        let mut metadata = Metadata::new();
        for pair in flat.chunks_exact(2) {
            metadata.insert(pair[0].as_ref(), pair[1].as_ref());
        }
        Ok(metadata)
    }

    /// Append an entry, preserving order. The key is lowercased.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// First value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a key, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

impl<'a> Extend<(&'a str, &'a str)> for Metadata {
    fn extend<T: IntoIterator<Item = (&'a str, &'a str)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

/// A call deadline in the `grpc-timeout` header encoding.
///
/// Format: `<value><unit>` with units `n` (nanoseconds), `u`
/// (microseconds), `m` (milliseconds), `S`, `M`, `H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    nanos: u64,
}

/// Unit table ordered largest first: (nanos per unit, suffix).
const UNITS: [(u64, char); 6] = [
    (3_600_000_000_000, 'H'),
    (60_000_000_000, 'M'),
    (1_000_000_000, 'S'),
    (1_000_000, 'm'),
    (1_000, 'u'),
    (1, 'n'),
];

impl Timeout {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs.saturating_mul(1_000_000_000),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.nanos)
    }

    /// Encode for the `grpc-timeout` header, using the largest unit that
    /// divides the value exactly.
    pub fn to_grpc_format(self) -> String {
        for (per_unit, suffix) in UNITS {
            if self.nanos >= per_unit && self.nanos % per_unit == 0 {
                return format!("{}{}", self.nanos / per_unit, suffix);
            }
        }
        format!("{}n", self.nanos)
    }

    /// Parse a `grpc-timeout` header value.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 2 {
            return None;
        }
        let (value, unit) = s.split_at(s.len() - 1);
        let value: u64 = value.parse().ok()?;
        let unit = unit.chars().next()?;
        let per_unit = UNITS
            .iter()
            .find(|(_, suffix)| *suffix == unit)
            .map(|(n, _)| *n)?;
        Some(Self {
            nanos: value.saturating_mul(per_unit),
        })
    }
}
