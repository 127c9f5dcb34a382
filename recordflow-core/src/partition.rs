//! Hive style partition keys. A record declares an ordered list of key/value pairs which is rendered
//! as `key1=val1/key2=val2`, keys and values percent-encoded, and used both to group records for
//! sorting and to build the output path of their writer.

use std::collections::HashMap;
use std::fmt;

use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Renders the pair as a single `key=value` path segment.
    pub fn to_segment(&self) -> String {
        format!(
            "{}={}",
            urlencoding::encode(&self.key),
            urlencoding::encode(&self.value)
        )
    }

    /// Parses one `key=value` path segment.
    pub fn from_segment(segment: &str) -> Result<Self> {
        let invalid = || {
            Error::Partition(format!(
                "invalid partition segment '{segment}', expected encoded key=value"
            ))
        };

        let (key, value) = segment.split_once('=').ok_or_else(invalid)?;
        // the encoded form never contains a literal '='
        if value.contains('=') {
            return Err(invalid());
        }
        let key = urlencoding::decode(key).map_err(|_| invalid())?;
        let value = urlencoding::decode(value).map_err(|_| invalid())?;
        Ok(Self::new(key, value))
    }
}

/// KeyValues is an ordered list of partition pairs. Unlike a map, the order of the pairs is the
/// order of the path segments.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default)]
pub struct KeyValues(pub Vec<KeyValue>);

impl KeyValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push(KeyValue::new(key, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Formats the pairs as `key1=val1/key2=val2`. An empty list renders as an empty string.
    pub fn to_partition_path(&self) -> String {
        self.0
            .iter()
            .map(KeyValue::to_segment)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Collects every valid `key=value` segment of `path`. Segments that are not partitions
    /// (bucket names, file names, ...) are skipped.
    pub fn from_path(path: &str) -> Self {
        Self(
            path.split('/')
                .filter_map(|segment| KeyValue::from_segment(segment).ok())
                .collect(),
        )
    }

    /// Later pairs win when a key shows up more than once.
    pub fn as_map(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }

    /// Whether every pair is present in `path` as a `key=value/` segment. Only exact matches count.
    pub fn matches(&self, path: &str) -> bool {
        self.0
            .iter()
            .all(|kv| path.contains(&format!("{}/", kv.to_segment())))
    }
}

impl fmt::Display for KeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_partition_path())
    }
}

impl From<Vec<KeyValue>> for KeyValues {
    fn from(pairs: Vec<KeyValue>) -> Self {
        Self(pairs)
    }
}

/// Partitioned is implemented by records that know how they want to be grouped. Records that keep
/// the default all land in the single, empty partition.
pub trait Partitioned {
    fn partition_key(&self) -> Result<KeyValues> {
        Ok(KeyValues::default())
    }
}
