//! The persisted shape of a dataset: [`DatasetDescriptor`] and
//! [`ColumnDescriptor`], serialized to `dataset.pickle` via bincode (see
//! [`crate::dataset`]).

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `(major, minor)`. Only major version 2 is writable; version 1 is
/// upgraded transparently on load.
pub type Version = (u32, u32);

pub const CURRENT_VERSION: Version = (2, 1);

/// One column's metadata: its codec, its sanitized name, where its data
/// lives on disk, and the observed min/max across the whole dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Registry key into `ColumnTypeRegistry`.
    pub type_name: String,
    /// Filesystem- and identifier-safe slug, unique within the dataset.
    pub name: String,
    /// Either `"<jobid>/<path-with-%s>"` (per-slice) or `"<jobid>/<path>"`
    /// when `offsets` is set (single merged file).
    pub location: String,
    pub min: Option<Value>,
    pub max: Option<Value>,
    /// `SLICES` byte offsets into the merged file, or `None` pre-merge.
    pub offsets: Option<Vec<u64>>,
}

impl ColumnDescriptor {
    /// Splits `location` into its `(jobid, path)` halves.
    pub fn split_location(&self) -> (&str, &str) {
        self.location.split_once('/').unwrap_or((&self.location, ""))
    }
}

/// The in-memory projection of a persisted dataset dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub version: Version,
    pub filename: Option<String>,
    pub hashlabel: Option<String>,
    pub caption: String,
    pub columns: BTreeMap<String, ColumnDescriptor>,
    pub previous: Option<String>,
    pub parent: Option<String>,
    /// Row count per slice; always `SLICES` entries long.
    pub lines: Vec<u64>,
    /// Snapshots of earlier chain members, inlined every 64 chain hops.
    pub cache: Option<Vec<(String, DatasetDescriptor)>>,
    /// Chain hops since the last inlined cache, in `[0, 63]`.
    pub cache_distance: Option<u8>,
}

impl DatasetDescriptor {
    /// A fresh, empty descriptor for a dataset under construction.
    pub fn new_empty() -> Self {
        Self {
            version: CURRENT_VERSION,
            filename: None,
            hashlabel: None,
            caption: String::new(),
            columns: BTreeMap::new(),
            previous: None,
            parent: None,
            lines: Vec::new(),
            cache: None,
            cache_distance: None,
        }
    }

    pub fn shape(&self) -> (usize, u64) {
        (self.columns.len(), self.lines.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_descriptor_has_current_version() {
        let d = DatasetDescriptor::new_empty();
        assert_eq!(d.version, CURRENT_VERSION);
        assert_eq!(d.shape(), (0, 0));
    }

    #[test]
    fn split_location_separates_jobid_and_path() {
        let dc = ColumnDescriptor {
            type_name: "int64".into(),
            name: "x".into(),
            location: "abc-1/default/x.%s".into(),
            min: None,
            max: None,
            offsets: None,
        };
        assert_eq!(dc.split_location(), ("abc-1", "default/x.%s"));
    }
}
