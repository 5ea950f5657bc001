//! [`JobRef`]/[`JobList`]/[`Record`]: the driver's job-identity types.
//!
//! The Python original makes these decay to plain strings (a `JobTuple`
//! subclasses `unicode`) so a job reference can flow into either a tagged
//! record or a bare jobid interpolation. Per the Design Notes, this crate
//! keeps them as explicit structs with `.jobid()`/`.id()` projections
//! instead of overloading string coercion.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(method, jobid)` pair. Equality and hashing use both fields;
/// stringifying yields the jobid alone (`.id()`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub method: String,
    pub jobid: String,
}

impl JobRef {
    pub fn new(method: impl Into<String>, jobid: impl Into<String>) -> Self {
        Self { method: method.into(), jobid: jobid.into() }
    }

    /// A bare jobid with no method, as produced by appending a plain
    /// string to a `JobList`.
    pub fn bare(jobid: impl Into<String>) -> Self {
        Self { method: String::new(), jobid: jobid.into() }
    }

    /// The jobid alone -- this is what the original's string coercion
    /// yields when a `JobTuple` is used where a bare jobid is expected.
    pub fn id(&self) -> &str {
        &self.jobid
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.jobid)
    }
}

/// Ordered sequence of [`JobRef`]; duplicates allowed, insertion order
/// preserved. Single-owner: no internal locking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobList(Vec<JobRef>);

impl JobList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, JobRef> {
        self.0.iter()
    }

    pub fn push(&mut self, entry: JobRef) {
        self.0.push(entry);
    }

    /// Appends a bare jobid (empty method), mirroring the original's
    /// "append accepts ... a bare string" construction rule.
    pub fn push_jobid(&mut self, jobid: impl Into<String>) {
        self.0.push(JobRef::bare(jobid));
    }

    /// Scalar projection: the jobid of the last element, or `""` if empty.
    pub fn scalar(&self) -> &str {
        self.0.last().map(|j| j.jobid.as_str()).unwrap_or("")
    }

    /// Comma-separated jobids in order.
    pub fn all(&self) -> String {
        self.0.iter().map(|j| j.jobid.as_str()).collect::<Vec<_>>().join(",")
    }

    /// A new `JobList` of entries whose method matches `method`, in
    /// original order.
    pub fn find(&self, method: &str) -> JobList {
        JobList(self.0.iter().filter(|j| j.method == method).cloned().collect())
    }

    /// The LAST entry whose method is `method`; `None` if there isn't one.
    pub fn by_method(&self, method: &str) -> Option<&JobRef> {
        self.0.iter().rev().find(|j| j.method == method)
    }

    pub fn get(&self, index: usize) -> Option<&JobRef> {
        self.0.get(index)
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> JobList {
        JobList(self.0[range].to_vec())
    }

    /// Removes entries structurally equal to `entry`.
    pub fn remove_exact(&mut self, entry: &JobRef) {
        self.0.retain(|j| j != entry);
    }

    /// Removes every entry whose jobid or method contains `needle`.
    pub fn remove_containing(&mut self, needle: &str) {
        self.0.retain(|j| !j.jobid.contains(needle) && !j.method.contains(needle));
    }

    pub fn remove_at(&mut self, index: usize) -> Option<JobRef> {
        if index < self.0.len() {
            Some(self.0.remove(index))
        } else {
            None
        }
    }

    /// Multi-line formatted view with per-entry indexing and
    /// column-aligned methods.
    pub fn pretty(&self) -> String {
        let method_width = self.0.iter().map(|j| j.method.len()).max().unwrap_or(0);
        let mut out = String::new();
        for (i, j) in self.0.iter().enumerate() {
            out.push_str(&format!("{i:4}  {:method_width$}  {}\n", j.method, j.jobid));
        }
        out
    }
}

impl FromIterator<JobRef> for JobList {
    fn from_iter<T: IntoIterator<Item = JobRef>>(iter: T) -> Self {
        JobList(iter.into_iter().collect())
    }
}

impl IntoIterator for JobList {
    type Item = JobRef;
    type IntoIter = std::vec::IntoIter<JobRef>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Mapping from an optional record name to the `JobList` recorded under
/// it. The anonymous record (`None` key) is the default, aliased as
/// `jobs` by `Automation`.
pub type Record = HashMap<Option<String>, JobList>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_projection_is_last_jobid_or_empty() {
        let mut list = JobList::new();
        assert_eq!(list.scalar(), "");
        list.push(JobRef::new("csvimport", "job-1"));
        list.push(JobRef::new("csvexport", "job-2"));
        assert_eq!(list.scalar(), "job-2");
    }

    #[test]
    fn all_joins_jobids_with_commas() {
        let mut list = JobList::new();
        list.push(JobRef::new("a", "job-1"));
        list.push(JobRef::new("b", "job-2"));
        assert_eq!(list.all(), "job-1,job-2");
    }

    #[test]
    fn find_preserves_order_of_matches() {
        let mut list = JobList::new();
        list.push(JobRef::new("csvimport", "job-1"));
        list.push(JobRef::new("csvexport", "job-2"));
        list.push(JobRef::new("csvimport", "job-3"));
        let found = list.find("csvimport");
        assert_eq!(found.len(), 2);
        assert_eq!(found.get(0).unwrap().jobid, "job-1");
        assert_eq!(found.get(1).unwrap().jobid, "job-3");
    }

    #[test]
    fn by_method_returns_last_match() {
        let mut list = JobList::new();
        list.push(JobRef::new("csvimport", "job-1"));
        list.push(JobRef::new("csvimport", "job-3"));
        assert_eq!(list.by_method("csvimport").unwrap().jobid, "job-3");
        assert!(list.by_method("missing").is_none());
    }

    #[test]
    fn remove_containing_matches_either_field() {
        let mut list = JobList::new();
        list.push(JobRef::new("csvimport", "job-1"));
        list.push(JobRef::new("csvexport", "job-2"));
        list.remove_containing("import");
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().method, "csvexport");
    }

    #[test]
    fn jobref_displays_as_bare_jobid() {
        let j = JobRef::new("csvimport", "job-42");
        assert_eq!(j.to_string(), "job-42");
        assert_eq!(j.id(), "job-42");
    }
}
