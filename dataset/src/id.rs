//! Dataset-id parsing and name sanitation.
//!
//! A dataset-id is a scalar string `"<jobid>/<name>"`, with `"<jobid>"` alone
//! meaning `name = "default"`. [`DatasetId`] keeps the jobid/name projections
//! alongside the canonical string so callers never have to re-split it.

use std::collections::HashSet;
use std::fmt;

/// Identifies a dataset: the job that produced it, and the name the writer
/// registered it under (default: `"default"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetId {
    pub jobid: String,
    pub name: String,
}

impl DatasetId {
    pub fn new(jobid: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.is_empty() { "default".to_string() } else { name };
        Self { jobid: jobid.into(), name }
    }

    /// Parse `"<jobid>/<name>"` or the short `"<jobid>"` form.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        match s.split_once('/') {
            Some((jobid, name)) if !jobid.is_empty() => Some(Self::new(jobid, name)),
            Some(_) => None,
            None => Some(Self::new(s, "default")),
        }
    }

    /// Canonical short-when-default string form: `"<jobid>"` if the name is
    /// `"default"`, otherwise `"<jobid>/<name>"`.
    pub fn as_canonical(&self) -> String {
        if self.name == "default" {
            self.jobid.clone()
        } else {
            format!("{}/{}", self.jobid, self.name)
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_canonical())
    }
}

/// Normalizes the various shapes a caller might pass for a dataset
/// reference into a canonical id string, per the original `_dsid` helper:
/// a falsy/empty input is `None`; a `(jobid, name)` pair keeps only the
/// jobid's first slash-separated segment; a bare string without `/` gets
/// `/default` appended.
pub fn normalize_dsid(jobid: &str, name: Option<&str>) -> Option<String> {
    if jobid.is_empty() {
        return None;
    }
    if let Some(name) = name {
        let jid = jobid.split('/').next().unwrap_or(jobid);
        let name = if name.is_empty() { "default" } else { name };
        return Some(format!("{jid}/{name}"));
    }
    if jobid.contains('/') {
        Some(jobid.to_string())
    } else {
        Some(format!("{jobid}/default"))
    }
}

/// Rust keywords (strict + reserved, 2018+ edition) a column name must not
/// collide with, standing in for the original's use of Python's `kwlist`.
const RESERVED_WORDS: &[&str] = &[
    "as", "break", "const", "continue", "crate", "else", "enum", "extern", "false", "fn", "for",
    "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref", "return",
    "self", "Self", "static", "struct", "super", "trait", "true", "type", "unsafe", "use",
    "where", "while", "async", "await", "dyn", "abstract", "become", "box", "do", "final",
    "macro", "override", "priv", "typeof", "unsized", "virtual", "yield", "try", "union",
];

fn is_reserved(s: &str) -> bool {
    RESERVED_WORDS.contains(&s)
}

/// Sanitizes a user-supplied column name into one that is filesystem- and
/// identifier-safe: non-alphanumeric characters become `_`, a leading digit
/// gets a `_` prefix, and collisions with a reserved word or a name already
/// used in this dataset get `_` appended until unique. `seen` is updated
/// with the returned name.
pub fn clean_name(raw: &str, seen: &mut HashSet<String>) -> String {
    let mut n: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if n.is_empty() {
        n.push('_');
    }
    if n.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        n.insert(0, '_');
    }
    while seen.contains(&n) || is_reserved(&n) {
        n.push('_');
    }
    seen.insert(n.clone());
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_form_as_default_name() {
        let id = DatasetId::parse("abc-1").unwrap();
        assert_eq!(id.jobid, "abc-1");
        assert_eq!(id.name, "default");
        assert_eq!(id.as_canonical(), "abc-1");
    }

    #[test]
    fn parses_long_form() {
        let id = DatasetId::parse("abc-1/report").unwrap();
        assert_eq!(id.jobid, "abc-1");
        assert_eq!(id.name, "report");
        assert_eq!(id.as_canonical(), "abc-1/report");
    }

    #[test]
    fn empty_input_has_no_id() {
        assert!(DatasetId::parse("").is_none());
        assert_eq!(normalize_dsid("", None), None);
    }

    #[test]
    fn normalize_appends_default_when_no_slash() {
        assert_eq!(normalize_dsid("abc-1", None), Some("abc-1/default".to_string()));
    }

    #[test]
    fn normalize_keeps_first_segment_of_slashed_jobid() {
        assert_eq!(
            normalize_dsid("abc-1/old-name", Some("new-name")),
            Some("abc-1/new-name".to_string())
        );
    }

    #[test]
    fn clean_name_replaces_non_alnum_and_prefixes_digits() {
        let mut seen = HashSet::new();
        assert_eq!(clean_name("user id!", &mut seen), "user_id_");
        let mut seen = HashSet::new();
        assert_eq!(clean_name("123abc", &mut seen), "_123abc");
    }

    #[test]
    fn clean_name_deduplicates_and_avoids_keywords() {
        let mut seen = HashSet::new();
        assert_eq!(clean_name("type", &mut seen), "type_");
        assert_eq!(clean_name("type", &mut seen), "type__");
        let mut seen2 = HashSet::new();
        assert_eq!(clean_name("col", &mut seen2), "col");
        assert_eq!(clean_name("col", &mut seen2), "col_");
    }
}
