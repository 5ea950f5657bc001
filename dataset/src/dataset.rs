//! [`Dataset`]: the read side of the model (loading, chaining, iterating)
//! plus the two ways a descriptor is completed and persisted
//! (`Dataset::new`/`Dataset::append`), called by [`crate::writer::DatasetWriter::finish`].

use crate::column::ColumnReader;
use crate::descriptor::{ColumnDescriptor, DatasetDescriptor};
use crate::id::DatasetId;
use crate::memo;
use crate::value::{ColumnCodec, ColumnTypeRegistry, Value};
use anyhow::{anyhow, bail, Context, Result};
use common::context::JobContext;
use common::errors::ValidationError;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

const MERGE_THRESHOLD_BYTES: f64 = 524288.0;
const CACHE_SNAPSHOT_INTERVAL: u8 = 64;

/// A column as supplied to [`Dataset::new`]/[`Dataset::append`]: the
/// writer has already sanitized the name and computed the observed
/// min/max, so the dataset side only needs to place it in the descriptor.
#[derive(Debug, Clone)]
pub struct NewColumn {
    pub type_name: String,
    pub clean_name: String,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: DatasetId,
    descriptor: DatasetDescriptor,
}

impl Dataset {
    /// Loads a dataset by id through the process-wide memo, upgrading a
    /// version-1 descriptor transparently.
    pub fn load(root: &Path, id: &DatasetId) -> Result<Self> {
        let key = id.as_canonical();
        let root = root.to_path_buf();
        let id_for_load = id.clone();
        let descriptor = memo::get_or_load(&key, move || Self::load_from_disk(&root, &id_for_load))?;
        Ok(Self { id: id.clone(), descriptor })
    }

    fn load_from_disk(root: &Path, id: &DatasetId) -> Result<DatasetDescriptor> {
        let path = root.join(&id.jobid).join(&id.name).join("dataset.pickle");
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading dataset descriptor at {}", path.display()))?;
        let mut descriptor: DatasetDescriptor =
            bincode::deserialize(&bytes).with_context(|| format!("decoding dataset descriptor at {}", path.display()))?;

        if descriptor.version.0 == 1 {
            for col in descriptor.columns.values_mut() {
                col.location = format!("{}/%s/{}", col.location, col.name);
                col.offsets = None;
            }
            descriptor.version = (2, 0);
        }
        if descriptor.version.0 != 2 {
            return Err(ValidationError::UnsupportedVersion {
                major: descriptor.version.0,
                minor: descriptor.version.1,
            }
            .into());
        }
        Ok(descriptor)
    }

    pub fn columns(&self) -> &BTreeMap<String, ColumnDescriptor> {
        &self.descriptor.columns
    }

    pub fn previous(&self) -> Option<&str> {
        self.descriptor.previous.as_deref()
    }

    pub fn parent(&self) -> Option<&str> {
        self.descriptor.parent.as_deref()
    }

    pub fn filename(&self) -> Option<&str> {
        self.descriptor.filename.as_deref()
    }

    pub fn hashlabel(&self) -> Option<&str> {
        self.descriptor.hashlabel.as_deref()
    }

    pub fn caption(&self) -> &str {
        &self.descriptor.caption
    }

    pub fn lines(&self) -> &[u64] {
        &self.descriptor.lines
    }

    pub fn shape(&self) -> (usize, u64) {
        self.descriptor.shape()
    }

    /// Resolves the on-disk path for `colname`. If the column is merged,
    /// `sliceno` is ignored; otherwise a `None` sliceno leaves the `%s`
    /// placeholder intact for the caller to substitute.
    pub fn column_filename(&self, root: &Path, colname: &str, sliceno: Option<usize>) -> Result<std::path::PathBuf> {
        let dc = self
            .descriptor
            .columns
            .get(colname)
            .ok_or_else(|| anyhow!("column {colname} not found in {}", self.id))?;
        let (jid, path) = dc.split_location();
        if dc.offsets.is_some() {
            Ok(root.join(jid).join(path))
        } else {
            match sliceno {
                Some(s) => Ok(root.join(jid).join(path.replacen("%s", &s.to_string(), 1))),
                None => Ok(root.join(jid).join(path)),
            }
        }
    }

    fn open_column_reader(&self, root: &Path, dc: &ColumnDescriptor, sliceno: usize) -> Result<ColumnReader> {
        let (jid, path) = dc.split_location();
        if let Some(offsets) = &dc.offsets {
            let full = root.join(jid).join(path);
            let seek = offsets[sliceno];
            let max_count = self.descriptor.lines[sliceno];
            Ok(ColumnReader::open(&full, Some(seek), Some(max_count))?)
        } else {
            let full = root.join(jid).join(path.replacen("%s", &sliceno.to_string(), 1));
            Ok(ColumnReader::open(&full, None, None)?)
        }
    }

    /// Walks `previous` links. `length < 0` means unbounded. Stops when
    /// `length` links are collected, `previous` is null, or the next
    /// candidate's jobid matches `stop_jobid`. Root-first by default;
    /// `reverse = true` returns tip-first.
    pub fn chain(&self, root: &Path, length: i64, reverse: bool, stop_jobid: Option<&str>) -> Result<Vec<Dataset>> {
        let stop_jobid = match stop_jobid {
            Some(s) => {
                let id = DatasetId::parse(s).ok_or_else(|| anyhow!("invalid stop_jobid {s}"))?;
                Some(Dataset::load(root, &id)?.id.jobid)
            }
            None => None,
        };

        let mut chain = Vec::new();
        let mut current = self.clone();
        loop {
            if length >= 0 && chain.len() as i64 == length {
                break;
            }
            if let Some(stop) = &stop_jobid {
                if &current.id.jobid == stop {
                    break;
                }
            }
            let previous = current.descriptor.previous.clone();
            chain.push(current.clone());
            match previous {
                None => break,
                Some(p) => {
                    let id = DatasetId::parse(&p).ok_or_else(|| anyhow!("invalid previous dataset id {p}"))?;
                    current = Dataset::load(root, &id)?;
                }
            }
        }
        if !reverse {
            chain.reverse();
        }
        Ok(chain)
    }

    /// Iterates rows of the requested columns for one slice, or all slices
    /// concatenated when `sliceno` is `None`. When `hashlabel` names a
    /// column other than the dataset's own, rows are additionally filtered
    /// by that column's hash so only the rows belonging to `sliceno` are
    /// yielded (requires an explicit `sliceno`).
    pub fn iterate(
        &self,
        root: &Path,
        sliceno: Option<usize>,
        columns: Option<&[String]>,
        hashlabel: Option<&str>,
        registry: &ColumnTypeRegistry,
    ) -> Result<RowIter> {
        let slices = self.descriptor.lines.len();
        let wanted: Vec<String> = match columns {
            Some(c) => c.to_vec(),
            None => self.descriptor.columns.keys().cloned().collect(),
        };
        for c in &wanted {
            if !self.descriptor.columns.contains_key(c) {
                bail!("column {c} not found in {}", self.id);
            }
        }
        let slice_range: Vec<usize> = match sliceno {
            Some(s) => vec![s],
            None => (0..slices).collect(),
        };

        let mut col_iters: Vec<Box<dyn Iterator<Item = io::Result<Value>>>> = Vec::with_capacity(wanted.len());
        for name in &wanted {
            let dc = self.descriptor.columns.get(name).unwrap();
            let mut readers = Vec::with_capacity(slice_range.len());
            for &s in &slice_range {
                readers.push(self.open_column_reader(root, dc, s)?);
            }
            col_iters.push(Box::new(readers.into_iter().flatten()));
        }

        let filter = match hashlabel {
            Some(h) if Some(h) != self.descriptor.hashlabel.as_deref() => {
                let target = sliceno.ok_or_else(|| anyhow!("hashlabel filtering requires an explicit sliceno"))?;
                let dc = self
                    .descriptor
                    .columns
                    .get(h)
                    .ok_or_else(|| anyhow!("hashlabel column {h} not found in {}", self.id))?;
                let codec = registry.get(&dc.type_name)?;
                let mut readers = Vec::with_capacity(slice_range.len());
                for &s in &slice_range {
                    readers.push(self.open_column_reader(root, dc, s)?);
                }
                let hash_iter: Box<dyn Iterator<Item = io::Result<Value>>> = Box::new(readers.into_iter().flatten());
                Some((hash_iter, codec, target, slices))
            }
            _ => None,
        };

        Ok(RowIter { col_iters, filter })
    }

    /// Iterates the chain rooted at `self` (see [`Dataset::chain`]) as one
    /// continuous row stream.
    pub fn iterate_chain(
        &self,
        root: &Path,
        sliceno: Option<usize>,
        columns: Option<&[String]>,
        length: i64,
        reverse: bool,
        hashlabel: Option<&str>,
        stop_jobid: Option<&str>,
        registry: &ColumnTypeRegistry,
    ) -> Result<Box<dyn Iterator<Item = Result<Vec<Value>>>>> {
        let chain = self.chain(root, length, reverse, stop_jobid)?;
        let mut all: Box<dyn Iterator<Item = Result<Vec<Value>>>> = Box::new(std::iter::empty());
        for ds in chain {
            let it = ds.iterate(root, sliceno, columns, hashlabel, registry)?;
            all = Box::new(all.chain(it));
        }
        Ok(all)
    }

    /// Re-exports `self` (typically a subjob's dataset) as a dataset of the
    /// calling job, recording `self` as `parent`.
    pub fn link_to_here(&mut self, ctx: &JobContext, root: &Path, name: &str) -> Result<()> {
        self.descriptor.parent = Some(self.id.as_canonical());
        self.id = DatasetId::new(ctx.jobid.clone(), name);
        save(root, &self.id, &self.descriptor)?;
        memo::put(&self.id.as_canonical(), self.descriptor.clone());
        Ok(())
    }

    /// Constructs a fresh, unchained dataset from a completed writer's
    /// columns.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &JobContext,
        root: &Path,
        registry: &ColumnTypeRegistry,
        columns: BTreeMap<String, NewColumn>,
        lines: Vec<u64>,
        filename: Option<String>,
        hashlabel: Option<String>,
        caption: Option<String>,
        previous: Option<String>,
        name: &str,
    ) -> Result<Dataset> {
        if let Some(h) = &hashlabel {
            if !columns.contains_key(h) {
                bail!("hashlabel {h} is not one of this dataset's columns");
            }
        }
        append_common(
            ctx, root, registry, None, columns, lines, filename, hashlabel, false, caption, previous, name,
        )
    }

    /// Extends `self` with a writer's columns, producing a new dataset
    /// (possibly under a different job/name) with `self` linked as
    /// `parent` when that differs.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        ctx: &JobContext,
        root: &Path,
        registry: &ColumnTypeRegistry,
        columns: BTreeMap<String, NewColumn>,
        lines: Vec<u64>,
        filename: Option<String>,
        hashlabel: Option<String>,
        hashlabel_override: bool,
        caption: Option<String>,
        previous: Option<String>,
        name: &str,
    ) -> Result<Dataset> {
        append_common(
            ctx,
            root,
            registry,
            Some(self),
            columns,
            lines,
            filename,
            hashlabel,
            hashlabel_override,
            caption,
            previous,
            name,
        )
    }
}

/// Streams rows as `Vec<Value>` in column order, applying a hashlabel
/// filter if one was requested and differs from the dataset's own.
pub struct RowIter {
    col_iters: Vec<Box<dyn Iterator<Item = io::Result<Value>>>>,
    filter: Option<(Box<dyn Iterator<Item = io::Result<Value>>>, Arc<dyn ColumnCodec>, usize, usize)>,
}

impl Iterator for RowIter {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut row = Vec::with_capacity(self.col_iters.len());
            for it in &mut self.col_iters {
                match it.next() {
                    Some(Ok(v)) => row.push(v),
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => return None,
                }
            }
            match &mut self.filter {
                None => return Some(Ok(row)),
                Some((fit, codec, sliceno, slices)) => match fit.next() {
                    Some(Ok(v)) => {
                        if (codec.hash(&v) as usize) % *slices == *sliceno {
                            return Some(Ok(row));
                        }
                    }
                    Some(Err(e)) => return Some(Err(e.into())),
                    None => return None,
                },
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn append_common(
    ctx: &JobContext,
    root: &Path,
    registry: &ColumnTypeRegistry,
    existing: Option<&Dataset>,
    columns: BTreeMap<String, NewColumn>,
    lines: Vec<u64>,
    filename: Option<String>,
    hashlabel: Option<String>,
    hashlabel_override: bool,
    caption: Option<String>,
    previous: Option<String>,
    name: &str,
) -> Result<Dataset> {
    if lines.len() != ctx.slices {
        return Err(ValidationError::WrongLineVectorLength {
            actual: lines.len(),
            expected: ctx.slices,
        }
        .into());
    }

    let mut descriptor = match existing {
        Some(parent) => {
            if let Some(hl) = &hashlabel {
                if !hashlabel_override && parent.descriptor.hashlabel.as_deref() != Some(hl.as_str()) {
                    return Err(ValidationError::HashlabelMismatch {
                        existing: parent.descriptor.hashlabel.clone().unwrap_or_default(),
                        requested: hl.clone(),
                    }
                    .into());
                }
            }
            if parent.descriptor.lines != lines {
                bail!("new columns don't have the same number of lines as parent columns");
            }
            parent.descriptor.clone()
        }
        None => {
            let mut d = DatasetDescriptor::new_empty();
            d.lines = lines;
            d.hashlabel = hashlabel.clone();
            d
        }
    };

    if let Some(parent) = existing {
        if parent.id.jobid != ctx.jobid || parent.id.name != name {
            descriptor.parent = Some(parent.id.as_canonical());
        }
    }

    descriptor.filename = filename.or_else(|| descriptor.filename.clone());
    descriptor.caption = caption.unwrap_or_else(|| {
        if descriptor.caption.is_empty() {
            ctx.jobid.clone()
        } else {
            descriptor.caption.clone()
        }
    });
    descriptor.previous = previous.and_then(|p| crate::id::normalize_dsid(&p, None));
    descriptor.cache = None;
    descriptor.cache_distance = None;

    for (colname, spec) in columns {
        if !registry.contains(&spec.type_name) {
            return Err(ValidationError::UnknownColumnType(spec.type_name).into());
        }
        let location = format!("{}/{}/%s.{}", ctx.jobid, name, spec.clean_name);
        descriptor.columns.insert(
            colname.clone(),
            ColumnDescriptor {
                type_name: spec.type_name,
                name: spec.clean_name,
                location,
                min: spec.min,
                max: spec.max,
                offsets: None,
            },
        );
        maybe_merge(root, &mut descriptor, &colname, ctx.slices)?;
    }

    update_caches(root, &mut descriptor)?;

    let id = DatasetId::new(ctx.jobid.clone(), name);
    save(root, &id, &descriptor)?;
    memo::put(&id.as_canonical(), descriptor.clone());
    Ok(Dataset { id, descriptor })
}

/// Merges per-slice files for `colname` into a single `.m` file when their
/// average size falls under the merge threshold, rewriting the column's
/// location and recording per-slice byte offsets.
fn maybe_merge(root: &Path, descriptor: &mut DatasetDescriptor, colname: &str, slices: usize) -> Result<()> {
    if slices < 2 {
        return Ok(());
    }
    let dc = descriptor.columns.get(colname).unwrap().clone();
    let (jid, path_tmpl) = dc.split_location();

    let mut sizes = Vec::with_capacity(slices);
    for s in 0..slices {
        let p = root.join(jid).join(path_tmpl.replacen("%s", &s.to_string(), 1));
        sizes.push(std::fs::metadata(&p)?.len());
    }
    let total: u64 = sizes.iter().sum();
    if total as f64 / slices as f64 > MERGE_THRESHOLD_BYTES {
        return Ok(());
    }

    let merged_rel = path_tmpl.replacen("%s", "m", 1);
    let merged_path = root.join(jid).join(&merged_rel);
    let mut offsets = Vec::with_capacity(slices);
    let mut pos = 0u64;
    {
        let mut out = std::fs::File::create(&merged_path)?;
        for (s, size) in sizes.iter().enumerate() {
            let p = root.join(jid).join(path_tmpl.replacen("%s", &s.to_string(), 1));
            let data = std::fs::read(&p)?;
            std::fs::remove_file(&p)?;
            io::Write::write_all(&mut out, &data)?;
            offsets.push(pos);
            pos += size;
        }
    }

    let entry = descriptor.columns.get_mut(colname).unwrap();
    entry.offsets = Some(offsets);
    entry.location = format!("{jid}/{merged_rel}");
    Ok(())
}

/// Snapshots the chain into `descriptor.cache` exactly when
/// `cache_distance` would reach [`CACHE_SNAPSHOT_INTERVAL`], resetting it
/// to 0 afterwards; otherwise just advances the counter.
fn update_caches(root: &Path, descriptor: &mut DatasetDescriptor) -> Result<()> {
    let Some(previous) = descriptor.previous.clone() else {
        return Ok(());
    };
    let previous_id = DatasetId::parse(&previous).ok_or_else(|| anyhow!("invalid previous dataset id {previous}"))?;
    let previous_ds = Dataset::load(root, &previous_id)?;
    let mut cache_distance = previous_ds.descriptor.cache_distance.unwrap_or(1).saturating_add(1);
    if cache_distance >= CACHE_SNAPSHOT_INTERVAL {
        cache_distance = 0;
        let mut chain = previous_ds.chain(root, CACHE_SNAPSHOT_INTERVAL as i64, false, None)?;
        let keep = CACHE_SNAPSHOT_INTERVAL as usize - 1;
        if chain.len() > keep {
            chain.drain(0..chain.len() - keep);
        }
        descriptor.cache = Some(chain.into_iter().map(|d| (d.id.as_canonical(), d.descriptor)).collect());
    }
    descriptor.cache_distance = Some(cache_distance);
    Ok(())
}

fn save(root: &Path, id: &DatasetId, descriptor: &DatasetDescriptor) -> Result<()> {
    let dir = root.join(&id.jobid).join(&id.name);
    std::fs::create_dir_all(&dir)?;
    let bytes = bincode::serialize(descriptor)?;
    std::fs::write(dir.join("dataset.pickle"), bytes)?;
    write_manifest(&dir, descriptor)?;
    Ok(())
}

fn write_manifest(dir: &Path, descriptor: &DatasetDescriptor) -> Result<()> {
    let mut out = String::new();
    if let Some(h) = &descriptor.hashlabel {
        out.push_str(&format!("hashlabel {h}\n"));
    }
    if let Some(p) = &descriptor.previous {
        out.push_str(&format!("previous {p}\n"));
    }
    if !out.is_empty() {
        out.push('\n');
    }

    let mut rows: Vec<(&str, &str, &str)> = descriptor
        .columns
        .iter()
        .map(|(k, c)| (k.as_str(), c.type_name.as_str(), c.location.as_str()))
        .collect();
    rows.sort();

    let name_w = rows.iter().map(|r| r.0.len()).max().unwrap_or(0).max(4);
    let type_w = rows.iter().map(|r| r.1.len()).max().unwrap_or(0).max(4);
    let loc_w = rows.iter().map(|r| r.2.len()).max().unwrap_or(0).max(8);

    out.push_str(&format!("{:>name_w$}  {:>type_w$}  {:<loc_w$}\n", "name", "type", "location"));
    out.push_str(&format!(
        "{:>name_w$}  {:>type_w$}  {:<loc_w$}\n",
        "=".repeat(name_w),
        "=".repeat(type_w),
        "=".repeat(loc_w)
    ));
    for (n, t, l) in rows {
        out.push_str(&format!("{n:>name_w$}  {t:>type_w$}  {l:<loc_w$}\n"));
    }

    std::fs::write(dir.join("dataset.txt"), out)?;
    Ok(())
}
