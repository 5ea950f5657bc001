//! [`DatasetWriter`]: the write side of the model. A writer is associated
//! with a name (default `"default"`) within the currently running job; at
//! most one writer exists per name per job. See `finish()` for how a
//! completed writer turns into a persisted [`Dataset`].

use crate::column::{ColumnWriter, HashFilter};
use crate::dataset::{Dataset, NewColumn};
use crate::id::clean_name;
use crate::value::{ColumnTypeRegistry, Value};
use anyhow::{anyhow, bail, Result};
use common::context::JobContext;
use common::errors::ValidationError;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

static ACTIVE_WRITER_NAMES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Unset,
    Sliced,
    Split,
}

struct ColumnSpec {
    type_name: String,
    default: Option<Value>,
}

/// A dataset under construction. `add()` each column during prepare or
/// synthesis, then either drive it with `set_slice`/`write_*` (sliced mode)
/// or `enable_split`/`write_split_*` (split mode), then `finish()`.
pub struct DatasetWriter {
    ctx: JobContext,
    registry: Arc<ColumnTypeRegistry>,
    name: String,
    parent: Option<Dataset>,
    previous: Option<String>,
    filename: Option<String>,
    caption: Option<String>,
    hashlabel: Option<String>,

    order: Vec<String>,
    columns: HashMap<String, ColumnSpec>,
    clean_names: HashMap<String, String>,
    seen_names: HashSet<String>,

    slices: usize,
    mode: WriteMode,
    sliceno: Option<usize>,
    active: Option<HashMap<String, ColumnWriter>>,
    split_active: Option<Vec<HashMap<String, ColumnWriter>>>,
    round_robin: usize,

    per_slice_counts: HashMap<usize, HashMap<String, u64>>,
    minmax: HashMap<String, (Option<Value>, Option<Value>)>,

    registry_key: String,
}

impl DatasetWriter {
    /// Registers a writer named `name` for the current job. Duplicate
    /// names within the same job are rejected; set `previous` to chain
    /// onto an earlier dataset, or `parent` to extend one via `append()`
    /// at `finish()` instead of `Dataset::new()`.
    pub fn new(
        ctx: JobContext,
        registry: Arc<ColumnTypeRegistry>,
        name: impl Into<String>,
        parent: Option<Dataset>,
        previous: Option<String>,
        hashlabel: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        let registry_key = format!("{}/{}", ctx.jobid, name);
        {
            let mut active = ACTIVE_WRITER_NAMES.lock().unwrap();
            if !active.insert(registry_key.clone()) {
                return Err(ValidationError::DuplicateWriterName(name).into());
            }
        }
        let slices = ctx.slices;
        Ok(Self {
            ctx,
            registry,
            name,
            parent,
            previous,
            filename: None,
            caption: None,
            hashlabel,
            order: Vec::new(),
            columns: HashMap::new(),
            clean_names: HashMap::new(),
            seen_names: HashSet::new(),
            slices,
            mode: WriteMode::Unset,
            sliceno: None,
            active: None,
            split_active: None,
            round_robin: 0,
            per_slice_counts: HashMap::new(),
            minmax: HashMap::new(),
            registry_key,
        })
    }

    pub fn set_filename(&mut self, filename: impl Into<String>) {
        self.filename = Some(filename.into());
    }

    pub fn set_caption(&mut self, caption: impl Into<String>) {
        self.caption = Some(caption.into());
    }

    /// Adds a column. Order of `add()` calls defines the positional order
    /// `write_list`/`write_split_list` expect. If the writer has a parent
    /// dataset and `colname` already exists there, the parent's sanitized
    /// name is reused verbatim so paths stay stable across appends.
    pub fn add(&mut self, colname: &str, coltype: &str, default: Option<Value>) -> Result<()> {
        if self.mode != WriteMode::Unset {
            bail!("cannot add column {colname} after writing has started");
        }
        if !self.registry.contains(coltype) {
            return Err(ValidationError::UnknownColumnType(coltype.to_string()).into());
        }
        let clean = match self.parent.as_ref().and_then(|p| p.columns().get(colname)) {
            Some(existing) => existing.name.clone(),
            None => clean_name(colname, &mut self.seen_names),
        };
        self.clean_names.insert(colname.to_string(), clean);
        self.columns.insert(
            colname.to_string(),
            ColumnSpec {
                type_name: coltype.to_string(),
                default,
            },
        );
        self.order.push(colname.to_string());
        Ok(())
    }

    fn job_dir(&self) -> std::path::PathBuf {
        self.ctx.job_dir().join(&self.name)
    }

    fn open_writer(&self, colname: &str, sliceno: usize, filtered: bool) -> Result<ColumnWriter> {
        let spec = &self.columns[colname];
        let codec = self.registry.get(&spec.type_name)?;
        let clean = &self.clean_names[colname];
        std::fs::create_dir_all(self.job_dir())?;
        let path = self.job_dir().join(format!("{sliceno}.{clean}"));
        let filter = if filtered && Some(colname.to_string()) == self.hashlabel {
            Some(HashFilter { sliceno, slices: self.slices })
        } else {
            None
        };
        Ok(ColumnWriter::create(&path, codec, spec.default.clone(), filter)?)
    }

    /// Opens per-column writers for slice `s`, closing whichever slice was
    /// previously active.
    pub fn set_slice(&mut self, sliceno: usize) -> Result<()> {
        if self.mode == WriteMode::Split {
            bail!("don't use both set_slice and a split writer");
        }
        if self.order.is_empty() {
            bail!("no columns added to this writer");
        }
        if let Some(hl) = &self.hashlabel {
            if !self.columns.contains_key(hl) {
                bail!("hashlabel column {hl} not among this writer's columns");
            }
        }
        self.mode = WriteMode::Sliced;
        self.close_active_slice()?;
        let mut writers = HashMap::new();
        for colname in &self.order {
            writers.insert(colname.clone(), self.open_writer(colname, sliceno, true)?);
        }
        self.sliceno = Some(sliceno);
        self.active = Some(writers);
        Ok(())
    }

    fn close_active_slice(&mut self) -> Result<()> {
        if let (Some(sliceno), Some(writers)) = (self.sliceno.take(), self.active.take()) {
            let mut counts = HashMap::new();
            for (colname, w) in writers {
                let stats = w.close()?;
                self.fold_minmax(&colname, stats.min, stats.max)?;
                counts.insert(colname, stats.count);
            }
            self.per_slice_counts.insert(sliceno, counts);
        }
        Ok(())
    }

    fn fold_minmax(&mut self, colname: &str, min: Option<Value>, max: Option<Value>) -> Result<()> {
        let codec = self.registry.get(&self.columns[colname].type_name)?;
        let entry = self.minmax.entry(colname.to_string()).or_insert((None, None));
        if let Some(m) = min {
            entry.0 = Some(match entry.0.take() {
                None => m,
                Some(cur) => {
                    if codec.compare(&m, &cur) == Some(Ordering::Less) {
                        m
                    } else {
                        cur
                    }
                }
            });
        }
        if let Some(m) = max {
            entry.1 = Some(match entry.1.take() {
                None => m,
                Some(cur) => {
                    if codec.compare(&m, &cur) == Some(Ordering::Greater) {
                        m
                    } else {
                        cur
                    }
                }
            });
        }
        Ok(())
    }

    /// Whether `value` belongs to the current slice under the writer's
    /// hashlabel, without actually writing a row.
    pub fn hashcheck(&self, value: &Value) -> Result<bool> {
        let hl = self.hashlabel.as_ref().ok_or_else(|| anyhow!("this writer has no hashlabel"))?;
        let sliceno = self.sliceno.ok_or_else(|| anyhow!("no active slice"))?;
        let codec = self.registry.get(&self.columns[hl].type_name)?;
        Ok((codec.hash(value) as usize) % self.slices == sliceno)
    }

    /// Appends a row of positional values in `add()` order. The hashlabel
    /// column (if any) is written first; if it discards the row, the rest
    /// of the columns are skipped. Returns whether the row was kept.
    pub fn write_list(&mut self, values: &[Value]) -> Result<bool> {
        if values.len() != self.order.len() {
            bail!("write_list got {} values, expected {}", values.len(), self.order.len());
        }
        let writers = self.active.as_mut().ok_or_else(|| anyhow!("no active slice; call set_slice first"))?;
        if let Some(hl) = self.hashlabel.clone() {
            let hl_idx = self.order.iter().position(|c| c == &hl).expect("hashlabel must be a column");
            let keep = writers.get_mut(&hl).unwrap().write(Some(&values[hl_idx]))?;
            if !keep {
                return Ok(false);
            }
            for (i, colname) in self.order.iter().enumerate() {
                if colname == &hl {
                    continue;
                }
                writers.get_mut(colname).unwrap().write(Some(&values[i]))?;
            }
        } else {
            for (i, colname) in self.order.iter().enumerate() {
                writers.get_mut(colname).unwrap().write(Some(&values[i]))?;
            }
        }
        Ok(true)
    }

    /// As `write_list`, keyed by column name instead of position.
    pub fn write_dict(&mut self, values: &HashMap<String, Value>) -> Result<bool> {
        let ordered: Vec<Value> = self
            .order
            .iter()
            .map(|c| values.get(c).cloned().ok_or_else(|| anyhow!("missing value for column {c}")))
            .collect::<Result<_>>()?;
        self.write_list(&ordered)
    }

    /// Opens writers for every slice simultaneously; each `write_split_*`
    /// call picks the destination slice itself.
    pub fn enable_split(&mut self) -> Result<()> {
        if self.mode == WriteMode::Sliced {
            bail!("don't use both set_slice and a split writer");
        }
        if self.order.is_empty() {
            bail!("no columns added to this writer");
        }
        self.mode = WriteMode::Split;
        let mut per_slice = Vec::with_capacity(self.slices);
        for s in 0..self.slices {
            let mut writers = HashMap::new();
            for colname in &self.order {
                writers.insert(colname.clone(), self.open_writer(colname, s, false)?);
            }
            per_slice.push(writers);
        }
        self.split_active = Some(per_slice);
        self.round_robin = 0;
        Ok(())
    }

    fn split_destination(&mut self, values: &[Value]) -> Result<usize> {
        match &self.hashlabel {
            Some(hl) => {
                let idx = self.order.iter().position(|c| c == hl).expect("hashlabel must be a column");
                let codec = self.registry.get(&self.columns[hl].type_name)?;
                Ok((codec.hash(&values[idx]) as usize) % self.slices)
            }
            None => {
                let s = self.round_robin % self.slices;
                self.round_robin += 1;
                Ok(s)
            }
        }
    }

    /// Writes a row in split mode, routing it to a slice by the
    /// hashlabel's hash (if set) or round-robin otherwise. Returns the
    /// slice it landed on.
    pub fn write_split_list(&mut self, values: &[Value]) -> Result<usize> {
        if values.len() != self.order.len() {
            bail!("write_split_list got {} values, expected {}", values.len(), self.order.len());
        }
        let sliceno = self.split_destination(values)?;
        let per_slice = self.split_active.as_mut().ok_or_else(|| anyhow!("call enable_split first"))?;
        let writers = &mut per_slice[sliceno];
        for (i, colname) in self.order.iter().enumerate() {
            writers.get_mut(colname).unwrap().write(Some(&values[i]))?;
        }
        Ok(sliceno)
    }

    pub fn write_split_dict(&mut self, values: &HashMap<String, Value>) -> Result<usize> {
        let ordered: Vec<Value> = self
            .order
            .iter()
            .map(|c| values.get(c).cloned().ok_or_else(|| anyhow!("missing value for column {c}")))
            .collect::<Result<_>>()?;
        self.write_split_list(&ordered)
    }

    /// Closes all open writers, validates per-slice line counts match
    /// across columns, merges small per-slice files, and persists the
    /// completed dataset (via `Dataset::append` if this writer has a
    /// parent, else `Dataset::new`).
    pub fn finish(mut self) -> Result<Dataset> {
        match self.mode {
            WriteMode::Sliced => self.close_active_slice()?,
            WriteMode::Split => {
                if let Some(per_slice) = self.split_active.take() {
                    for (sliceno, writers) in per_slice.into_iter().enumerate() {
                        let mut counts = HashMap::new();
                        for (colname, w) in writers {
                            let stats = w.close()?;
                            self.fold_minmax(&colname, stats.min, stats.max)?;
                            counts.insert(colname, stats.count);
                        }
                        self.per_slice_counts.insert(sliceno, counts);
                    }
                }
            }
            WriteMode::Unset => {}
        }
        ACTIVE_WRITER_NAMES.lock().unwrap().remove(&self.registry_key);

        let mut lines = vec![0u64; self.slices];
        for (sliceno, slot) in lines.iter_mut().enumerate() {
            let Some(counts) = self.per_slice_counts.get(&sliceno) else {
                continue;
            };
            let mut common: Option<u64> = None;
            for (colname, &count) in counts {
                match common {
                    None => common = Some(count),
                    Some(expected) if expected != count => {
                        return Err(ValidationError::MismatchedLineCounts {
                            sliceno,
                            detail: format!("{colname} has {count} rows, expected {expected}"),
                        }
                        .into());
                    }
                    _ => {}
                }
            }
            *slot = common.unwrap_or(0);
        }

        let columns: BTreeMap<String, NewColumn> = self
            .order
            .iter()
            .map(|c| {
                let (min, max) = self.minmax.get(c).cloned().unwrap_or((None, None));
                (
                    c.clone(),
                    NewColumn {
                        type_name: self.columns[c].type_name.clone(),
                        clean_name: self.clean_names[c].clone(),
                        min,
                        max,
                    },
                )
            })
            .collect();

        let root = self.ctx.root.clone();
        match &self.parent {
            Some(parent) => parent.append(
                &self.ctx,
                &root,
                &self.registry,
                columns,
                lines,
                self.filename.clone(),
                self.hashlabel.clone(),
                false,
                self.caption.clone(),
                self.previous.clone(),
                &self.name,
            ),
            None => Dataset::new(
                &self.ctx,
                &root,
                &self.registry,
                columns,
                lines,
                self.filename.clone(),
                self.hashlabel.clone(),
                self.caption.clone(),
                self.previous.clone(),
                &self.name,
            ),
        }
    }
}

impl Drop for DatasetWriter {
    fn drop(&mut self) {
        ACTIVE_WRITER_NAMES.lock().unwrap().remove(&self.registry_key);
    }
}
