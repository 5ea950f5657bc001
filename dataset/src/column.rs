//! Per-column file I/O: [`ColumnWriter`] appends values (optionally
//! discarding rows that don't hash to the writer's slice), [`ColumnReader`]
//! reads them back in order, knowing nothing about the column's declared
//! type beyond what its [`ColumnCodec`] enforces.

use crate::value::{ColumnCodec, Value};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// If set, only rows whose hashlabel value hashes to `sliceno` (mod
/// `slices`) are kept; this is what makes the hashlabel column's writer a
/// filtering writer.
#[derive(Debug, Clone, Copy)]
pub struct HashFilter {
    pub sliceno: usize,
    pub slices: usize,
}

pub struct ColumnWriter {
    codec: Arc<dyn ColumnCodec>,
    file: BufWriter<File>,
    default: Option<Value>,
    filter: Option<HashFilter>,
    count: u64,
    min: Option<Value>,
    max: Option<Value>,
}

/// Aggregate stats collected while writing a column, folded into the
/// dataset descriptor's min/max at `finish()`.
pub struct ColumnStats {
    pub count: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl ColumnWriter {
    pub fn create(
        path: &Path,
        codec: Arc<dyn ColumnCodec>,
        default: Option<Value>,
        filter: Option<HashFilter>,
    ) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            codec,
            file: BufWriter::new(file),
            default,
            filter,
            count: 0,
            min: None,
            max: None,
        })
    }

    /// Whether `value` belongs to this writer's slice under its hash
    /// filter. Always true for an unfiltered writer.
    pub fn hashcheck(&self, value: &Value) -> bool {
        match self.filter {
            Some(f) => (self.codec.hash(value) as usize) % f.slices == f.sliceno,
            None => true,
        }
    }

    /// Appends `value` (or the column default, if `None`). Returns whether
    /// the row was kept: always `true` for an unfiltered writer, `false`
    /// when a hash-filtered writer discards a row belonging to another
    /// slice.
    pub fn write(&mut self, value: Option<&Value>) -> io::Result<bool> {
        let owned;
        let value = match value {
            Some(v) => v,
            None => match &self.default {
                Some(d) => {
                    owned = d.clone();
                    &owned
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "missing value for column with no default",
                    ))
                }
            },
        };
        if !self.hashcheck(value) {
            return Ok(false);
        }
        bincode::serialize_into(&mut self.file, value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.count += 1;
        if self.min.as_ref().map_or(true, |m| self.codec.compare(value, m) == Some(std::cmp::Ordering::Less)) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |m| self.codec.compare(value, m) == Some(std::cmp::Ordering::Greater)) {
            self.max = Some(value.clone());
        }
        Ok(true)
    }

    pub fn close(mut self) -> io::Result<ColumnStats> {
        io::Write::flush(&mut self.file)?;
        Ok(ColumnStats {
            count: self.count,
            min: self.min,
            max: self.max,
        })
    }
}

/// Reads a column's slice of values back in write order, optionally
/// starting at a byte offset (post-merge) and stopping after `max_count`
/// values.
pub struct ColumnReader {
    file: BufReader<File>,
    remaining: Option<u64>,
}

impl ColumnReader {
    pub fn open(path: &Path, seek: Option<u64>, max_count: Option<u64>) -> io::Result<Self> {
        let mut file = File::open(path)?;
        if let Some(offset) = seek {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Self {
            file: BufReader::new(file),
            remaining: max_count,
        })
    }
}

impl Iterator for ColumnReader {
    type Item = io::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(0) = self.remaining {
            return None;
        }
        match bincode::deserialize_from::<_, Value>(&mut self.file) {
            Ok(v) => {
                if let Some(r) = &mut self.remaining {
                    *r -= 1;
                }
                Some(Ok(v))
            }
            Err(e) => match *e {
                bincode::ErrorKind::Io(ref io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => None,
                _ => Some(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ColumnTypeRegistry;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("col.0");
        let registry = ColumnTypeRegistry::with_builtins();
        let codec = registry.get("int64").unwrap();

        let mut w = ColumnWriter::create(&path, codec, None, None).unwrap();
        for v in [1i64, 2, 3, -5] {
            assert!(w.write(Some(&Value::Int(v))).unwrap());
        }
        let stats = w.close().unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min, Some(Value::Int(-5)));
        assert_eq!(stats.max, Some(Value::Int(3)));

        let read: Vec<Value> = ColumnReader::open(&path, None, None)
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(read, vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(-5)]);
    }

    #[test]
    fn hash_filtered_writer_discards_foreign_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("col.0");
        let registry = ColumnTypeRegistry::with_builtins();
        let codec = registry.get("int64").unwrap();
        let filter = HashFilter { sliceno: 0, slices: 4 };

        let mut w = ColumnWriter::create(&path, codec, None, Some(filter)).unwrap();
        let mut kept = 0;
        for v in 0i64..40 {
            if w.write(Some(&Value::Int(v))).unwrap() {
                kept += 1;
            }
        }
        let stats = w.close().unwrap();
        assert_eq!(stats.count, kept);
        assert!(kept < 40);
    }

    #[test]
    fn reader_respects_offset_and_max_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("col.m");
        let registry = ColumnTypeRegistry::with_builtins();
        let codec = registry.get("int64").unwrap();

        let mut w = ColumnWriter::create(&path, codec, None, None).unwrap();
        let offset_before_second = {
            w.write(Some(&Value::Int(100))).unwrap();
            io::Write::flush(&mut w.file).unwrap();
            w.file.get_ref().metadata().unwrap().len()
        };
        w.write(Some(&Value::Int(200))).unwrap();
        w.write(Some(&Value::Int(300))).unwrap();
        w.close().unwrap();

        let read: Vec<Value> = ColumnReader::open(&path, Some(offset_before_second), Some(1))
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(read, vec![Value::Int(200)]);
    }
}
