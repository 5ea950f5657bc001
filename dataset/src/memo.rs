//! Process-wide dataset load memo, matching the original's module-level
//! `_ds_cache` dict but wrapped in a read-mostly lock for multi-threaded
//! hosts (see SPEC_FULL.md §5).

use crate::descriptor::DatasetDescriptor;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

static DS_CACHE: Lazy<RwLock<HashMap<String, DatasetDescriptor>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Returns the memoized descriptor for `id`, calling `loader` (and
/// populating the memo, including any inlined `cache` snapshots it
/// carries) on a miss.
pub fn get_or_load<F>(id: &str, loader: F) -> anyhow::Result<DatasetDescriptor>
where
    F: FnOnce() -> anyhow::Result<DatasetDescriptor>,
{
    if let Some(hit) = DS_CACHE.read().unwrap().get(id) {
        return Ok(hit.clone());
    }
    let loaded = loader()?;
    let mut cache = DS_CACHE.write().unwrap();
    if let Some(snapshots) = &loaded.cache {
        for (snap_id, snap) in snapshots {
            cache.entry(snap_id.clone()).or_insert_with(|| snap.clone());
        }
    }
    cache.insert(id.to_string(), loaded.clone());
    Ok(loaded)
}

/// Installs `descriptor` into the memo directly, used after a writer
/// `finish()`/`link_to_here()` persists a descriptor this process just
/// produced so a subsequent load doesn't hit disk.
pub fn put(id: &str, descriptor: DatasetDescriptor) {
    DS_CACHE.write().unwrap().insert(id.to_string(), descriptor);
}

/// Test-only: clears the memo so tests don't leak state into each other.
#[cfg(test)]
pub fn clear() {
    DS_CACHE.write().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn loader_runs_once_per_id() {
        clear();
        let calls = AtomicUsize::new(0);
        let load = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(DatasetDescriptor::new_empty())
        };
        get_or_load("job-1/default", load).unwrap();
        get_or_load("job-1/default", load).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inlined_cache_snapshots_populate_memo() {
        clear();
        let mut with_cache = DatasetDescriptor::new_empty();
        with_cache.cache = Some(vec![("job-0/default".to_string(), DatasetDescriptor::new_empty())]);
        get_or_load("job-1/default", || Ok(with_cache)).unwrap();
        // A direct load of job-0/default must hit the memo, not its own loader.
        let calls = AtomicUsize::new(0);
        get_or_load("job-0/default", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(DatasetDescriptor::new_empty())
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
