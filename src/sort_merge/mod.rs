//! Out-of-core sort-merge toolkit
//!
//! Everything here works on record streams that are larger than memory and
//! turns random lookups into sequential passes:
//!
//! 1. **Sort**: external merge sort with duplicate elimination ([`sort`])
//! 2. **Filter**: keep or drop records whose id is in a sorted id list ([`filter`])
//! 3. **Resolve**: attach referenced records to their referrers with two
//!    sorts and two merge-joins ([`resolve_references`])
//! 4. **Resolve levels**: repeat 3 for records that reference records of the
//!    same kind until nothing is left ([`resolve_self_references`])
//!
//! ## Memory Usage
//!
//! One presorted run (bounded by record count and by a byte budget) plus one
//! head record per merged run. Intermediates live in the caller's temp
//! directory and are removed as soon as the next phase has consumed them.

pub mod filter;
pub mod reservoir;
pub mod resolver;
pub mod self_ref;
pub mod sorter;

pub use filter::{filter, filter_with, FilterStats};
pub use reservoir::MemoryReservoir;
pub use resolver::{
    resolve_references, resolve_references_with, Reference, ReferredHandler, RefererHandler,
    ResolveStats,
};
pub use self_ref::{resolve_self_references, CycleReport, SelfResolveOutcome};
pub use sorter::{sort, sort_with, MergePassStats, SortStats};

use std::path::Path;

use tempfile::TempPath;

use crate::error::{Result, StreamError};

/// Reserve a fresh scratch file in `temp_dir`. It is deleted when the
/// returned path is closed or dropped.
pub(crate) fn scratch_file(temp_dir: &Path, prefix: &str, kind: &str) -> Result<TempPath> {
    let file = tempfile::Builder::new()
        .prefix(&format!("{}-{}-", prefix, kind))
        .suffix(".dat")
        .tempfile_in(temp_dir)
        .map_err(|e| StreamError::at(temp_dir, e))?;
    Ok(file.into_temp_path())
}

/// Delete a consumed scratch file, reporting failures.
pub(crate) fn remove_scratch(path: TempPath) -> Result<()> {
    let shown = path.to_path_buf();
    path.close().map_err(|e| StreamError::at(shown, e))
}

/// Guards the "ascending by id" contract of a stream while it is consumed.
pub(crate) struct AscendingIds {
    stream: &'static str,
    last: Option<i64>,
    enabled: bool,
}

impl AscendingIds {
    pub(crate) fn new(stream: &'static str, enabled: bool) -> Self {
        Self {
            stream,
            last: None,
            enabled,
        }
    }

    /// Equal neighbours are fine, a smaller id is not.
    pub(crate) fn check(&mut self, id: i64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(previous) = self.last {
            if id < previous {
                return Err(StreamError::UnsortedInput {
                    stream: self.stream,
                    previous,
                    current: id,
                });
            }
        }
        self.last = Some(id);
        Ok(())
    }
}
