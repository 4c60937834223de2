//! Resolution of records that reference records of their own kind
//!
//! Relations may have relations as members. Resolving them is a stack of
//! [`resolve_references`] calls, one per nesting level:
//!
//! - level 0 is the input file; level n+1 holds the records of level n that
//!   something on level n references (a whitelist filter on the referenced ids)
//! - levels are added while the number of references keeps shrinking
//! - the stack is then unwound, resolving each level against the already
//!   resolved level below it, and the result replaces the input file
//!
//! A level whose reference count does not shrink is cyclic. It is attached
//! to its parent unresolved, so whatever it references itself is lost; the
//! outcome reports it, or the call fails if `fail_on_cycle` is set.

use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};
use tempfile::TempPath;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::record::{IdRecord, Record, RecordFactory};
use crate::stream::{copy_stream, RecordIterator, RecordWriter, StreamOptions};

use super::filter::filter_with;
use super::resolver::{resolve_references_with, ReferredHandler, RefererHandler};
use super::sorter::sort_with;
use super::{remove_scratch, scratch_file};

/// A nesting level whose references did not shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub level: usize,
    /// References made by the records of `level`.
    pub references: u64,
    /// References made by the level above.
    pub previous: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfResolveOutcome {
    /// Nesting levels that were built and resolved.
    pub levels: usize,
    pub cycle: Option<CycleReport>,
}

/// Resolve the references between the records of `file` and write the
/// result back to `file`. The file must be ascending by id.
pub fn resolve_self_references<T, F, HM, HO>(
    file: &Path,
    temp_dir: &Path,
    factory: F,
    referred: &HM,
    referer: &HO,
    config: &StreamConfig,
) -> Result<SelfResolveOutcome>
where
    T: Record + Clone,
    F: RecordFactory<T> + Clone,
    HM: ReferredHandler<T>,
    HO: RefererHandler<T, T>,
{
    let start = Instant::now();
    let levels = Levels {
        temp_dir,
        factory,
        referred,
        referer,
        config,
        options: StreamOptions::from_config(config),
    };
    let mut outcome = SelfResolveOutcome::default();

    let (ids, mut previous) = levels.collect_ids::<T>(file)?;
    if previous == 0 {
        remove_scratch(ids)?;
        debug!("{} has no self references", file.display());
        return Ok(outcome);
    }
    // `child` is the deepest level, `parents` the levels between it and the file.
    let mut child = levels.referenced::<T>(file, ids)?;
    let mut parents: Vec<TempPath> = Vec::new();

    loop {
        let (ids, references) = levels.collect_ids::<T>(&child)?;
        if references == 0 {
            remove_scratch(ids)?;
            break;
        }
        if references >= previous {
            remove_scratch(ids)?;
            let report = CycleReport {
                level: parents.len() + 1,
                references,
                previous,
            };
            if config.fail_on_cycle {
                return Err(StreamError::NonConvergent {
                    level: report.level,
                    references,
                });
            }
            warn!(
                "cyclic references in {} at level {}: {} references after {}, attaching it unresolved",
                file.display(),
                report.level,
                references,
                previous
            );
            outcome.cycle = Some(report);
            break;
        }
        let next = levels.referenced::<T>(&child, ids)?;
        parents.push(std::mem::replace(&mut child, next));
        previous = references;
    }
    outcome.levels = parents.len() + 1;
    debug!("{} nesting levels below {}", outcome.levels, file.display());

    while let Some(parent) = parents.pop() {
        let resolved = scratch_file(temp_dir, &config.temp_prefix, "level")?;
        levels.resolve::<T>(&resolved, &parent, &child)?;
        remove_scratch(std::mem::replace(&mut child, resolved))?;
        remove_scratch(parent)?;
    }

    let resolved = scratch_file(temp_dir, &config.temp_prefix, "level")?;
    levels.resolve::<T>(&resolved, file, &child)?;
    remove_scratch(child)?;
    let written = copy_stream(&resolved, file, levels.factory.clone(), &levels.options)?;
    remove_scratch(resolved)?;

    info!(
        "resolved {} nesting levels of {} ({} records) in {:.2}s",
        outcome.levels,
        file.display(),
        written,
        start.elapsed().as_secs_f64()
    );
    Ok(outcome)
}

struct Levels<'a, F, HM, HO> {
    temp_dir: &'a Path,
    factory: F,
    referred: &'a HM,
    referer: &'a HO,
    config: &'a StreamConfig,
    options: StreamOptions,
}

impl<F, HM, HO> Levels<'_, F, HM, HO> {
    /// Write every id referenced from `source` to a sorted, duplicate-free
    /// id file. Returns the file and the number of references, duplicates
    /// included.
    fn collect_ids<T>(&self, source: &Path) -> Result<(TempPath, u64)>
    where
        T: Record,
        F: RecordFactory<T> + Clone,
        HO: RefererHandler<T, T>,
    {
        let path = scratch_file(self.temp_dir, &self.config.temp_prefix, "ids")?;
        let mut records: RecordIterator<T, F> =
            RecordIterator::open_with(source, self.factory.clone(), &self.options)?;
        let mut writer = RecordWriter::create_with(&path, &self.options)?;
        while let Some(record) = records.next().transpose()? {
            for id in self.referer.refs(&record) {
                writer.write(&IdRecord::new(id))?;
            }
        }
        let references = writer.close()?;
        if references > 1 {
            sort_with(
                &path,
                self.temp_dir,
                IdRecord::blank,
                |a: &IdRecord, b: &IdRecord| a.cmp(b),
                self.config,
            )?;
        }
        Ok((path, references))
    }

    /// The records of `source` whose id is in `ids`.
    fn referenced<T>(&self, source: &Path, ids: TempPath) -> Result<TempPath>
    where
        T: Record,
        F: RecordFactory<T> + Clone,
        HM: ReferredHandler<T>,
    {
        let level = scratch_file(self.temp_dir, &self.config.temp_prefix, "level")?;
        let referred = self.referred;
        filter_with(
            source,
            &level,
            &ids,
            self.factory.clone(),
            |record: &T| referred.id(record),
            true,
            self.config,
        )?;
        remove_scratch(ids)?;
        Ok(level)
    }

    fn resolve<T>(&self, dest: &Path, ones: &Path, manies: &Path) -> Result<()>
    where
        T: Record + Clone,
        F: RecordFactory<T> + Clone,
        HM: ReferredHandler<T>,
        HO: RefererHandler<T, T>,
    {
        resolve_references_with(
            dest,
            ones,
            manies,
            self.temp_dir,
            self.factory.clone(),
            self.factory.clone(),
            self.referred,
            self.referer,
            self.config,
        )?;
        Ok(())
    }
}
