//! External merge sort with duplicate elimination
//!
//! Records are sorted in place:
//! 1. **Presort**: stream the file through an ordered set, flushing a sorted
//!    run whenever the set reaches the run size or the byte budget runs out
//! 2. **Merge**: k-way merge up to `merge_fanin` runs at a time, level by
//!    level, until one batch covers every remaining run
//! 3. **Finish**: the last batch is merged straight into the original path;
//!    a single run is copied back, no runs means an empty file
//!
//! Records the comparator calls equal are collapsed to the first one in
//! stream order. Runs stay in input order across levels and ties between
//! merge heads go to the lower run, so "first" survives every pass.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::fs::File;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use tempfile::TempPath;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::record::{Record, RecordFactory};
use crate::stream::{RecordIterator, RecordWriter, StreamOptions};

use super::reservoir::MemoryReservoir;
use super::{remove_scratch, scratch_file};

/// One k-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePassStats {
    /// 0 for merges of presorted runs, 1 for merges of their outputs, ...
    pub level: usize,
    pub inputs: usize,
    pub records_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortStats {
    pub records_read: u64,
    /// Distinct records in the sorted file.
    pub records_written: u64,
    /// Presorted runs flushed.
    pub runs: usize,
    /// Runs flushed because the byte budget ran out before the run size.
    pub pressure_flushes: usize,
    pub merge_passes: Vec<MergePassStats>,
}

/// Sort `file` in place by `comparator`, dropping all but the first of every
/// group of equal records. Uses default settings apart from `run_size`.
pub fn sort<T, F, C>(
    file: &Path,
    temp_dir: &Path,
    factory: F,
    comparator: C,
    run_size: usize,
) -> Result<SortStats>
where
    T: Record,
    F: RecordFactory<T> + Clone,
    C: Fn(&T, &T) -> Ordering,
{
    let config = StreamConfig::default().with_run_size(run_size);
    sort_with(file, temp_dir, factory, comparator, &config)
}

/// [`sort`] with every tunable taken from `config`.
pub fn sort_with<T, F, C>(
    file: &Path,
    temp_dir: &Path,
    factory: F,
    comparator: C,
    config: &StreamConfig,
) -> Result<SortStats>
where
    T: Record,
    F: RecordFactory<T> + Clone,
    C: Fn(&T, &T) -> Ordering,
{
    let start = Instant::now();
    info!("sorting {}", file.display());

    let mut sorter = Sorter {
        temp_dir,
        factory,
        comparator: &comparator,
        config,
        options: StreamOptions::from_config(config),
        stats: SortStats::default(),
        _marker: PhantomData,
    };
    let mut runs = sorter.presort(file)?;
    debug!(
        "presort of {} produced {} runs from {} records",
        file.display(),
        runs.len(),
        sorter.stats.records_read
    );

    let fanin = config.merge_fanin();
    let mut level = 0;
    loop {
        match runs.len() {
            0 => {
                File::create(file).map_err(|e| StreamError::at(file, e))?;
                break;
            }
            1 => {
                let run = runs.remove(0);
                std::fs::copy(&run.path, file).map_err(|e| StreamError::at(file, e))?;
                sorter.stats.records_written = run.records;
                remove_scratch(run.path)?;
                break;
            }
            n if n <= fanin => {
                sorter.stats.records_written = sorter.merge_runs(runs, file, level)?;
                break;
            }
            _ => {
                runs = sorter.merge_level(runs, level)?;
                level += 1;
            }
        }
    }

    let stats = sorter.stats;
    info!(
        "sorted {}: {} records in, {} out, {} runs, {} merges in {:.2}s",
        file.display(),
        stats.records_read,
        stats.records_written,
        stats.runs,
        stats.merge_passes.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(stats)
}

/// A sorted, duplicate-free scratch stream.
struct Run {
    path: TempPath,
    records: u64,
}

/// Presort set element: orders records with the caller's comparator.
struct Ordered<'c, T, C> {
    record: T,
    cmp: &'c C,
}

impl<T, C: Fn(&T, &T) -> Ordering> Ord for Ordered<'_, T, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.record, &other.record)
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> PartialOrd for Ordered<'_, T, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> PartialEq for Ordered<'_, T, C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> Eq for Ordered<'_, T, C> {}

/// Merge heap entry: the current head of run `run`.
struct Head<'c, T, C> {
    record: T,
    run: usize,
    cmp: &'c C,
}

impl<T, C: Fn(&T, &T) -> Ordering> Ord for Head<'_, T, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; lower run index first among equals.
        (self.cmp)(&other.record, &self.record).then_with(|| other.run.cmp(&self.run))
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> PartialOrd for Head<'_, T, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> PartialEq for Head<'_, T, C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, C: Fn(&T, &T) -> Ordering> Eq for Head<'_, T, C> {}

struct Sorter<'a, T, F, C> {
    temp_dir: &'a Path,
    factory: F,
    comparator: &'a C,
    config: &'a StreamConfig,
    options: StreamOptions,
    stats: SortStats,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T, F, C> Sorter<'a, T, F, C>
where
    T: Record,
    F: RecordFactory<T> + Clone,
    C: Fn(&T, &T) -> Ordering,
{
    fn presort(&mut self, file: &Path) -> Result<Vec<Run>> {
        let mut input = RecordIterator::open_with(file, self.factory.clone(), &self.options)?;
        let mut set: BTreeSet<Ordered<'a, T, C>> = BTreeSet::new();
        let mut reservoir = MemoryReservoir::new(self.config.memory_budget);
        let mut runs = Vec::new();
        let run_size = self.config.run_size.max(1);

        while let Some((record, size)) = input.next_sized()? {
            self.stats.records_read += 1;
            let inserted = set.insert(Ordered {
                record,
                cmp: self.comparator,
            });
            if !inserted {
                continue;
            }
            reservoir.charge(size as usize + std::mem::size_of::<T>());

            if set.len() >= run_size || reservoir.is_under_pressure() {
                if set.len() < run_size {
                    debug!(
                        "memory budget of {} bytes reached after {} records",
                        reservoir.budget(),
                        set.len()
                    );
                    self.stats.pressure_flushes += 1;
                }
                runs.push(self.flush(&mut set)?);
                reservoir = MemoryReservoir::new(self.config.memory_budget);
            }
        }
        if !set.is_empty() {
            runs.push(self.flush(&mut set)?);
        }
        Ok(runs)
    }

    fn flush(&mut self, set: &mut BTreeSet<Ordered<'a, T, C>>) -> Result<Run> {
        let path = scratch_file(self.temp_dir, &self.config.temp_prefix, "run")?;
        let mut writer = RecordWriter::create_with(&path, &self.options)?;
        for entry in std::mem::take(set) {
            writer.write(&entry.record)?;
        }
        let records = writer.close()?;
        self.stats.runs += 1;
        debug!("run {}: {} records", self.stats.runs, records);
        Ok(Run { path, records })
    }

    /// Merge consecutive batches of runs, keeping the batches in input order.
    fn merge_level(&mut self, runs: Vec<Run>, level: usize) -> Result<Vec<Run>> {
        let fanin = self.config.merge_fanin();
        let mut merged = Vec::with_capacity(runs.len() / fanin + 1);
        let mut runs = runs.into_iter().peekable();
        while runs.peek().is_some() {
            let mut batch: Vec<Run> = runs.by_ref().take(fanin).collect();
            if batch.len() == 1 {
                merged.append(&mut batch);
                continue;
            }
            let path = scratch_file(self.temp_dir, &self.config.temp_prefix, "merge")?;
            let records = self.merge_runs(batch, &path, level)?;
            merged.push(Run { path, records });
        }
        debug!("merge level {} left {} runs", level, merged.len());
        Ok(merged)
    }

    /// K-way merge of `runs` into `dest`, deleting the runs afterwards.
    fn merge_runs(&mut self, runs: Vec<Run>, dest: &Path, level: usize) -> Result<u64> {
        let cmp = self.comparator;
        let mut inputs = Vec::with_capacity(runs.len());
        for run in &runs {
            inputs.push(RecordIterator::open_with(
                &run.path,
                self.factory.clone(),
                &self.options,
            )?);
        }

        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (run, input) in inputs.iter_mut().enumerate() {
            if let Some(record) = input.next().transpose()? {
                heap.push(Head { record, run, cmp });
            }
        }

        let mut writer = RecordWriter::create_with(dest, &self.options)?;
        let mut last: Option<T> = None;
        while let Some(Head { record, run, .. }) = heap.pop() {
            if let Some(next) = inputs[run].next().transpose()? {
                heap.push(Head {
                    record: next,
                    run,
                    cmp,
                });
            }
            if let Some(previous) = &last {
                if cmp(previous, &record) == Ordering::Equal {
                    continue;
                }
            }
            writer.write(&record)?;
            last = Some(record);
        }
        let written = writer.close()?;

        drop(inputs);
        let count = runs.len();
        for run in runs {
            remove_scratch(run.path)?;
        }
        debug!("merged {} runs into {} records", count, written);
        self.stats.merge_passes.push(MergePassStats {
            level,
            inputs: count,
            records_written: written,
        });
        Ok(written)
    }
}
