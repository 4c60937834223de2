//! Keep or drop records by membership in a sorted id list
//!
//! One forward pass over two ascending cursors: the source records and the
//! ids. The id cursor only moves while it is behind the current record, so
//! both files are read exactly once.

use std::path::Path;
use std::time::Instant;

use log::{debug, info};

use crate::config::StreamConfig;
use crate::error::Result;
use crate::record::{IdRecord, Record, RecordFactory};
use crate::stream::{RecordIterator, RecordWriter, StreamOptions};

use super::AscendingIds;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Source records examined.
    pub read: u64,
    pub kept: u64,
}

/// Copy the records of `source` into `dest`, keeping those whose id is in
/// `id_list` (`whitelist`) or those whose id is not (`!whitelist`).
///
/// `source` must be ascending by `id_of` and `id_list` ascending.
pub fn filter<T, F, I>(
    source: &Path,
    dest: &Path,
    id_list: &Path,
    factory: F,
    id_of: I,
    whitelist: bool,
) -> Result<FilterStats>
where
    T: Record,
    F: RecordFactory<T>,
    I: Fn(&T) -> i64,
{
    filter_with(
        source,
        dest,
        id_list,
        factory,
        id_of,
        whitelist,
        &StreamConfig::default(),
    )
}

pub fn filter_with<T, F, I>(
    source: &Path,
    dest: &Path,
    id_list: &Path,
    factory: F,
    id_of: I,
    whitelist: bool,
    config: &StreamConfig,
) -> Result<FilterStats>
where
    T: Record,
    F: RecordFactory<T>,
    I: Fn(&T) -> i64,
{
    let start = Instant::now();
    let options = StreamOptions::from_config(config);
    let mut source_order = AscendingIds::new("filter source", config.check_order);
    let mut id_order = AscendingIds::new("filter id list", config.check_order);

    let mut ids = RecordIterator::open_with(id_list, IdRecord::blank, &options)?;
    let mut next_id = || -> Result<Option<i64>> {
        match ids.next().transpose()? {
            Some(IdRecord { id }) => {
                id_order.check(id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    };

    let mut input = RecordIterator::open_with(source, factory, &options)?;
    let mut writer = RecordWriter::create_with(dest, &options)?;
    let mut stats = FilterStats::default();
    let mut current = next_id()?;

    while let Some(record) = input.next().transpose()? {
        let id = id_of(&record);
        source_order.check(id)?;
        stats.read += 1;

        while let Some(listed) = current {
            if listed >= id {
                break;
            }
            current = next_id()?;
        }

        if (current == Some(id)) == whitelist {
            writer.write(&record)?;
            stats.kept += 1;
        } else if whitelist && current.is_none() {
            debug!("id list exhausted after {} records, skipping the rest", stats.read);
            input.close();
            break;
        }
    }
    writer.close()?;

    info!(
        "filtered {} into {} ({}): kept {} of {} in {:.2}s",
        source.display(),
        dest.display(),
        if whitelist { "whitelist" } else { "blacklist" },
        stats.kept,
        stats.read,
        start.elapsed().as_secs_f64()
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireFormat;
    use crate::StreamError;
    use tempfile::TempDir;

    fn write_ids(path: &Path, ids: &[i64]) {
        let opts = StreamOptions::default().with_format(WireFormat::Binary);
        let mut writer = RecordWriter::create_with(path, &opts).unwrap();
        for &id in ids {
            writer.write(&IdRecord::new(id)).unwrap();
        }
        writer.close().unwrap();
    }

    fn read_ids(path: &Path) -> Vec<i64> {
        let opts = StreamOptions::default().with_format(WireFormat::Binary);
        RecordIterator::open_with(path, IdRecord::blank, &opts)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect()
    }

    fn run(source: &[i64], list: &[i64], whitelist: bool) -> Result<(Vec<i64>, FilterStats)> {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.dat");
        let ids = dir.path().join("ids.dat");
        let dest = dir.path().join("dest.dat");
        write_ids(&src, source);
        write_ids(&ids, list);
        let stats = filter(&src, &dest, &ids, IdRecord::blank, |r: &IdRecord| r.id, whitelist)?;
        Ok((read_ids(&dest), stats))
    }

    #[test]
    fn test_empty_id_list() {
        let source = [1, 2, 3, 5, 8];
        let (kept, stats) = run(&source, &[], false).unwrap();
        assert_eq!(kept, source);
        assert_eq!(stats.kept, 5);

        let (kept, stats) = run(&source, &[], true).unwrap();
        assert!(kept.is_empty());
        assert_eq!(stats.kept, 0);
    }

    #[test]
    fn test_whitelist_and_blacklist() {
        let source = [1, 2, 2, 4, 7, 9, 12];
        let list = [0, 2, 3, 9, 10, 11, 12, 40];
        let (white, _) = run(&source, &list, true).unwrap();
        let (black, _) = run(&source, &list, false).unwrap();
        assert_eq!(white, vec![2, 2, 9, 12]);
        assert_eq!(black, vec![1, 4, 7]);
    }

    #[test]
    fn test_duplicate_ids_in_list() {
        let (kept, _) = run(&[3, 4, 5], &[3, 3, 5, 5], true).unwrap();
        assert_eq!(kept, vec![3, 5]);
    }

    #[test]
    fn test_whitelist_stops_when_ids_run_out() {
        let source: Vec<i64> = (0..1000).collect();
        let (kept, stats) = run(&source, &[1, 2], true).unwrap();
        assert_eq!(kept, vec![1, 2]);
        assert!(stats.read < 1000);
    }

    #[test]
    fn test_unsorted_id_list_is_rejected() {
        match run(&[1, 2, 3, 4], &[3, 1], true) {
            Err(StreamError::UnsortedInput { stream, .. }) => assert_eq!(stream, "filter id list"),
            other => panic!("expected unsorted input, got {:?}", other),
        }
    }

    #[test]
    fn test_unsorted_source_is_rejected() {
        match run(&[1, 5, 4], &[4], false) {
            Err(StreamError::UnsortedInput {
                previous, current, ..
            }) => {
                assert_eq!(previous, 5);
                assert_eq!(current, 4);
            }
            other => panic!("expected unsorted input, got {:?}", other),
        }
    }
}
