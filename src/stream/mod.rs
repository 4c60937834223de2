//! Record streams: append-only files of serialized records
//!
//! A stream is written once, front to back, then only ever read front to
//! back. There is no header and no index; in binary form the records sit
//! back to back, in text form there is one JSON document per line. Both
//! sides run over a decoupled pipe so disk latency overlaps with the work of
//! producing or consuming records.

mod iter;
mod writer;

use std::path::Path;

pub use iter::RecordIterator;
pub use writer::RecordWriter;

use crate::config::{wire_format, CorruptPolicy, PipeConfig, StreamConfig, WireFormat};
use crate::error::Result;
use crate::record::{Record, RecordFactory};

/// How a stream is framed and pumped; fixed when the stream is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub format: WireFormat,
    pub corrupt_policy: CorruptPolicy,
    pub pipe: PipeConfig,
}

impl Default for StreamOptions {
    /// Process-wide wire format, default pipe.
    fn default() -> Self {
        Self {
            format: wire_format(),
            corrupt_policy: CorruptPolicy::default(),
            pipe: PipeConfig::default(),
        }
    }
}

impl StreamOptions {
    /// Options for streams opened now under `config`.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            format: wire_format(),
            corrupt_policy: config.corrupt_policy,
            pipe: config.pipe.clone(),
        }
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }
}

/// Copy every record of `source` into `dest`, replacing `dest`.
pub fn copy_stream<T, F>(source: &Path, dest: &Path, factory: F, options: &StreamOptions) -> Result<u64>
where
    T: Record,
    F: RecordFactory<T>,
{
    let mut iter = RecordIterator::open_with(source, factory, options)?;
    let mut writer = RecordWriter::create_with(dest, options)?;
    for record in &mut iter {
        writer.write(&record?)?;
    }
    writer.close()
}

/// Number of records in a stream.
pub fn count_records<T, F>(path: &Path, factory: F, options: &StreamOptions) -> Result<u64>
where
    T: Record,
    F: RecordFactory<T>,
{
    let mut iter = RecordIterator::open_with(path, factory, options)?;
    let mut count = 0u64;
    while iter.next_sized()?.is_some() {
        count += 1;
    }
    Ok(count)
}
