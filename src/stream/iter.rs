use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::marker::PhantomData;
use std::path::Path;

use crate::config::{CorruptPolicy, WireFormat};
use crate::decoupled::DecoupledReader;
use crate::error::{Result, StreamError};
use crate::record::{Record, RecordFactory};

use super::StreamOptions;

/// Counts the bytes a single decode pulls out of the stream.
struct Counted<'a, R> {
    inner: &'a mut R,
    count: u64,
}

impl<R: Read> Read for Counted<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Front-to-back reader over a record stream.
///
/// The next record is always decoded ahead of time, so `has_next` is exact.
/// Reaching the end of the stream closes the underlying file; `close` can be
/// called earlier when only a prefix is needed.
pub struct RecordIterator<T, F, R: Read + Send + 'static = File> {
    input: Option<BufReader<DecoupledReader<R>>>,
    factory: F,
    format: WireFormat,
    policy: CorruptPolicy,
    next: Option<(T, u64)>,
    failed: Option<StreamError>,
    line: String,
    offset: u64,
    records: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> RecordIterator<T, F, File>
where
    T: Record,
    F: RecordFactory<T>,
{
    /// Open with the process-wide wire format.
    pub fn open(path: &Path, factory: F) -> Result<Self> {
        Self::open_with(path, factory, &StreamOptions::default())
    }

    pub fn open_with(path: &Path, factory: F, options: &StreamOptions) -> Result<Self> {
        let file = File::open(path).map_err(|e| StreamError::at(path, e))?;
        Self::from_reader(file, factory, options)
    }
}

impl<T, F, R> RecordIterator<T, F, R>
where
    T: Record,
    F: RecordFactory<T>,
    R: Read + Send + 'static,
{
    /// Iterate records from any byte source.
    pub fn from_reader(source: R, factory: F, options: &StreamOptions) -> Result<Self> {
        let decoupled = DecoupledReader::new(source, &options.pipe)?;
        let mut iter = Self {
            input: Some(BufReader::with_capacity(options.pipe.chunk_size.max(1), decoupled)),
            factory,
            format: options.format,
            policy: options.corrupt_policy,
            next: None,
            failed: None,
            line: String::new(),
            offset: 0,
            records: 0,
            _marker: PhantomData,
        };
        iter.next = iter.find_next()?;
        Ok(iter)
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some() || self.failed.is_some()
    }

    /// Next record together with the number of stream bytes it occupied.
    pub fn next_sized(&mut self) -> Result<Option<(T, u64)>> {
        if let Some(e) = self.failed.take() {
            return Err(e);
        }
        let current = self.next.take();
        if current.is_some() {
            self.records += 1;
            match self.find_next() {
                Ok(next) => self.next = next,
                Err(e) => self.failed = Some(e),
            }
        }
        Ok(current)
    }

    /// Records handed out so far.
    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Release the underlying stream; the iterator then reports no more records.
    pub fn close(&mut self) {
        self.next = None;
        self.failed = None;
        if let Some(input) = self.input.take() {
            let mut decoupled = input.into_inner();
            decoupled.close();
        }
    }

    fn find_next(&mut self) -> Result<Option<(T, u64)>> {
        let found = match self.format {
            WireFormat::Binary => self.decode_binary(),
            WireFormat::Text => self.decode_text(),
        };
        match found {
            Ok(Some((record, size))) => {
                self.offset += size;
                Ok(Some((record, size)))
            }
            other => {
                self.close();
                other
            }
        }
    }

    fn decode_binary(&mut self) -> Result<Option<(T, u64)>> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };
        let mut record = self.factory.construct();
        let mut counted = Counted {
            inner: input,
            count: 0,
        };
        match record.decode(&mut counted) {
            Ok(()) => Ok(Some((record, counted.count))),
            Err(e) => {
                let consumed = counted.count;
                match e.kind() {
                    io::ErrorKind::UnexpectedEof if consumed == 0 => Ok(None),
                    io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                        self.corrupt(e.to_string())
                    }
                    _ => Err(e.into()),
                }
            }
        }
    }

    fn decode_text(&mut self) -> Result<Option<(T, u64)>> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };
        self.line.clear();
        let n = match input.read_line(&mut self.line) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return self.corrupt(e.to_string()),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(None);
        }
        let mut record = self.factory.construct();
        let parsed = serde_json::from_str(self.line.trim_end_matches(['\r', '\n']))
            .and_then(|json| record.from_json(json));
        match parsed {
            Ok(()) => Ok(Some((record, n as u64))),
            Err(e) => self.corrupt(e.to_string()),
        }
    }

    fn corrupt(&self, reason: String) -> Result<Option<(T, u64)>> {
        match self.policy {
            CorruptPolicy::Truncate => {
                log::warn!(
                    "stream ends in a corrupt record at byte {} after {} records: {}",
                    self.offset,
                    self.records,
                    reason
                );
                Ok(None)
            }
            CorruptPolicy::Fail => Err(StreamError::Corrupt {
                consumed: self.offset,
                reason,
            }),
        }
    }
}

impl<T, F, R> Iterator for RecordIterator<T, F, R>
where
    T: Record,
    F: RecordFactory<T>,
    R: Read + Send + 'static,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_sized()
            .transpose()
            .map(|item| item.map(|(record, _)| record))
    }
}
