use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;

use crate::config::WireFormat;
use crate::decoupled::DecoupledWriter;
use crate::error::{Result, StreamError};
use crate::record::Record;

use super::StreamOptions;

/// Appends records to a stream. Call [`RecordWriter::close`] to learn whether
/// everything reached the destination; dropping closes best-effort.
pub struct RecordWriter<T, W: Write + Send + 'static = File> {
    out: Option<BufWriter<DecoupledWriter<W>>>,
    format: WireFormat,
    written: u64,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Record> RecordWriter<T, File> {
    /// Create (or truncate) `path` using the process-wide wire format.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with(path, &StreamOptions::default())
    }

    pub fn create_with(path: &Path, options: &StreamOptions) -> Result<Self> {
        let file = File::create(path).map_err(|e| StreamError::at(path, e))?;
        Self::from_writer(file, options)
    }
}

impl<T, W> RecordWriter<T, W>
where
    T: Record,
    W: Write + Send + 'static,
{
    /// Write records into any byte sink.
    pub fn from_writer(dest: W, options: &StreamOptions) -> Result<Self> {
        let decoupled = DecoupledWriter::new(dest, &options.pipe)?;
        Ok(Self {
            out: Some(BufWriter::with_capacity(options.pipe.chunk_size.max(1), decoupled)),
            format: options.format,
            written: 0,
            _marker: PhantomData,
        })
    }

    pub fn write(&mut self, record: &T) -> Result<()> {
        let out = self.out.as_mut().ok_or(StreamError::PipeClosed)?;
        match self.format {
            WireFormat::Binary => record.encode(out)?,
            WireFormat::Text => {
                serde_json::to_writer(&mut *out, &record.to_json()?)?;
                out.write_all(b"\n")?;
            }
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, drain the pipe and close the destination. Returns the number of
    /// records written.
    pub fn close(mut self) -> Result<u64> {
        self.finish()?;
        Ok(self.written)
    }

    fn finish(&mut self) -> Result<()> {
        let Some(out) = self.out.take() else {
            return Ok(());
        };
        let mut decoupled = out.into_inner().map_err(|e| e.into_error())?;
        decoupled.close()
    }
}

impl<T, W: Write + Send + 'static> Drop for RecordWriter<T, W> {
    fn drop(&mut self) {
        if let Some(out) = self.out.take() {
            match out.into_inner() {
                Ok(mut decoupled) => {
                    if let Err(e) = decoupled.close() {
                        log::warn!("closing record writer on drop failed: {}", e);
                    }
                }
                Err(e) => log::warn!("flushing record writer on drop failed: {}", e.error()),
            }
        }
    }
}
