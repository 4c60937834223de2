//! Decoupled I/O: a background pump between the caller and a slow stream
//!
//! Each pipe owns one dedicated thread and a bounded channel of byte chunks.
//! Reads are served from chunks the pump has already fetched; writes are
//! handed to the pump and land in the destination later. A full channel
//! blocks the producer, an empty one blocks the consumer.
//!
//! The wrapped stream lives behind a mutex so the pump and the owning side
//! (closing it) never touch it at the same time.

mod reader;
mod writer;

pub use reader::DecoupledReader;
pub use writer::DecoupledWriter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipeConfig;
    use crate::StreamError;
    use parking_lot::Mutex;
    use std::io::{self, Read, Write};
    use std::sync::Arc;
    use std::time::Duration;

    /// Sink whose bytes stay observable after the writer is gone.
    #[derive(Clone, Default)]
    struct SharedSink {
        bytes: Arc<Mutex<Vec<u8>>>,
        delay: Option<Duration>,
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.bytes.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSource {
        served: bool,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "device gone"));
            }
            self.served = true;
            buf[..3].copy_from_slice(b"abc");
            Ok(3)
        }
    }

    fn small_pipe() -> PipeConfig {
        PipeConfig {
            capacity: 64,
            chunk_size: 16,
            ..PipeConfig::default()
        }
    }

    #[test]
    fn test_reader_delivers_all_bytes_in_order() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = DecoupledReader::new(io::Cursor::new(data.clone()), &small_pipe()).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        // Exhausted pipes keep reporting end of stream.
        assert_eq!(reader.read(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn test_reader_early_close() {
        let data = vec![7u8; 100_000];
        let mut reader = DecoupledReader::new(io::Cursor::new(data), &small_pipe()).unwrap();
        let mut head = [0u8; 10];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(head, [7u8; 10]);
        reader.close();
        assert_eq!(reader.read(&mut head).unwrap(), 0);
    }

    #[test]
    fn test_reader_forwards_source_error() {
        let mut reader = DecoupledReader::new(FailingSource { served: false }, &small_pipe()).unwrap();
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_writer_drains_on_close() {
        let sink = SharedSink::default();
        let mut writer = DecoupledWriter::new(sink.clone(), &small_pipe()).unwrap();
        for i in 0..1000u32 {
            writer.write_all(&i.to_le_bytes()).unwrap();
        }
        writer.close().unwrap();

        let bytes = sink.bytes.lock();
        assert_eq!(bytes.len(), 4000);
        assert_eq!(&bytes[3996..], &999u32.to_le_bytes());
    }

    #[test]
    fn test_writer_close_times_out_on_stalled_sink() {
        let sink = SharedSink {
            delay: Some(Duration::from_millis(300)),
            ..SharedSink::default()
        };
        let config = PipeConfig {
            capacity: 64,
            chunk_size: 16,
            drain_retries: 3,
            drain_backoff_ms: 1,
        };
        let mut writer = DecoupledWriter::new(sink, &config).unwrap();
        writer.write_all(&[1u8; 48]).unwrap();
        match writer.close() {
            Err(StreamError::DrainTimeout { retries, pending }) => {
                assert_eq!(retries, 3);
                assert!(pending > 0);
            }
            other => panic!("expected drain timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut writer = DecoupledWriter::new(SharedSink::default(), &small_pipe()).unwrap();
        writer.close().unwrap();
        assert!(writer.write_all(b"late").is_err());
        // A second close is a no-op.
        writer.close().unwrap();
    }
}
