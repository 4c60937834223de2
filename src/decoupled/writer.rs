use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::PipeConfig;
use crate::error::{Result, StreamError};

struct Shared<W> {
    dest: Mutex<Option<W>>,
    /// Bytes handed to the pump and not yet written to `dest`.
    pending: AtomicUsize,
    failed: AtomicBool,
    failure: Mutex<Option<io::Error>>,
}

/// Write side of a decoupled pipe: the caller fills chunks, the pump drains
/// them into `dest`.
pub struct DecoupledWriter<W: Write + Send + 'static> {
    chunks: Option<Sender<Vec<u8>>>,
    staging: Vec<u8>,
    shared: Arc<Shared<W>>,
    pump: Option<JoinHandle<()>>,
    config: PipeConfig,
    closed: bool,
}

impl<W: Write + Send + 'static> DecoupledWriter<W> {
    pub fn new(dest: W, config: &PipeConfig) -> io::Result<Self> {
        let (tx, rx) = bounded(config.slots());
        let shared = Arc::new(Shared {
            dest: Mutex::new(Some(dest)),
            pending: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let pump = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("mapgen-pipe-write".into())
                .spawn(move || pump(rx, shared))?
        };

        Ok(Self {
            chunks: Some(tx),
            staging: Vec::with_capacity(config.chunk_size),
            shared,
            pump: Some(pump),
            config: config.clone(),
            closed: false,
        })
    }

    /// Bytes accepted but not yet in the destination.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst) + self.staging.len()
    }

    fn pump_failure(&self) -> Option<io::Error> {
        if !self.shared.failed.load(Ordering::SeqCst) {
            return None;
        }
        self.shared
            .failure
            .lock()
            .as_ref()
            .map(|e| io::Error::new(e.kind(), e.to_string()))
    }

    fn send_staging(&mut self) -> io::Result<()> {
        if let Some(e) = self.pump_failure() {
            return Err(e);
        }
        if self.staging.is_empty() {
            return Ok(());
        }
        let Some(tx) = self.chunks.as_ref() else {
            return Err(StreamError::PipeClosed.into());
        };
        let chunk = std::mem::replace(&mut self.staging, Vec::with_capacity(self.config.chunk_size));
        let len = chunk.len();
        self.shared.pending.fetch_add(len, Ordering::SeqCst);
        if tx.send(chunk).is_err() {
            self.shared.pending.fetch_sub(len, Ordering::SeqCst);
            return Err(self
                .pump_failure()
                .unwrap_or_else(|| StreamError::PipeClosed.into()));
        }
        Ok(())
    }

    /// Drain everything into the destination and close it.
    ///
    /// Waits with linearly growing backoff for the pump to catch up and gives
    /// up with [`StreamError::DrainTimeout`] once the retry budget is spent.
    /// Calling it again after it returned is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error: Option<StreamError> = self.send_staging().err().map(StreamError::from);

        let max_retry = self.config.drain_retries.max(1);
        let mut retry = 1;
        while self.shared.pending.load(Ordering::SeqCst) > 0 && retry < max_retry {
            if let Err(e) = self.send_staging() {
                first_error.get_or_insert(e.into());
            }
            std::thread::sleep(self.config.backoff(retry));
            retry += 1;
        }
        let pending = self.shared.pending.load(Ordering::SeqCst);
        let timed_out = pending > 0;

        // No more chunks: the pump exits once the channel is empty.
        drop(self.chunks.take());
        if let Some(handle) = self.pump.take() {
            if timed_out {
                log::warn!("write pump still busy with {} bytes, detaching", pending);
            } else if handle.join().is_err() {
                log::warn!("write pump panicked");
            }
        }

        let lock_wait = self.config.backoff(max_retry);
        match self.shared.dest.try_lock_for(lock_wait) {
            Some(mut guard) => {
                if let Some(mut dest) = guard.take() {
                    if let Err(e) = dest.flush() {
                        first_error.get_or_insert(e.into());
                    }
                }
            }
            None => log::warn!("destination still locked by the pump, leaving it open"),
        }

        if let Some(e) = self.pump_failure() {
            first_error.get_or_insert(e.into());
        }
        if timed_out {
            return Err(StreamError::DrainTimeout {
                retries: max_retry,
                pending,
            });
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn pump<W: Write>(rx: Receiver<Vec<u8>>, shared: Arc<Shared<W>>) {
    for chunk in rx.iter() {
        let written = {
            let mut guard = shared.dest.lock();
            match guard.as_mut() {
                Some(dest) => dest.write_all(&chunk),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "destination closed")),
            }
        };
        match written {
            Ok(()) => {
                shared.pending.fetch_sub(chunk.len(), Ordering::SeqCst);
            }
            Err(e) => {
                *shared.failure.lock() = Some(e);
                shared.failed.store(true, Ordering::SeqCst);
                shared.pending.store(0, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl<W: Write + Send + 'static> Write for DecoupledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(StreamError::PipeClosed.into());
        }
        self.staging.extend_from_slice(buf);
        if self.staging.len() >= self.config.chunk_size {
            self.send_staging()?;
        }
        Ok(buf.len())
    }

    /// Hands buffered bytes to the pump; it does not wait for the destination.
    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.send_staging()
    }
}

impl<W: Write + Send + 'static> Drop for DecoupledWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("closing decoupled writer on drop failed: {}", e);
        }
    }
}
