use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::PipeConfig;

type Chunk = io::Result<Vec<u8>>;

/// Read side of a decoupled pipe: the pump keeps the channel topped up from
/// `source` while the caller consumes.
pub struct DecoupledReader<R: Read + Send + 'static> {
    chunks: Option<Receiver<Chunk>>,
    current: Vec<u8>,
    pos: usize,
    source: Arc<Mutex<Option<R>>>,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    done: bool,
}

impl<R: Read + Send + 'static> DecoupledReader<R> {
    pub fn new(source: R, config: &PipeConfig) -> io::Result<Self> {
        let (tx, rx) = bounded(config.slots());
        let source = Arc::new(Mutex::new(Some(source)));
        let stop = Arc::new(AtomicBool::new(false));

        let pump = {
            let source = source.clone();
            let stop = stop.clone();
            let chunk_size = config.chunk_size.max(1);
            std::thread::Builder::new()
                .name("mapgen-pipe-read".into())
                .spawn(move || pump(source, tx, stop, chunk_size))?
        };

        Ok(Self {
            chunks: Some(rx),
            current: Vec::new(),
            pos: 0,
            source,
            stop,
            pump: Some(pump),
            done: false,
        })
    }

    /// Stop the pump and release the source. Safe to call more than once.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.done = true;
        // Dropping the receiver unblocks a pump waiting on a full channel.
        drop(self.chunks.take());
        drop(self.source.lock().take());
        if let Some(handle) = self.pump.take() {
            if handle.join().is_err() {
                log::warn!("read pump panicked");
            }
        }
        self.current.clear();
        self.pos = 0;
    }
}

fn pump<R: Read>(
    source: Arc<Mutex<Option<R>>>,
    tx: Sender<Chunk>,
    stop: Arc<AtomicBool>,
    chunk_size: usize,
) {
    while !stop.load(Ordering::SeqCst) {
        let mut buf = vec![0u8; chunk_size];
        let got = {
            let mut guard = source.lock();
            match guard.as_mut() {
                Some(src) => src.read(&mut buf),
                None => break,
            }
        };
        match got {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                if tx.send(Ok(buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Best effort: the consumer sees the error as its last chunk.
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

impl<R: Read + Send + 'static> Read for DecoupledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            if self.done {
                return Ok(0);
            }
            let Some(rx) = self.chunks.as_ref() else {
                return Ok(0);
            };
            match rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                // Pump finished: end of source.
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: Read + Send + 'static> Drop for DecoupledReader<R> {
    fn drop(&mut self) {
        self.close();
    }
}
