//! Tunables for streams, pipes and the sort-merge operations
//!
//! Defaults match the values the map generator has always run with. Every
//! field can be overridden from the environment (`MAPGEN_*`), which is how the
//! tool and long batch runs configure themselves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Records per presorted run before a flush is forced.
pub const DEFAULT_RUN_SIZE: usize = 50_000;
/// Maximum number of runs merged in one pass.
pub const DEFAULT_MERGE_FANIN: usize = 32;
/// Buffered bytes the presort may hold before it flushes a run.
pub const DEFAULT_MEMORY_BUDGET: usize = 20 * 1024 * 1024;
/// Bytes held in flight between a caller and its background pump.
pub const DEFAULT_PIPE_CAPACITY: usize = 1 << 20;
/// Unit of transfer between a caller and its background pump.
pub const DEFAULT_PIPE_CHUNK: usize = 1 << 16;
pub const DEFAULT_DRAIN_RETRIES: u32 = 200;
pub const DEFAULT_DRAIN_BACKOFF_MS: u64 = 10;
/// Largest encoded record a decoder will accept.
pub const DEFAULT_MAX_RECORD_BYTES: u64 = 64 * 1024 * 1024;

/// On-disk framing of a record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Records back to back, no header, no separators.
    #[default]
    Binary,
    /// One JSON document per line.
    Text,
}

static TEXT_FORMAT: AtomicBool = AtomicBool::new(false);

/// Switch the framing used by every record stream opened after this call.
pub fn set_wire_format(format: WireFormat) {
    TEXT_FORMAT.store(format == WireFormat::Text, Ordering::SeqCst);
}

pub fn wire_format() -> WireFormat {
    if TEXT_FORMAT.load(Ordering::SeqCst) {
        WireFormat::Text
    } else {
        WireFormat::Binary
    }
}

static MAX_RECORD_BYTES: AtomicU64 = AtomicU64::new(DEFAULT_MAX_RECORD_BYTES);

/// Cap the size of a single decoded record. A length prefix that claims more
/// is reported as invalid data instead of being allocated.
pub fn set_max_record_bytes(limit: u64) {
    MAX_RECORD_BYTES.store(limit.max(1), Ordering::SeqCst);
}

pub fn max_record_bytes() -> u64 {
    MAX_RECORD_BYTES.load(Ordering::SeqCst)
}

/// What an iterator does with a record that fails to decode part-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptPolicy {
    /// Treat it as the end of the stream.
    #[default]
    Truncate,
    /// Return [`crate::StreamError::Corrupt`].
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub capacity: usize,
    pub chunk_size: usize,
    pub drain_retries: u32,
    pub drain_backoff_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PIPE_CAPACITY,
            chunk_size: DEFAULT_PIPE_CHUNK,
            drain_retries: DEFAULT_DRAIN_RETRIES,
            drain_backoff_ms: DEFAULT_DRAIN_BACKOFF_MS,
        }
    }
}

impl PipeConfig {
    /// Number of chunks the bounded channel holds.
    pub fn slots(&self) -> usize {
        (self.capacity / self.chunk_size.max(1)).max(1)
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.drain_backoff_ms * retry as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub run_size: usize,
    pub merge_fanin: usize,
    pub memory_budget: usize,
    pub check_order: bool,
    pub corrupt_policy: CorruptPolicy,
    pub fail_on_cycle: bool,
    /// Prefix of every scratch file created in the temp directory.
    pub temp_prefix: String,
    pub pipe: PipeConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            run_size: DEFAULT_RUN_SIZE,
            merge_fanin: DEFAULT_MERGE_FANIN,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            check_order: true,
            corrupt_policy: CorruptPolicy::Truncate,
            fail_on_cycle: false,
            temp_prefix: "mapgen".to_string(),
            pipe: PipeConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("ignoring unparsable {}={:?}", name, value);
                default
            }
        },
        Err(_) => default,
    }
}

impl StreamConfig {
    /// Defaults overridden by any `MAPGEN_*` variables that are set.
    ///
    /// `MAPGEN_TEXT_FORMAT` is not read here; it is process state, see
    /// [`StreamConfig::apply_env_wire_format`].
    pub fn from_env() -> Self {
        let d = Self::default();
        let corrupt_policy = match std::env::var("MAPGEN_CORRUPT_POLICY").as_deref() {
            Ok("fail") => CorruptPolicy::Fail,
            Ok("truncate") | Err(_) => CorruptPolicy::Truncate,
            Ok(other) => {
                log::warn!("unknown MAPGEN_CORRUPT_POLICY {:?}, using truncate", other);
                CorruptPolicy::Truncate
            }
        };
        Self {
            run_size: env_or("MAPGEN_RUN_SIZE", d.run_size),
            merge_fanin: env_or("MAPGEN_MERGE_FANIN", d.merge_fanin),
            memory_budget: env_or("MAPGEN_MEMORY_BUDGET", d.memory_budget),
            check_order: env_or("MAPGEN_CHECK_ORDER", d.check_order),
            corrupt_policy,
            fail_on_cycle: env_or("MAPGEN_FAIL_ON_CYCLE", d.fail_on_cycle),
            temp_prefix: std::env::var("MAPGEN_TEMP_PREFIX").unwrap_or(d.temp_prefix),
            pipe: PipeConfig {
                capacity: env_or("MAPGEN_PIPE_CAPACITY", d.pipe.capacity),
                chunk_size: env_or("MAPGEN_PIPE_CHUNK", d.pipe.chunk_size),
                drain_retries: env_or("MAPGEN_DRAIN_RETRIES", d.pipe.drain_retries),
                drain_backoff_ms: env_or("MAPGEN_DRAIN_BACKOFF_MS", d.pipe.drain_backoff_ms),
            },
        }
    }

    /// Set the process-wide wire format from `MAPGEN_TEXT_FORMAT`.
    pub fn apply_env_wire_format() {
        if env_or("MAPGEN_TEXT_FORMAT", false) {
            set_wire_format(WireFormat::Text);
        }
    }

    /// Set the process-wide record size cap from `MAPGEN_MAX_RECORD_BYTES`.
    pub fn apply_env_record_limit() {
        set_max_record_bytes(env_or("MAPGEN_MAX_RECORD_BYTES", DEFAULT_MAX_RECORD_BYTES));
    }

    pub fn with_run_size(mut self, run_size: usize) -> Self {
        self.run_size = run_size.max(1);
        self
    }

    /// Fan-in below 2 would never make progress.
    pub fn merge_fanin(&self) -> usize {
        self.merge_fanin.max(2)
    }
}
