//! mapgen-io - Out-of-core record streams for map generation
//!
//! This crate provides the disk-backed building blocks the map generator uses
//! to work on more entities than fit in memory: sequential record streams,
//! an external merge sort, a sorted-set filter and sort-merge reference
//! resolution. Every stream is pumped by a background thread so disk latency
//! overlaps with the work on either side.

/// Tunables and the process-wide wire format
pub mod config;
/// Background pumps between callers and slow streams
pub mod decoupled;
/// Error type shared by every stream operation
pub mod error;
/// Record trait, factories and the id record
pub mod record;
/// Sort, filter and resolve over record streams
pub mod sort_merge;
/// Record stream writer and iterator
pub mod stream;

pub use config::{
    max_record_bytes, set_max_record_bytes, set_wire_format, wire_format, CorruptPolicy,
    PipeConfig, StreamConfig, WireFormat,
};
pub use error::{Result, StreamError};
pub use record::{IdRecord, Record, RecordFactory};
pub use sort_merge::{
    filter, filter_with, resolve_references, resolve_references_with, resolve_self_references,
    sort, sort_with, CycleReport, FilterStats, MemoryReservoir, MergePassStats, Reference,
    ReferredHandler, RefererHandler, ResolveStats, SelfResolveOutcome, SortStats,
};
pub use stream::{copy_stream, count_records, RecordIterator, RecordWriter, StreamOptions};
