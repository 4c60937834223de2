#![allow(dead_code)]

use std::path::{Path, PathBuf};

use mapgen_io::{
    Record, RecordIterator, RecordWriter, ReferredHandler, RefererHandler, StreamOptions,
    WireFormat,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

/// Data directory plus a separate scratch directory, so tests can check
/// that operations clean up after themselves.
pub struct Workspace {
    data: TempDir,
    scratch: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            data: TempDir::new().expect("Failed to create data directory"),
            scratch: TempDir::new().expect("Failed to create scratch directory"),
        }
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.data.path().join(name)
    }

    pub fn scratch(&self) -> &Path {
        self.scratch.path()
    }

    pub fn scratch_files(&self) -> usize {
        std::fs::read_dir(self.scratch.path()).unwrap().count()
    }
}

pub fn binary() -> StreamOptions {
    StreamOptions::default().with_format(WireFormat::Binary)
}

pub fn write_records<T: Record>(path: &Path, records: &[T]) {
    let mut writer = RecordWriter::create_with(path, &binary()).unwrap();
    for record in records {
        writer.write(record).unwrap();
    }
    assert_eq!(writer.close().unwrap(), records.len() as u64);
}

pub fn read_records<T: Record>(path: &Path, factory: fn() -> T) -> Vec<T> {
    RecordIterator::open_with(path, factory, &binary())
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub lat: i32,
    pub lon: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Vec<(String, String)>,
    pub nodes: Vec<Node>,
}

mapgen_io::serde_record!(Node, Way);

pub fn node(id: i64) -> Node {
    Node {
        id,
        lat: (id * 3) as i32,
        lon: -(id as i32),
    }
}

pub fn way(id: i64, refs: &[i64]) -> Way {
    Way {
        id,
        refs: refs.to_vec(),
        tags: vec![("highway".to_string(), format!("road-{}", id))],
        nodes: Vec::new(),
    }
}

pub struct NodeHandler;

impl ReferredHandler<Node> for NodeHandler {
    fn id(&self, many: &Node) -> i64 {
        many.id
    }

    fn set_id(&self, many: &mut Node, id: i64) {
        many.id = id;
    }
}

pub struct WayHandler;

impl RefererHandler<Way, Node> for WayHandler {
    fn id(&self, one: &Way) -> i64 {
        one.id
    }

    fn refs(&self, one: &Way) -> Vec<i64> {
        one.refs.clone()
    }

    fn set_resolved_refs(&self, one: &mut Way, refs: Vec<Node>) {
        one.nodes = refs;
    }
}
