//! One-to-many reference resolution by sort-merge join
//!
//! Attaches to every "one" record (a way, a relation) the "many" records it
//! references (its nodes, its members) without holding either side in memory:
//!
//! 1. **Expand**: one [`Reference`] per (one, referenced id), with a
//!    placeholder many record
//! 2. **Sort** the references by (many id, one id)
//! 3. **Resolve many**: merge-join with the many stream, replacing each
//!    placeholder with the real record; references to missing ids are dropped
//! 4. **Sort** the resolved references by (one id, many id)
//! 5. **Resolve one**: merge-join with the one stream, handing each one record
//!    its group of resolved records; every one record is written
//!
//! Both input streams must be ascending by id. The one and many files are
//! only read; all intermediates live in the temp directory and are removed
//! once the next phase has consumed them.

use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};
use serde::de::Error as _;
use serde_json::{json, Value};

use crate::config::StreamConfig;
use crate::error::Result;
use crate::record::{read_i64, write_i64, Record, RecordFactory};
use crate::stream::{RecordIterator, RecordWriter, StreamOptions};

use super::sorter::sort_with;
use super::{remove_scratch, scratch_file, AscendingIds};

/// Access to the id of a referenced ("many") record.
pub trait ReferredHandler<M> {
    fn id(&self, many: &M) -> i64;

    /// Used to build placeholders for ids that are not resolved yet.
    fn set_id(&self, many: &mut M, id: i64);
}

/// Access to the id and outgoing references of a referencing ("one") record.
pub trait RefererHandler<O, M> {
    fn id(&self, one: &O) -> i64;

    fn refs(&self, one: &O) -> Vec<i64>;

    /// Called at most once per one record, with the referenced records that
    /// exist, ordered by id.
    fn set_resolved_refs(&self, one: &mut O, refs: Vec<M>);
}

/// Join row linking a one id to a many id and, once resolved, the many record.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference<M> {
    pub one_id: i64,
    pub many_id: i64,
    pub many: M,
}

impl<M> Reference<M> {
    pub fn new(one_id: i64, many_id: i64, many: M) -> Self {
        Self {
            one_id,
            many_id,
            many,
        }
    }
}

impl<M: Record> Record for Reference<M> {
    fn encode<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        write_i64(out, self.one_id)?;
        write_i64(out, self.many_id)?;
        self.many.encode(out)
    }

    fn decode<R: std::io::Read>(&mut self, input: &mut R) -> std::io::Result<()> {
        self.one_id = read_i64(input)?;
        self.many_id = read_i64(input)?;
        self.many.decode(input)
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        Ok(json!({
            "one": self.one_id,
            "many": self.many_id,
            "ref": self.many.to_json()?,
        }))
    }

    fn from_json(&mut self, mut json: Value) -> serde_json::Result<()> {
        self.one_id = json_id(&json, "one")?;
        self.many_id = json_id(&json, "many")?;
        let many = json
            .get_mut("ref")
            .map(Value::take)
            .ok_or_else(|| serde_json::Error::missing_field("ref"))?;
        self.many.from_json(many)
    }
}

fn json_id(json: &Value, field: &'static str) -> serde_json::Result<i64> {
    json.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| serde_json::Error::missing_field(field))
}

/// Blank references around blank many records.
#[derive(Clone)]
struct ReferenceFactory<F> {
    many: F,
}

impl<M, F: RecordFactory<M>> RecordFactory<Reference<M>> for ReferenceFactory<F> {
    fn construct(&self) -> Reference<M> {
        Reference::new(-1, -1, self.many.construct())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// One records read and written.
    pub ones: u64,
    /// References emitted by the expand phase, duplicates included.
    pub references: u64,
    /// Distinct references whose many record was found.
    pub resolved: u64,
    /// Distinct references whose many record does not exist.
    pub dropped: u64,
    /// One records that received at least one resolved reference.
    pub matched_ones: u64,
}

/// Resolve the references of `one_file` against `many_file` into `dest`,
/// sorting intermediates with `run_size` records per run.
///
/// `dest` must be a different file from both inputs.
#[allow(clippy::too_many_arguments)]
pub fn resolve_references<O, M, FO, FM, HM, HO>(
    dest: &Path,
    one_file: &Path,
    many_file: &Path,
    temp_dir: &Path,
    one_factory: FO,
    many_factory: FM,
    referred: &HM,
    referer: &HO,
    run_size: usize,
) -> Result<ResolveStats>
where
    O: Record,
    M: Record + Clone,
    FO: RecordFactory<O> + Clone,
    FM: RecordFactory<M> + Clone,
    HM: ReferredHandler<M>,
    HO: RefererHandler<O, M>,
{
    let config = StreamConfig::default().with_run_size(run_size);
    resolve_references_with(
        dest,
        one_file,
        many_file,
        temp_dir,
        one_factory,
        many_factory,
        referred,
        referer,
        &config,
    )
}

/// [`resolve_references`] with every tunable taken from `config`.
#[allow(clippy::too_many_arguments)]
pub fn resolve_references_with<O, M, FO, FM, HM, HO>(
    dest: &Path,
    one_file: &Path,
    many_file: &Path,
    temp_dir: &Path,
    one_factory: FO,
    many_factory: FM,
    referred: &HM,
    referer: &HO,
    config: &StreamConfig,
) -> Result<ResolveStats>
where
    O: Record,
    M: Record + Clone,
    FO: RecordFactory<O> + Clone,
    FM: RecordFactory<M> + Clone,
    HM: ReferredHandler<M>,
    HO: RefererHandler<O, M>,
{
    let start = Instant::now();
    info!(
        "resolving references of {} against {}",
        one_file.display(),
        many_file.display()
    );

    let resolver = Resolver {
        temp_dir,
        config,
        options: StreamOptions::from_config(config),
        refs: ReferenceFactory {
            many: many_factory.clone(),
        },
    };
    let mut stats = ResolveStats::default();

    let expanded = resolver.expand(
        one_file,
        one_factory.clone(),
        &many_factory,
        referred,
        referer,
        &mut stats,
    )?;
    let by_many = |a: &Reference<M>, b: &Reference<M>| {
        (a.many_id, a.one_id).cmp(&(b.many_id, b.one_id))
    };
    sort_with(&expanded, temp_dir, resolver.refs.clone(), by_many, config)?;

    let resolved =
        resolver.resolve_many(&expanded, many_file, many_factory, referred, &mut stats)?;
    remove_scratch(expanded)?;

    let by_one = |a: &Reference<M>, b: &Reference<M>| {
        (a.one_id, a.many_id).cmp(&(b.one_id, b.many_id))
    };
    sort_with(&resolved, temp_dir, resolver.refs.clone(), by_one, config)?;

    resolver.resolve_ones(dest, &resolved, one_file, one_factory, referer, &mut stats)?;
    remove_scratch(resolved)?;

    if stats.dropped > 0 {
        warn!(
            "{} references from {} point to records missing from {}",
            stats.dropped,
            one_file.display(),
            many_file.display()
        );
    }
    info!(
        "resolved {} of {} references for {} records ({} matched) in {:.2}s",
        stats.resolved,
        stats.references,
        stats.ones,
        stats.matched_ones,
        start.elapsed().as_secs_f64()
    );
    Ok(stats)
}

struct Resolver<'a, FM> {
    temp_dir: &'a Path,
    config: &'a StreamConfig,
    options: StreamOptions,
    refs: ReferenceFactory<FM>,
}

impl<FM: Clone> Resolver<'_, FM> {
    fn expand<O, M, FO, HM, HO>(
        &self,
        one_file: &Path,
        one_factory: FO,
        many_factory: &FM,
        referred: &HM,
        referer: &HO,
        stats: &mut ResolveStats,
    ) -> Result<tempfile::TempPath>
    where
        O: Record,
        M: Record,
        FO: RecordFactory<O>,
        FM: RecordFactory<M>,
        HM: ReferredHandler<M>,
        HO: RefererHandler<O, M>,
    {
        let path = scratch_file(self.temp_dir, &self.config.temp_prefix, "reference")?;
        let mut ones = RecordIterator::open_with(one_file, one_factory, &self.options)?;
        let mut order = AscendingIds::new("one stream", self.config.check_order);
        let mut writer = RecordWriter::create_with(&path, &self.options)?;

        while let Some(one) = ones.next().transpose()? {
            let one_id = referer.id(&one);
            order.check(one_id)?;
            stats.ones += 1;
            for many_id in referer.refs(&one) {
                let mut placeholder = many_factory.construct();
                referred.set_id(&mut placeholder, many_id);
                writer.write(&Reference::new(one_id, many_id, placeholder))?;
            }
        }
        stats.references = writer.close()?;
        debug!("expanded {} records into {} references", stats.ones, stats.references);
        Ok(path)
    }

    /// Join references sorted by many id with the many stream.
    fn resolve_many<M, HM>(
        &self,
        references: &Path,
        many_file: &Path,
        many_factory: FM,
        referred: &HM,
        stats: &mut ResolveStats,
    ) -> Result<tempfile::TempPath>
    where
        M: Record + Clone,
        FM: RecordFactory<M>,
        HM: ReferredHandler<M>,
    {
        let path = scratch_file(self.temp_dir, &self.config.temp_prefix, "resolvedref")?;
        let mut refs: RecordIterator<Reference<M>, _> =
            RecordIterator::open_with(references, self.refs.clone(), &self.options)?;
        let mut manys = RecordIterator::open_with(many_file, many_factory, &self.options)?;
        let mut order = AscendingIds::new("many stream", self.config.check_order);
        let mut next_many = || -> Result<Option<M>> {
            match manys.next().transpose()? {
                Some(many) => {
                    order.check(referred.id(&many))?;
                    Ok(Some(many))
                }
                None => Ok(None),
            }
        };
        let mut writer = RecordWriter::create_with(&path, &self.options)?;

        let mut many = next_many()?;
        while let Some(mut reference) = refs.next().transpose()? {
            while let Some(current) = &many {
                if referred.id(current) >= reference.many_id {
                    break;
                }
                many = next_many()?;
            }
            match &many {
                Some(current) if referred.id(current) == reference.many_id => {
                    reference.many = current.clone();
                    writer.write(&reference)?;
                    stats.resolved += 1;
                }
                _ => stats.dropped += 1,
            }
        }
        writer.close()?;
        debug!("{} references resolved, {} dropped", stats.resolved, stats.dropped);
        Ok(path)
    }

    /// Join resolved references sorted by one id with the one stream.
    fn resolve_ones<O, M, FO, HO>(
        &self,
        dest: &Path,
        resolved: &Path,
        one_file: &Path,
        one_factory: FO,
        referer: &HO,
        stats: &mut ResolveStats,
    ) -> Result<()>
    where
        O: Record,
        M: Record + Clone,
        FO: RecordFactory<O>,
        FM: RecordFactory<M>,
        HO: RefererHandler<O, M>,
    {
        let refs = RecordIterator::open_with(resolved, self.refs.clone(), &self.options)?;
        let mut groups = ReferenceGroups::new(refs)?;
        let mut ones = RecordIterator::open_with(one_file, one_factory, &self.options)?;
        let mut writer = RecordWriter::create_with(dest, &self.options)?;

        while let Some(mut one) = ones.next().transpose()? {
            let group = groups.take(referer.id(&one))?;
            if !group.is_empty() {
                referer.set_resolved_refs(&mut one, group);
                stats.matched_ones += 1;
            }
            writer.write(&one)?;
        }
        writer.close()?;

        let unmatched = groups.discard_rest()?;
        if unmatched > 0 {
            debug!("{} resolved references had no one record", unmatched);
        }
        Ok(())
    }
}

/// Lookahead over references sorted by one id, handing them out per one id.
///
/// One records sharing an id each get the same group.
struct ReferenceGroups<M, F> {
    input: RecordIterator<Reference<M>, ReferenceFactory<F>>,
    pending: Option<Reference<M>>,
    last: Option<(i64, Vec<M>)>,
}

impl<M, F> ReferenceGroups<M, F>
where
    M: Record + Clone,
    F: RecordFactory<M>,
{
    fn new(mut input: RecordIterator<Reference<M>, ReferenceFactory<F>>) -> Result<Self> {
        let pending = input.next().transpose()?;
        Ok(Self {
            input,
            pending,
            last: None,
        })
    }

    /// The many records referenced by `one_id`; empty if there are none.
    /// Groups for smaller ids that were never asked for are skipped.
    fn take(&mut self, one_id: i64) -> Result<Vec<M>> {
        if let Some((id, group)) = &self.last {
            if *id == one_id {
                return Ok(group.clone());
            }
        }
        let mut group = Vec::new();
        while let Some(reference) = self.pending.take() {
            if reference.one_id > one_id {
                self.pending = Some(reference);
                break;
            }
            if reference.one_id == one_id {
                group.push(reference.many);
            }
            self.pending = self.input.next().transpose()?;
        }
        self.last = Some((one_id, group.clone()));
        Ok(group)
    }

    fn discard_rest(&mut self) -> Result<u64> {
        let mut count = 0;
        while self.pending.take().is_some() {
            count += 1;
            self.pending = self.input.next().transpose()?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireFormat;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Node {
        id: i64,
        lat: i32,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Way {
        id: i64,
        refs: Vec<i64>,
        nodes: Vec<Node>,
    }

    crate::serde_record!(Node, Way);

    struct NodeHandler;

    impl ReferredHandler<Node> for NodeHandler {
        fn id(&self, many: &Node) -> i64 {
            many.id
        }

        fn set_id(&self, many: &mut Node, id: i64) {
            many.id = id;
        }
    }

    struct WayHandler;

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

    fn opts() -> StreamOptions {
        StreamOptions::default().with_format(WireFormat::Binary)
    }

    fn write<T: Record>(path: &Path, records: &[T]) {
        let mut writer = RecordWriter::create_with(path, &opts()).unwrap();
        for record in records {
            writer.write(record).unwrap();
        }
        writer.close().unwrap();
    }

    fn way(id: i64, refs: &[i64]) -> Way {
        Way {
            id,
            refs: refs.to_vec(),
            nodes: Vec::new(),
        }
    }

    fn node(id: i64) -> Node {
        Node {
            id,
            lat: id as i32 * 10,
        }
    }

    fn resolve(ways: &[Way], nodes: &[Node]) -> (Vec<Way>, ResolveStats) {
        let dir = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let one = dir.path().join("ways.dat");
        let many = dir.path().join("nodes.dat");
        let dest = dir.path().join("resolved.dat");
        write(&one, ways);
        write(&many, nodes);

        let stats = resolve_references(
            &dest,
            &one,
            &many,
            tmp.path(),
            Way::default,
            Node::default,
            &NodeHandler,
            &WayHandler,
            4,
        )
        .unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);

        let out = RecordIterator::open_with(&dest, Way::default, &opts())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        (out, stats)
    }

    #[test]
    fn test_empty_streams() {
        let (out, stats) = resolve(&[], &[]);
        assert!(out.is_empty());
        assert_eq!(stats, ResolveStats::default());
    }

    #[test]
    fn test_single_way() {
        let (out, stats) = resolve(&[way(1, &[5, 6])], &[node(5), node(6)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 1);
        assert_eq!(out[0].nodes, vec![node(5), node(6)]);
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.matched_ones, 1);
    }

    #[test]
    fn test_missing_reference_is_dropped() {
        let (out, stats) = resolve(&[way(1, &[5, 7, 6])], &[node(5), node(6)]);
        assert_eq!(out[0].nodes, vec![node(5), node(6)]);
        assert_eq!(stats.references, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_unmatched_ones_pass_through_in_order() {
        let ways = [way(1, &[100]), way(2, &[3, 1]), way(4, &[]), way(9, &[3])];
        let nodes = [node(1), node(2), node(3)];
        let (out, stats) = resolve(&ways, &nodes);

        assert_eq!(out.iter().map(|w| w.id).collect::<Vec<_>>(), vec![1, 2, 4, 9]);
        assert_eq!(out[0], ways[0]);
        assert_eq!(out[1].nodes, vec![node(1), node(3)]);
        assert_eq!(out[2], ways[2]);
        assert_eq!(out[3].nodes, vec![node(3)]);
        assert_eq!(stats.ones, 4);
        assert_eq!(stats.matched_ones, 2);
    }

    #[test]
    fn test_repeated_reference_resolves_once() {
        let (out, stats) = resolve(&[way(1, &[2, 2, 2])], &[node(2)]);
        assert_eq!(out[0].nodes, vec![node(2)]);
        assert_eq!(stats.references, 3);
        assert_eq!(stats.resolved, 1);
    }

    #[test]
    fn test_ones_sharing_an_id_share_the_group() {
        let ways = [way(1, &[5]), way(1, &[6]), way(2, &[6])];
        let (out, stats) = resolve(&ways, &[node(5), node(6)]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].nodes, vec![node(5), node(6)]);
        assert_eq!(out[1].nodes, vec![node(5), node(6)]);
        assert_eq!(out[2].nodes, vec![node(6)]);
        assert_eq!(stats.matched_ones, 3);
    }

    #[test]
    fn test_unsorted_many_stream_is_rejected() {
        let dir = TempDir::new().unwrap();
        let one = dir.path().join("ways.dat");
        let many = dir.path().join("nodes.dat");
        let dest = dir.path().join("resolved.dat");
        write(&one, &[way(1, &[1, 2, 3])]);
        write(&many, &[node(2), node(1), node(3)]);

        let err = resolve_references(
            &dest,
            &one,
            &many,
            dir.path(),
            Way::default,
            Node::default,
            &NodeHandler,
            &WayHandler,
            100,
        )
        .unwrap_err();
        assert!(matches!(err, crate::StreamError::UnsortedInput { stream: "many stream", .. }));
    }

    #[test]
    fn test_reference_json() {
        let reference = Reference::new(3, 7, node(7));
        let json = reference.to_json().unwrap();
        assert_eq!(json["one"], 3);
        assert_eq!(json["ref"]["lat"], 70);

        let mut back = Reference::new(-1, -1, Node::default());
        back.from_json(json).unwrap();
        assert_eq!(back, reference);

        let err = back.from_json(serde_json::json!({"one": 1})).unwrap_err();
        assert!(err.to_string().contains("many"));
    }
}
