mod common;
use common::{node, read_records, way, write_records, Node, NodeHandler, Way, WayHandler, Workspace};

use mapgen_io::{resolve_references, resolve_references_with, StreamConfig, StreamError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn resolve(ws: &Workspace, ways: &[Way], nodes: &[Node], run_size: usize) -> Vec<Way> {
    let one = ws.file("ways.dat");
    let many = ws.file("nodes.dat");
    let dest = ws.file("resolved.dat");
    write_records(&one, ways);
    write_records(&many, nodes);
    resolve_references(
        &dest,
        &one,
        &many,
        ws.scratch(),
        Way::default,
        Node::default,
        &NodeHandler,
        &WayHandler,
        run_size,
    )
    .unwrap();
    assert_eq!(ws.scratch_files(), 0);
    read_records(&dest, Way::default)
}

#[test]
fn test_every_existing_reference_resolves_once() {
    let ws = Workspace::new();
    let mut rng = StdRng::seed_from_u64(1234);

    // Only even node ids exist.
    let nodes: Vec<Node> = (0..3_000).filter(|id| id % 2 == 0).map(node).collect();
    let ways: Vec<Way> = (0..800)
        .map(|id| {
            let refs: Vec<i64> = (0..rng.gen_range(0..12))
                .map(|_| rng.gen_range(0..3_200))
                .collect();
            way(id * 3, &refs)
        })
        .collect();

    let resolved = resolve(&ws, &ways, &nodes, 256);
    assert_eq!(resolved.len(), ways.len());

    for (before, after) in ways.iter().zip(&resolved) {
        assert_eq!(after.id, before.id);
        assert_eq!(after.refs, before.refs);
        assert_eq!(after.tags, before.tags);

        let mut expected: Vec<i64> = before
            .refs
            .iter()
            .copied()
            .filter(|id| id % 2 == 0 && *id < 3_000)
            .collect();
        expected.sort_unstable();
        expected.dedup();
        let expected: Vec<Node> = expected.into_iter().map(node).collect();
        assert_eq!(after.nodes, expected, "way {}", before.id);
    }
}

#[test]
fn test_ways_without_matches_are_unchanged() {
    let ws = Workspace::new();
    let ways = vec![way(1, &[]), way(2, &[99]), way(3, &[10]), way(5, &[])];
    let nodes = vec![node(10), node(11)];

    let resolved = resolve(&ws, &ways, &nodes, 50_000);
    assert_eq!(resolved[0], ways[0]);
    assert_eq!(resolved[1], ways[1]);
    assert_eq!(resolved[2].nodes, vec![node(10)]);
    assert_eq!(resolved[3], ways[3]);
}

#[test]
fn test_nodes_without_referrers_are_skipped() {
    let ws = Workspace::new();
    let nodes: Vec<Node> = (0..10_000).map(node).collect();
    let ways = vec![way(7, &[9_999, 0, 5_000])];

    let resolved = resolve(&ws, &ways, &nodes, 1_000);
    assert_eq!(resolved[0].nodes, vec![node(0), node(5_000), node(9_999)]);
}

#[test]
fn test_unsorted_ways_are_rejected() {
    let ws = Workspace::new();
    let one = ws.file("ways.dat");
    let many = ws.file("nodes.dat");
    write_records(&one, &[way(2, &[1]), way(1, &[1])]);
    write_records(&many, &[node(1)]);

    let err = resolve_references_with(
        &ws.file("resolved.dat"),
        &one,
        &many,
        ws.scratch(),
        Way::default,
        Node::default,
        &NodeHandler,
        &WayHandler,
        &StreamConfig::default(),
    )
    .unwrap_err();
    match err {
        StreamError::UnsortedInput {
            stream,
            previous,
            current,
        } => {
            assert_eq!(stream, "one stream");
            assert_eq!((previous, current), (2, 1));
        }
        other => panic!("expected unsorted input, got {:?}", other),
    }
}

#[test]
fn test_order_check_can_be_disabled() {
    let ws = Workspace::new();
    let one = ws.file("ways.dat");
    let many = ws.file("nodes.dat");
    let dest = ws.file("resolved.dat");
    write_records(&one, &[way(2, &[1]), way(1, &[1])]);
    write_records(&many, &[node(1)]);

    let config = StreamConfig {
        check_order: false,
        ..StreamConfig::default()
    };
    let stats = resolve_references_with(
        &dest,
        &one,
        &many,
        ws.scratch(),
        Way::default,
        Node::default,
        &NodeHandler,
        &WayHandler,
        &config,
    )
    .unwrap();
    assert_eq!(stats.ones, 2);
    assert_eq!(read_records(&dest, Way::default).len(), 2);
}
