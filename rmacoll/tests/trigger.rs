//! Trigger-graph handshake: liveness under a single progressing thread and
//! the firing discipline of the node graph.

mod common;

use rmacoll::transport::{RmaWindow, Transport};
use rmacoll::trigger::{DECREMENTS_PER_PEER, FlagArray, LocalCopy, PHASES, PeerBlock};
use rmacoll::{
    AlltoallvAlgorithm, AlltoallvBuffer, DataType, LoopbackFabric, LoopbackOptions, Rank,
    RmaCollConfig, TriggerGraph, alltoallv_with,
};
use std::collections::HashSet;
use std::sync::Arc;

const WORLD: usize = 4;

fn delayed(world: u32, completion_delay: u32) -> LoopbackFabric {
    LoopbackFabric::with_options(
        world,
        LoopbackOptions {
            completion_delay,
            ..LoopbackOptions::default()
        },
    )
}

// ── Liveness ────────────────────────────────────────────────────────

// Setup needs every rank at once; progress then runs from this thread only,
// one test() per rank in turn.
fn round_robin_exchange(algo: AlltoallvAlgorithm) {
    let fabric = delayed(WORLD as u32, 2);
    let comms = common::comms(&fabric, RmaCollConfig::default());
    let counts = [2usize; WORLD];
    let displs = [0usize, 2, 4, 6];

    let ranks = common::run_ranks(&comms, |comm| {
        let me = comm.rank() as u64;
        let send: Vec<u64> = (0..2 * WORLD as u64).map(|i| 100 * me + i).collect();
        let mut recv = vec![0u64; 2 * WORLD];
        let req = unsafe {
            alltoallv_with(
                comm,
                AlltoallvBuffer {
                    ptr: send.as_ptr() as u64,
                    counts: &counts,
                    displs: &displs,
                    dtype: DataType::U64,
                },
                AlltoallvBuffer {
                    ptr: recv.as_mut_ptr() as u64,
                    counts: &counts,
                    displs: &displs,
                    dtype: DataType::U64,
                },
                algo,
                false,
            )
        }
        .unwrap();
        (req, send, recv)
    });

    for (req, _, _) in &ranks {
        req.start().unwrap();
    }
    let mut done = [false; WORLD];
    for _ in 0..1000 {
        for (r, (req, _, _)) in ranks.iter().enumerate() {
            if !done[r] {
                done[r] = req.test().unwrap();
            }
        }
        if done.iter().all(|d| *d) {
            break;
        }
    }
    assert!(done.iter().all(|d| *d), "{algo} stalled: {done:?}");

    for (me, (_, _, recv)) in ranks.iter().enumerate() {
        let me = me as u64;
        let expected: Vec<u64> = (0..WORLD as u64)
            .flat_map(|j| [100 * j + 2 * me, 100 * j + 2 * me + 1])
            .collect();
        assert_eq!(recv, &expected, "rank {me} with {algo}");
    }
}

#[test]
fn trigger_pull_completes_with_one_progress_thread() {
    round_robin_exchange(AlltoallvAlgorithm::TriggerPull);
}

#[test]
fn trigger_push_completes_with_one_progress_thread() {
    round_robin_exchange(AlltoallvAlgorithm::TriggerPush);
}

// ── Firing discipline ───────────────────────────────────────────────

struct Mesh {
    graphs: Vec<TriggerGraph>,
    _send: Vec<Vec<u32>>,
    recv: Vec<Vec<u32>>,
    _windows: Vec<Arc<dyn RmaWindow>>,
}

// One word from every rank to every rank, graphs built by hand.
fn pull_mesh(fabric: &LoopbackFabric) -> Mesh {
    let transports = fabric.transports();
    let windows: Vec<Arc<dyn RmaWindow>> = transports
        .iter()
        .map(|t| t.create_window().unwrap())
        .collect();
    let send: Vec<Vec<u32>> = (0..WORLD as u32)
        .map(|r| (0..WORLD as u32).map(|j| 10 * r + j).collect())
        .collect();
    let mut recv: Vec<Vec<u32>> = vec![vec![0; WORLD]; WORLD];
    let flags: Vec<FlagArray> = (0..WORLD).map(|_| FlagArray::new(WORLD as u32)).collect();
    for r in 0..WORLD {
        unsafe {
            windows[r].attach(send[r].as_ptr() as u64, 4 * WORLD).unwrap();
            windows[r]
                .attach(recv[r].as_mut_ptr() as u64, 4 * WORLD)
                .unwrap();
            windows[r]
                .attach(flags[r].base_addr(), flags[r].byte_len())
                .unwrap();
        }
        windows[r].lock_all().unwrap();
    }
    let flag_bases: Vec<u64> = flags.iter().map(FlagArray::base_addr).collect();

    let mut graphs = Vec::new();
    for (r, f) in flags.into_iter().enumerate() {
        let blocks = (0..WORLD)
            .filter(|&p| p != r)
            .map(|p| PeerBlock {
                peer: p as Rank,
                local: recv[r].as_mut_ptr() as u64 + 4 * p as u64,
                local_count: 1,
                local_dtype: DataType::U32,
                remote: send[p].as_ptr() as u64 + 4 * r as u64,
                remote_count: 1,
                remote_dtype: DataType::U32,
                remote_flags: flag_bases[p],
            })
            .collect();
        let self_copy = LocalCopy {
            src: send[r].as_ptr() as u64 + 4 * r as u64,
            dst: recv[r].as_mut_ptr() as u64 + 4 * r as u64,
            bytes: 4,
        };
        let g = unsafe {
            TriggerGraph::pull(
                r as Rank,
                WORLD as u32,
                Arc::clone(&windows[r]),
                f,
                blocks,
                vec![self_copy],
            )
        }
        .unwrap();
        graphs.push(g);
    }
    Mesh {
        graphs,
        _send: send,
        recv,
        _windows: windows,
    }
}

#[test]
fn every_node_fires_exactly_once_per_activation() {
    let fabric = delayed(WORLD as u32, 2);
    let mut mesh = pull_mesh(&fabric);
    let peers = WORLD - 1;

    for g in &mesh.graphs {
        assert_eq!(g.nodes().len(), PHASES * peers);
        assert_eq!(g.initial_active(), DECREMENTS_PER_PEER * peers);
    }

    for epoch in 1..=2 {
        for recv in &mut mesh.recv {
            recv.fill(0);
        }
        for g in &mut mesh.graphs {
            g.activate().unwrap();
            assert_eq!(g.active(), DECREMENTS_PER_PEER * peers);
        }

        let mut seen: Vec<HashSet<(u8, Rank)>> = vec![HashSet::new(); WORLD];
        for _ in 0..200 {
            if mesh.graphs.iter().all(TriggerGraph::is_complete) {
                break;
            }
            for (r, g) in mesh.graphs.iter_mut().enumerate() {
                let before = g.active();
                let report = g.tick().unwrap();
                assert!(g.active() <= before, "counter rose on rank {r}");
                for fired in report.fired {
                    assert!(seen[r].insert(fired), "{fired:?} fired twice on rank {r}");
                }
            }
        }
        assert!(mesh.graphs.iter().all(TriggerGraph::is_complete), "epoch {epoch} stalled");

        for (r, g) in mesh.graphs.iter_mut().enumerate() {
            assert_eq!(seen[r].len(), PHASES * peers);
            assert!(g.nodes().iter().all(|n| n.fired()));
            assert_eq!(g.active(), 0);
            // Nothing is left to fire once the counter reaches zero.
            assert!(g.tick().unwrap().fired.is_empty());
        }
        for (r, recv) in mesh.recv.iter().enumerate() {
            let expected: Vec<u32> = (0..WORLD as u32).map(|j| 10 * j + r as u32).collect();
            assert_eq!(recv, &expected, "rank {r} epoch {epoch}");
        }
    }
}

#[test]
fn graph_waits_for_every_peer() {
    let fabric = delayed(WORLD as u32, 1);
    let mut mesh = pull_mesh(&fabric);
    for g in &mut mesh.graphs {
        g.activate().unwrap();
    }
    // Rank 3 never ticks, so nobody else sees its ready or done flags.
    for _ in 0..50 {
        for g in &mut mesh.graphs[..WORLD - 1] {
            g.tick().unwrap();
        }
    }
    for g in &mesh.graphs[..WORLD - 1] {
        assert!(!g.is_complete());
        assert!(g.active() > 0);
    }
    for _ in 0..200 {
        if mesh.graphs.iter().all(TriggerGraph::is_complete) {
            break;
        }
        for g in &mut mesh.graphs {
            g.tick().unwrap();
        }
    }
    assert!(mesh.graphs.iter().all(TriggerGraph::is_complete));
}
