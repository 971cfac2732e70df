//! End-to-end cluster tests over real localhost sockets.
//!
//! Each test runs a small in-process cluster with low difficulty and a
//! short run budget, then checks the safety and progress invariants. All
//! tests use `#[serial]` to avoid port conflicts.

use forksim_chain::audit_finalized_chain;
use forksim_consensus::{HybridEngine, LeaderSchedule, PowEngine};
use forksim_node::{NodeConfig, NodeHandle};
use forksim_scenario::{ScenarioConfig, ScenarioController, ScenarioKind};
use forksim_types::{Block, Hash};
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Delays scenario with tight bounds so short runs stay snappy.
fn mild_delays(node_id: u32, num_nodes: u32) -> ScenarioController {
    let config = ScenarioConfig {
        delay_min_ms: 10,
        delay_max_ms: 30,
        ..Default::default()
    };
    ScenarioController::new(ScenarioKind::Delays, &config, 42, node_id, num_nodes)
}

fn split_pair(node_id: u32, heal_after_ms: u64) -> ScenarioController {
    let config = ScenarioConfig {
        partition_groups: vec![vec![0], vec![1]],
        heal_after_ms,
        ..Default::default()
    };
    ScenarioController::new(ScenarioKind::Partition, &config, 42, node_id, 2)
}

/// Hash integrity, height continuity and (optionally) the difficulty
/// predicate over a full chain.
fn assert_chain_integrity(chain: &[Block], difficulty: Option<u32>) {
    for (i, block) in chain.iter().enumerate() {
        assert!(block.verify_hash(), "hash mismatch at height {i}");
        assert_eq!(block.height, i as u64, "height gap at index {i}");
        if i > 0 {
            assert_eq!(
                block.prev_hash,
                chain[i - 1].hash,
                "broken parent link at height {i}"
            );
            if let Some(difficulty) = difficulty {
                assert!(
                    block.hash.meets_difficulty(difficulty),
                    "weak hash at height {i}"
                );
            }
        }
    }
}

/// For every height both nodes finalised, the hashes must agree.
fn assert_finality_agreement(a: &NodeHandle, b: &NodeHandle) {
    let ours: HashMap<u64, Hash> = a.finalized_entries().into_iter().collect();
    for (height, hash) in b.finalized_entries() {
        if let Some(other) = ours.get(&height) {
            assert_eq!(
                *other, hash,
                "nodes {} and {} disagree at finalised height {height}",
                a.node_id(),
                b.node_id()
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn single_pow_node_finalises_steadily() {
    init_tracing();
    let logs = TempDir::new().unwrap();

    let config = NodeConfig::new(0, 1)
        .with_base_port(19600)
        .with_finality_depth(4)
        .with_block_time(Duration::from_millis(150))
        .with_initial_balances(vec![1_000])
        .with_log_dir(logs.path());
    let engine = Arc::new(PowEngine::new(0, 2));
    let mut node = NodeHandle::spawn(config, engine, ScenarioController::unrestricted())
        .await
        .unwrap();

    node.run_for(Duration::from_secs(5)).await.unwrap();

    let final_height = node.final_height();
    assert!(final_height >= 5, "only reached final height {final_height}");

    let chain = node.best_chain();
    assert_chain_integrity(&chain, Some(2));

    // The finalised prefix replays cleanly against the starting balances.
    let finalized = &chain[..=final_height as usize];
    audit_finalized_chain(finalized, &[1_000]).unwrap();

    // The event log recorded the run.
    let log = std::fs::read_to_string(logs.path().join("node_0.log")).unwrap();
    for expected in ["startup", "block_created", "tip_changed", "finalized", "shutdown"] {
        assert!(
            log.lines().any(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .map(|v| v["event_type"] == expected)
                    .unwrap_or(false)
            }),
            "missing {expected} event"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn pow_pair_converges_under_delays() {
    init_tracing();
    let logs = TempDir::new().unwrap();

    let make_config = |id: u32| {
        NodeConfig::new(id, 2)
            .with_base_port(19610)
            .with_finality_depth(3)
            .with_block_time(Duration::from_millis(250))
            .with_log_dir(logs.path().join(format!("n{id}")))
    };
    let mut a = NodeHandle::spawn(
        make_config(0),
        Arc::new(PowEngine::new(0, 1)),
        mild_delays(0, 2),
    )
    .await
    .unwrap();
    let mut b = NodeHandle::spawn(
        make_config(1),
        Arc::new(PowEngine::new(1, 1)),
        mild_delays(1, 2),
    )
    .await
    .unwrap();

    let budget = Duration::from_secs(6);
    let (ra, rb) = tokio::join!(a.run_for(budget), b.run_for(budget));
    ra.unwrap();
    rb.unwrap();

    assert!(a.final_height() >= 1, "node 0 made no finality progress");
    assert!(b.final_height() >= 1, "node 1 made no finality progress");
    assert_finality_agreement(&a, &b);
    assert_chain_integrity(&a.best_chain(), Some(1));
    assert_chain_integrity(&b.best_chain(), Some(1));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn pow_pair_reconverges_after_partition_heal() {
    init_tracing();
    let logs = TempDir::new().unwrap();

    // Each side mines alone for 1.5 s; with one block every 600 ms neither
    // side buries anything k deep before the heal, so reconvergence cannot
    // conflict with recorded finality.
    let make_config = |id: u32| {
        NodeConfig::new(id, 2)
            .with_base_port(19620)
            .with_finality_depth(4)
            .with_block_time(Duration::from_millis(600))
            .with_log_dir(logs.path().join(format!("n{id}")))
    };
    let mut a = NodeHandle::spawn(
        make_config(0),
        Arc::new(PowEngine::new(0, 1)),
        split_pair(0, 1_500),
    )
    .await
    .unwrap();
    let mut b = NodeHandle::spawn(
        make_config(1),
        Arc::new(PowEngine::new(1, 1)),
        split_pair(1, 1_500),
    )
    .await
    .unwrap();

    let budget = Duration::from_secs(8);
    let (ra, rb) = tokio::join!(a.run_for(budget), b.run_for(budget));
    ra.unwrap();
    rb.unwrap();

    // Both sides made it past the partition without a finality conflict
    // and now share a finalised prefix.
    assert!(a.final_height() >= 1);
    assert!(b.final_height() >= 1);
    assert_finality_agreement(&a, &b);

    let shared = a.final_height().min(b.final_height()) as usize;
    let chain_a = a.best_chain();
    let chain_b = b.best_chain();
    assert_eq!(
        chain_a[shared].hash, chain_b[shared].hash,
        "nodes did not converge on a common prefix"
    );

    // Both heal events fired.
    for id in 0..2u32 {
        let log = std::fs::read_to_string(
            logs.path().join(format!("n{id}")).join(format!("node_{id}.log")),
        )
        .unwrap();
        assert!(log.contains("partition_start"));
        assert!(log.contains("partition_heal"));
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn hybrid_pair_respects_leader_schedule() {
    init_tracing();
    let logs = TempDir::new().unwrap();
    let stakes = vec![200u64, 300];
    let leader_timeout_ms = 400;

    let make_engine = |id: u32| {
        Arc::new(HybridEngine::new(
            id,
            LeaderSchedule::new(stakes.clone()).unwrap(),
            1,
            leader_timeout_ms,
        ))
    };
    let make_config = |id: u32| {
        NodeConfig::new(id, 2)
            .with_base_port(19630)
            .with_finality_depth(3)
            .with_block_time(Duration::from_millis(250))
            .with_log_dir(logs.path().join(format!("n{id}")))
    };
    let mut a = NodeHandle::spawn(make_config(0), make_engine(0), mild_delays(0, 2))
        .await
        .unwrap();
    let mut b = NodeHandle::spawn(make_config(1), make_engine(1), mild_delays(1, 2))
        .await
        .unwrap();

    let budget = Duration::from_secs(6);
    let (ra, rb) = tokio::join!(a.run_for(budget), b.run_for(budget));
    ra.unwrap();
    rb.unwrap();

    assert!(a.final_height() >= 1);
    assert!(b.final_height() >= 1);
    assert_finality_agreement(&a, &b);

    // Every block was proposed by its elected leader, or by a fallback
    // whose timestamp cleared the leader timeout.
    let schedule = LeaderSchedule::new(stakes).unwrap();
    let chain = a.best_chain();
    assert_chain_integrity(&chain, Some(1));
    for pair in chain.windows(2) {
        let (parent, block) = (&pair[0], &pair[1]);
        let leader = schedule.leader_for(&parent.hash, block.height);
        assert!(
            block.proposer_id == leader
                || block.timestamp_ms - parent.timestamp_ms >= leader_timeout_ms,
            "height {}: proposer {} is neither leader {} nor timed-out fallback",
            block.height,
            block.proposer_id,
            leader
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn late_joiner_catches_up() {
    init_tracing();
    let logs = TempDir::new().unwrap();

    let make_config = |id: u32| {
        NodeConfig::new(id, 2)
            .with_base_port(19640)
            .with_finality_depth(3)
            .with_block_time(Duration::from_millis(250))
            .with_log_dir(logs.path().join(format!("n{id}")))
    };
    let mut a = NodeHandle::spawn(
        make_config(0),
        Arc::new(PowEngine::new(0, 1)),
        mild_delays(0, 2),
    )
    .await
    .unwrap();

    // Node 1 starts 1.5 s late; node 0's dialer is already in backoff.
    let late = async {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let mut b = NodeHandle::spawn(
            make_config(1),
            Arc::new(PowEngine::new(1, 1)),
            mild_delays(1, 2),
        )
        .await
        .unwrap();
        let result = b.run_for(Duration::from_millis(4_500)).await;
        (b, result)
    };

    let (ra, (b, rb)) = tokio::join!(a.run_for(Duration::from_secs(6)), late);
    ra.unwrap();
    rb.unwrap();

    assert!(
        b.block_count() > 3,
        "late joiner never caught up: {} blocks",
        b.block_count()
    );
    assert_finality_agreement(&a, &b);
    assert_chain_integrity(&b.best_chain(), Some(1));
}
