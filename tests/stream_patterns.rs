//! End-to-end behaviour of the stream pattern runtime: the concrete
//! pipeline scenarios, boundary cases, and the structural equivalences
//! (nesting, farm-vs-map, single-worker collapse).

use pipewright::logging::init_test_logging;
use pipewright::{
    ExecutionPolicy, Pipeline, PipelineError, QueueMode, compose, farm, iteration, keep, reduce,
    reduce_all,
};

fn ordered_policy(workers: usize) -> ExecutionPolicy {
    let mut policy = ExecutionPolicy::with_concurrency(workers);
    policy.set_queue_size(16);
    policy.enable_ordering();
    policy
}

fn unordered_policy(workers: usize) -> ExecutionPolicy {
    let mut policy = ExecutionPolicy::with_concurrency(workers);
    policy.set_queue_size(16);
    policy.disable_ordering();
    policy
}

#[test]
fn map_doubles_and_sums_to_110() {
    let policy = ordered_policy(1);
    let sum = Pipeline::from_iter(&policy, 1u64..=10)
        .stage(|x| x * 2)
        .fold(0u64, |acc, x| acc + x)
        .unwrap();
    assert_eq!(sum, 110);
}

#[test]
fn farm_filter_ordered_delivers_ascending_evens() {
    let policy = ordered_policy(4);
    let delivered = Pipeline::from_iter(&policy, 1u64..=100)
        .stage(farm(&policy, |x| x + 1))
        .stage(keep(&policy, |x: &u64| x % 2 == 0))
        .collect()
        .unwrap();

    let expected: Vec<u64> = (2u64..=101).filter(|x| x % 2 == 0).collect();
    assert_eq!(delivered, expected);
}

#[test]
fn farm_reduce_totals_nested_sums() {
    let policy = ordered_policy(4);
    let rows = vec![vec![1u64, 2, 3], vec![4, 5], vec![6]];
    let total = Pipeline::from_iter(&policy, rows)
        .stage(farm(&policy, |row: Vec<u64>| row.iter().sum::<u64>()))
        .stage(reduce_all(&policy, 0u64, |a, b| a + b))
        .fold(0u64, |acc, window| acc + window)
        .unwrap();
    assert_eq!(total, 21);
}

#[test]
fn iteration_saturates_every_item() {
    for policy in [unordered_policy(8), ordered_policy(8)] {
        let delivered = Pipeline::from_iter(&policy, 1u64..=1000)
            .stage(iteration(&policy, |x| x + 1, |x: &u64| *x >= 1000))
            .collect()
            .unwrap();
        assert_eq!(delivered.len(), 1000);
        assert!(delivered.iter().all(|&x| x == 1000));
    }
}

#[test]
fn ordered_filter_preserves_arrival_order() {
    let policy = ordered_policy(4);
    let delivered = Pipeline::from_iter(&policy, 1u64..=50)
        .stage(keep(&policy, |x: &u64| x % 3 == 0))
        .collect()
        .unwrap();

    let expected: Vec<u64> = (1u64..=50).filter(|x| x % 3 == 0).collect();
    assert_eq!(delivered, expected);
    assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn high_volume_farm_terminates() {
    init_test_logging();

    let mut policy = unordered_policy(8);
    policy.set_queue_size(1024);
    policy.set_queue_mode(QueueMode::LockFree);

    const ITEMS: u64 = 1_000_000;
    let (count, sum) = Pipeline::from_iter(&policy, 1u64..=ITEMS)
        .stage(farm(&policy, |x: u64| x.wrapping_mul(2).wrapping_add(1)))
        .fold((0u64, 0u64), |(count, sum), x| (count + 1, sum.wrapping_add(x)))
        .unwrap();

    let expected: u64 = (1u64..=ITEMS).map(|x| 2 * x + 1).sum();
    assert_eq!(count, ITEMS);
    assert_eq!(sum, expected);
}

#[test]
fn empty_stream_terminates_without_stage_calls() {
    let policy = ordered_policy(4);
    let mut delivered = 0usize;
    Pipeline::new(&policy, || None::<u64>)
        .stage(farm(&policy, |_| panic!("farm ran on an empty stream")))
        .stage(keep(&policy, |_: &u64| panic!("filter ran on an empty stream")))
        .sink(|_| delivered += 1)
        .unwrap();
    assert_eq!(delivered, 0);
}

#[test]
fn single_item_flows_through_every_stage_kind() {
    let policy = ordered_policy(3);
    let delivered = Pipeline::from_iter(&policy, [7u64])
        .stage(|x| x + 1)
        .stage(farm(&policy, |x| x * 3))
        .stage(keep(&policy, |x: &u64| x % 2 == 0))
        .stage(reduce(&policy, 1, 0u64, |a, b| a + b).workers(1))
        .stage(iteration(&policy, |x| x + 1, |x: &u64| *x >= 24))
        .collect()
        .unwrap();
    assert_eq!(delivered, vec![24]);
}

#[test]
fn single_worker_parallel_stages_match_sequential() {
    let saturate = |mut x: u64| {
        while x < 30 {
            x += 5;
        }
        x
    };
    let expected: Vec<u64> = (1u64..=20)
        .map(|x| x * 2)
        .filter(|x| x % 3 != 0)
        .map(saturate)
        .collect();

    for policy in [ordered_policy(1), unordered_policy(1)] {
        let delivered = Pipeline::from_iter(&policy, 1u64..=20)
            .stage(farm(&policy, |x| x * 2))
            .stage(keep(&policy, |x: &u64| x % 3 != 0))
            .stage(iteration(&policy, |x| x + 5, |x: &u64| *x >= 30))
            .collect()
            .unwrap();
        assert_eq!(delivered, expected);
    }
}

#[test]
fn capacity_one_queues_still_terminate() {
    for mode in [QueueMode::Blocking, QueueMode::LockFree] {
        let mut policy = ordered_policy(4);
        policy.set_queue_size(1);
        policy.set_queue_mode(mode);

        let delivered = Pipeline::from_iter(&policy, 1u64..=100)
            .stage(farm(&policy, |x| x + 1))
            .stage(keep(&policy, |x: &u64| x % 2 == 0))
            .collect()
            .unwrap();

        let expected: Vec<u64> = (2u64..=101).filter(|x| x % 2 == 0).collect();
        assert_eq!(delivered, expected);
    }
}

#[test]
fn filter_dropping_everything_delivers_nothing() {
    let policy = ordered_policy(4);
    let pipeline = Pipeline::from_iter(&policy, 1u64..=100).stage(keep(&policy, |_: &u64| false));
    let stats = pipeline.stats();

    let mut delivered = 0usize;
    pipeline.sink(|_| delivered += 1).unwrap();

    assert_eq!(delivered, 0);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_filtered, 100);
    assert_eq!(snapshot.items_delivered, 0);
}

#[test]
fn nested_pipeline_matches_flat_composition() {
    let policy = ordered_policy(4);

    let flat = Pipeline::from_iter(&policy, 1u64..=100)
        .stage(farm(&policy, |x| x + 1))
        .stage(keep(&policy, |x: &u64| x % 2 == 0))
        .stage(|x: u64| x * 10)
        .collect()
        .unwrap();

    let nested = Pipeline::from_iter(&policy, 1u64..=100)
        .stage(compose(
            farm(&policy, |x| x + 1),
            compose(keep(&policy, |x: &u64| x % 2 == 0), |x: u64| x * 10),
        ))
        .collect()
        .unwrap();

    assert_eq!(nested, flat);
}

#[test]
fn ordered_farm_matches_map() {
    let policy = ordered_policy(4);

    let mapped = Pipeline::from_iter(&policy, 1u64..=300)
        .stage(|x: u64| x.wrapping_mul(x) + 1)
        .collect()
        .unwrap();

    let farmed = Pipeline::from_iter(&policy, 1u64..=300)
        .stage(farm(&policy, |x: u64| x.wrapping_mul(x) + 1))
        .collect()
        .unwrap();

    assert_eq!(farmed, mapped);
}

#[test]
fn unordered_farm_preserves_the_multiset() {
    let policy = unordered_policy(4);
    let mut delivered = Pipeline::from_iter(&policy, 1u64..=500)
        .stage(farm(&policy, |x| x * 2))
        .collect()
        .unwrap();
    delivered.sort_unstable();

    let expected: Vec<u64> = (1u64..=500).map(|x| x * 2).collect();
    assert_eq!(delivered, expected);
}

#[test]
fn reduce_windows_chunk_the_fold() {
    let policy = ordered_policy(4);
    let windows = Pipeline::from_iter(&policy, 1u64..=10)
        .stage(reduce(&policy, 3, 0u64, |a, b| a + b).workers(1))
        .collect()
        .unwrap();
    // 1+2+3, 4+5+6, 7+8+9, and the partial window flushed at end of stream.
    assert_eq!(windows, vec![6, 15, 24, 10]);
}

#[test]
fn stage_panic_surfaces_as_an_error() {
    init_test_logging();

    let policy = unordered_policy(4);
    let result = Pipeline::from_iter(&policy, 1u64..=50)
        .stage(farm(&policy, |x| {
            if x == 13 {
                panic!("unlucky {x}");
            }
            x
        }))
        .collect();

    match result {
        Err(PipelineError::StageFailed { stage, message }) => {
            assert_eq!(stage, "farm");
            assert!(message.contains("unlucky"));
        }
        other => panic!("expected farm failure, got {other:?}"),
    }
    assert_eq!(policy.active_threads(), 0);
}

#[test]
fn stage_panic_in_ordered_mode_still_terminates() {
    let policy = ordered_policy(4);
    let result = Pipeline::from_iter(&policy, 1u64..=50)
        .stage(farm(&policy, |x| {
            if x % 10 == 3 {
                panic!("unlucky {x}");
            }
            x
        }))
        .stage(keep(&policy, |x: &u64| x % 2 == 0))
        .collect();

    assert!(matches!(result, Err(PipelineError::StageFailed { .. })));
    assert_eq!(policy.active_threads(), 0);
}

#[test]
fn generator_panic_surfaces_as_an_error() {
    let policy = ordered_policy(2);
    let mut produced = 0u64;
    let result = Pipeline::new(&policy, move || {
        produced += 1;
        if produced > 5 {
            panic!("source exhausted abnormally");
        }
        Some(produced)
    })
    .stage(farm(&policy, |x| x + 1))
    .collect();

    match result {
        Err(PipelineError::StageFailed { stage, .. }) => assert_eq!(stage, "generator"),
        other => panic!("expected generator failure, got {other:?}"),
    }
}

#[test]
fn no_threads_outlive_the_pipeline() {
    let policy = ordered_policy(4);
    let delivered = Pipeline::from_iter(&policy, 1u64..=200)
        .stage(farm(&policy, |x| x + 1))
        .stage(keep(&policy, |x: &u64| x % 2 == 0))
        .stage(reduce(&policy, 10, 0u64, |a, b| a + b).workers(2))
        .collect()
        .unwrap();

    assert!(!delivered.is_empty());
    assert_eq!(policy.active_threads(), 0);
}

#[test]
fn identity_pipeline_round_trips_the_stream() {
    let policy = ordered_policy(2);
    let delivered = Pipeline::from_iter(&policy, 1u64..=64)
        .stage(|x: u64| x)
        .collect()
        .unwrap();
    let expected: Vec<u64> = (1u64..=64).collect();
    assert_eq!(delivered, expected);
}
