//! Throughput driver: generator → farm → filter → reduce over a synthetic
//! workload.
//!
//! ```text
//! stream_bench [ITEMS] [WORKERS] [blocking|lockfree] [ordered|unordered]
//! ```

use std::time::Instant;

use anyhow::{Context, Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pipewright::logging::{LogConfig, init_logging};
use pipewright::{ExecutionPolicy, Pipeline, QueueMode, farm, keep, reduce_all};

/// A few rounds of splitmix64: enough work per item to make the farm earn
/// its keep.
fn heavy(mut x: u64) -> u64 {
    for _ in 0..32 {
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x = z ^ (z >> 31);
    }
    x
}

fn parse_args() -> Result<(u64, usize, QueueMode, bool)> {
    let mut args = std::env::args().skip(1);

    let items = match args.next() {
        Some(raw) => raw.parse::<u64>().context("ITEMS must be an integer")?,
        None => 1_000_000,
    };
    let workers = match args.next() {
        Some(raw) => raw.parse::<usize>().context("WORKERS must be an integer")?,
        None => 8,
    };
    let mode = match args.next().as_deref() {
        Some("lockfree") => QueueMode::LockFree,
        Some("blocking") | None => QueueMode::Blocking,
        Some(other) => bail!("unknown queue mode `{other}`"),
    };
    let ordered = match args.next().as_deref() {
        Some("ordered") | None => true,
        Some("unordered") => false,
        Some(other) => bail!("unknown ordering `{other}`"),
    };

    Ok((items, workers, mode, ordered))
}

fn main() -> Result<()> {
    let _guard = init_logging(&LogConfig::default());
    let (items, workers, mode, ordered) = parse_args()?;

    let mut policy = ExecutionPolicy::new();
    policy.set_concurrency_degree(workers);
    policy.set_queue_size(1024);
    policy.set_queue_mode(mode);
    if ordered {
        policy.enable_ordering();
    } else {
        policy.disable_ordering();
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut produced = 0u64;
    let pipeline = Pipeline::new(&policy, move || {
        if produced == items {
            return None;
        }
        produced += 1;
        Some(rng.gen_range(0..u64::MAX))
    })
    .stage(farm(&policy, heavy))
    .stage(keep(&policy, |x: &u64| x % 2 == 0))
    .stage(reduce_all(&policy, 0u64, |a: u64, b: u64| a.wrapping_add(b)));

    let stats = pipeline.stats();
    let started = Instant::now();
    let digest = pipeline.fold(0u64, |acc, window| acc.wrapping_add(window))?;
    let elapsed = started.elapsed();

    let snapshot = stats.snapshot();
    let rate = items as f64 / elapsed.as_secs_f64();
    tracing::info!(
        items,
        workers,
        ?mode,
        ordered,
        digest,
        elapsed_ms = elapsed.as_millis() as u64,
        rate = rate as u64,
        "bench complete"
    );
    println!("{snapshot}");
    println!(
        "{items} items in {:.3}s ({rate:.0} items/s), digest {digest:#018x}",
        elapsed.as_secs_f64()
    );

    Ok(())
}
