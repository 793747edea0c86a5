//! Cascading causal delivery benchmarking.

use std::time::Duration;

use causalkv::{Address, State, StateHandler, Update, VectorClock};

use rand::seq::SliceRandom;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId,
    Criterion,
};

static LENGTHS: [u64; 4] = [16, 128, 1024, 8192];

/// Stream of `len` consecutive writes from one origin.
fn origin_stream(me: &Address, origin: &Address, len: u64) -> Vec<Update> {
    (1..=len)
        .map(|i| {
            let vclock =
                VectorClock::from([(origin.key(), i), (me.key(), 0)]);
            Update::new(vclock, origin.clone(), format!("k{}", i % 64), "v")
        })
        .collect()
}

fn deliver(me: &Address, updates: Vec<Update>) -> usize {
    let handler = StateHandler::new(me.clone(), State::fresh(me));
    for update in updates {
        handler.replica_write(update, true);
    }
    black_box(handler.pending_len())
}

fn cascade_bench_group(c: &mut Criterion) {
    let me = Address::new("127.0.0.1", 40000);
    let origin = Address::new("127.0.0.1", 40001);

    let mut group = c.benchmark_group("cascade_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(4));

    for len in LENGTHS {
        let stream = origin_stream(&me, &origin, len);

        let mut reversed = stream.clone();
        reversed.reverse();
        group.bench_with_input(
            BenchmarkId::new("reversed", len),
            &reversed,
            |b, updates| {
                b.iter_batched(
                    || updates.clone(),
                    |updates| deliver(&me, updates),
                    BatchSize::SmallInput,
                );
            },
        );

        let mut shuffled = stream;
        shuffled.shuffle(&mut rand::thread_rng());
        group.bench_with_input(
            BenchmarkId::new("shuffled", len),
            &shuffled,
            |b, updates| {
                b.iter_batched(
                    || updates.clone(),
                    |updates| deliver(&me, updates),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, cascade_bench_group);
criterion_main!(benches);
