//! Signal graph benchmarks: propagation cost through a deep chain and
//! the price of a memoized read.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use weft_core::signals::SignalSpace;

fn propagation_through_a_chain(c: &mut Criterion) {
    let space = SignalSpace::new();
    let base = space.setable(0_i64);
    let mut last = {
        let base = base.clone();
        space
            .derived(move || base.get() + 1)
            .expect("chain definition")
    };
    for _ in 0..63 {
        let prev = last.clone();
        last = space
            .derived(move || prev.get() + 1)
            .expect("chain definition");
    }

    let mut n = 0_i64;
    c.bench_function("propagate through a 64-deep chain", |b| {
        b.iter(|| {
            n += 1;
            base.set(black_box(n)).expect("chain is acyclic");
            black_box(last.get_untracked())
        })
    });
}

fn fan_out_propagation(c: &mut Criterion) {
    let space = SignalSpace::new();
    let base = space.setable(0_i64);
    let leaves: Vec<_> = (0..100)
        .map(|offset| {
            let base = base.clone();
            space
                .derived(move || base.get() + offset)
                .expect("fan definition")
        })
        .collect();

    let mut n = 0_i64;
    c.bench_function("propagate to 100 direct dependents", |b| {
        b.iter(|| {
            n += 1;
            base.set(black_box(n)).expect("fan is acyclic");
            black_box(leaves.last().map(|leaf| leaf.get_untracked()))
        })
    });
}

fn memoized_read(c: &mut Criterion) {
    let space = SignalSpace::new();
    let base = space.setable(7_i64);
    let tripled = {
        let base = base.clone();
        space.derived(move || base.get() * 3).expect("definition")
    };

    c.bench_function("read an up-to-date derived", |b| {
        b.iter(|| black_box(tripled.get()))
    });
}

criterion_group!(
    benches,
    propagation_through_a_chain,
    fan_out_propagation,
    memoized_read
);
criterion_main!(benches);
