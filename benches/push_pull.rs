use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vmbridge::bridge::{pull, push, LuaState, StateKey};
use vmbridge::{HostValue, VmConfig};

fn fresh_state() -> LuaState {
    LuaState::new(StateKey::DEFAULT, VmConfig::default()).expect("Failed to open Lua state")
}

/// Generate a named list of `n` numeric columns, each of length `len`.
fn generate_frame(n: usize, len: usize) -> HostValue {
    let names: Vec<String> = (0..n).map(|i| format!("col{}", i)).collect();
    let items = (0..n)
        .map(|i| HostValue::numeric((0..len).map(|j| (i * len + j) as f64)))
        .collect();
    HostValue::list(items).with_names(names)
}

/// Push and pull a numeric vector under each transfer mode
fn bench_vector_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector_modes");

    for len in [10, 1000, 100_000].iter() {
        let x = HostValue::numeric((0..*len).map(|i| i as f64));

        for mode in ['s', 'v', 'r'] {
            group.bench_with_input(
                BenchmarkId::new(format!("push_pull_{}", mode), len),
                len,
                |b, _| {
                    let mut state = fresh_state();
                    b.iter(|| {
                        push(&mut state, black_box(&x), mode).expect("push failed");
                        let back = pull(&mut state, -1).expect("pull failed");
                        state.vm_mut().pop(1);
                        black_box(back);
                    });
                },
            );
        }
    }

    group.finish();
}

/// Push and pull nested named lists as tables and as references
fn bench_named_lists(c: &mut Criterion) {
    let mut group = c.benchmark_group("named_lists");

    for cols in [4, 32, 256].iter() {
        let frame = generate_frame(*cols, 100);

        for mode in ['s', 'r'] {
            group.bench_with_input(
                BenchmarkId::new(format!("push_pull_{}", mode), cols),
                cols,
                |b, _| {
                    let mut state = fresh_state();
                    b.iter(|| {
                        push(&mut state, black_box(&frame), mode).expect("push failed");
                        let back = pull(&mut state, -1).expect("pull failed");
                        state.vm_mut().pop(1);
                        black_box(back);
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_vector_modes, bench_named_lists);
criterion_main!(benches);
