//! Parallel dispatch over bridge-created and caller-supplied instances.

mod common;

use common::{function_chunk, init_tracing, list_numbers, square};
use vmbridge::{Bridge, Chunk, HostValue, NativeFunction, VmError, VmState, Workers};

/// Function that fails on iteration 3 and squares otherwise.
fn fails_on_three() -> NativeFunction {
    NativeFunction::new("fails_on_three", |vm: &mut VmState| {
        let i = vm.to_number(1).unwrap_or(0.0);
        if i == 3.0 {
            return Err(VmError::runtime("iteration 3 failed"));
        }
        vm.push_number(i * i);
        Ok(1)
    })
}

#[test]
fn test_squares_with_three_workers() {
    init_tracing();
    let bridge = Bridge::new();
    let out = bridge
        .run_parallel(&function_chunk("square", square), 5, Workers::Count(3), None)
        .unwrap();
    assert_eq!(list_numbers(&out), vec![1.0, 4.0, 9.0, 16.0, 25.0]);
    // Bridge-created instances are not registered.
    assert!(bridge.is_empty());
}

#[test]
fn test_more_workers_than_iterations() {
    let bridge = Bridge::new();
    let out = bridge
        .run_parallel(&function_chunk("square", square), 2, Workers::Count(8), None)
        .unwrap();
    assert_eq!(list_numbers(&out), vec![1.0, 4.0]);
}

#[test]
fn test_auto_workers() {
    let bridge = Bridge::new();
    let out = bridge
        .run_parallel(&function_chunk("square", square), 20, Workers::Auto, None)
        .unwrap();
    let expected: Vec<f64> = (1..=20).map(|i| (i * i) as f64).collect();
    assert_eq!(list_numbers(&out), expected);
}

#[test]
fn test_supplied_states_stay_open() {
    let bridge = Bridge::new();
    let a = bridge.open().unwrap();
    let b = bridge.open().unwrap();
    let out = bridge
        .run_parallel(
            &function_chunk("square", square),
            6,
            Workers::States(vec![a, b]),
            None,
        )
        .unwrap();
    assert_eq!(list_numbers(&out), vec![1.0, 4.0, 9.0, 16.0, 25.0, 36.0]);
    assert!(bridge.is_open(a) && bridge.is_open(b));
    assert_eq!(bridge.stack_depth(Some(a)).unwrap(), 0);
    assert_eq!(bridge.stack_depth(Some(b)).unwrap(), 0);
}

#[test]
fn test_pre_chunk_prepares_each_worker() {
    let bridge = Bridge::new();
    let pre = Chunk::new("pre", |vm: &mut VmState| {
        vm.push_number(100.0);
        vm.set_global("offset")?;
        Ok(0)
    });
    let func = Chunk::new("offset adder", |vm: &mut VmState| {
        vm.push_function(NativeFunction::new("add_offset", |vm: &mut VmState| {
            let i = vm.to_number(1).unwrap_or(0.0);
            vm.get_global("offset");
            let offset = vm.to_number(-1).unwrap_or(0.0);
            vm.pop(1);
            vm.push_number(i + offset);
            Ok(1)
        }));
        Ok(1)
    });
    let out = bridge
        .run_parallel(&func, 4, Workers::Count(2), Some(&pre))
        .unwrap();
    assert_eq!(list_numbers(&out), vec![101.0, 102.0, 103.0, 104.0]);
}

#[test]
fn test_error_raised_once_without_partial_result() {
    let bridge = Bridge::new();
    let a = bridge.open().unwrap();
    let err = bridge
        .run_parallel(
            &function_chunk("fails_on_three", fails_on_three),
            10,
            Workers::States(vec![a]),
            None,
        )
        .unwrap_err();
    assert_eq!(err.lua_message(), Some("iteration 3 failed"));
    assert_eq!(
        err.to_string(),
        "Error during lua_parallel 'func' execution: iteration 3 failed"
    );
    assert_eq!(bridge.stack_depth(Some(a)).unwrap(), 0);
}

#[test]
fn test_multiple_results_per_iteration() {
    let bridge = Bridge::new();
    let pair = || {
        NativeFunction::new("pair", |vm: &mut VmState| {
            let i = vm.to_number(1).unwrap_or(0.0);
            vm.push_number(i);
            vm.push_number(-i);
            Ok(2)
        })
    };
    let out = bridge
        .run_parallel(&function_chunk("pair", pair), 2, Workers::Count(2), None)
        .unwrap();
    let items = &out.as_list().unwrap().items;
    assert_eq!(items.len(), 2);
    assert_eq!(list_numbers(&items[1]), vec![2.0, -2.0]);
}

#[test]
fn test_no_results_are_null() {
    let bridge = Bridge::new();
    let quiet = || NativeFunction::new("quiet", |_vm: &mut VmState| Ok(0));
    let out = bridge
        .run_parallel(&function_chunk("quiet", quiet), 3, Workers::Count(2), None)
        .unwrap();
    assert_eq!(out, HostValue::list(vec![HostValue::Null; 3]));
}

#[test]
fn test_overlapping_dispatches_in_opposite_orders() {
    let bridge = Bridge::new();
    let a = bridge.open().unwrap();
    let b = bridge.open().unwrap();
    let func = function_chunk("square", square);
    std::thread::scope(|scope| {
        for order in [vec![a, b], vec![b, a]] {
            let (bridge, func) = (&bridge, &func);
            scope.spawn(move || {
                for _ in 0..200 {
                    let out = bridge
                        .run_parallel(func, 4, Workers::States(order.clone()), None)
                        .unwrap();
                    assert_eq!(list_numbers(&out), vec![1.0, 4.0, 9.0, 16.0]);
                }
            });
        }
    });
    assert_eq!(bridge.stack_depth(Some(a)).unwrap(), 0);
    assert_eq!(bridge.stack_depth(Some(b)).unwrap(), 0);
}

#[test]
fn test_worker_instances_take_no_keys() {
    let bridge = Bridge::new();
    let before = bridge.open().unwrap();
    bridge
        .run_parallel(&function_chunk("square", square), 4, Workers::Count(3), None)
        .unwrap();
    let after = bridge.open().unwrap();
    assert_eq!(after.id(), before.id() + 1);
}
