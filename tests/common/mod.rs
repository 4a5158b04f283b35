//! Shared helpers for the integration tests.
//!
//! Chunks here stand in for loaded VM code: each one, when run, leaves a
//! single native function (or table) on the stack.

#![allow(dead_code)]

use std::sync::Once;

use vmbridge::{Chunk, HostValue, NativeFunction, VmError, VmState};

static TRACING: Once = Once::new();

/// Route tracing output through the test harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Chunk that returns the function `make` builds.
pub fn function_chunk<F>(name: &str, make: F) -> Chunk
where
    F: Fn() -> NativeFunction + Send + Sync + 'static,
{
    Chunk::new(format!("return {}", name), move |vm: &mut VmState| {
        vm.push_function(make());
        Ok(1)
    })
}

/// Returns its arguments unchanged.
pub fn identity() -> NativeFunction {
    NativeFunction::new("identity", |vm: &mut VmState| Ok(vm.top()))
}

/// Squares its first argument.
pub fn square() -> NativeFunction {
    NativeFunction::new("square", |vm: &mut VmState| {
        let x = vm.to_number(1).unwrap_or(0.0);
        vm.push_number(x * x);
        Ok(1)
    })
}

/// Sums all numeric arguments.
pub fn sum() -> NativeFunction {
    NativeFunction::new("sum", |vm: &mut VmState| {
        let total: f64 = (1..=vm.top() as i32).filter_map(|i| vm.to_number(i)).sum();
        vm.push_number(total);
        Ok(1)
    })
}

/// Raises `message` as a runtime error.
pub fn failing(message: &'static str) -> NativeFunction {
    NativeFunction::new("failing", move |_vm: &mut VmState| {
        Err(VmError::runtime(message))
    })
}

/// Returns the VM type name of its first argument.
pub fn type_of() -> NativeFunction {
    NativeFunction::new("type", |vm: &mut VmState| {
        let name = vm.type_at(1).name();
        vm.push_string(name);
        Ok(1)
    })
}

/// Chunk returning a module table:
/// `{ version = 2, greet = function, config = { depth = 1 } }`.
pub fn module_chunk() -> Chunk {
    Chunk::new("mymodule", |vm: &mut VmState| {
        vm.create_table(0, 3);
        vm.push_number(2.0);
        vm.set_field(-2, "version")?;
        vm.push_function(NativeFunction::new("greet", |vm: &mut VmState| {
            vm.push_string("hello");
            Ok(1)
        }));
        vm.set_field(-2, "greet")?;
        vm.create_table(0, 1);
        vm.push_number(1.0);
        vm.set_field(-2, "depth")?;
        vm.set_field(-2, "config")?;
        Ok(1)
    })
}

/// Numeric contents of a value, panicking on anything else.
pub fn numbers(value: &HostValue) -> Vec<f64> {
    value
        .as_numeric()
        .unwrap_or_else(|| panic!("expected a numeric vector, got {}", value.type_name()))
}

/// Numeric contents of every item of a list.
pub fn list_numbers(value: &HostValue) -> Vec<f64> {
    value
        .as_list()
        .unwrap_or_else(|| panic!("expected a list, got {}", value.type_name()))
        .items
        .iter()
        .flat_map(numbers)
        .collect()
}
