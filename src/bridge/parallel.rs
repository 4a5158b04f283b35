//! Parallel Dispatch - one function, many iterations, many instances.
//!
//! [`Bridge::run_parallel`] runs an optional `pre` chunk and then the `func`
//! chunk in every worker instance. `func` must return exactly one function,
//! which each worker calls with iteration indices claimed from a shared
//! counter until all `n` are taken or some worker fails.
//!
//! # Design
//!
//! ```text
//!            next: AtomicUsize ──claim──┬──────────┬──────────┐
//!                                       ▼          ▼          ▼
//!                                  worker 0    worker 1    worker k
//!                                  (state 0)   (state 1)   (state k)
//!                                       │          │          │
//!                                       └── (i, value) ──────►  channel
//! ```
//!
//! - Each worker owns its instance exclusively for the whole dispatch;
//!   caller-supplied instances are locked in key order
//! - Results are converted on the worker and sent with their index
//! - The first error is kept; every worker stops claiming once it is set
//! - Instances created for the dispatch are always closed afterwards;
//!   instances supplied by the caller stay open with their stacks reset

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::host::HostValue;
use crate::vm::{Chunk, Returns, VmType};

use super::pcall::{handle_lua_error, pcall_status};
use super::pull::return_values;
use super::state::{Bridge, LuaState, StateKey};
use super::types::{BridgeError, BridgeResult};

/// Which instances run a parallel dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workers {
    /// This many fresh instances, closed afterwards
    Count(usize),
    /// These open instances, one thread each
    States(Vec<StateKey>),
    /// One fresh instance per CPU
    Auto,
}

impl Workers {
    fn validate(&self) -> BridgeResult<()> {
        match self {
            Workers::Count(0) => Err(BridgeError::argument("Invalid number of threads.")),
            Workers::States(keys) if keys.is_empty() => Err(BridgeError::argument(
                "threads parameter must be either an integer or a list of Lua states.",
            )),
            Workers::States(keys) => {
                for (t, key) in keys.iter().enumerate() {
                    if keys[..t].contains(key) {
                        return Err(BridgeError::argument(
                            "Cannot use the same Lua state across multiple threads.",
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// State shared by the workers of one dispatch
struct Dispatch<'a> {
    func: &'a Chunk,
    pre: Option<&'a Chunk>,
    n: usize,
    next: AtomicUsize,
    failed: AtomicBool,
    error: Mutex<Option<BridgeError>>,
}

impl Dispatch<'_> {
    fn fail(&self, err: BridgeError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            warn!(target: "vmbridge::parallel", error = %err, "worker failed");
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Next unclaimed iteration, 1-based.
    fn claim(&self) -> Option<usize> {
        if self.failed() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        (i <= self.n).then_some(i)
    }
}

impl Bridge {
    /// Call the function `func` returns with `1..=n` across `workers`.
    ///
    /// Returns a list of length `n` holding each iteration's converted
    /// results, or the first error any worker raised.
    pub fn run_parallel(
        &self,
        func: &Chunk,
        n: usize,
        workers: Workers,
        pre: Option<&Chunk>,
    ) -> BridgeResult<HostValue> {
        workers.validate()?;

        let mut owned: Vec<LuaState> = Vec::new();
        let mut shared = Vec::new();
        match &workers {
            Workers::Count(k) => {
                for _ in 0..*k {
                    owned.push(self.new_instance()?);
                }
            }
            Workers::Auto => {
                for _ in 0..num_cpus::get().max(1) {
                    owned.push(self.new_instance()?);
                }
            }
            Workers::States(keys) => {
                // Key order, so overlapping dispatches cannot lock in opposite orders.
                let mut keys = keys.clone();
                keys.sort_unstable();
                for key in keys {
                    shared.push(self.state(Some(key))?);
                }
            }
        }
        let n_owned = owned.len();
        let mut guards: Vec<_> = shared.iter().map(|s| s.lock()).collect();
        let mut states: Vec<&mut LuaState> = owned
            .iter_mut()
            .chain(guards.iter_mut().map(|g| &mut **g))
            .collect();
        let start_tops: Vec<usize> = states.iter().map(|s| s.vm().top()).collect();

        debug!(target: "vmbridge::parallel", workers = states.len(), n, "parallel dispatch");
        let dispatch = Dispatch {
            func,
            pre,
            n,
            next: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        };
        let (tx, rx) = unbounded::<(usize, HostValue)>();

        let spawned = thread::scope(|scope| -> BridgeResult<()> {
            for (t, state) in states.iter_mut().enumerate() {
                let tx = tx.clone();
                let dispatch = &dispatch;
                let state: &mut LuaState = state;
                thread::Builder::new()
                    .name(format!("vmbridge-worker-{}", t))
                    .spawn_scoped(scope, move || {
                        if let Err(e) = work(state, dispatch, &tx) {
                            dispatch.fail(e);
                        }
                    })
                    .map_err(|e| {
                        BridgeError::argument(format!("cannot spawn worker thread: {}", e))
                    })?;
            }
            Ok(())
        });
        drop(tx);

        let error = dispatch.error.into_inner();
        let outcome = match (spawned, error) {
            (_, Some(e)) | (Err(e), None) => Err(e),
            (Ok(()), None) => {
                let mut items = vec![HostValue::Null; n];
                for (i, value) in rx.try_iter() {
                    items[i - 1] = value;
                }
                Ok(HostValue::list(items))
            }
        };

        // Caller-supplied instances keep running; bridge-created ones go.
        for (state, top) in states.iter_mut().zip(start_tops).skip(n_owned) {
            let reset = if outcome.is_ok() { top as i32 } else { 0 };
            state.vm_mut().set_top(reset);
        }
        drop(states);
        drop(guards);
        for mut state in owned {
            state.close();
        }
        outcome
    }
}

fn work(
    state: &mut LuaState,
    dispatch: &Dispatch<'_>,
    tx: &Sender<(usize, HostValue)>,
) -> BridgeResult<()> {
    let vm = state.vm_mut();
    if let Some(pre) = dispatch.pre {
        let status = vm.do_chunk(pre, Returns::Fixed(0));
        if let Some(e) = handle_lua_error(vm, status, "lua_parallel 'pre' execution") {
            return Err(e);
        }
    }
    if dispatch.failed() {
        return Ok(());
    }

    let top0 = vm.top();
    let status = vm.do_chunk(dispatch.func, Returns::All);
    if let Some(e) = handle_lua_error(vm, status, "lua_parallel 'func' construction") {
        return Err(e);
    }
    let nret = vm.top() - top0;
    if nret != 1 {
        return Err(BridgeError::argument(format!(
            "lua_parallel expects `func' to evaluate to one value, not {}.",
            nret
        )));
    }
    if vm.type_at(-1) != VmType::Function {
        return Err(BridgeError::argument(format!(
            "lua_parallel expects `func' to evaluate to a function, not a {}.",
            vm.type_at(-1).name()
        )));
    }
    let func = vm.top() as i32;

    while let Some(i) = dispatch.claim() {
        let vm = state.vm_mut();
        let top1 = vm.top();
        vm.push_value(func);
        vm.push_integer(i as i64);
        let status = pcall_status(vm, 1, Returns::All);
        if let Some(e) = handle_lua_error(vm, status, "lua_parallel 'func' execution") {
            return Err(e);
        }
        let nret = vm.top() - top1;
        let value = return_values(state, nret)?;
        trace!(target: "vmbridge::parallel", iteration = i, "iteration done");
        // The receiver outlives every worker.
        let _ = tx.send((i, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{NativeFunction, VmError, VmState};

    fn square_chunk() -> Chunk {
        Chunk::new("return square", |vm: &mut VmState| {
            vm.push_function(NativeFunction::new("square", |vm: &mut VmState| {
                let i = vm.to_number(1).unwrap_or(0.0);
                vm.push_number(i * i);
                Ok(1)
            }));
            Ok(1)
        })
    }

    #[test]
    fn test_worker_validation() {
        assert!(Workers::Count(0).validate().is_err());
        assert!(Workers::States(vec![]).validate().is_err());
        let bridge = Bridge::new();
        let a = bridge.open().unwrap();
        assert_eq!(
            Workers::States(vec![a, a]).validate(),
            Err(BridgeError::argument(
                "Cannot use the same Lua state across multiple threads."
            ))
        );
        assert!(Workers::States(vec![a, StateKey::DEFAULT]).validate().is_ok());
    }

    #[test]
    fn test_squares_in_order() {
        let bridge = Bridge::new();
        let out = bridge
            .run_parallel(&square_chunk(), 5, Workers::Count(3), None)
            .unwrap();
        let values: Vec<f64> = out
            .as_list()
            .unwrap()
            .items
            .iter()
            .flat_map(|v| v.as_numeric().unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 4.0, 9.0, 16.0, 25.0]);
    }

    #[test]
    fn test_zero_iterations() {
        let bridge = Bridge::new();
        let out = bridge
            .run_parallel(&square_chunk(), 0, Workers::Count(2), None)
            .unwrap();
        assert_eq!(out, HostValue::list(vec![]));
    }

    #[test]
    fn test_func_must_be_function() {
        let bridge = Bridge::new();
        let not_fn = Chunk::new("return 1", |vm: &mut VmState| {
            vm.push_number(1.0);
            Ok(1)
        });
        let err = bridge
            .run_parallel(&not_fn, 3, Workers::Count(2), None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "lua_parallel expects `func' to evaluate to a function, not a number."
        );
    }

    #[test]
    fn test_pre_error_reported() {
        let bridge = Bridge::new();
        let pre = Chunk::new("pre", |_vm: &mut VmState| Err(VmError::runtime("pre failed")));
        let err = bridge
            .run_parallel(&square_chunk(), 3, Workers::Count(2), Some(&pre))
            .unwrap_err();
        assert_eq!(err.lua_message(), Some("pre failed"));
    }
}
