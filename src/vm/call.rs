//! Calls, protected calls, hooks and call-stack introspection.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{trace, warn};

use super::types::{Returns, VmError, VmResult, VmStatus};
use super::value::{SourceLocation, VmValue};
use super::{Chunk, Frame, VmState};

/// Which hook a caller installs. The debugger and the profiler each own one
/// slot so they can be armed at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSlot {
    Debug = 0,
    Profile = 1,
}

/// Event that fired a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    /// A function is about to run
    Call,
    /// The configured number of calls has elapsed
    Count,
}

pub type HookFn = dyn Fn(&mut VmState, HookEvent) + Send + Sync;

/// A hook callback and its firing conditions.
#[derive(Clone)]
pub struct Hook {
    func: Arc<HookFn>,
    on_call: bool,
    count: u32,
}

impl Hook {
    /// Fire on every call.
    pub fn on_call<F>(func: F) -> Self
    where
        F: Fn(&mut VmState, HookEvent) + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            on_call: true,
            count: 0,
        }
    }

    /// Fire once every `count` calls.
    pub fn every<F>(count: u32, func: F) -> Self
    where
        F: Fn(&mut VmState, HookEvent) + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            on_call: false,
            count: count.max(1),
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("on_call", &self.on_call)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ActiveHook {
    hook: Hook,
    counter: u32,
}

/// One entry of a call-stack report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub name: String,
    pub source: Option<SourceLocation>,
}

impl VmState {
    // === Calls ===

    /// Call the function below the top `nargs` values. On error the function
    /// and its arguments are gone and the error is returned.
    pub fn call(&mut self, nargs: usize, returns: Returns) -> VmResult<()> {
        let len = self.stack.len();
        if nargs + 1 > self.top() {
            return Err(VmError::runtime("attempt to call with too few stack values"));
        }
        let func_pos = len - nargs - 1;
        let function = match &self.stack[func_pos] {
            VmValue::Function(f) => Arc::clone(f),
            other => {
                let msg = format!("attempt to call a {} value", other.type_name());
                self.stack.truncate(func_pos);
                return Err(VmError::runtime(msg));
            }
        };
        if self.frames.len() >= self.config().max_call_depth {
            self.stack.truncate(func_pos);
            return Err(VmError::runtime("stack overflow"));
        }
        if let Err(e) = self.check_stack(0) {
            self.stack.truncate(func_pos);
            return Err(e);
        }

        trace!(target: "vmbridge::vm::call", function = function.name(), nargs, "call");
        self.frames.push(Frame {
            base: func_pos + 1,
            function: Arc::clone(&function),
        });
        self.run_hooks();
        let outcome = catch_unwind(AssertUnwindSafe(|| function.invoke(self)));
        self.frames.pop();

        let produced = match outcome {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.stack.truncate(func_pos);
                return Err(e);
            }
            Err(payload) => {
                self.stack.truncate(func_pos);
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(target: "vmbridge::vm::call", function = function.name(), detail = %detail, "native function panicked");
                return Err(VmError::runtime(format!(
                    "native function '{}' panicked: {}",
                    function.name(),
                    detail
                )));
            }
        };

        let available = self.stack.len().saturating_sub(func_pos + 1);
        if produced > available {
            self.stack.truncate(func_pos);
            return Err(VmError::runtime(format!(
                "function '{}' returned {} values but pushed only {}",
                function.name(),
                produced,
                available
            )));
        }
        let first = self.stack.len() - produced;
        let results: Vec<VmValue> = self.stack.drain(first..).collect();
        self.stack.truncate(func_pos);
        match returns {
            Returns::All => self.stack.extend(results),
            Returns::Fixed(n) => {
                let mut results = results;
                results.resize(n, VmValue::Nil);
                self.stack.extend(results);
            }
        }
        Ok(())
    }

    /// Protected call. On error the function and its arguments are replaced
    /// by one error object. With a message handler at `msgh`, runtime error
    /// objects are passed through it first; a failing handler yields
    /// `ErrErr`.
    pub fn pcall(&mut self, nargs: usize, returns: Returns, msgh: Option<i32>) -> VmStatus {
        let handler = msgh.map(|idx| self.get(idx));
        let func_pos = self.stack.len().saturating_sub(nargs + 1);
        let frames = self.frames.len();
        let err = match self.call(nargs, returns) {
            Ok(()) => return VmStatus::Ok,
            Err(err) => err,
        };
        self.frames.truncate(frames);
        self.stack.truncate(func_pos);

        let mut status = err.status();
        let mut object = err.into_object();
        if status == VmStatus::ErrRun {
            if let Some(handler) = handler {
                self.push(handler);
                self.push(object);
                match self.call(1, Returns::Fixed(1)) {
                    Ok(()) => object = self.stack.pop().unwrap_or_default(),
                    Err(_) => {
                        self.stack.truncate(func_pos);
                        status = VmStatus::ErrErr;
                        object = VmValue::string("error in error handling");
                    }
                }
            }
        }
        trace!(target: "vmbridge::vm::call", status = status.code(), "pcall failed");
        self.push(object);
        status
    }

    /// Push a chunk's main function.
    pub fn load(&mut self, chunk: &Chunk) {
        self.push(VmValue::Function(Arc::clone(&chunk.function)));
    }

    /// Load and run a chunk in protected mode.
    pub fn do_chunk(&mut self, chunk: &Chunk, returns: Returns) -> VmStatus {
        self.load(chunk);
        self.pcall(0, returns, None)
    }

    // === Hooks ===

    /// Install or clear the hook in `slot`.
    pub fn set_hook(&mut self, slot: HookSlot, hook: Option<Hook>) {
        self.hooks[slot as usize] = hook.map(|hook| ActiveHook { hook, counter: 0 });
    }

    pub fn has_hook(&self, slot: HookSlot) -> bool {
        self.hooks[slot as usize].is_some()
    }

    fn run_hooks(&mut self) {
        if self.in_hook {
            return;
        }
        let mut fire: smallvec::SmallVec<[(Arc<HookFn>, HookEvent); 2]> = smallvec::SmallVec::new();
        for active in self.hooks.iter_mut().flatten() {
            if active.hook.on_call {
                fire.push((Arc::clone(&active.hook.func), HookEvent::Call));
            }
            if active.hook.count > 0 {
                active.counter += 1;
                if active.counter >= active.hook.count {
                    active.counter = 0;
                    fire.push((Arc::clone(&active.hook.func), HookEvent::Count));
                }
            }
        }
        if fire.is_empty() {
            return;
        }
        self.in_hook = true;
        for (func, event) in fire {
            func(self, event);
        }
        self.in_hook = false;
    }

    // === Introspection ===

    /// Up to `depth` active frames, innermost first.
    pub fn call_stack(&self, depth: usize) -> Vec<FrameInfo> {
        self.frames
            .iter()
            .rev()
            .take(depth)
            .map(|f| FrameInfo {
                name: f.function.name().to_string(),
                source: f.function.source().cloned(),
            })
            .collect()
    }

    /// Number of active calls.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }
}
