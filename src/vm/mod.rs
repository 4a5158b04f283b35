//! Minimal stack VM model.
//!
//! The bridge needs a VM that provides a value stack with call frames, a
//! registry table, tables with array and hash parts, first-class functions,
//! light userdata, cdata, protected calls with message handlers, hooks and a
//! JIT switch. This module provides exactly that surface. Functions are Rust
//! closures (`NativeFunction`), and a `Chunk` is a named function standing in
//! for loaded code.
//!
//! This module is organized into submodules by functionality:
//! - `types`: Core type definitions (VmError, VmStatus, VmConfig, Returns)
//! - `value`: Values, functions and reference wrappers
//! - `table`: Tables
//! - `cdata`: Native-typed objects over host memory
//! - `stack`: Stack manipulation and table access
//! - `call`: Calls, protected calls, hooks and introspection
//!
//! # Stack indices
//!
//! Positive indices count from the base of the current frame (1 is the first
//! argument); negative indices count down from the top (-1 is the top).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::host::HostValue;

// === Submodules ===

pub mod cdata;
mod call;
mod stack;
pub mod table;
pub mod types;
pub mod value;


// === Re-exports ===

pub use call::{FrameInfo, Hook, HookEvent, HookSlot};
pub use cdata::{CData, CDataPayload};
pub use table::Table;
pub use types::{Returns, VmConfig, VmError, VmResult, VmStatus};
pub use value::{
    CDataRef, FunctionRef, NativeFunction, OpaqueRef, SourceLocation, TableRef, VmType, VmValue,
};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0x1000);

/// A loadable unit of code. Running it leaves its return values on the stack.
#[derive(Debug, Clone)]
pub struct Chunk {
    function: FunctionRef,
}

impl Chunk {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut VmState) -> VmResult<usize> + Send + Sync + 'static,
    {
        let name = name.into();
        let function = NativeFunction::new(name.clone(), body).with_source(name, 1);
        Self {
            function: std::sync::Arc::new(function),
        }
    }

    pub fn from_function(function: NativeFunction) -> Self {
        Self {
            function: std::sync::Arc::new(function),
        }
    }

    pub fn name(&self) -> &str {
        self.function.name()
    }
}

/// Call frame of a running native function
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// Stack position of the first argument
    pub(crate) base: usize,
    pub(crate) function: FunctionRef,
}

/// Host values parked for the duration of a helper call, addressed by the
/// light userdata key passed into the VM.
#[derive(Debug, Default)]
pub struct HostSlots {
    slots: HashMap<usize, HostValue>,
}

impl HostSlots {
    /// Park `value` and return its key.
    pub fn stash(&mut self, value: HostValue) -> usize {
        let key = NEXT_SLOT.fetch_add(8, Ordering::Relaxed);
        self.slots.insert(key, value);
        key
    }

    pub fn get(&self, key: usize) -> Option<&HostValue> {
        self.slots.get(&key)
    }

    pub fn put(&mut self, key: usize, value: HostValue) {
        self.slots.insert(key, value);
    }

    pub fn take(&mut self, key: usize) -> Option<HostValue> {
        self.slots.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A VM instance
pub struct VmState {
    id: u64,
    /// Value stack
    pub(crate) stack: Vec<VmValue>,
    /// Active native calls, innermost last
    pub(crate) frames: Vec<Frame>,
    registry: TableRef,
    globals: TableRef,
    /// Debug and profile hooks
    pub(crate) hooks: [Option<call::ActiveHook>; 2],
    pub(crate) in_hook: bool,
    jit: bool,
    config: VmConfig,
    host_slots: HostSlots,
    closed: bool,
}

impl VmState {
    // === Constructors ===

    /// Create a new VM with default configuration
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// Create a new VM with custom configuration
    pub fn with_config(config: VmConfig) -> Self {
        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
        debug!(target: "vmbridge::vm", id, "VM created");
        Self {
            id,
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            registry: TableRef::new(Table::new()),
            globals: TableRef::new(Table::new()),
            hooks: [None, None],
            in_hook: false,
            jit: true,
            config,
            host_slots: HostSlots::default(),
            closed: false,
        }
    }

    // === Accessors ===

    /// Process-unique id of this instance
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Registry table shared by all code in this instance
    pub fn registry(&self) -> &TableRef {
        &self.registry
    }

    /// Global environment table
    pub fn globals(&self) -> &TableRef {
        &self.globals
    }

    pub fn host_slots(&self) -> &HostSlots {
        &self.host_slots
    }

    pub fn host_slots_mut(&mut self) -> &mut HostSlots {
        &mut self.host_slots
    }

    pub fn jit_enabled(&self) -> bool {
        self.jit
    }

    /// Switch the JIT compiler on or off.
    pub fn set_jit(&mut self, on: bool) {
        self.jit = on;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release every object reachable from this instance.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stack.clear();
        self.frames.clear();
        self.hooks = [None, None];
        *self.registry.lock() = Table::new();
        *self.globals.lock() = Table::new();
        self.host_slots = HostSlots::default();
        self.closed = true;
        debug!(target: "vmbridge::vm", id = self.id, "VM closed");
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmState")
            .field("id", &self.id)
            .field("top", &self.stack.len())
            .field("frames", &self.frames.len())
            .field("jit", &self.jit)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
