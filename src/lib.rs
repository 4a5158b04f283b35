//! vmbridge - value marshalling and call bridge for an embedded stack VM
//!
//! This library moves values between a vector-oriented host runtime and a
//! stack-based scripting VM, and calls VM functions from the host with
//! protected calls and host-level errors.
//!
//! # Architecture
//!
//! 1. **Host values** (`host` module)
//!    - Logical, integer, numeric and character vectors with NA conventions
//!    - Heterogeneous named lists, external pointers, raw buffers, `NULL`
//!    - Attribute sets (`names`, `class`, `row.names`)
//!
//! 2. **VM model** (`vm` module)
//!    - Value stack with call frames, registry, tables, native functions
//!    - Cdata objects viewing host storage
//!    - Protected calls with message handlers, hooks and a JIT switch
//!
//! 3. **Bridge** (`bridge` module)
//!    - Push (host to VM) and pull (VM to host) under transfer modes
//!      `'s'` simplify, `'t'` table, `'a'` array-like, `'r'` reference,
//!      `'v'` vector copy, or a digit string fixing the length
//!    - Protected calls with error translation and debug/profile/JIT tooling
//!    - Registry entries: host handles to VM functions and module tables
//!    - Instance registry with a lazily created default instance
//!    - Parallel dispatch across several instances
//!
//! # Example
//!
//! ```ignore
//! use vmbridge::{Bridge, Chunk, HostValue, NativeFunction, VmState};
//!
//! let bridge = Bridge::new();
//! let add = Chunk::new("add", |vm: &mut VmState| {
//!     vm.push_function(NativeFunction::new("add", |vm: &mut VmState| {
//!         let (a, b) = (vm.to_number(1).unwrap_or(0.0), vm.to_number(2).unwrap_or(0.0));
//!         vm.push_number(a + b);
//!         Ok(1)
//!     }));
//!     Ok(1)
//! });
//!
//! let f = bridge.func_create(&add, None)?;
//! let sum = bridge.func_call(&f, &[HostValue::from(2.0), HostValue::from(3.0)], "s", None)?;
//! assert_eq!(sum.as_numeric(), Some(vec![5.0]));
//! ```
//!
//! # Configuration
//!
//! See [`config::BridgeConfig`] for the `vmbridge.toml` format.

pub mod bridge;
pub mod config;
pub mod host;
pub mod vm;

pub use bridge::{
    get_mode, profile_data, set_mode, Bridge, BridgeError, BridgeResult, LuaState, StateKey,
    Tooling, Workers,
};
pub use config::BridgeConfig;
pub use host::{ExternalPtr, HostType, HostValue, List, Vector};
pub use vm::{
    Chunk, NativeFunction, Returns, VmConfig, VmError, VmResult, VmState, VmType, VmValue,
};
