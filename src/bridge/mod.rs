//! The bridge between host values and VM values.
//!
//! This module is organized into submodules by functionality:
//! - `tags`: Type tags carried by bridge-created cdata
//! - `mode`: Transfer modes and argument codes
//! - `push`: Host to VM conversion
//! - `pull`: VM to host conversion
//! - `pcall`: Protected calls and error translation
//! - `tooling`: Debug, profile and JIT modes
//! - `profiler`: Sampling profiler and profile data
//! - `registry_entry`: Handles to VM values held by the host
//! - `companion`: VM-resident helper functions
//! - `state`: VM instances and the instance registry
//! - `parallel`: Parallel dispatch
//! - `api`: Entry points

// === Submodules ===

pub mod api;
pub mod companion;
pub mod mode;
pub mod parallel;
pub mod pcall;
pub mod profiler;
pub mod pull;
pub mod push;
pub mod registry_entry;
pub mod state;
pub mod tags;
pub mod tooling;
pub mod types;

// === Re-exports ===

pub use mode::{ArgCode, TransferMode};
pub use parallel::Workers;
pub use pcall::{handle_lua_error, pcall, pcall_status, Tooling};
pub use profiler::{profile_data, Granularity, ProfileEntry, ProfileLimits, ProfileMode, ProfileReport};
pub use pull::{pull, return_values};
pub use push::{pass, pass_list, push};
pub use registry_entry::RegistryEntry;
pub use state::{Bridge, LuaState, SharedState, StateKey};
pub use tags::{BaseKind, TypeTag};
pub use tooling::{
    get_mode, set_debugger, set_mode, set_modes, set_profile_limits, DebugMode, Debugger,
    JitMode, ModeSetting, ToolingModes, TracingDebugger,
};
pub use types::{BridgeError, BridgeResult, LuaErrorKind};
