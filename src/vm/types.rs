//! Type definitions for the VM model.
//!
//! This module contains the core types shared by the VM layer:
//! - VmError: Errors raised by running code
//! - VmStatus: Status codes returned by protected calls
//! - Returns: Requested result count of a call
//! - VmConfig: Capacity ceilings of a VM instance

use super::value::VmValue;

/// Result of VM operations
pub type VmResult<T> = Result<T, VmError>;

/// Errors that can occur while running VM code
#[derive(Debug, Clone)]
pub enum VmError {
    /// Runtime error carrying an arbitrary error object
    Runtime(VmValue),
    /// Code failed to compile
    Syntax(String),
    /// Allocation failed or a capacity ceiling was hit
    Memory,
    /// Code could not be read
    File(String),
}

impl VmError {
    /// Runtime error with a string error object
    pub fn runtime(msg: impl AsRef<str>) -> Self {
        Self::Runtime(VmValue::string(msg.as_ref()))
    }

    /// Status a protected call reports for this error
    pub fn status(&self) -> VmStatus {
        match self {
            Self::Runtime(_) => VmStatus::ErrRun,
            Self::Syntax(_) => VmStatus::ErrSyntax,
            Self::Memory => VmStatus::ErrMem,
            Self::File(_) => VmStatus::ErrFile,
        }
    }

    /// Error object left on the stack by a protected call
    pub fn into_object(self) -> VmValue {
        match self {
            Self::Runtime(v) => v,
            Self::Syntax(msg) | Self::File(msg) => VmValue::string(msg),
            Self::Memory => VmValue::string("not enough memory"),
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime(obj) => match obj {
                VmValue::String(s) => write!(f, "{}", String::from_utf8_lossy(s)),
                VmValue::Number(n) => write!(f, "{}", super::value::format_number(*n)),
                other => write!(f, "(error object is a {} value)", other.type_name()),
            },
            Self::Syntax(msg) => write!(f, "Syntax error: {}", msg),
            Self::Memory => write!(f, "not enough memory"),
            Self::File(msg) => write!(f, "File error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

/// Status code of a protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VmStatus {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    ErrErr = 5,
    ErrFile = 6,
}

impl VmStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == VmStatus::Ok
    }
}

/// Number of results a call should leave on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    /// Exactly this many, padding with nil or truncating
    Fixed(usize),
    /// Everything the callee returned
    All,
}

/// Largest table the bridge will build or read, in elements (exclusive).
pub const DEFAULT_MAX_ARRAY_SIZE: usize = (1 << 27) + 1;
/// Largest string the VM accepts, in bytes (exclusive).
pub const DEFAULT_MAX_STRING_BYTES: usize = 0x7fff_ff00;

/// Configuration for a VM instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum number of elements in a table built or read by the bridge
    pub max_array_size: usize,
    /// Maximum byte length of a string
    pub max_string_bytes: usize,
    /// Maximum value stack size
    pub max_stack: usize,
    /// Maximum nesting of native calls
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_array_size: DEFAULT_MAX_ARRAY_SIZE,
            max_string_bytes: DEFAULT_MAX_STRING_BYTES,
            max_stack: 65500,
            max_call_depth: 200,
        }
    }
}
