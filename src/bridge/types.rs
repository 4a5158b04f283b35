//! Error types for the bridge layer.

use std::fmt;

use crate::vm::VmStatus;

/// Result of bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure class reported by a protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaErrorKind {
    Runtime,
    Syntax,
    Memory,
    ErrorHandler,
    File,
    /// A status code outside the known set
    Unknown(i32),
}

impl LuaErrorKind {
    /// Classify a protected call status; `None` for success.
    pub fn from_status(status: VmStatus) -> Option<Self> {
        match status {
            VmStatus::Ok => None,
            VmStatus::ErrRun => Some(Self::Runtime),
            VmStatus::ErrSyntax => Some(Self::Syntax),
            VmStatus::ErrMem => Some(Self::Memory),
            VmStatus::ErrErr => Some(Self::ErrorHandler),
            VmStatus::ErrFile => Some(Self::File),
            other => Some(Self::Unknown(other.code())),
        }
    }
}

impl fmt::Display for LuaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => write!(f, "runtime"),
            Self::Syntax => write!(f, "syntax"),
            Self::Memory => write!(f, "memory"),
            Self::ErrorHandler => write!(f, "error handler"),
            Self::File => write!(f, "file"),
            Self::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// Errors raised while moving values or calls across the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Malformed arguments: bad acode, names attribute, length mismatch
    ArgumentValidation(String),
    /// A value has no representation on the other side
    UnsupportedConversion(String),
    /// A protected call failed
    Lua {
        kind: LuaErrorKind,
        /// What the bridge was doing when the call failed
        context: String,
        message: String,
    },
    /// The user quit the interactive debugger
    DebuggerQuit,
    /// A table or string exceeds the VM's capacity
    SizeCeiling(String),
    /// A registry entry was used after its instance closed, or with the
    /// wrong instance
    HandleInvalid(String),
    /// Bad configuration or tooling mode
    Config(String),
}

impl BridgeError {
    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        Self::ArgumentValidation(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedConversion(msg.into())
    }

    /// Protected-call failure message, without the bridge context.
    pub fn lua_message(&self) -> Option<&str> {
        match self {
            Self::Lua { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArgumentValidation(msg) => write!(f, "{}", msg),
            Self::UnsupportedConversion(msg) => write!(f, "{}", msg),
            Self::Lua {
                kind: LuaErrorKind::Runtime,
                context,
                message,
            } => write!(f, "Error during {}: {}", context, message),
            Self::Lua {
                kind: LuaErrorKind::Syntax,
                context,
                message,
            } => write!(f, "Syntax error during {}: {}", context, message),
            Self::Lua {
                kind: LuaErrorKind::Memory,
                context,
                message,
            } => write!(f, "Memory allocation error during {}: {}", context, message),
            Self::Lua {
                kind: LuaErrorKind::ErrorHandler,
                context,
                message,
            } => write!(f, "Error in error handler during {}: {}", context, message),
            Self::Lua {
                kind: LuaErrorKind::File,
                context,
                message,
            } => write!(f, "File error during {}: {}", context, message),
            Self::Lua {
                kind: LuaErrorKind::Unknown(code),
                context,
                message,
            } => write!(
                f,
                "Unknown error (code {}) during {}: {}",
                code, context, message
            ),
            Self::DebuggerQuit => write!(f, "Quit debugger."),
            Self::SizeCeiling(msg) => write!(f, "{}", msg),
            Self::HandleInvalid(msg) => write!(f, "Invalid handle: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}
