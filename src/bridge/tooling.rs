//! Process-wide tooling modes and the debugger collaborator.
//!
//! Tooled calls (see [`pcall`](super::pcall::pcall)) read the current modes
//! once before the call:
//!
//! - `debug`: `"off"`, `"step"` (single-step from the callee's first call) or
//!   `"error"` (enter the debugger when the call raises an error)
//! - `profile`: `"off"` or a profile mode string such as `"li1"`
//! - `jit`: `"on"` or `"off"`
//!
//! The debugger itself is pluggable through the [`Debugger`] trait. The
//! default [`TracingDebugger`] reports steps and errors as tracing events
//! and never stops.

use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::vm::{Hook, HookEvent, HookSlot, NativeFunction, Returns, VmError, VmResult, VmState};

use super::profiler::{ProfileLimits, ProfileMode};
use super::types::{BridgeError, BridgeResult};

/// Marker a debugger puts in an error message to abort the current call.
pub const QUIT_SENTINEL: &str = "__vmbridge_debugger_quit__";

/// Debugger mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugMode {
    Off,
    Step,
    Error,
}

impl DebugMode {
    pub fn name(self) -> &'static str {
        match self {
            DebugMode::Off => "off",
            DebugMode::Step => "step",
            DebugMode::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(DebugMode::Off),
            "step" => Some(DebugMode::Step),
            "error" => Some(DebugMode::Error),
            _ => None,
        }
    }
}

/// JIT compiler mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JitMode {
    On,
    Off,
}

impl JitMode {
    pub fn name(self) -> &'static str {
        match self {
            JitMode::On => "on",
            JitMode::Off => "off",
        }
    }
}

/// Modes applied to every tooled call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolingModes {
    pub debug: DebugMode,
    /// `None` when profiling is off
    pub profile: Option<ProfileMode>,
    pub jit: JitMode,
    pub profile_limits: ProfileLimits,
}

impl Default for ToolingModes {
    fn default() -> Self {
        Self {
            debug: DebugMode::Off,
            profile: None,
            jit: JitMode::On,
            profile_limits: ProfileLimits::default(),
        }
    }
}

impl ToolingModes {
    /// Profile mode as its string, `"off"` when disabled.
    pub fn profile_name(&self) -> String {
        self.profile
            .as_ref()
            .map_or_else(|| "off".to_string(), ToString::to_string)
    }

    /// Check if any aspect changes how a tooled call runs.
    pub fn is_active(&self) -> bool {
        self.debug != DebugMode::Off || self.profile.is_some() || self.jit == JitMode::Off
    }
}

impl fmt::Display for ToolingModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "debug={} profile={} jit={}",
            self.debug.name(),
            self.profile_name(),
            self.jit.name()
        )
    }
}

/// Requested change to one mode aspect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSetting<'a> {
    /// Leave the current value
    Keep,
    /// `true` selects the aspect's default "on" value, `false` turns it off
    Flag(bool),
    /// A mode name; `"on"` selects the default "on" value, `""` keeps the
    /// current value
    Name(&'a str),
}

impl From<bool> for ModeSetting<'_> {
    fn from(b: bool) -> Self {
        ModeSetting::Flag(b)
    }
}

impl<'a> From<&'a str> for ModeSetting<'a> {
    fn from(s: &'a str) -> Self {
        ModeSetting::Name(s)
    }
}

impl<'a> From<Option<&'a str>> for ModeSetting<'a> {
    fn from(s: Option<&'a str>) -> Self {
        s.map_or(ModeSetting::Keep, ModeSetting::Name)
    }
}

/// Resolve a setting to a mode name: `None` keeps the current value.
fn resolve<'a>(setting: ModeSetting<'a>, on_value: &'a str) -> Option<&'a str> {
    match setting {
        ModeSetting::Keep | ModeSetting::Name("") => None,
        ModeSetting::Flag(true) | ModeSetting::Name("on") => Some(on_value),
        ModeSetting::Flag(false) => Some("off"),
        ModeSetting::Name(s) => Some(s),
    }
}

static MODES: LazyLock<RwLock<ToolingModes>> = LazyLock::new(|| RwLock::new(ToolingModes::default()));

/// Current tooling modes.
pub fn get_mode() -> ToolingModes {
    MODES.read().clone()
}

/// Replace all tooling modes at once.
pub fn set_modes(modes: ToolingModes) {
    debug!(target: "vmbridge::tooling", modes = %modes, "tooling modes set");
    *MODES.write() = modes;
}

/// Change the debug, profile and JIT modes. Every argument is validated
/// before any mode changes.
pub fn set_mode<'a>(
    debug: impl Into<ModeSetting<'a>>,
    profile: impl Into<ModeSetting<'a>>,
    jit: impl Into<ModeSetting<'a>>,
) -> BridgeResult<()> {
    let invalid = |value: &str, what: &str| {
        BridgeError::Config(format!("Invalid mode '{}' for {}", value, what))
    };

    let debug = match resolve(debug.into(), "step") {
        None => None,
        Some(s) => Some(DebugMode::parse(s).ok_or_else(|| invalid(s, "debug"))?),
    };
    let profile = match resolve(profile.into(), "li1") {
        None => None,
        Some("off") => Some(None),
        Some(s) => Some(Some(ProfileMode::parse(s)?)),
    };
    let jit = match resolve(jit.into(), "on") {
        None => None,
        Some("on") => Some(JitMode::On),
        Some("off") => Some(JitMode::Off),
        Some(s) => return Err(invalid(s, "jit")),
    };

    let mut modes = MODES.write();
    if let Some(d) = debug {
        modes.debug = d;
    }
    if let Some(p) = profile {
        modes.profile = p;
    }
    if let Some(j) = jit {
        modes.jit = j;
    }
    let current = modes.clone();
    drop(modes);
    debug!(target: "vmbridge::tooling", modes = %current, "tooling modes set");
    Ok(())
}

/// Set the limits applied to profiling sessions.
pub fn set_profile_limits(limits: ProfileLimits) {
    MODES.write().profile_limits = limits;
}

// === Debugger ===

/// Interactive debugger collaborator.
pub trait Debugger: Send + Sync {
    /// Arm single stepping. Runs inside the step adapter, just before the
    /// callee is invoked.
    fn step_into(&self, vm: &mut VmState);

    /// Message handler for error-trap mode. The error object is at stack
    /// index 1; return it (or a replacement) as the single result. Returning
    /// an error means the user quit the debugger.
    fn on_error(&self, vm: &mut VmState) -> VmResult<usize>;
}

/// Error that aborts the current call as a debugger quit.
pub fn quit_error() -> VmError {
    VmError::runtime(QUIT_SENTINEL)
}

/// Debugger that reports through tracing and never stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDebugger;

impl Debugger for TracingDebugger {
    fn step_into(&self, vm: &mut VmState) {
        vm.set_hook(
            HookSlot::Debug,
            Some(Hook::on_call(|vm: &mut VmState, event| {
                if event != HookEvent::Call {
                    return;
                }
                if let Some(frame) = vm.call_stack(1).first() {
                    let site = frame
                        .source
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "?".to_string());
                    debug!(target: "vmbridge::tooling", function = %frame.name, site = %site, "step");
                }
            })),
        );
    }

    fn on_error(&self, vm: &mut VmState) -> VmResult<usize> {
        let message = vm
            .to_bytes(1)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_else(|| format!("({} error object)", vm.get(1).type_name()));
        warn!(target: "vmbridge::tooling", error = %message, "error trapped by debugger");
        vm.push_value(1);
        Ok(1)
    }
}

static DEBUGGER: LazyLock<RwLock<Arc<dyn Debugger>>> =
    LazyLock::new(|| RwLock::new(Arc::new(TracingDebugger)));

/// Install the debugger used by tooled calls.
pub fn set_debugger(debugger: Arc<dyn Debugger>) {
    *DEBUGGER.write() = debugger;
}

/// The debugger used by tooled calls.
pub fn debugger() -> Arc<dyn Debugger> {
    Arc::clone(&DEBUGGER.read())
}

/// Function placed below the callee in step mode. Arms single stepping, then
/// calls its first argument with the remaining arguments.
pub(crate) fn step_adapter() -> NativeFunction {
    NativeFunction::new("debugger step adapter", |vm: &mut VmState| {
        debugger().step_into(vm);
        let nargs = vm.top().saturating_sub(1);
        vm.call(nargs, Returns::All)?;
        Ok(vm.top())
    })
}

/// Message handler placed below the callee in error-trap mode.
pub(crate) fn message_handler() -> NativeFunction {
    NativeFunction::new("debugger message handler", |vm: &mut VmState| {
        debugger().on_error(vm)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rules() {
        assert_eq!(resolve(ModeSetting::Keep, "step"), None);
        assert_eq!(resolve(ModeSetting::Name(""), "step"), None);
        assert_eq!(resolve(ModeSetting::Name("on"), "step"), Some("step"));
        assert_eq!(resolve(ModeSetting::Flag(true), "li1"), Some("li1"));
        assert_eq!(resolve(ModeSetting::Flag(false), "li1"), Some("off"));
        assert_eq!(resolve(ModeSetting::Name("error"), "step"), Some("error"));
    }

    #[test]
    fn test_modes_display() {
        let modes = ToolingModes {
            debug: DebugMode::Error,
            profile: Some(ProfileMode::default()),
            jit: JitMode::Off,
            profile_limits: ProfileLimits::default(),
        };
        assert_eq!(modes.to_string(), "debug=error profile=li1 jit=off");
        assert!(modes.is_active());
        assert!(!ToolingModes::default().is_active());
    }

    #[test]
    fn test_step_adapter_forwards_arguments() {
        let mut vm = VmState::new();
        vm.push_function(step_adapter());
        vm.push_function(NativeFunction::new("sum", |vm: &mut VmState| {
            let a = vm.to_number(1).unwrap_or(0.0);
            let b = vm.to_number(2).unwrap_or(0.0);
            vm.push_number(a + b);
            Ok(1)
        }));
        vm.push_number(2.0);
        vm.push_number(5.0);
        vm.call(3, Returns::All).unwrap();
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.to_number(-1), Some(7.0));
    }
}
