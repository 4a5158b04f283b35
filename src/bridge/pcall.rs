//! Call Bridge - protected calls with error translation and tooling.
//!
//! Every cross-language call goes through [`pcall`]: the function and its
//! arguments are already on the stack; on success they are replaced by the
//! requested results, on failure they are gone, the error object has been
//! turned into a [`BridgeError`] and popped, and the stack is back at its
//! pre-call depth.
//!
//! With [`Tooling::All`] the current tooling modes are applied around the
//! call (debugger, profiler, JIT switch). Internal helper calls use
//! [`Tooling::None`]. Cleanup always runs after the error has been captured
//! and before it is returned.

use tracing::debug;

use crate::vm::{HookSlot, Returns, VmState, VmStatus, VmValue};

use super::profiler;
use super::state::LuaState;
use super::tooling::{self, DebugMode, JitMode, QUIT_SENTINEL};
use super::types::{BridgeError, BridgeResult, LuaErrorKind};

/// Whether a call runs under the global tooling modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tooling {
    None,
    All,
}

/// Protected call of the function below the top `nargs` values.
pub fn pcall(
    state: &mut LuaState,
    nargs: usize,
    returns: Returns,
    what: &str,
    tooling: Tooling,
) -> BridgeResult<()> {
    state.collect_released();
    if state.vm().top() < nargs + 1 {
        return Err(BridgeError::argument(format!(
            "{}: expected a function and {} arguments on the stack",
            what, nargs
        )));
    }
    let modes = match tooling {
        Tooling::All => Some(tooling::get_mode()).filter(|m| m.is_active()),
        Tooling::None => None,
    };
    let label = state.label().to_string();
    let vm = state.vm_mut();

    let mut nargs = nargs;
    let mut errfunc: Option<i32> = None;
    let mut session = None;
    let jit_before = vm.jit_enabled();

    // Pre run: debugger, profiler, JIT
    if let Some(m) = &modes {
        match m.debug {
            DebugMode::Error => {
                vm.push_function(tooling::message_handler());
                let idx = vm.top() as i32 - 1 - nargs as i32;
                insert(vm, idx)?;
                errfunc = Some(idx);
            }
            DebugMode::Step => {
                vm.push_function(tooling::step_adapter());
                insert(vm, -(nargs as i32 + 2))?;
                nargs += 1;
            }
            DebugMode::Off => {}
        }
        if let Some(mode) = &m.profile {
            session = Some(profiler::start(vm, mode, m.profile_limits));
        }
        if m.jit == JitMode::Off {
            vm.set_jit(false);
        }
    }

    let status = vm.pcall(nargs, returns, errfunc);
    let error = handle_lua_error(vm, status, what);

    // Post run
    if let Some(m) = &modes {
        if let Some(idx) = errfunc {
            // The handler sits below any results; it cannot have moved.
            let _ = vm.remove(idx);
        }
        if m.debug != DebugMode::Off {
            vm.set_hook(HookSlot::Debug, None);
        }
        if let Some(session) = session {
            profiler::finish(vm, session, &label);
        }
        if m.jit == JitMode::Off {
            vm.set_jit(jit_before);
        }
    }

    match error {
        None => Ok(()),
        Some(_) if errfunc.is_some() && status == VmStatus::ErrErr => {
            debug!(target: "vmbridge::pcall", what, "debugger quit");
            Err(BridgeError::DebuggerQuit)
        }
        Some(e) => Err(e),
    }
}

fn insert(vm: &mut VmState, idx: i32) -> BridgeResult<()> {
    vm.insert(idx)
        .map_err(|e| BridgeError::argument(format!("cannot install debugger: {}", e)))
}

/// Raw protected call: no tooling, no translation. On failure the error
/// object is left on top of the stack for [`handle_lua_error`].
pub fn pcall_status(vm: &mut VmState, nargs: usize, returns: Returns) -> VmStatus {
    vm.pcall(nargs, returns, None)
}

/// Translate a protected call status. For failures the error object on top
/// of the stack is popped and folded into the returned error.
pub fn handle_lua_error(vm: &mut VmState, status: VmStatus, what: &str) -> Option<BridgeError> {
    let kind = LuaErrorKind::from_status(status)?;
    let message = error_message(&vm.get(-1));
    vm.pop(1);
    debug!(target: "vmbridge::pcall", what, status = status.code(), error = %message, "protected call failed");
    if message.contains(QUIT_SENTINEL) {
        return Some(BridgeError::DebuggerQuit);
    }
    Some(BridgeError::Lua {
        kind,
        context: what.to_string(),
        message,
    })
}

/// Text of an error object.
pub fn error_message(obj: &VmValue) -> String {
    match obj {
        VmValue::String(s) => String::from_utf8_lossy(s).into_owned(),
        VmValue::Number(n) => crate::vm::value::format_number(*n),
        other => format!("(error object is a {} value)", other.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{NativeFunction, Table, VmError};

    #[test]
    fn test_error_message_forms() {
        assert_eq!(error_message(&VmValue::string("oops")), "oops");
        assert_eq!(error_message(&VmValue::Number(42.0)), "42");
        assert_eq!(
            error_message(&VmValue::table(Table::new())),
            "(error object is a table value)"
        );
        assert_eq!(error_message(&VmValue::Nil), "(error object is a nil value)");
    }

    #[test]
    fn test_handle_lua_error_pops_object() {
        let mut vm = VmState::new();
        vm.push_string("keep");
        vm.push_function(NativeFunction::new("fail", |_vm: &mut VmState| {
            Err(VmError::Syntax("unexpected symbol near 'x'".into()))
        }));
        let status = pcall_status(&mut vm, 0, Returns::Fixed(1));
        assert_eq!(status, VmStatus::ErrSyntax);
        let err = handle_lua_error(&mut vm, status, "test").unwrap();
        assert_eq!(vm.top(), 1);
        assert!(matches!(
            err,
            BridgeError::Lua {
                kind: LuaErrorKind::Syntax,
                ..
            }
        ));
    }

    #[test]
    fn test_quit_sentinel_detected() {
        let mut vm = VmState::new();
        vm.push_function(NativeFunction::new("quit", |_vm: &mut VmState| {
            Err(tooling::quit_error())
        }));
        let status = pcall_status(&mut vm, 0, Returns::Fixed(0));
        assert_eq!(
            handle_lua_error(&mut vm, status, "test"),
            Some(BridgeError::DebuggerQuit)
        );
    }

    #[test]
    fn test_success_is_none() {
        let mut vm = VmState::new();
        assert!(handle_lua_error(&mut vm, VmStatus::Ok, "test").is_none());
    }
}
