//! Entry points: run code, create and call function handles, and read and
//! write module tables.
//!
//! Every entry point locks its instance for the whole operation and goes
//! through the Call Bridge with the global tooling modes applied.

use std::sync::Arc;

use tracing::debug;

use crate::host::{ExternalPtr, HostValue};
use crate::vm::{Chunk, NativeFunction, Returns, VmError, VmState, VmType, VmValue};

use super::pcall::{pcall, Tooling};
use super::pull::return_values;
use super::push::{pass, push};
use super::registry_entry::RegistryEntry;
use super::state::{Bridge, LuaState, StateKey};
use super::types::{BridgeError, BridgeResult};

impl Bridge {
    /// Run `chunk` and convert everything it returns.
    pub fn run_chunk(&self, chunk: &Chunk, key: Option<StateKey>) -> BridgeResult<HostValue> {
        let shared = self.state(key)?;
        let mut state = shared.lock();
        let top0 = state.vm().top();
        state.vm_mut().load(chunk);
        pcall(&mut state, 0, Returns::All, "run_chunk()", Tooling::All)?;
        let nret = state.vm().top() - top0;
        return_values(&mut state, nret)
    }

    /// Run `chunk`, which must return exactly one function, and return a
    /// handle to that function.
    pub fn func_create(&self, chunk: &Chunk, key: Option<StateKey>) -> BridgeResult<HostValue> {
        let shared = self.state(key)?;
        let mut state = shared.lock();
        let top0 = state.vm().top();
        state.vm_mut().load(chunk);
        pcall(&mut state, 0, Returns::All, "func_create()", Tooling::All)?;
        let nret = state.vm().top() - top0;
        if let Err(e) = expect_one(&state, nret, VmType::Function, "lua_func expects `code'") {
            state.vm_mut().set_top(top0 as i32);
            return Err(e);
        }
        let entry = RegistryEntry::register(&mut state)?;
        debug!(target: "vmbridge::state", key = %state.key(), handle = entry.key(), "function handle created");
        Ok(HostValue::External(ExternalPtr::Function(Arc::new(entry))))
    }

    /// Call a function handle with `args`, pushed according to `acode`.
    /// `None` for `key` means the instance the handle belongs to.
    pub fn func_call(
        &self,
        func: &HostValue,
        args: &[HostValue],
        acode: &str,
        key: Option<StateKey>,
    ) -> BridgeResult<HostValue> {
        let entry = match func.as_external() {
            Some(ExternalPtr::Function(entry)) => Arc::clone(entry),
            _ => {
                return Err(BridgeError::argument(
                    "func_call expects a valid registry entry.",
                ))
            }
        };
        if !entry.is_armed() {
            return Err(BridgeError::HandleInvalid(
                "registry entry was invalidated because its Lua state was closed".into(),
            ));
        }
        let shared = self.state(Some(key.unwrap_or_else(|| entry.state_key())))?;
        let mut state = shared.lock();
        let top0 = state.vm().top();
        entry.get(&mut state)?;
        let nargs = match pass(&mut state, args, acode) {
            Ok(n) => n,
            Err(e) => {
                state.vm_mut().set_top(top0 as i32);
                return Err(e);
            }
        };
        pcall(&mut state, nargs, Returns::All, "func_call()", Tooling::All)?;
        let nret = state.vm().top() - top0;
        return_values(&mut state, nret)
    }

    /// Run `chunk`, which must return exactly one table, and return a module
    /// handle to that table.
    pub fn module_load(&self, chunk: &Chunk, key: Option<StateKey>) -> BridgeResult<HostValue> {
        let shared = self.state(key)?;
        let mut state = shared.lock();
        let top0 = state.vm().top();
        state.vm_mut().load(chunk);
        pcall(&mut state, 0, Returns::All, "module_load()", Tooling::All)?;
        let nret = state.vm().top() - top0;
        if let Err(e) = expect_one(&state, nret, VmType::Table, "lua_module expects the module")
        {
            state.vm_mut().set_top(top0 as i32);
            return Err(e);
        }
        let entry = RegistryEntry::register(&mut state)?;
        debug!(target: "vmbridge::state", key = %state.key(), module = chunk.name(), "module loaded");
        Ok(HostValue::External(ExternalPtr::Module(Arc::new(entry))))
    }

    /// Read `module[keys[0]][keys[1]]...`. With `typecheck`, the value's VM
    /// type name must match.
    pub fn module_get(
        &self,
        module: &HostValue,
        keys: &[HostValue],
        typecheck: Option<&str>,
    ) -> BridgeResult<HostValue> {
        if keys.is_empty() {
            return Err(BridgeError::argument(
                "Must provide at least one index to get value.",
            ));
        }
        let (shared, entry) = self.module_state(module, "module_get")?;
        let mut state = shared.lock();
        let top0 = state.vm().top();
        let result = (|| -> BridgeResult<HostValue> {
            entry.get(&mut state)?;
            descend(&mut state, keys)?;
            if let Some(expected) = typecheck {
                let actual = state.vm().type_at(-1);
                if actual.name() != expected {
                    return Err(if actual == VmType::Nil {
                        BridgeError::argument("Error: value in module is nil or undefined.")
                    } else {
                        BridgeError::argument(format!(
                            "Type error: expecting value to be {}, not {}",
                            expected,
                            actual.name()
                        ))
                    });
                }
            }
            return_values(&mut state, 1)
        })();
        state.vm_mut().set_top(top0 as i32);
        result
    }

    /// Assign `value`, pushed with mode `mode`, to
    /// `module[keys[0]]...[keys[n-1]]`. Top-level functions of the module
    /// cannot be replaced.
    pub fn module_set(
        &self,
        module: &HostValue,
        keys: &[HostValue],
        mode: char,
        value: &HostValue,
    ) -> BridgeResult<()> {
        let Some((last, path)) = keys.split_last() else {
            return Err(BridgeError::argument(
                "Must provide at least one index to set value.",
            ));
        };
        let (shared, entry) = self.module_state(module, "module_set")?;
        let mut state = shared.lock();
        let top0 = state.vm().top();
        let result = (|| -> BridgeResult<()> {
            entry.get(&mut state)?;

            // Refuse to replace a top-level function.
            push(&mut state, &keys[0], 's')?;
            let vm = state.vm_mut();
            let key = vm.pop_value().map_err(|e| BridgeError::argument(e.to_string()))?;
            let current = vm
                .get(-1)
                .as_table()
                .map(|t| t.lock().get(&key))
                .unwrap_or_default();
            if current.vm_type() == VmType::Function {
                return Err(BridgeError::argument(
                    "Cannot overwrite a top-level module function.",
                ));
            }

            descend(&mut state, path)?;
            state.vm_mut().push_function(settable());
            state
                .vm_mut()
                .insert(-2)
                .map_err(|e| BridgeError::argument(e.to_string()))?;
            push(&mut state, last, 's')?;
            push(&mut state, value, mode)?;
            pcall(&mut state, 3, Returns::Fixed(0), "module_set()", Tooling::None).map_err(
                |e| match e.lua_message() {
                    Some(msg) => BridgeError::argument(format!("Could not set index: {}.", msg)),
                    None => e,
                },
            )
        })();
        state.vm_mut().set_top(top0 as i32);
        result
    }

    /// Number of values on an instance's stack.
    pub fn stack_depth(&self, key: Option<StateKey>) -> BridgeResult<usize> {
        let shared = self.state(key)?;
        let depth = shared.lock().vm().top();
        Ok(depth)
    }

    fn module_state(
        &self,
        module: &HostValue,
        what: &str,
    ) -> BridgeResult<(super::state::SharedState, Arc<RegistryEntry>)> {
        let entry = match module.as_external() {
            Some(ExternalPtr::Module(entry)) => Arc::clone(entry),
            _ => {
                return Err(BridgeError::argument(format!(
                    "{} expects a valid registry entry.",
                    what
                )))
            }
        };
        if !entry.is_armed() {
            return Err(BridgeError::HandleInvalid(
                "registry entry was invalidated because its Lua state was closed".into(),
            ));
        }
        let shared = self.state(Some(entry.state_key()))?;
        Ok((shared, entry))
    }
}

/// Check that a chunk left exactly one value of type `expected`.
fn expect_one(state: &LuaState, nret: usize, expected: VmType, who: &str) -> BridgeResult<()> {
    if nret != 1 {
        return Err(BridgeError::argument(format!(
            "{} to evaluate to one value, not {}.",
            who, nret
        )));
    }
    let actual = state.vm().type_at(-1);
    if actual != expected {
        return Err(BridgeError::argument(format!(
            "{} to evaluate to a {}, not a {}.",
            who,
            expected.name(),
            actual.name()
        )));
    }
    Ok(())
}

/// Replace the table on top with `table[key]` for each key, in protected
/// mode.
fn descend(state: &mut LuaState, keys: &[HostValue]) -> BridgeResult<()> {
    for (k, key) in keys.iter().enumerate() {
        state.vm_mut().push_function(gettable());
        state
            .vm_mut()
            .insert(-2)
            .map_err(|e| BridgeError::argument(e.to_string()))?;
        push(state, key, 's')?;
        pcall(state, 2, Returns::Fixed(1), "module index", Tooling::None).map_err(|e| {
            match e.lua_message() {
                Some(msg) => {
                    BridgeError::argument(format!("Could not get index {}: {}.", k + 1, msg))
                }
                None => e,
            }
        })?;
    }
    Ok(())
}

fn index_target(vm: &VmState) -> Result<crate::vm::TableRef, VmError> {
    match vm.get(1) {
        VmValue::Table(t) => Ok(t),
        other => Err(VmError::runtime(format!(
            "attempt to index a {} value",
            other.type_name()
        ))),
    }
}

/// `t, k -> t[k]`
fn gettable() -> NativeFunction {
    NativeFunction::new("gettable", |vm: &mut VmState| {
        let t = index_target(vm)?;
        let v = t.lock().get(&vm.get(2));
        vm.push(v);
        Ok(1)
    })
}

/// `t, k, v -> ()` with `t[k] = v`
fn settable() -> NativeFunction {
    NativeFunction::new("settable", |vm: &mut VmState| {
        let t = index_target(vm)?;
        let (k, v) = (vm.get(2), vm.get(3));
        t.lock().set(k, v)?;
        Ok(0)
    })
}
