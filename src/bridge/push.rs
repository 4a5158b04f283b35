//! Push Engine - host values onto the VM stack.
//!
//! [`push`] converts one host value according to a single mode character and
//! leaves exactly one new value on the stack. On failure the stack is left at
//! the depth it had before the call.
//!
//! | host value          | `s` / `t`            | `a`        | `r` / `v`               |
//! |---------------------|----------------------|------------|-------------------------|
//! | `NULL`              | nil                  | nil        | null cdata              |
//! | atomic vector       | scalar or named table| array table| reference / owned cdata |
//! | list                | named table          | error      | list table              |
//! | external pointer    | light userdata       | ←          | ←                       |
//! | raw                 | byte string          | ←          | ←                       |
//!
//! Digit modes `'1'..='9'` require that exact length and then act as `'s'`.

use tracing::trace;

use crate::host::{HostValue, List, Vector};
use crate::vm::{Returns, VmState};

use super::companion::{NA_CHARACTER, NA_REAL};
use super::mode::ArgCode;
use super::pcall::{pcall, Tooling};
use super::state::LuaState;
use super::tags::{BaseKind, TypeTag};
use super::types::{BridgeError, BridgeResult};

/// Push `value` onto `state`'s stack using transfer mode `mode`.
pub fn push(state: &mut LuaState, value: &HostValue, mode: char) -> BridgeResult<()> {
    let top = state.vm().top();
    let result = push_value(state, value, mode);
    if result.is_err() {
        state.vm_mut().set_top(top as i32);
    }
    result
}

/// Push every element of `args`, cycling through `acode`. Returns the number
/// of values pushed.
pub fn pass(state: &mut LuaState, args: &[HostValue], acode: &str) -> BridgeResult<usize> {
    let code = ArgCode::parse(acode)?;
    let top = state.vm().top();
    for (i, arg) in args.iter().enumerate() {
        if let Err(e) = push(state, arg, code.code_for(i)) {
            state.vm_mut().set_top(top as i32);
            return Err(e);
        }
    }
    Ok(args.len())
}

/// Like [`pass`], for the elements of a host list.
pub fn pass_list(state: &mut LuaState, args: &List, acode: &str) -> BridgeResult<usize> {
    pass(state, &args.items, acode)
}

fn push_value(state: &mut LuaState, x: &HostValue, mode: char) -> BridgeResult<()> {
    trace!(target: "vmbridge::push", mode = %mode, host_type = x.type_name(), len = x.len(), "push");
    state
        .vm()
        .check_stack(3)
        .map_err(|e| BridgeError::SizeCeiling(e.to_string()))?;
    match x {
        HostValue::Null => match mode {
            'r' | 'v' => {
                let f = state.helpers().construct_null.clone();
                state.vm_mut().push(f);
                pcall(
                    state,
                    0,
                    Returns::Fixed(1),
                    "construct_null() from push()",
                    Tooling::None,
                )
            }
            _ => {
                state.vm_mut().push_nil();
                Ok(())
            }
        },
        HostValue::Logical(v) => push_vector(state, x, v, mode, BaseKind::Logical),
        HostValue::Integer(v) => push_vector(state, x, v, mode, BaseKind::Integer),
        HostValue::Numeric(v) => push_vector(state, x, v, mode, BaseKind::Numeric),
        HostValue::Character(v) => push_vector(state, x, v, mode, BaseKind::Character),
        HostValue::List(l) => push_list(state, x, l, mode),
        HostValue::External(ptr) => {
            state.vm_mut().push_light_userdata(ptr.address());
            Ok(())
        }
        HostValue::Raw(bytes) => {
            check_string_length(state.vm(), bytes.len())?;
            state.vm_mut().push_string(bytes);
            Ok(())
        }
        HostValue::Unsupported(t) => Err(BridgeError::unsupported(format!(
            "Cannot convert {} to Lua.",
            t.name()
        ))),
    }
}

// === Elements ===

/// An element of an atomic host vector.
///
/// Missing elements keep their position: NA logicals and integers push as
/// NaN, NaN doubles push unchanged, and NA strings push the `NA_character`
/// sentinel.
trait PushElement {
    fn push_element(&self, vm: &mut VmState) -> BridgeResult<()>;
}

impl PushElement for Option<bool> {
    fn push_element(&self, vm: &mut VmState) -> BridgeResult<()> {
        match self {
            Some(b) => vm.push_boolean(*b),
            None => vm.push_number(NA_REAL),
        }
        Ok(())
    }
}

impl PushElement for Option<i32> {
    fn push_element(&self, vm: &mut VmState) -> BridgeResult<()> {
        match self {
            Some(i) => vm.push_integer(*i as i64),
            None => vm.push_number(NA_REAL),
        }
        Ok(())
    }
}

impl PushElement for f64 {
    fn push_element(&self, vm: &mut VmState) -> BridgeResult<()> {
        vm.push_number(*self);
        Ok(())
    }
}

impl PushElement for Option<String> {
    fn push_element(&self, vm: &mut VmState) -> BridgeResult<()> {
        match self {
            Some(s) => {
                check_string_length(vm, s.len())?;
                vm.push_string(s);
            }
            None => vm.push(NA_CHARACTER),
        }
        Ok(())
    }
}

fn check_string_length(vm: &VmState, len: usize) -> BridgeResult<()> {
    let max = vm.config().max_string_bytes;
    if len >= max {
        return Err(BridgeError::SizeCeiling(format!(
            "Cannot pass string with more than {} bytes. Requested size: {}.",
            max, len
        )));
    }
    Ok(())
}

// === Vectors ===

/// Names of `x`'s elements, `""` for unnamed ones. Validated against the
/// element count before anything is built.
fn element_names(x: &HostValue, len: usize) -> BridgeResult<Option<Vec<String>>> {
    match x.attr(crate::host::attributes::NAMES) {
        None => Ok(None),
        Some(HostValue::Character(v)) => {
            if v.len() != len {
                return Err(BridgeError::argument(format!(
                    "names attribute has length {} but the {} has length {}.",
                    v.len(),
                    x.type_name(),
                    len
                )));
            }
            Ok(x.names())
        }
        Some(_) => Err(BridgeError::argument(
            "Non-character names attribute on vector.",
        )),
    }
}

fn unrecognised(mode: char, x: &HostValue) -> BridgeError {
    BridgeError::argument(format!(
        "Unrecognised args code {} for type {}.",
        mode,
        x.type_name()
    ))
}

fn push_vector<T: PushElement>(
    state: &mut LuaState,
    x: &HostValue,
    v: &Vector<T>,
    mode: char,
    kind: BaseKind,
) -> BridgeResult<()> {
    let len = v.len();
    let names = element_names(x, len)?;
    match mode {
        'r' => construct(
            state,
            x,
            TypeTag::reference(kind),
            true,
            "construct_ref() from push_vector()",
        ),
        'v' => construct(
            state,
            x,
            TypeTag::vector(kind),
            false,
            "construct_vec() from push_vector()",
        ),
        's' | 't' | 'a' => {
            let simplify = mode != 'a';
            let values = v.values.read();
            let vm = state.vm_mut();
            if len == 0 {
                vm.push_nil();
                return Ok(());
            }
            if len == 1 && simplify {
                return values[0].push_element(vm);
            }
            check_table_size(vm, len)?;
            match names.filter(|_| simplify) {
                Some(names) => {
                    let named = names.iter().filter(|n| !n.is_empty()).count();
                    vm.create_table(len - named, named);
                    // Backwards, so the first element with a repeated name wins.
                    for i in (0..len).rev() {
                        if names[i].is_empty() {
                            values[i].push_element(vm)?;
                            set_int(vm, i + 1)?;
                        } else {
                            vm.push_string(&names[i]);
                            values[i].push_element(vm)?;
                            set_keyed(vm)?;
                        }
                    }
                }
                None => {
                    vm.create_table(len, 0);
                    for (i, elt) in values.iter().enumerate() {
                        elt.push_element(vm)?;
                        set_int(vm, i + 1)?;
                    }
                }
            }
            Ok(())
        }
        '1'..='9' => {
            let requested = mode as usize - '0' as usize;
            if len != requested {
                return Err(BridgeError::argument(format!(
                    "Vector of length {} requested, but passed vector of length {}.",
                    requested, len
                )));
            }
            push_vector(state, x, v, 's', kind)
        }
        other => Err(unrecognised(other, x)),
    }
}

fn check_table_size(vm: &VmState, len: usize) -> BridgeResult<()> {
    let max = vm.config().max_array_size;
    if len >= max {
        return Err(BridgeError::SizeCeiling(format!(
            "Cannot create Lua table with more than {} elements. Requested size: {}. Use 'r' or 'v' argcode instead.",
            max, len
        )));
    }
    Ok(())
}

fn set_int(vm: &mut VmState, i: usize) -> BridgeResult<()> {
    vm.raw_set_int(-2, i as i64)
        .map_err(|e| BridgeError::argument(e.to_string()))
}

fn set_keyed(vm: &mut VmState) -> BridgeResult<()> {
    vm.raw_set(-3)
        .map_err(|e| BridgeError::argument(e.to_string()))
}

/// Call `construct_ref` or `construct_vec` with `x` parked in a host slot.
fn construct(
    state: &mut LuaState,
    x: &HostValue,
    tag: TypeTag,
    reference: bool,
    what: &str,
) -> BridgeResult<()> {
    let f = if reference {
        state.helpers().construct_ref.clone()
    } else {
        state.helpers().construct_vec.clone()
    };
    let vm = state.vm_mut();
    let key = vm.host_slots_mut().stash(x.clone());
    vm.push(f);
    vm.push_light_userdata(key);
    vm.push_integer(tag.bits() as i64);
    let result = pcall(state, 2, Returns::Fixed(1), what, Tooling::None);
    state.vm_mut().host_slots_mut().take(key);
    result
}

// === Lists ===

fn push_list(state: &mut LuaState, x: &HostValue, list: &List, mode: char) -> BridgeResult<()> {
    let len = list.len();
    let max = state.vm().config().max_array_size;
    if len >= max {
        return Err(BridgeError::SizeCeiling(format!(
            "List is too large to be passed to Lua. Cannot create Lua table with more than {} elements. Requested size: {}.",
            max, len
        )));
    }
    let names = element_names(x, len)?.unwrap_or_else(|| vec![String::new(); len]);
    let named = names.iter().filter(|n| !n.is_empty()).count();

    match mode {
        'r' | 'v' => {
            let f = state.helpers().construct_list.clone();
            state.vm_mut().push(f);
            state.vm_mut().create_table(len, 0);
            for (i, item) in list.items.iter().enumerate() {
                push_value(state, item, mode)?;
                set_int(state.vm_mut(), i + 1)?;
            }
            let vm = state.vm_mut();
            vm.create_table(0, named);
            for (i, name) in names.iter().enumerate().filter(|(_, n)| !n.is_empty()) {
                vm.push_string(name);
                vm.push_integer(i as i64 + 1);
                set_keyed(vm)?;
            }
            pcall(
                state,
                2,
                Returns::Fixed(1),
                "construct_list() from push_list()",
                Tooling::None,
            )
        }
        's' | 't' => {
            state.vm_mut().create_table(len - named, named);
            for i in (0..len).rev() {
                if names[i].is_empty() {
                    push_value(state, &list.items[i], mode)?;
                    set_int(state.vm_mut(), i + 1)?;
                } else {
                    state.vm_mut().push_string(&names[i]);
                    push_value(state, &list.items[i], mode)?;
                    set_keyed(state.vm_mut())?;
                }
            }
            Ok(())
        }
        other => Err(unrecognised(other, x)),
    }
}
