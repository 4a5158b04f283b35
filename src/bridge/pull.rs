//! Pull Engine - VM stack values back to the host.
//!
//! [`pull`] converts the value at a stack index without disturbing the stack.
//! Tables and cdata are first inspected with the `return_info` helper: tagged
//! objects (lists, vectors, references, null) come back in their host form,
//! everything else is converted structurally or returned as an opaque
//! address.
//!
//! The `NA_character` sentinel comes back as a character NA; NaN numbers come
//! back as numeric NA.
//!
//! Plain tables become lists. Numeric keys fill the first positions in
//! traversal order and string keys follow; names are attached only when at
//! least one string key exists, with `""` for the numeric positions.

use std::sync::Arc;

use tracing::trace;

use crate::host::attributes::{NAMES, ROW_NAMES};
use crate::host::{ExternalPtr, HostValue, List, Vector};
use crate::vm::{Returns, VmType, VmValue};

use super::companion::is_na_character;
use super::pcall::{pcall, Tooling};
use super::registry_entry::RegistryEntry;
use super::state::LuaState;
use super::tags::{BaseKind, TypeTag};
use super::types::{BridgeError, BridgeResult};

/// Convert the value at `index` to a host value. The stack is unchanged.
pub fn pull(state: &mut LuaState, index: i32) -> BridgeResult<HostValue> {
    let index = state.vm().abs_index(index);
    pull_at(state, index, 0)
}

/// Convert and pop the top `nret` values: `NULL` for none, the value itself
/// for one, a list in return order for more.
pub fn return_values(state: &mut LuaState, nret: usize) -> BridgeResult<HostValue> {
    let top = state.vm().top();
    if nret > top {
        return Err(BridgeError::argument(format!(
            "cannot return {} values from a stack of {}",
            nret, top
        )));
    }
    let first = (top - nret) as i32 + 1;
    let result = match nret {
        0 => Ok(HostValue::Null),
        1 => pull_at(state, first, 0),
        _ => (0..nret as i32)
            .map(|i| pull_at(state, first + i, 0))
            .collect::<BridgeResult<Vec<_>>>()
            .map(HostValue::list),
    };
    state.vm_mut().pop(nret);
    result
}

fn pull_at(state: &mut LuaState, index: i32, depth: usize) -> BridgeResult<HostValue> {
    if depth > state.vm().config().max_call_depth {
        return Err(BridgeError::unsupported(
            "Table nesting is too deep to be returned to R.",
        ));
    }
    let value = state.vm().get(index);
    let ty = state.vm().type_at(index);
    trace!(target: "vmbridge::pull", index, vm_type = ty.name(), "pull");
    match ty {
        VmType::Nil => Ok(HostValue::Null),
        VmType::Boolean => Ok(HostValue::logical([value.is_truthy()])),
        VmType::Number => Ok(HostValue::numeric([value.as_number().unwrap_or(f64::NAN)])),
        VmType::String => {
            let bytes = value.as_bytes().unwrap_or_default();
            if bytes.contains(&0) {
                Ok(HostValue::raw(bytes))
            } else {
                Ok(HostValue::character([String::from_utf8_lossy(bytes)]))
            }
        }
        VmType::Table => match return_info(state, index, "return_info() from pull() [1]")? {
            None => pull_plain_table(state, index, depth),
            Some((tag, size)) if tag.is_list() => pull_list(state, index, size, depth),
            Some((tag, size)) if tag == TypeTag::vector(BaseKind::Character) => {
                let dest = HostValue::Character(Vector::new(vec![None; size]));
                return_copy(state, index, dest, "return_copy() from pull() [1]")
            }
            Some((tag, _)) => Err(BridgeError::unsupported(format!(
                "Unknown table type returned: {}",
                tag
            ))),
        },
        VmType::Function => {
            let vm = state.vm_mut();
            vm.push_value(index);
            let entry = RegistryEntry::register(state)?;
            Ok(HostValue::External(ExternalPtr::Function(Arc::new(entry))))
        }
        VmType::LightUserdata if is_na_character(&value) => {
            Ok(HostValue::Character(Vector::new(vec![None])))
        }
        VmType::LightUserdata | VmType::Userdata | VmType::Thread | VmType::Proto => {
            Ok(HostValue::address(value.to_pointer()))
        }
        VmType::CData => match return_info(state, index, "return_info() from pull() [2]")? {
            None => Ok(HostValue::address(value.to_pointer())),
            Some((tag, _)) if tag.is_reference() => {
                return_copy(state, index, HostValue::Null, "return_copy() from pull() [2]")
            }
            Some((tag, _)) if tag.is_null() => Ok(HostValue::Null),
            Some((tag, size)) => {
                let dest = match tag.base_kind().filter(|_| tag.is_vector()) {
                    Some(BaseKind::Logical) => HostValue::Logical(Vector::new(vec![None; size])),
                    Some(BaseKind::Integer) => HostValue::Integer(Vector::new(vec![None; size])),
                    Some(BaseKind::Numeric) => HostValue::Numeric(Vector::new(vec![0.0; size])),
                    _ => {
                        return Err(BridgeError::unsupported(format!(
                            "Unknown cdata type returned: {}",
                            tag
                        )))
                    }
                };
                return_copy(state, index, dest, "return_copy() from pull() [3]")
            }
        },
        VmType::None => Err(BridgeError::unsupported(format!(
            "Unknown return type detected: {}",
            ty.code()
        ))),
    }
}

/// Pull `value` by pushing it, converting the top and popping it again.
fn pull_nested(state: &mut LuaState, value: VmValue, depth: usize) -> BridgeResult<HostValue> {
    state.vm_mut().push(value);
    let top = state.vm().top() as i32;
    let result = pull_at(state, top, depth + 1);
    state.vm_mut().pop(1);
    result
}

// === Helper calls ===

fn return_info(
    state: &mut LuaState,
    index: i32,
    what: &str,
) -> BridgeResult<Option<(TypeTag, usize)>> {
    let f = state.helpers().return_info.clone();
    let vm = state.vm_mut();
    vm.push(f);
    vm.push_value(index);
    pcall(state, 1, Returns::Fixed(2), what, Tooling::None)?;
    let vm = state.vm_mut();
    let tag = vm.to_integer(-2);
    let size = vm.to_number(-1).unwrap_or(0.0);
    vm.pop(2);
    Ok(tag.map(|bits| (TypeTag::from_bits(bits as u32), size.max(0.0) as usize)))
}

/// Park `dest` in a host slot, let `return_copy` fill it, and take it back.
fn return_copy(
    state: &mut LuaState,
    index: i32,
    dest: HostValue,
    what: &str,
) -> BridgeResult<HostValue> {
    let f = state.helpers().return_copy.clone();
    let vm = state.vm_mut();
    let key = vm.host_slots_mut().stash(dest);
    vm.push(f);
    vm.push_value(index);
    vm.push_light_userdata(key);
    let result = pcall(state, 2, Returns::Fixed(0), what, Tooling::None);
    let filled = state.vm_mut().host_slots_mut().take(key);
    result?;
    filled.ok_or_else(|| BridgeError::unsupported(format!("{}: host slot was emptied", what)))
}

// === Tables ===

fn key_error(key: &VmValue) -> BridgeError {
    BridgeError::unsupported(format!(
        "Lua type {} keys cannot be represented in an R list.",
        key.type_name()
    ))
}

fn pull_plain_table(state: &mut LuaState, index: i32, depth: usize) -> BridgeResult<HostValue> {
    let entries = state
        .vm()
        .table_entries(index)
        .map_err(|e| BridgeError::argument(e.to_string()))?;

    let mut narr = 0usize;
    let mut nrec = 0usize;
    for (k, _) in &entries {
        match k {
            VmValue::Number(_) => narr += 1,
            VmValue::String(_) => nrec += 1,
            other => return Err(key_error(other)),
        }
    }
    if narr + nrec >= state.vm().config().max_array_size {
        return Err(BridgeError::SizeCeiling(format!(
            "Table is too large to be returned to R. Requested size: {}.",
            narr + nrec
        )));
    }

    let mut items = vec![HostValue::Null; narr + nrec];
    let mut names = (nrec > 0).then(|| vec![Some(String::new()); narr + nrec]);
    let (mut arr_i, mut rec_i) = (0, narr);
    for (k, v) in entries {
        let value = pull_nested(state, v, depth)?;
        match k {
            VmValue::String(s) => {
                items[rec_i] = value;
                if let Some(names) = names.as_mut() {
                    names[rec_i] = Some(String::from_utf8_lossy(&s).into_owned());
                }
                rec_i += 1;
            }
            _ => {
                items[arr_i] = value;
                arr_i += 1;
            }
        }
    }

    let mut list = List::new(items);
    if let Some(names) = names {
        list.attributes
            .set(NAMES, HostValue::Character(Vector::new(names)));
    }
    Ok(HostValue::List(list))
}

fn pull_list(
    state: &mut LuaState,
    index: i32,
    size: usize,
    depth: usize,
) -> BridgeResult<HostValue> {
    if size >= state.vm().config().max_array_size {
        return Err(BridgeError::SizeCeiling(format!(
            "List is too large to be returned to R. Requested size: {}.",
            size
        )));
    }
    let contents = match state.vm().get(index) {
        VmValue::Table(t) => t.lock().get_int(0),
        _ => VmValue::Nil,
    };
    let entries = match contents {
        VmValue::Table(t) => t.lock().entries(),
        _ => Vec::new(),
    };

    let mut list = List::new(vec![HostValue::Null; size]);
    for (k, v) in entries {
        match k {
            VmValue::Number(n) => {
                let value = pull_nested(state, v, depth)?;
                let pos = n as usize;
                if n >= 1.0 && pos <= size {
                    list.items[pos - 1] = value;
                }
            }
            VmValue::String(name) if &*name == NAMES.as_bytes() => {
                if size > 0 {
                    list.attributes.set(NAMES, uninvert_names(&v, size)?);
                }
            }
            VmValue::String(name) => {
                let value = pull_nested(state, v, depth)?;
                list.attributes.set(&String::from_utf8_lossy(&name), value);
            }
            other => return Err(key_error(&other)),
        }
    }

    let value = HostValue::List(list);
    if value.inherits("data.frame") && size > 0 && value.attr(ROW_NAMES).is_none() {
        let nrow = value.as_list().map_or(0, |l| l.items[0].len());
        let row_names = HostValue::Integer(Vector::new(vec![None, Some(nrow as i32)]));
        return Ok(value.with_attr(ROW_NAMES, row_names));
    }
    Ok(value)
}

/// Turn a name→position table into a names vector of `size`.
fn uninvert_names(table: &VmValue, size: usize) -> BridgeResult<HostValue> {
    let mut names = vec![Some(String::new()); size];
    if let VmValue::Table(t) = table {
        for (k, v) in t.lock().entries() {
            let (VmValue::String(name), Some(pos)) = (&k, v.as_number()) else {
                return Err(key_error(&k));
            };
            let pos = pos as usize;
            if pos >= 1 && pos <= size {
                names[pos - 1] = Some(String::from_utf8_lossy(name).into_owned());
            }
        }
    }
    Ok(HostValue::Character(Vector::new(names)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::push::push;
    use crate::bridge::state::StateKey;
    use crate::host::attributes::CLASS;
    use crate::vm::VmConfig;

    fn state() -> LuaState {
        LuaState::new(StateKey::DEFAULT, VmConfig::default()).unwrap()
    }

    #[test]
    fn test_scalars() {
        let mut s = state();
        let vm = s.vm_mut();
        vm.push_nil();
        vm.push_boolean(true);
        vm.push_number(1.5);
        vm.push_string("hi");
        assert_eq!(pull(&mut s, 1).unwrap(), HostValue::Null);
        assert_eq!(pull(&mut s, 2).unwrap(), HostValue::logical([true]));
        assert_eq!(pull(&mut s, 3).unwrap(), HostValue::numeric([1.5]));
        assert_eq!(pull(&mut s, -1).unwrap(), HostValue::character(["hi"]));
        assert_eq!(s.vm().top(), 4);
    }

    #[test]
    fn test_na_sentinels() {
        let mut s = state();
        let vm = s.vm_mut();
        vm.push(crate::bridge::companion::NA_CHARACTER);
        vm.push_number(f64::NAN);
        assert_eq!(
            pull(&mut s, 1).unwrap(),
            HostValue::Character(Vector::new(vec![None]))
        );
        let back = pull(&mut s, 2).unwrap();
        assert!(back.as_numeric().is_some_and(|v| v[0].is_nan()));
    }

    #[test]
    fn test_embedded_nul_is_raw() {
        let mut s = state();
        s.vm_mut().push_string(b"a\0bc");
        assert_eq!(pull(&mut s, -1).unwrap(), HostValue::raw(b"a\0bc".to_vec()));
    }

    #[test]
    fn test_plain_table_numeric_then_named() {
        let mut s = state();
        let vm = s.vm_mut();
        vm.create_table(2, 1);
        vm.push_string("x");
        vm.push_number(9.0);
        vm.raw_set(-3).unwrap();
        vm.push_number(1.0);
        vm.raw_set_int(-2, 1).unwrap();
        vm.push_number(2.0);
        vm.raw_set_int(-2, 2).unwrap();
        let v = pull(&mut s, -1).unwrap();
        let list = v.as_list().unwrap();
        assert_eq!(list.items[0], HostValue::numeric([1.0]));
        assert_eq!(list.items[2], HostValue::numeric([9.0]));
        assert_eq!(v.names().unwrap(), vec!["", "", "x"]);
    }

    #[test]
    fn test_plain_table_without_string_keys_has_no_names() {
        let mut s = state();
        let vm = s.vm_mut();
        vm.create_table(1, 0);
        vm.push_boolean(false);
        vm.raw_set_int(-2, 1).unwrap();
        let v = pull(&mut s, -1).unwrap();
        assert!(v.names().is_none());
    }

    #[test]
    fn test_bad_key_type() {
        let mut s = state();
        let vm = s.vm_mut();
        vm.create_table(0, 1);
        vm.push_boolean(true);
        vm.push_number(1.0);
        vm.raw_set(-3).unwrap();
        let err = pull(&mut s, -1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Lua type boolean keys cannot be represented in an R list."
        );
        assert_eq!(s.vm().top(), 1);
    }

    #[test]
    fn test_reference_returns_same_storage() {
        let mut s = state();
        let x = HostValue::integer([1, 2, 3]);
        push(&mut s, &x, 'r').unwrap();
        let back = pull(&mut s, -1).unwrap();
        match (&x, &back) {
            (HostValue::Integer(a), HostValue::Integer(b)) => {
                assert!(a.values.same_storage(&b.values))
            }
            _ => panic!("expected integer vectors"),
        }
    }

    #[test]
    fn test_vector_copy_is_independent() {
        let mut s = state();
        let x = HostValue::numeric([1.0, 2.0]);
        push(&mut s, &x, 'v').unwrap();
        let back = pull(&mut s, -1).unwrap();
        assert_eq!(back.as_numeric(), Some(vec![1.0, 2.0]));
        if let (HostValue::Numeric(a), HostValue::Numeric(b)) = (&x, &back) {
            assert!(!a.values.same_storage(&b.values));
        }
    }

    #[test]
    fn test_character_vector_round_trip() {
        let mut s = state();
        let x = HostValue::Character(Vector::new(vec![Some("a".into()), None]));
        push(&mut s, &x, 'v').unwrap();
        assert_eq!(pull(&mut s, -1).unwrap().as_character(), x.as_character());
    }

    #[test]
    fn test_data_frame_row_names() {
        let mut s = state();
        let df = HostValue::named_list([
            ("a", HostValue::numeric([1.0, 2.0, 3.0])),
            ("b", HostValue::numeric([4.0, 5.0, 6.0])),
        ]);
        push(&mut s, &df, 'r').unwrap();
        // Tag the list as a data frame from the VM side.
        let vm = s.vm_mut();
        vm.raw_get_int(-1, 0).unwrap();
        vm.push_string("data.frame");
        vm.set_field(-2, CLASS).unwrap();
        vm.pop(1);
        let back = pull(&mut s, -1).unwrap();
        assert!(back.inherits("data.frame"));
        assert_eq!(back.names().unwrap(), vec!["a", "b"]);
        assert_eq!(
            back.attr(ROW_NAMES).and_then(HostValue::as_integer),
            Some(vec![None, Some(3)])
        );
    }

    #[test]
    fn test_return_values_shapes() {
        let mut s = state();
        assert_eq!(return_values(&mut s, 0).unwrap(), HostValue::Null);
        let vm = s.vm_mut();
        vm.push_number(1.0);
        vm.push_string("two");
        let v = return_values(&mut s, 2).unwrap();
        assert_eq!(
            v,
            HostValue::list(vec![HostValue::numeric([1.0]), HostValue::character(["two"])])
        );
        assert_eq!(s.vm().top(), 0);
    }

    #[test]
    fn test_function_becomes_handle() {
        let mut s = state();
        s.vm_mut().get_global("vmbridge");
        s.vm_mut().get_field(-1, "len").unwrap();
        let v = pull(&mut s, -1).unwrap();
        assert!(matches!(v, HostValue::External(ExternalPtr::Function(_))));
        assert_eq!(s.vm().top(), 2);
        assert_eq!(s.entry_count(), 1);
    }

    #[test]
    fn test_invalid_index() {
        let mut s = state();
        let err = pull(&mut s, 5).unwrap_err();
        assert_eq!(err.to_string(), "Unknown return type detected: -1");
    }
}
