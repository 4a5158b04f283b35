//! VM-resident companion helpers.
//!
//! Every instance runs a bootstrap chunk that installs the `vmbridge` module
//! table as a global and registers six helper functions in the registry:
//!
//! | helper           | arguments              | result                          |
//! |------------------|------------------------|---------------------------------|
//! | `construct_ref`  | host slot, tag         | cdata sharing the host vector   |
//! | `construct_vec`  | host slot, tag         | owned cdata or character table  |
//! | `construct_list` | values, name→position  | list table                      |
//! | `construct_null` |                        | null cdata                      |
//! | `return_info`    | value                  | tag and size, or nil, nil       |
//! | `return_copy`    | value, host slot       | fills the host slot             |
//!
//! A list table keeps its contents at `list[0]`: positional entries at
//! `1..size` and attributes at string keys, with `names` stored as a
//! name→position table. Character vectors in `'v'` mode are tables holding
//! strings, with [`NA_CHARACTER`] standing in for missing values.
//!
//! The bridge resolves the helpers once per instance into [`Helpers`].

use tracing::debug;

use crate::host::{HostValue, Vector};
use crate::vm::{
    CData, CDataPayload, Chunk, NativeFunction, Table, TableRef, VmError, VmResult, VmState,
    VmValue,
};

use super::tags::{BaseKind, TypeTag};
use super::types::{BridgeError, BridgeResult};

/// Name of the module global installed by the bootstrap chunk.
pub const MODULE_NAME: &str = "vmbridge";
/// Registry key of the handle association table.
pub const ENTRIES_KEY: &str = "vmbridge.entries";
/// Value representing a missing element in a character vector table.
pub const NA_CHARACTER: VmValue = VmValue::LightUserdata(0);
/// Number standing in for a missing logical, integer or numeric element.
pub const NA_REAL: f64 = f64::NAN;

/// Whether `value` is the [`NA_CHARACTER`] sentinel.
pub fn is_na_character(value: &VmValue) -> bool {
    matches!(value, VmValue::LightUserdata(0))
}

const HELPER_NAMES: [&str; 6] = [
    "construct_ref",
    "construct_vec",
    "construct_list",
    "construct_null",
    "return_info",
    "return_copy",
];

fn registry_key(name: &str) -> String {
    format!("{}.{}", MODULE_NAME, name)
}

/// Cached helper functions of one instance.
#[derive(Debug, Clone)]
pub struct Helpers {
    pub construct_ref: VmValue,
    pub construct_vec: VmValue,
    pub construct_list: VmValue,
    pub construct_null: VmValue,
    pub return_info: VmValue,
    pub return_copy: VmValue,
}

impl Helpers {
    /// Read the helpers the bootstrap chunk registered.
    pub fn resolve(vm: &VmState) -> BridgeResult<Self> {
        let registry = vm.registry().lock();
        let fetch = |name: &str| -> BridgeResult<VmValue> {
            match registry.get_str(&registry_key(name)) {
                f @ VmValue::Function(_) => Ok(f),
                other => Err(BridgeError::Config(format!(
                    "companion helper '{}' is missing from the registry (found {})",
                    name,
                    other.type_name()
                ))),
            }
        };
        Ok(Self {
            construct_ref: fetch("construct_ref")?,
            construct_vec: fetch("construct_vec")?,
            construct_list: fetch("construct_list")?,
            construct_null: fetch("construct_null")?,
            return_info: fetch("return_info")?,
            return_copy: fetch("return_copy")?,
        })
    }
}

/// The chunk that installs the module and registers the helpers.
pub fn bootstrap_chunk() -> Chunk {
    Chunk::new("vmbridge module", |vm: &mut VmState| {
        let list_meta = TableRef::new(Table::new());
        list_meta.lock().set_str("__name", VmValue::string("vmbridge.list"));
        let charvec_meta = TableRef::new(Table::new());
        charvec_meta
            .lock()
            .set_str("__name", VmValue::string("vmbridge.character_vt"));

        let mut module = Table::new();
        module.set_str("construct_ref", VmValue::function(construct_ref()));
        module.set_str(
            "construct_vec",
            VmValue::function(construct_vec(charvec_meta.clone())),
        );
        module.set_str(
            "construct_list",
            VmValue::function(construct_list(list_meta.clone())),
        );
        module.set_str("construct_null", VmValue::function(construct_null()));
        module.set_str(
            "return_info",
            VmValue::function(return_info(list_meta.clone(), charvec_meta.clone())),
        );
        module.set_str("return_copy", VmValue::function(return_copy(charvec_meta)));
        module.set_str("len", VmValue::function(vector_len()));
        module.set_str("get", VmValue::function(vector_get()));
        module.set_str("set", VmValue::function(vector_set()));
        module.set_str("list_mt", VmValue::Table(list_meta));
        module.set_str("NA_character", NA_CHARACTER);
        module.set_str("NA_real", VmValue::Number(NA_REAL));

        {
            let mut registry = vm.registry().lock();
            for name in HELPER_NAMES {
                registry.set_str(&registry_key(name), module.get_str(name));
            }
            registry.set_str(ENTRIES_KEY, VmValue::table(Table::new()));
        }
        vm.push(VmValue::table(module));
        vm.set_global(MODULE_NAME)?;
        debug!(target: "vmbridge::state", vm = vm.id(), "companion helpers installed");
        Ok(0)
    })
}

// === Argument helpers ===

fn slot_arg(vm: &VmState, idx: i32, fname: &str) -> VmResult<usize> {
    match vm.get(idx) {
        VmValue::LightUserdata(key) => Ok(key),
        other => Err(VmError::runtime(format!(
            "bad argument #{} to '{}' (host slot expected, got {})",
            idx,
            fname,
            other.type_name()
        ))),
    }
}

fn tag_arg(vm: &VmState, idx: i32, fname: &str) -> VmResult<TypeTag> {
    vm.to_integer(idx)
        .map(|bits| TypeTag::from_bits(bits as u32))
        .ok_or_else(|| {
            VmError::runtime(format!(
                "bad argument #{} to '{}' (type tag expected)",
                idx, fname
            ))
        })
}

fn table_arg(vm: &VmState, idx: i32, fname: &str) -> VmResult<TableRef> {
    match vm.get(idx) {
        VmValue::Table(t) => Ok(t),
        other => Err(VmError::runtime(format!(
            "bad argument #{} to '{}' (table expected, got {})",
            idx,
            fname,
            other.type_name()
        ))),
    }
}

fn parked(vm: &VmState, key: usize, fname: &str) -> VmResult<HostValue> {
    vm.host_slots()
        .get(key)
        .cloned()
        .ok_or_else(|| VmError::runtime(format!("{}: host slot 0x{:x} is empty", fname, key)))
}

fn mismatch(fname: &str, tag: TypeTag, host: &HostValue) -> VmError {
    VmError::runtime(format!(
        "{}: cannot build {} from host {} vector",
        fname,
        tag,
        host.type_name()
    ))
}

// === Constructors ===

fn construct_ref() -> NativeFunction {
    NativeFunction::new("construct_ref", |vm: &mut VmState| {
        let key = slot_arg(vm, 1, "construct_ref")?;
        let tag = tag_arg(vm, 2, "construct_ref")?;
        let host = parked(vm, key, "construct_ref")?;
        if !tag.is_reference() {
            return Err(mismatch("construct_ref", tag, &host));
        }
        let payload = match (tag.base_kind(), host) {
            (Some(BaseKind::Logical), HostValue::Logical(v)) => CDataPayload::LogicalRef(v),
            (Some(BaseKind::Integer), HostValue::Integer(v)) => CDataPayload::IntegerRef(v),
            (Some(BaseKind::Numeric), HostValue::Numeric(v)) => CDataPayload::NumericRef(v),
            (Some(BaseKind::Character), HostValue::Character(v)) => CDataPayload::CharacterRef(v),
            (_, host) => return Err(mismatch("construct_ref", tag, &host)),
        };
        vm.push(VmValue::cdata(CData::new(payload)));
        Ok(1)
    })
}

fn construct_vec(charvec_meta: TableRef) -> NativeFunction {
    NativeFunction::new("construct_vec", move |vm: &mut VmState| {
        let key = slot_arg(vm, 1, "construct_vec")?;
        let tag = tag_arg(vm, 2, "construct_vec")?;
        let host = parked(vm, key, "construct_vec")?;
        if !tag.is_vector() {
            return Err(mismatch("construct_vec", tag, &host));
        }
        let value = match (tag.base_kind(), host) {
            (Some(BaseKind::Logical), HostValue::Logical(v)) => {
                VmValue::cdata(CData::new(CDataPayload::LogicalVec(v.values.to_vec())))
            }
            (Some(BaseKind::Integer), HostValue::Integer(v)) => {
                VmValue::cdata(CData::new(CDataPayload::IntegerVec(v.values.to_vec())))
            }
            (Some(BaseKind::Numeric), HostValue::Numeric(v)) => {
                VmValue::cdata(CData::new(CDataPayload::NumericVec(v.values.to_vec())))
            }
            (Some(BaseKind::Character), HostValue::Character(v)) => {
                let values = v.values.read();
                let mut t = Table::with_capacity(values.len(), 0);
                for (i, s) in values.iter().enumerate() {
                    let elt = match s {
                        Some(s) => VmValue::string(s),
                        None => NA_CHARACTER,
                    };
                    t.set_int(i as i64 + 1, elt);
                }
                t.set_metatable(Some(charvec_meta.clone()));
                VmValue::table(t)
            }
            (_, host) => return Err(mismatch("construct_vec", tag, &host)),
        };
        vm.push(value);
        Ok(1)
    })
}

fn construct_list(list_meta: TableRef) -> NativeFunction {
    NativeFunction::new("construct_list", move |vm: &mut VmState| {
        let values = table_arg(vm, 1, "construct_list")?;
        let names = table_arg(vm, 2, "construct_list")?;
        let entries = values.lock().entries();
        let mut contents = Table::with_capacity(entries.len(), 1);
        for (k, v) in entries {
            contents.set(k, v)?;
        }
        if names.lock().count() > 0 {
            contents.set_str("names", VmValue::Table(names));
        }
        let mut list = Table::with_capacity(0, 1);
        list.set_int(0, VmValue::table(contents));
        list.set_metatable(Some(list_meta.clone()));
        vm.push(VmValue::table(list));
        Ok(1)
    })
}

fn construct_null() -> NativeFunction {
    NativeFunction::new("construct_null", |vm: &mut VmState| {
        vm.push(VmValue::cdata(CData::new(CDataPayload::Null)));
        Ok(1)
    })
}

// === Inspection and copy-out ===

/// Number of positional entries of a list's contents table.
fn list_size(contents: &Table) -> usize {
    contents
        .entries()
        .iter()
        .filter_map(|(k, _)| k.as_number())
        .filter(|n| *n >= 1.0)
        .fold(0.0_f64, f64::max) as usize
}

fn return_info(list_meta: TableRef, charvec_meta: TableRef) -> NativeFunction {
    NativeFunction::new("return_info", move |vm: &mut VmState| {
        let info = match vm.get(1) {
            VmValue::Table(t) => {
                let t = t.lock();
                match t.metatable() {
                    Some(mt) if mt.ptr_eq(&list_meta) => match t.get_int(0) {
                        VmValue::Table(contents) => {
                            Some((TypeTag::list(), list_size(&contents.lock())))
                        }
                        _ => Some((TypeTag::list(), 0)),
                    },
                    Some(mt) if mt.ptr_eq(&charvec_meta) => {
                        Some((TypeTag::vector(BaseKind::Character), t.length()))
                    }
                    _ => None,
                }
            }
            VmValue::CData(c) => {
                let len = c.len();
                let tag = match &*c.payload() {
                    CDataPayload::LogicalRef(_) => Some(TypeTag::reference(BaseKind::Logical)),
                    CDataPayload::IntegerRef(_) => Some(TypeTag::reference(BaseKind::Integer)),
                    CDataPayload::NumericRef(_) => Some(TypeTag::reference(BaseKind::Numeric)),
                    CDataPayload::CharacterRef(_) => {
                        Some(TypeTag::reference(BaseKind::Character))
                    }
                    CDataPayload::LogicalVec(_) => Some(TypeTag::vector(BaseKind::Logical)),
                    CDataPayload::IntegerVec(_) => Some(TypeTag::vector(BaseKind::Integer)),
                    CDataPayload::NumericVec(_) => Some(TypeTag::vector(BaseKind::Numeric)),
                    CDataPayload::Null => Some(TypeTag::null()),
                    CDataPayload::Foreign(_) => None,
                };
                tag.map(|t| (t, len))
            }
            _ => None,
        };
        match info {
            Some((tag, size)) => {
                vm.push_integer(tag.bits() as i64);
                vm.push_number(size as f64);
            }
            None => {
                vm.push_nil();
                vm.push_nil();
            }
        }
        Ok(2)
    })
}

fn copy_into<T: Clone>(dest: &Vector<T>, src: &[T]) -> VmResult<()> {
    let mut out = dest.values.write();
    if out.len() != src.len() {
        return Err(VmError::runtime(format!(
            "return_copy: destination has length {} but source has length {}",
            out.len(),
            src.len()
        )));
    }
    out.clone_from_slice(src);
    Ok(())
}

fn return_copy(charvec_meta: TableRef) -> NativeFunction {
    NativeFunction::new("return_copy", move |vm: &mut VmState| {
        let key = slot_arg(vm, 2, "return_copy")?;
        match vm.get(1) {
            VmValue::CData(c) => {
                let shared = match &*c.payload() {
                    CDataPayload::LogicalRef(v) => Some(HostValue::Logical(v.clone())),
                    CDataPayload::IntegerRef(v) => Some(HostValue::Integer(v.clone())),
                    CDataPayload::NumericRef(v) => Some(HostValue::Numeric(v.clone())),
                    CDataPayload::CharacterRef(v) => Some(HostValue::Character(v.clone())),
                    CDataPayload::Null => Some(HostValue::Null),
                    _ => None,
                };
                if let Some(host) = shared {
                    vm.host_slots_mut().put(key, host);
                    return Ok(0);
                }
                let dest = parked(vm, key, "return_copy")?;
                match (&*c.payload(), &dest) {
                    (CDataPayload::LogicalVec(src), HostValue::Logical(d)) => copy_into(d, src)?,
                    (CDataPayload::IntegerVec(src), HostValue::Integer(d)) => copy_into(d, src)?,
                    (CDataPayload::NumericVec(src), HostValue::Numeric(d)) => copy_into(d, src)?,
                    (payload, dest) => {
                        return Err(VmError::runtime(format!(
                            "return_copy: cannot copy {} into host {} vector",
                            payload.ctype_name(),
                            dest.type_name()
                        )))
                    }
                }
                Ok(0)
            }
            VmValue::Table(t) => {
                let t = t.lock();
                if !t.metatable().is_some_and(|mt| mt.ptr_eq(&charvec_meta)) {
                    return Err(VmError::runtime("return_copy: table is not a character vector"));
                }
                let src: Vec<Option<String>> = (1..=t.length() as i64)
                    .map(|i| match t.get_int(i) {
                        VmValue::String(s) => Some(String::from_utf8_lossy(&s).into_owned()),
                        VmValue::Number(n) => Some(crate::vm::value::format_number(n)),
                        _ => None,
                    })
                    .collect();
                drop(t);
                match parked(vm, key, "return_copy")? {
                    HostValue::Character(d) => copy_into(&d, &src)?,
                    other => {
                        return Err(VmError::runtime(format!(
                            "return_copy: cannot copy character vector into host {}",
                            other.type_name()
                        )))
                    }
                }
                Ok(0)
            }
            other => Err(VmError::runtime(format!(
                "return_copy: cannot copy a {} value",
                other.type_name()
            ))),
        }
    })
}

// === Vector access from VM code ===

fn cdata_arg(vm: &VmState, fname: &str) -> VmResult<crate::vm::CDataRef> {
    match vm.get(1) {
        VmValue::CData(c) => Ok(c),
        other => Err(VmError::runtime(format!(
            "bad argument #1 to '{}' (cdata expected, got {})",
            fname,
            other.type_name()
        ))),
    }
}

fn index_arg(vm: &VmState, fname: &str) -> VmResult<usize> {
    vm.to_integer(2)
        .filter(|i| *i >= 1)
        .map(|i| i as usize)
        .ok_or_else(|| VmError::runtime(format!("bad argument #2 to '{}' (index expected)", fname)))
}

fn vector_len() -> NativeFunction {
    NativeFunction::new("len", |vm: &mut VmState| {
        let c = cdata_arg(vm, "len")?;
        vm.push_number(c.len() as f64);
        Ok(1)
    })
}

fn vector_get() -> NativeFunction {
    NativeFunction::new("get", |vm: &mut VmState| {
        let c = cdata_arg(vm, "get")?;
        let i = index_arg(vm, "get")?;
        let v = c.get(i)?;
        vm.push(v);
        Ok(1)
    })
}

fn vector_set() -> NativeFunction {
    NativeFunction::new("set", |vm: &mut VmState| {
        let c = cdata_arg(vm, "set")?;
        let i = index_arg(vm, "set")?;
        c.set(i, &vm.get(3))?;
        Ok(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Returns, VmStatus};

    fn booted() -> (VmState, Helpers) {
        let mut vm = VmState::new();
        assert_eq!(vm.do_chunk(&bootstrap_chunk(), Returns::Fixed(0)), VmStatus::Ok);
        let helpers = Helpers::resolve(&vm).unwrap();
        (vm, helpers)
    }

    #[test]
    fn test_resolve_requires_bootstrap() {
        let vm = VmState::new();
        assert!(matches!(Helpers::resolve(&vm), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_return_info_on_plain_values() {
        let (mut vm, helpers) = booted();
        vm.push(helpers.return_info.clone());
        vm.create_table(0, 0);
        vm.call(1, Returns::Fixed(2)).unwrap();
        assert!(vm.get(-1).is_nil());
        assert!(vm.get(-2).is_nil());
    }

    #[test]
    fn test_construct_ref_shares_host_memory() {
        let (mut vm, helpers) = booted();
        let host = HostValue::numeric([1.0, 2.0]);
        let key = vm.host_slots_mut().stash(host.clone());
        vm.push(helpers.construct_ref.clone());
        vm.push_light_userdata(key);
        vm.push_integer(TypeTag::reference(BaseKind::Numeric).bits() as i64);
        vm.call(2, Returns::Fixed(1)).unwrap();
        vm.host_slots_mut().take(key);

        vm.get_global(MODULE_NAME);
        vm.get_field(-1, "set").unwrap();
        vm.push_value(-3);
        vm.push_number(1.0);
        vm.push_number(9.0);
        vm.call(3, Returns::Fixed(0)).unwrap();
        assert_eq!(host.as_numeric(), Some(vec![9.0, 2.0]));
    }

    #[test]
    fn test_construct_list_shape() {
        let (mut vm, helpers) = booted();
        vm.push(helpers.construct_list.clone());
        vm.create_table(2, 0);
        vm.push_number(10.0);
        vm.raw_set_int(-2, 1).unwrap();
        vm.push_number(20.0);
        vm.raw_set_int(-2, 2).unwrap();
        vm.create_table(0, 1);
        vm.push_string("b");
        vm.push_number(2.0);
        vm.raw_set(-3).unwrap();
        vm.call(2, Returns::Fixed(1)).unwrap();

        vm.push(helpers.return_info.clone());
        vm.push_value(-2);
        vm.call(1, Returns::Fixed(2)).unwrap();
        assert_eq!(vm.to_integer(-2), Some(TypeTag::LIST as i64));
        assert_eq!(vm.to_number(-1), Some(2.0));
        vm.pop(2);

        vm.raw_get_int(-1, 0).unwrap();
        assert_eq!(vm.get_field(-1, "names").unwrap(), crate::vm::VmType::Table);
    }

    #[test]
    fn test_wrong_tag_is_error() {
        let (mut vm, helpers) = booted();
        let key = vm.host_slots_mut().stash(HostValue::integer([1]));
        vm.push(helpers.construct_vec.clone());
        vm.push_light_userdata(key);
        vm.push_integer(TypeTag::vector(BaseKind::Numeric).bits() as i64);
        assert_eq!(vm.pcall(2, Returns::Fixed(1), None), VmStatus::ErrRun);
    }
}
