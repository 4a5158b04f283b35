//! Host value model.
//!
//! The host side of the bridge is a vector-oriented runtime: every value is a
//! vector (possibly of length one), a heterogeneous list, an opaque external
//! pointer, a raw byte buffer, or `NULL`. Vectors and lists carry an ordered
//! attribute set, of which `names`, `class` and `row.names` are interpreted by
//! the bridge.
//!
//! Missing values follow the host's conventions: `None` elements in logical,
//! integer and character vectors, and NaN in numeric vectors.
//!
//! # Example
//!
//! ```ignore
//! use vmbridge::host::HostValue;
//!
//! let v = HostValue::numeric([1.0, 2.0, 3.0]).with_names(["a", "b", "c"]);
//! assert_eq!(v.len(), 3);
//! assert_eq!(v.type_name(), "double");
//! ```

pub mod attributes;
pub mod vector;

use std::fmt;
use std::sync::Arc;

pub use attributes::Attributes;
pub use vector::SharedVector;

use crate::bridge::registry_entry::RegistryEntry;

/// Atomic host vector: shared element storage plus attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector<T> {
    pub values: SharedVector<T>,
    pub attributes: Attributes,
}

impl<T> Vector<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self {
            values: SharedVector::new(values),
            attributes: Attributes::new(),
        }
    }

    /// Wrap existing storage without copying it.
    pub fn from_shared(values: SharedVector<T>) -> Self {
        Self {
            values,
            attributes: Attributes::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Heterogeneous, possibly named host list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct List {
    pub items: Vec<HostValue>,
    pub attributes: Attributes,
}

impl List {
    pub fn new(items: Vec<HostValue>) -> Self {
        Self {
            items,
            attributes: Attributes::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an element by its name.
    pub fn get_named(&self, name: &str) -> Option<&HostValue> {
        let names = match self.attributes.get(attributes::NAMES) {
            Some(HostValue::Character(v)) => v.values.to_vec(),
            _ => return None,
        };
        let pos = names.iter().position(|n| n.as_deref() == Some(name))?;
        self.items.get(pos)
    }
}

/// Opaque host-side reference to something living outside the host heap.
#[derive(Debug, Clone)]
pub enum ExternalPtr {
    /// Raw address of a VM object the host cannot otherwise represent.
    Address(usize),
    /// Handle to a VM function held in an instance's registry.
    Function(Arc<RegistryEntry>),
    /// Handle to a VM module table held in an instance's registry.
    Module(Arc<RegistryEntry>),
}

impl ExternalPtr {
    /// Address passed to the VM as light userdata.
    pub fn address(&self) -> usize {
        match self {
            ExternalPtr::Address(addr) => *addr,
            ExternalPtr::Function(entry) | ExternalPtr::Module(entry) => entry.key(),
        }
    }

    /// Registry entry behind a function or module handle.
    pub fn entry(&self) -> Option<&Arc<RegistryEntry>> {
        match self {
            ExternalPtr::Address(_) => None,
            ExternalPtr::Function(entry) | ExternalPtr::Module(entry) => Some(entry),
        }
    }
}

impl PartialEq for ExternalPtr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExternalPtr::Address(a), ExternalPtr::Address(b)) => a == b,
            (ExternalPtr::Function(a), ExternalPtr::Function(b))
            | (ExternalPtr::Module(a), ExternalPtr::Module(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Host types the bridge recognises, named the way the host names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostType {
    Null,
    Logical,
    Integer,
    Numeric,
    Character,
    List,
    External,
    Raw,
    Complex,
    Symbol,
    Closure,
    Builtin,
    Environment,
    Promise,
    Language,
    Expression,
    Pairlist,
    S4,
}

impl HostType {
    pub fn name(self) -> &'static str {
        match self {
            HostType::Null => "NULL",
            HostType::Logical => "logical",
            HostType::Integer => "integer",
            HostType::Numeric => "double",
            HostType::Character => "character",
            HostType::List => "list",
            HostType::External => "externalptr",
            HostType::Raw => "raw",
            HostType::Complex => "complex",
            HostType::Symbol => "symbol",
            HostType::Closure => "closure",
            HostType::Builtin => "builtin",
            HostType::Environment => "environment",
            HostType::Promise => "promise",
            HostType::Language => "language",
            HostType::Expression => "expression",
            HostType::Pairlist => "pairlist",
            HostType::S4 => "S4",
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A host runtime value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Null,
    Logical(Vector<Option<bool>>),
    Integer(Vector<Option<i32>>),
    Numeric(Vector<f64>),
    Character(Vector<Option<String>>),
    List(List),
    External(ExternalPtr),
    Raw(Vec<u8>),
    /// A host value kind the bridge cannot convert.
    Unsupported(HostType),
}

impl HostValue {
    pub fn logical<I: IntoIterator<Item = bool>>(values: I) -> Self {
        HostValue::Logical(Vector::new(values.into_iter().map(Some).collect()))
    }

    pub fn integer<I: IntoIterator<Item = i32>>(values: I) -> Self {
        HostValue::Integer(Vector::new(values.into_iter().map(Some).collect()))
    }

    pub fn numeric<I: IntoIterator<Item = f64>>(values: I) -> Self {
        HostValue::Numeric(Vector::new(values.into_iter().collect()))
    }

    pub fn character<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HostValue::Character(Vector::new(
            values.into_iter().map(|s| Some(s.into())).collect(),
        ))
    }

    pub fn list(items: Vec<HostValue>) -> Self {
        HostValue::List(List::new(items))
    }

    /// Build a list from `(name, value)` pairs. Empty names leave the element unnamed.
    pub fn named_list<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, HostValue)>,
    {
        let (names, items): (Vec<&str>, Vec<HostValue>) = entries.into_iter().unzip();
        HostValue::list(items).with_names(names)
    }

    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        HostValue::Raw(bytes.into())
    }

    pub fn address(addr: usize) -> Self {
        HostValue::External(ExternalPtr::Address(addr))
    }

    /// Set the `names` attribute.
    pub fn with_names<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_attr(attributes::NAMES, HostValue::character(names))
    }

    /// Set an attribute. Values without attributes are returned unchanged.
    pub fn with_attr(mut self, name: &str, value: HostValue) -> Self {
        if let Some(attrs) = self.attributes_mut() {
            attrs.set(name, value);
        }
        self
    }

    pub fn host_type(&self) -> HostType {
        match self {
            HostValue::Null => HostType::Null,
            HostValue::Logical(_) => HostType::Logical,
            HostValue::Integer(_) => HostType::Integer,
            HostValue::Numeric(_) => HostType::Numeric,
            HostValue::Character(_) => HostType::Character,
            HostValue::List(_) => HostType::List,
            HostValue::External(_) => HostType::External,
            HostValue::Raw(_) => HostType::Raw,
            HostValue::Unsupported(t) => *t,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.host_type().name()
    }

    /// Length as the host reports it: 0 for `NULL`, 1 for external pointers.
    pub fn len(&self) -> usize {
        match self {
            HostValue::Null | HostValue::Unsupported(_) => 0,
            HostValue::Logical(v) => v.len(),
            HostValue::Integer(v) => v.len(),
            HostValue::Numeric(v) => v.len(),
            HostValue::Character(v) => v.len(),
            HostValue::List(l) => l.len(),
            HostValue::External(_) => 1,
            HostValue::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            HostValue::Logical(v) => Some(&v.attributes),
            HostValue::Integer(v) => Some(&v.attributes),
            HostValue::Numeric(v) => Some(&v.attributes),
            HostValue::Character(v) => Some(&v.attributes),
            HostValue::List(l) => Some(&l.attributes),
            _ => None,
        }
    }

    pub fn attributes_mut(&mut self) -> Option<&mut Attributes> {
        match self {
            HostValue::Logical(v) => Some(&mut v.attributes),
            HostValue::Integer(v) => Some(&mut v.attributes),
            HostValue::Numeric(v) => Some(&mut v.attributes),
            HostValue::Character(v) => Some(&mut v.attributes),
            HostValue::List(l) => Some(&mut l.attributes),
            _ => None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&HostValue> {
        self.attributes().and_then(|a| a.get(name))
    }

    /// Element names, with NA names reported as empty strings.
    pub fn names(&self) -> Option<Vec<String>> {
        match self.attr(attributes::NAMES)? {
            HostValue::Character(v) => Some(
                v.values
                    .read()
                    .iter()
                    .map(|n| n.clone().unwrap_or_default())
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Check if the `class` attribute contains `class`.
    pub fn inherits(&self, class: &str) -> bool {
        match self.attr(attributes::CLASS) {
            Some(HostValue::Character(v)) => v
                .values
                .read()
                .iter()
                .any(|c| c.as_deref() == Some(class)),
            _ => false,
        }
    }

    pub fn as_numeric(&self) -> Option<Vec<f64>> {
        match self {
            HostValue::Numeric(v) => Some(v.values.to_vec()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<Vec<Option<i32>>> {
        match self {
            HostValue::Integer(v) => Some(v.values.to_vec()),
            _ => None,
        }
    }

    pub fn as_logical(&self) -> Option<Vec<Option<bool>>> {
        match self {
            HostValue::Logical(v) => Some(v.values.to_vec()),
            _ => None,
        }
    }

    pub fn as_character(&self) -> Option<Vec<Option<String>>> {
        match self {
            HostValue::Character(v) => Some(v.values.to_vec()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            HostValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_external(&self) -> Option<&ExternalPtr> {
        match self {
            HostValue::External(p) => Some(p),
            _ => None,
        }
    }
}

impl From<f64> for HostValue {
    fn from(x: f64) -> Self {
        HostValue::numeric([x])
    }
}

impl From<i32> for HostValue {
    fn from(x: i32) -> Self {
        HostValue::integer([x])
    }
}

impl From<bool> for HostValue {
    fn from(x: bool) -> Self {
        HostValue::logical([x])
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::character([s])
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        HostValue::list(items)
    }
}
