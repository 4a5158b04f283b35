//! VM value representation.
//!
//! Reference types (tables, functions, opaque objects, cdata) are `Arc`
//! backed, so copying a `VmValue` between stack slots never copies the
//! object itself. Their identity is the address of the shared allocation.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::cdata::CData;
use super::table::Table;
use super::types::VmResult;
use super::VmState;

/// Type of a stack slot, with the numeric codes the VM reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmType {
    /// Invalid stack index
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
    Proto,
    CData,
}

impl VmType {
    pub fn code(self) -> i32 {
        match self {
            VmType::None => -1,
            VmType::Nil => 0,
            VmType::Boolean => 1,
            VmType::LightUserdata => 2,
            VmType::Number => 3,
            VmType::String => 4,
            VmType::Table => 5,
            VmType::Function => 6,
            VmType::Userdata => 7,
            VmType::Thread => 8,
            VmType::Proto => 9,
            VmType::CData => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VmType::None => "no value",
            VmType::Nil => "nil",
            VmType::Boolean => "boolean",
            VmType::LightUserdata | VmType::Userdata => "userdata",
            VmType::Number => "number",
            VmType::String => "string",
            VmType::Table => "table",
            VmType::Function => "function",
            VmType::Thread => "thread",
            VmType::Proto => "proto",
            VmType::CData => "cdata",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Body of a native function. Arguments sit on the stack above the frame
/// base; the function pushes its results and returns how many it pushed.
pub type NativeFn = dyn Fn(&mut VmState) -> VmResult<usize> + Send + Sync;

/// Where a function was defined, for profiler and debugger reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub chunk: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk, self.line)
    }
}

/// A first-class VM function backed by a Rust closure. Upvalues are whatever
/// the closure captures.
pub struct NativeFunction {
    name: String,
    source: Option<SourceLocation>,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut VmState) -> VmResult<usize> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            source: None,
            func: Box::new(func),
        }
    }

    /// Attach a definition site.
    pub fn with_source(mut self, chunk: impl Into<String>, line: u32) -> Self {
        self.source = Some(SourceLocation {
            chunk: chunk.into(),
            line,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&SourceLocation> {
        self.source.as_ref()
    }

    pub(crate) fn invoke(&self, vm: &mut VmState) -> VmResult<usize> {
        (self.func)(vm)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub type FunctionRef = Arc<NativeFunction>;

/// Shared, lockable table.
#[derive(Clone, Default)]
pub struct TableRef(Arc<Mutex<Table>>);

impl TableRef {
    pub fn new(table: Table) -> Self {
        Self(Arc::new(Mutex::new(table)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Table> {
        self.0.lock()
    }

    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &TableRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: 0x{:x}", self.address())
    }
}

/// Heap object the bridge can only refer to by address (full userdata,
/// coroutine threads, function prototypes).
#[derive(Debug, Clone)]
pub struct OpaqueRef(Arc<str>);

impl OpaqueRef {
    pub fn new(label: &str) -> Self {
        Self(Arc::from(label))
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

/// Shared cdata object.
#[derive(Clone)]
pub struct CDataRef(Arc<CData>);

impl CDataRef {
    pub fn new(cdata: CData) -> Self {
        Self(Arc::new(cdata))
    }

    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl std::ops::Deref for CDataRef {
    type Target = CData;

    fn deref(&self) -> &CData {
        &self.0
    }
}

impl fmt::Debug for CDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cdata<{}>: 0x{:x}", self.0.ctype_name(), self.address())
    }
}

/// A VM value.
#[derive(Clone, Default)]
pub enum VmValue {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    /// Byte string; may contain NUL bytes
    String(Arc<[u8]>),
    Table(TableRef),
    Function(FunctionRef),
    LightUserdata(usize),
    Userdata(OpaqueRef),
    Thread(OpaqueRef),
    Proto(OpaqueRef),
    CData(CDataRef),
}

impl VmValue {
    pub fn string(bytes: impl AsRef<[u8]>) -> Self {
        VmValue::String(Arc::from(bytes.as_ref()))
    }

    pub fn function(f: NativeFunction) -> Self {
        VmValue::Function(Arc::new(f))
    }

    pub fn table(t: Table) -> Self {
        VmValue::Table(TableRef::new(t))
    }

    pub fn cdata(c: CData) -> Self {
        VmValue::CData(CDataRef::new(c))
    }

    pub fn vm_type(&self) -> VmType {
        match self {
            VmValue::Nil => VmType::Nil,
            VmValue::Boolean(_) => VmType::Boolean,
            VmValue::Number(_) => VmType::Number,
            VmValue::String(_) => VmType::String,
            VmValue::Table(_) => VmType::Table,
            VmValue::Function(_) => VmType::Function,
            VmValue::LightUserdata(_) => VmType::LightUserdata,
            VmValue::Userdata(_) => VmType::Userdata,
            VmValue::Thread(_) => VmType::Thread,
            VmValue::Proto(_) => VmType::Proto,
            VmValue::CData(_) => VmType::CData,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.vm_type().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, VmValue::Nil)
    }

    /// Everything except nil and false is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, VmValue::Nil | VmValue::Boolean(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            VmValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            VmValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            VmValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Address of a reference value, 0 for values without identity.
    pub fn to_pointer(&self) -> usize {
        match self {
            VmValue::Table(t) => t.address(),
            VmValue::Function(f) => Arc::as_ptr(f) as usize,
            VmValue::LightUserdata(p) => *p,
            VmValue::Userdata(o) | VmValue::Thread(o) | VmValue::Proto(o) => o.address(),
            VmValue::CData(c) => c.address(),
            VmValue::Nil | VmValue::Boolean(_) | VmValue::Number(_) | VmValue::String(_) => 0,
        }
    }

    /// Primitive equality: by value for scalars and strings, by identity otherwise.
    pub fn raw_equal(&self, other: &VmValue) -> bool {
        match (self, other) {
            (VmValue::Nil, VmValue::Nil) => true,
            (VmValue::Boolean(a), VmValue::Boolean(b)) => a == b,
            (VmValue::Number(a), VmValue::Number(b)) => a == b,
            (VmValue::String(a), VmValue::String(b)) => a == b,
            (VmValue::LightUserdata(a), VmValue::LightUserdata(b)) => a == b,
            (a, b) if a.vm_type() == b.vm_type() => a.to_pointer() == b.to_pointer(),
            _ => false,
        }
    }
}

impl fmt::Debug for VmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmValue::Nil => write!(f, "nil"),
            VmValue::Boolean(b) => write!(f, "{}", b),
            VmValue::Number(n) => write!(f, "{}", format_number(*n)),
            VmValue::String(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            VmValue::Table(t) => write!(f, "{:?}", t),
            VmValue::Function(func) => write!(f, "function<{}>", func.name()),
            VmValue::CData(c) => write!(f, "{:?}", c),
            other => write!(f, "{}: 0x{:x}", other.type_name(), other.to_pointer()),
        }
    }
}

impl From<f64> for VmValue {
    fn from(n: f64) -> Self {
        VmValue::Number(n)
    }
}

impl From<bool> for VmValue {
    fn from(b: bool) -> Self {
        VmValue::Boolean(b)
    }
}

impl From<&str> for VmValue {
    fn from(s: &str) -> Self {
        VmValue::string(s)
    }
}

/// Format a number the way the VM's `tostring` does (`%.14g`).
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan".into() } else { "nan".into() };
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    let s = format!("{:.14e}", n);
    let exp: i32 = s
        .rsplit_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    if (-5..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, n);
        let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
        trimmed.to_string()
    } else {
        let (mantissa, _) = s.split_once('e').unwrap_or((&s, ""));
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-42.0), "-42");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(format_number(1e20), "1e+20");
    }

    #[test]
    fn test_raw_equal() {
        let t = VmValue::table(Table::new());
        assert!(t.raw_equal(&t.clone()));
        assert!(!t.raw_equal(&VmValue::table(Table::new())));
        assert!(VmValue::string("a").raw_equal(&VmValue::string("a")));
        assert!(!VmValue::Number(1.0).raw_equal(&VmValue::string("1")));
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(VmType::None.code(), -1);
        assert_eq!(VmType::Nil.code(), 0);
        assert_eq!(VmType::CData.code(), 10);
        assert_eq!(VmValue::LightUserdata(1).type_name(), "userdata");
    }
}
