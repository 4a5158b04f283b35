//! Stack operations for the VM.
//!
//! This module contains methods for stack manipulation (push, pop, insert,
//! remove, set_top), typed reads of stack slots, and table access through
//! stack indices.

use tracing::trace;

use super::table::Table;
use super::types::{VmError, VmResult};
use super::value::{NativeFunction, TableRef, VmType, VmValue};
use super::VmState;

impl VmState {
    // === Index arithmetic ===

    #[inline]
    fn base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }

    /// Absolute position in `self.stack` of a valid index
    #[inline]
    pub(crate) fn slot(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        let len = self.stack.len();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            (pos < len).then_some(pos)
        } else if idx < 0 {
            let back = idx.unsigned_abs() as usize;
            (back <= len - base).then(|| len - back)
        } else {
            None
        }
    }

    /// Number of values in the current frame
    #[inline]
    pub fn top(&self) -> usize {
        self.stack.len() - self.base()
    }

    /// Convert a relative (negative) index into an equivalent positive one.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx < 0 {
            self.top() as i32 + idx + 1
        } else {
            idx
        }
    }

    /// Make sure `extra` more values fit on the stack.
    pub fn check_stack(&self, extra: usize) -> VmResult<()> {
        if self.stack.len() + extra > self.config().max_stack {
            return Err(VmError::runtime("stack overflow"));
        }
        Ok(())
    }

    // === Push / Pop ===

    #[inline]
    pub fn push(&mut self, value: VmValue) {
        self.stack.push(value);
    }

    pub fn push_nil(&mut self) {
        self.push(VmValue::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push(VmValue::Boolean(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(VmValue::Number(n));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.push(VmValue::Number(i as f64));
    }

    pub fn push_string(&mut self, bytes: impl AsRef<[u8]>) {
        self.push(VmValue::string(bytes));
    }

    pub fn push_light_userdata(&mut self, addr: usize) {
        self.push(VmValue::LightUserdata(addr));
    }

    pub fn push_function(&mut self, f: NativeFunction) {
        self.push(VmValue::function(f));
    }

    /// Push a copy of the value at `idx` (nil if the index is invalid).
    pub fn push_value(&mut self, idx: i32) {
        let v = self.get(idx);
        self.push(v);
    }

    /// Pop `n` values.
    pub fn pop(&mut self, n: usize) {
        let keep = self.stack.len().saturating_sub(n).max(self.base());
        self.stack.truncate(keep);
    }

    /// Pop and return the top value.
    pub fn pop_value(&mut self) -> VmResult<VmValue> {
        if self.top() == 0 {
            return Err(VmError::runtime("stack underflow"));
        }
        self.stack
            .pop()
            .ok_or_else(|| VmError::runtime("stack underflow"))
    }

    /// Set the frame's value count, padding with nil or discarding.
    /// Negative values count from the current top.
    pub fn set_top(&mut self, idx: i32) {
        let base = self.base();
        let new_len = if idx >= 0 {
            base + idx as usize
        } else {
            (self.stack.len() + 1).saturating_sub(idx.unsigned_abs() as usize).max(base)
        };
        self.stack.resize(new_len, VmValue::Nil);
    }

    /// Move the top value into `idx`, shifting values above it up.
    pub fn insert(&mut self, idx: i32) -> VmResult<()> {
        let pos = self
            .slot(idx)
            .ok_or_else(|| VmError::runtime(format!("invalid stack index {}", idx)))?;
        let v = self.pop_value()?;
        self.stack.insert(pos, v);
        trace!(target: "vmbridge::vm::stack", idx, "insert");
        Ok(())
    }

    /// Remove the value at `idx`, shifting values above it down.
    pub fn remove(&mut self, idx: i32) -> VmResult<VmValue> {
        let pos = self
            .slot(idx)
            .ok_or_else(|| VmError::runtime(format!("invalid stack index {}", idx)))?;
        trace!(target: "vmbridge::vm::stack", idx, "remove");
        Ok(self.stack.remove(pos))
    }

    // === Reads ===

    /// Value at `idx`, nil if the index is invalid.
    pub fn get(&self, idx: i32) -> VmValue {
        self.slot(idx)
            .map(|pos| self.stack[pos].clone())
            .unwrap_or_default()
    }

    /// Type of the value at `idx`, `VmType::None` for invalid indices.
    pub fn type_at(&self, idx: i32) -> VmType {
        self.slot(idx)
            .map(|pos| self.stack[pos].vm_type())
            .unwrap_or(VmType::None)
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.get(idx).is_truthy()
    }

    /// Number at `idx`, converting numeric strings.
    pub fn to_number(&self, idx: i32) -> Option<f64> {
        match self.get(idx) {
            VmValue::Number(n) => Some(n),
            VmValue::String(s) => std::str::from_utf8(&s).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer at `idx`, truncating toward zero.
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.to_number(idx).map(|n| n as i64)
    }

    /// Bytes of a string at `idx`, formatting numbers.
    pub fn to_bytes(&self, idx: i32) -> Option<std::sync::Arc<[u8]>> {
        match self.get(idx) {
            VmValue::String(s) => Some(s),
            VmValue::Number(n) => Some(std::sync::Arc::from(
                super::value::format_number(n).as_bytes(),
            )),
            _ => None,
        }
    }

    /// Address of the object at `idx`, 0 for values without identity.
    pub fn to_pointer(&self, idx: i32) -> usize {
        self.get(idx).to_pointer()
    }

    // === Tables ===

    /// Push a new table with preallocated array and hash parts.
    pub fn create_table(&mut self, narr: usize, nrec: usize) {
        self.push(VmValue::table(Table::with_capacity(narr, nrec)));
    }

    fn table_at(&self, idx: i32) -> VmResult<TableRef> {
        match self.get(idx) {
            VmValue::Table(t) => Ok(t),
            other => Err(VmError::runtime(format!(
                "attempt to index a {} value",
                other.type_name()
            ))),
        }
    }

    /// Pop a key and push `t[key]` for the table at `idx`.
    pub fn raw_get(&mut self, idx: i32) -> VmResult<VmType> {
        let t = self.table_at(idx)?;
        let key = self.pop_value()?;
        let v = t.lock().get(&key);
        let ty = v.vm_type();
        self.push(v);
        Ok(ty)
    }

    /// Push `t[i]` for the table at `idx`.
    pub fn raw_get_int(&mut self, idx: i32, i: i64) -> VmResult<VmType> {
        let t = self.table_at(idx)?;
        let v = t.lock().get_int(i);
        let ty = v.vm_type();
        self.push(v);
        Ok(ty)
    }

    /// Pop a value and a key beneath it and assign `t[key] = value`.
    pub fn raw_set(&mut self, idx: i32) -> VmResult<()> {
        let t = self.table_at(idx)?;
        let value = self.pop_value()?;
        let key = self.pop_value()?;
        let result = t.lock().set(key, value);
        result
    }

    /// Pop a value and assign `t[i] = value`.
    pub fn raw_set_int(&mut self, idx: i32, i: i64) -> VmResult<()> {
        let t = self.table_at(idx)?;
        let value = self.pop_value()?;
        t.lock().set_int(i, value);
        Ok(())
    }

    /// Push `t[name]`.
    pub fn get_field(&mut self, idx: i32, name: &str) -> VmResult<VmType> {
        let t = self.table_at(idx)?;
        let v = t.lock().get_str(name);
        let ty = v.vm_type();
        self.push(v);
        Ok(ty)
    }

    /// Pop a value and assign `t[name] = value`.
    pub fn set_field(&mut self, idx: i32, name: &str) -> VmResult<()> {
        let t = self.table_at(idx)?;
        let value = self.pop_value()?;
        t.lock().set_str(name, value);
        Ok(())
    }

    /// Snapshot of the entries of the table at `idx`, in traversal order.
    pub fn table_entries(&self, idx: i32) -> VmResult<Vec<(VmValue, VmValue)>> {
        Ok(self.table_at(idx)?.lock().entries())
    }

    /// Pop a table (or nil) and make it the metatable of the table at `idx`.
    pub fn set_metatable(&mut self, idx: i32) -> VmResult<()> {
        let t = self.table_at(idx)?;
        let mt = match self.pop_value()? {
            VmValue::Table(mt) => Some(mt),
            VmValue::Nil => None,
            other => {
                return Err(VmError::runtime(format!(
                    "bad argument to 'setmetatable' (nil or table expected, got {})",
                    other.type_name()
                )))
            }
        };
        t.lock().set_metatable(mt);
        Ok(())
    }

    /// Metatable of the table at `idx`, if any.
    pub fn metatable(&self, idx: i32) -> Option<TableRef> {
        match self.get(idx) {
            VmValue::Table(t) => t.lock().metatable().cloned(),
            _ => None,
        }
    }

    // === Globals ===

    /// Push the global `name`.
    pub fn get_global(&mut self, name: &str) {
        let v = self.globals().lock().get_str(name);
        self.push(v);
    }

    /// Pop a value into the global `name`.
    pub fn set_global(&mut self, name: &str) -> VmResult<()> {
        let v = self.pop_value()?;
        self.globals().lock().set_str(name, v);
        Ok(())
    }
}
