//! VM tables: an array part for keys `1..=n` plus an insertion-ordered hash
//! part for everything else.
//!
//! Traversal visits the array part in index order, then the hash part in
//! insertion order. Assigning nil removes a key.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{VmError, VmResult};
use super::value::{TableRef, VmValue};

/// Hashable identity of a table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<[u8]>),
    Ref(u8, usize),
}

impl TableKey {
    fn from_value(key: &VmValue) -> VmResult<Self> {
        Ok(match key {
            VmValue::Nil => return Err(VmError::runtime("table index is nil")),
            VmValue::Boolean(b) => TableKey::Bool(*b),
            VmValue::Number(n) if n.is_nan() => return Err(VmError::runtime("table index is NaN")),
            VmValue::Number(n) => match integer_key(*n) {
                Some(i) => TableKey::Int(i),
                None => TableKey::Float(n.to_bits()),
            },
            VmValue::String(s) => TableKey::Str(Arc::clone(s)),
            other => TableKey::Ref(other.vm_type().code() as u8, other.to_pointer()),
        })
    }
}

fn integer_key(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Some(n as i64)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct Table {
    array: Vec<VmValue>,
    hash: Vec<(VmValue, VmValue)>,
    index: HashMap<TableKey, usize>,
    removed: usize,
    metatable: Option<TableRef>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocate `narr` array slots and `nrec` hash slots.
    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        Self {
            array: Vec::with_capacity(narr),
            hash: Vec::with_capacity(nrec),
            index: HashMap::with_capacity(nrec),
            ..Self::default()
        }
    }

    pub fn get(&self, key: &VmValue) -> VmValue {
        if let VmValue::Number(n) = key {
            if let Some(i) = integer_key(*n) {
                return self.get_int(i);
            }
        }
        match TableKey::from_value(key) {
            Ok(k) => self.get_hashed(&k),
            Err(_) => VmValue::Nil,
        }
    }

    pub fn get_int(&self, i: i64) -> VmValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1].clone();
        }
        self.get_hashed(&TableKey::Int(i))
    }

    pub fn get_str(&self, key: &str) -> VmValue {
        self.get_hashed(&TableKey::Str(Arc::from(key.as_bytes())))
    }

    fn get_hashed(&self, key: &TableKey) -> VmValue {
        self.index
            .get(key)
            .map(|&pos| self.hash[pos].1.clone())
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: VmValue, value: VmValue) -> VmResult<()> {
        if let VmValue::Number(n) = key {
            if let Some(i) = integer_key(n) {
                self.set_int(i, value);
                return Ok(());
            }
        }
        let k = TableKey::from_value(&key)?;
        self.set_hashed(k, key, value);
        Ok(())
    }

    pub fn set_str(&mut self, key: &str, value: VmValue) {
        let bytes: Arc<[u8]> = Arc::from(key.as_bytes());
        self.set_hashed(TableKey::Str(Arc::clone(&bytes)), VmValue::String(bytes), value);
    }

    pub fn set_int(&mut self, i: i64, value: VmValue) {
        let len = self.array.len();
        if i >= 1 && (i as usize) <= len {
            self.array[i as usize - 1] = value;
            if i as usize == len {
                while matches!(self.array.last(), Some(VmValue::Nil)) {
                    self.array.pop();
                }
            }
            return;
        }
        if i >= 1 && i as usize == len + 1 && !value.is_nil() {
            self.array.push(value);
            self.remove_hashed(&TableKey::Int(i));
            self.migrate_to_array();
            return;
        }
        self.set_hashed(TableKey::Int(i), VmValue::Number(i as f64), value);
    }

    fn migrate_to_array(&mut self) {
        loop {
            let next = TableKey::Int(self.array.len() as i64 + 1);
            match self.remove_hashed(&next) {
                Some(v) => self.array.push(v),
                None => break,
            }
        }
    }

    fn set_hashed(&mut self, k: TableKey, key: VmValue, value: VmValue) {
        if value.is_nil() {
            self.remove_hashed(&k);
            return;
        }
        match self.index.get(&k) {
            Some(&pos) => self.hash[pos].1 = value,
            None => {
                self.index.insert(k, self.hash.len());
                self.hash.push((key, value));
            }
        }
    }

    fn remove_hashed(&mut self, k: &TableKey) -> Option<VmValue> {
        let pos = self.index.remove(k)?;
        let old = std::mem::take(&mut self.hash[pos].1);
        self.removed += 1;
        if self.removed > 16 && self.removed * 2 > self.hash.len() {
            self.compact();
        }
        Some(old)
    }

    fn compact(&mut self) {
        self.hash.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (pos, (key, _)) in self.hash.iter().enumerate() {
            if let Ok(k) = TableKey::from_value(key) {
                self.index.insert(k, pos);
            }
        }
        self.removed = 0;
    }

    /// Border of the array part (the `#` operator).
    pub fn length(&self) -> usize {
        self.array.len()
    }

    /// Number of non-nil entries.
    pub fn count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.index.len()
    }

    /// Snapshot of all `(key, value)` pairs in traversal order.
    pub fn entries(&self) -> Vec<(VmValue, VmValue)> {
        let mut out = Vec::with_capacity(self.count());
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((VmValue::Number((i + 1) as f64), v.clone()));
            }
        }
        out.extend(
            self.hash
                .iter()
                .filter(|(_, v)| !v.is_nil())
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        out
    }

    pub fn metatable(&self) -> Option<&TableRef> {
        self.metatable.as_ref()
    }

    pub fn set_metatable(&mut self, mt: Option<TableRef>) {
        self.metatable = mt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_part_grows_and_migrates() {
        let mut t = Table::new();
        t.set_int(2, VmValue::Number(20.0));
        assert_eq!(t.length(), 0);
        t.set_int(1, VmValue::Number(10.0));
        assert_eq!(t.length(), 2);
        assert_eq!(t.get_int(2).as_number(), Some(20.0));
    }

    #[test]
    fn test_nil_assignment_removes() {
        let mut t = Table::new();
        t.set_str("a", VmValue::Number(1.0));
        t.set_str("b", VmValue::Number(2.0));
        t.set_str("a", VmValue::Nil);
        let keys: Vec<_> = t.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_bytes(), Some(&b"b"[..]));
    }

    #[test]
    fn test_traversal_order() {
        let mut t = Table::new();
        t.set_str("z", VmValue::Boolean(true));
        t.set_int(1, VmValue::Number(1.0));
        t.set_str("a", VmValue::Boolean(false));
        let entries = t.entries();
        assert!(entries[0].0.raw_equal(&VmValue::Number(1.0)));
        assert!(entries[1].0.raw_equal(&VmValue::string("z")));
        assert!(entries[2].0.raw_equal(&VmValue::string("a")));
    }

    #[test]
    fn test_invalid_keys() {
        let mut t = Table::new();
        assert!(t.set(VmValue::Nil, VmValue::Number(1.0)).is_err());
        assert!(t.set(VmValue::Number(f64::NAN), VmValue::Number(1.0)).is_err());
        t.set(VmValue::Number(1.5), VmValue::Number(1.0)).unwrap();
        assert_eq!(t.get(&VmValue::Number(1.5)).as_number(), Some(1.0));
    }

    #[test]
    fn test_compaction_keeps_lookups() {
        let mut t = Table::new();
        for i in 0..64 {
            t.set_str(&format!("k{}", i), VmValue::Number(i as f64));
        }
        for i in 0..48 {
            t.set_str(&format!("k{}", i), VmValue::Nil);
        }
        assert_eq!(t.count(), 16);
        assert_eq!(t.get_str("k50").as_number(), Some(50.0));
    }
}
