//! Native-typed (cdata) objects.
//!
//! Reference payloads share storage with a host vector, so writes made from
//! VM code are visible to the host and vice versa. Vector payloads own their
//! elements.

use parking_lot::{Mutex, MutexGuard};

use crate::host::Vector;

use super::types::{VmError, VmResult};
use super::value::VmValue;

/// Payload of a cdata object.
#[derive(Debug)]
pub enum CDataPayload {
    LogicalRef(Vector<Option<bool>>),
    IntegerRef(Vector<Option<i32>>),
    NumericRef(Vector<f64>),
    CharacterRef(Vector<Option<String>>),
    LogicalVec(Vec<Option<bool>>),
    IntegerVec(Vec<Option<i32>>),
    NumericVec(Vec<f64>),
    /// The host `NULL`
    Null,
    /// A cdata of a ctype the bridge knows nothing about
    Foreign(String),
}

impl CDataPayload {
    pub fn ctype_name(&self) -> &str {
        match self {
            CDataPayload::LogicalRef(_) => "logical_rt",
            CDataPayload::IntegerRef(_) => "integer_rt",
            CDataPayload::NumericRef(_) => "numeric_rt",
            CDataPayload::CharacterRef(_) => "character_rt",
            CDataPayload::LogicalVec(_) => "logical_vt",
            CDataPayload::IntegerVec(_) => "integer_vt",
            CDataPayload::NumericVec(_) => "numeric_vt",
            CDataPayload::Null => "null_t",
            CDataPayload::Foreign(name) => name,
        }
    }
}

#[derive(Debug)]
pub struct CData {
    ctype: String,
    payload: Mutex<CDataPayload>,
}

impl CData {
    pub fn new(payload: CDataPayload) -> Self {
        Self {
            ctype: payload.ctype_name().to_string(),
            payload: Mutex::new(payload),
        }
    }

    pub fn ctype_name(&self) -> &str {
        &self.ctype
    }

    pub fn payload(&self) -> MutexGuard<'_, CDataPayload> {
        self.payload.lock()
    }

    /// Number of elements, 0 for `NULL` and foreign cdata.
    pub fn len(&self) -> usize {
        match &*self.payload.lock() {
            CDataPayload::LogicalRef(v) => v.len(),
            CDataPayload::IntegerRef(v) => v.len(),
            CDataPayload::NumericRef(v) => v.len(),
            CDataPayload::CharacterRef(v) => v.len(),
            CDataPayload::LogicalVec(v) => v.len(),
            CDataPayload::IntegerVec(v) => v.len(),
            CDataPayload::NumericVec(v) => v.len(),
            CDataPayload::Null | CDataPayload::Foreign(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `i` (1-based). Missing values read as nil.
    pub fn get(&self, i: usize) -> VmResult<VmValue> {
        let payload = self.payload.lock();
        let pos = self.position(&payload, i)?;
        Ok(match &*payload {
            CDataPayload::LogicalRef(v) => logical(v.values.read()[pos]),
            CDataPayload::IntegerRef(v) => integer(v.values.read()[pos]),
            CDataPayload::NumericRef(v) => VmValue::Number(v.values.read()[pos]),
            CDataPayload::CharacterRef(v) => match &v.values.read()[pos] {
                Some(s) => VmValue::string(s),
                None => VmValue::Nil,
            },
            CDataPayload::LogicalVec(v) => logical(v[pos]),
            CDataPayload::IntegerVec(v) => integer(v[pos]),
            CDataPayload::NumericVec(v) => VmValue::Number(v[pos]),
            CDataPayload::Null | CDataPayload::Foreign(_) => VmValue::Nil,
        })
    }

    /// Write element `i` (1-based). Nil stores a missing value.
    pub fn set(&self, i: usize, value: &VmValue) -> VmResult<()> {
        let mut payload = self.payload.lock();
        let pos = self.position(&payload, i)?;
        match &mut *payload {
            CDataPayload::LogicalRef(v) => v.values.write()[pos] = to_logical(value)?,
            CDataPayload::IntegerRef(v) => v.values.write()[pos] = to_integer(value)?,
            CDataPayload::NumericRef(v) => v.values.write()[pos] = to_numeric(value)?,
            CDataPayload::CharacterRef(v) => v.values.write()[pos] = to_character(value)?,
            CDataPayload::LogicalVec(v) => v[pos] = to_logical(value)?,
            CDataPayload::IntegerVec(v) => v[pos] = to_integer(value)?,
            CDataPayload::NumericVec(v) => v[pos] = to_numeric(value)?,
            CDataPayload::Null | CDataPayload::Foreign(_) => {
                return Err(VmError::runtime(format!(
                    "cannot assign to element of {}",
                    self.ctype
                )))
            }
        }
        Ok(())
    }

    /// Append an element to an owned vector.
    pub fn push(&self, value: &VmValue) -> VmResult<()> {
        let mut payload = self.payload.lock();
        match &mut *payload {
            CDataPayload::LogicalVec(v) => v.push(to_logical(value)?),
            CDataPayload::IntegerVec(v) => v.push(to_integer(value)?),
            CDataPayload::NumericVec(v) => v.push(to_numeric(value)?),
            _ => {
                return Err(VmError::runtime(format!(
                    "cannot append to {}",
                    self.ctype
                )))
            }
        }
        Ok(())
    }

    fn position(&self, payload: &CDataPayload, i: usize) -> VmResult<usize> {
        let len = match payload {
            CDataPayload::LogicalRef(v) => v.len(),
            CDataPayload::IntegerRef(v) => v.len(),
            CDataPayload::NumericRef(v) => v.len(),
            CDataPayload::CharacterRef(v) => v.len(),
            CDataPayload::LogicalVec(v) => v.len(),
            CDataPayload::IntegerVec(v) => v.len(),
            CDataPayload::NumericVec(v) => v.len(),
            CDataPayload::Null | CDataPayload::Foreign(_) => 0,
        };
        if i == 0 || i > len {
            return Err(VmError::runtime(format!(
                "index {} out of range for {} of length {}",
                i, self.ctype, len
            )));
        }
        Ok(i - 1)
    }
}

fn logical(x: Option<bool>) -> VmValue {
    x.map(VmValue::Boolean).unwrap_or_default()
}

fn integer(x: Option<i32>) -> VmValue {
    x.map(|i| VmValue::Number(i as f64)).unwrap_or_default()
}

fn to_logical(v: &VmValue) -> VmResult<Option<bool>> {
    match v {
        VmValue::Nil => Ok(None),
        VmValue::Boolean(b) => Ok(Some(*b)),
        VmValue::Number(n) => Ok(Some(*n != 0.0)),
        other => Err(type_error("boolean", other)),
    }
}

fn to_integer(v: &VmValue) -> VmResult<Option<i32>> {
    match v {
        VmValue::Nil => Ok(None),
        VmValue::Number(n) => Ok(Some(*n as i32)),
        VmValue::Boolean(b) => Ok(Some(*b as i32)),
        other => Err(type_error("number", other)),
    }
}

fn to_numeric(v: &VmValue) -> VmResult<f64> {
    match v {
        VmValue::Nil => Ok(f64::NAN),
        VmValue::Number(n) => Ok(*n),
        other => Err(type_error("number", other)),
    }
}

fn to_character(v: &VmValue) -> VmResult<Option<String>> {
    match v {
        VmValue::Nil => Ok(None),
        VmValue::String(s) => Ok(Some(String::from_utf8_lossy(s).into_owned())),
        VmValue::Number(n) => Ok(Some(super::value::format_number(*n))),
        other => Err(type_error("string", other)),
    }
}

fn type_error(expected: &str, got: &VmValue) -> VmError {
    VmError::runtime(format!(
        "cannot convert {} to {}",
        got.type_name(),
        expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_writes_reach_host() {
        let host = Vector::new(vec![1.0, 2.0, 3.0]);
        let c = CData::new(CDataPayload::NumericRef(host.clone()));
        c.set(2, &VmValue::Number(20.0)).unwrap();
        assert_eq!(host.values.to_vec(), vec![1.0, 20.0, 3.0]);
        assert_eq!(c.ctype_name(), "numeric_rt");
    }

    #[test]
    fn test_owned_vector_push_and_bounds() {
        let c = CData::new(CDataPayload::IntegerVec(vec![Some(1)]));
        c.push(&VmValue::Number(2.0)).unwrap();
        c.push(&VmValue::Nil).unwrap();
        assert_eq!(c.len(), 3);
        assert!(c.get(3).unwrap().is_nil());
        assert!(c.get(0).is_err());
        assert!(c.get(4).is_err());
    }

    #[test]
    fn test_null_rejects_assignment() {
        let c = CData::new(CDataPayload::Null);
        assert!(c.is_empty());
        assert!(c.set(1, &VmValue::Nil).is_err());
    }
}
