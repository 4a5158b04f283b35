//! Ordered attribute sets attached to host vectors and lists.

use super::HostValue;

/// Name of the attribute holding element names.
pub const NAMES: &str = "names";
/// Name of the attribute holding the class vector.
pub const CLASS: &str = "class";
/// Name of the attribute holding row labels of a tabular record set.
pub const ROW_NAMES: &str = "row.names";

/// Attribute set of a host value.
///
/// Entries are kept in insertion order. Attribute values are host values
/// themselves, so they live on the heap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, HostValue)>,
}

impl Attributes {
    /// Create an empty attribute set
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an attribute by name
    pub fn get(&self, name: &str) -> Option<&HostValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Set an attribute, replacing any existing value with the same name.
    /// Setting `Null` removes the attribute.
    pub fn set(&mut self, name: &str, value: HostValue) {
        if matches!(value, HostValue::Null) {
            self.remove(name);
            return;
        }
        for (n, v) in self.entries.iter_mut() {
            if n == name {
                *v = value;
                return;
            }
        }
        self.entries.push((name.to_string(), value));
    }

    /// Remove an attribute, returning its value if it was present
    pub fn remove(&mut self, name: &str) -> Option<HostValue> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Check if an attribute is present
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Iterate over `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no attributes
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
