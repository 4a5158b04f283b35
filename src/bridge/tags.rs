//! Type tags for native-extension objects created VM-side.
//!
//! A tag packs a base kind in the low two bits with one of the flags
//! `REFERENCE`, `VECTOR`, `LIST` or `NULL`. The companion helpers receive the
//! tag as a number and the bridge decodes the one `return_info` reports.

use std::fmt;

/// Element kind of an atomic vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseKind {
    Logical = 0,
    Integer = 1,
    Numeric = 2,
    Character = 3,
}

impl BaseKind {
    pub fn name(self) -> &'static str {
        match self {
            BaseKind::Logical => "logical",
            BaseKind::Integer => "integer",
            BaseKind::Numeric => "numeric",
            BaseKind::Character => "character",
        }
    }
}

/// Packed `base-kind | flags` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(u32);

impl TypeTag {
    pub const LOGICAL: u32 = 0;
    pub const INTEGER: u32 = 1;
    pub const NUMERIC: u32 = 2;
    pub const CHARACTER: u32 = 3;
    pub const REFERENCE: u32 = 0;
    pub const VECTOR: u32 = 4;
    pub const LIST: u32 = 8;
    pub const NULL: u32 = 16;

    const KIND_MASK: u32 = 3;

    pub const fn reference(kind: BaseKind) -> Self {
        Self(kind as u32 | Self::REFERENCE)
    }

    pub const fn vector(kind: BaseKind) -> Self {
        Self(kind as u32 | Self::VECTOR)
    }

    pub const fn list() -> Self {
        Self(Self::LIST)
    }

    pub const fn null() -> Self {
        Self(Self::NULL)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_reference(self) -> bool {
        self.0 < Self::VECTOR
    }

    pub fn is_vector(self) -> bool {
        self.0 & Self::VECTOR != 0 && self.0 < Self::LIST
    }

    pub fn is_list(self) -> bool {
        self.0 == Self::LIST
    }

    pub fn is_null(self) -> bool {
        self.0 == Self::NULL
    }

    /// Base kind of a reference or vector tag.
    pub fn base_kind(self) -> Option<BaseKind> {
        if !(self.is_reference() || self.is_vector()) {
            return None;
        }
        Some(match self.0 & Self::KIND_MASK {
            Self::LOGICAL => BaseKind::Logical,
            Self::INTEGER => BaseKind::Integer,
            Self::NUMERIC => BaseKind::Numeric,
            _ => BaseKind::Character,
        })
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base_kind() {
            Some(kind) if self.is_reference() => write!(f, "{} reference", kind.name()),
            Some(kind) => write!(f, "{} vector", kind.name()),
            None if self.is_list() => write!(f, "list"),
            None if self.is_null() => write!(f, "null"),
            None => write!(f, "unknown tag {}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing() {
        assert_eq!(TypeTag::reference(BaseKind::Numeric).bits(), 2);
        assert_eq!(TypeTag::vector(BaseKind::Character).bits(), 7);
        assert_eq!(TypeTag::list().bits(), 8);
        assert_eq!(TypeTag::null().bits(), 16);
    }

    #[test]
    fn test_decoding() {
        let t = TypeTag::from_bits(5);
        assert!(t.is_vector());
        assert!(!t.is_reference());
        assert_eq!(t.base_kind(), Some(BaseKind::Integer));
        assert_eq!(t.to_string(), "integer vector");
        assert_eq!(TypeTag::list().base_kind(), None);
        assert_eq!(TypeTag::from_bits(12).to_string(), "unknown tag 12");
    }
}
