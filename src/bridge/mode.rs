//! Transfer modes and argument codes.
//!
//! Each argument pushed into the VM is converted according to a single mode
//! character. An argument code ("acode") is a string of mode characters that
//! is cycled over an argument list, so `"s"` applies simplify to every
//! argument and `"rv"` alternates reference and vector.

use smallvec::SmallVec;

use super::types::{BridgeError, BridgeResult};

/// How a host value is converted when pushed into the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Length-1 vectors become scalars; longer vectors become tables keyed by
    /// name where names exist. `'t'` is accepted as a synonym.
    Simplify,
    /// Always a table indexed `1..n`, names ignored
    Array,
    /// A VM reference object over the host vector's own memory
    Reference,
    /// A VM-owned copy in native form
    Vector,
    /// Require exactly this length, then simplify
    Length(u8),
}

impl TransferMode {
    /// Decode a mode character. Unknown characters give `None`; the caller
    /// reports them together with the host type being pushed.
    pub fn from_code(c: char) -> Option<Self> {
        match c {
            's' | 't' => Some(Self::Simplify),
            'a' => Some(Self::Array),
            'r' => Some(Self::Reference),
            'v' => Some(Self::Vector),
            '1'..='9' => Some(Self::Length(c as u8 - b'0')),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::Simplify => 's',
            Self::Array => 'a',
            Self::Reference => 'r',
            Self::Vector => 'v',
            Self::Length(n) => (b'0' + n) as char,
        }
    }
}

/// A parsed argument code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgCode {
    codes: SmallVec<[char; 8]>,
}

impl ArgCode {
    /// Parse an acode string. Characters are validated when each argument is
    /// pushed, since the error names the argument's host type.
    pub fn parse(acode: &str) -> BridgeResult<Self> {
        let codes: SmallVec<[char; 8]> = acode.chars().collect();
        if codes.is_empty() {
            return Err(BridgeError::argument("Length of args code is zero."));
        }
        Ok(Self { codes })
    }

    /// Mode character for argument `i` (0-based).
    pub fn code_for(&self, i: usize) -> char {
        self.codes[i % self.codes.len()]
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycling() {
        let code = ArgCode::parse("rv").unwrap();
        let modes: String = (0..5).map(|i| code.code_for(i)).collect();
        assert_eq!(modes, "rvrvr");
    }

    #[test]
    fn test_empty_acode_rejected() {
        assert_eq!(
            ArgCode::parse(""),
            Err(BridgeError::ArgumentValidation(
                "Length of args code is zero.".into()
            ))
        );
    }

    #[test]
    fn test_mode_decoding() {
        assert_eq!(TransferMode::from_code('t'), Some(TransferMode::Simplify));
        assert_eq!(TransferMode::from_code('3'), Some(TransferMode::Length(3)));
        assert_eq!(TransferMode::from_code('0'), None);
        assert_eq!(TransferMode::from_code('x'), None);
        assert_eq!(TransferMode::Length(7).code(), '7');
    }
}
