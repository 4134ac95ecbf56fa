//! The token model: every grammar element (Event, Sequence, Loop) is
//! referred to by a `Token`, a 32-bit tagged id. Dispatch is done by
//! matching on `kind()`, never through a class hierarchy.

use crate::extract_bits;
use std::fmt;

/// Reserved id meaning "no token" / out of range.
pub const TOKEN_ID_INVALID: u32 = 0x3fff_ffff;

/// Kind half of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    /// Not a valid token; only ever produced by `Token::invalid()`.
    Invalid = 0,
    /// Refers to an `EventSummary` in the owning `Thread`.
    Event = 1,
    /// Refers to a `Sequence` in the owning `Thread`.
    Sequence = 2,
    /// Refers to a `Loop` in the owning `Thread`.
    Loop = 3,
}

impl TokenKind {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Invalid,
            1 => Self::Event,
            2 => Self::Sequence,
            _ => Self::Loop,
        }
    }

    /// Single-character rendering, matching the original's
    /// `PALLAS_TOKEN_TYPE_C` macro (I/E/S/L).
    pub fn as_char(self) -> char {
        match self {
            Self::Invalid => 'I',
            Self::Event => 'E',
            Self::Sequence => 'S',
            Self::Loop => 'L',
        }
    }
}

/// A 32-bit value: 2-bit kind, 30-bit id. Ids are per-kind, per-thread,
/// dense from 0, and stable for the lifetime of a `Thread`. Token equality
/// is structural (derived `PartialEq`), matching spec's "Variant dispatch on
/// Token... represented by a tagged value."
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u32);

impl Token {
    /// Builds a token from a kind and a 30-bit id. Panics (fatal-bug class,
    /// per error taxonomy) if `id` doesn't fit in 30 bits.
    pub fn new(kind: TokenKind, id: u32) -> Self {
        assert!(
            id <= TOKEN_ID_INVALID,
            "token id {id} exceeds 30-bit range"
        );
        Token(((kind as u32) << 30) | id)
    }

    /// The reserved "no token" sentinel.
    pub fn invalid() -> Self {
        Token::new(TokenKind::Invalid, TOKEN_ID_INVALID)
    }

    /// This token's kind.
    pub fn kind(self) -> TokenKind {
        TokenKind::from_bits(extract_bits!(self.0 as u64, 30, 31) as u32)
    }

    /// This token's 30-bit id.
    pub fn id(self) -> u32 {
        extract_bits!(self.0 as u64, 0, 29) as u32
    }

    /// Raw 32-bit wire representation.
    pub fn to_bits(self) -> u32 {
        self.0
    }

    /// Reconstructs a `Token` from its raw wire representation.
    pub fn from_bits(bits: u32) -> Self {
        Token(bits)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind().as_char(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_id_roundtrip() {
        let t = Token::new(TokenKind::Sequence, 12345);
        assert_eq!(t.kind(), TokenKind::Sequence);
        assert_eq!(t.id(), 12345);
    }

    #[test]
    fn bits_roundtrip() {
        let t = Token::new(TokenKind::Loop, 7);
        let t2 = Token::from_bits(t.to_bits());
        assert_eq!(t, t2);
    }

    #[test]
    fn invalid_token() {
        let t = Token::invalid();
        assert_eq!(t.kind(), TokenKind::Invalid);
    }

    #[test]
    #[should_panic]
    fn oversized_id_panics() {
        Token::new(TokenKind::Event, 1 << 31);
    }
}
