#![warn(missing_docs)]
//! pallas: a grammar-compressing storage engine for HPC execution traces.
//!
//! A trace is a per-thread sequence of timestamped events. Pallas factors
//! repeated blocks of events into named [`Sequence`]s and collapses adjacent
//! repetitions of a Sequence into [`Loop`]s, turning a flat event stream
//! into a grammar. Readers can walk either the flat stream or the
//! compressed grammar; per-token durations are recovered exactly (modulo
//! codec precision).

mod archive;
mod codec;
mod definitions;
mod event;
mod io_utils;
mod linked_vector;
mod params;
mod sequence;
mod storage;
mod thread;
mod thread_reader;
mod thread_writer;
mod token;

pub mod bitutils;

pub use archive::{Archive, ArchiveId, GlobalArchive};
pub use codec::{decode, decode_with, encode};
pub use definitions::{
    AttributeDef, AttributeType, CommDef, DefinitionError, GroupDef, LocationDef,
    LocationGroupDef, Ref, RegionDef, StringDef,
};
pub use event::{AttributeList, AttributeValue, Event, EventSummary};
pub use linked_vector::{DurationHandle, LinkedDurationVector, LinkedVector};
pub use params::{
    CompressionAlgorithm, DebugLevel, EncodingAlgorithm, LoopFindingAlgorithm, Parameters,
    TimestampStorage,
};
pub use sequence::{Loop, Sequence};
pub use storage::Storage;
pub use thread::{Thread, ThreadId};
pub use thread_reader::{Occurrence, ThreadReader, UnrollFlags};
pub use thread_writer::{EventKind, ThreadWriter};
pub use token::{Token, TokenKind};

use std::string::FromUtf8Error;
use thiserror::Error;

/// Errors returnable by the core write/read path.
///
/// Maps onto the error taxonomy: *I/O error* (`Io`), *corruption / ABI
/// mismatch* (`Corruption`, `AbiMismatch`), and the definition-table
/// *recoverable* conflicts (`DuplicateDefinition`) that callers may choose
/// to treat as non-fatal. Fatal-bug conditions (token out of range,
/// callstack overflow, ...) are `panic!`/`debug_assert!`, not `Result`
/// values — they indicate a programmer or corruption error, not a
/// recoverable one.
#[derive(Error, Debug)]
pub enum PallasError {
    /// Error during I/O (fatal to the current write/read operation).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 conversion error while decoding a string definition or payload.
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] FromUtf8Error),

    /// The archive's ABI version byte doesn't match this build's.
    #[error("archive ABI version {found} doesn't match expected {expected}")]
    AbiMismatch {
        /// Version byte read from the archive.
        found: u8,
        /// Version byte this build produces.
        expected: u8,
    },

    /// Data read from disk (or a codec payload) failed a structural check.
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// A definition was inserted twice under the same reference with
    /// different payloads. (Same-payload duplicates are merely logged, per
    /// the recoverable-error taxonomy, and don't produce this error.)
    #[error("duplicate definition for ref {0}")]
    DuplicateDefinition(u32),

    /// Requested an id / token / occurrence outside of recorded bounds.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Specialised `Result` for `PallasError`.
pub type Result<T> = std::result::Result<T, PallasError>;

/// The on-disk ABI version. Readers refuse archives tagged with any other
/// value.
pub const ABI_VERSION: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_informative() {
        let e = PallasError::AbiMismatch { found: 2, expected: ABI_VERSION };
        assert!(e.to_string().contains("ABI version"));
    }
}
