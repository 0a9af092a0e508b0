use thiserror::Error;

/// Errors returned by heap operations.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// The heap reached its byte limit and a last-ditch collection did not
    /// free enough space.
    #[error("out of memory")]
    OutOfMemory,
    /// The heap ran its final collection and no longer allocates.
    #[error("the heap has been shut down")]
    ShutDown,
    /// An external string was allocated with a type index outside
    /// `0..EXTERNAL_STRING_LIMIT`.
    #[error("unknown external string type {0}")]
    UnknownExternalStringType(u8),
    /// A dependent string range is out of bounds or splits a character.
    #[error("substring range {start}..{end} is not valid for its base")]
    InvalidRange {
        /// The first byte of the range.
        start: usize,
        /// One past the last byte of the range.
        end: usize,
    },
    /// A string operation was given a cell that does not hold a string.
    #[error("cell is not a string")]
    NotAString,
}

/// The result type of heap operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
