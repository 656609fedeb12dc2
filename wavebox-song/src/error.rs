//! Error types for song encoding and decoding

use thiserror::Error;

/// Errors that can occur when decoding a song from its binary or JSON form
///
/// An out-of-range format version is deliberately *not* an error: decoding
/// treats it as "nothing to load" and yields `Ok(None)` instead. Only
/// malformed data inside a supported version reaches these variants.
#[derive(Debug, Error)]
pub enum SongError {
    /// Song data ended in the middle of a block
    #[error("song data ended unexpectedly")]
    UnexpectedEnd,

    /// A tag byte that no supported version defines
    #[error("unknown tag '{0}' in song data")]
    UnknownTag(char),

    /// A character outside the URL-safe base64 alphabet
    #[error("invalid character '{0}' in song data")]
    InvalidCharacter(char),

    /// A decoded value outside its field's valid domain
    #[error("{field} value {value} is out of range")]
    ValueOutOfRange { field: &'static str, value: i64 },

    /// The embedded bit-stream region desynchronized from its declared length
    #[error("bit stream region overran its declared length")]
    BitStreamOverrun,

    /// JSON form could not be parsed at all (missing fields are fine and
    /// default instead)
    #[error("invalid JSON song: {0}")]
    Json(#[from] serde_json::Error),
}
