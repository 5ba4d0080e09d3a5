//! Error and result types used throughout romtab.
//!
//! Every fallible operation in the crate funnels into [`Error`]. Variants
//! carry enough structured context (offsets, widths, row and column
//! coordinates) that a front end can render a useful diagnostic without
//! string-parsing the message.

use std::io;

use thiserror::Error;

/// Result alias used throughout romtab.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
#[derive(Debug, Error)]
pub enum Error {
  /// A bit offset or span fell outside the underlying buffer.
  #[error("bit {offset}+{width} out of bounds (buffer is {len} bits)")]
  OutOfBounds {
    /// Starting bit offset of the failed access.
    offset: u64,
    /// Width of the failed access, in bits.
    width: u64,
    /// Total length of the buffer, in bits.
    len: u64,
  },

  /// A value does not fit the width of the field it was written to.
  #[error("value {value} does not fit in {width} bits")]
  ValueOverflow {
    /// The offending value.
    value: i128,
    /// The destination width, in bits.
    width: u32,
  },

  /// A byte sequence is not representable in the codec that read it.
  ///
  /// For BCD reads, `value` carries the best-effort integer decoded from
  /// the raw nibbles so that dumps can proceed with a warning.
  #[error("invalid encoding: {reason}")]
  InvalidEncoding {
    /// What was wrong with the input.
    reason: String,
    /// Best-effort decoded value, where one could be produced.
    value: Option<u64>,
  },

  /// A pointer read from an index table references outside the span of
  /// the table it belongs to.
  #[error("pointer {value:#x} outside table '{table}' ({start:#x}..{end:#x})")]
  PointerOutOfRange {
    /// Id of the table the pointer indexes into.
    table: String,
    /// The resolved pointer value, as a ROM offset.
    value: u64,
    /// First ROM offset of the table's declared span.
    start: u64,
    /// One past the last ROM offset of the table's declared span.
    end: u64,
  },

  /// Textual input in a dump file does not match the field it maps to.
  #[error("row {row}, column '{column}': can't parse {text:?}: {reason}")]
  UnparseableValue {
    /// Zero-based row index within the file body.
    row: usize,
    /// Column header of the offending cell.
    column: String,
    /// The cell contents.
    text: String,
    /// What was wrong with it.
    reason: String,
  },

  /// The map is inconsistent or refers to things it never declares.
  #[error("schema error: {0}")]
  Schema(String),

  /// A patch file is structurally malformed.
  #[error("patch format error: {0}")]
  PatchFormat(String),

  /// A patch writes past the end of the image it is applied to.
  #[error("patch writes past image end (offset {offset:#x}, image is {len:#x} bytes)")]
  PatchExpandsRom {
    /// First offset past the end of the image.
    offset: u32,
    /// Image length, in bytes.
    len: usize,
  },

  /// A cross-reference name does not resolve in its target entity.
  #[error("unknown reference {name:?} into '{target}'")]
  UnknownReference {
    /// The name that failed to resolve.
    name: String,
    /// The entity or table the name was looked up in.
    target: String,
  },

  /// An underlying I/O operation failed.
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl Error {
  /// Shorthand for an [`Error::Schema`] with a formatted message.
  pub fn schema(msg: impl Into<String>) -> Self {
    Error::Schema(msg.into())
  }

  /// Shorthand for an [`Error::PatchFormat`] with a formatted message.
  pub fn patch(msg: impl Into<String>) -> Self {
    Error::PatchFormat(msg.into())
  }
}
