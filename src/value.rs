//! Decoded field values.
//!
//! A [`Value`] is what a field read produces and what a field write
//! consumes. It is deliberately plain: rendering a value for a dump file
//! (enum symbols, cross-reference names, flag letters) needs schema
//! context and lives with the dump engine, not here.

use std::fmt;

/// A decoded field value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
  /// An unsigned integer, from any of the integer or BCD types.
  Uint(u64),
  /// A signed integer.
  Int(i64),
  /// A raw byte span.
  Bytes(Vec<u8>),
  /// A bit array, in ascending address order. Also the value of a nested
  /// bitfield, in field declaration order.
  Bits(Vec<bool>),
  /// Decoded text.
  Str(String),
  /// An optional field that is not present in this instance. Writing an
  /// absent value is a no-op.
  Absent,
}

impl Value {
  /// Gets the value as an unsigned integer, if it is one.
  pub fn as_uint(&self) -> Option<u64> {
    match *self {
      Value::Uint(v) => Some(v),
      Value::Int(v) if v >= 0 => Some(v as u64),
      _ => None,
    }
  }

  /// Gets the value as a signed integer, if it is one.
  pub fn as_int(&self) -> Option<i64> {
    match *self {
      Value::Int(v) => Some(v),
      Value::Uint(v) if v <= i64::MAX as u64 => Some(v as i64),
      _ => None,
    }
  }

  /// Returns true for [`Value::Absent`].
  pub fn is_absent(&self) -> bool {
    matches!(self, Value::Absent)
  }
}

impl fmt::Display for Value {
  /// Formats the value in its plain form: decimal integers, bare hex for
  /// bytes, an `01` string for bits, text verbatim, and the empty string
  /// for an absent value.
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::Uint(v) => write!(f, "{}", v),
      Value::Int(v) => write!(f, "{}", v),
      Value::Bytes(b) => {
        for byte in b {
          write!(f, "{:02X}", byte)?;
        }
        Ok(())
      }
      Value::Bits(bits) => {
        for &bit in bits {
          f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
      }
      Value::Str(s) => f.write_str(s),
      Value::Absent => Ok(()),
    }
  }
}

impl From<u64> for Value {
  fn from(v: u64) -> Self {
    Value::Uint(v)
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::Str(v)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn plain_rendering() {
    assert_eq!(Value::Uint(42).to_string(), "42");
    assert_eq!(Value::Int(-7).to_string(), "-7");
    assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "DEAD");
    assert_eq!(Value::Bits(vec![true, false, true]).to_string(), "101");
    assert_eq!(Value::Absent.to_string(), "");
  }

  #[test]
  fn conversions() {
    assert_eq!(Value::Uint(5).as_int(), Some(5));
    assert_eq!(Value::Int(-5).as_uint(), None);
    assert_eq!(Value::Str("x".into()).as_uint(), None);
  }
}
