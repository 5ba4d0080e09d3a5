//! The primitive type system.
//!
//! Maps name their field types with short strings (`uintle`, `nbcd`,
//! `strz`, ...). This module resolves those names to a [`PrimDef`], which
//! knows how to decode and encode a [`Value`] through the bit layer, and
//! hosts the per-map [`TypeRegistry`] for custom names a map registers on
//! top of the built-ins.

use std::collections::HashMap;

use crate::bits;
use crate::bits::Endian;
use crate::error::Error;
use crate::error::Result;
use crate::text::Codec;
use crate::value::Value;

/// A built-in primitive kind.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeKind {
  /// Signed integer, little-endian.
  Int,
  /// Unsigned integer, little-endian (the file's natural order).
  Uint,
  /// Unsigned integer, big-endian.
  UintBe,
  /// Unsigned integer, little-endian, explicitly.
  UintLe,
  /// Natural binary-coded decimal, little-endian.
  Nbcd,
  /// Natural binary-coded decimal, big-endian.
  NbcdBe,
  /// Natural binary-coded decimal, little-endian, explicitly.
  NbcdLe,
  /// Raw byte span.
  Bytes,
  /// Bit array.
  Bin,
  /// Fixed-length string.
  Str,
  /// Terminator-delimited string.
  Strz,
}

impl TypeKind {
  /// Parses a built-in type name.
  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "int" => Some(Self::Int),
      "uint" => Some(Self::Uint),
      "uintbe" => Some(Self::UintBe),
      "uintle" => Some(Self::UintLe),
      "nbcd" => Some(Self::Nbcd),
      "nbcdbe" => Some(Self::NbcdBe),
      "nbcdle" => Some(Self::NbcdLe),
      "bytes" => Some(Self::Bytes),
      "bin" => Some(Self::Bin),
      "str" => Some(Self::Str),
      "strz" => Some(Self::Strz),
      _ => None,
    }
  }

  /// Returns the canonical name of this kind.
  pub fn name(self) -> &'static str {
    match self {
      Self::Int => "int",
      Self::Uint => "uint",
      Self::UintBe => "uintbe",
      Self::UintLe => "uintle",
      Self::Nbcd => "nbcd",
      Self::NbcdBe => "nbcdbe",
      Self::NbcdLe => "nbcdle",
      Self::Bytes => "bytes",
      Self::Bin => "bin",
      Self::Str => "str",
      Self::Strz => "strz",
    }
  }

  /// Byte order of this kind, for the kinds where it matters.
  pub fn endian(self) -> Endian {
    match self {
      Self::UintBe | Self::NbcdBe => Endian::Big,
      _ => Endian::Little,
    }
  }

  /// Whether values of this kind are integers.
  pub fn is_integer(self) -> bool {
    matches!(
      self,
      Self::Int
        | Self::Uint
        | Self::UintBe
        | Self::UintLe
        | Self::Nbcd
        | Self::NbcdBe
        | Self::NbcdLe
    )
  }

  /// Whether values of this kind are text and need a codec.
  pub fn is_string(self) -> bool {
    matches!(self, Self::Str | Self::Strz)
  }

  /// Whether fields of this kind must start and end on byte boundaries.
  pub fn needs_alignment(self) -> bool {
    matches!(self, Self::Bytes | Self::Str | Self::Strz)
  }
}

/// A resolved primitive type: a kind plus the integer bias a custom
/// registration may add.
///
/// The bias is the declared zero point of game-specific pointer types:
/// decoding adds it, encoding subtracts it, so the in-map value can be a
/// file offset while the stored bytes hold a console address.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PrimDef {
  /// The underlying built-in kind.
  pub kind: TypeKind,
  /// Added on decode, subtracted on encode. Zero for the built-ins.
  pub bias: i64,
}

impl PrimDef {
  /// A plain built-in with no bias.
  pub fn plain(kind: TypeKind) -> Self {
    PrimDef { kind, bias: 0 }
  }

  /// Decodes a value of this type from `width` bits at `offset`.
  ///
  /// String kinds require `codec`; the schema loader guarantees one is
  /// present for well-formed maps.
  pub fn read(
    &self,
    buf: &[u8],
    offset: u64,
    width: u32,
    codec: Option<&Codec>,
  ) -> Result<Value> {
    match self.kind {
      TypeKind::Int => {
        let raw = bits::read_int(buf, offset, width, Endian::Little)?;
        Ok(Value::Int(raw + self.bias))
      }
      TypeKind::Uint | TypeKind::UintBe | TypeKind::UintLe => {
        let raw = bits::read_uint(buf, offset, width, self.kind.endian())?;
        self.biased(raw)
      }
      TypeKind::Nbcd | TypeKind::NbcdBe | TypeKind::NbcdLe => {
        let raw = bits::read_nbcd(buf, offset, width, self.kind.endian())?;
        self.biased(raw)
      }
      TypeKind::Bytes => Ok(Value::Bytes(bits::read_bytes(buf, offset, width as usize / 8)?)),
      TypeKind::Bin => Ok(Value::Bits(bits::read_bits(buf, offset, width as usize)?)),
      TypeKind::Str => {
        let codec = self.codec(codec)?;
        let raw = bits::read_bytes(buf, offset, width as usize / 8)?;
        Ok(Value::Str(codec.decode_fixed(&raw)))
      }
      TypeKind::Strz => {
        let codec = self.codec(codec)?;
        let raw = bits::read_bytes(buf, offset, width as usize / 8)?;
        Ok(Value::Str(codec.decode_z(&raw).text))
      }
    }
  }

  /// Encodes `value` into `width` bits at `offset`.
  ///
  /// Fails with [`Error::ValueOverflow`] before any byte changes if the
  /// value does not fit, and with [`Error::InvalidEncoding`] if the value
  /// is of the wrong shape for this kind.
  pub fn write(
    &self,
    buf: &mut [u8],
    offset: u64,
    width: u32,
    codec: Option<&Codec>,
    value: &Value,
  ) -> Result<()> {
    if value.is_absent() {
      return Ok(());
    }
    match self.kind {
      TypeKind::Int => {
        let v = value.as_int().ok_or_else(|| self.wrong_shape(value))?;
        bits::write_int(buf, offset, width, Endian::Little, v - self.bias)
      }
      TypeKind::Uint | TypeKind::UintBe | TypeKind::UintLe => {
        let raw = self.debiased(value)?;
        bits::write_uint(buf, offset, width, self.kind.endian(), raw)
      }
      TypeKind::Nbcd | TypeKind::NbcdBe | TypeKind::NbcdLe => {
        let raw = self.debiased(value)?;
        bits::write_nbcd(buf, offset, width, self.kind.endian(), raw)
      }
      TypeKind::Bytes => match value {
        Value::Bytes(b) => {
          if b.len() != width as usize / 8 {
            return Err(Error::ValueOverflow {
              value: b.len() as i128,
              width,
            });
          }
          bits::write_bytes(buf, offset, b)
        }
        _ => Err(self.wrong_shape(value)),
      },
      TypeKind::Bin => match value {
        Value::Bits(b) => {
          if b.len() != width as usize {
            return Err(Error::ValueOverflow {
              value: b.len() as i128,
              width,
            });
          }
          bits::write_bits(buf, offset, b)
        }
        _ => Err(self.wrong_shape(value)),
      },
      TypeKind::Str => {
        let codec = self.codec(codec)?;
        let text = match value {
          Value::Str(s) => s,
          _ => return Err(self.wrong_shape(value)),
        };
        let span = width as usize / 8;
        let mut encoded = codec.encode(text)?;
        if encoded.len() > span {
          return Err(Error::ValueOverflow {
            value: encoded.len() as i128,
            width,
          });
        }
        encoded.resize(span, codec.pad_byte());
        bits::write_bytes(buf, offset, &encoded)
      }
      TypeKind::Strz => {
        let codec = self.codec(codec)?;
        let text = match value {
          Value::Str(s) => s,
          _ => return Err(self.wrong_shape(value)),
        };
        let span = width as usize / 8;
        let encoded = codec.encode_z(text)?;
        if encoded.len() > span {
          return Err(Error::ValueOverflow {
            value: encoded.len() as i128,
            width,
          });
        }
        // Bytes past the terminator keep their old contents.
        bits::write_bytes(buf, offset, &encoded)
      }
    }
  }

  fn biased(&self, raw: u64) -> Result<Value> {
    let v = raw as i128 + self.bias as i128;
    if v < 0 {
      return Err(Error::InvalidEncoding {
        reason: format!("bias {} takes value {} below zero", self.bias, raw),
        value: Some(raw),
      });
    }
    Ok(Value::Uint(v as u64))
  }

  fn debiased(&self, value: &Value) -> Result<u64> {
    let v = value.as_uint().ok_or_else(|| self.wrong_shape(value))? as i128 - self.bias as i128;
    if v < 0 || v > u64::MAX as i128 {
      return Err(Error::ValueOverflow { value: v, width: 64 });
    }
    Ok(v as u64)
  }

  fn codec<'a>(&self, codec: Option<&'a Codec>) -> Result<&'a Codec> {
    codec.ok_or_else(|| Error::schema(format!("{} field has no codec", self.kind.name())))
  }

  fn wrong_shape(&self, value: &Value) -> Error {
    Error::InvalidEncoding {
      reason: format!("value {:?} has the wrong shape for {}", value, self.kind.name()),
      value: None,
    }
  }
}

/// The per-map registry of primitive type names.
///
/// One registry is created for each loaded map, so registrations in one
/// map can never leak into another.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
  customs: HashMap<String, PrimDef>,
}

impl TypeRegistry {
  /// Creates a registry holding only the built-ins.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a custom type name wrapping a built-in.
  ///
  /// Fails if the name shadows a built-in or an earlier registration.
  pub fn register(&mut self, name: &str, def: PrimDef) -> Result<()> {
    if TypeKind::from_name(name).is_some() {
      return Err(Error::schema(format!("type '{}' shadows a built-in", name)));
    }
    if self.customs.insert(name.to_owned(), def).is_some() {
      return Err(Error::schema(format!("type '{}' registered twice", name)));
    }
    Ok(())
  }

  /// Looks up a type name, built-in or custom.
  pub fn lookup(&self, name: &str) -> Option<PrimDef> {
    TypeKind::from_name(name)
      .map(PrimDef::plain)
      .or_else(|| self.customs.get(name).copied())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn builtin_names_roundtrip() {
    for name in [
      "int", "uint", "uintbe", "uintle", "nbcd", "nbcdbe", "nbcdle", "bytes", "bin", "str",
      "strz",
    ] {
      assert_eq!(TypeKind::from_name(name).unwrap().name(), name);
    }
    assert!(TypeKind::from_name("float").is_none());
  }

  #[test]
  fn registry_scoping() {
    let mut reg = TypeRegistry::new();
    reg.register("ptr", PrimDef { kind: TypeKind::UintLe, bias: -0x8000 }).unwrap();
    assert!(reg.register("uint", PrimDef::plain(TypeKind::Uint)).is_err());
    assert!(reg.register("ptr", PrimDef::plain(TypeKind::Uint)).is_err());
    assert_eq!(reg.lookup("ptr").unwrap().bias, -0x8000);
    assert_eq!(reg.lookup("uintbe").unwrap().kind, TypeKind::UintBe);
  }

  #[test]
  fn biased_pointer_roundtrip() {
    // A console address 0x8010 stored in the file stands for file offset
    // 0x10 once the declared zero point is subtracted.
    let ptr = PrimDef { kind: TypeKind::UintLe, bias: -0x8000 };
    let mut buf = [0u8; 2];
    ptr.write(&mut buf, 0, 16, None, &Value::Uint(0x10)).unwrap();
    assert_eq!(buf, [0x10, 0x80]);
    assert_eq!(ptr.read(&buf, 0, 16, None).unwrap(), Value::Uint(0x10));
  }

  #[test]
  fn integer_kinds_decode() {
    let buf = [0x34, 0x12];
    let le = PrimDef::plain(TypeKind::UintLe);
    let be = PrimDef::plain(TypeKind::UintBe);
    assert_eq!(le.read(&buf, 0, 16, None).unwrap(), Value::Uint(0x1234));
    assert_eq!(be.read(&buf, 0, 16, None).unwrap(), Value::Uint(0x3412));
  }
}
