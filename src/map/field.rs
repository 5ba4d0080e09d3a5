//! Field declarations, as they appear in a map's struct files.
//!
//! A [`FieldSpec`] is the raw, validated-but-unresolved form of one row
//! of a `structs/*.tsv` file. Resolution against the rest of the map
//! (type names, enums, codecs, nested structs) happens when the struct
//! is compiled.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::tsv;
use crate::tsv::Row;

/// What a field's offset is relative to.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub enum Origin {
  /// Offset from the start of the containing struct.
  Parent,
  /// Offset from the start of the ROM data. Pointer-followed subfields
  /// attach this way.
  Root,
}

/// The unit a field's offset and size are declared in.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub enum Unit {
  /// Whole bytes, the default.
  Bytes,
  /// Single bits, for flags and other sub-byte fields.
  Bits,
}

impl Unit {
  /// The number of bits in one of this unit.
  pub fn bits(self) -> u64 {
    match self {
      Unit::Bytes => 8,
      Unit::Bits => 1,
    }
  }
}

/// Whether a field must be present in every instance.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub enum Presence {
  /// The field is always there.
  Required,
  /// A trailing field that reads as absent when its span runs off the
  /// end of the data.
  Optional,
  /// As [`Presence::Optional`], and also absent when the raw integer
  /// equals the sentinel.
  Sentinel(u64),
}

/// One field of a struct declaration.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct FieldSpec {
  /// Identifier, unique within the struct.
  pub id: String,
  /// Human-readable name; doubles as the dump column header. Defaults to
  /// the id.
  pub name: String,
  /// Type name: a primitive, a registered custom type, or a struct id.
  pub type_name: String,
  /// What `offset` is relative to.
  pub origin: Origin,
  /// Unit for `offset` and `size`.
  pub unit: Unit,
  /// Offset from the origin, in `unit`s.
  pub offset: u64,
  /// Size in `unit`s. For strings and byte spans this is the element
  /// count.
  pub size: u64,
  /// Table or entity this field's integer value indexes into.
  pub ref_target: Option<String>,
  /// Display hint: empty, `hex`, `pointer`, an enum id, a codec id, or a
  /// single flag letter.
  pub display: String,
  /// Presence of the field.
  pub presence: Presence,
  /// Free-form notes from the map author.
  pub comment: String,
}

impl FieldSpec {
  /// Parses a field from one row of a struct file.
  pub fn from_row(struct_id: &str, row: Row) -> Result<FieldSpec> {
    let at = |what: &str| format!("{} field {}: {}", struct_id, row.index() + 1, what);

    let id = row.get("id").trim().to_owned();
    if id.is_empty() {
      return Err(Error::schema(at("missing id")));
    }
    let name = match row.get("name").trim() {
      "" => id.clone(),
      name => name.to_owned(),
    };
    let type_name = match row.get("type").trim() {
      "" => "uint".to_owned(),
      ty => ty.to_owned(),
    };
    let origin = match row.get("origin").trim() {
      "" | "parent" => Origin::Parent,
      "root" => Origin::Root,
      other => return Err(Error::schema(at(&format!("unknown origin '{}'", other)))),
    };
    let unit = match row.get("unit").trim() {
      "" | "bytes" => Unit::Bytes,
      "bits" => Unit::Bits,
      other => return Err(Error::schema(at(&format!("unknown unit '{}'", other)))),
    };
    let offset = tsv::parse_u64(row.get("offset"))
      .ok_or_else(|| Error::schema(at(&format!("bad offset '{}'", row.get("offset")))))?;
    let size = match row.get("size").trim() {
      "" => 1,
      cell => {
        tsv::parse_u64(cell).ok_or_else(|| Error::schema(at(&format!("bad size '{}'", cell))))?
      }
    };
    let ref_target = match row.get("ref").trim() {
      "" => None,
      target => Some(target.to_owned()),
    };
    let presence = match row.get("optional").trim() {
      "" | "0" => Presence::Required,
      "1" | "true" => Presence::Optional,
      cell => match tsv::parse_u64(cell) {
        Some(sentinel) => Presence::Sentinel(sentinel),
        None => return Err(Error::schema(at(&format!("bad optional '{}'", cell)))),
      },
    };

    Ok(FieldSpec {
      id,
      name,
      type_name,
      origin,
      unit,
      offset,
      size,
      ref_target,
      display: row.get("display").trim().to_owned(),
      presence,
      comment: row.get("comment").to_owned(),
    })
  }

  /// Offset from the origin, in bits.
  pub fn offset_bits(&self) -> u64 {
    self.offset * self.unit.bits()
  }

  /// Total width, in bits.
  pub fn width_bits(&self) -> u64 {
    self.size * self.unit.bits()
  }

  /// Whether this field carries its parent's name, making it the name
  /// source for cross-references.
  pub fn is_name(&self) -> bool {
    self.id.eq_ignore_ascii_case("name") || self.name.eq_ignore_ascii_case("name")
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::tsv::Sheet;

  fn parse_one(body: &str) -> Result<FieldSpec> {
    let text = format!("id\tname\ttype\toffset\tsize\torigin\tref\tdisplay\tunit\toptional\tcomment\n{}", body);
    let sheet = Sheet::parse(&text);
    FieldSpec::from_row("monster", sheet.row(0))
  }

  #[test]
  fn defaults() {
    let field = parse_one("hp\t\t\t0x10\t\t\t\t\t\t\t").unwrap();
    assert_eq!(field.name, "hp");
    assert_eq!(field.type_name, "uint");
    assert_eq!(field.origin, Origin::Parent);
    assert_eq!(field.unit, Unit::Bytes);
    assert_eq!(field.offset_bits(), 0x80);
    assert_eq!(field.width_bits(), 8);
    assert_eq!(field.presence, Presence::Required);
  }

  #[test]
  fn bit_unit() {
    let field = parse_one("poison\tPoison\tbin\t3\t1\t\t\ta\tbits\t\t").unwrap();
    assert_eq!(field.offset_bits(), 3);
    assert_eq!(field.width_bits(), 1);
    assert_eq!(field.display, "a");
  }

  #[test]
  fn sentinel_presence() {
    let field = parse_one("drop\t\tuint\t8\t1\t\titems\t\t\t0xFF\t").unwrap();
    assert_eq!(field.presence, Presence::Sentinel(0xff));
    assert_eq!(field.ref_target.as_deref(), Some("items"));
  }

  #[test]
  fn missing_offset_rejected() {
    assert!(parse_one("hp\t\t\t\t\t\t\t\t\t\t").is_err());
  }
}
