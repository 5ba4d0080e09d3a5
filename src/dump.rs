//! Rendering entities to dump files and parsing them back.
//!
//! One TSV file per entity: an `_idx` column to keep row order honest,
//! then one column per joined field. Every renderer here has an exact
//! inverse, which is what makes dump-then-build produce an empty patch
//! when nothing was edited.

use std::collections::HashMap;

use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::map::RomMap;
use crate::structure::Display;
use crate::structure::FieldDef;
use crate::structure::FieldTy;
use crate::table::Entity;
use crate::tsv;
use crate::value::Value;

/// Names of cross-reference target rows, keyed by target id.
///
/// A row's entry is `None` when it has no usable name, or when its name
/// collides with an earlier row's; such rows render as bare indices so
/// they survive a round trip.
pub type RefNames = HashMap<String, Vec<Option<String>>>;

/// Name-to-row maps for cross-reference targets, keyed by target id.
pub type RefIndex = HashMap<String, HashMap<String, usize>>;

/// The reserved row-order column.
pub const IDX_COLUMN: &str = "_idx";

/// Renders one cell.
pub fn render_cell(
  map: &RomMap,
  field: &FieldDef,
  value: &Value,
  ref_names: &RefNames,
) -> String {
  if value.is_absent() {
    return String::new();
  }
  if let Some(target) = &field.spec.ref_target {
    if let Some(row) = value.as_uint() {
      if let Some(name) = ref_names
        .get(target)
        .and_then(|names| names.get(row as usize))
        .and_then(|name| name.as_deref())
      {
        return name.to_owned();
      }
      return row.to_string();
    }
  }
  match &field.display {
    Display::Hex | Display::Pointer => match value.as_uint() {
      Some(v) => format!("0x{:X}", v),
      None => value.to_string(),
    },
    Display::Enum(id) => match (map.enums.get(id), value.as_uint()) {
      (Some(def), Some(v)) => def.render(v),
      _ => value.to_string(),
    },
    Display::Flag(letter) => {
      let set = match value {
        Value::Bits(bits) => bits.first().copied().unwrap_or(false),
        other => other.as_uint().unwrap_or(0) != 0,
      };
      let letter = if set { letter.to_ascii_uppercase() } else { letter.to_ascii_lowercase() };
      letter.to_string()
    }
    _ => match &field.ty {
      FieldTy::Struct(id) => match (map.structs.get(id), value) {
        (Some(def), Value::Bits(bits)) => def.render_flags(bits),
        _ => value.to_string(),
      },
      FieldTy::Prim(_) => value.to_string(),
    },
  }
}

/// Parses one cell back to a value. The exact inverse of
/// [`render_cell`].
pub fn parse_cell(
  map: &RomMap,
  field: &FieldDef,
  text: &str,
  ref_index: &RefIndex,
) -> Result<Value> {
  let unparseable = |reason: &str| Error::InvalidEncoding {
    reason: reason.to_owned(),
    value: None,
  };

  if let Some(target) = &field.spec.ref_target {
    let key = text.trim();
    if key.is_empty() {
      // Rows without a usable target name dump as blanks in some maps;
      // loading one back is a no-op rather than a guess.
      return Ok(Value::Absent);
    }
    if let Some(row) = ref_index.get(target).and_then(|names| names.get(key)) {
      return Ok(Value::Uint(*row as u64));
    }
    if let Some(row) = tsv::parse_u64(key) {
      return Ok(Value::Uint(row));
    }
    return Err(Error::UnknownReference { name: key.to_owned(), target: target.clone() });
  }

  if text.is_empty() && !matches!(field.display, Display::Codec(_)) {
    return Ok(Value::Absent);
  }

  match &field.display {
    Display::Hex | Display::Pointer => tsv::parse_u64(text)
      .map(Value::Uint)
      .ok_or_else(|| unparseable("expected a hex or decimal integer")),
    Display::Enum(id) => {
      let def = map.enums.get(id).ok_or_else(|| unparseable("unknown enum"))?;
      def
        .parse(text)
        .map(Value::Uint)
        .ok_or_else(|| unparseable("not a symbol or integer of the enum"))
    }
    Display::Flag(letter) => {
      let text = text.trim();
      let mut chars = text.chars();
      let (c, rest) = (chars.next(), chars.next());
      let c = match (c, rest) {
        (Some(c), None) if c.eq_ignore_ascii_case(letter) => c,
        _ => return Err(unparseable("expected the flag's letter")),
      };
      let set = c.is_ascii_uppercase();
      match &field.ty {
        FieldTy::Prim(p) if p.kind == crate::ty::TypeKind::Bin => Ok(Value::Bits(vec![set])),
        _ => Ok(Value::Uint(set as u64)),
      }
    }
    Display::Codec(_) => Ok(Value::Str(text.to_owned())),
    Display::Default => match &field.ty {
      FieldTy::Struct(id) => {
        let def = map.structs.get(id).ok_or_else(|| unparseable("unknown bitfield"))?;
        def.parse_flags(text.trim()).map(Value::Bits)
      }
      FieldTy::Prim(prim) => parse_plain(prim.kind, text).ok_or_else(|| {
        unparseable(&format!("expected a {} value", prim.kind.name()))
      }),
    },
  }
}

fn parse_plain(kind: crate::ty::TypeKind, text: &str) -> Option<Value> {
  use crate::ty::TypeKind;
  match kind {
    TypeKind::Int => tsv::parse_i64(text).map(Value::Int),
    TypeKind::Bytes => {
      let text = text.trim();
      if text.len() % 2 != 0 {
        return None;
      }
      (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()
        .map(Value::Bytes)
    }
    TypeKind::Bin => text
      .trim()
      .chars()
      .map(|c| match c {
        '0' => Some(false),
        '1' => Some(true),
        _ => None,
      })
      .collect::<Option<Vec<bool>>>()
      .map(Value::Bits),
    _ => tsv::parse_u64(text).map(Value::Uint),
  }
}

/// Renders a whole entity as dump-file text.
///
/// In loose mode unreadable cells degrade to a best-effort value or an
/// empty cell with a warning; in strict mode they fail the dump.
pub fn render_entity(
  map: &RomMap,
  entity: &Entity,
  data: &[u8],
  ref_names: &RefNames,
  strict: bool,
) -> Result<String> {
  let mut columns = vec![IDX_COLUMN.to_owned()];
  columns.extend(entity.columns().iter().map(|c| c.header.clone()));

  let mut rows = Vec::with_capacity(entity.len());
  for row in 0..entity.len() {
    let mut cells = vec![row.to_string()];
    for col in entity.columns() {
      let field = entity.field_def(col)?;
      let value = match entity.get(data, map, row, col, strict) {
        Ok(value) => value,
        Err(Error::InvalidEncoding { reason, value: Some(best) }) if !strict => {
          warn!("{} row {} '{}': {}; keeping best effort", entity.spec().name, row, col.header, reason);
          Value::Uint(best)
        }
        Err(e) if !strict => {
          warn!("{} row {} '{}': {}; leaving blank", entity.spec().name, row, col.header, e);
          cells.push(String::new());
          continue;
        }
        Err(e) => return Err(e),
      };
      cells.push(render_cell(map, field, &value, ref_names));
    }
    rows.push(cells);
  }
  Ok(tsv::write(columns, rows))
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn plain_values_roundtrip_as_text() {
    assert_eq!(parse_plain(crate::ty::TypeKind::Int, "-12"), Some(Value::Int(-12)));
    assert_eq!(
      parse_plain(crate::ty::TypeKind::Bytes, "DEAD"),
      Some(Value::Bytes(vec![0xde, 0xad]))
    );
    assert_eq!(
      parse_plain(crate::ty::TypeKind::Bin, "101"),
      Some(Value::Bits(vec![true, false, true]))
    );
    assert_eq!(parse_plain(crate::ty::TypeKind::Uint, "0x10"), Some(Value::Uint(16)));
    assert_eq!(parse_plain(crate::ty::TypeKind::Bytes, "XY"), None);
  }
}
