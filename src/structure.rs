//! Compiled structure layouts and live struct views.
//!
//! A [`StructDef`] is the compiled form of one `structs/*.tsv` file:
//! every field resolved to a concrete type, bit offset and width, with
//! the display hint parsed. A [`StructView`] is an instance of a struct
//! at some position in the ROM; it holds only the layout and a base bit
//! offset, and borrows the byte buffer for each individual read or
//! write.

use std::collections::HashMap;

use tracing::warn;

use crate::bits;
use crate::error::Error;
use crate::error::Result;
use crate::map::field::FieldSpec;
use crate::map::field::Origin;
use crate::map::field::Presence;
use crate::map::RomMap;
use crate::text::Codec;
use crate::ty::PrimDef;
use crate::ty::TypeKind;
use crate::ty::TypeRegistry;
use crate::value::Value;

/// How a field renders in dumps.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Display {
  /// Plain form: decimal for integers, hex for bytes, text for strings.
  Default,
  /// Hexadecimal with an `0x` prefix.
  Hex,
  /// A pointer; renders as hex and marks the field for dereferencing.
  Pointer,
  /// Symbolic, through the named enum.
  Enum(String),
  /// Text, through the named codec.
  Codec(String),
  /// A one-bit flag with a mnemonic letter.
  Flag(char),
}

/// The resolved type of a field.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FieldTy {
  /// A primitive.
  Prim(PrimDef),
  /// A nested struct, by id. Only bitfield structs may nest.
  Struct(String),
}

/// A fully resolved field of a compiled struct.
#[derive(Clone, Debug)]
pub struct FieldDef {
  /// The declaration this field was compiled from.
  pub spec: FieldSpec,
  /// The resolved type.
  pub ty: FieldTy,
  /// Offset from the field's origin, in bits.
  pub offset_bits: u64,
  /// Width, in bits.
  pub width_bits: u32,
  /// The resolved display hint.
  pub display: Display,
}

/// A compiled structure layout.
#[derive(Clone, Debug)]
pub struct StructDef {
  /// The struct's id (the stem of its declaration file).
  pub id: String,
  /// Fields, in declaration order.
  pub fields: Vec<FieldDef>,
  /// Total size in bits: the largest end offset of any parent-origin
  /// field.
  pub width_bits: u64,
  /// Whether every field is a one-bit lettered flag.
  pub bitfield: bool,
}

impl StructDef {
  /// Looks up a field by id or name.
  pub fn field(&self, key: &str) -> Option<&FieldDef> {
    self
      .fields
      .iter()
      .find(|f| f.spec.id == key || f.spec.name == key)
  }

  /// The field carrying instance names, if any.
  pub fn name_field(&self) -> Option<&FieldDef> {
    self.fields.iter().find(|f| f.spec.is_name())
  }

  /// Renders a bitfield value as its flag string: one letter per field,
  /// uppercase when set.
  pub fn render_flags(&self, bits: &[bool]) -> String {
    self
      .fields
      .iter()
      .zip(bits)
      .map(|(field, &set)| match field.display {
        Display::Flag(letter) if set => letter.to_ascii_uppercase(),
        Display::Flag(letter) => letter.to_ascii_lowercase(),
        _ => '?',
      })
      .collect()
  }

  /// Parses a flag string back into per-field bits. The empty string
  /// clears every flag.
  pub fn parse_flags(&self, text: &str) -> Result<Vec<bool>> {
    if text.is_empty() {
      return Ok(vec![false; self.fields.len()]);
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() != self.fields.len() {
      return Err(Error::InvalidEncoding {
        reason: format!("flag string {:?} has {} letters, bitfield '{}' has {} flags",
          text, chars.len(), self.id, self.fields.len()),
        value: None,
      });
    }
    self
      .fields
      .iter()
      .zip(&chars)
      .map(|(field, &c)| match field.display {
        Display::Flag(letter) if c.eq_ignore_ascii_case(&letter) => Ok(c.is_ascii_uppercase()),
        _ => Err(Error::InvalidEncoding {
          reason: format!("flag letter '{}' does not match bitfield '{}'", c, self.id),
          value: None,
        }),
      })
      .collect()
  }
}

/// Compiles every struct declaration of a map.
///
/// Structs may use other structs as field types (nested bitfields), so
/// compilation repeats until it stops making progress; whatever is left
/// names an unknown type or forms a cycle.
pub fn compile_all(
  decls: &[(String, Vec<FieldSpec>)],
  types: &TypeRegistry,
  enums: &HashMap<String, crate::map::EnumDef>,
  codecs: &HashMap<String, Codec>,
) -> Result<HashMap<String, StructDef>> {
  let mut done: HashMap<String, StructDef> = HashMap::new();
  let mut pending: Vec<&(String, Vec<FieldSpec>)> = decls.iter().collect();
  while !pending.is_empty() {
    let mut next = Vec::new();
    let mut progressed = false;
    for decl in pending {
      let (id, specs) = decl;
      let ready = specs.iter().all(|f| {
        types.lookup(&f.type_name).is_some() || done.contains_key(&f.type_name)
      });
      let unknown = specs.iter().find(|f| {
        types.lookup(&f.type_name).is_none() && !decls.iter().any(|(d, _)| d == &f.type_name)
      });
      if let Some(bad) = unknown {
        return Err(Error::schema(format!(
          "{}.{}: unknown type '{}'",
          id, bad.id, bad.type_name
        )));
      }
      if ready {
        let def = compile(id, specs, types, enums, codecs, &done)?;
        done.insert(id.clone(), def);
        progressed = true;
      } else {
        next.push(decl);
      }
    }
    if !progressed && !next.is_empty() {
      let names: Vec<&str> = next.iter().map(|(id, _)| id.as_str()).collect();
      return Err(Error::schema(format!(
        "cyclic struct nesting among: {}",
        names.join(", ")
      )));
    }
    pending = next;
  }
  Ok(done)
}

fn compile(
  id: &str,
  specs: &[FieldSpec],
  types: &TypeRegistry,
  enums: &HashMap<String, crate::map::EnumDef>,
  codecs: &HashMap<String, Codec>,
  structs: &HashMap<String, StructDef>,
) -> Result<StructDef> {
  if specs.is_empty() {
    return Err(Error::schema(format!("struct '{}' has no fields", id)));
  }
  let mut fields = Vec::with_capacity(specs.len());
  for spec in specs {
    for earlier in specs {
      if !std::ptr::eq(earlier, spec) && earlier.id == spec.id {
        return Err(Error::schema(format!("duplicate field id '{}' in '{}'", spec.id, id)));
      }
    }
    fields.push(compile_field(id, spec, types, enums, codecs, structs)?);
  }

  // Overlapping parent-origin fields usually mean a map typo. Unions are
  // a real thing in the wild though, so this only warns.
  let mut spans: Vec<(u64, u64, &str)> = fields
    .iter()
    .filter(|f| f.spec.origin == Origin::Parent)
    .map(|f| (f.offset_bits, f.offset_bits + f.width_bits as u64, f.spec.id.as_str()))
    .collect();
  spans.sort();
  for pair in spans.windows(2) {
    if pair[1].0 < pair[0].1 {
      warn!("struct '{}': fields '{}' and '{}' overlap", id, pair[0].2, pair[1].2);
    }
  }

  let width_bits = fields
    .iter()
    .filter(|f| f.spec.origin == Origin::Parent)
    .map(|f| f.offset_bits + f.width_bits as u64)
    .max()
    .unwrap_or(0);
  let bitfield = fields
    .iter()
    .all(|f| f.width_bits == 1 && matches!(f.display, Display::Flag(_)));

  Ok(StructDef { id: id.to_owned(), fields, width_bits, bitfield })
}

fn compile_field(
  struct_id: &str,
  spec: &FieldSpec,
  types: &TypeRegistry,
  enums: &HashMap<String, crate::map::EnumDef>,
  codecs: &HashMap<String, Codec>,
  structs: &HashMap<String, StructDef>,
) -> Result<FieldDef> {
  let at = |what: String| Error::schema(format!("{}.{}: {}", struct_id, spec.id, what));

  let (ty, width_bits) = match types.lookup(&spec.type_name) {
    Some(prim) => {
      let width = spec.width_bits();
      if width == 0 || width > u32::MAX as u64 {
        return Err(at(format!("bad width {} bits", width)));
      }
      let width = width as u32;
      if prim.kind.is_integer() && width > bits::MAX_INT_WIDTH {
        return Err(at(format!("integer fields top out at 64 bits, got {}", width)));
      }
      if prim.kind.needs_alignment() && (spec.offset_bits() % 8 != 0 || width % 8 != 0) {
        return Err(at("string and byte fields must be byte-aligned".to_owned()));
      }
      (FieldTy::Prim(prim), width)
    }
    None => {
      let nested = structs
        .get(&spec.type_name)
        .ok_or_else(|| at(format!("unknown type '{}'", spec.type_name)))?;
      if !nested.bitfield {
        return Err(at(format!("nested struct '{}' is not a bitfield", spec.type_name)));
      }
      if nested.fields.iter().any(|f| f.spec.origin != Origin::Parent) {
        return Err(at(format!("nested struct '{}' has root-origin fields", spec.type_name)));
      }
      (FieldTy::Struct(spec.type_name.clone()), nested.width_bits as u32)
    }
  };

  let display = resolve_display(spec, &ty, width_bits, enums, codecs).map_err(at)?;
  Ok(FieldDef {
    spec: spec.clone(),
    ty,
    offset_bits: spec.offset_bits(),
    width_bits,
    display,
  })
}

/// Compiles a standalone primitive field, for tables whose element type
/// is a primitive rather than a struct.
pub(crate) fn compile_prim_field(
  spec: &FieldSpec,
  types: &TypeRegistry,
  enums: &HashMap<String, crate::map::EnumDef>,
  codecs: &HashMap<String, Codec>,
) -> Result<FieldDef> {
  compile_field("<table>", spec, types, enums, codecs, &HashMap::new())
}

fn resolve_display(
  spec: &FieldSpec,
  ty: &FieldTy,
  width_bits: u32,
  enums: &HashMap<String, crate::map::EnumDef>,
  codecs: &HashMap<String, Codec>,
) -> std::result::Result<Display, String> {
  let is_string = matches!(ty, FieldTy::Prim(p) if p.kind.is_string());
  if is_string {
    let id = if spec.display.is_empty() { "ascii" } else { &spec.display };
    let codec = codecs.get(id).ok_or_else(|| format!("unknown codec '{}'", id))?;
    let is_strz = matches!(ty, FieldTy::Prim(p) if p.kind == TypeKind::Strz);
    if is_strz && !codec.has_terminator() {
      return Err(format!("codec '{}' declares no terminator for a strz field", id));
    }
    return Ok(Display::Codec(id.to_owned()));
  }
  match spec.display.as_str() {
    "" => Ok(Display::Default),
    "hex" => Ok(Display::Hex),
    "pointer" => Ok(Display::Pointer),
    other => {
      if enums.contains_key(other) {
        return Ok(Display::Enum(other.to_owned()));
      }
      let mut chars = other.chars();
      match (chars.next(), chars.next()) {
        (Some(letter), None) if letter.is_ascii_alphabetic() && width_bits == 1 => {
          Ok(Display::Flag(letter))
        }
        _ => Err(format!("unknown display '{}'", other)),
      }
    }
  }
}

/// A live struct instance: a layout at a bit position.
///
/// Views are cheap to copy and never hold the buffer; each access
/// borrows it explicitly, so any number of views can coexist over one
/// ROM.
#[derive(Copy, Clone, Debug)]
pub struct StructView<'m> {
  def: &'m StructDef,
  base_bits: u64,
}

impl<'m> StructView<'m> {
  /// Creates a view of `def` based at `base_bits`.
  pub fn new(def: &'m StructDef, base_bits: u64) -> Self {
    StructView { def, base_bits }
  }

  /// The layout this view instantiates.
  pub fn def(&self) -> &'m StructDef {
    self.def
  }

  /// The view's base offset, in bits from the start of the ROM data.
  pub fn base_bits(&self) -> u64 {
    self.base_bits
  }

  /// Absolute bit offset of a field of this view.
  pub fn field_base(&self, field: &FieldDef) -> u64 {
    match field.spec.origin {
      Origin::Parent => self.base_bits + field.offset_bits,
      Origin::Root => field.offset_bits,
    }
  }

  fn absence(&self, data: &[u8], field: &FieldDef) -> Result<bool> {
    let offset = self.field_base(field);
    let width = field.width_bits as u64;
    let in_range = offset + width <= data.len() as u64 * 8;
    let optional = !matches!(field.spec.presence, Presence::Required);
    if !in_range {
      if optional {
        return Ok(true);
      }
      return Err(Error::OutOfBounds { offset, width, len: data.len() as u64 * 8 });
    }
    if let Presence::Sentinel(sentinel) = field.spec.presence {
      if let FieldTy::Prim(prim) = &field.ty {
        if prim.kind.is_integer() {
          let raw = bits::read_uint(data, offset, field.width_bits, prim.kind.endian())?;
          return Ok(raw == sentinel);
        }
      }
    }
    Ok(false)
  }

  /// Reads one field. Optional fields read as [`Value::Absent`] when out
  /// of range or equal to their sentinel.
  pub fn get(&self, data: &[u8], field: &FieldDef, map: &RomMap) -> Result<Value> {
    if self.absence(data, field)? {
      return Ok(Value::Absent);
    }
    let offset = self.field_base(field);
    match &field.ty {
      FieldTy::Prim(prim) => {
        let codec = match &field.display {
          Display::Codec(id) => map.codecs.get(id),
          _ => None,
        };
        prim.read(data, offset, field.width_bits, codec)
      }
      FieldTy::Struct(id) => {
        let nested = map.structs.get(id).ok_or_else(|| {
          Error::schema(format!("nested struct '{}' vanished from the map", id))
        })?;
        let mut flags = Vec::with_capacity(nested.fields.len());
        for sub in &nested.fields {
          let bit = bits::read_bits(data, offset + sub.offset_bits, 1)?;
          flags.push(bit[0]);
        }
        Ok(Value::Bits(flags))
      }
    }
  }

  /// Writes one field. Writing [`Value::Absent`], or anything to a field
  /// that currently reads as absent, is a no-op.
  pub fn set(&self, data: &mut [u8], field: &FieldDef, map: &RomMap, value: &Value) -> Result<()> {
    if value.is_absent() || self.absence(data, field)? {
      return Ok(());
    }
    let offset = self.field_base(field);
    match &field.ty {
      FieldTy::Prim(prim) => {
        let codec = match &field.display {
          Display::Codec(id) => map.codecs.get(id),
          _ => None,
        };
        prim.write(data, offset, field.width_bits, codec, value)
      }
      FieldTy::Struct(id) => {
        let nested = map.structs.get(id).ok_or_else(|| {
          Error::schema(format!("nested struct '{}' vanished from the map", id))
        })?;
        let flags = match value {
          Value::Bits(flags) if flags.len() == nested.fields.len() => flags,
          Value::Bits(flags) => {
            return Err(Error::ValueOverflow {
              value: flags.len() as i128,
              width: nested.fields.len() as u32,
            });
          }
          _ => {
            return Err(Error::InvalidEncoding {
              reason: format!("bitfield '{}' takes a flag set, got {:?}", id, value),
              value: None,
            });
          }
        };
        for (sub, &flag) in nested.fields.iter().zip(flags) {
          bits::write_bits(data, offset + sub.offset_bits, &[flag])?;
        }
        Ok(())
      }
    }
  }

  /// Compares two instances by decoded field values.
  ///
  /// Padding and other don't-care bits are not part of any field, so two
  /// instances can be equal without their byte regions matching.
  pub fn values_equal(
    &self,
    data: &[u8],
    other: &StructView,
    other_data: &[u8],
    map: &RomMap,
  ) -> Result<bool> {
    if !std::ptr::eq(self.def, other.def) && self.def.id != other.def.id {
      return Ok(false);
    }
    for (a, b) in self.def.fields.iter().zip(&other.def.fields) {
      if self.get(data, a, map)? != other.get(other_data, b, map)? {
        return Ok(false);
      }
    }
    Ok(true)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::map::RomMap;
  use crate::map::RomMeta;
  use crate::value::Value;

  fn field(id: &str, ty: &str, offset: u64, size: u64) -> FieldSpec {
    FieldSpec {
      id: id.into(),
      name: id.into(),
      type_name: ty.into(),
      origin: Origin::Parent,
      unit: crate::map::field::Unit::Bytes,
      offset,
      size,
      ref_target: None,
      display: String::new(),
      presence: Presence::Required,
      comment: String::new(),
    }
  }

  fn tiny_map() -> RomMap {
    let thing = vec![
      field("a", "uint", 0, 1),
      field("b", "uintbe", 2, 2),
      {
        let mut f = field("drop", "uint", 4, 1);
        f.presence = Presence::Sentinel(0xff);
        f
      },
      {
        let mut f = field("anchor", "uint", 0x20, 1);
        f.origin = Origin::Root;
        f
      },
    ];
    RomMap::assemble(
      RomMeta::default(),
      crate::ty::TypeRegistry::new(),
      vec![("thing".into(), thing)],
      Vec::new(),
      Default::default(),
      Default::default(),
      Vec::new(),
    )
    .unwrap()
  }

  #[test]
  fn layout_and_width() {
    let map = tiny_map();
    let def = &map.structs["thing"];
    // Root-origin fields do not contribute to the struct's own size.
    assert_eq!(def.width_bits, 5 * 8);
    assert!(!def.bitfield);
  }

  #[test]
  fn origins() {
    let map = tiny_map();
    let def = &map.structs["thing"];
    let mut data = vec![0u8; 0x30];
    data[0x10] = 7;
    data[0x12] = 0x12;
    data[0x13] = 0x34;
    data[0x20] = 99;
    let view = StructView::new(def, 0x10 * 8);
    assert_eq!(view.get(&data, def.field("a").unwrap(), &map).unwrap(), Value::Uint(7));
    assert_eq!(view.get(&data, def.field("b").unwrap(), &map).unwrap(), Value::Uint(0x1234));
    // The anchor reads from ROM offset 0x20 no matter where the struct is.
    assert_eq!(view.get(&data, def.field("anchor").unwrap(), &map).unwrap(), Value::Uint(99));
  }

  #[test]
  fn sentinel_reads_absent_and_writes_nothing() {
    let map = tiny_map();
    let def = &map.structs["thing"];
    let mut data = vec![0u8; 0x30];
    data[4] = 0xff;
    let view = StructView::new(def, 0);
    let drop = def.field("drop").unwrap();
    assert_eq!(view.get(&data, drop, &map).unwrap(), Value::Absent);
    view.set(&mut data, drop, &map, &Value::Uint(3)).unwrap();
    assert_eq!(data[4], 0xff);

    data[4] = 2;
    assert_eq!(view.get(&data, drop, &map).unwrap(), Value::Uint(2));
  }

  #[test]
  fn optional_runs_off_the_end() {
    let map = tiny_map();
    let def = &map.structs["thing"];
    // Four bytes: a and b are in range, the sentinel field is not.
    let data = vec![0u8; 4];
    let view = StructView::new(def, 0);
    assert_eq!(view.get(&data, def.field("drop").unwrap(), &map).unwrap(), Value::Absent);
    assert!(view.get(&data, def.field("b").unwrap(), &map).is_ok());
  }

  #[test]
  fn equality_ignores_padding() {
    let map = tiny_map();
    let def = &map.structs["thing"];
    let mut left = vec![0u8; 0x30];
    let mut right = vec![0u8; 0x30];
    left[0] = 1;
    right[0] = 1;
    // Byte 1 belongs to no field.
    left[1] = 0xaa;
    right[1] = 0xbb;
    let a = StructView::new(def, 0);
    let b = StructView::new(def, 0);
    assert!(a.values_equal(&left, &b, &right, &map).unwrap());
    right[2] = 1;
    assert!(!a.values_equal(&left, &b, &right, &map).unwrap());
  }
}
