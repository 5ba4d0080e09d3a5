//! The ROM map: what lives where in a cartridge image.
//!
//! A map is a directory of declarative TSV files describing structs,
//! tables, enums, text codecs and entity joins. Loading one produces a
//! [`RomMap`], the immutable schema everything else works from. Each
//! loaded map gets its own type and codec registries, so nothing
//! registered for one map can bleed into another.

pub mod field;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::structure;
use crate::structure::StructDef;
use crate::text::Codec;
use crate::tsv;
use crate::tsv::Sheet;
use crate::ty::TypeKind;
use crate::ty::TypeRegistry;

use field::FieldSpec;

/// Top-level metadata from a map's `rom.tsv`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RomMeta {
  /// Human-readable name of the ROM this map describes.
  pub name: String,
  /// Expected size of the ROM data in bytes, excluding any header.
  pub size: Option<u64>,
  /// Expected SHA-1 of the image, as lowercase hex. Informational; ROM
  /// identification by hash is a front-end concern.
  pub sha1: Option<String>,
  /// Version string of the map itself.
  pub map_version: Option<String>,
  /// Length in bytes of a leading header the map expects the file to
  /// carry. Offsets elsewhere in the map are relative to its end.
  pub header: u64,
  /// Keys this library does not interpret, preserved for front ends.
  pub extra: BTreeMap<String, String>,
}

impl RomMeta {
  fn from_sheet(sheet: &Sheet) -> Result<RomMeta> {
    let mut meta = RomMeta::default();
    for row in sheet.rows() {
      let key = row.get("key").trim();
      let value = row.get("value").trim();
      match key {
        "name" => meta.name = value.to_owned(),
        "size" => {
          meta.size = Some(tsv::parse_u64(value).ok_or_else(|| {
            Error::schema(format!("rom.tsv: bad size '{}'", value))
          })?);
        }
        "sha1" => meta.sha1 = Some(value.to_owned()),
        "map_version" => meta.map_version = Some(value.to_owned()),
        "header" => {
          meta.header = tsv::parse_u64(value).ok_or_else(|| {
            Error::schema(format!("rom.tsv: bad header '{}'", value))
          })?;
        }
        "" => {}
        other => {
          meta.extra.insert(other.to_owned(), value.to_owned());
        }
      }
    }
    Ok(meta)
  }
}

/// One table declaration from `tables.tsv`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TableSpec {
  /// Identifier, unique among tables.
  pub id: String,
  /// Human-readable name. Defaults to the id.
  pub name: String,
  /// Element type: a primitive or custom type name, or a struct id.
  pub type_name: String,
  /// ROM offset of the table (of item zero for direct tables, of the
  /// pointer base for indexed ones), in bytes.
  pub offset: u64,
  /// Number of items.
  pub count: usize,
  /// Distance between items in bytes for direct tables; the element size
  /// for primitive-typed tables. Defaults to the struct size for struct
  /// tables.
  pub stride: Option<u64>,
  /// Id of the table holding this table's pointers, if indexed.
  pub index: Option<String>,
  /// Bias subtracted from each value read out of this table when it
  /// serves as a pointer index. This is how raw console-address pointer
  /// tables declare their zero point.
  pub adjust: i64,
  /// Display hint for primitive-typed tables (a codec id for string
  /// types, `hex` and friends for integers).
  pub display: String,
  /// Free-form notes from the map author.
  pub comment: String,
}

impl TableSpec {
  fn from_row(row: tsv::Row) -> Result<TableSpec> {
    let at = |what: String| Error::schema(format!("tables.tsv row {}: {}", row.index() + 1, what));
    let id = row.get("id").trim().to_owned();
    if id.is_empty() {
      return Err(at("missing id".to_owned()));
    }
    let name = match row.get("name").trim() {
      "" => id.clone(),
      name => name.to_owned(),
    };
    let type_name = row.get("type").trim().to_owned();
    if type_name.is_empty() {
      return Err(at("missing type".to_owned()));
    }
    let offset = tsv::parse_u64(row.get("offset"))
      .ok_or_else(|| at(format!("bad offset '{}'", row.get("offset"))))?;
    let count = tsv::parse_u64(row.get("count"))
      .ok_or_else(|| at(format!("bad count '{}'", row.get("count"))))?
      as usize;
    let stride = match row.get("stride").trim() {
      "" => None,
      cell => Some(tsv::parse_u64(cell).ok_or_else(|| at(format!("bad stride '{}'", cell)))?),
    };
    let index = match row.get("index").trim() {
      "" => None,
      cell => Some(cell.to_owned()),
    };
    let adjust = match row.get("adjust").trim() {
      "" => 0,
      cell => tsv::parse_i64(cell).ok_or_else(|| at(format!("bad adjust '{}'", cell)))?,
    };
    Ok(TableSpec {
      id,
      name,
      type_name,
      offset,
      count,
      stride,
      index,
      adjust,
      display: row.get("display").trim().to_owned(),
      comment: row.get("comment").to_owned(),
    })
  }
}

/// One entity declaration from `entities.tsv`: a named join of tables.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntitySpec {
  /// The entity's name; also the stem of its dump file.
  pub name: String,
  /// Ids of the joined tables, in column order.
  pub tables: Vec<String>,
}

/// A value-to-symbol mapping from `enums/*.tsv`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EnumDef {
  /// The enum's id (the stem of its declaration file).
  pub id: String,
  by_value: BTreeMap<u64, String>,
  by_name: HashMap<String, u64>,
}

impl EnumDef {
  /// Builds an enum from (value, symbol) pairs. The mapping must be
  /// bijective over its domain.
  pub fn new(id: &str, pairs: impl IntoIterator<Item = (u64, String)>) -> Result<EnumDef> {
    let mut by_value = BTreeMap::new();
    let mut by_name = HashMap::new();
    for (value, name) in pairs {
      if name.is_empty() {
        return Err(Error::schema(format!("enum '{}': value {} has no name", id, value)));
      }
      if by_value.insert(value, name.clone()).is_some() || by_name.insert(name.clone(), value).is_some() {
        return Err(Error::schema(format!("enum '{}': '{}'={} is not bijective", id, name, value)));
      }
    }
    Ok(EnumDef { id: id.to_owned(), by_value, by_name })
  }

  fn from_sheet(id: &str, sheet: &Sheet) -> Result<EnumDef> {
    let mut pairs = Vec::with_capacity(sheet.len());
    for row in sheet.rows() {
      let value = tsv::parse_u64(row.get("value")).ok_or_else(|| {
        Error::schema(format!("enum '{}' row {}: bad value '{}'", id, row.index() + 1, row.get("value")))
      })?;
      pairs.push((value, row.get("name").trim().to_owned()));
    }
    EnumDef::new(id, pairs)
  }

  /// Renders a value: its symbol, or the bare integer for values outside
  /// the defined domain.
  pub fn render(&self, value: u64) -> String {
    match self.by_value.get(&value) {
      Some(name) => name.clone(),
      None => value.to_string(),
    }
  }

  /// Parses a symbol or bare integer back to a value.
  pub fn parse(&self, text: &str) -> Option<u64> {
    self.by_name.get(text.trim()).copied().or_else(|| tsv::parse_u64(text))
  }
}

/// A loaded, validated ROM map.
#[derive(Clone, Debug)]
pub struct RomMap {
  /// Top-level metadata.
  pub meta: RomMeta,
  /// The map's own primitive type registry.
  pub types: TypeRegistry,
  /// Compiled structs, by id.
  pub structs: HashMap<String, StructDef>,
  /// Table declarations, in file order.
  pub tables: Vec<TableSpec>,
  /// Enums, by id.
  pub enums: HashMap<String, EnumDef>,
  /// Text codecs, by id. Always contains `ascii`.
  pub codecs: HashMap<String, Codec>,
  /// Entity joins, in file order.
  pub entities: Vec<EntitySpec>,
}

impl RomMap {
  /// Loads a map from a directory.
  pub fn load(dir: impl AsRef<Path>) -> Result<RomMap> {
    Self::load_with(dir, |_| Ok(()))
  }

  /// Loads a map from a directory, letting `hook` register custom type
  /// names before any struct is compiled.
  pub fn load_with(
    dir: impl AsRef<Path>,
    hook: impl FnOnce(&mut TypeRegistry) -> Result<()>,
  ) -> Result<RomMap> {
    let dir = dir.as_ref();
    debug!("loading map from {}", dir.display());

    let meta = match read_optional(&dir.join("rom.tsv"))? {
      Some(text) => RomMeta::from_sheet(&Sheet::parse(&text))?,
      None => {
        warn!("{}: no rom.tsv, using empty metadata", dir.display());
        RomMeta::default()
      }
    };

    let mut types = TypeRegistry::new();
    hook(&mut types)?;

    let mut codecs = HashMap::new();
    for (stem, text) in read_dir_files(&dir.join("codecs"), "tbl")? {
      codecs.insert(stem.clone(), Codec::parse(&stem, &text)?);
    }

    let mut enums = HashMap::new();
    for (stem, text) in read_dir_files(&dir.join("enums"), "tsv")? {
      enums.insert(stem.clone(), EnumDef::from_sheet(&stem, &Sheet::parse(&text))?);
    }

    let mut struct_decls = Vec::new();
    for (stem, text) in read_dir_files(&dir.join("structs"), "tsv")? {
      let sheet = Sheet::parse(&text);
      let mut fields = Vec::with_capacity(sheet.len());
      for row in sheet.rows() {
        fields.push(FieldSpec::from_row(&stem, row)?);
      }
      struct_decls.push((stem, fields));
    }

    let mut tables = Vec::new();
    if let Some(text) = read_optional(&dir.join("tables.tsv"))? {
      for row in Sheet::parse(&text).rows() {
        tables.push(TableSpec::from_row(row)?);
      }
    }

    let mut entities = Vec::new();
    if let Some(text) = read_optional(&dir.join("entities.tsv"))? {
      for row in Sheet::parse(&text).rows() {
        let name = row.get("name").trim().to_owned();
        if name.is_empty() {
          return Err(Error::schema(format!("entities.tsv row {}: missing name", row.index() + 1)));
        }
        let table_ids: Vec<String> = row
          .get("tables")
          .split(',')
          .map(|t| t.trim().to_owned())
          .filter(|t| !t.is_empty())
          .collect();
        entities.push(EntitySpec { name, tables: table_ids });
      }
    }

    Self::assemble(meta, types, struct_decls, tables, enums, codecs, entities)
  }

  /// Builds and validates a map from already-parsed parts. The loader
  /// funnels through here; tests can too.
  pub fn assemble(
    meta: RomMeta,
    types: TypeRegistry,
    struct_decls: Vec<(String, Vec<FieldSpec>)>,
    tables: Vec<TableSpec>,
    enums: HashMap<String, EnumDef>,
    mut codecs: HashMap<String, Codec>,
    entities: Vec<EntitySpec>,
  ) -> Result<RomMap> {
    codecs.entry("ascii".to_owned()).or_insert_with(Codec::ascii);
    let structs = structure::compile_all(&struct_decls, &types, &enums, &codecs)?;
    let map = RomMap { meta, types, structs, tables, enums, codecs, entities };
    map.validate()?;
    Ok(map)
  }

  /// Looks up a table declaration by id.
  pub fn table_spec(&self, id: &str) -> Option<&TableSpec> {
    self.tables.iter().find(|t| t.id == id)
  }

  /// Looks up an entity declaration by name.
  pub fn entity_spec(&self, name: &str) -> Option<&EntitySpec> {
    self.entities.iter().find(|e| e.name == name)
  }

  /// The element size of a table, in bytes.
  pub fn table_stride(&self, spec: &TableSpec) -> Result<u64> {
    if let Some(stride) = spec.stride {
      return Ok(stride);
    }
    match self.structs.get(&spec.type_name) {
      Some(def) => Ok((def.width_bits + 7) / 8),
      None => Err(Error::schema(format!(
        "table '{}' needs an explicit stride for type '{}'",
        spec.id, spec.type_name
      ))),
    }
  }

  fn validate(&self) -> Result<()> {
    for (n, table) in self.tables.iter().enumerate() {
      if self.tables[..n].iter().any(|t| t.id == table.id) {
        return Err(Error::schema(format!("duplicate table id '{}'", table.id)));
      }
      let is_struct = self.structs.contains_key(&table.type_name);
      let prim = self.types.lookup(&table.type_name);
      if !is_struct && prim.is_none() {
        return Err(Error::schema(format!(
          "table '{}': unknown type '{}'",
          table.id, table.type_name
        )));
      }
      let stride = self.table_stride(table)?;
      if stride == 0 {
        return Err(Error::schema(format!("table '{}': zero stride", table.id)));
      }
      if let Some(def) = self.structs.get(&table.type_name) {
        if stride * 8 < def.width_bits {
          return Err(Error::schema(format!(
            "table '{}': stride {} too small for struct '{}'",
            table.id, stride, def.id
          )));
        }
      }
      if let Some(prim) = prim {
        if prim.kind.is_string() {
          let id = if table.display.is_empty() { "ascii" } else { &table.display };
          match self.codecs.get(id) {
            None => {
              return Err(Error::schema(format!("table '{}': unknown codec '{}'", table.id, id)));
            }
            Some(codec) if prim.kind == TypeKind::Strz && !codec.has_terminator() => {
              return Err(Error::schema(format!(
                "table '{}': codec '{}' declares no terminator",
                table.id, id
              )));
            }
            Some(_) => {}
          }
        }
        if prim.kind.is_integer() && stride * 8 > 64 {
          return Err(Error::schema(format!("table '{}': integer items wider than 64 bits", table.id)));
        }
      }
      if let Some(index) = &table.index {
        let index = self.table_spec(index).ok_or_else(|| {
          Error::schema(format!("table '{}': unknown index table '{}'", table.id, index))
        })?;
        let kind = self.types.lookup(&index.type_name);
        if !kind.map(|p| p.kind.is_integer()).unwrap_or(false) {
          return Err(Error::schema(format!(
            "table '{}': index table '{}' is not integer-typed",
            table.id, index.id
          )));
        }
        if index.index.is_some() {
          return Err(Error::schema(format!(
            "table '{}': index table '{}' is itself indexed",
            table.id, index.id
          )));
        }
        if index.count < table.count {
          return Err(Error::schema(format!(
            "table '{}': index table '{}' has only {} entries for {} items",
            table.id, index.id, index.count, table.count
          )));
        }
      }
    }

    for (n, entity) in self.entities.iter().enumerate() {
      if self.entities[..n].iter().any(|e| e.name == entity.name) {
        return Err(Error::schema(format!("duplicate entity '{}'", entity.name)));
      }
      if entity.tables.is_empty() {
        return Err(Error::schema(format!("entity '{}' joins no tables", entity.name)));
      }
      let mut count = None;
      for id in &entity.tables {
        let table = self.table_spec(id).ok_or_else(|| {
          Error::schema(format!("entity '{}': unknown table '{}'", entity.name, id))
        })?;
        match count {
          None => count = Some(table.count),
          Some(count) if count != table.count => {
            return Err(Error::schema(format!(
              "entity '{}': tables disagree on row count ({} vs {})",
              entity.name, count, table.count
            )));
          }
          Some(_) => {}
        }
      }
    }

    for def in self.structs.values() {
      for field in &def.fields {
        if let Some(target) = &field.spec.ref_target {
          let known = self.table_spec(target).is_some() || self.entity_spec(target).is_some();
          if !known {
            return Err(Error::schema(format!(
              "{}.{}: unknown ref target '{}'",
              def.id, field.spec.id, target
            )));
          }
        }
      }
    }

    // Overlapping direct tables usually mean a map typo, but shared
    // regions are legitimate, so only warn. Indexed tables have no
    // static span to check.
    let mut endpoints = Vec::new();
    for table in self.tables.iter().filter(|t| t.index.is_none()) {
      let stride = self.table_stride(table)?;
      let start = table.offset;
      let end = start + stride * table.count as u64;
      endpoints.push((start, end, table.id.as_str()));
    }
    endpoints.sort();
    for pair in endpoints.windows(2) {
      if pair[1].0 < pair[0].1 {
        warn!("tables '{}' and '{}' overlap", pair[0].2, pair[1].2);
      }
    }

    Ok(())
  }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
  match fs::read_to_string(path) {
    Ok(text) => Ok(Some(text)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}

/// Reads every `*.ext` file of a directory, as (stem, contents), sorted
/// by name. A missing directory reads as empty.
fn read_dir_files(dir: &Path, ext: &str) -> Result<Vec<(String, String)>> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e.into()),
  };
  let mut paths: Vec<PathBuf> = entries
    .collect::<std::io::Result<Vec<_>>>()?
    .into_iter()
    .map(|entry| entry.path())
    .filter(|path| path.extension().map(|e| e == ext).unwrap_or(false))
    .collect();
  paths.sort();
  let mut out = Vec::with_capacity(paths.len());
  for path in paths {
    let stem = path
      .file_stem()
      .and_then(|s| s.to_str())
      .ok_or_else(|| Error::schema(format!("unusable file name: {}", path.display())))?
      .to_owned();
    out.push((stem, fs::read_to_string(&path)?));
  }
  Ok(out)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn meta_parsing() {
    let sheet = Sheet::parse(
      "key\tvalue\nname\tExample Quest\nsize\t0x40000\nheader\t512\nregion\tUS\n",
    );
    let meta = RomMeta::from_sheet(&sheet).unwrap();
    assert_eq!(meta.name, "Example Quest");
    assert_eq!(meta.size, Some(0x40000));
    assert_eq!(meta.header, 512);
    assert_eq!(meta.extra.get("region").map(String::as_str), Some("US"));
  }

  #[test]
  fn enum_passthrough() {
    let sheet = Sheet::parse("value\tname\n0\tnone\n1\tfire\n2\tice\n");
    let def = EnumDef::from_sheet("element", &sheet).unwrap();
    assert_eq!(def.render(1), "fire");
    assert_eq!(def.render(9), "9");
    assert_eq!(def.parse("ice"), Some(2));
    assert_eq!(def.parse("9"), Some(9));
  }

  #[test]
  fn enum_must_be_bijective() {
    let sheet = Sheet::parse("value\tname\n0\tnone\n0\tzero\n");
    assert!(EnumDef::from_sheet("bad", &sheet).is_err());
  }

  #[test]
  fn entity_counts_must_agree() {
    let tables = vec![
      TableSpec {
        id: "a".into(),
        name: "a".into(),
        type_name: "uint".into(),
        offset: 0,
        count: 4,
        stride: Some(1),
        index: None,
        adjust: 0,
        display: String::new(),
        comment: String::new(),
      },
      TableSpec {
        id: "b".into(),
        name: "b".into(),
        type_name: "uint".into(),
        offset: 0x10,
        count: 5,
        stride: Some(1),
        index: None,
        adjust: 0,
        display: String::new(),
        comment: String::new(),
      },
    ];
    let entities = vec![EntitySpec { name: "thing".into(), tables: vec!["a".into(), "b".into()] }];
    let err = RomMap::assemble(
      RomMeta::default(),
      TypeRegistry::new(),
      Vec::new(),
      tables,
      HashMap::new(),
      HashMap::new(),
      entities,
    );
    assert!(err.is_err());
  }
}
