//! The ROM object: the owner of the byte buffer and everything over it.
//!
//! A [`Rom`] couples an image with a loaded map. It keeps two copies of
//! the file: the pristine original and the working buffer that edits land
//! in, so a patch is always just the difference between the two. Tables
//! and entities are materialised on demand and borrow the ROM for each
//! operation.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::dump;
use crate::dump::RefIndex;
use crate::dump::RefNames;
use crate::error::Error;
use crate::error::Result;
use crate::map::RomMap;
use crate::patch::Patch;
use crate::structure::FieldDef;
use crate::structure::StructView;
use crate::table::Entity;
use crate::table::Table;
use crate::tsv::Sheet;
use crate::tsv;
use crate::value::Value;

/// What a dereferenced pointer or cross-reference resolves to.
pub enum RowRef<'m> {
  /// A row of a struct-typed table.
  Struct(StructView<'m>),
  /// The value of a row of a primitive-typed table.
  Prim(Value),
}

/// A ROM image joined with its map.
pub struct Rom {
  map: RomMap,
  file: Vec<u8>,
  orig: Vec<u8>,
  strict: bool,
}

impl Rom {
  /// Wraps an image in a ROM.
  ///
  /// The image must at least cover the header the map declares. A size
  /// mismatch against the map's metadata is only a warning; map authors
  /// iterate against variant dumps all the time.
  pub fn new(file: Vec<u8>, map: RomMap) -> Result<Rom> {
    if (file.len() as u64) < map.meta.header {
      return Err(Error::schema(format!(
        "image is {} bytes, smaller than the declared {}-byte header",
        file.len(),
        map.meta.header
      )));
    }
    if let Some(size) = map.meta.size {
      let data_len = file.len() as u64 - map.meta.header;
      if data_len != size {
        warn!("map expects {} data bytes, image has {}", size, data_len);
      }
    }
    let orig = file.clone();
    Ok(Rom { map, file, orig, strict: false })
  }

  /// Reads an image from disk and wraps it.
  pub fn from_file(path: impl AsRef<Path>, map: RomMap) -> Result<Rom> {
    Rom::new(fs::read(path)?, map)
  }

  /// Sets strict mode, which promotes dump-time warnings (bad pointers,
  /// undecodable values) to errors. Builds are always strict.
  pub fn strict(mut self, strict: bool) -> Rom {
    self.strict = strict;
    self
  }

  /// The loaded map.
  pub fn map(&self) -> &RomMap {
    &self.map
  }

  /// The working image, header included.
  pub fn bytes(&self) -> &[u8] {
    &self.file
  }

  /// The image as it was when loaded, header included.
  pub fn original_bytes(&self) -> &[u8] {
    &self.orig
  }

  /// The working ROM data, with any header stripped.
  pub fn data(&self) -> &[u8] {
    &self.file[self.map.meta.header as usize..]
  }

  /// Materialises a table by id.
  pub fn table(&self, id: &str) -> Result<Table<'_>> {
    let spec = self
      .map
      .table_spec(id)
      .ok_or_else(|| Error::schema(format!("no table with id '{}'", id)))?;
    Table::new(&self.map, spec)
  }

  /// Materialises an entity by name.
  pub fn entity(&self, name: &str) -> Result<Entity<'_>> {
    let spec = self
      .map
      .entity_spec(name)
      .ok_or_else(|| Error::schema(format!("no entity named '{}'", name)))?;
    Entity::new(&self.map, spec)
  }

  /// Names of the map's entities, in declaration order.
  pub fn entity_names(&self) -> impl Iterator<Item = &str> {
    self.map.entities.iter().map(|e| e.name.as_str())
  }

  /// Resolves a cross-reference or pointer field's integer to the row it
  /// names.
  pub fn dereference(&self, field: &FieldDef, value: u64) -> Result<RowRef<'_>> {
    let target = field.spec.ref_target.as_deref().ok_or_else(|| {
      Error::schema(format!("field '{}' references nothing", field.spec.id))
    })?;
    let table = match self.map.entity_spec(target) {
      Some(espec) => {
        let first = espec.tables.first().ok_or_else(|| {
          Error::schema(format!("entity '{}' joins no tables", target))
        })?;
        self.table(first)?
      }
      None => self.table(target)?,
    };
    let row = value as usize;
    if row >= table.len() {
      return Err(Error::UnknownReference {
        name: value.to_string(),
        target: target.to_owned(),
      });
    }
    match table.struct_def() {
      Some(_) => Ok(RowRef::Struct(table.view(self.data(), row, self.strict)?)),
      None => Ok(RowRef::Prim(table.get_prim(self.data(), row, self.strict)?)),
    }
  }

  /// Every target named by a `ref` field anywhere in the map.
  fn ref_targets(&self) -> HashSet<String> {
    self
      .map
      .structs
      .values()
      .flat_map(|def| def.fields.iter())
      .filter_map(|f| f.spec.ref_target.clone())
      .collect()
  }

  /// Row names of a reference target, reading the current data.
  ///
  /// A name that repeats keeps only its first row; later rows read as
  /// nameless so their references dump as bare indices and round-trip.
  fn target_names(&self, target: &str) -> Result<Vec<Option<String>>> {
    let mut names: Vec<Option<String>> = Vec::new();
    if let Some(espec) = self.map.entity_spec(target) {
      let entity = Entity::new(&self.map, espec)?;
      for row in 0..entity.len() {
        names.push(entity.name_of(self.data(), &self.map, row)?);
      }
    } else {
      let table = self.table(target)?;
      match table.struct_def() {
        Some(def) => {
          let field = def.name_field();
          for row in 0..table.len() {
            names.push(match field {
              Some(field) => {
                let view = table.view(self.data(), row, false)?;
                let value = view.get(self.data(), field, &self.map)?;
                Some(value.to_string().trim_end().to_owned())
              }
              None => None,
            });
          }
        }
        None => {
          let named = table.prim_field().map(|f| f.spec.is_name()).unwrap_or(false);
          for row in 0..table.len() {
            names.push(if named {
              Some(table.get_prim(self.data(), row, false)?.to_string().trim_end().to_owned())
            } else {
              None
            });
          }
        }
      }
    }

    let mut seen = HashSet::new();
    for name in names.iter_mut() {
      match name {
        Some(text) if text.is_empty() || !seen.insert(text.clone()) => *name = None,
        _ => {}
      }
    }
    Ok(names)
  }

  /// Dumps every entity to `<dir>/<entity>.tsv`.
  pub fn dump(&self, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut ref_names = RefNames::new();
    for target in self.ref_targets() {
      let names = self.target_names(&target)?;
      ref_names.insert(target, names);
    }

    for espec in &self.map.entities {
      let entity = Entity::new(&self.map, espec)?;
      info!("dumping {} ({} rows)", espec.name, entity.len());
      let text = dump::render_entity(&self.map, &entity, self.data(), &ref_names, self.strict)?;
      fs::write(dir.join(format!("{}.tsv", espec.name)), text)?;
    }
    Ok(())
  }

  /// Loads edited dump files back into the working buffer.
  ///
  /// The whole load is staged first: every file is read, every cell
  /// parsed and resolved, and only if all of that succeeds is a single
  /// byte of the working buffer replaced. A failed load changes nothing.
  ///
  /// Cross-reference names resolve against the name columns of the files
  /// being loaded (falling back to the current data for targets that
  /// have no file), so renaming a row and re-pointing its references in
  /// the same edit works.
  pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();

    // Pass one: read the files and work out row order.
    let mut loaded: Vec<(usize, Sheet, Vec<usize>)> = Vec::new();
    for (e, espec) in self.map.entities.iter().enumerate() {
      let path = dir.join(format!("{}.tsv", espec.name));
      let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
          debug!("no {}, skipping", path.display());
          continue;
        }
        Err(err) => return Err(err.into()),
      };
      let sheet = Sheet::parse(&text);
      let entity = Entity::new(&self.map, espec)?;
      let mut order = Vec::with_capacity(sheet.len());
      for row in sheet.rows() {
        let target = match row.get(dump::IDX_COLUMN) {
          "" => row.index(),
          cell => tsv::parse_u64(cell).ok_or_else(|| Error::UnparseableValue {
            row: row.index(),
            column: dump::IDX_COLUMN.to_owned(),
            text: cell.to_owned(),
            reason: "expected a row index".to_owned(),
          })? as usize,
        };
        if target >= entity.len() {
          warn!("{}: row {} beyond the {} declared rows, ignored", espec.name, target, entity.len());
        }
        order.push(target);
      }
      loaded.push((e, sheet, order));
    }

    // Pass two: build the name maps references resolve through,
    // preferring the incoming files over the current data.
    let mut ref_index = RefIndex::new();
    for target in self.ref_targets() {
      let from_file = self.map.entity_spec(&target).and_then(|espec| {
        let e = self.map.entities.iter().position(|s| s.name == espec.name)?;
        let (_, sheet, order) = loaded.iter().find(|(i, _, _)| *i == e)?;
        let entity = Entity::new(&self.map, espec).ok()?;
        let header = entity.name_column().map(|c| c.header.clone())?;
        let mut names = HashMap::new();
        for (n, row) in sheet.rows().enumerate() {
          let name = row.get(&header).trim();
          if !name.is_empty() && order[n] < entity.len() {
            names.entry(name.to_owned()).or_insert(order[n]);
          }
        }
        Some(names)
      });
      let names = match from_file {
        Some(names) => names,
        None => {
          let mut names = HashMap::new();
          for (row, name) in self.target_names(&target)?.into_iter().enumerate() {
            if let Some(name) = name {
              names.entry(name).or_insert(row);
            }
          }
          names
        }
      };
      ref_index.insert(target, names);
    }

    // Pass three: parse every cell into a staged write set.
    struct Write<'m> {
      entity: Entity<'m>,
      name: String,
      writes: Vec<(usize, usize, Value)>,
    }
    let mut staged = Vec::new();
    for (e, sheet, order) in &loaded {
      let espec = &self.map.entities[*e];
      let entity = Entity::new(&self.map, espec)?;
      let mut writes = Vec::new();
      for (n, row) in sheet.rows().enumerate() {
        let target_row = order[n];
        if target_row >= entity.len() {
          continue;
        }
        for (c, col) in entity.columns().iter().enumerate() {
          if !sheet.has_column(&col.header) {
            continue;
          }
          let text = row.get(&col.header);
          let field = entity.field_def(col)?;
          let value = dump::parse_cell(&self.map, field, text, &ref_index).map_err(|err| {
            match err {
              Error::UnknownReference { .. } => err,
              other => Error::UnparseableValue {
                row: target_row,
                column: col.header.clone(),
                text: text.to_owned(),
                reason: other.to_string(),
              },
            }
          })?;
          writes.push((target_row, c, value));
        }
      }
      staged.push(Write { entity, name: espec.name.clone(), writes });
    }

    // Pass four: apply to a scratch copy, then swap it in.
    let mut scratch = self.file.clone();
    let header = self.map.meta.header as usize;
    for stage in &staged {
      info!("loading {} ({} cells)", stage.name, stage.writes.len());
      for (row, c, value) in &stage.writes {
        let col = &stage.entity.columns()[*c];
        stage
          .entity
          .set(&mut scratch[header..], &self.map, *row, col, value, true)?;
      }
    }
    self.file = scratch;
    Ok(())
  }

  /// The canonical patch expressing every edit so far.
  pub fn diff(&self) -> Patch {
    Patch::from_diff(&self.orig, &self.file)
  }

  /// Applies a patch to the working buffer.
  pub fn apply_patch(&mut self, patch: &Patch) -> Result<()> {
    patch.apply(&mut self.file)
  }

  /// Encodes the current edits as a binary IPS patch. The original image
  /// is on hand, so blocks colliding with the end marker are handled
  /// automatically.
  pub fn write_ips(&self) -> Result<Vec<u8>> {
    self.diff().to_ips(Some(&self.orig))
  }

  /// Encodes the current edits as a textual IPST patch.
  pub fn write_ipst(&self) -> Result<String> {
    self.diff().to_ipst(Some(&self.orig))
  }
}

#[cfg(test)]
mod test {
  use std::fs;

  use super::*;
  use crate::map::field::FieldSpec;
  use crate::map::field::Origin;
  use crate::map::field::Presence;
  use crate::map::field::Unit;
  use crate::map::EntitySpec;
  use crate::map::EnumDef;
  use crate::map::RomMeta;
  use crate::map::TableSpec;
  use crate::ty::TypeRegistry;

  fn field(id: &str, ty: &str, offset: u64, size: u64) -> FieldSpec {
    FieldSpec {
      id: id.into(),
      name: id.into(),
      type_name: ty.into(),
      origin: Origin::Parent,
      unit: Unit::Bytes,
      offset,
      size,
      ref_target: None,
      display: String::new(),
      presence: Presence::Required,
      comment: String::new(),
    }
  }

  fn flag(id: &str, offset: u64, letter: char) -> FieldSpec {
    let mut f = field(id, "bin", offset, 1);
    f.unit = Unit::Bits;
    f.display = letter.to_string();
    f
  }

  fn table(id: &str, ty: &str, offset: u64, count: usize, stride: Option<u64>) -> TableSpec {
    TableSpec {
      id: id.into(),
      name: id.into(),
      type_name: ty.into(),
      offset,
      count,
      stride,
      index: None,
      adjust: 0,
      display: String::new(),
      comment: String::new(),
    }
  }

  fn sample_map() -> RomMap {
    let monster = vec![
      field("name", "str", 0, 6),
      field("hp", "uintle", 6, 2),
      field("flags", "mflags", 8, 1),
      {
        let mut f = field("kind", "uint", 9, 1);
        f.display = "kind".into();
        f
      },
    ];
    let mflags: Vec<FieldSpec> = "abcdefgh"
      .chars()
      .enumerate()
      .map(|(i, letter)| flag(&format!("f{}", letter), i as u64, letter))
      .collect();
    let attack = vec![field("power", "uint", 0, 1), {
      let mut f = field("target", "uint", 1, 1);
      f.ref_target = Some("monsters".into());
      f
    }];

    let mut prices = table("prices", "uintle", 0x70, 3, Some(2));
    prices.index = Some("price_ptr".into());

    let entity = |name: &str| EntitySpec { name: name.into(), tables: vec![name.into()] };

    RomMap::assemble(
      RomMeta::default(),
      TypeRegistry::new(),
      vec![
        ("monster".into(), monster),
        ("mflags".into(), mflags),
        ("attack".into(), attack),
      ],
      vec![
        table("monsters", "monster", 0x00, 3, None),
        table("attacks", "attack", 0x40, 3, None),
        table("price_ptr", "uintle", 0x60, 3, Some(2)),
        prices,
      ],
      [(
        "kind".to_owned(),
        EnumDef::new(
          "kind",
          [(0, "none".to_owned()), (1, "beast".to_owned()), (2, "undead".to_owned())],
        )
        .unwrap(),
      )]
      .into_iter()
      .collect(),
      Default::default(),
      vec![entity("monsters"), entity("attacks"), entity("prices")],
    )
    .unwrap()
  }

  fn sample_image() -> Vec<u8> {
    let mut img = vec![0u8; 0x80];
    let monsters: [(&[u8; 6], u16, u8, u8); 3] = [
      (b"Slime ", 20, 0x15, 1),
      (b"Bat   ", 5, 0x00, 1),
      (b"Goblin", 30, 0x02, 2),
    ];
    for (i, (name, hp, flags, kind)) in monsters.iter().enumerate() {
      let base = i * 10;
      img[base..base + 6].copy_from_slice(&name[..]);
      img[base + 6..base + 8].copy_from_slice(&hp.to_le_bytes());
      img[base + 8] = *flags;
      img[base + 9] = *kind;
    }
    // (power, target) pairs.
    img[0x40..0x46].copy_from_slice(&[5, 0, 3, 2, 7, 1]);
    // Pointer table: items land at 0x70, 0x74, 0x72.
    img[0x60..0x66].copy_from_slice(&[0, 0, 4, 0, 2, 0]);
    img[0x70..0x76].copy_from_slice(&[0x10, 0, 0x20, 0, 0x30, 0]);
    img
  }

  fn sample_rom() -> Rom {
    Rom::new(sample_image(), sample_map()).unwrap()
  }

  #[test]
  fn dump_then_load_produces_empty_patch() {
    let dir = tempfile::tempdir().unwrap();
    let mut rom = sample_rom();
    rom.dump(dir.path()).unwrap();
    rom.load(dir.path()).unwrap();
    assert!(rom.diff().is_empty(), "unexpected changes: {:?}", rom.diff());
  }

  #[test]
  fn dump_renders_symbols_and_names() {
    let dir = tempfile::tempdir().unwrap();
    sample_rom().dump(dir.path()).unwrap();
    let monsters = fs::read_to_string(dir.path().join("monsters.tsv")).unwrap();
    assert!(monsters.contains("undead"), "{}", monsters);
    assert!(monsters.contains("AbCdEfgh"), "{}", monsters);
    let attacks = fs::read_to_string(dir.path().join("attacks.tsv")).unwrap();
    assert!(attacks.contains("Goblin"), "{}", attacks);
  }

  #[test]
  fn edited_dump_becomes_a_patch() {
    let dir = tempfile::tempdir().unwrap();
    let mut rom = sample_rom();
    rom.dump(dir.path()).unwrap();

    let path = dir.path().join("monsters.tsv");
    let text = fs::read_to_string(&path).unwrap().replace("\t20\t", "\t999\t");
    fs::write(&path, text).unwrap();

    rom.load(dir.path()).unwrap();
    let patch = rom.diff();
    // 999 is 0x03e7; both bytes of Slime's hp change.
    assert_eq!(patch.changes().collect::<Vec<_>>(), vec![(6, 0xe7), (7, 0x03)]);

    let mut rebuilt = rom.original_bytes().to_vec();
    patch.apply(&mut rebuilt).unwrap();
    assert_eq!(rebuilt, rom.bytes());
  }

  #[test]
  fn renaming_a_row_keeps_reference_indices() {
    let dir = tempfile::tempdir().unwrap();
    let mut rom = sample_rom();
    rom.dump(dir.path()).unwrap();

    for name in ["monsters.tsv", "attacks.tsv"] {
      let path = dir.path().join(name);
      let text = fs::read_to_string(&path).unwrap().replace("Goblin", "Orc");
      fs::write(&path, text).unwrap();
    }
    rom.load(dir.path()).unwrap();

    // The reference cell still resolves to row 2, so the attack bytes
    // are untouched; only the name bytes changed.
    assert_eq!(rom.bytes()[0x43], 2);
    assert_eq!(&rom.bytes()[20..26], b"Orc   ");
  }

  #[test]
  fn failed_load_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut rom = sample_rom();
    rom.dump(dir.path()).unwrap();

    let path = dir.path().join("monsters.tsv");
    let text = fs::read_to_string(&path).unwrap().replace("\t20\t", "\tlots\t");
    fs::write(&path, text).unwrap();

    match rom.load(dir.path()) {
      Err(Error::UnparseableValue { column, .. }) => assert_eq!(column, "hp"),
      other => panic!("expected UnparseableValue, got {:?}", other),
    }
    assert_eq!(rom.bytes(), rom.original_bytes());
  }

  #[test]
  fn indexed_table_addresses_through_pointers() {
    let map = sample_map();
    let rom = sample_rom();
    let prices = rom.table("prices").unwrap();
    assert_eq!(prices.item_offset(rom.data(), 0, true).unwrap(), 0x70);
    assert_eq!(prices.item_offset(rom.data(), 1, true).unwrap(), 0x74);
    assert_eq!(prices.item_offset(rom.data(), 2, true).unwrap(), 0x72);
    assert_eq!(prices.get_prim(rom.data(), 1, true).unwrap(), Value::Uint(0x30));

    // Changing item 1 touches exactly its pointed-to offset.
    let mut data = rom.data().to_vec();
    let spec = map.table_spec("prices").unwrap();
    let table = Table::new(&map, spec).unwrap();
    table.set_prim(&mut data, 1, &Value::Uint(0x31), true).unwrap();
    let patch = Patch::from_diff(rom.data(), &data);
    assert_eq!(patch.changes().collect::<Vec<_>>(), vec![(0x74, 0x31)]);
  }

  #[test]
  fn flag_string_writes_expected_bits() {
    let rom = sample_rom();
    let entity = rom.entity("monsters").unwrap();
    let col = entity
      .columns()
      .iter()
      .find(|c| c.header == "flags")
      .unwrap()
      .clone();
    let field = entity.field_def(&col).unwrap();
    let value = dump::parse_cell(rom.map(), field, "AbCdEfgh", &RefIndex::new()).unwrap();

    // Bits a, c and e set is 0b0001_0101 on row 1's flag byte.
    let mut data = rom.data().to_vec();
    entity.set(&mut data, rom.map(), 1, &col, &value, true).unwrap();
    assert_eq!(data[18], 0x15);
  }

  #[test]
  fn dereference_follows_references() {
    let rom = sample_rom();
    let entity = rom.entity("attacks").unwrap();
    let col = entity
      .columns()
      .iter()
      .find(|c| c.header == "target")
      .unwrap()
      .clone();
    let field = entity.field_def(&col).unwrap();
    let value = entity.get(rom.data(), rom.map(), 1, &col, true).unwrap();
    assert_eq!(value, Value::Uint(2));

    match rom.dereference(field, 2).unwrap() {
      RowRef::Struct(view) => {
        let name = view.def().field("name").unwrap();
        let value = view.get(rom.data(), name, rom.map()).unwrap();
        assert_eq!(value, Value::Str("Goblin".into()));
      }
      RowRef::Prim(_) => panic!("expected a struct row"),
    }
  }

  #[test]
  fn ips_output_round_trips_through_apply() {
    let dir = tempfile::tempdir().unwrap();
    let mut rom = sample_rom();
    rom.dump(dir.path()).unwrap();
    let path = dir.path().join("monsters.tsv");
    let text = fs::read_to_string(&path).unwrap().replace("beast", "undead");
    fs::write(&path, text).unwrap();
    rom.load(dir.path()).unwrap();

    let ips = rom.write_ips().unwrap();
    let patch = Patch::from_ips(&ips).unwrap();
    let mut rebuilt = rom.original_bytes().to_vec();
    patch.apply(&mut rebuilt).unwrap();
    assert_eq!(rebuilt, rom.bytes());
    assert_eq!(rom.bytes()[9], 2);
    assert_eq!(rom.bytes()[19], 2);
  }
}
