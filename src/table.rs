//! Tables and entity joins.
//!
//! A [`Table`] materialises one `tables.tsv` declaration over the ROM
//! data: a run of structs or primitives located either by stride or
//! through a pointer table. An [`Entity`] joins several tables that
//! describe the same logical thing into one row-addressed view, which is
//! what dumps and builds operate on.
//!
//! Tables are cheap to construct and hold no buffer; like struct views
//! they borrow the data for each operation.

use std::collections::HashMap;

use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::map::field::FieldSpec;
use crate::map::field::Origin;
use crate::map::field::Presence;
use crate::map::field::Unit;
use crate::map::EntitySpec;
use crate::map::RomMap;
use crate::map::TableSpec;
use crate::structure;
use crate::structure::Display;
use crate::structure::FieldDef;
use crate::structure::FieldTy;
use crate::structure::StructDef;
use crate::structure::StructView;
use crate::ty::PrimDef;
use crate::value::Value;

/// A table of structs or primitives over the ROM data.
pub struct Table<'m> {
  map: &'m RomMap,
  spec: &'m TableSpec,
  def: Option<&'m StructDef>,
  /// Synthesized single field for primitive-typed tables, paired with
  /// its resolved primitive.
  prim: Option<(FieldDef, PrimDef)>,
  stride: u64,
}

impl<'m> Table<'m> {
  /// Materialises the table declared by `spec`.
  pub fn new(map: &'m RomMap, spec: &'m TableSpec) -> Result<Table<'m>> {
    let stride = map.table_stride(spec)?;
    let def = map.structs.get(&spec.type_name);
    let prim = match def {
      Some(_) => None,
      None => {
        let field = FieldSpec {
          id: spec.id.clone(),
          name: spec.name.clone(),
          type_name: spec.type_name.clone(),
          origin: Origin::Parent,
          unit: Unit::Bytes,
          offset: 0,
          size: stride,
          ref_target: None,
          display: spec.display.clone(),
          presence: Presence::Required,
          comment: String::new(),
        };
        let field = structure::compile_prim_field(&field, &map.types, &map.enums, &map.codecs)?;
        let prim = match &field.ty {
          FieldTy::Prim(prim) => *prim,
          FieldTy::Struct(_) => {
            return Err(Error::schema(format!(
              "table '{}': type '{}' compiled as a struct",
              spec.id, spec.type_name
            )));
          }
        };
        Some((field, prim))
      }
    };
    Ok(Table { map, spec, def, prim, stride })
  }

  /// The declaration this table came from.
  pub fn spec(&self) -> &'m TableSpec {
    self.spec
  }

  /// Number of items.
  pub fn len(&self) -> usize {
    self.spec.count
  }

  /// Whether the table declares zero items.
  pub fn is_empty(&self) -> bool {
    self.spec.count == 0
  }

  /// Element size in bytes.
  pub fn stride(&self) -> u64 {
    self.stride
  }

  /// The struct layout of this table's items, for struct-typed tables.
  pub fn struct_def(&self) -> Option<&'m StructDef> {
    self.def
  }

  /// The synthesized field of this table's items, for primitive-typed
  /// tables.
  pub fn prim_field(&self) -> Option<&FieldDef> {
    self.prim.as_ref().map(|(field, _)| field)
  }

  /// ROM byte offset of item `i`.
  ///
  /// For an indexed table this reads the pointer table, applies its
  /// declared zero adjustment, and checks the result against this
  /// table's span. An out-of-span pointer fails in strict mode and warns
  /// in loose mode, where the raw position is used as-is.
  pub fn item_offset(&self, data: &[u8], i: usize, strict: bool) -> Result<u64> {
    if i >= self.spec.count {
      return Err(Error::schema(format!(
        "table '{}' has {} items, asked for {}",
        self.spec.id, self.spec.count, i
      )));
    }
    let index_spec = match &self.spec.index {
      None => return Ok(self.spec.offset + i as u64 * self.stride),
      Some(id) => self.map.table_spec(id).ok_or_else(|| {
        Error::schema(format!("index table '{}' vanished from the map", id))
      })?,
    };
    let index = Table::new(self.map, index_spec)?;
    let raw = index
      .get_prim(data, i, strict)?
      .as_uint()
      .ok_or_else(|| Error::schema(format!("index table '{}' is not integer-typed", index_spec.id)))?;
    let pointer = raw as i128 - index_spec.adjust as i128;
    if pointer < 0 {
      return Err(Error::PointerOutOfRange {
        table: self.spec.id.clone(),
        value: raw,
        start: self.spec.offset,
        end: self.span_end(),
      });
    }
    let offset = self.spec.offset + pointer as u64;
    let start = self.spec.offset;
    let end = self.span_end();
    if offset < start || offset >= end {
      if strict {
        return Err(Error::PointerOutOfRange {
          table: self.spec.id.clone(),
          value: offset,
          start,
          end,
        });
      }
      warn!(
        "table '{}': pointer {} lands at {:#x}, outside {:#x}..{:#x}",
        self.spec.id, i, offset, start, end
      );
    }
    Ok(offset)
  }

  /// One past the last ROM offset of this table's declared span.
  fn span_end(&self) -> u64 {
    self.spec.offset + self.stride * self.spec.count as u64
  }

  /// A struct view of item `i`. Fails for primitive-typed tables.
  pub fn view(&self, data: &[u8], i: usize, strict: bool) -> Result<StructView<'m>> {
    let def = self.def.ok_or_else(|| {
      Error::schema(format!("table '{}' holds primitives, not structs", self.spec.id))
    })?;
    Ok(StructView::new(def, self.item_offset(data, i, strict)? * 8))
  }

  /// Reads item `i` of a primitive-typed table.
  pub fn get_prim(&self, data: &[u8], i: usize, strict: bool) -> Result<Value> {
    let (field, prim) = self.prim.as_ref().ok_or_else(|| {
      Error::schema(format!("table '{}' holds structs, not primitives", self.spec.id))
    })?;
    let offset = self.item_offset(data, i, strict)? * 8;
    let codec = match &field.display {
      Display::Codec(id) => self.map.codecs.get(id),
      _ => None,
    };
    prim.read(data, offset, field.width_bits, codec)
  }

  /// Writes item `i` of a primitive-typed table.
  pub fn set_prim(&self, data: &mut [u8], i: usize, value: &Value, strict: bool) -> Result<()> {
    let (field, prim) = self.prim.as_ref().ok_or_else(|| {
      Error::schema(format!("table '{}' holds structs, not primitives", self.spec.id))
    })?;
    let offset = self.item_offset(data, i, strict)? * 8;
    let codec = match &field.display {
      Display::Codec(id) => self.map.codecs.get(id),
      _ => None,
    };
    prim.write(data, offset, field.width_bits, codec, value)
  }
}

/// One column of a joined entity.
#[derive(Clone, Debug)]
pub struct Column {
  /// Index into the entity's table list.
  pub table: usize,
  /// Index of the field within the table's struct, or `None` for the
  /// single value of a primitive-typed table.
  pub field: Option<usize>,
  /// Column header, disambiguated with the table id when two tables
  /// contribute the same field name.
  pub header: String,
}

/// Resolves a column to the compiled field behind it, against the
/// entity's table list. The join construction keeps `col.field` in step
/// with the kind of table it points at; a mismatch is a schema-level
/// inconsistency, not a panic.
fn column_field<'a, 'm>(tables: &'a [Table<'m>], col: &Column) -> Result<&'a FieldDef> {
  let table = tables.get(col.table).ok_or_else(|| {
    Error::schema(format!("column '{}' points at a missing table", col.header))
  })?;
  match col.field {
    Some(f) => {
      let def = table.struct_def().ok_or_else(|| {
        Error::schema(format!(
          "column '{}' expects struct items in table '{}'",
          col.header,
          table.spec().id
        ))
      })?;
      def.fields.get(f).ok_or_else(|| {
        Error::schema(format!("column '{}' is out of range in struct '{}'", col.header, def.id))
      })
    }
    None => table.prim_field().ok_or_else(|| {
      Error::schema(format!(
        "column '{}' expects primitive items in table '{}'",
        col.header,
        table.spec().id
      ))
    }),
  }
}

/// A named join of tables presenting one row per index.
pub struct Entity<'m> {
  spec: &'m EntitySpec,
  tables: Vec<Table<'m>>,
  columns: Vec<Column>,
  name_col: Option<usize>,
}

impl<'m> Entity<'m> {
  /// Materialises the entity declared by `spec`.
  pub fn new(map: &'m RomMap, spec: &'m EntitySpec) -> Result<Entity<'m>> {
    let mut tables = Vec::with_capacity(spec.tables.len());
    for id in &spec.tables {
      let table_spec = map.table_spec(id).ok_or_else(|| {
        Error::schema(format!("entity '{}': unknown table '{}'", spec.name, id))
      })?;
      tables.push(Table::new(map, table_spec)?);
    }

    // Gather (table, field, name), then disambiguate duplicated names.
    let mut raw: Vec<(usize, Option<usize>, String)> = Vec::new();
    for (t, table) in tables.iter().enumerate() {
      match table.struct_def() {
        Some(def) => {
          for (f, field) in def.fields.iter().enumerate() {
            raw.push((t, Some(f), field.spec.name.clone()));
          }
        }
        None => raw.push((t, None, table.spec().name.clone())),
      }
    }
    let columns = raw
      .iter()
      .map(|(t, f, name)| {
        let dup = raw.iter().filter(|(_, _, n)| n == name).count() > 1;
        let header = if dup {
          format!("{}.{}", tables[*t].spec().id, name)
        } else {
          name.clone()
        };
        Column { table: *t, field: *f, header }
      })
      .collect::<Vec<_>>();

    let mut name_col = None;
    for (i, col) in columns.iter().enumerate() {
      if column_field(&tables, col)?.spec.is_name() {
        name_col = Some(i);
        break;
      }
    }

    Ok(Entity { spec, tables, columns, name_col })
  }

  /// The declaration this entity came from.
  pub fn spec(&self) -> &'m EntitySpec {
    self.spec
  }

  /// Number of rows.
  pub fn len(&self) -> usize {
    self.tables.first().map(|t| t.len()).unwrap_or(0)
  }

  /// Whether the entity has no rows.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The joined columns, in table order then field order.
  pub fn columns(&self) -> &[Column] {
    &self.columns
  }

  /// The joined tables, in declaration order.
  pub fn tables(&self) -> &[Table<'m>] {
    &self.tables
  }

  /// The column holding row names, if the join has one.
  pub fn name_column(&self) -> Option<&Column> {
    self.name_col.map(|i| &self.columns[i])
  }

  /// The compiled field behind a column.
  pub fn field_def(&self, col: &Column) -> Result<&FieldDef> {
    column_field(&self.tables, col)
  }

  /// Reads one cell.
  pub fn get(
    &self,
    data: &[u8],
    map: &RomMap,
    row: usize,
    col: &Column,
    strict: bool,
  ) -> Result<Value> {
    let table = self.tables.get(col.table).ok_or_else(|| {
      Error::schema(format!("column '{}' points at a missing table", col.header))
    })?;
    match col.field {
      Some(_) => {
        let field = self.field_def(col)?;
        let view = table.view(data, row, strict)?;
        view.get(data, field, map)
      }
      None => table.get_prim(data, row, strict),
    }
  }

  /// Writes one cell. Writes land in the backing table the column came
  /// from.
  pub fn set(
    &self,
    data: &mut [u8],
    map: &RomMap,
    row: usize,
    col: &Column,
    value: &Value,
    strict: bool,
  ) -> Result<()> {
    let table = self.tables.get(col.table).ok_or_else(|| {
      Error::schema(format!("column '{}' points at a missing table", col.header))
    })?;
    match col.field {
      Some(_) => {
        let field = self.field_def(col)?;
        let view = table.view(data, row, strict)?;
        view.set(data, field, map, value)
      }
      None => table.set_prim(data, row, value, strict),
    }
  }

  /// The display name of one row, from the entity's name column.
  /// Trailing whitespace is trimmed, so padded fixed-length names
  /// compare cleanly.
  pub fn name_of(&self, data: &[u8], map: &RomMap, row: usize) -> Result<Option<String>> {
    let col = match self.name_col {
      Some(col) => &self.columns[col],
      None => return Ok(None),
    };
    let value = self.get(data, map, row, col, false)?;
    Ok(Some(value.to_string().trim_end().to_owned()))
  }

  /// Builds the name-to-row map used to resolve cross-references.
  /// Duplicate names keep the lowest row.
  pub fn name_map(&self, data: &[u8], map: &RomMap) -> Result<HashMap<String, usize>> {
    let mut names = HashMap::new();
    for row in 0..self.len() {
      if let Some(name) = self.name_of(data, map, row)? {
        names.entry(name).or_insert(row);
      }
    }
    Ok(names)
  }
}
