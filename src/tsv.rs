//! Reading and writing tab-separated tables.
//!
//! Both the map loader and the dump engine speak the same dialect: first
//! row is column headers, cells are separated by single tabs, lines end
//! in `\n` on write with `\r\n` accepted on read. There is no quoting;
//! cells that would contain a tab or newline are flattened to spaces on
//! write (and warned about), which keeps the files honest for any
//! spreadsheet tool.

use tracing::warn;

/// A parsed tab-separated table.
#[derive(Clone, Debug, Default)]
pub struct Sheet {
  columns: Vec<String>,
  rows: Vec<Vec<String>>,
}

impl Sheet {
  /// Parses a sheet from file text. Empty input gives an empty sheet.
  pub fn parse(text: &str) -> Sheet {
    let mut lines = text
      .lines()
      .map(|line| line.strip_suffix('\r').unwrap_or(line))
      .filter(|line| !line.is_empty());
    let columns = match lines.next() {
      Some(header) => header.split('\t').map(str::to_owned).collect(),
      None => return Sheet::default(),
    };
    let rows = lines
      .map(|line| line.split('\t').map(str::to_owned).collect())
      .collect();
    Sheet { columns, rows }
  }

  /// The column headers, in file order.
  pub fn columns(&self) -> &[String] {
    &self.columns
  }

  /// Whether a column is present.
  pub fn has_column(&self, name: &str) -> bool {
    self.columns.iter().any(|c| c == name)
  }

  /// Number of body rows.
  pub fn len(&self) -> usize {
    self.rows.len()
  }

  /// Whether the sheet has no body rows.
  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// Iterates over the body rows.
  pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
    (0..self.rows.len()).map(move |index| Row { sheet: self, index })
  }

  /// Gets one body row.
  pub fn row(&self, index: usize) -> Row<'_> {
    Row { sheet: self, index }
  }
}

/// A view of one row of a [`Sheet`].
#[derive(Copy, Clone, Debug)]
pub struct Row<'a> {
  sheet: &'a Sheet,
  index: usize,
}

impl<'a> Row<'a> {
  /// Zero-based index of this row within the sheet body.
  pub fn index(&self) -> usize {
    self.index
  }

  /// Gets a cell by column name. Missing columns and short rows read as
  /// the empty string.
  pub fn get(&self, column: &str) -> &'a str {
    self
      .sheet
      .columns
      .iter()
      .position(|c| c == column)
      .and_then(|i| self.sheet.rows[self.index].get(i))
      .map(String::as_str)
      .unwrap_or("")
  }
}

/// Renders a sheet from headers and rows.
pub fn write<C, R, V>(columns: C, rows: R) -> String
where
  C: IntoIterator,
  C::Item: AsRef<str>,
  R: IntoIterator<Item = Vec<V>>,
  V: AsRef<str>,
{
  let mut out = String::new();
  let header: Vec<String> = columns.into_iter().map(|c| flatten(c.as_ref())).collect();
  out.push_str(&header.join("\t"));
  out.push('\n');
  for row in rows {
    let cells: Vec<String> = row.iter().map(|c| flatten(c.as_ref())).collect();
    out.push_str(&cells.join("\t"));
    out.push('\n');
  }
  out
}

/// Replaces cell-breaking characters with spaces.
fn flatten(cell: &str) -> String {
  if cell.contains(['\t', '\n', '\r']) {
    warn!("flattening tab or newline inside cell {:?}", cell);
    cell.replace(['\t', '\n', '\r'], " ")
  } else {
    cell.to_owned()
  }
}

/// Parses an unsigned integer cell: decimal, or hex with an `0x` prefix.
pub fn parse_u64(cell: &str) -> Option<u64> {
  let cell = cell.trim();
  if let Some(hex) = cell.strip_prefix("0x").or_else(|| cell.strip_prefix("0X")) {
    u64::from_str_radix(hex, 16).ok()
  } else {
    cell.parse().ok()
  }
}

/// Parses a signed integer cell: as [`parse_u64`], with an optional
/// leading minus.
pub fn parse_i64(cell: &str) -> Option<i64> {
  let cell = cell.trim();
  match cell.strip_prefix('-') {
    Some(rest) => parse_u64(rest)
      .and_then(|v| i64::try_from(v).ok())
      .and_then(i64::checked_neg),
    None => parse_u64(cell).and_then(|v| i64::try_from(v).ok()),
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn parse_basic() {
    let sheet = Sheet::parse("id\tname\n1\tslime\n2\tgoblin\r\n");
    assert_eq!(sheet.columns(), ["id", "name"]);
    assert_eq!(sheet.len(), 2);
    assert_eq!(sheet.row(1).get("name"), "goblin");
    assert_eq!(sheet.row(1).get("missing"), "");
  }

  #[test]
  fn short_rows_read_empty() {
    let sheet = Sheet::parse("a\tb\tc\n1\t2\n");
    assert_eq!(sheet.row(0).get("c"), "");
  }

  #[test]
  fn write_roundtrip() {
    let text = write(["a", "b"], vec![vec!["1", "2"], vec!["3", "4"]]);
    assert_eq!(text, "a\tb\n1\t2\n3\t4\n");
    let sheet = Sheet::parse(&text);
    assert_eq!(sheet.row(1).get("b"), "4");
  }

  #[test]
  fn integers() {
    assert_eq!(parse_u64("0x1F"), Some(0x1f));
    assert_eq!(parse_u64(" 42 "), Some(42));
    assert_eq!(parse_u64("zz"), None);
    assert_eq!(parse_i64("-0x10"), Some(-16));
    assert_eq!(parse_i64("7"), Some(7));
  }
}
