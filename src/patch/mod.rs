//! ROM patches.
//!
//! The canonical form of a patch is a sorted map from ROM offset to
//! replacement byte. That form merges, filters and diffs trivially; the
//! IPS wire format and its textual sibling IPST are encodings of it,
//! implemented in the [`ips`] and [`ipst`] submodules.
//!
//! A patch parsed from a file additionally retains its record list, and
//! re-encodes it verbatim for as long as the patch is not modified. That
//! makes format conversion byte-exact: converting IPS to IPST and back
//! reproduces the input, record boundaries, literal-versus-RLE choices
//! and all. Any mutation drops the retained records and later encodes
//! fall back to the canonical encoder.

pub mod ips;
pub mod ipst;

use std::collections::BTreeMap;

use crate::error::Error;
use crate::error::Result;

/// The record offset that collides with the wire format's end marker.
///
/// A record starting here would read back as the end of the patch, so
/// encoders must never emit one. The canonical encoder sidesteps it by
/// extending the colliding block one byte backwards with the original
/// image's byte at the previous offset.
pub const BOGO_ADDRESS: u32 = 0x45_4f46;

/// Uniform blocks at least this long encode as run-length records. An
/// RLE record costs 8 bytes against 5 plus the data for a literal, so
/// the break-even point is 4.
const RLE_MIN: usize = 4;

/// Longest payload a single record can carry.
const MAX_RECORD: usize = 0xffff;

/// Highest ROM offset the wire format can address.
const MAX_ADDRESS: u32 = 0xff_ffff;

/// One wire-format record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Record {
  /// ROM offset the record writes at.
  pub offset: u32,
  /// The record's payload.
  pub data: RecordData,
}

/// Payload of a [`Record`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RecordData {
  /// Bytes written verbatim.
  Literal(Vec<u8>),
  /// One byte value repeated.
  Rle {
    /// Number of repetitions.
    len: u16,
    /// The repeated byte.
    value: u8,
  },
}

impl Record {
  /// Number of bytes the record writes.
  pub fn len(&self) -> usize {
    match &self.data {
      RecordData::Literal(bytes) => bytes.len(),
      RecordData::Rle { len, .. } => *len as usize,
    }
  }

  /// Whether the record writes nothing.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The bytes the record writes, in offset order.
  pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
    let (literal, rle) = match &self.data {
      RecordData::Literal(bytes) => (Some(bytes.iter().copied()), None),
      RecordData::Rle { len, value } => (None, Some(std::iter::repeat(*value).take(*len as usize))),
    };
    literal.into_iter().flatten().chain(rle.into_iter().flatten())
  }
}

/// A ROM patch in canonical form.
#[derive(Clone, Debug, Default)]
pub struct Patch {
  changes: BTreeMap<u32, u8>,
  records: Option<Vec<Record>>,
}

/// Patches compare by their canonical changes; retained wire records are
/// an encoding detail.
impl PartialEq for Patch {
  fn eq(&self, other: &Patch) -> bool {
    self.changes == other.changes
  }
}

impl Eq for Patch {}

impl Patch {
  /// An empty patch.
  pub fn new() -> Patch {
    Patch::default()
  }

  /// A patch from an explicit change map.
  pub fn from_changes(changes: BTreeMap<u32, u8>) -> Patch {
    Patch { changes, records: None }
  }

  /// The byte-wise difference of two images: one entry per position
  /// where they disagree. A longer image is compared against zeroes.
  pub fn from_diff(original: &[u8], modified: &[u8]) -> Patch {
    let len = original.len().max(modified.len());
    let mut changes = BTreeMap::new();
    for i in 0..len {
      let old = original.get(i).copied().unwrap_or(0);
      let new = modified.get(i).copied().unwrap_or(0);
      if old != new {
        changes.insert(i as u32, new);
      }
    }
    Patch::from_changes(changes)
  }

  /// Canonicalizes a record list, retaining it for byte-exact re-encode.
  /// Overlapping records merge last-write-wins, in record order.
  pub fn from_records(records: Vec<Record>) -> Patch {
    let mut changes = BTreeMap::new();
    for record in &records {
      for (i, byte) in record.bytes().enumerate() {
        changes.insert(record.offset + i as u32, byte);
      }
    }
    Patch { changes, records: Some(records) }
  }

  /// Parses a binary IPS patch.
  pub fn from_ips(bytes: &[u8]) -> Result<Patch> {
    Ok(Patch::from_records(ips::read(bytes)?))
  }

  /// Parses a textual IPST patch.
  pub fn from_ipst(text: &str) -> Result<Patch> {
    Ok(Patch::from_records(ipst::read(text)?))
  }

  /// Encodes to binary IPS.
  ///
  /// `source` is the original image, consulted only when a change block
  /// starts at [`BOGO_ADDRESS`] and the encoder needs the preceding
  /// byte. Retained records from a parse re-encode verbatim.
  pub fn to_ips(&self, source: Option<&[u8]>) -> Result<Vec<u8>> {
    match &self.records {
      Some(records) => ips::write(records),
      None => ips::write(&self.canonical_records(source)?),
    }
  }

  /// Encodes to textual IPST.
  pub fn to_ipst(&self, source: Option<&[u8]>) -> Result<String> {
    match &self.records {
      Some(records) => ipst::write(records),
      None => ipst::write(&self.canonical_records(source)?),
    }
  }

  /// The changes, in offset order.
  pub fn changes(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
    self.changes.iter().map(|(&offset, &byte)| (offset, byte))
  }

  /// The replacement byte at `offset`, if the patch has one.
  pub fn get(&self, offset: u32) -> Option<u8> {
    self.changes.get(&offset).copied()
  }

  /// Adds or replaces one change.
  pub fn set(&mut self, offset: u32, byte: u8) {
    self.records = None;
    self.changes.insert(offset, byte);
  }

  /// Number of changed bytes.
  pub fn len(&self) -> usize {
    self.changes.len()
  }

  /// Whether the patch changes nothing.
  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }

  /// Merges another patch into this one. Where both patch the same
  /// offset, `other` wins.
  pub fn merge(&mut self, other: &Patch) {
    self.records = None;
    for (offset, byte) in other.changes() {
      self.changes.insert(offset, byte);
    }
  }

  /// Applies the patch to an image, in offset order.
  ///
  /// The image is bounds-checked against the whole patch first, so a
  /// failing apply leaves it untouched.
  pub fn apply(&self, image: &mut [u8]) -> Result<()> {
    if let Some((&offset, _)) = self.changes.iter().next_back() {
      if offset as usize >= image.len() {
        return Err(Error::PatchExpandsRom { offset, len: image.len() });
      }
    }
    for (offset, byte) in self.changes() {
      image[offset as usize] = byte;
    }
    Ok(())
  }

  /// Drops changes that already hold in `original`.
  pub fn filter_against(&self, original: &[u8]) -> Patch {
    let changes = self
      .changes()
      .filter(|&(offset, byte)| original.get(offset as usize).copied() != Some(byte))
      .collect();
    Patch::from_changes(changes)
  }

  /// Groups adjacent changes into blocks.
  fn blockify(&self) -> Vec<(u32, Vec<u8>)> {
    let mut blocks: Vec<(u32, Vec<u8>)> = Vec::new();
    for (offset, byte) in self.changes() {
      match blocks.last_mut() {
        Some((start, data)) if *start + data.len() as u32 == offset => data.push(byte),
        _ => blocks.push((offset, vec![byte])),
      }
    }
    blocks
  }

  /// Encodes the canonical changes as records: adjacent changes
  /// coalesce, long blocks split, uniform runs use RLE when smaller, and
  /// no record starts at the forbidden offset.
  fn canonical_records(&self, source: Option<&[u8]>) -> Result<Vec<Record>> {
    let mut blocks = Vec::new();
    for (offset, data) in self.blockify() {
      let last = offset as u64 + data.len() as u64 - 1;
      if last > MAX_ADDRESS as u64 {
        return Err(Error::patch(format!(
          "change at {:#x} beyond the addressable range",
          last
        )));
      }
      if offset == BOGO_ADDRESS {
        let bogo = source
          .and_then(|s| s.get(BOGO_ADDRESS as usize - 1))
          .copied()
          .ok_or_else(|| {
            Error::patch(format!(
              "a change block starts at {:#x}, which reads as the end marker, \
               and no source image was given to extend it backwards",
              BOGO_ADDRESS
            ))
          })?;
        blocks.push((BOGO_ADDRESS - 1, vec![bogo, data[0]]));
        if data.len() > 1 {
          blocks.push((BOGO_ADDRESS + 1, data[1..].to_vec()));
        }
      } else {
        blocks.push((offset, data));
      }
    }

    let mut records = Vec::new();
    for (offset, data) in blocks {
      let mut start = 0usize;
      while start < data.len() {
        let mut take = (data.len() - start).min(MAX_RECORD);
        // Never let the next chunk begin at the forbidden offset.
        if start + take < data.len() && offset + (start + take) as u32 == BOGO_ADDRESS {
          take -= 1;
        }
        let chunk = &data[start..start + take];
        let uniform = chunk.iter().all(|&b| b == chunk[0]);
        let payload = if uniform && take >= RLE_MIN {
          RecordData::Rle { len: take as u16, value: chunk[0] }
        } else {
          RecordData::Literal(chunk.to_vec())
        };
        records.push(Record { offset: offset + start as u32, data: payload });
        start += take;
      }
    }
    Ok(records)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn patch_of(changes: &[(u32, u8)]) -> Patch {
    Patch::from_changes(changes.iter().copied().collect())
  }

  #[test]
  fn single_byte_change() {
    let orig = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
    let mut edited = orig;
    edited[3] = 0xff;
    let patch = Patch::from_diff(&orig, &edited);
    let expected: Vec<u8> = b"PATCH\x00\x00\x03\x00\x01\xffEOF".to_vec();
    assert_eq!(patch.to_ips(None).unwrap(), expected);
  }

  #[test]
  fn run_length_encoding() {
    let patch = patch_of(&(10..20).map(|i| (i, 0xaa)).collect::<Vec<_>>());
    let expected: Vec<u8> = b"PATCH\x00\x00\x0a\x00\x00\x00\x0a\xaaEOF".to_vec();
    assert_eq!(patch.to_ips(None).unwrap(), expected);
  }

  #[test]
  fn short_uniform_run_stays_literal() {
    let patch = patch_of(&[(4, 0xaa), (5, 0xaa), (6, 0xaa)]);
    let expected: Vec<u8> = b"PATCH\x00\x00\x04\x00\x03\xaa\xaa\xaaEOF".to_vec();
    assert_eq!(patch.to_ips(None).unwrap(), expected);
  }

  #[test]
  fn diff_apply_roundtrip() {
    let orig: Vec<u8> = (0..64).collect();
    let mut edited = orig.clone();
    edited[0] = 0x80;
    edited[17] = 0x81;
    edited[18] = 0x82;
    edited[63] = 0x83;
    let patch = Patch::from_diff(&orig, &edited);
    let mut image = orig.clone();
    patch.apply(&mut image).unwrap();
    assert_eq!(image, edited);
  }

  #[test]
  fn apply_past_end_is_fatal_and_clean() {
    let patch = patch_of(&[(2, 1), (100, 2)]);
    let mut image = vec![0u8; 10];
    match patch.apply(&mut image) {
      Err(Error::PatchExpandsRom { offset: 100, len: 10 }) => {}
      other => panic!("expected PatchExpandsRom, got {:?}", other),
    }
    assert_eq!(image, vec![0u8; 10]);
  }

  #[test]
  fn merge_last_wins() {
    let mut a = patch_of(&[(0, 1), (5, 1)]);
    let b = patch_of(&[(5, 2), (9, 2)]);
    a.merge(&b);
    assert_eq!(a, patch_of(&[(0, 1), (5, 2), (9, 2)]));

    // Order only matters where the inputs disagree.
    let mut ab = patch_of(&[(0, 1)]);
    ab.merge(&patch_of(&[(9, 2)]));
    let mut ba = patch_of(&[(9, 2)]);
    ba.merge(&patch_of(&[(0, 1)]));
    assert_eq!(ab, ba);
  }

  #[test]
  fn filter_idempotent() {
    let rom = vec![7u8; 16];
    let patch = patch_of(&[(0, 7), (1, 8), (2, 7), (3, 9)]);
    let once = patch.filter_against(&rom);
    assert_eq!(once, patch_of(&[(1, 8), (3, 9)]));
    assert_eq!(once.filter_against(&rom), once);
  }

  #[test]
  fn forbidden_offset_single_byte() {
    let mut source = vec![0u8; BOGO_ADDRESS as usize + 8];
    source[BOGO_ADDRESS as usize - 1] = 0x5a;
    let patch = patch_of(&[(BOGO_ADDRESS, 0x11)]);
    assert!(patch.to_ips(None).is_err());
    let records = patch.canonical_records(Some(&source)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].offset, BOGO_ADDRESS - 1);
    assert_eq!(records[0].data, RecordData::Literal(vec![0x5a, 0x11]));
  }

  #[test]
  fn forbidden_offset_run_splits_in_two() {
    let mut source = vec![0u8; BOGO_ADDRESS as usize + 8];
    source[BOGO_ADDRESS as usize - 1] = 0x5a;
    let patch = patch_of(&[
      (BOGO_ADDRESS, 0x11),
      (BOGO_ADDRESS + 1, 0x22),
      (BOGO_ADDRESS + 2, 0x33),
    ]);
    let records = patch.canonical_records(Some(&source)).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].offset, BOGO_ADDRESS - 1);
    assert_eq!(records[0].data, RecordData::Literal(vec![0x5a, 0x11]));
    assert_eq!(records[1].offset, BOGO_ADDRESS + 1);
    assert_eq!(records[1].data, RecordData::Literal(vec![0x22, 0x33]));
    for record in &records {
      assert_ne!(record.offset, BOGO_ADDRESS);
    }
  }

  #[test]
  fn long_blocks_split() {
    let patch = patch_of(
      &(0..0x1_0002u32)
        .map(|i| (i, (i % 251) as u8))
        .collect::<Vec<_>>(),
    );
    let records = patch.canonical_records(None).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].len(), 0xffff);
    assert_eq!(records[1].offset, 0xffff);
    assert_eq!(records[1].len(), 3);
  }

  #[test]
  fn address_limit_enforced() {
    let patch = patch_of(&[(0x100_0000, 1)]);
    assert!(patch.to_ips(None).is_err());
  }

  #[test]
  fn mutation_drops_retained_records() {
    // Two adjacent literal records stay separate through a clean
    // round-trip, but merge once the patch is touched.
    let records = vec![
      Record { offset: 0, data: RecordData::Literal(vec![1, 2]) },
      Record { offset: 2, data: RecordData::Literal(vec![3]) },
    ];
    let wire = ips::write(&records).unwrap();
    let patch = Patch::from_ips(&wire).unwrap();
    assert_eq!(patch.to_ips(None).unwrap(), wire);

    let mut touched = patch.clone();
    touched.set(9, 9);
    let reencoded = touched.to_ips(None).unwrap();
    assert_ne!(reencoded, wire);
    assert_eq!(Patch::from_ips(&reencoded).unwrap(), touched);
  }
}
