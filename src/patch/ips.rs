//! The binary IPS wire format.
//!
//! An IPS file is the literal header `PATCH`, a sequence of records, and
//! the literal footer `EOF`. Each record is a 3-byte big-endian offset
//! followed by a 2-byte big-endian length and that many payload bytes. A
//! zero length marks a run-length record instead: a 2-byte big-endian
//! repeat count, then the single byte to repeat.

use std::io::Cursor;
use std::io::Read;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::patch::Record;
use crate::patch::RecordData;
use crate::patch::BOGO_ADDRESS;

const HEADER: &[u8] = b"PATCH";
const FOOTER: &[u8] = b"EOF";

fn truncated(_: std::io::Error) -> Error {
  Error::patch("unexpected end of IPS data".to_owned())
}

/// Reads the records of an IPS file, in file order.
///
/// Overlaps between records are preserved; collapsing them is the
/// canonical patch's business. Data after the footer is ignored with a
/// warning.
pub fn read(bytes: &[u8]) -> Result<Vec<Record>> {
  let mut cur = Cursor::new(bytes);
  let mut magic = [0u8; 5];
  cur.read_exact(&mut magic).map_err(truncated)?;
  if magic != *HEADER {
    return Err(Error::patch("missing PATCH header".to_owned()));
  }

  let mut records = Vec::new();
  loop {
    let mut head = [0u8; 3];
    cur.read_exact(&mut head).map_err(truncated)?;
    if head == *FOOTER {
      break;
    }
    let offset = u32::from_be_bytes([0, head[0], head[1], head[2]]);
    let size = cur.read_u16::<BigEndian>().map_err(truncated)?;
    let data = if size == 0 {
      let len = cur.read_u16::<BigEndian>().map_err(truncated)?;
      let value = cur.read_u8().map_err(truncated)?;
      RecordData::Rle { len, value }
    } else {
      let mut payload = vec![0u8; size as usize];
      cur.read_exact(&mut payload).map_err(truncated)?;
      RecordData::Literal(payload)
    };
    records.push(Record { offset, data });
  }

  let rest = bytes.len() as u64 - cur.position();
  if rest > 0 {
    warn!("{} bytes of trailing data after the IPS footer ignored", rest);
  }
  Ok(records)
}

/// Writes records as an IPS file.
pub fn write(records: &[Record]) -> Result<Vec<u8>> {
  let mut out = Vec::with_capacity(records.iter().map(Record::len).sum::<usize>() + 16);
  out.extend_from_slice(HEADER);
  for record in records {
    if record.offset == BOGO_ADDRESS {
      return Err(Error::patch(format!(
        "record offset {:#x} reads as the end marker",
        record.offset
      )));
    }
    if record.offset > 0xff_ffff {
      return Err(Error::patch(format!("record offset {:#x} too large", record.offset)));
    }
    let head = record.offset.to_be_bytes();
    out.extend_from_slice(&head[1..]);
    match &record.data {
      RecordData::Literal(payload) => {
        if payload.is_empty() || payload.len() > 0xffff {
          return Err(Error::patch(format!("bad literal record length {}", payload.len())));
        }
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
      }
      RecordData::Rle { len, value } => {
        if *len == 0 {
          return Err(Error::patch("zero-length run record".to_owned()));
        }
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.push(*value);
      }
    }
  }
  out.extend_from_slice(FOOTER);
  Ok(out)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn read_literal_and_rle() {
    let bytes = b"PATCH\x00\x00\x10\x00\x02\xab\xcd\x00\x00\x20\x00\x00\x00\x04\x99EOF";
    let records = read(bytes).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].offset, 0x10);
    assert_eq!(records[0].data, RecordData::Literal(vec![0xab, 0xcd]));
    assert_eq!(records[1].offset, 0x20);
    assert_eq!(records[1].data, RecordData::Rle { len: 4, value: 0x99 });
  }

  #[test]
  fn write_read_roundtrip() {
    let records = vec![
      Record { offset: 0, data: RecordData::Literal(vec![1]) },
      Record { offset: 0x1234, data: RecordData::Rle { len: 300, value: 7 } },
      Record { offset: 0xff_fffe, data: RecordData::Literal(vec![2]) },
    ];
    let wire = write(&records).unwrap();
    assert_eq!(read(&wire).unwrap(), records);
  }

  #[test]
  fn bad_header_rejected() {
    assert!(read(b"PETCH\x00\x00\x00EOF").is_err());
  }

  #[test]
  fn truncation_rejected() {
    assert!(read(b"PATCH\x00\x00\x10\x00\x05\xab").is_err());
    assert!(read(b"PATCH").is_err());
  }

  #[test]
  fn forbidden_offset_rejected_on_write() {
    let records = vec![Record {
      offset: BOGO_ADDRESS,
      data: RecordData::Literal(vec![1]),
    }];
    assert!(write(&records).is_err());
  }
}
