//! The IPST textual patch form.
//!
//! IPST is the wire format rewritten for human eyes and version control:
//! one record per line in hex, with `#` comments. A run-length line
//! carries a final flag digit recording whether the record was
//! run-length in the binary form, so converting a patch to text and back
//! reproduces the original bytes exactly.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::error::Error;
use crate::error::Result;
use crate::patch::Record;
use crate::patch::RecordData;

#[derive(Parser)]
#[grammar = "patch/grammar.pest"]
struct IpstParser;

fn line_of(pair: &Pair<Rule>) -> usize {
  pair.as_span().start_pos().line_col().0
}

fn hex_u32(text: &str) -> u32 {
  // The grammar only admits hex digits here.
  u32::from_str_radix(text, 16).unwrap_or(0)
}

/// Parses the records of an IPST file, in file order.
pub fn read(text: &str) -> Result<Vec<Record>> {
  let mut pairs = IpstParser::parse(Rule::ipst, text)
    .map_err(|e| Error::patch(format!("IPST: {}", e)))?;
  let file = match pairs.next() {
    Some(file) => file,
    None => return Ok(Vec::new()),
  };

  let mut records = Vec::new();
  for line in file.into_inner() {
    if line.as_rule() != Rule::record_line {
      continue;
    }
    let record = match line.into_inner().next() {
      Some(record) => record,
      None => continue,
    };
    let body = match record.into_inner().next() {
      Some(body) => body,
      None => continue,
    };
    records.push(parse_record(body)?);
  }
  Ok(records)
}

fn parse_record(body: Pair<Rule>) -> Result<Record> {
  let line = line_of(&body);
  let rule = body.as_rule();
  let mut parts = body.into_inner();
  let mut next = |what: &str| {
    parts
      .next()
      .map(|p| p.as_str().to_owned())
      .ok_or_else(|| Error::patch(format!("IPST line {}: missing {}", line, what)))
  };

  let offset = hex_u32(&next("offset")?);
  match rule {
    Rule::rle => {
      let len = hex_u32(&next("length")?);
      let value = hex_u32(&next("byte")?) as u8;
      let flag = next("flag")?;
      if len == 0 {
        return Err(Error::patch(format!("IPST line {}: zero-length run", line)));
      }
      let data = if flag == "1" {
        RecordData::Rle { len: len as u16, value }
      } else {
        // Flag zero: the run was a literal record in the binary form.
        RecordData::Literal(vec![value; len as usize])
      };
      Ok(Record { offset, data })
    }
    Rule::literal => {
      let len = hex_u32(&next("length")?) as usize;
      let hex = next("payload")?;
      if hex.len() != len * 2 {
        return Err(Error::patch(format!(
          "IPST line {}: payload is {} hex digits, length says {}",
          line,
          hex.len(),
          len * 2
        )));
      }
      let payload = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0))
        .collect();
      Ok(Record { offset, data: RecordData::Literal(payload) })
    }
    other => Err(Error::patch(format!("IPST line {}: unexpected {:?}", line, other))),
  }
}

/// Writes records as an IPST file.
pub fn write(records: &[Record]) -> Result<String> {
  let mut out = String::from("PATCH\n");
  for record in records {
    if record.offset > 0xff_ffff {
      return Err(Error::patch(format!("record offset {:#x} too large", record.offset)));
    }
    match &record.data {
      RecordData::Literal(payload) => {
        if payload.is_empty() || payload.len() > 0xffff {
          return Err(Error::patch(format!("bad literal record length {}", payload.len())));
        }
        out.push_str(&format!("{:06X}:{:04X}:", record.offset, payload.len()));
        for byte in payload {
          out.push_str(&format!("{:02X}", byte));
        }
        out.push('\n');
      }
      RecordData::Rle { len, value } => {
        if *len == 0 {
          return Err(Error::patch("zero-length run record".to_owned()));
        }
        out.push_str(&format!(
          "{:06X}:0000:{:04X}:{:02X}:1\n",
          record.offset, len, value
        ));
      }
    }
  }
  out.push_str("EOF\n");
  Ok(out)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::patch::ips;

  #[test]
  fn read_basic() {
    let text = "PATCH\n000010:0002:ABCD\n000020:0000:0004:99:1\nEOF\n";
    let records = read(text).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].offset, 0x10);
    assert_eq!(records[0].data, RecordData::Literal(vec![0xab, 0xcd]));
    assert_eq!(records[1].data, RecordData::Rle { len: 4, value: 0x99 });
  }

  #[test]
  fn comments_and_blanks_ignored() {
    let text = "# built by hand\n\nPATCH\n# first record\n000000:0001:FF\n\nEOF\n";
    let records = read(text).unwrap();
    assert_eq!(records.len(), 1);
  }

  #[test]
  fn flag_zero_restores_a_literal() {
    let text = "PATCH\n000010:0000:0004:99:0\nEOF\n";
    let records = read(text).unwrap();
    assert_eq!(records[0].data, RecordData::Literal(vec![0x99; 4]));
  }

  #[test]
  fn payload_length_must_match() {
    assert!(read("PATCH\n000010:0003:ABCD\nEOF\n").is_err());
  }

  #[test]
  fn missing_footer_rejected() {
    assert!(read("PATCH\n000010:0001:AB\n").is_err());
  }

  #[test]
  fn lowercase_hex_accepted() {
    let records = read("PATCH\n00001f:0001:ab\nEOF\n").unwrap();
    assert_eq!(records[0].offset, 0x1f);
    assert_eq!(records[0].data, RecordData::Literal(vec![0xab]));
  }

  #[test]
  fn ips_through_text_is_byte_exact() {
    // Adjacent records and an RLE-eligible literal, which a canonical
    // re-encode would rewrite; the record layer must not.
    let wire = b"PATCH\
      \x00\x00\x10\x00\x02\xab\xcd\
      \x00\x00\x12\x00\x01\xee\
      \x00\x00\x20\x00\x04\x99\x99\x99\x99\
      \x00\x00\x30\x00\x00\x00\x08\x55\
      EOF"
    .to_vec();
    let text = write(&ips::read(&wire).unwrap()).unwrap();
    let back = ips::write(&read(&text).unwrap()).unwrap();
    assert_eq!(back, wire);
  }
}
