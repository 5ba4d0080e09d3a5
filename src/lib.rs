//! ROMTAB, a map-driven ROM table editor and patch generation library.
//!
//! A map is a directory of declarative TSV files describing where the
//! data tables of a cartridge image live and what they contain. Given an
//! image and its map, romtab materialises the described tables as live
//! views, dumps them to spreadsheet-friendly TSV files, loads edited
//! files back, and expresses the result as an IPS patch against the
//! original image.
//!
//! ```no_run
//! use romtab::map::RomMap;
//! use romtab::rom::Rom;
//!
//! # fn main() -> romtab::error::Result<()> {
//! let map = RomMap::load("maps/example")?;
//! let mut rom = Rom::from_file("example.sfc", map)?;
//! rom.load("moddir")?;
//! std::fs::write("example.ips", rom.write_ips()?)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bits;
pub mod dump;
pub mod error;
pub mod map;
pub mod patch;
pub mod rom;
pub mod structure;
pub mod table;
pub mod text;
pub mod tsv;
pub mod ty;
pub mod value;
