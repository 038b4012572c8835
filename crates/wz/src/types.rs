use binrw::{BinRead, BinWrite, NullString};
use std::str::FromStr;

use crate::error::DecodeError;

/// Copyright notice written into new archives
pub const DEFAULT_COPYRIGHT: &str = "Package file v1.0 Copyright 2002 Wizet, ZMS";

/// Largest entry count accepted for a directory table or property list
pub const MAX_ENTRIES: i32 = 100_000;

/// Marker of a compressed int that carries a full 32/64-bit value
pub const COMPRESSED_SENTINEL: i8 = i8::MIN;

/// Fixed GUID block that opens every sound header
#[rustfmt::skip]
pub const SOUND_HEADER_GUIDS: [u8; 51] = [
    0x02,
    0x83, 0xEB, 0x36, 0xE4, 0x4F, 0x52, 0xCE, 0x11, 0x9F, 0x53, 0x00, 0x20, 0xAF, 0x0B, 0xA7, 0x70,
    0x8B, 0xEB, 0x36, 0xE4, 0x4F, 0x52, 0xCE, 0x11, 0x9F, 0x53, 0x00, 0x20, 0xAF, 0x0B, 0xA7, 0x70,
    0x00,
    0x01,
    0x81, 0x9F, 0x58, 0x05, 0x56, 0xC3, 0xCE, 0x11, 0xBF, 0x01, 0x00, 0xAA, 0x00, 0x55, 0x59, 0x5A,
];

/// Tags that open a string block
pub mod block {
    /// Inline string follows
    pub const LITERAL: u8 = 0x00;
    /// i32 offset of a previously written string follows
    pub const REFERENCE: u8 = 0x01;
    /// Inline type name follows
    pub const TYPE_LITERAL: u8 = 0x73;
    /// i32 offset of a previously written type name follows
    pub const TYPE_REFERENCE: u8 = 0x1B;
}

/// Directory table entry types
pub mod entry {
    /// Unknown entry, skipped when reading
    pub const SKIPPED: u8 = 1;
    /// Type and name stored elsewhere in the table region
    pub const REFERENCE: u8 = 2;
    pub const DIRECTORY: u8 = 3;
    pub const IMAGE: u8 = 4;
}

/// Property value discriminators
pub mod property {
    pub const NULL: u8 = 0;
    pub const SHORT: u8 = 2;
    pub const INT: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const STRING: u8 = 8;
    pub const EXTENDED: u8 = 9;
    pub const SHORT_ALT: u8 = 11;
    pub const INT_ALT: u8 = 19;
    pub const LONG: u8 = 20;

    /// Leading byte of a non-zero float
    pub const FLOAT_PRESENT: u8 = 0x80;
}

/// Structure of the archive header
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq)]
#[brw(magic = b"PKG1", little)]
pub struct WzHeader {
    /// Length of the archive following `data_start`
    pub file_size: u64,
    pub data_start: u32,
    pub copyright: NullString,
}

impl Default for WzHeader {
    fn default() -> Self {
        let mut header = Self {
            file_size: 0,
            data_start: 0,
            copyright: NullString::from(DEFAULT_COPYRIGHT),
        };
        header.data_start = header.encoded_len();
        header
    }
}

impl WzHeader {
    /// Number of bytes the header occupies before any padding
    pub fn encoded_len(&self) -> u32 {
        (4 + 8 + 4 + self.copyright.len() + 1) as u32
    }
}

/// Type names used by extended properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKind {
    Property,
    Canvas,
    Vector,
    Convex,
    Sound,
    Uol,
}

impl ExtendedKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExtendedKind::Property => "Property",
            ExtendedKind::Canvas => "Canvas",
            ExtendedKind::Vector => "Shape2D#Vector2D",
            ExtendedKind::Convex => "Shape2D#Convex2D",
            ExtendedKind::Sound => "Sound_DX8",
            ExtendedKind::Uol => "UOL",
        }
    }
}

impl FromStr for ExtendedKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Property" => Ok(ExtendedKind::Property),
            "Canvas" => Ok(ExtendedKind::Canvas),
            "Shape2D#Vector2D" => Ok(ExtendedKind::Vector),
            "Shape2D#Convex2D" => Ok(ExtendedKind::Convex),
            "Sound_DX8" => Ok(ExtendedKind::Sound),
            "UOL" => Ok(ExtendedKind::Uol),
            other => Err(DecodeError::ExtendedKind(other.to_string())),
        }
    }
}

/// Wrapping byte sum used as the image checksum
pub fn checksum(bytes: &[u8]) -> i32 {
    bytes
        .iter()
        .fold(0i32, |sum, byte| sum.wrapping_add(*byte as i32))
}

#[cfg(test)]
mod test {
    use super::*;
    use binrw::{BinRead, BinWrite};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn default_header_is_sixty_bytes() -> crate::error::Result<()> {
        let header = WzHeader::default();
        assert_eq!(header.data_start, 60);

        let mut buffer = Cursor::new(Vec::new());
        header.write(&mut buffer)?;
        assert_eq!(buffer.get_ref().len(), 60);
        assert_eq!(&buffer.get_ref()[..4], b"PKG1");

        buffer.set_position(0);
        let parsed = WzHeader::read(&mut buffer)?;
        assert_eq!(parsed, header);
        assert_eq!(parsed.copyright.to_string(), DEFAULT_COPYRIGHT);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn header_requires_ident() {
        let mut bytes = vec![0u8; 60];
        bytes[..4].copy_from_slice(b"PKG2");
        assert!(WzHeader::read(&mut Cursor::new(bytes)).is_err());
    }

    #[traced_test]
    #[test]
    fn extended_kind_names() {
        for kind in [
            ExtendedKind::Property,
            ExtendedKind::Canvas,
            ExtendedKind::Vector,
            ExtendedKind::Convex,
            ExtendedKind::Sound,
            ExtendedKind::Uol,
        ] {
            assert_eq!(kind.as_str().parse::<ExtendedKind>().ok(), Some(kind));
        }
        assert!(matches!(
            "Shape2D#Polygon".parse::<ExtendedKind>(),
            Err(DecodeError::ExtendedKind(_))
        ));
    }

    #[traced_test]
    #[test]
    fn checksum_wraps() {
        assert_eq!(checksum(&[0x73, 0x00, 0xFF]), 0x172);
        assert_eq!(checksum(&[]), 0);
    }
}
