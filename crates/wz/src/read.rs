//! Types for reading WZ archives
//!

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{instrument, trace, warn};
use widestring::U16String;
use wz_crypto::Keystream;

use crate::cache::ReadCache;
use crate::error::{DecodeError, Result};
use crate::offset;
use crate::tree::{
    CanvasData, DirectoryData, ImageData, ImageState, NodeId, Payload, SoundData, WzTree, WzValue,
};
use crate::types::{block, entry, property, ExtendedKind, MAX_ENTRIES, SOUND_HEADER_GUIDS};

/// Codec for the primitive encodings of an archive
///
/// Wraps a seekable source together with the keystream, version hash and data start needed
/// to decode strings and offsets. Positions are absolute positions in the source.
pub struct WzReader<R> {
    inner: R,
    key: Keystream,
    hash: u32,
    data_start: u32,
    len: u64,
    cache: ReadCache,
}

impl<R: Read + Seek> WzReader<R> {
    pub fn new(mut inner: R, key: Keystream) -> Result<Self> {
        let position = inner.stream_position()?;
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(position))?;
        Ok(Self {
            inner,
            key,
            hash: 0,
            data_start: 0,
            len,
            cache: ReadCache::default(),
        })
    }

    /// Total length of the source
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn set_hash(&mut self, hash: u32) {
        self.hash = hash;
    }

    pub fn data_start(&self) -> u32 {
        self.data_start
    }

    pub fn set_data_start(&mut self, data_start: u32) {
        self.data_start = data_start;
    }

    pub fn keystream(&self) -> &Keystream {
        &self.key
    }

    /// Forgets the strings decoded during the current pass
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn remaining(&mut self) -> Result<u64> {
        Ok(self.len.saturating_sub(self.position()?))
    }

    fn ensure_remaining(&mut self, needed: u64) -> Result<()> {
        if needed > self.remaining()? {
            return Err(DecodeError::LengthOutOfBounds(needed as i64).into());
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure_remaining(len as u64)?;
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads `len` bytes at `offset` and returns to the current position
    pub fn read_payload(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let position = self.position()?;
        self.seek_to(offset)?;
        let bytes = self.read_bytes(len as usize);
        self.seek_to(position)?;
        bytes
    }

    /// Reads a compressed int. A leading `-128` announces a full i32.
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        match self.read_i8()? {
            i8::MIN => Ok(self.read_i32::<LittleEndian>()?),
            small => Ok(small as i32),
        }
    }

    /// Reads a compressed long. A leading `-128` announces a full i64.
    pub fn read_compressed_long(&mut self) -> Result<i64> {
        match self.read_i8()? {
            i8::MIN => Ok(self.read_i64::<LittleEndian>()?),
            small => Ok(small as i64),
        }
    }

    /// Reads an encrypted string
    pub fn read_string(&mut self) -> Result<String> {
        let small = self.read_i8()?;
        match small {
            0 => Ok(String::new()),
            1.. => {
                let len = match small {
                    i8::MAX => self.read_i32::<LittleEndian>()?,
                    small => small as i32,
                };
                self.read_wide(len)
            }
            _ => {
                let len = match small {
                    i8::MIN => self.read_i32::<LittleEndian>()?,
                    small => -(small as i32),
                };
                self.read_narrow(len)
            }
        }
    }

    fn read_wide(&mut self, len: i32) -> Result<String> {
        if len <= 0 {
            return Ok(String::new());
        }
        let len = len as usize;
        self.ensure_remaining(len as u64 * 2)?;
        self.key.ensure(len * 2);

        let mut mask: u16 = 0xAAAA;
        let mut units = Vec::with_capacity(len);
        for i in 0..len {
            let key = u16::from_le_bytes([self.key[i * 2], self.key[i * 2 + 1]]);
            units.push(self.read_u16::<LittleEndian>()? ^ key ^ mask);
            mask = mask.wrapping_add(1);
        }
        Ok(U16String::from_vec(units).to_string_lossy())
    }

    fn read_narrow(&mut self, len: i32) -> Result<String> {
        if len <= 0 {
            return Ok(String::new());
        }
        let len = len as usize;
        let bytes = self.read_bytes(len)?;
        self.key.ensure(len);

        let mut mask: u8 = 0xAA;
        let mut text = String::with_capacity(len);
        for (i, byte) in bytes.into_iter().enumerate() {
            text.push((byte ^ self.key[i] ^ mask) as char);
            mask = mask.wrapping_add(1);
        }
        Ok(text)
    }

    /// Reads the string stored at `offset`, returning to the current position afterwards
    pub fn read_string_at(&mut self, offset: u64) -> Result<String> {
        if let Some(cached) = self.cache.get(offset) {
            return Ok(cached.to_string());
        }
        let position = self.position()?;
        self.seek_to(offset)?;
        let text = self.read_string();
        self.seek_to(position)?;
        let text = text?;
        self.cache.insert(offset, &text);
        Ok(text)
    }

    /// Reads a string block whose references are relative to `base`
    pub fn read_string_block(&mut self, base: u64) -> Result<String> {
        match self.read_u8()? {
            block::LITERAL | block::TYPE_LITERAL => self.read_string(),
            block::REFERENCE | block::TYPE_REFERENCE => {
                let relative = self.read_i32::<LittleEndian>()?;
                let target = self.relative(base, relative)?;
                self.read_string_at(target)
            }
            tag => Err(DecodeError::StringBlockTag(tag).into()),
        }
    }

    fn relative(&self, base: u64, relative: i32) -> Result<u64> {
        base.checked_add_signed(relative as i64)
            .filter(|target| *target < self.len)
            .ok_or(DecodeError::OffsetOutOfBounds(base.wrapping_add_signed(relative as i64)).into())
    }

    /// Reads and decodes an obfuscated offset
    pub fn read_offset(&mut self) -> Result<u32> {
        let position = self.position()? as u32;
        let encoded = self.read_u32::<LittleEndian>()?;
        Ok(offset::deobfuscate(
            position,
            self.data_start,
            self.hash,
            encoded,
        ))
    }
}

impl<R> WzReader<R> {
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for WzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for WzReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Reads the directory table at `table` into `directory`, recursing into subdirectories
#[instrument(skip(reader, tree), level = "trace", err)]
pub(crate) fn parse_directory<R: Read + Seek>(
    reader: &mut WzReader<R>,
    tree: &mut WzTree,
    directory: NodeId,
    table: u64,
) -> Result<()> {
    reader.seek_to(table)?;
    let count = reader.read_compressed_int()?;
    if !(0..=MAX_ENTRIES).contains(&count) {
        return Err(DecodeError::EntryCount(count).into());
    }

    let mut subdirectories = Vec::new();
    for _ in 0..count {
        let mut kind = reader.read_u8()?;
        let name = match kind {
            entry::SKIPPED => {
                reader.read_i32::<LittleEndian>()?;
                reader.read_i16::<LittleEndian>()?;
                reader.read_offset()?;
                continue;
            }
            entry::REFERENCE => {
                let relative = reader.read_i32::<LittleEndian>()?;
                let target = reader.relative(reader.data_start() as u64, relative)?;
                let position = reader.position()?;
                reader.seek_to(target)?;
                kind = reader.read_u8()?;
                let name = reader.read_string();
                reader.seek_to(position)?;
                name?
            }
            entry::DIRECTORY | entry::IMAGE => reader.read_string()?,
            tag => return Err(DecodeError::DirectoryEntryTag(tag).into()),
        };

        let size = reader.read_compressed_int()?;
        let checksum = reader.read_compressed_int()?;
        let offset = reader.read_offset()?;

        match kind {
            entry::DIRECTORY => {
                let offset64 = offset as u64;
                if offset64 <= table || offset64 >= reader.len() {
                    return Err(DecodeError::OffsetOutOfBounds(offset64).into());
                }
                let id = tree.insert(
                    Some(directory),
                    &name,
                    WzValue::Directory(DirectoryData {
                        size,
                        checksum,
                        offset,
                    }),
                );
                subdirectories.push((id, offset64));
            }
            entry::IMAGE => {
                if size < 0 || offset as u64 + size as u64 > reader.len() {
                    return Err(DecodeError::OffsetOutOfBounds(offset as u64).into());
                }
                tree.insert(
                    Some(directory),
                    &name,
                    WzValue::Image(ImageData::sourced(size, checksum, offset)),
                );
            }
            tag => return Err(DecodeError::DirectoryEntryTag(tag).into()),
        }
    }

    for (id, offset) in subdirectories {
        parse_directory(reader, tree, id, offset)?;
    }
    Ok(())
}

/// Loads the properties of an unparsed image as its children
#[instrument(skip(reader, tree), level = "debug", err)]
pub(crate) fn parse_image<R: Read + Seek>(
    reader: &mut WzReader<R>,
    tree: &mut WzTree,
    image: NodeId,
    eager: bool,
) -> Result<()> {
    let base = tree.image_data(image)?.offset as u64;
    let result = parse_image_at(reader, tree, image, base, eager);
    reader.clear_cache();
    match result {
        Ok(()) => {
            tree.image_data_mut(image)?.state = ImageState::Parsed;
            Ok(())
        }
        Err(error) => {
            warn!(%error, "image failed to parse");
            tree.clear_children(image)?;
            Err(error)
        }
    }
}

fn parse_image_at<R: Read + Seek>(
    reader: &mut WzReader<R>,
    tree: &mut WzTree,
    image: NodeId,
    base: u64,
    eager: bool,
) -> Result<()> {
    reader.seek_to(base)?;
    if reader.read_u8()? != block::TYPE_LITERAL
        || reader.read_string()? != ExtendedKind::Property.as_str()
        || reader.read_u16::<LittleEndian>()? != 0
    {
        return Err(DecodeError::ImageHeader.into());
    }
    parse_property_list(reader, tree, image, base, eager)
}

fn parse_property_list<R: Read + Seek>(
    reader: &mut WzReader<R>,
    tree: &mut WzTree,
    parent: NodeId,
    base: u64,
    eager: bool,
) -> Result<()> {
    let count = reader.read_compressed_int()?;
    if !(0..=MAX_ENTRIES).contains(&count) {
        return Err(DecodeError::EntryCount(count).into());
    }

    for _ in 0..count {
        let name = reader.read_string_block(base)?;
        let value = match reader.read_u8()? {
            property::NULL => WzValue::Null,
            property::SHORT | property::SHORT_ALT => {
                WzValue::Short(reader.read_i16::<LittleEndian>()?)
            }
            property::INT | property::INT_ALT => WzValue::Int(reader.read_compressed_int()?),
            property::LONG => WzValue::Long(reader.read_compressed_long()?),
            property::FLOAT => match reader.read_u8()? {
                property::FLOAT_PRESENT => WzValue::Float(reader.read_f32::<LittleEndian>()?),
                0 => WzValue::Float(0.0),
                marker => return Err(DecodeError::FloatMarker(marker).into()),
            },
            property::DOUBLE => WzValue::Double(reader.read_f64::<LittleEndian>()?),
            property::STRING => WzValue::String(reader.read_string_block(base)?),
            property::EXTENDED => {
                let len = reader.read_u32::<LittleEndian>()? as u64;
                let end = reader.position()? + len;
                if end > reader.len() {
                    return Err(DecodeError::OffsetOutOfBounds(end).into());
                }
                parse_extended(reader, tree, parent, &name, base, eager)?;
                reader.seek_to(end)?;
                continue;
            }
            tag => return Err(DecodeError::PropertyTag(tag).into()),
        };
        tree.insert(Some(parent), &name, value);
    }
    Ok(())
}

fn parse_extended<R: Read + Seek>(
    reader: &mut WzReader<R>,
    tree: &mut WzTree,
    parent: NodeId,
    name: &str,
    base: u64,
    eager: bool,
) -> Result<NodeId> {
    let kind = match reader.read_u8()? {
        block::TYPE_LITERAL => reader.read_string()?,
        block::TYPE_REFERENCE => {
            let relative = reader.read_i32::<LittleEndian>()?;
            let target = reader.relative(base, relative)?;
            reader.read_string_at(target)?
        }
        tag => return Err(DecodeError::ExtendedTag(tag).into()),
    };
    trace!(name, kind, "extended property");

    let id = match kind.parse::<ExtendedKind>()? {
        ExtendedKind::Property => {
            reader.read_u16::<LittleEndian>()?;
            let id = tree.insert(Some(parent), name, WzValue::SubProperty);
            parse_property_list(reader, tree, id, base, eager)?;
            id
        }
        ExtendedKind::Canvas => {
            reader.read_u8()?;
            let id = tree.insert(Some(parent), name, WzValue::Canvas(CanvasData::default()));
            if reader.read_u8()? == 1 {
                reader.read_u16::<LittleEndian>()?;
                parse_property_list(reader, tree, id, base, eager)?;
            }
            let width = reader.read_compressed_int()?;
            let height = reader.read_compressed_int()?;
            let format = reader.read_compressed_int()?;
            let format2 = reader.read_u8()?;
            reader.read_u32::<LittleEndian>()?;
            let len = reader.read_i32::<LittleEndian>()?.saturating_sub(1);
            reader.read_u8()?;
            let payload = read_payload_field(reader, len.max(0), eager)?;
            tree.replace_value(
                id,
                WzValue::Canvas(CanvasData {
                    width,
                    height,
                    format,
                    format2,
                    payload,
                }),
            )?;
            id
        }
        ExtendedKind::Vector => {
            let x = reader.read_compressed_int()?;
            let y = reader.read_compressed_int()?;
            let id = tree.insert(Some(parent), name, WzValue::Vector);
            tree.insert(Some(id), "X", WzValue::Int(x));
            tree.insert(Some(id), "Y", WzValue::Int(y));
            id
        }
        ExtendedKind::Convex => {
            let count = reader.read_compressed_int()?;
            if !(0..=MAX_ENTRIES).contains(&count) {
                return Err(DecodeError::EntryCount(count).into());
            }
            let id = tree.insert(Some(parent), name, WzValue::Convex);
            for index in 0..count {
                parse_extended(reader, tree, id, &index.to_string(), base, eager)?;
            }
            id
        }
        ExtendedKind::Sound => {
            reader.read_u8()?;
            let len = reader.read_compressed_int()?;
            let duration_ms = reader.read_compressed_int()?;
            let mut header = reader.read_bytes(SOUND_HEADER_GUIDS.len())?;
            let format_len = reader.read_u8()?;
            header.push(format_len);
            header.extend(reader.read_bytes(format_len as usize)?);
            if len < 0 {
                return Err(DecodeError::LengthOutOfBounds(len as i64).into());
            }
            let payload = read_payload_field(reader, len, eager)?;
            tree.insert(
                Some(parent),
                name,
                WzValue::Sound(SoundData {
                    duration_ms,
                    header,
                    payload,
                }),
            )
        }
        ExtendedKind::Uol => {
            reader.read_u8()?;
            let target = reader.read_string_block(base)?;
            tree.insert(Some(parent), name, WzValue::Uol(target))
        }
    };
    Ok(id)
}

fn read_payload_field<R: Read + Seek>(
    reader: &mut WzReader<R>,
    len: i32,
    eager: bool,
) -> Result<Payload> {
    let len = len as u32;
    if eager {
        return Ok(Payload::Loaded(reader.read_bytes(len as usize)?));
    }
    let offset = reader.position()?;
    reader.ensure_remaining(len as u64)?;
    reader.seek_to(offset + len as u64)?;
    Ok(Payload::Deferred { offset, len })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use tracing_test::traced_test;

    fn reader(bytes: Vec<u8>) -> Result<WzReader<Cursor<Vec<u8>>>> {
        WzReader::new(Cursor::new(bytes), Keystream::new([0; 4]))
    }

    #[traced_test]
    #[test]
    fn compressed_ints() -> Result<()> {
        #[rustfmt::skip]
        let mut reader = reader(vec![
            0x64,
            0x80, 0xE8, 0x03, 0x00, 0x00,
            0x81,
            0x80, 0x80, 0xFF, 0xFF, 0xFF,
            0x80, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        ])?;
        assert_eq!(reader.read_compressed_int()?, 100);
        assert_eq!(reader.read_compressed_int()?, 1000);
        assert_eq!(reader.read_compressed_int()?, -127);
        assert_eq!(reader.read_compressed_int()?, -128);
        assert_eq!(reader.read_compressed_long()?, 1 << 32);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn plain_strings_with_zero_key() -> Result<()> {
        // "hp" narrow, then an empty string, then "é" wide
        let mut reader = reader(vec![0xFE, 0xC2, 0xDB, 0x00, 0x01, 0x43, 0xAA])?;
        assert_eq!(reader.read_string()?, "hp");
        assert_eq!(reader.read_string()?, "");
        assert_eq!(reader.read_string()?, "\u{E9}");
        Ok(())
    }

    #[traced_test]
    #[test]
    fn string_reference_restores_position() -> Result<()> {
        let mut reader = reader(vec![0x00, 0xFE, 0xC2, 0xDB, 0x01, 0x01, 0x00, 0x00, 0x00, 0x07])?;
        assert_eq!(reader.read_string_block(0)?, "hp");
        assert_eq!(reader.read_string_block(0)?, "hp");
        assert_eq!(reader.position()?, 9);
        assert_eq!(reader.read_u8()?, 0x07);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn unknown_block_tag() -> Result<()> {
        let mut reader = reader(vec![0x42])?;
        assert!(matches!(
            reader.read_string_block(0),
            Err(Error::Decode(DecodeError::StringBlockTag(0x42)))
        ));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn truncated_string_fails() -> Result<()> {
        let mut reader = reader(vec![0xF0, 0x41])?;
        assert!(matches!(
            reader.read_string(),
            Err(Error::Decode(DecodeError::LengthOutOfBounds(16)))
        ));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn parse_single_int_image() -> Result<()> {
        #[rustfmt::skip]
        let bytes = vec![
            0x73, 0xF8, 0xFA, 0xD9, 0xC3, 0xDD, 0xCB, 0xDD, 0xC4, 0xC8,
            0x00, 0x00,
            0x01,
            0x00, 0xFE, 0xC2, 0xDB,
            0x03, 0x64,
        ];
        let len = bytes.len() as i32;
        let mut reader = reader(bytes)?;
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Data.wz");
        let image = tree.insert(
            Some(root),
            "stats.img",
            WzValue::Image(ImageData::sourced(len, 0, 0)),
        );
        parse_image(&mut reader, &mut tree, image, false)?;

        assert!(tree.image_data(image)?.is_parsed());
        let hp = tree.child(image, "hp").ok_or(Error::InvalidArchive)?;
        assert_eq!(tree.value(hp)?, &WzValue::Int(100));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn failed_image_parse_leaves_no_children() -> Result<()> {
        #[rustfmt::skip]
        let bytes = vec![
            0x73, 0xF8, 0xFA, 0xD9, 0xC3, 0xDD, 0xCB, 0xDD, 0xC4, 0xC8,
            0x00, 0x00,
            0x02,
            0x00, 0xFE, 0xC2, 0xDB,
            0x03, 0x64,
            0x00, 0xFE, 0xC2, 0xDB,
            0x2A,
        ];
        let len = bytes.len() as i32;
        let mut reader = reader(bytes)?;
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Data.wz");
        let image = tree.insert(
            Some(root),
            "broken.img",
            WzValue::Image(ImageData::sourced(len, 0, 0)),
        );
        assert!(matches!(
            parse_image(&mut reader, &mut tree, image, false),
            Err(Error::Decode(DecodeError::PropertyTag(0x2A)))
        ));
        assert!(tree.children(image)?.is_empty());
        assert!(!tree.image_data(image)?.is_parsed());
        Ok(())
    }
}
