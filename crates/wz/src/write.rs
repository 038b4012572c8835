//! Types for writing WZ archives
//!

use binrw::BinWrite;
use byteorder::{LittleEndian, WriteBytesExt};
use indexmap::IndexMap;
use std::borrow::Cow;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use tracing::{debug, instrument, trace};
use wz_crypto::Keystream;

use crate::cache::StringCache;
use crate::error::{Error, NodeNotFoundError, Result};
use crate::offset;
use crate::read::WzReader;
use crate::tree::{NodeId, NodeKind, Payload, WzTree, WzValue};
use crate::types::{block, checksum, entry, property, ExtendedKind, WzHeader};
use crate::version::{version_hash, version_marker};

/// Codec for the primitive encodings of an archive
///
/// Positions are relative to the position of the inner writer when the codec was created, so
/// an archive or image can be written into the middle of a larger stream.
pub struct WzWriter<W> {
    inner: W,
    origin: u64,
    key: Keystream,
    hash: u32,
    data_start: u32,
    cache: StringCache,
}

impl<W: Write + Seek> WzWriter<W> {
    pub fn new(mut inner: W, key: Keystream) -> Result<Self> {
        let origin = inner.stream_position()?;
        Ok(Self {
            inner,
            origin,
            key,
            hash: 0,
            data_start: 0,
            cache: StringCache::new(),
        })
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

    /// Strings interned so far in this pass
    pub fn cache(&self) -> &StringCache {
        &self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?.saturating_sub(self.origin))
    }

    /// Writes a compressed int, one byte when the value lies in `-127..=127`
    pub fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        if value > i8::MIN as i32 && value <= i8::MAX as i32 {
            self.write_i8(value as i8)?;
        } else {
            self.write_i8(i8::MIN)?;
            self.write_i32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    /// Writes a compressed long, one byte when the value lies in `-127..=127`
    pub fn write_compressed_long(&mut self, value: i64) -> Result<()> {
        if value > i8::MIN as i64 && value <= i8::MAX as i64 {
            self.write_i8(value as i8)?;
        } else {
            self.write_i8(i8::MIN)?;
            self.write_i64::<LittleEndian>(value)?;
        }
        Ok(())
    }

    /// Writes an encrypted string. Text with any character above 127 is stored as UTF-16.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        if s.is_empty() {
            self.write_u8(0)?;
        } else if s.chars().any(|c| c as u32 > i8::MAX as u32) {
            self.write_wide(s)?;
        } else {
            self.write_narrow(s.as_bytes())?;
        }
        Ok(())
    }

    fn write_wide(&mut self, s: &str) -> Result<()> {
        let units = s.encode_utf16().collect::<Vec<_>>();
        if units.len() >= i8::MAX as usize {
            self.write_i8(i8::MAX)?;
            self.write_i32::<LittleEndian>(units.len() as i32)?;
        } else {
            self.write_i8(units.len() as i8)?;
        }

        self.key.ensure(units.len() * 2);
        let mut mask: u16 = 0xAAAA;
        for (i, unit) in units.into_iter().enumerate() {
            let key = u16::from_le_bytes([self.key[i * 2], self.key[i * 2 + 1]]);
            self.write_u16::<LittleEndian>(unit ^ key ^ mask)?;
            mask = mask.wrapping_add(1);
        }
        Ok(())
    }

    fn write_narrow(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() >= i8::MAX as usize {
            self.write_i8(i8::MIN)?;
            self.write_i32::<LittleEndian>(bytes.len() as i32)?;
        } else {
            self.write_i8(-(bytes.len() as i8))?;
        }

        self.key.ensure(bytes.len());
        let mut mask: u8 = 0xAA;
        let encoded = bytes
            .iter()
            .enumerate()
            .map(|(i, byte)| {
                let encoded = byte ^ self.key[i] ^ mask;
                mask = mask.wrapping_add(1);
                encoded
            })
            .collect::<Vec<_>>();
        self.write_all(&encoded)?;
        Ok(())
    }

    /// Writes a string block, referencing an earlier copy when one exists.
    ///
    /// Strings longer than four characters are interned at the position directly after their
    /// tag; later occurrences write `reference` and that position as an i32.
    pub fn write_string_value(&mut self, s: &str, literal: u8, reference: u8) -> Result<()> {
        if let Some(offset) = self.cache.value(s) {
            self.write_u8(reference)?;
            self.write_u32::<LittleEndian>(offset)?;
            return Ok(());
        }
        self.write_u8(literal)?;
        let offset = self.position()? as u32;
        self.write_string(s)?;
        self.cache.insert_value(s, offset);
        Ok(())
    }

    /// Writes the type and name of a directory entry, referencing an earlier identical pair
    /// when one exists. References are relative to the data start.
    pub fn write_object_value(&mut self, s: &str, kind: u8) -> Result<()> {
        if let Some(offset) = self.cache.object(kind, s) {
            self.write_u8(entry::REFERENCE)?;
            self.write_u32::<LittleEndian>(offset)?;
            return Ok(());
        }
        let offset = (self.position()? as u32).wrapping_sub(self.data_start);
        self.write_u8(kind)?;
        self.write_string(s)?;
        self.cache.insert_object(kind, s, offset);
        Ok(())
    }

    /// Writes an obfuscated offset for a field at the current position
    pub fn write_offset(&mut self, value: u32) -> Result<()> {
        let position = self.position()? as u32;
        let encoded = offset::obfuscate(position, self.data_start, self.hash, value);
        self.write_u32::<LittleEndian>(encoded)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for WzWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for WzWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            SeekFrom::Start(position) => SeekFrom::Start(self.origin + position),
            other => other,
        };
        Ok(self.inner.seek(pos)?.saturating_sub(self.origin))
    }
}

/// Serializes the property list of a loaded image into a standalone byte buffer.
///
/// String references inside the buffer are relative to its first byte, so the buffer can be
/// placed at any offset of an archive. Deferred payloads are fetched from `source`.
pub fn serialize_image<R: Read + Seek>(
    tree: &WzTree,
    image: NodeId,
    key: &Keystream,
    source: Option<&mut WzReader<R>>,
) -> Result<Vec<u8>> {
    if !tree.image_data(image)?.is_parsed() {
        return Err(Error::InvalidOperation(format!(
            "image {} is not loaded",
            tree.name(image)?
        )));
    }
    let mut writer = WzWriter::new(Cursor::new(Vec::new()), key.clone())?;
    ImageSerializer {
        writer: &mut writer,
        tree,
        source,
    }
    .write_image(image)?;
    Ok(writer.into_inner().into_inner())
}

struct ImageSerializer<'a, W, R> {
    writer: &'a mut WzWriter<W>,
    tree: &'a WzTree,
    source: Option<&'a mut WzReader<R>>,
}

impl<'a, W: Write + Seek, R: Read + Seek> ImageSerializer<'a, W, R> {
    fn write_image(&mut self, image: NodeId) -> Result<()> {
        self.writer.write_string_value(
            ExtendedKind::Property.as_str(),
            block::TYPE_LITERAL,
            block::TYPE_REFERENCE,
        )?;
        self.write_property_list(image)
    }

    fn write_property_list(&mut self, parent: NodeId) -> Result<()> {
        let tree = self.tree;
        let children = tree.children(parent)?;
        self.writer.write_u16::<LittleEndian>(0)?;
        self.writer.write_compressed_int(children.len() as i32)?;
        for child in children {
            self.writer
                .write_string_value(tree.name(*child)?, block::LITERAL, block::REFERENCE)?;
            self.write_property(*child)?;
        }
        Ok(())
    }

    fn write_property(&mut self, id: NodeId) -> Result<()> {
        let tree = self.tree;
        let writer = &mut *self.writer;
        match tree.value(id)? {
            WzValue::Null => writer.write_u8(property::NULL)?,
            WzValue::Short(value) => {
                writer.write_u8(property::SHORT)?;
                writer.write_i16::<LittleEndian>(*value)?;
            }
            WzValue::Int(value) => {
                writer.write_u8(property::INT)?;
                writer.write_compressed_int(*value)?;
            }
            WzValue::Long(value) => {
                writer.write_u8(property::LONG)?;
                writer.write_compressed_long(*value)?;
            }
            WzValue::Float(value) => {
                writer.write_u8(property::FLOAT)?;
                if *value == 0.0 {
                    writer.write_u8(0)?;
                } else {
                    writer.write_u8(property::FLOAT_PRESENT)?;
                    writer.write_f32::<LittleEndian>(*value)?;
                }
            }
            WzValue::Double(value) => {
                writer.write_u8(property::DOUBLE)?;
                writer.write_f64::<LittleEndian>(*value)?;
            }
            WzValue::String(value) => {
                writer.write_u8(property::STRING)?;
                writer.write_string_value(value, block::LITERAL, block::REFERENCE)?;
            }
            WzValue::Directory(_) | WzValue::Image(_) => {
                return Err(Error::InvalidOperation(format!(
                    "{} cannot be stored inside an image",
                    tree.full_path(id)?
                )))
            }
            _ => {
                writer.write_u8(property::EXTENDED)?;
                let start = writer.position()?;
                writer.write_u32::<LittleEndian>(0)?;
                self.write_extended(id)?;

                let writer = &mut *self.writer;
                let end = writer.position()?;
                writer.seek(SeekFrom::Start(start))?;
                writer.write_u32::<LittleEndian>((end - start - 4) as u32)?;
                writer.seek(SeekFrom::Start(end))?;
            }
        }
        Ok(())
    }

    fn write_kind(&mut self, kind: ExtendedKind) -> Result<()> {
        self.writer
            .write_string_value(kind.as_str(), block::TYPE_LITERAL, block::TYPE_REFERENCE)
    }

    fn write_extended(&mut self, id: NodeId) -> Result<()> {
        let tree = self.tree;
        match tree.value(id)? {
            WzValue::SubProperty => {
                self.write_kind(ExtendedKind::Property)?;
                self.write_property_list(id)?;
            }
            WzValue::Canvas(canvas) => {
                self.write_kind(ExtendedKind::Canvas)?;
                self.writer.write_u8(0)?;
                if tree.children(id)?.is_empty() {
                    self.writer.write_u8(0)?;
                } else {
                    self.writer.write_u8(1)?;
                    self.write_property_list(id)?;
                }
                let payload = self.load(&canvas.payload)?;
                let writer = &mut *self.writer;
                writer.write_compressed_int(canvas.width)?;
                writer.write_compressed_int(canvas.height)?;
                writer.write_compressed_int(canvas.format)?;
                writer.write_u8(canvas.format2)?;
                writer.write_i32::<LittleEndian>(0)?;
                writer.write_i32::<LittleEndian>(payload.len() as i32 + 1)?;
                writer.write_u8(0)?;
                writer.write_all(&payload)?;
            }
            WzValue::Vector => {
                let (x, y) = tree.vector(id).ok_or(Error::InvalidOperation(format!(
                    "vector {} lacks X or Y",
                    tree.full_path(id)?
                )))?;
                self.write_kind(ExtendedKind::Vector)?;
                self.writer.write_compressed_int(x)?;
                self.writer.write_compressed_int(y)?;
            }
            WzValue::Convex => {
                self.write_kind(ExtendedKind::Convex)?;
                let children = tree.children(id)?;
                self.writer.write_compressed_int(children.len() as i32)?;
                for child in children {
                    if !tree.kind(*child)?.is_extended() {
                        return Err(Error::UnexpectedKind {
                            id: *child,
                            expected: NodeKind::SubProperty,
                        });
                    }
                    self.write_extended(*child)?;
                }
            }
            WzValue::Sound(sound) => {
                self.write_kind(ExtendedKind::Sound)?;
                let payload = self.load(&sound.payload)?;
                let writer = &mut *self.writer;
                writer.write_u8(0)?;
                writer.write_compressed_int(payload.len() as i32)?;
                writer.write_compressed_int(sound.duration_ms)?;
                writer.write_all(&sound.header)?;
                writer.write_all(&payload)?;
            }
            WzValue::Uol(target) => {
                self.write_kind(ExtendedKind::Uol)?;
                self.writer.write_u8(0)?;
                self.writer
                    .write_string_value(target, block::LITERAL, block::REFERENCE)?;
            }
            other => {
                return Err(Error::InvalidOperation(format!(
                    "{} is not an extended property",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    fn load(&mut self, payload: &'a Payload) -> Result<Cow<'a, [u8]>> {
        match payload {
            Payload::Loaded(bytes) => Ok(Cow::Borrowed(bytes)),
            Payload::Deferred { offset, len } => {
                let source = self.source.as_deref_mut().ok_or(Error::InvalidOperation(
                    "deferred payload without a source archive".into(),
                ))?;
                Ok(Cow::Owned(source.read_payload(*offset, *len)?))
            }
        }
    }
}

/// Everything needed to write an archive
pub(crate) struct SaveRequest<'a, R> {
    pub tree: &'a WzTree,
    pub root: NodeId,
    pub header: &'a WzHeader,
    pub key: &'a Keystream,
    pub version: i16,
    pub source: Option<&'a mut WzReader<R>>,
}

#[derive(Debug, Clone, Copy)]
enum StagedSource {
    /// Freshly serialized bytes in the staging buffer
    Buffer { start: usize },
    /// Untouched bytes copied from the source archive
    Source { offset: u32 },
}

#[derive(Debug, Clone, Copy)]
struct StagedImage {
    source: StagedSource,
    len: u32,
    checksum: i32,
}

#[derive(Debug)]
struct TableLayout {
    /// Start and length of each directory's own table
    tables: IndexMap<NodeId, (u64, u64)>,
    sizes: IndexMap<NodeId, i32>,
    end: u64,
}

struct Saver<'a, R> {
    tree: &'a WzTree,
    key: &'a Keystream,
    source: Option<&'a mut WzReader<R>>,
    data_start: u32,
    hash: u32,
    buffer: Vec<u8>,
    staged: IndexMap<NodeId, StagedImage>,
}

impl<R: Read + Seek> Saver<'_, R> {
    /// Serializes loaded images into the staging buffer, subdirectories first
    fn stage(&mut self, directory: NodeId) -> Result<()> {
        let tree = self.tree;
        for subdirectory in tree.directories(directory) {
            self.stage(subdirectory)?;
        }
        for image in tree.images(directory) {
            let data = tree.image_data(image)?;
            let staged = if data.is_parsed() {
                let bytes = serialize_image(tree, image, self.key, self.source.as_deref_mut())?;
                let start = self.buffer.len();
                self.buffer.extend_from_slice(&bytes);
                trace!(image = tree.name(image)?, len = bytes.len(), "staged image");
                StagedImage {
                    source: StagedSource::Buffer { start },
                    len: bytes.len() as u32,
                    checksum: checksum(&bytes),
                }
            } else {
                if data.size < 0 {
                    return Err(Error::InvalidOperation(format!(
                        "image {} has a negative size",
                        tree.full_path(image)?
                    )));
                }
                StagedImage {
                    source: StagedSource::Source {
                        offset: data.offset,
                    },
                    len: data.size as u32,
                    checksum: data.checksum,
                }
            };
            self.staged.insert(image, staged);
        }
        Ok(())
    }

    /// Writes the table of `directory` followed by the tables of its subdirectories
    fn write_tables<W: Write + Seek>(
        &self,
        writer: &mut WzWriter<W>,
        directory: NodeId,
        sizes: &IndexMap<NodeId, i32>,
        offsets: Option<&IndexMap<NodeId, u32>>,
        tables: &mut IndexMap<NodeId, (u64, u64)>,
    ) -> Result<()> {
        let tree = self.tree;
        let offset_of = |id: &NodeId| offsets.and_then(|o| o.get(id)).copied().unwrap_or(0);
        let subdirectories = tree.directories(directory).collect::<Vec<_>>();
        let images = tree.images(directory).collect::<Vec<_>>();

        let start = writer.position()?;
        writer.write_compressed_int((subdirectories.len() + images.len()) as i32)?;
        for subdirectory in &subdirectories {
            writer.write_object_value(tree.name(*subdirectory)?, entry::DIRECTORY)?;
            writer.write_compressed_int(sizes.get(subdirectory).copied().unwrap_or(0))?;
            writer.write_compressed_int(tree.directory_data(*subdirectory)?.checksum)?;
            writer.write_offset(offset_of(subdirectory))?;
        }
        for image in &images {
            let staged = self.staged.get(image).ok_or(NodeNotFoundError::Id(*image))?;
            writer.write_object_value(tree.name(*image)?, entry::IMAGE)?;
            writer.write_compressed_int(staged.len as i32)?;
            writer.write_compressed_int(staged.checksum)?;
            writer.write_offset(offset_of(image))?;
        }
        tables.insert(directory, (start, writer.position()? - start));

        for subdirectory in subdirectories {
            self.write_tables(writer, subdirectory, sizes, offsets, tables)?;
        }
        Ok(())
    }

    /// Sizes feed back into the tables as compressed ints, so dry runs repeat until they settle
    fn layout(&self, root: NodeId, table_start: u64) -> Result<TableLayout> {
        let tree = self.tree;
        let directories = tree
            .walk(root)
            .filter(|id| tree.kind(*id).is_ok_and(|kind| kind == NodeKind::Directory))
            .count();

        let mut sizes = IndexMap::new();
        for _ in 0..directories + 2 {
            let mut writer = WzWriter::new(Cursor::new(Vec::new()), self.key.clone())?;
            writer.set_data_start(self.data_start);
            writer.set_hash(self.hash);
            writer.seek(SeekFrom::Start(table_start))?;

            let mut tables = IndexMap::new();
            self.write_tables(&mut writer, root, &sizes, None, &mut tables)?;
            let end = writer.position()?;

            let mut settled = IndexMap::new();
            self.directory_size(root, &tables, &mut settled)?;
            if settled == sizes {
                debug!(directories, end, "directory layout settled");
                return Ok(TableLayout { tables, sizes, end });
            }
            sizes = settled;
        }
        Err(Error::InvalidOperation(
            "directory layout did not settle".into(),
        ))
    }

    fn directory_size(
        &self,
        directory: NodeId,
        tables: &IndexMap<NodeId, (u64, u64)>,
        sizes: &mut IndexMap<NodeId, i32>,
    ) -> Result<u64> {
        let tree = self.tree;
        let (_, table_len) = tables
            .get(&directory)
            .copied()
            .ok_or(NodeNotFoundError::Id(directory))?;
        let mut size = table_len;
        for subdirectory in tree.directories(directory) {
            size += self.directory_size(subdirectory, tables, sizes)?;
        }
        for image in tree.images(directory) {
            size += self.staged.get(&image).map_or(0, |staged| staged.len as u64);
        }
        sizes.insert(directory, size.min(i32::MAX as u64) as i32);
        Ok(size)
    }
}

/// Writes a complete archive into `out`
#[instrument(skip_all, fields(version = request.version), err)]
pub(crate) fn save_archive<W: Write + Seek, R: Read + Seek>(
    out: W,
    request: SaveRequest<'_, R>,
) -> Result<W> {
    let hash = version_hash(request.version);
    let marker = version_marker(hash);

    let mut header = request.header.clone();
    header.data_start = header.data_start.max(header.encoded_len());
    let data_start = header.data_start;
    let table_start = data_start as u64 + 2;

    let mut saver = Saver {
        tree: request.tree,
        key: request.key,
        source: request.source,
        data_start,
        hash,
        buffer: Vec::new(),
        staged: IndexMap::new(),
    };
    saver.stage(request.root)?;
    let layout = saver.layout(request.root, table_start)?;

    let mut offsets = IndexMap::new();
    for (directory, (start, _)) in &layout.tables {
        offsets.insert(*directory, *start as u32);
    }
    let mut cursor = layout.end;
    for (image, staged) in &saver.staged {
        offsets.insert(*image, cursor as u32);
        cursor += staged.len as u64;
    }
    if cursor > u32::MAX as u64 {
        return Err(Error::InvalidOperation(
            "archive would exceed the 4 GiB offset range".into(),
        ));
    }
    header.file_size = cursor - data_start as u64;

    let mut writer = WzWriter::new(out, request.key.clone())?;
    header.write(&mut writer)?;
    let padding = (data_start as u64).saturating_sub(writer.position()?);
    writer.write_all(&vec![0u8; padding as usize])?;
    writer.write_i16::<LittleEndian>(marker)?;
    writer.set_data_start(data_start);
    writer.set_hash(hash);

    let mut tables = IndexMap::new();
    saver.write_tables(
        &mut writer,
        request.root,
        &layout.sizes,
        Some(&offsets),
        &mut tables,
    )?;
    if writer.position()? != layout.end {
        return Err(Error::InvalidOperation(
            "directory tables changed size between passes".into(),
        ));
    }

    for staged in saver.staged.values() {
        match staged.source {
            StagedSource::Buffer { start } => {
                writer.write_all(&saver.buffer[start..start + staged.len as usize])?;
            }
            StagedSource::Source { offset } => {
                let source = saver.source.as_deref_mut().ok_or(Error::InvalidOperation(
                    "unloaded image without a source archive".into(),
                ))?;
                writer.write_all(&source.read_payload(offset as u64, staged.len)?)?;
            }
        }
    }
    writer.flush()?;
    debug!(len = cursor, images = saver.staged.len(), "archive written");
    Ok(writer.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::{CanvasData, ImageData, SoundData};
    use pretty_assertions::{assert_eq, assert_str_eq};
    use tracing_test::traced_test;

    type Source = WzReader<Cursor<Vec<u8>>>;

    fn writer(iv: [u8; 4]) -> Result<WzWriter<Cursor<Vec<u8>>>> {
        WzWriter::new(Cursor::new(Vec::new()), Keystream::new(iv))
    }

    fn bytes(writer: WzWriter<Cursor<Vec<u8>>>) -> Vec<u8> {
        writer.into_inner().into_inner()
    }

    #[traced_test]
    #[test]
    fn compressed_ints() -> Result<()> {
        let mut writer = writer([0; 4])?;
        for value in [100, 1000, -127, -128, 127, 128] {
            writer.write_compressed_int(value)?;
        }
        writer.write_compressed_long(-5)?;

        #[rustfmt::skip]
        let expected = vec![
            0x64,
            0x80, 0xE8, 0x03, 0x00, 0x00,
            0x81,
            0x80, 0x80, 0xFF, 0xFF, 0xFF,
            0x7F,
            0x80, 0x80, 0x00, 0x00, 0x00,
            0xFB,
        ];
        assert_str_eq!(format!("{:02X?}", bytes(writer)), format!("{:02X?}", expected));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn strings_with_zero_key() -> Result<()> {
        let mut writer = writer([0; 4])?;
        writer.write_string("hp")?;
        writer.write_string("")?;
        writer.write_string("\u{E9}")?;
        let expected = vec![0xFE, 0xC2, 0xDB, 0x00, 0x01, 0x43, 0xAA];
        assert_str_eq!(format!("{:02X?}", bytes(writer)), format!("{:02X?}", expected));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn long_strings_use_sentinels() -> Result<()> {
        let narrow = "a".repeat(127);
        let wide = "\u{AC00}".repeat(200);
        let mut writer = writer([0x4D, 0x23, 0xC7, 0x2B])?;
        writer.write_string(&narrow)?;
        writer.write_string(&wide)?;
        let written = bytes(writer);
        assert_eq!(&written[..5], &[0x80, 0x7F, 0x00, 0x00, 0x00]);
        assert_eq!(&written[5 + 127..5 + 127 + 5], &[0x7F, 0xC8, 0x00, 0x00, 0x00]);

        let mut reader = WzReader::new(Cursor::new(written), Keystream::new([0x4D, 0x23, 0xC7, 0x2B]))?;
        assert_eq!(reader.read_string()?, narrow);
        assert_eq!(reader.read_string()?, wide);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn encrypted_strings_round_trip() -> Result<()> {
        let iv = [0xB9, 0x7D, 0x63, 0xE9];
        let samples = ["info", "Mob/0100100.img", "\u{D55C}\u{AE00} text", "x"];
        let mut writer = writer(iv)?;
        for sample in samples {
            writer.write_string(sample)?;
        }
        let mut reader = WzReader::new(Cursor::new(bytes(writer)), Keystream::new(iv))?;
        for sample in samples {
            assert_eq!(reader.read_string()?, sample);
        }
        Ok(())
    }

    #[traced_test]
    #[test]
    fn repeated_values_are_referenced() -> Result<()> {
        let mut writer = writer([0; 4])?;
        writer.write_string_value("Property", block::TYPE_LITERAL, block::TYPE_REFERENCE)?;
        let first = writer.position()?;
        writer.write_string_value("Property", block::TYPE_LITERAL, block::TYPE_REFERENCE)?;
        let second = writer.position()? - first;
        assert!(second < first);

        let before = writer.position()?;
        writer.write_string_value("name", block::LITERAL, block::REFERENCE)?;
        writer.write_string_value("name", block::LITERAL, block::REFERENCE)?;
        assert_eq!(writer.position()? - before, 12);

        let written = bytes(writer);
        assert_eq!(&written[10..15], &[0x1B, 0x01, 0x00, 0x00, 0x00]);

        let mut reader = WzReader::new(Cursor::new(written), Keystream::new([0; 4]))?;
        for expected in ["Property", "Property", "name", "name"] {
            assert_eq!(reader.read_string_block(0)?, expected);
        }
        Ok(())
    }

    #[traced_test]
    #[test]
    fn repeated_objects_are_referenced() -> Result<()> {
        let mut writer = writer([0; 4])?;
        writer.write_all(&[0u8; 8])?;
        writer.set_data_start(6);
        writer.write_object_value("0100100.img", entry::IMAGE)?;
        writer.write_object_value("0100100.img", entry::DIRECTORY)?;
        let reference = writer.position()?;
        writer.write_object_value("0100100.img", entry::IMAGE)?;

        let written = bytes(writer);
        let reference = reference as usize;
        assert_eq!(&written[reference..], &[0x02, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(written[8], entry::IMAGE);
        Ok(())
    }

    #[traced_test]
    #[test]
    fn single_int_image_bytes() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Data.wz");
        let image = tree.add_image(root, "stats.img")?;
        tree.add_property(image, "hp", WzValue::Int(100))?;

        let actual = serialize_image::<Cursor<Vec<u8>>>(&tree, image, &Keystream::new([0; 4]), None)?;
        #[rustfmt::skip]
        let expected = vec![
            0x73, 0xF8, 0xFA, 0xD9, 0xC3, 0xDD, 0xCB, 0xDD, 0xC4, 0xC8,
            0x00, 0x00,
            0x01,
            0x00, 0xFE, 0xC2, 0xDB,
            0x03, 0x64,
        ];
        assert_str_eq!(format!("{:02X?}", actual), format!("{:02X?}", expected));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn nested_image_round_trip() -> Result<()> {
        let key = Keystream::new([0x4D, 0x23, 0xC7, 0x2B]);
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Data.wz");
        let image = tree.add_image(root, "0100100.img")?;
        let info = tree.add_property(image, "info", WzValue::SubProperty)?;
        tree.add_property(info, "level", WzValue::Short(7))?;
        tree.add_property(info, "exp", WzValue::Long(1 << 40))?;
        tree.add_property(info, "speed", WzValue::Float(-0.5))?;
        tree.add_property(info, "still", WzValue::Float(0.0))?;
        tree.add_property(info, "ratio", WzValue::Double(1.25))?;
        tree.add_property(info, "nothing", WzValue::Null)?;
        tree.add_property(info, "description", WzValue::String("description".into()))?;
        let stand = tree.add_property(image, "stand", WzValue::SubProperty)?;
        let frame = tree.add_property(
            stand,
            "0",
            WzValue::Canvas(CanvasData {
                width: 2,
                height: 1,
                format: 2,
                format2: 0,
                payload: Payload::Loaded(vec![1, 2, 3, 4]),
            }),
        )?;
        tree.add_vector(frame, "origin", 1, -1)?;
        tree.add_property(frame, "delay", WzValue::Int(180))?;
        let convex = tree.add_property(stand, "foothold", WzValue::Convex)?;
        tree.add_vector(convex, "0", -5, 10)?;
        tree.add_vector(convex, "1", 5, 10)?;
        tree.add_property(
            image,
            "hit",
            WzValue::Sound(SoundData {
                duration_ms: 320,
                header: SoundData::header_for(&[0x55, 0x00]),
                payload: Payload::Loaded(vec![9; 32]),
            }),
        )?;
        tree.add_property(image, "link", WzValue::Uol("../stand/0".into()))?;

        let bytes = serialize_image::<Cursor<Vec<u8>>>(&tree, image, &key, None)?;
        let len = bytes.len() as i32;
        let mut reader: Source = WzReader::new(Cursor::new(bytes), key)?;
        let mut parsed = WzTree::new();
        let parsed_root = parsed.add_root_directory("Data.wz");
        let parsed_image = parsed.insert(
            Some(parsed_root),
            "0100100.img",
            WzValue::Image(ImageData::sourced(len, 0, 0)),
        );
        crate::read::parse_image(&mut reader, &mut parsed, parsed_image, true)?;

        assert!(tree.structurally_eq(image, &parsed, parsed_image));
        Ok(())
    }

    #[traced_test]
    #[test]
    fn unloaded_images_cannot_be_serialized() -> Result<()> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory("Data.wz");
        let image = tree.insert(
            Some(root),
            "a.img",
            WzValue::Image(ImageData::sourced(4, 0, 0)),
        );
        assert!(matches!(
            serialize_image::<Cursor<Vec<u8>>>(&tree, image, &Keystream::new([0; 4]), None),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }
}
