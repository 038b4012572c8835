//! Archive handle tying a source, its keystream and the node tree together
//!

use binrw::BinRead;
use bon::Builder;
use byteorder::{LittleEndian, ReadBytesExt};
use std::borrow::Cow;
use std::fmt::{self, Debug};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use wz_crypto::{Keystream, WzVariant};

use crate::error::{Error, Result};
use crate::read::{self, WzReader};
use crate::tree::{ImageState, NodeId, NodeKind, Payload, WzFragment, WzTree, WzValue};
use crate::types::{checksum, WzHeader};
use crate::version::{self, WzVersion};
use crate::write::{self, SaveRequest};

/// Name given to the root directory when none is supplied
pub const DEFAULT_NAME: &str = "Data.wz";

/// Options for how an archive is opened
#[derive(Debug, Clone, Default, Builder)]
pub struct OpenOptions {
    /// Variant selecting the IV
    #[builder(default)]
    pub variant: WzVariant,

    /// Real version, discovered from the header when absent
    pub version: Option<i16>,

    /// Name of the root directory
    #[builder(into)]
    pub name: Option<String>,

    /// Load canvas and sound payloads while parsing instead of re-reading them on demand
    #[builder(default)]
    pub eager_payloads: bool,
}

/// WZ archive reader and editor
///
/// ```no_run
/// use std::fs::File;
/// use wz::{OpenOptions, WzArchive};
///
/// fn print_tree() -> wz::error::Result<()> {
///     let file = File::open("Mob.wz")?;
///     let mut archive = WzArchive::open(file, OpenOptions::builder().name("Mob.wz").build())?;
///
///     if let Some(hp) = archive.get("Mob.wz/0100100.img/info/maxHP")? {
///         println!("{:?}", archive.tree().int(hp));
///     }
///     Ok(())
/// }
/// ```
pub struct WzArchive<R = Cursor<Vec<u8>>> {
    reader: Option<WzReader<R>>,
    header: WzHeader,
    key: Keystream,
    variant: WzVariant,
    version: WzVersion,
    tree: WzTree,
    root: NodeId,
    eager_payloads: bool,
}

impl<R> Debug for WzArchive<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WzArchive")
            .field("header", &self.header)
            .field("variant", &self.variant)
            .field("version", &self.version)
            .field("nodes", &self.tree.len())
            .finish()
    }
}

impl WzArchive {
    /// Starts an empty archive that only exists in memory
    pub fn create(name: &str, version: i16, variant: WzVariant) -> Result<Self> {
        let iv = match variant {
            WzVariant::Generate => [0; 4],
            ref variant => variant.iv()?,
        };
        Self::create_with_iv(name, version, variant, iv)
    }

    /// Starts an empty archive using an explicit IV
    pub fn create_with_iv(
        name: &str,
        version: i16,
        variant: WzVariant,
        iv: [u8; 4],
    ) -> Result<Self> {
        let mut tree = WzTree::new();
        let root = tree.add_root_directory(name);
        Ok(Self {
            reader: None,
            header: WzHeader::default(),
            key: Keystream::new(iv),
            variant,
            version: WzVersion::known(version),
            tree,
            root,
            eager_payloads: false,
        })
    }
}

impl WzArchive<BufReader<File>> {
    /// Opens an archive from disk. The root directory is named after the file unless the
    /// options name it.
    pub fn open_path(path: impl AsRef<Path>, mut options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        if options.name.is_none() {
            options.name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }
        WzArchive::open(BufReader::new(File::open(path)?), options)
    }
}

impl<R: Read + Seek> WzArchive<R> {
    /// Opens an archive whose IV is fixed by its variant
    #[instrument(skip(reader), err)]
    pub fn open(reader: R, options: OpenOptions) -> Result<Self> {
        if options.variant == WzVariant::Generate {
            return Err(Error::InvalidOperation(
                "the generate variant must be opened with an explicit IV".into(),
            ));
        }
        let iv = options.variant.iv()?;
        Self::open_inner(reader, iv, options)
    }

    /// Opens an archive of the generate variant with an explicit IV
    #[instrument(skip(reader), err)]
    pub fn open_with_iv(reader: R, iv: [u8; 4], options: OpenOptions) -> Result<Self> {
        if options.variant != WzVariant::Generate {
            return Err(Error::InvalidOperation(format!(
                "the {} variant has a fixed IV",
                options.variant
            )));
        }
        Self::open_inner(reader, iv, options)
    }

    fn open_inner(reader: R, iv: [u8; 4], options: OpenOptions) -> Result<Self> {
        let key = Keystream::new(iv);
        let mut reader = WzReader::new(reader, key.clone())?;
        reader.seek_to(0)?;
        let header = WzHeader::read(&mut reader).map_err(|_| Error::InvalidArchive)?;
        if header.data_start < header.encoded_len() || header.data_start as u64 + 2 > reader.len() {
            return Err(Error::InvalidArchive);
        }
        reader.set_data_start(header.data_start);
        reader.seek_to(header.data_start as u64)?;
        let marker = reader.read_i16::<LittleEndian>()?;
        let table = reader.position()?;
        let name = options.name.as_deref().unwrap_or(DEFAULT_NAME);
        debug!(data_start = header.data_start, marker, "read header");

        let (version, tree, root) = match options.version {
            Some(version) => {
                let hash = version::candidate_hash(marker, version)
                    .ok_or(Error::VersionMismatch { version, marker })?;
                let (tree, root) = version::parse_tree(&mut reader, table, hash, name)?;
                (version, tree, root)
            }
            None => {
                let discovery = version::discover(&mut reader, marker, name)?;
                (discovery.version, discovery.tree, discovery.root)
            }
        };
        reader.set_hash(version::version_hash(version));
        info!(version, nodes = tree.len(), "opened archive");

        Ok(Self {
            reader: Some(reader),
            header,
            key,
            variant: options.variant,
            version: WzVersion::known(version),
            tree,
            root,
            eager_payloads: options.eager_payloads,
        })
    }
}

impl<R> WzArchive<R> {
    pub fn header(&self) -> &WzHeader {
        &self.header
    }

    pub fn variant(&self) -> &WzVariant {
        &self.variant
    }

    pub fn iv(&self) -> [u8; 4] {
        self.key.iv()
    }

    pub fn version(&self) -> WzVersion {
        self.version
    }

    /// Assigns the real version used by the next save
    pub fn set_version(&mut self, version: i16) {
        self.version = WzVersion::known(version);
    }

    pub fn tree(&self) -> &WzTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut WzTree {
        &mut self.tree
    }

    /// Root directory, named after the archive
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn name(&self) -> &str {
        self.tree.name(self.root).unwrap_or(DEFAULT_NAME)
    }

    pub fn is_parsed(&self, image: NodeId) -> Result<bool> {
        Ok(self.tree.image_data(image)?.is_parsed())
    }

    /// Releases the archive, handing back its source
    pub fn close(self) -> Option<R> {
        self.reader.map(WzReader::into_inner)
    }
}

impl<R: Read + Seek> WzArchive<R> {
    /// Loads the properties of an image. Already loaded images are left untouched.
    #[instrument(skip(self), err)]
    pub fn materialize(&mut self, image: NodeId) -> Result<()> {
        if self.is_parsed(image)? {
            return Ok(());
        }
        let reader = self.reader.as_mut().ok_or(Error::InvalidOperation(
            "image has no source to load from".into(),
        ))?;
        read::parse_image(reader, &mut self.tree, image, self.eager_payloads)
    }

    /// Drops the properties of an unchanged image so they are read again on next use.
    ///
    /// Returns false when the image is kept, because it was changed or has no source.
    #[instrument(skip(self), err)]
    pub fn release(&mut self, image: NodeId) -> Result<bool> {
        let data = self.tree.image_data(image)?;
        if !data.is_parsed() {
            return Ok(true);
        }
        if data.is_changed() || self.reader.is_none() {
            debug!("image is pinned");
            return Ok(false);
        }
        self.tree.clear_children(image)?;
        self.tree.image_data_mut(image)?.state = ImageState::Unparsed;
        Ok(true)
    }

    /// Loads an image for the lifetime of the returned guard. An image that was not loaded
    /// before is released again when the guard drops.
    pub fn acquire(&mut self, image: NodeId) -> Result<ImageGuard<'_, R>> {
        let release = !self.is_parsed(image)?;
        self.materialize(image)?;
        Ok(ImageGuard {
            archive: self,
            image,
            release,
        })
    }

    /// Loads an image and pins it until the archive is saved
    pub fn mark_changed(&mut self, image: NodeId) -> Result<()> {
        self.materialize(image)?;
        self.tree.image_data_mut(image)?.changed = true;
        Ok(())
    }

    /// Payload bytes of a canvas or sound, read from the source when deferred
    pub fn payload(&mut self, id: NodeId) -> Result<Cow<'_, [u8]>> {
        let payload = match self.tree.value(id)? {
            WzValue::Canvas(canvas) => &canvas.payload,
            WzValue::Sound(sound) => &sound.payload,
            _ => {
                return Err(Error::UnexpectedKind {
                    id,
                    expected: NodeKind::Canvas,
                })
            }
        };
        match payload {
            Payload::Loaded(bytes) => Ok(Cow::Borrowed(bytes)),
            Payload::Deferred { offset, len } => {
                let reader = self.reader.as_mut().ok_or(Error::InvalidOperation(
                    "deferred payload without a source archive".into(),
                ))?;
                Ok(Cow::Owned(reader.read_payload(*offset, *len)?))
            }
        }
    }

    /// Copies a subtree into a fragment that no longer refers to this archive's source.
    ///
    /// Unloaded images below `id` are loaded for the copy and released again, and deferred
    /// payloads are read into memory, so the fragment can be grafted into any archive.
    #[instrument(skip(self), err)]
    pub fn clone_subtree(&mut self, id: NodeId) -> Result<WzFragment> {
        let unparsed = self
            .tree
            .walk(id)
            .filter(|node| {
                self.tree
                    .image_data(*node)
                    .is_ok_and(|data| !data.is_parsed())
            })
            .collect::<Vec<_>>();
        let result = self.clone_loaded(id, &unparsed);
        for image in unparsed {
            self.release(image)?;
        }
        result
    }

    fn clone_loaded(&mut self, id: NodeId, images: &[NodeId]) -> Result<WzFragment> {
        for image in images {
            self.materialize(*image)?;
        }
        let mut fragment = self.tree.clone_subtree(id)?;
        let nodes = fragment.tree().walk(fragment.root()).collect::<Vec<_>>();
        for node in nodes {
            let payload = match fragment.tree_mut().value_mut(node)? {
                WzValue::Canvas(canvas) => &mut canvas.payload,
                WzValue::Sound(sound) => &mut sound.payload,
                _ => continue,
            };
            if let Payload::Deferred { offset, len } = *payload {
                let reader = self.reader.as_mut().ok_or(Error::InvalidOperation(
                    "deferred payload without a source archive".into(),
                ))?;
                *payload = Payload::Loaded(reader.read_payload(offset, len)?);
            }
        }
        Ok(fragment)
    }

    /// Serializes a loaded image into standalone bytes
    pub fn serialize_image(&mut self, image: NodeId) -> Result<Vec<u8>> {
        self.materialize(image)?;
        write::serialize_image(&self.tree, image, &self.key, self.reader.as_mut())
    }

    /// Adds an image parsed from standalone bytes, as produced by [`WzArchive::serialize_image`]
    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    pub fn import_image(&mut self, parent: NodeId, name: &str, bytes: Vec<u8>) -> Result<NodeId> {
        let size = bytes.len() as i32;
        let sum = checksum(&bytes);
        let image = self.tree.add_image(parent, name)?;
        {
            let data = self.tree.image_data_mut(image)?;
            data.size = size;
            data.checksum = sum;
            data.state = ImageState::Unparsed;
        }

        let mut reader = WzReader::new(Cursor::new(bytes), self.key.clone())?;
        if let Err(error) = read::parse_image(&mut reader, &mut self.tree, image, true) {
            self.tree.remove(image)?;
            return Err(error);
        }
        self.tree.image_data_mut(image)?.changed = true;
        Ok(image)
    }

    /// Writes the archive into `out`, returning the writer.
    ///
    /// Loaded images are serialized again, unloaded images are copied from the source
    /// verbatim. `out` must not be the stream this archive reads from.
    pub fn save<W: Write + Seek>(&mut self, out: W) -> Result<W> {
        let version = self.version.real().ok_or(Error::InvalidOperation(
            "archive version is unknown".into(),
        ))?;
        write::save_archive(
            out,
            SaveRequest {
                tree: &self.tree,
                root: self.root,
                header: &self.header,
                key: &self.key,
                version,
                source: self.reader.as_mut(),
            },
        )
    }

    /// Writes the archive to a file, which must not be the file this archive reads from
    pub fn save_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = self.save(BufWriter::new(file))?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps an image loaded while borrowed
///
/// Dereferences to the archive, so the image and its properties can be used through the
/// guard.
pub struct ImageGuard<'a, R: Read + Seek> {
    archive: &'a mut WzArchive<R>,
    image: NodeId,
    release: bool,
}

impl<R: Read + Seek> ImageGuard<'_, R> {
    pub fn image(&self) -> NodeId {
        self.image
    }
}

impl<R: Read + Seek> Deref for ImageGuard<'_, R> {
    type Target = WzArchive<R>;

    fn deref(&self) -> &Self::Target {
        &*self.archive
    }
}

impl<R: Read + Seek> DerefMut for ImageGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.archive
    }
}

impl<R: Read + Seek> Drop for ImageGuard<'_, R> {
    fn drop(&mut self) {
        if self.release {
            if let Err(error) = self.archive.release(self.image) {
                warn!(%error, "failed to release image");
            }
        }
    }
}
