//! Version hashing and discovery
//!
//! The header stores only an 8-bit marker derived from the client version. The full content
//! hash that keys offset obfuscation is recomputed from the real version on demand. When the
//! real version is unknown, every candidate whose marker matches is tried until one yields a
//! readable directory tree.

use byteorder::ReadBytesExt;
use std::io::{Read, Seek};
use tracing::{debug, info, instrument, trace};

use crate::error::{DecodeError, Error, Result};
use crate::read::{self, WzReader};
use crate::tree::{NodeId, WzTree};
use crate::types::block;

/// Highest version tried during discovery
pub const MAX_VERSION: i16 = i16::MAX;

/// Real and encoded version of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WzVersion {
    marker: i16,
    real: Option<i16>,
}

impl WzVersion {
    /// Version with a known real value
    pub fn known(real: i16) -> Self {
        Self {
            marker: version_marker(version_hash(real)),
            real: Some(real),
        }
    }

    /// Version of which only the stored marker is known
    pub fn undiscovered(marker: i16) -> Self {
        Self { marker, real: None }
    }

    pub fn marker(&self) -> i16 {
        self.marker
    }

    pub fn real(&self) -> Option<i16> {
        self.real
    }

    /// Content hash, recomputed from the real version
    pub fn hash(&self) -> Option<u32> {
        self.real.map(version_hash)
    }
}

/// Folds the decimal digits of `version` into the content hash
pub fn version_hash(version: i16) -> u32 {
    version
        .to_string()
        .bytes()
        .fold(0u32, |hash, digit| {
            hash.wrapping_mul(32).wrapping_add(digit as u32 + 1)
        })
}

/// Marker stored in the header for a content hash
pub fn version_marker(hash: u32) -> i16 {
    let [a, b, c, d] = hash.to_be_bytes();
    (0xFF ^ a ^ b ^ c ^ d) as i16
}

/// Content hash of `version` when it produces `marker`
pub fn candidate_hash(marker: i16, version: i16) -> Option<u32> {
    let hash = version_hash(version);
    (version_marker(hash) == marker).then_some(hash)
}

/// Outcome of a successful discovery
#[derive(Debug)]
pub(crate) struct Discovery {
    pub version: i16,
    pub tree: WzTree,
    pub root: NodeId,
}

/// Tries every candidate version against the directory table at the reader's position
#[instrument(skip(reader), err)]
pub(crate) fn discover<R: Read + Seek>(
    reader: &mut WzReader<R>,
    marker: i16,
    name: &str,
) -> Result<Discovery> {
    let table = reader.position()?;
    for version in 0..=MAX_VERSION {
        let Some(hash) = candidate_hash(marker, version) else {
            continue;
        };
        debug!(version, hash, "marker matches candidate");
        match try_candidate(reader, table, hash, name) {
            Ok((tree, root)) => {
                info!(version, "discovered archive version");
                return Ok(Discovery {
                    version,
                    tree,
                    root,
                });
            }
            Err(error) => trace!(version, %error, "rejected candidate"),
        }
    }
    Err(Error::VersionIndeterminate)
}

/// Parses the directory tree for a known version
pub(crate) fn parse_tree<R: Read + Seek>(
    reader: &mut WzReader<R>,
    table: u64,
    hash: u32,
    name: &str,
) -> Result<(WzTree, NodeId)> {
    reader.set_hash(hash);
    reader.clear_cache();
    let mut tree = WzTree::new();
    let root = tree.add_root_directory(name);
    let parsed = read::parse_directory(reader, &mut tree, root, table);
    reader.clear_cache();
    parsed?;
    Ok((tree, root))
}

fn try_candidate<R: Read + Seek>(
    reader: &mut WzReader<R>,
    table: u64,
    hash: u32,
    name: &str,
) -> Result<(WzTree, NodeId)> {
    let (tree, root) = parse_tree(reader, table, hash, name)?;
    let image = first_image(&tree, root).ok_or(DecodeError::NoImages)?;
    reader.seek_to(tree.image_data(image)?.offset as u64)?;
    match reader.read_u8()? {
        block::TYPE_LITERAL | block::TYPE_REFERENCE => Ok((tree, root)),
        _ => Err(DecodeError::ImageHeader.into()),
    }
}

/// Images of a directory come before the images of its subdirectories
fn first_image(tree: &WzTree, directory: NodeId) -> Option<NodeId> {
    tree.images(directory).next().or_else(|| {
        tree.directories(directory)
            .find_map(|subdirectory| first_image(tree, subdirectory))
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn known_hashes() {
        assert_eq!(version_hash(83), 1876);
        assert_eq!(version_marker(1876), 172);
        assert_eq!(version_hash(95), 0x776);
        assert_eq!(version_marker(0x776), 142);
        assert_eq!(version_hash(0), 49);
    }

    #[traced_test]
    #[test]
    fn candidates_follow_marker() {
        assert_eq!(candidate_hash(172, 83), Some(1876));
        assert_eq!(candidate_hash(171, 83), None);

        let matching = (0..=MAX_VERSION)
            .filter(|version| candidate_hash(172, *version).is_some())
            .collect::<Vec<_>>();
        assert!(matching.contains(&83));
        assert!(!matching.contains(&95));
    }

    #[traced_test]
    #[test]
    fn version_tracks_real_value() {
        let version = WzVersion::known(83);
        assert_eq!(version.marker(), 172);
        assert_eq!(version.hash(), Some(1876));

        let unknown = WzVersion::undiscovered(172);
        assert_eq!(unknown.real(), None);
        assert_eq!(unknown.hash(), None);
    }
}
