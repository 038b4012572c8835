//! Media extraction
//!
//! Writes the stored payloads of sounds and canvases to standalone files. Sound payloads are
//! the raw audio stream and land in `.mp3` files. Canvas payloads keep their compressed
//! pixel form and land in `.bin` files.
//!
//! File names are the node names joined with `.` from the extraction root down, so
//! `a.img/stand/0` becomes `a.img.stand.0.bin`.

use std::fs;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::{debug, instrument, trace};

use crate::archive::WzArchive;
use crate::error::Result;
use crate::tree::{NodeId, NodeKind};

/// Extracts every sound and canvas below `node` into `out_dir`, following UOLs that point at
/// media. Returns the number of files written.
#[instrument(skip(archive, out_dir), err)]
pub fn extract_media<R: Read + Seek>(
    archive: &mut WzArchive<R>,
    node: NodeId,
    out_dir: &Path,
) -> Result<usize> {
    fs::create_dir_all(out_dir)?;
    let written = extract(archive, node, "", out_dir)?;
    debug!(written, "extracted media");
    Ok(written)
}

fn extract<R: Read + Seek>(
    archive: &mut WzArchive<R>,
    id: NodeId,
    prefix: &str,
    out_dir: &Path,
) -> Result<usize> {
    let name = format!("{prefix}{}", file_name(archive.tree().name(id)?));
    match archive.tree().kind(id)? {
        NodeKind::Sound => write_payload(archive, id, &format!("{name}.mp3"), out_dir),
        NodeKind::Canvas => {
            let written = write_payload(archive, id, &format!("{name}.bin"), out_dir)?;
            Ok(written + extract_children(archive, id, &name, out_dir)?)
        }
        NodeKind::Uol => {
            let Some(target) = archive.resolve_uol(id)? else {
                trace!(%id, "dangling uol");
                return Ok(0);
            };
            match archive.tree().kind(target)? {
                NodeKind::Sound => write_payload(archive, target, &format!("{name}.mp3"), out_dir),
                NodeKind::Canvas => write_payload(archive, target, &format!("{name}.bin"), out_dir),
                _ => Ok(0),
            }
        }
        NodeKind::Image => {
            let mut guard = archive.acquire(id)?;
            extract_children(&mut *guard, id, &name, out_dir)
        }
        NodeKind::Directory | NodeKind::SubProperty | NodeKind::Convex => {
            extract_children(archive, id, &name, out_dir)
        }
        _ => Ok(0),
    }
}

fn extract_children<R: Read + Seek>(
    archive: &mut WzArchive<R>,
    id: NodeId,
    name: &str,
    out_dir: &Path,
) -> Result<usize> {
    let prefix = format!("{name}.");
    let mut written = 0;
    for child in archive.tree().children(id)?.to_vec() {
        written += extract(archive, child, &prefix, out_dir)?;
    }
    Ok(written)
}

fn write_payload<R: Read + Seek>(
    archive: &mut WzArchive<R>,
    id: NodeId,
    file: &str,
    out_dir: &Path,
) -> Result<usize> {
    let payload = archive.payload(id)?;
    if payload.is_empty() {
        trace!(file, "skipping empty payload");
        return Ok(0);
    }
    fs::write(out_dir.join(file), &*payload)?;
    Ok(1)
}

/// Keeps a node name inside the output directory
fn file_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Result;
    use crate::tree::{CanvasData, Payload, SoundData, WzValue};
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;
    use wz_crypto::WzVariant;

    fn canvas(payload: Vec<u8>) -> WzValue {
        WzValue::Canvas(CanvasData {
            width: 1,
            height: 1,
            format: 2,
            format2: 0,
            payload: Payload::Loaded(payload),
        })
    }

    #[traced_test]
    #[test]
    fn media_files() -> Result<()> {
        let mut archive = WzArchive::create("Mob.wz", 83, WzVariant::Gms)?;
        let root = archive.root();
        let image = {
            let tree = archive.tree_mut();
            let image = tree.add_image(root, "a.img")?;
            tree.add_property(
                image,
                "bgm",
                WzValue::Sound(SoundData {
                    duration_ms: 10,
                    header: SoundData::header_for(&[0; 4]),
                    payload: Payload::Loaded(vec![0xFF, 0xFB]),
                }),
            )?;
            let stand = tree.add_property(image, "stand", WzValue::SubProperty)?;
            let frame = tree.add_property(stand, "0", canvas(vec![1, 2, 3]))?;
            tree.add_property(frame, "inner", canvas(vec![4]))?;
            tree.add_property(stand, "empty", canvas(vec![]))?;
            tree.add_property(image, "move", WzValue::Uol("stand/0".into()))?;
            tree.add_property(image, "hp", WzValue::Int(1))?;
            tree.add_property(image, "link", WzValue::Uol("hp".into()))?;
            tree.add_property(image, "gone", WzValue::Uol("nothing".into()))?;
            image
        };

        let dir = tempfile::tempdir()?;
        let written = extract_media(&mut archive, image, dir.path())?;
        assert_eq!(written, 4);
        assert_eq!(fs::read(dir.path().join("a.img.bgm.mp3"))?, vec![0xFF, 0xFB]);
        assert_eq!(fs::read(dir.path().join("a.img.stand.0.bin"))?, vec![1, 2, 3]);
        assert_eq!(fs::read(dir.path().join("a.img.stand.0.inner.bin"))?, vec![4]);
        assert_eq!(fs::read(dir.path().join("a.img.move.bin"))?, vec![1, 2, 3]);
        assert!(!dir.path().join("a.img.stand.empty.bin").exists());
        Ok(())
    }

    #[test]
    fn separators_are_replaced() {
        assert_eq!(file_name("a/b\\c"), "a_b_c");
    }
}
