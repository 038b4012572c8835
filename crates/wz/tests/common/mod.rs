use std::io::Cursor;
use wz::error::Result;
use wz::tree::{CanvasData, SoundData};
use wz::{OpenOptions, Payload, WzArchive, WzValue, WzVariant};

pub const VERSION: i16 = 83;

pub const CANVAS_PAYLOAD: [u8; 6] = [0x78, 0x9C, 0x01, 0x02, 0x03, 0x04];

/// Archive with one image at the root and one in a subdirectory, covering every property kind
pub fn sample() -> Result<WzArchive> {
    let mut archive = WzArchive::create("Mob.wz", VERSION, WzVariant::Gms)?;
    let root = archive.root();
    let tree = archive.tree_mut();

    let sub = tree.add_directory(root, "sub")?;
    let linked = tree.add_image(sub, "b.img")?;
    tree.add_property(linked, "link", WzValue::Uol("../../0100100.img/hp".into()))?;
    tree.add_property(linked, "hp", WzValue::Int(-300_000))?;

    let image = tree.add_image(root, "0100100.img")?;
    tree.add_property(image, "hp", WzValue::Int(100))?;
    tree.add_property(image, "name", WzValue::String("Snail 달팽이".into()))?;
    tree.add_property(image, "desc", WzValue::String("x".repeat(300)))?;
    tree.add_vector(image, "pos", 3, -4)?;

    let info = tree.add_property(image, "info", WzValue::SubProperty)?;
    tree.add_property(info, "exp", WzValue::Long(1 << 40))?;
    tree.add_property(info, "rate", WzValue::Double(0.5))?;
    tree.add_property(info, "speed", WzValue::Float(-1.5))?;
    tree.add_property(info, "still", WzValue::Float(0.0))?;
    tree.add_property(info, "lv", WzValue::Short(7))?;
    tree.add_property(info, "none", WzValue::Null)?;
    tree.add_property(info, "name", WzValue::String("Snail 달팽이".into()))?;

    let icon = tree.add_property(
        image,
        "icon",
        WzValue::Canvas(CanvasData {
            width: 2,
            height: 2,
            format: 2,
            format2: 0,
            payload: Payload::Loaded(CANVAS_PAYLOAD.to_vec()),
        }),
    )?;
    tree.add_vector(icon, "origin", 1, 1)?;
    tree.add_property(
        image,
        "bgm",
        WzValue::Sound(SoundData {
            duration_ms: 1000,
            header: SoundData::header_for(&[1, 2, 3, 4]),
            payload: Payload::Loaded(vec![0xFF; 16]),
        }),
    )?;
    let shape = tree.add_property(image, "shape", WzValue::Convex)?;
    tree.add_vector(shape, "0", 0, 0)?;
    tree.add_vector(shape, "1", 5, 5)?;
    tree.add_property(image, "move", WzValue::Uol("icon".into()))?;

    Ok(archive)
}

pub fn saved(archive: &mut WzArchive) -> Result<Vec<u8>> {
    Ok(archive.save(Cursor::new(Vec::new()))?.into_inner())
}

pub fn options() -> OpenOptions {
    OpenOptions::builder()
        .variant(WzVariant::Gms)
        .name("Mob.wz")
        .build()
}

pub fn reopen(bytes: Vec<u8>) -> Result<WzArchive> {
    WzArchive::open(Cursor::new(bytes), options())
}
