//! This library handles reading from and creating **WZ** archives used by *MapleStory*.
//!
//! # WZ Archive Format Documentation
//!
//! A WZ archive is a single file holding a tree of directories. Directories hold further
//! directories and images, images hold a tree of typed properties. Strings are encrypted with
//! a keystream derived from the archive's IV (see [`wz_crypto`]) and offsets are obfuscated with
//! a hash of the client version, which the file itself does not store in full.
//!
//! ## File Structure
//!
//! | Offset (bytes) | Field           | Description                                           |
//! |----------------|-----------------|-------------------------------------------------------|
//! | 0x0000         | Magic number    | 4 bytes: "PKG1"                                       |
//! | 0x0004         | File size       | 8 bytes: bytes following the header                  |
//! | 0x000C         | Data start      | 4 bytes: offset of the version marker                 |
//! | 0x0010         | Copyright       | null terminated string, zero padded to data start     |
//! | data start     | Version marker  | 2 bytes: checksum of the version hash                 |
//! | data start + 2 | Directory table | root directory, followed by nested tables and images  |
//!
//! ### Compressed Integers
//!
//! Counts and sizes are stored as a single signed byte when they fit in `-127..=127`.
//! Otherwise the byte `0x80` (`-128`) is followed by the full little endian value.
//!
//! ### Strings
//!
//! A signed length byte selects the encoding. Negative lengths are narrow strings, one byte per
//! character. Positive lengths are wide strings, two bytes per character. A length byte of
//! `0x80` (narrow) or `0x7F` (wide) is followed by the real length as an i32. Characters are
//! XORed with the keystream and a rolling mask that starts at `0xAA` (narrow) or `0xAAAA`
//! (wide) and increments per character.
//!
//! ### Directory Entries
//!
//! | Tag | Entry                                                           |
//! |-----|-----------------------------------------------------------------|
//! | 1   | skipped, 4 + 4 + 2 bytes                                        |
//! | 2   | name by reference, followed by the kind byte at that position   |
//! | 3   | directory                                                       |
//! | 4   | image                                                           |
//!
//! Every entry carries a name, a compressed size, a compressed checksum and an obfuscated
//! 32-bit offset.
//!
//! ### Properties
//!
//! | Tag     | Property                                                     |
//! |---------|--------------------------------------------------------------|
//! | 0       | null                                                         |
//! | 2, 11   | short                                                        |
//! | 3, 19   | compressed int                                               |
//! | 20      | compressed long                                              |
//! | 4       | float, `0x80` followed by an f32 or `0x00` for zero          |
//! | 5       | double                                                       |
//! | 8       | string block                                                 |
//! | 9       | extended property, u32 length followed by a type name        |
//!
//! Extended type names are `Property`, `Canvas`, `Shape2D#Vector2D`, `Shape2D#Convex2D`,
//! `Sound_DX8` and `UOL`.
//!
//! # Example
//!
//! ```no_run
//! use wz::{OpenOptions, WzArchive};
//! use wz_crypto::WzVariant;
//!
//! # fn main() -> wz::error::Result<()> {
//! let options = OpenOptions::builder().variant(WzVariant::Gms).build();
//! let mut archive = WzArchive::open_path("Mob.wz", options)?;
//! if let Some(hp) = archive.get("Mob.wz/0100100.img/info/maxHP")? {
//!     println!("{:?}", archive.tree().int(hp));
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod error;
pub mod extract;
#[cfg(feature = "serde")]
pub mod json;
pub mod offset;
pub mod path;
pub mod read;
pub mod tree;
pub mod types;
pub mod version;
pub mod write;
pub mod xml;

pub use archive::{ImageGuard, OpenOptions, WzArchive};
pub use read::WzReader;
pub use tree::{NodeId, NodeKind, Payload, WzFragment, WzTree, WzValue};
pub use version::WzVersion;
pub use write::WzWriter;
pub use wz_crypto::{Keystream, WzVariant};
