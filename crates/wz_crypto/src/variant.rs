//! Known archive variants and the IVs they map to

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use derive_more::derive::Display;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::Keystream;

/// IV used by global clients
pub const GMS_IV: [u8; 4] = [0x4D, 0x23, 0xC7, 0x2B];
/// IV used by the south east asian clients
pub const EMS_IV: [u8; 4] = [0xB9, 0x7D, 0x63, 0xE9];
/// IV of old clients without string encryption
pub const CLASSIC_IV: [u8; 4] = [0x00; 4];

/// Offset of the IV inside `ZLZ.dll`
pub const ZLZ_IV_OFFSET: u64 = 0x10040;

/// Archive variant, selecting the IV strings are encrypted with
#[derive(Debug, Display, Clone, PartialEq, Eq, Default)]
pub enum WzVariant {
    #[display("GMS")]
    Gms,
    #[display("EMS")]
    Ems,
    #[default]
    #[display("Classic")]
    Classic,
    /// IV supplied explicitly by the caller
    #[display("Generate")]
    Generate,
    /// IV read from a `ZLZ.dll` key file
    #[display("ZLZ ({})", _0.display())]
    Zlz(PathBuf),
}

impl WzVariant {
    /// Resolves the IV for this variant.
    ///
    /// `Generate` has no fixed IV and fails with [`Error::NoFixedIv`].
    #[instrument(err)]
    pub fn iv(&self) -> Result<[u8; 4]> {
        match self {
            WzVariant::Gms => Ok(GMS_IV),
            WzVariant::Ems => Ok(EMS_IV),
            WzVariant::Classic => Ok(CLASSIC_IV),
            WzVariant::Generate => Err(Error::NoFixedIv),
            WzVariant::Zlz(path) => read_zlz_iv_from(path),
        }
    }

    /// Derives the keystream for this variant
    pub fn keystream(&self) -> Result<Keystream> {
        Ok(Keystream::new(self.iv()?))
    }
}

/// Reads the IV stored in a `ZLZ.dll` image
pub fn read_zlz_iv<R: Read + Seek>(reader: &mut R) -> Result<[u8; 4]> {
    reader.seek(SeekFrom::Start(ZLZ_IV_OFFSET))?;
    let mut iv = [0u8; 4];
    reader.read_exact(&mut iv)?;
    debug!(?iv, "read zlz iv");
    Ok(iv)
}

fn read_zlz_iv_from(path: &Path) -> Result<[u8; 4]> {
    let mut file = File::open(path)?;
    read_zlz_iv(&mut file)
}
