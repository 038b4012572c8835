//! Error types that can be emitted from this library

use miette::Diagnostic;
use thiserror::Error;

use crate::tree::{NodeId, NodeKind};

/// Error type for library
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// Transparent warpper for [`std::io::Error`]
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    /// Transparent warpper for [`binrw::Error`]
    #[error(transparent)]
    BinRWError(#[from] binrw::Error),

    /// Transparent warpper for [`wz_crypto::error::Error`]
    #[error(transparent)]
    CryptoError(#[from] wz_crypto::error::Error),

    /// Transparent warpper for [`quick_xml::Error`]
    #[error(transparent)]
    XmlError(#[from] quick_xml::Error),

    /// Transparent warpper for [`regex::Error`]
    #[error(transparent)]
    RegexError(#[from] regex::Error),

    /// Transparent warpper for [`base64::DecodeError`]
    #[error(transparent)]
    Base64Error(#[from] base64::DecodeError),

    /// Transparent warpper for [`serde_json::Error`]
    #[cfg(feature = "serde")]
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    /// Transparent warpper for [`std::num::ParseIntError`]
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),

    /// Transparent warpper for [`std::num::ParseFloatError`]
    #[error(transparent)]
    ParseFloatError(#[from] std::num::ParseFloatError),

    /// file is an invalid wz archive
    #[error("file is an invalid wz archive")]
    InvalidArchive,

    /// no candidate version produced a readable directory
    #[error("unable to determine the archive version")]
    VersionIndeterminate,

    /// the requested version does not produce the encoded marker
    #[error("version {version} does not match the version marker {marker}")]
    VersionMismatch { version: i16, marker: i16 },

    /// archive data could not be decoded
    #[error("failed to decode archive data")]
    Decode(#[from] DecodeError),

    /// export requested the binary payload of a node that carries none
    #[error("{0} has no embedded data")]
    NoEmbeddedData(String),

    /// xml document could not be converted into nodes
    #[error("malformed xml: {0}")]
    MalformedXml(String),

    /// operation is not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// unable to find requested node
    #[error("unable to find requested node")]
    NodeNotFound(#[from] NodeNotFoundError),

    /// node has a different kind than required
    #[error("node {id} is not a {expected}")]
    UnexpectedKind { id: NodeId, expected: NodeKind },
}

/// Error type to provide further information when archive data is malformed
#[derive(Error, Diagnostic, Debug)]
pub enum DecodeError {
    /// unknown property type {0:#04x}
    #[error("unknown property type {0:#04x}")]
    PropertyTag(u8),

    /// unknown extended property type {0:?}
    #[error("unknown extended property type {0:?}")]
    ExtendedKind(String),

    /// unknown extended property tag {0:#04x}
    #[error("unknown extended property tag {0:#04x}")]
    ExtendedTag(u8),

    /// unknown string block tag {0:#04x}
    #[error("unknown string block tag {0:#04x}")]
    StringBlockTag(u8),

    /// unknown directory entry type {0:#04x}
    #[error("unknown directory entry type {0:#04x}")]
    DirectoryEntryTag(u8),

    /// unknown float marker {0:#04x}
    #[error("unknown float marker {0:#04x}")]
    FloatMarker(u8),

    /// image does not start with a property list
    #[error("image does not start with a property list")]
    ImageHeader,

    /// entry count {0} is out of range
    #[error("entry count {0} is out of range")]
    EntryCount(i32),

    /// offset {0:#x} lies outside the archive
    #[error("offset {0:#x} lies outside the archive")]
    OffsetOutOfBounds(u64),

    /// length {0} exceeds the remaining data
    #[error("length {0} exceeds the remaining data")]
    LengthOutOfBounds(i64),

    /// directory tree contains no images
    #[error("directory tree contains no images")]
    NoImages,
}

/// Error type to provide further information when a node has not been found
#[derive(Error, Diagnostic, Debug)]
#[error("unable to find requested node")]
pub enum NodeNotFoundError {
    /// with id {0}
    #[error("with id {0}")]
    Id(NodeId),

    /// at path {0}
    #[error("at path {0}")]
    Path(String),
}

/// Generic result type with crate's Error as its error variant
pub type Result<T> = core::result::Result<T, Error>;
