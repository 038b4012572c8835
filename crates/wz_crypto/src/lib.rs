//! This library derives the keystreams used to encrypt strings inside **WZ** archives.
//!
//! # Keystream Derivation
//!
//! Every WZ archive is tied to a 4-byte initialization vector (IV). The IV is expanded into an
//! arbitrarily long pseudorandom byte sequence by chaining AES-256 in ECB mode over a fixed
//! 32-byte user key:
//!
//! | Block | Input                               | Output bytes        |
//! |-------|-------------------------------------|---------------------|
//! | 0     | IV repeated four times (16 bytes)   | `key[0..16]`        |
//! | n     | output of block `n - 1`             | `key[16n..16n+16]`  |
//!
//! An all-zero IV produces an all-zero keystream, which leaves strings un-encrypted apart from
//! their rolling mask.
//!
//! ## Known Variants
//!
//! | Variant    | IV                      | Notes                                            |
//! |------------|-------------------------|--------------------------------------------------|
//! | `Gms`      | `4D 23 C7 2B`           | global client distribution                       |
//! | `Ems`      | `B9 7D 63 E9`           | south east asian client distribution             |
//! | `Classic`  | `00 00 00 00`           | older clients, no string encryption              |
//! | `Generate` | supplied by the caller  | new archives, or archives with an unlisted IV    |
//! | `Zlz`      | read from a key file    | 4 bytes at offset `0x10040` of `ZLZ.dll`         |
//!

pub mod error;
pub mod keystream;
pub mod variant;

pub use keystream::Keystream;
pub use variant::WzVariant;
