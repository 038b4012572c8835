//! Keystream derivation for WZ string encryption

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use derive_more::derive::Deref;
use tracing::trace;

/// 32-byte AES key shared by every archive variant
pub const USER_KEY: [u8; 32] = [
    0x13, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0xB4, 0x00, 0x00, 0x00,
    0x1B, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x33, 0x00, 0x00, 0x00, 0x52, 0x00, 0x00, 0x00,
];

/// Keystream bytes are generated in batches of this size
pub const BATCH_SIZE: usize = 4096;

const BLOCK_SIZE: usize = 16;

/// Derives the first `len` keystream bytes for `iv`.
///
/// The result is a pure function of the IV: every call with the same IV yields the same prefix,
/// regardless of the requested length.
pub fn derive(iv: [u8; 4], len: usize) -> Vec<u8> {
    let mut stream = Keystream::with_len(iv, len);
    stream.bytes.truncate(len);
    stream.bytes
}

/// Lazily extended keystream for a single IV
///
/// Dereferences to the bytes generated so far. Call [`Keystream::ensure`] before indexing past
/// the current length.
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct Keystream {
    iv: [u8; 4],
    #[deref]
    bytes: Vec<u8>,
}

impl Keystream {
    /// Creates a keystream holding the first batch of bytes for `iv`
    pub fn new(iv: [u8; 4]) -> Self {
        Self::with_len(iv, BATCH_SIZE)
    }

    /// Creates a keystream holding at least `len` bytes for `iv`
    pub fn with_len(iv: [u8; 4], len: usize) -> Self {
        let mut stream = Self {
            iv,
            bytes: Vec::new(),
        };
        stream.ensure(len);
        stream
    }

    /// IV this keystream was derived from
    pub fn iv(&self) -> [u8; 4] {
        self.iv
    }

    /// Returns true when the IV is all zeroes, meaning every key byte is zero
    pub fn is_zero(&self) -> bool {
        self.iv == [0; 4]
    }

    /// Extends the keystream so it holds at least `len` bytes.
    ///
    /// Growth happens in whole batches, already generated bytes are never changed.
    pub fn ensure(&mut self, len: usize) {
        if len <= self.bytes.len() {
            return;
        }
        let target = len.div_ceil(BATCH_SIZE) * BATCH_SIZE;
        trace!(iv = ?self.iv, from = self.bytes.len(), to = target, "extending keystream");

        if self.is_zero() {
            self.bytes.resize(target, 0);
            return;
        }

        let cipher = Aes256::new(GenericArray::from_slice(&USER_KEY));
        self.bytes.reserve(target - self.bytes.len());
        while self.bytes.len() < target {
            let start = self.bytes.len();
            if start == 0 {
                for _ in 0..BLOCK_SIZE / self.iv.len() {
                    self.bytes.extend_from_slice(&self.iv);
                }
            } else {
                self.bytes.extend_from_within(start - BLOCK_SIZE..start);
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(
                &mut self.bytes[start..start + BLOCK_SIZE],
            ));
        }
    }

    /// Byte at `index`, extending the stream when needed
    pub fn byte(&mut self, index: usize) -> u8 {
        self.ensure(index + 1);
        self.bytes[index]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    const GMS_IV: [u8; 4] = [0x4D, 0x23, 0xC7, 0x2B];

    #[traced_test]
    #[test]
    fn zero_iv_is_all_zero() {
        let stream = Keystream::with_len([0; 4], 10_000);
        assert!(stream.len() >= 10_000);
        assert!(stream.iter().all(|b| *b == 0));
    }

    #[traced_test]
    #[test]
    fn first_block_is_encrypted_iv() {
        let cipher = Aes256::new(GenericArray::from_slice(&USER_KEY));
        let mut block = [0u8; 16];
        for chunk in block.chunks_mut(4) {
            chunk.copy_from_slice(&GMS_IV);
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));

        let stream = Keystream::new(GMS_IV);
        assert_eq!(&stream[..16], &block[..]);

        let mut second = block;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut second));
        assert_eq!(&stream[16..32], &second[..]);
    }

    #[traced_test]
    #[test]
    fn extension_keeps_prefix() {
        let short = derive(GMS_IV, 100);
        let long = derive(GMS_IV, BATCH_SIZE * 3 + 7);
        assert_eq!(short.len(), 100);
        assert_eq!(long.len(), BATCH_SIZE * 3 + 7);
        assert_eq!(&long[..100], &short[..]);

        let mut lazy = Keystream::new(GMS_IV);
        assert_eq!(lazy.len(), BATCH_SIZE);
        let last = lazy.byte(BATCH_SIZE * 3 + 6);
        assert_eq!(last, long[BATCH_SIZE * 3 + 6]);
        assert_eq!(&lazy[..long.len()], &long[..]);
    }

    #[traced_test]
    #[test]
    fn different_ivs_differ() {
        let gms = derive(GMS_IV, 64);
        let ems = derive([0xB9, 0x7D, 0x63, 0xE9], 64);
        assert_ne!(gms, ems);
        assert_eq!(gms, derive(GMS_IV, 64));
    }
}
