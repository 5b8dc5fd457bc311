//! Narrow seam to the external cryptography provider.
//!
//! The server core never interprets key material. It obtains a [`Cipher`]
//! from a [`CipherFactory`] and uses it only to size packets and to pass
//! buffers through; AEAD, header protection, and the key schedule live
//! outside this repository.

use thiserror::Error;

use crate::ConnectionId;

/// Failure inside the external cipher.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("cipher operation failed")]
pub struct CryptoError;

/// Sealed view of a packet-protection cipher.
pub trait Cipher: Send + Sync {
    /// AEAD expansion added to every encrypted payload.
    fn overhead(&self) -> usize;
    /// Bytes of ciphertext consumed by a header-protection sample.
    fn sample_len(&self) -> usize;
    /// Encrypt `body` in place, authenticated against `header`.
    fn encrypt(&self, packet_num: u64, header: &[u8], body: &mut Vec<u8>) -> Result<(), CryptoError>;
    /// Decrypt `body` in place, authenticated against `header`.
    fn decrypt(&self, packet_num: u64, header: &[u8], body: &mut Vec<u8>) -> Result<(), CryptoError>;
}

/// Derives a cipher for a connection, e.g. from the client's initial CID.
pub trait CipherFactory: Send + Sync {
    fn cipher_for(&self, dst_cid: &ConnectionId) -> Box<dyn Cipher>;
}

/// Cipher that moves bytes untouched. Test plumbing only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCipher;

impl Cipher for NoOpCipher {
    fn overhead(&self) -> usize {
        0
    }

    fn sample_len(&self) -> usize {
        crate::HEADER_PROTECTION_SAMPLE_LEN
    }

    fn encrypt(&self, _: u64, _: &[u8], _: &mut Vec<u8>) -> Result<(), CryptoError> {
        Ok(())
    }

    fn decrypt(&self, _: u64, _: &[u8], _: &mut Vec<u8>) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// Factory handing out [`NoOpCipher`]s. Test plumbing only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCipherFactory;

impl CipherFactory for NoOpCipherFactory {
    fn cipher_for(&self, _: &ConnectionId) -> Box<dyn Cipher> {
        Box::new(NoOpCipher)
    }
}
