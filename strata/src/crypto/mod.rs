//! Cipher provider and digest helpers.
//!
//! Every persisted byte passes through a block cipher selected by id. A
//! cipher hands out encryption/decryption contexts bound to a key; contexts
//! transform whole blocks in place, which is what the encrypted file
//! substrate needs for random access.

use std::collections::HashMap;
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use sha2::{Digest, Sha512};

use crate::error::{CResult, Error};

/// Length of the block digest used in the tamper-evidence chain.
pub const DIGEST_LENGTH: usize = 64;

pub type BlockDigest = [u8; DIGEST_LENGTH];

/// A key-bound transformation over whole cipher blocks.
pub trait CipherContext: Send + Sync {
    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Transforms `data` in place. `data.len()` must be a multiple of the
    /// block size.
    fn transform(&self, data: &mut [u8]) -> CResult<()>;
}

/// A cipher registered under a well-known id.
pub trait Cipher: Send + Sync {
    fn id(&self) -> &'static str;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Key size in bytes.
    fn key_size(&self) -> usize;

    fn create_encryption_context(&self, key: &[u8]) -> CResult<Arc<dyn CipherContext>>;

    fn create_decryption_context(&self, key: &[u8]) -> CResult<Arc<dyn CipherContext>>;
}

const AES_BLOCK_SIZE: usize = 16;

macro_rules! aes_cipher {
    ($cipher:ident, $enc_ctx:ident, $dec_ctx:ident, $core:ty, $id:literal, $key_size:literal) => {
        struct $enc_ctx {
            inner: $core,
        }

        impl CipherContext for $enc_ctx {
            fn block_size(&self) -> usize {
                AES_BLOCK_SIZE
            }

            fn transform(&self, data: &mut [u8]) -> CResult<()> {
                check_block_multiple(data.len(), AES_BLOCK_SIZE)?;
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    self.inner.encrypt_block(GenericArray::from_mut_slice(block));
                }
                Ok(())
            }
        }

        struct $dec_ctx {
            inner: $core,
        }

        impl CipherContext for $dec_ctx {
            fn block_size(&self) -> usize {
                AES_BLOCK_SIZE
            }

            fn transform(&self, data: &mut [u8]) -> CResult<()> {
                check_block_multiple(data.len(), AES_BLOCK_SIZE)?;
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    self.inner.decrypt_block(GenericArray::from_mut_slice(block));
                }
                Ok(())
            }
        }

        struct $cipher;

        impl Cipher for $cipher {
            fn id(&self) -> &'static str {
                $id
            }

            fn block_size(&self) -> usize {
                AES_BLOCK_SIZE
            }

            fn key_size(&self) -> usize {
                $key_size
            }

            fn create_encryption_context(&self, key: &[u8]) -> CResult<Arc<dyn CipherContext>> {
                let inner = <$core>::new_from_slice(key)
                    .map_err(|_| invalid_key_error($id, $key_size, key.len()))?;
                Ok(Arc::new($enc_ctx { inner }))
            }

            fn create_decryption_context(&self, key: &[u8]) -> CResult<Arc<dyn CipherContext>> {
                let inner = <$core>::new_from_slice(key)
                    .map_err(|_| invalid_key_error($id, $key_size, key.len()))?;
                Ok(Arc::new($dec_ctx { inner }))
            }
        }
    };
}

aes_cipher!(Aes128Cipher, Aes128EncryptContext, Aes128DecryptContext, aes::Aes128, "aes128", 16);
aes_cipher!(Aes256Cipher, Aes256EncryptContext, Aes256DecryptContext, aes::Aes256, "aes256", 32);

fn check_block_multiple(len: usize, block_size: usize) -> CResult<()> {
    if len % block_size != 0 {
        return Err(Error::InvalidArgument(format!(
            "cipher input length {} is not a multiple of the block size {}",
            len, block_size
        )));
    }
    Ok(())
}

fn invalid_key_error(id: &str, expected: usize, actual: usize) -> Error {
    Error::InvalidArgument(format!(
        "cipher {} requires a {}-byte key, got {} bytes",
        id, expected, actual
    ))
}

/// Identity "cipher" for unencrypted instances.
struct NoCipher;

struct NoCipherContext;

const NO_CIPHER_BLOCK_SIZE: usize = 512;

impl CipherContext for NoCipherContext {
    fn block_size(&self) -> usize {
        NO_CIPHER_BLOCK_SIZE
    }

    fn transform(&self, _data: &mut [u8]) -> CResult<()> {
        Ok(())
    }
}

impl Cipher for NoCipher {
    fn id(&self) -> &'static str {
        "none"
    }

    fn block_size(&self) -> usize {
        NO_CIPHER_BLOCK_SIZE
    }

    fn key_size(&self) -> usize {
        0
    }

    fn create_encryption_context(&self, _key: &[u8]) -> CResult<Arc<dyn CipherContext>> {
        Ok(Arc::new(NoCipherContext))
    }

    fn create_decryption_context(&self, _key: &[u8]) -> CResult<Arc<dyn CipherContext>> {
        Ok(Arc::new(NoCipherContext))
    }
}

/// Cipher lookup by id. Passed as an explicit handle into each subsystem
/// at construction; there is no process-wide registry.
pub struct CipherRegistry {
    ciphers: HashMap<&'static str, Arc<dyn Cipher>>,
}

impl CipherRegistry {
    /// Creates a registry with the built-in ciphers `aes128`, `aes256`
    /// and `none`.
    pub fn with_builtin_ciphers() -> Self {
        let mut ciphers: HashMap<&'static str, Arc<dyn Cipher>> = HashMap::new();
        for cipher in [
            Arc::new(Aes128Cipher) as Arc<dyn Cipher>,
            Arc::new(Aes256Cipher) as Arc<dyn Cipher>,
            Arc::new(NoCipher) as Arc<dyn Cipher>,
        ] {
            ciphers.insert(cipher.id(), cipher);
        }
        CipherRegistry { ciphers }
    }

    pub fn get_cipher(&self, id: &str) -> CResult<Arc<dyn Cipher>> {
        self.ciphers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown cipher id '{}'", id)))
    }
}

impl Default for CipherRegistry {
    fn default() -> Self {
        Self::with_builtin_ciphers()
    }
}

/// Computes the chained block digest `H(prev_digest || data)`.
pub fn chained_digest(prev_digest: &BlockDigest, data: &[u8]) -> BlockDigest {
    let mut hasher = Sha512::new();
    hasher.update(prev_digest);
    hasher.update(data);
    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes128_roundtrip() {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher("aes128").unwrap();
        assert_eq!(cipher.block_size(), 16);

        let key = [0xefu8; 16];
        let enc = cipher.create_encryption_context(&key).unwrap();
        let dec = cipher.create_decryption_context(&key).unwrap();

        let plain = (0u8..64).collect::<Vec<_>>();
        let mut data = plain.clone();
        enc.transform(&mut data).unwrap();
        assert_ne!(data, plain);
        dec.transform(&mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn key_length_is_checked() {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher("aes256").unwrap();
        assert!(cipher.create_encryption_context(&[0u8; 16]).is_err());
        assert!(cipher.create_encryption_context(&[0u8; 32]).is_ok());
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        let registry = CipherRegistry::with_builtin_ciphers();
        assert!(matches!(registry.get_cipher("rot13"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn partial_block_is_rejected() {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher("aes128").unwrap();
        let enc = cipher.create_encryption_context(&[0u8; 16]).unwrap();
        let mut data = vec![0u8; 15];
        assert!(enc.transform(&mut data).is_err());
    }

    #[test]
    fn digest_chain_changes_with_predecessor() {
        let zero = [0u8; DIGEST_LENGTH];
        let d1 = chained_digest(&zero, b"abc");
        let d2 = chained_digest(&d1, b"abc");
        assert_ne!(d1, d2);
        assert_eq!(d1, chained_digest(&zero, b"abc"));
    }
}
