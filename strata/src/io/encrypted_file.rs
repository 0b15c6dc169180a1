//! Random-access reads and writes over a block-encrypted file.
//!
//! Plaintext is partitioned into aligned cipher blocks; block `N` is stored
//! at ciphertext offset `N * block_size`. An 8-byte little-endian plaintext
//! length trails the last ciphertext block and is the canonical file size.
//! Offsets and sizes in the API always refer to plaintext; ciphertext never
//! escapes this module.
//!
//! The file performs no internal locking: the upper layer guarantees
//! single-threaded access per handle.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crypto::CipherContext;
use crate::error::{CResult, Error};

/// Size of the trailing plaintext-length record.
const TAIL_SIZE: u64 = 8;

/// Chunk used when zero-filling gaps and extending.
const FILL_CHUNK: usize = 64 * 1024;

pub struct EncryptedFile {
    path: PathBuf,
    file: File,
    enc: Arc<dyn CipherContext>,
    dec: Arc<dyn CipherContext>,
    block_size: u64,
    plain_size: u64,
}

impl EncryptedFile {
    /// Creates a new encrypted file. Fails if the file already exists.
    /// `initial_size` bytes of zero plaintext are written up front.
    pub fn create(
        path: &Path,
        initial_size: u64,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        let block_size = enc.block_size() as u64;
        let mut this = EncryptedFile {
            path: path.to_path_buf(),
            file,
            enc,
            dec,
            block_size,
            plain_size: 0,
        };
        this.write_tail()?;
        if initial_size > 0 {
            this.extend(initial_size)?;
        }
        Ok(this)
    }

    /// Opens an existing encrypted file and validates the size tail against
    /// the ciphertext length.
    pub fn open(
        path: &Path,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let block_size = enc.block_size() as u64;
        let raw_size = file.metadata()?.len();
        if raw_size < TAIL_SIZE || (raw_size - TAIL_SIZE) % block_size != 0 {
            return Err(Error::Corrupt(format!(
                "encrypted file {} has invalid raw size {}",
                path.display(),
                raw_size
            )));
        }
        let mut tail = [0u8; TAIL_SIZE as usize];
        file.read_exact_at(&mut tail, raw_size - TAIL_SIZE)?;
        let plain_size = u64::from_le_bytes(tail);
        let expected = Self::block_count_for(plain_size, block_size) * block_size + TAIL_SIZE;
        if expected != raw_size {
            return Err(Error::Corrupt(format!(
                "encrypted file {}: size tail {} disagrees with raw size {}",
                path.display(),
                plain_size,
                raw_size
            )));
        }
        Ok(EncryptedFile { path: path.to_path_buf(), file, enc, dec, block_size, plain_size })
    }

    /// Current plaintext size, as recorded in the size tail.
    pub fn size(&self) -> u64 {
        self.plain_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads at most `buf.len()` bytes at the plaintext `offset`. Reads past
    /// the end of the file are short; a read entirely past the end returns 0.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> CResult<usize> {
        if buf.is_empty() || offset >= self.plain_size {
            return Ok(0);
        }
        let len = buf.len().min((self.plain_size - offset) as usize);
        let bs = self.block_size;
        let first_block = offset / bs;
        let last_block = (offset + len as u64 - 1) / bs;
        let mut region = vec![0u8; ((last_block - first_block + 1) * bs) as usize];
        self.file.read_exact_at(&mut region, first_block * bs)?;
        self.dec
            .transform(&mut region)
            .map_err(|e| Error::Corrupt(format!("{}: decryption failed: {}", self.path.display(), e)))?;
        let skip = (offset - first_block * bs) as usize;
        buf[..len].copy_from_slice(&region[skip..skip + len]);
        Ok(len)
    }

    /// Reads exactly `buf.len()` bytes or fails with `Corrupt` when the file
    /// ends first.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> CResult<()> {
        let n = self.read_at(buf, offset)?;
        if n != buf.len() {
            return Err(Error::Corrupt(format!(
                "{}: short read at offset {}: wanted {} bytes, got {}",
                self.path.display(),
                offset,
                buf.len(),
                n
            )));
        }
        Ok(())
    }

    /// Writes `buf` at the plaintext `offset`, growing the file when the
    /// write extends past the current end. Writing past the end zero-fills
    /// the gap first. The size tail is updated last, so a failed write
    /// leaves the recorded size unchanged.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> CResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if offset > self.plain_size {
            self.zero_fill(offset - self.plain_size)?;
        }
        self.write_region(buf, offset)?;
        Ok(buf.len())
    }

    /// Grows the file by `len` bytes of zero plaintext and returns the new
    /// size. The ciphertext grows in whole-block increments.
    pub fn extend(&mut self, len: u64) -> CResult<u64> {
        self.zero_fill(len)?;
        Ok(self.plain_size)
    }

    pub fn flush(&self) -> CResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn zero_fill(&mut self, len: u64) -> CResult<()> {
        let zeros = [0u8; FILL_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(FILL_CHUNK as u64) as usize;
            self.write_region(&zeros[..chunk], self.plain_size)?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Partial-block update protocol. Precondition: `offset <= plain_size`.
    fn write_region(&mut self, buf: &[u8], offset: u64) -> CResult<()> {
        let bs = self.block_size;
        let end = offset + buf.len() as u64;
        let first_block = offset / bs;
        let last_block = (end - 1) / bs;
        let existing_blocks = Self::block_count_for(self.plain_size, bs);

        let mut region = vec![0u8; ((last_block - first_block + 1) * bs) as usize];

        // Preserve the prefix of the first block and the suffix of the last
        // one when they are only partially covered and already exist.
        if offset % bs != 0 && first_block < existing_blocks {
            self.load_block(first_block, &mut region[..bs as usize])?;
        }
        if end % bs != 0
            && last_block < existing_blocks
            && (last_block != first_block || offset % bs == 0)
        {
            let tail_start = ((last_block - first_block) * bs) as usize;
            let mut tail = vec![0u8; bs as usize];
            self.load_block(last_block, &mut tail)?;
            region[tail_start..].copy_from_slice(&tail);
        }

        let skip = (offset - first_block * bs) as usize;
        region[skip..skip + buf.len()].copy_from_slice(buf);

        self.enc
            .transform(&mut region)
            .map_err(|e| Error::Corrupt(format!("{}: encryption failed: {}", self.path.display(), e)))?;
        self.file.write_all_at(&region, first_block * bs)?;

        if end > self.plain_size {
            self.plain_size = end;
            self.write_tail()?;
        }
        Ok(())
    }

    fn load_block(&self, block: u64, buf: &mut [u8]) -> CResult<()> {
        self.file.read_exact_at(buf, block * self.block_size)?;
        self.dec
            .transform(buf)
            .map_err(|e| Error::Corrupt(format!("{}: decryption failed: {}", self.path.display(), e)))?;
        Ok(())
    }

    fn write_tail(&mut self) -> CResult<()> {
        let tail_offset = Self::block_count_for(self.plain_size, self.block_size) * self.block_size;
        self.file.write_all_at(&self.plain_size.to_le_bytes(), tail_offset)?;
        Ok(())
    }

    fn block_count_for(plain_size: u64, block_size: u64) -> u64 {
        (plain_size + block_size - 1) / block_size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    use super::*;
    use crate::crypto::{CipherContext, CipherRegistry};

    fn contexts(cipher_id: &str) -> (Arc<dyn CipherContext>, Arc<dyn CipherContext>) {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher(cipher_id).unwrap();
        let key = vec![0x42u8; cipher.key_size()];
        (
            cipher.create_encryption_context(&key).unwrap(),
            cipher.create_decryption_context(&key).unwrap(),
        )
    }

    #[test]
    fn write_read_roundtrip() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f1");
        let (enc, dec) = contexts("aes128");
        let mut f = EncryptedFile::create(&path, 0, enc, dec)?;

        let payload = b"abcasflh23439z123k,n d 30!2-23,4.";
        assert_eq!(f.write_at(payload, 0)?, payload.len());
        assert_eq!(f.size(), payload.len() as u64);

        let mut buf = vec![0u8; payload.len()];
        f.read_exact_at(&mut buf, 0)?;
        assert_eq!(&buf, payload);

        // Overwrite a span crossing a block boundary.
        f.write_at(&[0xaa; 7], 13)?;
        let mut buf = vec![0u8; payload.len()];
        f.read_exact_at(&mut buf, 0)?;
        assert_eq!(&buf[13..20], &[0xaa; 7]);
        assert_eq!(&buf[..13], &payload[..13]);
        assert_eq!(&buf[20..], &payload[20..]);
        Ok(())
    }

    #[test]
    fn reopen_preserves_content() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f2");
        let (enc, dec) = contexts("aes128");
        {
            let mut f = EncryptedFile::create(&path, 0, enc.clone(), dec.clone())?;
            f.write_at(b"persisted", 100)?;
            f.flush()?;
        }
        let f = EncryptedFile::open(&path, enc, dec)?;
        assert_eq!(f.size(), 109);
        let mut buf = [0u8; 9];
        f.read_exact_at(&mut buf, 100)?;
        assert_eq!(&buf, b"persisted");
        // The zero-filled gap reads back as zeros.
        let mut gap = [0xffu8; 100];
        f.read_exact_at(&mut gap, 0)?;
        assert!(gap.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn short_reads_past_eof() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f3");
        let (enc, dec) = contexts("aes128");
        let mut f = EncryptedFile::create(&path, 0, enc, dec)?;
        f.write_at(&[1, 2, 3, 4], 0)?;

        let mut buf = [0u8; 16];
        assert_eq!(f.read_at(&mut buf, 2)?, 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(f.read_at(&mut buf, 4)?, 0);
        assert_eq!(f.read_at(&mut buf, 1000)?, 0);
        Ok(())
    }

    #[test]
    fn extend_grows_in_whole_blocks() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f4");
        let (enc, dec) = contexts("aes128");
        let mut f = EncryptedFile::create(&path, 0, enc, dec)?;
        assert_eq!(f.extend(10)?, 10);
        assert_eq!(f.size(), 10);
        // ceil(10 / 16) * 16 + 8
        assert_eq!(std::fs::metadata(&path)?.len(), 16 + 8);
        Ok(())
    }

    #[test]
    fn corrupt_tail_is_detected() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f5");
        let (enc, dec) = contexts("aes128");
        {
            let mut f = EncryptedFile::create(&path, 0, enc.clone(), dec.clone())?;
            f.write_at(&[7u8; 40], 0)?;
        }
        // Flip the recorded plaintext size.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let raw = file.metadata().unwrap().len();
        file.write_all_at(&4096u64.to_le_bytes(), raw - 8).unwrap();
        assert!(matches!(EncryptedFile::open(&path, enc, dec), Err(Error::Corrupt(_))));
        Ok(())
    }

    /// Many overlapping random-offset writes against an in-memory oracle,
    /// then a full read-back, for each built-in cipher.
    #[test]
    fn random_overlapping_writes_match_oracle() -> CResult<()> {
        const SIZE: usize = 1 << 20;

        for cipher_id in ["aes128", "aes256", "none"] {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join("f6");
            let (enc, dec) = contexts(cipher_id);
            let block_size = enc.block_size() as u64;
            let mut f = EncryptedFile::create(&path, 0, enc, dec)?;

            let seed: u64 = rand::thread_rng().gen();
            println!("cipher = {}, seed = {}", cipher_id, seed);
            let mut rng = StdRng::seed_from_u64(seed);

            let mut oracle = vec![0u8; SIZE];
            for _ in 0..200 {
                let offset = rng.gen_range(0..SIZE - 1);
                let len = rng.gen_range(1..(SIZE - offset).min(64 * 1024));
                let mut data = vec![0u8; len];
                rng.fill_bytes(&mut data);
                f.write_at(&data, offset as u64)?;
                oracle[offset..offset + len].copy_from_slice(&data);
            }
            // Make the logical size exact so the whole range compares.
            f.write_at(&oracle[SIZE - 1..], (SIZE - 1) as u64)?;

            let mut readback = vec![0u8; SIZE];
            f.read_exact_at(&mut readback, 0)?;
            assert!(readback == oracle, "cipher {} read-back mismatch", cipher_id);

            let expected_raw =
                (SIZE as u64 + block_size - 1) / block_size * block_size + 8;
            assert_eq!(std::fs::metadata(&path)?.len(), expected_raw);
        }
        Ok(())
    }
}
