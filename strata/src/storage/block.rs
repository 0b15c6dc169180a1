//! A column data block: one fixed-size extent of a single column's data,
//! stored in its own encrypted file with a header at offset 0.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::crypto::{chained_digest, BlockDigest, CipherContext, DIGEST_LENGTH};
use crate::encoding::pbe;
use crate::error::{CResult, Error};
use crate::io::EncryptedFile;
use crate::util::now_micros;

use super::{ColumnDataAddress, DATA_FILE_HEADER_SIZE};

/// Persistent block header, version 1. Serialized little-endian at file
/// offset 0; the data area starts at `data_area_offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDataBlockHeader {
    pub version: u32,
    pub database_uuid: Uuid,
    pub table_id: u32,
    pub column_id: u64,
    pub block_id: u64,
    pub prev_block_id: u64,
    pub data_area_offset: u32,
    pub data_area_size: u32,
    pub next_data_offset: u32,
    pub committed_data_offset: u32,
    /// Nonzero value indicates the block is full and sealed.
    pub fill_timestamp: u64,
    pub prev_block_digest: BlockDigest,
    pub digest: BlockDigest,
}

impl ColumnDataBlockHeader {
    pub const CURRENT_VERSION: u32 = 1;

    pub const SERIALIZED_SIZE: usize =
        4 + 16 + 4 + 8 + 8 + 8 + 4 + 4 + 4 + 4 + 8 + DIGEST_LENGTH + DIGEST_LENGTH;

    pub fn new(
        database_uuid: Uuid,
        table_id: u32,
        column_id: u64,
        block_id: u64,
        prev_block_id: u64,
        data_area_size: u32,
        prev_block_digest: BlockDigest,
    ) -> Self {
        ColumnDataBlockHeader {
            version: Self::CURRENT_VERSION,
            database_uuid,
            table_id,
            column_id,
            block_id,
            prev_block_id,
            data_area_offset: DATA_FILE_HEADER_SIZE,
            data_area_size,
            next_data_offset: 0,
            committed_data_offset: 0,
            fill_timestamp: 0,
            prev_block_digest,
            digest: [0u8; DIGEST_LENGTH],
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        pbe::encode_u32(self.version, buf);
        pbe::encode_binary(self.database_uuid.as_bytes(), buf);
        pbe::encode_u32(self.table_id, buf);
        pbe::encode_u64(self.column_id, buf);
        pbe::encode_u64(self.block_id, buf);
        pbe::encode_u64(self.prev_block_id, buf);
        pbe::encode_u32(self.data_area_offset, buf);
        pbe::encode_u32(self.data_area_size, buf);
        pbe::encode_u32(self.next_data_offset, buf);
        pbe::encode_u32(self.committed_data_offset, buf);
        pbe::encode_u64(self.fill_timestamp, buf);
        pbe::encode_binary(&self.prev_block_digest, buf);
        pbe::encode_binary(&self.digest, buf);
    }

    pub fn deserialize(data: &[u8]) -> CResult<Self> {
        let mut cursor = Cursor::new(data);
        let version = pbe::decode_u32(&mut cursor)?;
        if version > Self::CURRENT_VERSION {
            return Err(Error::Corrupt(format!("unknown block header version {}", version)));
        }
        let uuid_bytes = pbe::decode_binary(&mut cursor, 16)?;
        let database_uuid = Uuid::from_slice(&uuid_bytes)
            .map_err(|_| Error::Corrupt("bad database uuid in block header".into()))?;
        let table_id = pbe::decode_u32(&mut cursor)?;
        let column_id = pbe::decode_u64(&mut cursor)?;
        let block_id = pbe::decode_u64(&mut cursor)?;
        let prev_block_id = pbe::decode_u64(&mut cursor)?;
        let data_area_offset = pbe::decode_u32(&mut cursor)?;
        let data_area_size = pbe::decode_u32(&mut cursor)?;
        let next_data_offset = pbe::decode_u32(&mut cursor)?;
        let committed_data_offset = pbe::decode_u32(&mut cursor)?;
        let fill_timestamp = pbe::decode_u64(&mut cursor)?;
        let mut prev_block_digest = [0u8; DIGEST_LENGTH];
        prev_block_digest.copy_from_slice(&pbe::decode_binary(&mut cursor, DIGEST_LENGTH)?);
        let mut digest = [0u8; DIGEST_LENGTH];
        digest.copy_from_slice(&pbe::decode_binary(&mut cursor, DIGEST_LENGTH)?);
        let header = ColumnDataBlockHeader {
            version,
            database_uuid,
            table_id,
            column_id,
            block_id,
            prev_block_id,
            data_area_offset,
            data_area_size,
            next_data_offset,
            committed_data_offset,
            fill_timestamp,
            prev_block_digest,
            digest,
        };
        if header.committed_data_offset > header.next_data_offset
            || header.next_data_offset > header.data_area_size
        {
            return Err(Error::Corrupt(format!(
                "block {} header violates offset invariant: committed {} next {} size {}",
                header.block_id,
                header.committed_data_offset,
                header.next_data_offset,
                header.data_area_size
            )));
        }
        Ok(header)
    }
}

/// An open column data block backed by an encrypted file.
pub struct ColumnDataBlock {
    header: ColumnDataBlockHeader,
    file: EncryptedFile,
}

fn block_file_name(block_id: u64) -> String {
    format!("b{}.dat", block_id)
}

pub fn block_file_path(column_dir: &Path, block_id: u64) -> PathBuf {
    column_dir.join(block_file_name(block_id))
}

impl ColumnDataBlock {
    /// Creates a new block file and persists its initial header.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        column_dir: &Path,
        database_uuid: Uuid,
        table_id: u32,
        column_id: u64,
        block_id: u64,
        prev_block_id: u64,
        data_area_size: u32,
        prev_block_digest: BlockDigest,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let path = block_file_path(column_dir, block_id);
        let file = EncryptedFile::create(&path, 0, enc, dec)?;
        let header = ColumnDataBlockHeader::new(
            database_uuid,
            table_id,
            column_id,
            block_id,
            prev_block_id,
            data_area_size,
            prev_block_digest,
        );
        let mut block = ColumnDataBlock { header, file };
        block.persist_header()?;
        Ok(block)
    }

    /// Opens an existing block file and validates its header.
    pub fn open(
        column_dir: &Path,
        block_id: u64,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let path = block_file_path(column_dir, block_id);
        let file = EncryptedFile::open(&path, enc, dec)?;
        let mut buf = vec![0u8; ColumnDataBlockHeader::SERIALIZED_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let header = ColumnDataBlockHeader::deserialize(&buf)?;
        if header.block_id != block_id {
            return Err(Error::Corrupt(format!(
                "block file {} carries header for block {}",
                path.display(),
                header.block_id
            )));
        }
        Ok(ColumnDataBlock { header, file })
    }

    pub fn id(&self) -> u64 {
        self.header.block_id
    }

    pub fn prev_block_id(&self) -> u64 {
        self.header.prev_block_id
    }

    pub fn header(&self) -> &ColumnDataBlockHeader {
        &self.header
    }

    pub fn digest(&self) -> BlockDigest {
        self.header.digest
    }

    /// Free space left in the data area.
    pub fn remaining(&self) -> u32 {
        self.header.data_area_size - self.header.next_data_offset
    }

    pub fn is_sealed(&self) -> bool {
        self.header.fill_timestamp != 0
    }

    /// Appends `data` at the write cursor and returns its address.
    pub fn append(&mut self, data: &[u8]) -> CResult<ColumnDataAddress> {
        if self.is_sealed() {
            return Err(Error::InvalidArgument(format!(
                "block {} is sealed and cannot accept writes",
                self.header.block_id
            )));
        }
        if data.len() as u64 > self.remaining() as u64 {
            return Err(Error::InvalidArgument(format!(
                "block {} cannot fit {} bytes ({} remaining)",
                self.header.block_id,
                data.len(),
                self.remaining()
            )));
        }
        let offset = self.header.next_data_offset;
        self.file
            .write_at(data, self.header.data_area_offset as u64 + offset as u64)?;
        self.header.next_data_offset = offset + data.len() as u32;
        Ok(ColumnDataAddress::new(self.header.block_id, offset))
    }

    /// Reads `buf.len()` bytes at `offset` within the data area. Reads above
    /// the commit watermark are refused unless the caller opts in; the
    /// opt-in exists only for a writer's own same-transaction lookback.
    pub fn read(&self, offset: u32, buf: &mut [u8], allow_uncommitted: bool) -> CResult<()> {
        let end = offset as u64 + buf.len() as u64;
        let limit = if allow_uncommitted {
            self.header.next_data_offset
        } else {
            self.header.committed_data_offset
        };
        if end > limit as u64 {
            return Err(Error::InvalidArgument(format!(
                "read of {} bytes at offset {} in block {} exceeds the {} watermark {}",
                buf.len(),
                offset,
                self.header.block_id,
                if allow_uncommitted { "write" } else { "commit" },
                limit
            )));
        }
        self.file
            .read_exact_at(buf, self.header.data_area_offset as u64 + offset as u64)
    }

    /// Advances the commit watermark to the write cursor and persists the
    /// header.
    pub fn commit(&mut self) -> CResult<()> {
        if self.header.committed_data_offset == self.header.next_data_offset {
            return Ok(());
        }
        self.header.committed_data_offset = self.header.next_data_offset;
        self.persist_header()
    }

    /// Rolls the write cursor back to `offset`. Committed data cannot be
    /// rolled back.
    pub fn rollback_to(&mut self, offset: u32) -> CResult<()> {
        if offset < self.header.committed_data_offset || offset > self.header.next_data_offset {
            return Err(Error::InvalidArgument(format!(
                "cannot roll block {} back to offset {} (committed {}, next {})",
                self.header.block_id,
                offset,
                self.header.committed_data_offset,
                self.header.next_data_offset
            )));
        }
        self.header.next_data_offset = offset;
        Ok(())
    }

    pub fn next_data_offset(&self) -> u32 {
        self.header.next_data_offset
    }

    pub fn committed_data_offset(&self) -> u32 {
        self.header.committed_data_offset
    }

    /// Seals the block: records the fill timestamp and the digest over the
    /// committed data area chained with the predecessor's digest.
    pub fn seal(&mut self) -> CResult<()> {
        self.commit()?;
        let mut data = vec![0u8; self.header.committed_data_offset as usize];
        if !data.is_empty() {
            self.file
                .read_exact_at(&mut data, self.header.data_area_offset as u64)?;
        }
        self.header.digest = chained_digest(&self.header.prev_block_digest, &data);
        self.header.fill_timestamp = now_micros();
        self.persist_header()
    }

    /// Recomputes the chained digest from the on-disk data area and compares
    /// it with the sealed one.
    pub fn verify_digest(&self) -> CResult<bool> {
        if !self.is_sealed() {
            return Ok(false);
        }
        let mut data = vec![0u8; self.header.committed_data_offset as usize];
        if !data.is_empty() {
            self.file
                .read_exact_at(&mut data, self.header.data_area_offset as u64)?;
        }
        Ok(chained_digest(&self.header.prev_block_digest, &data) == self.header.digest)
    }

    pub fn persist_header(&mut self) -> CResult<()> {
        let mut buf = Vec::with_capacity(ColumnDataBlockHeader::SERIALIZED_SIZE);
        self.header.serialize(&mut buf);
        self.file.write_at(&buf, 0)?;
        Ok(())
    }

    pub fn flush(&self) -> CResult<()> {
        self.file.flush()
    }
}
