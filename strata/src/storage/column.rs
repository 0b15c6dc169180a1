//! A column: an append-only sequence of values spread over chained data
//! blocks, with a bounded cache of open block files.
//!
//! A column permits one writer at a time; the owning table serializes
//! access. At most one block is in the `Current` state and receives all
//! appends; when a value does not fit, the block is sealed and a successor
//! is allocated and linked through the block registry.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use uuid::Uuid;

use crate::crypto::{CipherContext, DIGEST_LENGTH};
use crate::encoding::varint::{decode_var_uint64, encode_var_uint64, MAX_VAR_UINT64_SIZE};
use crate::error::{CResult, Error};
use crate::row::ColumnDataType;

use super::block::ColumnDataBlock;
use super::{BlockRegistry, ColumnDataAddress, ColumnDataBlockState};

/// Open block files kept around for reading.
const BLOCK_CACHE_CAPACITY: usize = 16;

pub struct Column {
    database_uuid: Uuid,
    table_id: u32,
    id: u64,
    name: String,
    data_type: ColumnDataType,
    data_dir: PathBuf,
    data_area_size: u32,
    registry: BlockRegistry,
    /// The single block in the `Current` state, held outside the read cache
    /// so it cannot be evicted mid-write.
    current: Option<ColumnDataBlock>,
    cache: LruCache<u64, ColumnDataBlock>,
    enc: Arc<dyn CipherContext>,
    dec: Arc<dyn CipherContext>,
}

impl Column {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        table_dir: &Path,
        database_uuid: Uuid,
        table_id: u32,
        id: u64,
        name: String,
        data_type: ColumnDataType,
        data_area_size: u32,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let data_dir = table_dir.join(id.to_string());
        fs::create_dir_all(&data_dir)?;
        let registry = BlockRegistry::create(&data_dir, id, enc.clone(), dec.clone())?;
        log::debug!("created column {} ({}) in {}", name, id, data_dir.display());
        Ok(Column {
            database_uuid,
            table_id,
            id,
            name,
            data_type,
            data_dir,
            data_area_size,
            registry,
            current: None,
            cache: LruCache::new(NonZeroUsize::new(BLOCK_CACHE_CAPACITY).unwrap()),
            enc,
            dec,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open(
        table_dir: &Path,
        database_uuid: Uuid,
        table_id: u32,
        id: u64,
        name: String,
        data_type: ColumnDataType,
        data_area_size: u32,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let data_dir = table_dir.join(id.to_string());
        let registry = BlockRegistry::open(&data_dir, id, enc.clone(), dec.clone())?;
        let mut column = Column {
            database_uuid,
            table_id,
            id,
            name,
            data_type,
            data_dir,
            data_area_size,
            registry,
            current: None,
            cache: LruCache::new(NonZeroUsize::new(BLOCK_CACHE_CAPACITY).unwrap()),
            enc,
            dec,
        };
        let last = column.registry.last_block_id();
        if last > 0 && column.registry.block_state(last)? == ColumnDataBlockState::Current {
            let block =
                ColumnDataBlock::open(&column.data_dir, last, column.enc.clone(), column.dec.clone())?;
            column.current = Some(block);
        }
        Ok(column)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> ColumnDataType {
        self.data_type
    }

    /// Id of the block currently accepting appends, if any.
    pub fn current_block_id(&self) -> Option<u64> {
        self.current.as_ref().map(|b| b.id())
    }

    pub fn block_ids(&self) -> CResult<Vec<u64>> {
        self.registry.block_ids()
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// Appends a value (varint length prefix + payload) and returns its
    /// stable address.
    pub fn append_value(&mut self, value: &[u8]) -> CResult<ColumnDataAddress> {
        let mut buf = Vec::with_capacity(MAX_VAR_UINT64_SIZE + value.len());
        encode_var_uint64(value.len() as u64, &mut buf);
        buf.extend_from_slice(value);
        if buf.len() as u64 > self.data_area_size as u64 {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes does not fit a column {} block ({} bytes)",
                value.len(),
                self.name,
                self.data_area_size
            )));
        }

        self.ensure_current_block()?;
        if (self.current.as_ref().unwrap().remaining() as usize) < buf.len() {
            self.roll_over_current_block()?;
        }
        self.current.as_mut().unwrap().append(&buf)
    }

    /// Reads the committed value stored at `address`.
    pub fn read_value(&mut self, address: ColumnDataAddress) -> CResult<Vec<u8>> {
        self.read_value_opts(address, false)
    }

    /// Reads the value at `address`. The uncommitted opt-in exists for the
    /// writer's own lookback within an open transaction.
    pub fn read_value_opts(
        &mut self,
        address: ColumnDataAddress,
        allow_uncommitted: bool,
    ) -> CResult<Vec<u8>> {
        if address.is_null() {
            return Err(Error::InvalidArgument(format!(
                "null address read on column {}",
                self.name
            )));
        }
        let name = self.name.clone();
        let block = self.borrow_block(address.block_id)?;
        let limit =
            if allow_uncommitted { block.next_data_offset() } else { block.committed_data_offset() };
        if address.offset >= limit {
            return Err(Error::Corrupt(format!(
                "address {} on column {} points past the watermark {}",
                address, name, limit
            )));
        }
        let avail = (limit - address.offset) as usize;
        let mut prefix = vec![0u8; avail.min(MAX_VAR_UINT64_SIZE)];
        block.read(address.offset, &mut prefix, allow_uncommitted)?;
        let (len, consumed) = decode_var_uint64(&prefix)
            .map_err(|e| Error::Corrupt(format!("bad value length on column {}: {}", name, e)))?;
        let mut value = vec![0u8; len as usize];
        block.read(address.offset + consumed as u32, &mut value, allow_uncommitted)?;
        Ok(value)
    }

    /// Walks every committed value in block-chain order.
    pub fn scan_committed(
        &mut self,
        mut visit: impl FnMut(ColumnDataAddress, Vec<u8>) -> CResult<()>,
    ) -> CResult<()> {
        for block_id in self.registry.block_ids()? {
            let committed = self.borrow_block(block_id)?.committed_data_offset();
            let mut offset = 0u32;
            while offset < committed {
                let address = ColumnDataAddress::new(block_id, offset);
                let value = self.read_value(address)?;
                let consumed = {
                    let mut prefix = Vec::new();
                    encode_var_uint64(value.len() as u64, &mut prefix);
                    prefix.len() as u32
                };
                offset += consumed + value.len() as u32;
                visit(address, value)?;
            }
        }
        Ok(())
    }

    /// Makes committed appends durable and visible to readers.
    pub fn commit(&mut self) -> CResult<()> {
        if let Some(block) = self.current.as_mut() {
            block.commit()?;
        }
        Ok(())
    }

    /// Discards uncommitted appends in the current block.
    pub fn rollback(&mut self) -> CResult<()> {
        if let Some(block) = self.current.as_mut() {
            let committed = block.committed_data_offset();
            block.rollback_to(committed)?;
        }
        Ok(())
    }

    /// Seals the current block and allocates its successor; returns the
    /// first address of the new block.
    pub fn seal_current_block(&mut self) -> CResult<ColumnDataAddress> {
        self.ensure_current_block()?;
        self.roll_over_current_block()?;
        Ok(ColumnDataAddress::new(self.current.as_ref().unwrap().id(), 0))
    }

    pub fn flush(&mut self) -> CResult<()> {
        if let Some(block) = self.current.as_ref() {
            block.flush()?;
        }
        Ok(())
    }

    // --- internals ---

    fn ensure_current_block(&mut self) -> CResult<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let prev_block_id = self.registry.last_block_id();
        let prev_digest = if prev_block_id == 0 {
            [0u8; DIGEST_LENGTH]
        } else {
            self.borrow_block(prev_block_id)?.digest()
        };
        self.allocate_block(prev_block_id, prev_digest)
    }

    fn roll_over_current_block(&mut self) -> CResult<()> {
        let mut sealed = self.current.take().expect("no current block to roll over");
        sealed.seal()?;
        self.registry.update_block_state(sealed.id(), ColumnDataBlockState::Closed)?;
        let prev_block_id = sealed.id();
        let prev_digest = sealed.digest();
        log::debug!(
            "column {} ({}): sealed block {} at fill timestamp {}",
            self.name,
            self.id,
            prev_block_id,
            sealed.header().fill_timestamp
        );
        self.cache.put(prev_block_id, sealed);
        self.allocate_block(prev_block_id, prev_digest)
    }

    fn allocate_block(&mut self, prev_block_id: u64, prev_digest: [u8; DIGEST_LENGTH]) -> CResult<()> {
        let block_id = self.registry.last_block_id() + 1;
        self.registry.record_block_and_next_block(
            block_id,
            prev_block_id,
            ColumnDataBlockState::Creating,
        )?;
        let block = ColumnDataBlock::create(
            &self.data_dir,
            self.database_uuid,
            self.table_id,
            self.id,
            block_id,
            prev_block_id,
            self.data_area_size,
            prev_digest,
            self.enc.clone(),
            self.dec.clone(),
        )?;
        self.registry.update_block_state(block_id, ColumnDataBlockState::Current)?;
        self.current = Some(block);
        Ok(())
    }

    fn borrow_block(&mut self, block_id: u64) -> CResult<&ColumnDataBlock> {
        if self.current.as_ref().map(|b| b.id()) == Some(block_id) {
            return Ok(self.current.as_ref().unwrap());
        }
        if !self.cache.contains(&block_id) {
            // Confirm the block exists before touching the filesystem.
            self.registry.block_state(block_id)?;
            let block =
                ColumnDataBlock::open(&self.data_dir, block_id, self.enc.clone(), self.dec.clone())?;
            self.cache.put(block_id, block);
        }
        Ok(self.cache.get(&block_id).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherRegistry;

    fn contexts() -> (Arc<dyn CipherContext>, Arc<dyn CipherContext>) {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher("aes128").unwrap();
        let key = [9u8; 16];
        (
            cipher.create_encryption_context(&key).unwrap(),
            cipher.create_decryption_context(&key).unwrap(),
        )
    }

    fn new_column(dir: &Path, data_area_size: u32) -> Column {
        let (enc, dec) = contexts();
        Column::create(
            dir,
            Uuid::nil(),
            1,
            7,
            "C1".into(),
            ColumnDataType::Binary,
            data_area_size,
            enc,
            dec,
        )
        .unwrap()
    }

    fn reopen_column(dir: &Path, data_area_size: u32) -> Column {
        let (enc, dec) = contexts();
        Column::open(
            dir,
            Uuid::nil(),
            1,
            7,
            "C1".into(),
            ColumnDataType::Binary,
            data_area_size,
            enc,
            dec,
        )
        .unwrap()
    }

    #[test]
    fn append_and_read_survive_reopen() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let (a1, a2);
        {
            let mut col = new_column(dir.path(), 1024);
            a1 = col.append_value(&[0x01, 0x02, 0x03])?;
            a2 = col.append_value(&[0x04])?;
            col.commit()?;
            assert_eq!(col.read_value(a1)?, vec![0x01, 0x02, 0x03]);
        }
        let mut col = reopen_column(dir.path(), 1024);
        assert_eq!(col.read_value(a1)?, vec![0x01, 0x02, 0x03]);
        assert_eq!(col.read_value(a2)?, vec![0x04]);
        Ok(())
    }

    #[test]
    fn uncommitted_values_are_invisible() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut col = new_column(dir.path(), 1024);
        let addr = col.append_value(b"pending")?;
        assert!(col.read_value(addr).is_err());
        assert_eq!(col.read_value_opts(addr, true)?, b"pending");
        col.commit()?;
        assert_eq!(col.read_value(addr)?, b"pending");
        Ok(())
    }

    #[test]
    fn full_block_rolls_over_and_links() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        // Tiny data area: value framing is 1-byte prefix + payload.
        let mut col = new_column(dir.path(), 32);
        // Fill block 1 to within 3 bytes of its data area.
        col.append_value(&[0xaa; 28])?; // 29 bytes with prefix
        assert_eq!(col.current_block_id(), Some(1));

        let addr = col.append_value(&[1, 2, 3, 4])?;
        col.commit()?;

        assert_eq!(addr, ColumnDataAddress::new(2, 0));
        assert_eq!(col.current_block_id(), Some(2));
        assert_eq!(col.registry().find_prev_block_id(2)?, 1);
        assert_eq!(col.registry().find_next_block_ids(1)?, vec![2]);
        assert_eq!(col.registry().block_state(1)?, ColumnDataBlockState::Closed);
        assert_eq!(col.read_value(addr)?, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn oversized_value_is_rejected() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut col = new_column(dir.path(), 16);
        assert!(matches!(col.append_value(&[0u8; 64]), Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn rollback_discards_pending_appends() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut col = new_column(dir.path(), 1024);
        let kept = col.append_value(b"kept")?;
        col.commit()?;
        let lost = col.append_value(b"lost")?;
        col.rollback()?;
        // The next append reuses the rolled-back space.
        let replay = col.append_value(b"replay")?;
        col.commit()?;
        assert_eq!(replay, lost);
        assert_eq!(col.read_value(kept)?, b"kept");
        assert_eq!(col.read_value(replay)?, b"replay");
        Ok(())
    }

    #[test]
    fn scan_visits_all_committed_values() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut col = new_column(dir.path(), 32);
        let mut expected = Vec::new();
        for i in 0u8..10 {
            let value = vec![i; (i as usize % 8) + 1];
            col.append_value(&value)?;
            expected.push(value);
            col.commit()?;
        }
        let mut seen = Vec::new();
        col.scan_committed(|_, value| {
            seen.push(value);
            Ok(())
        })?;
        assert_eq!(seen, expected);
        Ok(())
    }
}
