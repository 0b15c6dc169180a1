//! Per-column block registry.
//!
//! Two encrypted files under `<column>/breg/` track every block of a column:
//!
//! - `blist.<col>.dat`: a densely indexed array of 25-byte block records;
//!   the record for block `id` sits at offset `id * 25`. The state byte
//!   doubles as the presence flag, zero meaning "no such block".
//! - `nblist.<col>.dat`: an append-only log of 12-byte next-block records
//!   threaded into per-block singly linked lists. A block's record in the
//!   block list stores the head and tail offsets of its list.
//!
//! Offset 0 of the next-block list never addresses a live node: the file is
//! seeded with one zero sentinel record, so a zero head offset always means
//! "empty successor list" and traversal terminates strictly on a zero link.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::crypto::CipherContext;
use crate::encoding::pbe;
use crate::error::{CResult, Error};
use crate::io::EncryptedFile;
use crate::util::now_micros;

use super::ColumnDataBlockState;

const BLOCK_REGISTRY_DIR: &str = "breg";
const INIT_FLAG_FILE: &str = "initialized";

/// One record per block slot in the block list file.
#[derive(Debug, Clone, PartialEq)]
struct BlockListRecord {
    state: u8,
    prev_block_id: u64,
    first_next_offset: u64,
    last_next_offset: u64,
}

impl BlockListRecord {
    const SERIALIZED_SIZE: u64 = 25;
    const STATE_FIELD_OFFSET: u64 = 0;
    const PREV_BLOCK_ID_FIELD_OFFSET: u64 = 1;

    fn serialize(&self, buf: &mut Vec<u8>) {
        pbe::encode_u8(self.state, buf);
        pbe::encode_u64(self.prev_block_id, buf);
        pbe::encode_u64(self.first_next_offset, buf);
        pbe::encode_u64(self.last_next_offset, buf);
    }

    fn deserialize(data: &[u8]) -> CResult<Self> {
        let mut cursor = Cursor::new(data);
        Ok(BlockListRecord {
            state: pbe::decode_u8(&mut cursor)?,
            prev_block_id: pbe::decode_u64(&mut cursor)?,
            first_next_offset: pbe::decode_u64(&mut cursor)?,
            last_next_offset: pbe::decode_u64(&mut cursor)?,
        })
    }
}

/// Singly linked list node in the next-block list file.
#[derive(Debug, Clone, PartialEq)]
struct NextBlockListRecord {
    block_id: u64,
    next_offset: u32,
}

impl NextBlockListRecord {
    const SERIALIZED_SIZE: u64 = 12;
    const NEXT_OFFSET_FIELD_OFFSET: u64 = 8;

    fn serialize(&self, buf: &mut Vec<u8>) {
        pbe::encode_u64(self.block_id, buf);
        pbe::encode_u32(self.next_offset, buf);
    }

    fn deserialize(data: &[u8]) -> CResult<Self> {
        let mut cursor = Cursor::new(data);
        Ok(NextBlockListRecord {
            block_id: pbe::decode_u64(&mut cursor)?,
            next_offset: pbe::decode_u32(&mut cursor)?,
        })
    }
}

pub struct BlockRegistry {
    data_dir: PathBuf,
    block_list_file: EncryptedFile,
    next_block_list_file: EncryptedFile,
    last_block_id: u64,
}

impl BlockRegistry {
    /// Creates the registry directory and both data files. Fails when the
    /// registry was already initialized.
    pub fn create(
        column_dir: &Path,
        column_id: u64,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let data_dir = column_dir.join(BLOCK_REGISTRY_DIR);
        let init_flag = data_dir.join(INIT_FLAG_FILE);
        if init_flag.exists() {
            return Err(Error::AlreadyExists(format!(
                "block registry in {} is already initialized",
                data_dir.display()
            )));
        }
        if data_dir.exists() {
            fs::remove_dir_all(&data_dir)?;
        }
        fs::create_dir_all(&data_dir)?;

        let block_list_file = EncryptedFile::create(
            &data_dir.join(block_list_file_name(column_id)),
            0,
            enc.clone(),
            dec.clone(),
        )?;
        let mut next_block_list_file = EncryptedFile::create(
            &data_dir.join(next_block_list_file_name(column_id)),
            0,
            enc,
            dec,
        )?;
        // Seed the zero sentinel so offset 0 stays reserved.
        next_block_list_file.extend(NextBlockListRecord::SERIALIZED_SIZE)?;

        fs::write(&init_flag, now_micros().to_string())?;
        log::debug!("created block registry in {}", data_dir.display());

        Ok(BlockRegistry { data_dir, block_list_file, next_block_list_file, last_block_id: 0 })
    }

    /// Opens an existing registry, validating both file sizes.
    pub fn open(
        column_dir: &Path,
        column_id: u64,
        enc: Arc<dyn CipherContext>,
        dec: Arc<dyn CipherContext>,
    ) -> CResult<Self> {
        let data_dir = column_dir.join(BLOCK_REGISTRY_DIR);
        if !data_dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::NotFound(format!(
                "block registry in {} is not initialized",
                data_dir.display()
            )));
        }
        let block_list_file = EncryptedFile::open(
            &data_dir.join(block_list_file_name(column_id)),
            enc.clone(),
            dec.clone(),
        )?;
        let next_block_list_file =
            EncryptedFile::open(&data_dir.join(next_block_list_file_name(column_id)), enc, dec)?;

        let block_list_size = block_list_file.size();
        if block_list_size % BlockListRecord::SERIALIZED_SIZE != 0 {
            return Err(Error::Corrupt(format!(
                "block list file in {} has invalid size {}",
                data_dir.display(),
                block_list_size
            )));
        }
        let next_block_list_size = next_block_list_file.size();
        if next_block_list_size == 0
            || next_block_list_size % NextBlockListRecord::SERIALIZED_SIZE != 0
        {
            return Err(Error::Corrupt(format!(
                "next-block list file in {} has invalid size {}",
                data_dir.display(),
                next_block_list_size
            )));
        }

        let mut last_block_id = block_list_size / BlockListRecord::SERIALIZED_SIZE;
        if last_block_id > 0 {
            last_block_id -= 1;
        }
        log::debug!(
            "opened block registry in {}: last block id {}",
            data_dir.display(),
            last_block_id
        );

        Ok(BlockRegistry { data_dir, block_list_file, next_block_list_file, last_block_id })
    }

    pub fn last_block_id(&self) -> u64 {
        self.last_block_id
    }

    /// Reads the predecessor of `block_id`.
    pub fn find_prev_block_id(&self, block_id: u64) -> CResult<u64> {
        let record_offset = self.check_block_record_present(block_id)?;
        let mut buf = [0u8; 8];
        self.block_list_file
            .read_exact_at(&mut buf, record_offset + BlockListRecord::PREV_BLOCK_ID_FIELD_OFFSET)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Walks the next-block list of `block_id`, returning all successor
    /// block ids in registration order.
    pub fn find_next_block_ids(&self, block_id: u64) -> CResult<Vec<u64>> {
        let record = self.load_record(block_id)?;
        let mut next_blocks = Vec::new();
        let mut offset = record.first_next_offset;
        let max_nodes = self.next_block_list_file.size() / NextBlockListRecord::SERIALIZED_SIZE;
        while offset != 0 {
            if next_blocks.len() as u64 >= max_nodes {
                return Err(Error::Corrupt(format!(
                    "next-block list of block {} in {} contains a cycle",
                    block_id,
                    self.data_dir.display()
                )));
            }
            let node = self.load_next_record(offset)?;
            next_blocks.push(node.block_id);
            offset = node.next_offset as u64;
        }
        Ok(next_blocks)
    }

    /// Current state of `block_id`.
    pub fn block_state(&self, block_id: u64) -> CResult<ColumnDataBlockState> {
        let record = self.load_record(block_id)?;
        ColumnDataBlockState::try_from(record.state)
            .map_err(|b| Error::Corrupt(format!("block {} has invalid state byte {}", block_id, b)))
    }

    /// Returns all present block ids in ascending order.
    pub fn block_ids(&self) -> CResult<Vec<u64>> {
        let mut ids = Vec::new();
        for block_id in 1..=self.last_block_id {
            let record_offset = block_id * BlockListRecord::SERIALIZED_SIZE;
            let mut state = [0u8; 1];
            self.block_list_file
                .read_exact_at(&mut state, record_offset + BlockListRecord::STATE_FIELD_OFFSET)?;
            if state[0] != 0 {
                ids.push(block_id);
            }
        }
        Ok(ids)
    }

    /// Writes a fresh record for `block_id`.
    pub fn record_block(
        &mut self,
        block_id: u64,
        prev_block_id: u64,
        state: ColumnDataBlockState,
    ) -> CResult<()> {
        if block_id == 0 {
            return Err(Error::InvalidArgument("block id 0 is reserved".into()));
        }
        log::debug!(
            "block registry {}: recording block {} (prev {}, state {:?})",
            self.data_dir.display(),
            block_id,
            prev_block_id,
            state
        );
        let record = BlockListRecord {
            state: state as u8,
            prev_block_id,
            first_next_offset: 0,
            last_next_offset: 0,
        };
        store_record(&mut self.block_list_file, block_id, &record)?;
        if block_id > self.last_block_id {
            self.last_block_id = block_id;
        }
        Ok(())
    }

    /// `record_block` plus linking from the parent, as block rollover needs.
    pub fn record_block_and_next_block(
        &mut self,
        block_id: u64,
        prev_block_id: u64,
        state: ColumnDataBlockState,
    ) -> CResult<()> {
        self.record_block(block_id, prev_block_id, state)?;
        if prev_block_id != 0 {
            self.add_next_block(prev_block_id, block_id)?;
        }
        Ok(())
    }

    /// Single-byte state update.
    pub fn update_block_state(
        &mut self,
        block_id: u64,
        state: ColumnDataBlockState,
    ) -> CResult<()> {
        let record_offset = self.check_block_record_present(block_id)?;
        self.block_list_file
            .write_at(&[state as u8], record_offset + BlockListRecord::STATE_FIELD_OFFSET)?;
        Ok(())
    }

    /// Appends `next_block_id` to the successor list of `block_id`.
    ///
    /// The new node is written with a zero link first; linking it from the
    /// old tail is guarded so that a failure while updating the block record
    /// rewinds the dangling link, making the new node unreachable again.
    pub fn add_next_block(&mut self, block_id: u64, next_block_id: u64) -> CResult<()> {
        let mut record = self.load_record(block_id)?;

        let new_offset = self.next_block_list_file.size();
        if new_offset > u32::MAX as u64 {
            return Err(Error::InvalidArgument(format!(
                "next-block list in {} is full",
                self.data_dir.display()
            )));
        }

        // Append the new node, link field zeroed.
        let node = NextBlockListRecord { block_id: next_block_id, next_offset: 0 };
        let mut buf = Vec::with_capacity(NextBlockListRecord::SERIALIZED_SIZE as usize);
        node.serialize(&mut buf);
        self.next_block_list_file.write_at(&buf, new_offset)?;

        if record.last_next_offset == 0 {
            // First successor: head and tail both point at the new node.
            record.first_next_offset = new_offset;
            record.last_next_offset = new_offset;
            store_record(&mut self.block_list_file, block_id, &record)?;
        } else {
            let old_tail = record.last_next_offset;
            let this = &mut *self;
            let guard =
                TailLinkGuard::link(&mut this.next_block_list_file, old_tail, new_offset as u32)?;
            record.last_next_offset = new_offset;
            store_record(&mut this.block_list_file, block_id, &record)?;
            guard.commit();
        }
        Ok(())
    }

    // --- internals ---

    fn load_record(&self, block_id: u64) -> CResult<BlockListRecord> {
        let record_offset = self.check_block_record_present(block_id)?;
        let mut buf = [0u8; BlockListRecord::SERIALIZED_SIZE as usize];
        self.block_list_file.read_exact_at(&mut buf, record_offset)?;
        BlockListRecord::deserialize(&buf)
    }

    fn load_next_record(&self, offset: u64) -> CResult<NextBlockListRecord> {
        let mut buf = [0u8; NextBlockListRecord::SERIALIZED_SIZE as usize];
        self.next_block_list_file.read_exact_at(&mut buf, offset)?;
        NextBlockListRecord::deserialize(&buf)
    }

    fn check_block_record_present(&self, block_id: u64) -> CResult<u64> {
        if block_id == 0 || block_id > self.last_block_id {
            return Err(no_such_block(&self.data_dir, block_id));
        }
        let record_offset = block_id * BlockListRecord::SERIALIZED_SIZE;
        let mut state = [0u8; 1];
        self.block_list_file
            .read_exact_at(&mut state, record_offset + BlockListRecord::STATE_FIELD_OFFSET)?;
        if state[0] == 0 {
            return Err(no_such_block(&self.data_dir, block_id));
        }
        Ok(record_offset)
    }
}

fn no_such_block(data_dir: &Path, block_id: u64) -> Error {
    Error::NotFound(format!("block {} does not exist in {}", block_id, data_dir.display()))
}

fn block_list_file_name(column_id: u64) -> String {
    format!("blist.{}.dat", column_id)
}

fn next_block_list_file_name(column_id: u64) -> String {
    format!("nblist.{}.dat", column_id)
}

fn store_record(file: &mut EncryptedFile, block_id: u64, record: &BlockListRecord) -> CResult<()> {
    let mut buf = Vec::with_capacity(BlockListRecord::SERIALIZED_SIZE as usize);
    record.serialize(&mut buf);
    file.write_at(&buf, block_id * BlockListRecord::SERIALIZED_SIZE)?;
    Ok(())
}

/// Links the old tail node to a freshly appended one and rewinds the link
/// on drop unless committed. The rollback path must not panic on its own
/// I/O failure; it logs and moves on, leaving the dangling node unreachable
/// from the head pointer anyway.
struct TailLinkGuard<'a> {
    file: &'a mut EncryptedFile,
    tail_offset: u64,
    committed: bool,
}

impl<'a> TailLinkGuard<'a> {
    fn link(file: &'a mut EncryptedFile, tail_offset: u64, new_offset: u32) -> CResult<Self> {
        file.write_at(
            &new_offset.to_le_bytes(),
            tail_offset + NextBlockListRecord::NEXT_OFFSET_FIELD_OFFSET,
        )?;
        Ok(TailLinkGuard { file, tail_offset, committed: false })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TailLinkGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.file.write_at(
            &0u32.to_le_bytes(),
            self.tail_offset + NextBlockListRecord::NEXT_OFFSET_FIELD_OFFSET,
        ) {
            log::error!(
                "failed to rewind next-block tail link at offset {}: {}",
                self.tail_offset,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherRegistry;

    fn contexts() -> (Arc<dyn CipherContext>, Arc<dyn CipherContext>) {
        let registry = CipherRegistry::with_builtin_ciphers();
        let cipher = registry.get_cipher("aes128").unwrap();
        let key = [3u8; 16];
        (
            cipher.create_encryption_context(&key).unwrap(),
            cipher.create_decryption_context(&key).unwrap(),
        )
    }

    fn new_registry(dir: &Path) -> BlockRegistry {
        let (enc, dec) = contexts();
        BlockRegistry::create(dir, 1, enc, dec).unwrap()
    }

    #[test]
    fn record_and_find() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut reg = new_registry(dir.path());

        reg.record_block(1, 0, ColumnDataBlockState::Current)?;
        reg.record_block_and_next_block(2, 1, ColumnDataBlockState::Creating)?;

        assert_eq!(reg.find_prev_block_id(2)?, 1);
        assert_eq!(reg.find_next_block_ids(1)?, vec![2]);
        assert_eq!(reg.find_next_block_ids(2)?, Vec::<u64>::new());
        assert_eq!(reg.last_block_id(), 2);
        assert_eq!(reg.block_state(2)?, ColumnDataBlockState::Creating);
        Ok(())
    }

    #[test]
    fn successor_registration_order_is_kept() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut reg = new_registry(dir.path());
        reg.record_block(1, 0, ColumnDataBlockState::Closed)?;
        for id in 2..=5 {
            reg.record_block(id, 1, ColumnDataBlockState::Available)?;
            reg.add_next_block(1, id)?;
        }
        assert_eq!(reg.find_next_block_ids(1)?, vec![2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn missing_block_is_not_found() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut reg = new_registry(dir.path());
        assert!(matches!(reg.find_prev_block_id(1), Err(Error::NotFound(_))));
        reg.record_block(2, 0, ColumnDataBlockState::Current)?;
        // Slot 1 exists in the file but was never recorded.
        assert!(matches!(reg.find_prev_block_id(1), Err(Error::NotFound(_))));
        assert_eq!(reg.block_ids()?, vec![2]);
        Ok(())
    }

    #[test]
    fn state_update_is_single_byte() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let mut reg = new_registry(dir.path());
        reg.record_block(1, 0, ColumnDataBlockState::Creating)?;
        reg.update_block_state(1, ColumnDataBlockState::Closed)?;
        assert_eq!(reg.block_state(1)?, ColumnDataBlockState::Closed);
        assert_eq!(reg.find_prev_block_id(1)?, 0);
        Ok(())
    }

    #[test]
    fn reopen_restores_last_block_id() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut reg = new_registry(dir.path());
            reg.record_block(1, 0, ColumnDataBlockState::Closed)?;
            reg.record_block_and_next_block(2, 1, ColumnDataBlockState::Current)?;
        }
        let (enc, dec) = contexts();
        let reg = BlockRegistry::open(dir.path(), 1, enc, dec)?;
        assert_eq!(reg.last_block_id(), 2);
        assert_eq!(reg.find_prev_block_id(2)?, 1);
        assert_eq!(reg.find_next_block_ids(1)?, vec![2]);
        Ok(())
    }

    #[test]
    fn double_create_is_rejected() -> CResult<()> {
        let dir = tempfile::tempdir()?;
        let _reg = new_registry(dir.path());
        let (enc, dec) = contexts();
        assert!(matches!(
            BlockRegistry::create(dir.path(), 1, enc, dec),
            Err(Error::AlreadyExists(_))
        ));
        Ok(())
    }
}
