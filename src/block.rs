use thiserror::Error;

use crate::checksum::fletcher32;
use crate::dico::{Dico, DicoError};
use crate::header::{HeaderRecord, Magic};

/// Largest real (uncompressed) block size a block header may declare.
pub const MAX_BLOCK_SIZE: u32 = 8 * 1024 * 1024;

/// Largest stored size accepted for a block.  Compression and encryption may
/// grow incompressible data slightly past its real size.
pub const MAX_ARCHIVE_SIZE: u32 = MAX_BLOCK_SIZE + 64 * 1024;

pub const COMPRESS_NONE: u16 = 0;
pub const ENCRYPT_NONE: u16 = 0;

/// Keys of the start-of-block header.
pub mod block_keys {
    pub const OFFSET: u16 = 0x0020;
    pub const REAL_SIZE: u16 = 0x0021;
    pub const COMPRESS_ALGO: u16 = 0x0022;
    pub const ENCRYPT_ALGO: u16 = 0x0023;
    pub const ARCHIVE_SIZE: u16 = 0x0024;
    pub const COMP_SIZE: u16 = 0x0025;
    pub const CHECKSUM: u16 = 0x0026;
}

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("block header: {0}")]
    Field(#[from] DicoError),
    #[error("block real size {size} exceeds the {max} byte limit")]
    TooLarge { size: u32, max: u32 },
}

/// Where a block stands relative to the transform workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Todo,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Byte offset of the block in the logical stream.
    pub offset: u64,
    pub real_size: u32,
    pub compress_algo: u16,
    pub encrypt_algo: u16,
    /// Bytes stored in the archive for this block.
    pub archive_size: u32,
    /// Bytes after compression, before encryption.
    pub comp_size: u32,
    /// Fletcher-32 of the archive bytes.
    pub checksum: u32,
}

impl BlockMeta {
    pub fn from_dico(dico: &Dico) -> Result<Self, BlockError> {
        let meta = Self {
            offset: dico.get_u64(block_keys::OFFSET)?,
            real_size: dico.get_u32(block_keys::REAL_SIZE)?,
            compress_algo: dico.get_u16(block_keys::COMPRESS_ALGO)?,
            encrypt_algo: dico.get_u16(block_keys::ENCRYPT_ALGO)?,
            archive_size: dico.get_u32(block_keys::ARCHIVE_SIZE)?,
            comp_size: dico.get_u32(block_keys::COMP_SIZE)?,
            checksum: dico.get_u32(block_keys::CHECKSUM)?,
        };
        if meta.real_size > MAX_BLOCK_SIZE {
            return Err(BlockError::TooLarge { size: meta.real_size, max: MAX_BLOCK_SIZE });
        }
        if meta.archive_size > MAX_ARCHIVE_SIZE {
            return Err(BlockError::TooLarge { size: meta.archive_size, max: MAX_ARCHIVE_SIZE });
        }
        Ok(meta)
    }

    pub fn to_dico(&self) -> Dico {
        let mut dico = Dico::new();
        dico.put_u64(block_keys::OFFSET, self.offset);
        dico.put_u32(block_keys::REAL_SIZE, self.real_size);
        dico.put_u16(block_keys::COMPRESS_ALGO, self.compress_algo);
        dico.put_u16(block_keys::ENCRYPT_ALGO, self.encrypt_algo);
        dico.put_u32(block_keys::ARCHIVE_SIZE, self.archive_size);
        dico.put_u32(block_keys::COMP_SIZE, self.comp_size);
        dico.put_u32(block_keys::CHECKSUM, self.checksum);
        dico
    }
}

/// One block of payload travelling through the queue.  Deliberately not
/// `Clone`: a block has exactly one owner at a time.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub data: Vec<u8>,
    pub meta: BlockMeta,
    pub fsid: u16,
}

impl BlockRecord {
    pub fn new(data: Vec<u8>, meta: BlockMeta, fsid: u16) -> Self {
        Self { data, meta, fsid }
    }

    /// Stored block built from raw bytes: no compression, no encryption.
    pub fn stored(offset: u64, data: Vec<u8>, fsid: u16) -> Self {
        let len = data.len() as u32;
        let meta = BlockMeta {
            offset,
            real_size: len,
            compress_algo: COMPRESS_NONE,
            encrypt_algo: ENCRYPT_NONE,
            archive_size: len,
            comp_size: len,
            checksum: fletcher32(&data),
        };
        Self { data, meta, fsid }
    }

    /// Placeholder for a block whose archive bytes failed their checksum:
    /// `real_size` zero bytes, stored as-is.
    pub fn zero_filled(meta: &BlockMeta, fsid: u16) -> Self {
        Self::stored(meta.offset, vec![0u8; meta.real_size as usize], fsid)
    }

    /// Start-of-block header describing `data` exactly as it will be written.
    pub fn header(&self) -> HeaderRecord {
        let meta = BlockMeta {
            archive_size: self.data.len() as u32,
            checksum: fletcher32(&self.data),
            ..self.meta
        };
        HeaderRecord::new(Magic::BLOCK, self.fsid, meta.to_dico())
    }
}
