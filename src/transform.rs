//! Block transform workers.
//!
//! A worker claims `TODO` blocks from the queue, turns the stored form into
//! the form wanted in the output archive and hands the block back to its
//! original slot as `DONE`.

use log::{debug, error};
use thiserror::Error;

use crate::block::BlockRecord;
use crate::checksum::fletcher32;
use crate::codec::{CodecError, CodecId};
use crate::context::PipelineContext;
use crate::crypto::{BlockKey, CryptoError, ENCRYPT_AES256_GCM, ENCRYPT_NONE};

#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("block at offset {offset}: stored size is {actual}, header declares {expected}")]
    SizeMismatch { offset: u64, expected: u32, actual: usize },
}

pub trait BlockTransform: Send + Sync {
    fn transform(&self, block: BlockRecord) -> Result<BlockRecord, TransformError>;
}

/// Recompress (and optionally re-encrypt) blocks.
#[derive(Debug, Clone)]
pub struct CodecTransform {
    pub codec:   CodecId,
    pub level:   i32,
    /// Key for blocks that arrive encrypted.
    pub decrypt: Option<BlockKey>,
    /// Key to encrypt outgoing blocks with.
    pub encrypt: Option<BlockKey>,
}

impl CodecTransform {
    pub fn new(codec: CodecId, level: i32) -> Self {
        Self { codec, level, decrypt: None, encrypt: None }
    }

    fn unseal(&self, block: &BlockRecord) -> Result<Vec<u8>, TransformError> {
        let meta = &block.meta;
        let compressed = match meta.encrypt_algo {
            ENCRYPT_NONE => block.data.clone(),
            ENCRYPT_AES256_GCM => {
                let key = self.decrypt.as_ref().ok_or(CryptoError::MissingKey)?;
                key.decrypt(&block.data)?
            }
            other => return Err(CryptoError::UnknownAlgorithm(other).into()),
        };
        if compressed.len() != meta.comp_size as usize {
            return Err(TransformError::SizeMismatch {
                offset: meta.offset,
                expected: meta.comp_size,
                actual: compressed.len(),
            });
        }
        let codec = CodecId::from_tag(meta.compress_algo)?;
        Ok(codec.decompress(&compressed, meta.real_size as usize)?)
    }
}

impl BlockTransform for CodecTransform {
    fn transform(&self, block: BlockRecord) -> Result<BlockRecord, TransformError> {
        let raw = self.unseal(&block)?;

        // Keep incompressible data as it is.
        let (codec, packed) = match self.codec.compress(&raw, self.level)? {
            packed if self.codec != CodecId::None && packed.len() < raw.len() => {
                (self.codec, packed)
            }
            _ => (CodecId::None, raw),
        };
        let comp_size = packed.len() as u32;

        let (encrypt_algo, data) = match &self.encrypt {
            Some(key) => (ENCRYPT_AES256_GCM, key.encrypt(&packed)?),
            None => (ENCRYPT_NONE, packed),
        };

        let mut meta = block.meta;
        meta.compress_algo = codec.tag();
        meta.encrypt_algo = encrypt_algo;
        meta.comp_size = comp_size;
        meta.archive_size = data.len() as u32;
        meta.checksum = fletcher32(&data);
        Ok(BlockRecord::new(data, meta, block.fsid))
    }
}

/// Body of a transform worker thread.  Returns the number of blocks it
/// transformed.
///
/// A failed transform requests stop-filling and closes the queue so the
/// reader and the writer both unwind.
pub fn run_worker(
    ctx: &PipelineContext,
    transform: &dyn BlockTransform,
) -> Result<u64, TransformError> {
    let _thread = ctx.enter_thread();
    let mut transformed = 0u64;

    while let Some((ticket, block)) = ctx.queue.claim_todo() {
        let offset = block.meta.offset;
        match transform.transform(block) {
            Ok(out) => {
                if ctx.queue.complete(ticket, out) {
                    transformed += 1;
                }
            }
            Err(e) => {
                error!("transforming block at offset {offset} failed: {e}");
                ctx.request_stop_filling();
                ctx.queue.close();
                return Err(e);
            }
        }
    }

    debug!("worker exiting after {transformed} block(s)");
    Ok(transformed)
}
