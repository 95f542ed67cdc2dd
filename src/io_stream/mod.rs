//! Archive streaming: the reader thread that parses volumes into the work
//! queue, and the writer thread that serialises the queue back into volumes.
//!
//! # Volume layout
//! Every volume file is a sequence of header frames (see [`crate::header`]):
//!
//! ```text
//! FsVh  volume header      volume number, format version
//! FsAr  archive root       first volume only
//! ...   FsIn / FsOb / FsDi / FsFe / FsCo headers and FsBk blocks
//! FsVf  volume footer      last-volume flag
//! ```
//!
//! A `FsBk` frame is followed immediately by `archive_size` payload bytes.
//!
//! # Endianness
//! All binary I/O is little-endian, same as the frame codec.

pub mod reader;
pub mod writer;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::block::BlockError;
use crate::dico::DicoError;
use crate::header::{HeaderError, Magic};
use crate::queue::QueueError;

pub use reader::{
    peek_archive, read_and_copy_block, run_reader, ArchiveInfo, ArchiveReader, BlockOutcome,
    ReadSummary, ReaderOptions,
};
pub use writer::{run_writer, ArchiveWriter, WriteSummary, WriterOptions};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("header field: {0}")]
    Dico(#[from] DicoError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("expected a {expected} header, found {found}")]
    UnexpectedHeader { expected: Magic, found: Magic },
    #[error("volume {found} found where volume {expected} was expected")]
    WrongVolume { expected: u32, found: u32 },
    #[error("volume belongs to archive {found:#010x}, expected {expected:#010x}")]
    ForeignVolume { expected: u32, found: u32 },
    #[error("archive format version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("volume {volume} ({}) is missing", path.display())]
    MissingVolume { volume: u32, path: PathBuf },
}

impl ArchiveError {
    /// The queue was closed by another thread.  This is a teardown signal,
    /// not a failure of the thread that observed it.
    pub fn is_queue_closed(&self) -> bool {
        matches!(self, ArchiveError::Queue(QueueError::Closed))
    }
}
