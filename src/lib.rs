pub mod checksum;
pub mod dico;
pub mod header;
pub mod block;
pub mod queue;
pub mod context;
pub mod volume;
pub mod codec;
pub mod crypto;
pub mod transform;
pub mod io_stream;
pub mod pipeline;

pub use block::{BlockMeta, BlockRecord, BlockStatus, MAX_BLOCK_SIZE};
pub use checksum::fletcher32;
pub use codec::CodecId;
pub use context::{FsSelection, PipelineContext};
pub use header::{HeaderRecord, Magic, FSID_GLOBAL};
pub use io_stream::{ArchiveError, ArchiveReader, ArchiveWriter, ReaderOptions, WriterOptions};
pub use pipeline::{Pipeline, PipelineOptions, PipelineReport, Sink};
pub use queue::{QueueError, QueueItem, WorkQueue};
pub use transform::{BlockTransform, CodecTransform};
