use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;

use super::ArchiveError;
use crate::context::PipelineContext;
use crate::header::{new_archive_id, root_keys, write_frame, HeaderRecord, Magic};
use crate::queue::{QueueError, QueueItem};
use crate::volume::volume_path;

/// How long one drain step waits for the head item during an abort.
const DRAIN_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Id stamped on every frame.  Random when `None`.
    pub archive_id:     Option<u32>,
    /// Start a new volume before a volume would grow past this many bytes.
    pub split_size:     Option<u64>,
    /// Take blocks that are still `TODO`.  Needed when no transform worker
    /// runs, otherwise the head block would never become `DONE`.
    pub accept_pending: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteSummary {
    pub volumes: u32,
    pub headers: u64,
    pub blocks:  u64,
    pub bytes:   u64,
    pub aborted: bool,
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ArchiveWriter {
    base:           PathBuf,
    archive_id:     u32,
    options:        WriterOptions,
    volume:         u32,
    stream:         Option<BufWriter<File>>,
    volume_bytes:   u64,
    volume_records: u64,
    paths:          Vec<PathBuf>,
    summary:        WriteSummary,
}

impl ArchiveWriter {
    pub fn new(base: impl Into<PathBuf>, options: WriterOptions) -> Self {
        Self {
            base: base.into(),
            archive_id: options.archive_id.unwrap_or_else(new_archive_id),
            options,
            volume: 0,
            stream: None,
            volume_bytes: 0,
            volume_records: 0,
            paths: Vec::new(),
            summary: WriteSummary::default(),
        }
    }

    pub fn archive_id(&self) -> u32 {
        self.archive_id
    }

    pub fn summary(&self) -> &WriteSummary {
        &self.summary
    }

    /// Every volume file created so far, in order.
    pub fn volume_paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn stream(&mut self) -> Result<&mut BufWriter<File>, ArchiveError> {
        let (volume, path) = (self.volume, volume_path(&self.base, self.volume));
        self.stream.as_mut().ok_or(ArchiveError::MissingVolume { volume, path })
    }

    fn frame(&mut self, header: &HeaderRecord) -> Result<u64, ArchiveError> {
        let archive_id = self.archive_id;
        let n = write_frame(self.stream()?, archive_id, header)?;
        self.volume_bytes += n;
        self.summary.bytes += n;
        Ok(n)
    }

    fn create_volume(&mut self) -> Result<(), ArchiveError> {
        let path = volume_path(&self.base, self.volume);
        debug!("creating volume {} at {}", self.volume, path.display());
        self.stream = Some(BufWriter::new(File::create(&path)?));
        self.paths.push(path);
        self.volume_bytes = 0;
        self.volume_records = 0;
        self.summary.volumes += 1;
        self.frame(&HeaderRecord::volume_header(self.volume))?;
        Ok(())
    }

    fn close_volume(&mut self, last: bool) -> Result<(), ArchiveError> {
        self.frame(&HeaderRecord::volume_footer(self.volume, last))?;
        if let Some(stream) = self.stream.take() {
            let file = stream.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Roll to the next volume when `len` more bytes would overflow the
    /// current one.  A volume always takes at least one record.
    fn reserve(&mut self, len: u64) -> Result<(), ArchiveError> {
        let Some(limit) = self.options.split_size else {
            return Ok(());
        };
        let footer = HeaderRecord::volume_footer(self.volume, false).frame_len() as u64;
        if self.volume_records > 0 && self.volume_bytes + len + footer > limit {
            self.close_volume(false)?;
            self.volume += 1;
            self.create_volume()?;
        }
        Ok(())
    }

    fn write_record(&mut self, header: &HeaderRecord, payload: &[u8]) -> Result<(), ArchiveError> {
        self.reserve((header.frame_len() + payload.len()) as u64)?;
        self.frame(header)?;
        self.stream()?.write_all(payload)?;
        self.volume_bytes += payload.len() as u64;
        self.summary.bytes += payload.len() as u64;
        self.volume_records += 1;
        Ok(())
    }

    /// Serialise one queue item.
    pub fn write_item(&mut self, item: QueueItem) -> Result<(), ArchiveError> {
        match item {
            QueueItem::Block(block) => {
                self.write_record(&block.header(), &block.data)?;
                self.summary.blocks += 1;
            }
            QueueItem::Header(header)
                if matches!(header.magic, Magic::VOLUME_HEADER | Magic::VOLUME_FOOTER) =>
            {
                debug!("dropping {} header, volumes are framed by the writer", header.magic);
            }
            QueueItem::Header(mut header) => {
                if header.magic == Magic::ARCHIVE_ROOT {
                    header.dico.put_u32(root_keys::ARCHIVE_ID, self.archive_id);
                }
                self.write_record(&header, &[])?;
                self.summary.headers += 1;
            }
        }
        Ok(())
    }

    /// Write the last-volume footer and close the file.
    pub fn finish(&mut self) -> Result<(), ArchiveError> {
        self.close_volume(true)
    }

    /// Close the open volume without a footer.
    fn abandon(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
        }
        self.summary.aborted = true;
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

/// Body of the writer thread.
///
/// On failure the writer asks the reader to stop, closes the queue and
/// discards items until the reader has marked end-of-queue, so no thread is
/// left blocked on a queue nobody consumes.  A queue closed by another thread
/// is not a writer failure: the writer drains, leaves the volume without a
/// last-volume footer and returns `Ok` with the summary marked `aborted`.
pub fn run_writer(ctx: &PipelineContext, writer: &mut ArchiveWriter) -> Result<(), ArchiveError> {
    let _thread = ctx.enter_thread();

    match write_archive(ctx, writer).and_then(|()| writer.finish()) {
        Ok(()) => {
            let s = &writer.summary;
            info!(
                "wrote {} volume(s): {} headers, {} blocks, {} bytes",
                s.volumes, s.headers, s.blocks, s.bytes
            );
            Ok(())
        }
        Err(e) if e.is_queue_closed() => {
            debug!("writer stopped: queue closed");
            drain(ctx);
            writer.abandon();
            Ok(())
        }
        Err(e) => {
            error!("writing volume {} failed: {e}", writer.volume);
            ctx.request_stop_filling();
            ctx.queue.close();
            drain(ctx);
            writer.abandon();
            Err(e)
        }
    }
}

fn drain(ctx: &PipelineContext) {
    let mut discarded = 0usize;
    while !ctx.queue.is_end_of_queue() {
        if ctx.queue.discard_first(DRAIN_STEP) {
            discarded += 1;
        }
    }
    debug!("discarded {discarded} queued item(s)");
}

fn write_archive(ctx: &PipelineContext, writer: &mut ArchiveWriter) -> Result<(), ArchiveError> {
    writer.create_volume()?;
    loop {
        let next = if writer.options.accept_pending {
            ctx.queue.dequeue_pending()
        } else {
            ctx.queue.dequeue_first()
        };
        match next {
            Ok(item) => writer.write_item(item)?,
            Err(QueueError::EndOfQueue) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
