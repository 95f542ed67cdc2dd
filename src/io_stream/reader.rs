use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use super::ArchiveError;
use crate::block::{BlockMeta, BlockRecord, BlockStatus};
use crate::checksum::fletcher32;
use crate::context::PipelineContext;
use crate::header::{read_frame, root_keys, volume_keys, HeaderRecord, Magic, FORMAT_VERSION};
use crate::queue::WorkQueue;
use crate::volume::{volume_path, StdinResolver, VolumeResolver};

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// How many times the resolver may be asked for one missing volume.
    /// `None` keeps asking until it gives up.
    pub max_prompt_attempts: Option<u32>,
    /// Longest wait for the queue to empty before prompting, so the prompt
    /// is not buried under output from the other threads.
    pub quiet_wait: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_prompt_attempts: None,
            quiet_wait: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadSummary {
    /// Minor header errors plus corrupted blocks.
    pub errors: u64,
    pub headers: u64,
    pub blocks: u64,
    pub skipped_blocks: u64,
    pub corrupt_blocks: u64,
    /// Bytes passed over while resynchronising on the next header.
    pub skipped_bytes: u64,
    pub volumes: u32,
    /// The last-volume footer was reached.
    pub complete: bool,
    /// Reading stopped early on request or because the queue was closed.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Skipped,
    ChecksumOk,
    ChecksumFailed,
}

/// Read the payload following a start-of-block header and hand it to the
/// queue.
///
/// - `skip`: the stream is moved past the payload, nothing is allocated.
/// - checksum match: the block is queued `TODO` for the transform workers.
/// - checksum mismatch: a zero-filled block of the real size is queued
///   `DONE` in its place and the stream is moved back to the start of the
///   payload, so the caller can search forward for the next valid header.
pub fn read_and_copy_block<R: Read + Seek>(
    stream: &mut R,
    header: &HeaderRecord,
    skip: bool,
    queue: &WorkQueue,
) -> Result<BlockOutcome, ArchiveError> {
    let meta = BlockMeta::from_dico(&header.dico)?;

    if skip {
        stream.seek(SeekFrom::Current(meta.archive_size as i64))?;
        return Ok(BlockOutcome::Skipped);
    }

    let mut data = vec![0u8; meta.archive_size as usize];
    stream.read_exact(&mut data)?;

    let computed = fletcher32(&data);
    if computed == meta.checksum {
        queue.enqueue_block(BlockRecord::new(data, meta, header.fsid), BlockStatus::Todo)?;
        return Ok(BlockOutcome::ChecksumOk);
    }

    warn!(
        "block at offset {} is corrupt (checksum {:#010x}, expected {:#010x}), \
         replaced by {} zero bytes",
        meta.offset, computed, meta.checksum, meta.real_size
    );
    drop(data);
    queue.enqueue_block(BlockRecord::zero_filled(&meta, header.fsid), BlockStatus::Done)?;
    stream.seek(SeekFrom::Current(-(meta.archive_size as i64)))?;
    Ok(BlockOutcome::ChecksumFailed)
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct ArchiveReader {
    base:       PathBuf,
    volume:     u32,
    stream:     Option<BufReader<File>>,
    archive_id: Option<u32>,
    resolver:   Box<dyn VolumeResolver>,
    options:    ReaderOptions,
    summary:    ReadSummary,
}

impl ArchiveReader {
    /// Reader prompting on the terminal for missing volumes.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self::with_resolver(base, Box::new(StdinResolver), ReaderOptions::default())
    }

    pub fn with_resolver(
        base:     impl Into<PathBuf>,
        resolver: Box<dyn VolumeResolver>,
        options:  ReaderOptions,
    ) -> Self {
        Self {
            base: base.into(),
            volume: 0,
            stream: None,
            archive_id: None,
            resolver,
            options,
            summary: ReadSummary::default(),
        }
    }

    pub fn summary(&self) -> &ReadSummary {
        &self.summary
    }

    pub fn archive_id(&self) -> Option<u32> {
        self.archive_id
    }

    fn stream(&mut self) -> Result<&mut BufReader<File>, ArchiveError> {
        let (volume, path) = (self.volume, volume_path(&self.base, self.volume));
        self.stream.as_mut().ok_or(ArchiveError::MissingVolume { volume, path })
    }

    /// Open `path` as volume `self.volume` and check its volume header.
    fn open_volume(&mut self, path: &Path) -> Result<(), ArchiveError> {
        debug!("opening volume {} at {}", self.volume, path.display());
        let mut stream = BufReader::new(File::open(path)?);
        let frame = read_frame(&mut stream, None, false)?;

        expect_magic(&frame.header, Magic::VOLUME_HEADER)?;
        let number = frame.header.dico.get_u32(volume_keys::VOLUME_NUMBER)?;
        if number != self.volume {
            return Err(ArchiveError::WrongVolume { expected: self.volume, found: number });
        }
        let version = frame.header.dico.get_u32(volume_keys::FORMAT_VERSION)?;
        if version > FORMAT_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        match self.archive_id {
            Some(expected) if expected != frame.archive_id => {
                return Err(ArchiveError::ForeignVolume { expected, found: frame.archive_id });
            }
            Some(_) => {}
            None => self.archive_id = Some(frame.archive_id),
        }

        self.stream = Some(stream);
        self.summary.volumes += 1;
        Ok(())
    }

    /// Read the archive-root header that follows the first volume header.
    fn read_root(&mut self) -> Result<HeaderRecord, ArchiveError> {
        let archive_id = self.archive_id;
        let frame = read_frame(self.stream()?, archive_id, false)?;
        expect_magic(&frame.header, Magic::ARCHIVE_ROOT)?;
        let declared = frame.header.dico.get_u32(root_keys::ARCHIVE_ID)?;
        if declared != frame.archive_id {
            return Err(ArchiveError::ForeignVolume { expected: frame.archive_id, found: declared });
        }
        Ok(frame.header)
    }

    /// Close the current volume and open the next one, asking the resolver
    /// while the expected file does not exist.
    fn next_volume(&mut self, ctx: &PipelineContext) -> Result<(), ArchiveError> {
        self.stream = None;
        self.volume += 1;

        let expected = volume_path(&self.base, self.volume);
        let mut path = expected.clone();
        let mut attempts = 0u32;
        while !path.exists() {
            if self.options.max_prompt_attempts.is_some_and(|max| attempts >= max) {
                return Err(ArchiveError::MissingVolume { volume: self.volume, path: expected });
            }
            attempts += 1;
            wait_for_quiet(ctx, self.options.quiet_wait);
            match self.resolver.resolve(&expected, self.volume) {
                Some(p) => path = p,
                None => {
                    return Err(ArchiveError::MissingVolume { volume: self.volume, path: expected })
                }
            }
        }
        self.open_volume(&path)
    }
}

fn wait_for_quiet(ctx: &PipelineContext, limit: Duration) {
    let start = Instant::now();
    while ctx.queue.count() > 0 && start.elapsed() < limit {
        thread::sleep(Duration::from_millis(50));
    }
}

/// Body of the reader thread.
///
/// End-of-queue is marked on every way out of this function, so consumers
/// never wait on a reader that is gone.  A fatal error also closes the queue.
pub fn run_reader(ctx: &PipelineContext, reader: &mut ArchiveReader) -> Result<(), ArchiveError> {
    let _thread = ctx.enter_thread();
    let _end_of_queue = scopeguard::guard((), |_| ctx.queue.mark_end_of_queue(true));

    match stream_archive(ctx, reader) {
        Err(e) if e.is_queue_closed() => {
            debug!("reader stopped: queue closed");
            reader.summary.interrupted = true;
            Ok(())
        }
        Err(e) => {
            error!("reading volume {} failed: {e}", reader.volume);
            // Consumers must not take a truncated stream for a complete one.
            ctx.queue.close();
            Err(e)
        }
        Ok(()) => {
            let s = &reader.summary;
            info!(
                "read {} volume(s): {} headers, {} blocks, {} skipped, {} corrupt, {} errors",
                s.volumes, s.headers, s.blocks, s.skipped_blocks, s.corrupt_blocks, s.errors
            );
            Ok(())
        }
    }
}

fn stream_archive(ctx: &PipelineContext, reader: &mut ArchiveReader) -> Result<(), ArchiveError> {
    let first = volume_path(&reader.base, 0);
    reader.open_volume(&first)?;

    let root = reader.read_root()?;
    ctx.queue.enqueue_header(root)?;
    reader.summary.headers += 1;

    let archive_id = reader.archive_id;
    loop {
        if ctx.stop_filling_requested() {
            debug!("reader stopped on request");
            reader.summary.interrupted = true;
            return Ok(());
        }

        let frame = match read_frame(reader.stream()?, archive_id, true) {
            Ok(frame) => frame,
            Err(e) if e.is_minor() => {
                warn!("skipping malformed header: {e}");
                reader.summary.errors += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        reader.summary.skipped_bytes += frame.skipped;
        let header = frame.header;

        match header.magic {
            Magic::VOLUME_FOOTER => {
                if header.dico.get_bool(volume_keys::LAST_VOLUME)? {
                    reader.stream = None;
                    reader.summary.complete = true;
                    return Ok(());
                }
                reader.next_volume(ctx)?;
            }
            Magic::BLOCK => {
                let skip = !ctx.is_selected(header.fsid);
                match read_and_copy_block(reader.stream()?, &header, skip, &ctx.queue)? {
                    BlockOutcome::Skipped => reader.summary.skipped_blocks += 1,
                    BlockOutcome::ChecksumOk => reader.summary.blocks += 1,
                    BlockOutcome::ChecksumFailed => {
                        reader.summary.blocks += 1;
                        reader.summary.corrupt_blocks += 1;
                        reader.summary.errors += 1;
                    }
                }
            }
            Magic::VOLUME_HEADER => {
                warn!("unexpected volume header inside volume {}", reader.volume);
                reader.summary.errors += 1;
            }
            _ if header.is_global() || ctx.is_selected(header.fsid) => {
                ctx.queue.enqueue_header(header)?;
                reader.summary.headers += 1;
            }
            _ => {}
        }
    }
}

// ── Archive metadata ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub archive_id:     u32,
    pub format_version: u32,
    pub label:          String,
    pub created:        u64,
    #[serde(skip)]
    pub salt:           Vec<u8>,
}

/// Read the first volume header and the archive-root header of `path`
/// without starting a pipeline.
pub fn peek_archive(path: &Path) -> Result<ArchiveInfo, ArchiveError> {
    let mut stream = BufReader::new(File::open(path)?);
    let volume = read_frame(&mut stream, None, false)?;
    expect_magic(&volume.header, Magic::VOLUME_HEADER)?;
    let format_version = volume.header.dico.get_u32(volume_keys::FORMAT_VERSION)?;

    let root = read_frame(&mut stream, Some(volume.archive_id), false)?;
    expect_magic(&root.header, Magic::ARCHIVE_ROOT)?;
    let dico = &root.header.dico;
    Ok(ArchiveInfo {
        archive_id: dico.get_u32(root_keys::ARCHIVE_ID)?,
        format_version,
        label: dico.get_str(root_keys::LABEL)?.to_owned(),
        created: dico.get_u64(root_keys::CREATED)?,
        salt: dico.get_bytes(root_keys::SALT)?.to_vec(),
    })
}

fn expect_magic(header: &HeaderRecord, expected: Magic) -> Result<(), ArchiveError> {
    if header.magic != expected {
        return Err(ArchiveError::UnexpectedHeader { expected, found: header.magic });
    }
    Ok(())
}
