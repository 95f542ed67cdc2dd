use fsar::block::BlockRecord;
use fsar::context::{FsSelection, PipelineContext};
use fsar::header::{write_frame, HeaderRecord, Magic};
use fsar::io_stream::{
    run_reader, ArchiveError, ArchiveReader, ReadSummary, ReaderOptions, WriterOptions,
};
use fsar::pipeline::{verify_archive, Pipeline, PipelineOptions, Sink};
use fsar::queue::{QueueError, QueueItem};
use fsar::transform::CodecTransform;
use fsar::volume::{volume_path, NoPromptResolver, VolumeResolver};
use fsar::CodecId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const ARCHIVE_ID: u32 = 0x5EED_0001;

/// Hand-assembled single-volume archive.
struct SourceArchive {
    bytes: Vec<u8>,
}

impl SourceArchive {
    fn new(label: &str) -> Self {
        let mut s = Self { bytes: Vec::new() };
        s.header(&HeaderRecord::volume_header(0));
        s.header(&HeaderRecord::archive_root(ARCHIVE_ID, label));
        s
    }

    fn header(&mut self, h: &HeaderRecord) {
        write_frame(&mut self.bytes, ARCHIVE_ID, h).unwrap();
    }

    /// Returns the offset of the payload inside the file.
    fn block(&mut self, b: &BlockRecord) -> usize {
        self.header(&b.header());
        let at = self.bytes.len();
        self.bytes.extend_from_slice(&b.data);
        at
    }

    fn finish(mut self, path: &Path) {
        self.header(&HeaderRecord::volume_footer(0, true));
        std::fs::write(path, self.bytes).unwrap();
    }
}

fn fs_header(fsid: u16) -> HeaderRecord {
    let mut dico = fsar::dico::Dico::new();
    dico.put_str(1, "ext4");
    HeaderRecord::new(Magic::FILESYSTEM_INFO, fsid, dico)
}

fn quiet_options() -> ReaderOptions {
    ReaderOptions { max_prompt_attempts: None, quiet_wait: Duration::ZERO }
}

/// Run a reader against a consumer that collects every item.
fn read_all(
    path: &Path,
    selection: FsSelection,
    resolver: Box<dyn VolumeResolver>,
    options: ReaderOptions,
) -> (Vec<QueueItem>, ReadSummary, Result<(), ArchiveError>) {
    let ctx = Arc::new(PipelineContext::new(4, selection));
    let mut reader = ArchiveReader::with_resolver(path, resolver, options);
    let producer = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            let result = run_reader(&ctx, &mut reader);
            (reader.summary().clone(), result)
        })
    };

    let mut items = Vec::new();
    loop {
        match ctx.queue.dequeue_pending() {
            Ok(item) => items.push(item),
            Err(QueueError::EndOfQueue) | Err(QueueError::Closed) => break,
            Err(e) => panic!("{e}"),
        }
    }
    let (summary, result) = producer.join().unwrap();
    assert_eq!(ctx.secondary_threads(), 0);
    (items, summary, result)
}

fn read_plain(path: &Path) -> (Vec<QueueItem>, ReadSummary, Result<(), ArchiveError>) {
    read_all(path, FsSelection::all(), Box::new(NoPromptResolver), quiet_options())
}

fn three_block_archive(path: &Path) -> Vec<usize> {
    let mut src = SourceArchive::new("scenario");
    src.header(&fs_header(1));
    let payloads = [
        src.block(&BlockRecord::stored(0, vec![0xA5; 4096], 1)),
        src.block(&BlockRecord::stored(4096, vec![0x5A; 4096], 1)),
        src.block(&BlockRecord::stored(8192, vec![0x3C; 512], 1)),
    ];
    src.finish(path);
    payloads.to_vec()
}

fn block(item: &QueueItem) -> &BlockRecord {
    match item {
        QueueItem::Block(b) => b,
        QueueItem::Header(h) => panic!("expected a block, found {}", h.magic),
    }
}

fn magic(item: &QueueItem) -> Magic {
    match item {
        QueueItem::Header(h) => h.magic,
        QueueItem::Block(_) => Magic::BLOCK,
    }
}

#[test]
fn test_clean_archive_streams_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean.fsa");
    three_block_archive(&path);

    let (items, summary, result) = read_plain(&path);
    result.unwrap();

    let magics: Vec<Magic> = items.iter().map(magic).collect();
    assert_eq!(
        magics,
        vec![Magic::ARCHIVE_ROOT, Magic::FILESYSTEM_INFO, Magic::BLOCK, Magic::BLOCK, Magic::BLOCK]
    );
    let sizes: Vec<usize> = items[2..].iter().map(|i| block(i).data.len()).collect();
    assert_eq!(sizes, vec![4096, 4096, 512]);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.blocks, 3);
    assert!(summary.complete);
}

#[test]
fn test_corrupt_block_is_zero_filled_and_stream_continues() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.fsa");
    let payloads = three_block_archive(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[payloads[1] + 1000] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let (items, summary, result) = read_plain(&path);
    result.unwrap();

    assert_eq!(items.len(), 5);
    let replaced = block(&items[3]);
    assert_eq!(replaced.data.len(), 4096);
    assert!(replaced.data.iter().all(|&b| b == 0));
    assert_eq!(replaced.meta.offset, 4096);

    let last = block(&items[4]);
    assert_eq!(last.data, vec![0x3C; 512]);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.corrupt_blocks, 1);
    assert_eq!(summary.skipped_bytes, 4096);
    assert!(summary.complete);
}

#[test]
fn test_unselected_filesystem_is_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("two-fs.fsa");
    let mut src = SourceArchive::new("two");
    src.header(&fs_header(1));
    src.header(&fs_header(2));
    src.block(&BlockRecord::stored(0, vec![1; 300], 1));
    src.block(&BlockRecord::stored(0, vec![2; 700], 2));
    src.block(&BlockRecord::stored(300, vec![1; 300], 1));
    src.finish(&path);

    let (items, summary, result) =
        read_all(&path, FsSelection::only([1]), Box::new(NoPromptResolver), quiet_options());
    result.unwrap();

    assert_eq!(items.len(), 4);
    assert!(items.iter().skip(1).all(|i| match i {
        QueueItem::Header(h) => h.fsid == 1,
        QueueItem::Block(b) => b.fsid == 1,
    }));
    assert_eq!(summary.skipped_blocks, 1);
    assert_eq!(summary.blocks, 2);
    assert_eq!(summary.errors, 0);
}

#[test]
fn test_malformed_header_is_minor() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("minor.fsa");
    let mut src = SourceArchive::new("minor");
    let before = src.bytes.len();
    src.header(&fs_header(1));
    // Break the dico checksum of the filesystem header.
    let crc_at = src.bytes.len() - 1;
    src.bytes[crc_at] ^= 0xFF;
    assert!(src.bytes.len() > before);
    src.block(&BlockRecord::stored(0, vec![7; 128], 1));
    src.finish(&path);

    let (items, summary, result) = read_plain(&path);
    result.unwrap();
    let magics: Vec<Magic> = items.iter().map(magic).collect();
    assert_eq!(magics, vec![Magic::ARCHIVE_ROOT, Magic::BLOCK]);
    assert_eq!(summary.errors, 1);
}

#[test]
fn test_truncated_archive_still_ends_queue() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("truncated.fsa");
    three_block_archive(&path);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 700]).unwrap();

    let (_items, summary, result) = read_plain(&path);
    assert!(matches!(result, Err(ArchiveError::Header(_)) | Err(ArchiveError::Io(_))));
    assert!(!summary.complete);
}

#[test]
fn test_missing_first_volume_is_fatal() {
    let dir = tempdir().unwrap();
    let (items, _, result) = read_all(
        &dir.path().join("nope.fsa"),
        FsSelection::all(),
        Box::new(NoPromptResolver),
        quiet_options(),
    );
    assert!(items.is_empty());
    assert!(matches!(result, Err(ArchiveError::Io(_))));
}

// ── Pipelines ────────────────────────────────────────────────────────────────

fn text(offset: u64, len: usize) -> Vec<u8> {
    format!("payload at {offset} ").bytes().cycle().take(len).collect()
}

/// Source with `n` compressible 64 KiB blocks for fsid 1.
fn large_archive(path: &Path, n: u64) -> Vec<Vec<u8>> {
    let mut src = SourceArchive::new("large");
    src.header(&fs_header(1));
    let mut payloads = Vec::new();
    for i in 0..n {
        let data = text(i * 65536, 65536);
        src.block(&BlockRecord::stored(i * 65536, data.clone(), 1));
        payloads.push(data);
    }
    src.finish(path);
    payloads
}

fn decoded_blocks(path: &Path) -> Vec<Vec<u8>> {
    let (items, summary, result) = read_plain(path);
    result.unwrap();
    assert_eq!(summary.errors, 0);
    let restore = CodecTransform::new(CodecId::None, 0);
    items
        .into_iter()
        .filter_map(|i| match i {
            QueueItem::Block(b) => {
                Some(fsar::BlockTransform::transform(&restore, b).unwrap().data)
            }
            QueueItem::Header(_) => None,
        })
        .collect()
}

fn copy(
    src: &Path,
    dst: &Path,
    workers: usize,
    codec: CodecId,
    split: Option<u64>,
) -> fsar::PipelineReport {
    let options = PipelineOptions { workers, queue_capacity: 8, ..Default::default() };
    let reader = ArchiveReader::with_resolver(src, Box::new(NoPromptResolver), quiet_options());
    let sink = Sink::Archive {
        base: dst.to_path_buf(),
        options: WriterOptions { split_size: split, ..Default::default() },
    };
    Pipeline::new(options)
        .with_transform(Arc::new(CodecTransform::new(codec, 3)))
        .run(reader, sink)
        .unwrap()
}

#[test]
fn test_copy_recompresses_in_order() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    let dst = dir.path().join("dst.fsa");
    let payloads = large_archive(&src, 24);

    let report = copy(&src, &dst, 4, CodecId::Zstd, None);
    assert!(report.success, "{report:?}");
    assert_eq!(report.blocks_transformed, 24);
    assert!(std::fs::metadata(&dst).unwrap().len() < std::fs::metadata(&src).unwrap().len());

    assert_eq!(decoded_blocks(&dst), payloads);
}

#[test]
fn test_transform_runs_without_configured_workers() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    let dst = dir.path().join("dst.fsa");
    let payloads = large_archive(&src, 4);

    let report = copy(&src, &dst, 0, CodecId::Zstd, None);
    assert!(report.success, "{report:?}");
    assert_eq!(report.blocks_transformed, 4);
    assert!(std::fs::metadata(&dst).unwrap().len() < std::fs::metadata(&src).unwrap().len());

    let (items, _, result) = read_plain(&dst);
    result.unwrap();
    let tags: Vec<u16> = items
        .iter()
        .filter_map(|i| match i {
            QueueItem::Block(b) => Some(b.meta.compress_algo),
            QueueItem::Header(_) => None,
        })
        .collect();
    assert_eq!(tags, vec![CodecId::Zstd.tag(); 4]);
    assert_eq!(decoded_blocks(&dst), payloads);
}

#[test]
fn test_copy_writes_scenario_in_order() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    let dst = dir.path().join("dst.fsa");
    three_block_archive(&src);

    let report = copy(&src, &dst, 1, CodecId::None, None);
    assert!(report.success, "{report:?}");
    assert!(!report.writer.as_ref().unwrap().aborted);

    let (items, summary, result) = read_plain(&dst);
    result.unwrap();
    assert!(summary.complete);
    let magics: Vec<Magic> = items.iter().map(magic).collect();
    assert_eq!(
        magics,
        vec![Magic::ARCHIVE_ROOT, Magic::FILESYSTEM_INFO, Magic::BLOCK, Magic::BLOCK, Magic::BLOCK]
    );
    let data: Vec<Vec<u8>> = items[2..].iter().map(|i| block(i).data.clone()).collect();
    assert_eq!(data, vec![vec![0xA5u8; 4096], vec![0x5A; 4096], vec![0x3C; 512]]);
}

#[test]
fn test_truncated_source_is_a_reader_failure_only() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    three_block_archive(&src);
    let bytes = std::fs::read(&src).unwrap();
    std::fs::write(&src, &bytes[..bytes.len() - 700]).unwrap();

    let report = copy(&src, &dir.path().join("dst.fsa"), 1, CodecId::Zstd, None);
    assert!(!report.success);
    assert!(report.reader_error.is_some());
    assert!(report.writer_error.is_none(), "{report:?}");
    assert!(report.writer.as_ref().unwrap().aborted);

    let reader = ArchiveReader::with_resolver(&src, Box::new(NoPromptResolver), quiet_options());
    let report = verify_archive(reader, PipelineOptions::default(), None).unwrap();
    assert!(!report.success);
    assert!(report.reader_error.is_some());
    assert!(report.writer_error.is_none(), "{report:?}");
}

#[test]
fn test_multi_volume_round_trip() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    let dst = dir.path().join("split.fsa");
    let payloads = large_archive(&src, 10);

    let report = copy(&src, &dst, 2, CodecId::None, Some(200 * 1024));
    assert!(report.success, "{report:?}");
    let volumes = report.writer.as_ref().unwrap().volumes;
    assert!(volumes >= 3);
    assert!(volume_path(&dst, volumes - 1).exists());

    assert_eq!(decoded_blocks(&dst), payloads);
}

#[test]
fn test_missing_volume_asks_resolver() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    let dst = dir.path().join("split.fsa");
    let payloads = large_archive(&src, 6);
    assert!(copy(&src, &dst, 1, CodecId::None, Some(150 * 1024)).success);

    let moved: PathBuf = dir.path().join("elsewhere.bin");
    std::fs::rename(volume_path(&dst, 1), &moved).unwrap();

    // No resolver answer: fatal, but consumers are released.
    let (_, _, result) = read_plain(&dst);
    assert!(matches!(result, Err(ArchiveError::MissingVolume { volume: 1, .. })));

    // A bounded number of wrong answers.
    let mut asked = 0;
    let wrong = move |_: &Path, _: u32| {
        asked += 1;
        assert!(asked <= 2);
        Some(PathBuf::from("/definitely/not/here"))
    };
    let options = ReaderOptions { max_prompt_attempts: Some(2), quiet_wait: Duration::ZERO };
    let (_, _, result) = read_all(&dst, FsSelection::all(), Box::new(wrong), options);
    assert!(matches!(result, Err(ArchiveError::MissingVolume { volume: 1, .. })));

    // The right answer.
    let answer = moved.clone();
    let right = move |expected: &Path, volume: u32| {
        assert_eq!(volume, 1);
        assert!(expected.to_string_lossy().ends_with(".f01"));
        Some(answer.clone())
    };
    let (items, summary, result) =
        read_all(&dst, FsSelection::all(), Box::new(right), quiet_options());
    result.unwrap();
    assert!(summary.complete);
    let blocks = items.iter().filter(|i| matches!(i, QueueItem::Block(_))).count();
    assert_eq!(blocks, payloads.len());
}

#[test]
fn test_writer_failure_stops_reader() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.fsa");
    large_archive(&src, 40);

    let out = dir.path().join("no/such/dir/out.fsa");
    let report = copy(&src, &out, 2, CodecId::Lz4, None);
    assert!(!report.success);
    assert!(report.writer_error.is_some());
    assert!(report.reader_error.is_none());
    assert!(report.reader.interrupted);
    assert!(!report.reader.complete);
}

#[test]
fn test_verify_reports_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("verify.fsa");
    let payloads = three_block_archive(&path);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[payloads[0] + 10] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();

    let reader = ArchiveReader::with_resolver(&path, Box::new(NoPromptResolver), quiet_options());
    let options = PipelineOptions { workers: 0, ..Default::default() };
    let report = verify_archive(reader, options, None).unwrap();
    assert!(report.success);
    assert_eq!(report.reader.corrupt_blocks, 1);
    assert_eq!(report.items_discarded, 5);
}

#[test]
fn test_peek_archive() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("peek.fsa");
    three_block_archive(&path);
    let info = fsar::io_stream::peek_archive(&path).unwrap();
    assert_eq!(info.archive_id, ARCHIVE_ID);
    assert_eq!(info.label, "scenario");
    assert_eq!(info.salt.len(), 16);
}
