use clap::{Parser, Subcommand};
use fsar::codec::CodecId;
use fsar::crypto::BlockKey;
use fsar::io_stream::{peek_archive, ArchiveReader, ReaderOptions, WriterOptions};
use fsar::pipeline::{verify_archive, Pipeline, PipelineOptions, PipelineReport, Sink};
use fsar::transform::{BlockTransform, CodecTransform};
use fsar::volume::StdinResolver;
use fsar::FsSelection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fsar", about = "Stream, recompress and verify multi-volume filesystem archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy an archive through the pipeline into a new archive
    Copy {
        input:  PathBuf,
        output: PathBuf,
        /// Only keep these filesystem ids (default: all)
        #[arg(long = "fs", value_delimiter = ',')]
        filesystems: Vec<u16>,
        /// Transform worker threads
        #[arg(short, long)]
        workers: Option<usize>,
        /// Recompress blocks: none, zstd, lz4, brotli, lzma
        #[arg(short, long)]
        codec: Option<String>,
        /// Compression level (zstd 1-19; brotli 0-11; ignored for lz4/lzma)
        #[arg(short, long, default_value = "3")]
        level: i32,
        /// Split the output into volumes of at most this many MiB
        #[arg(long)]
        split: Option<u64>,
        /// Password for encrypted input blocks, and for --encrypt
        #[arg(short, long)]
        password: Option<String>,
        /// Encrypt output blocks with AES-256-GCM (Argon2id key derivation)
        #[arg(short, long)]
        encrypt: bool,
        /// Give up after asking this many times for a missing volume
        #[arg(long)]
        max_prompts: Option<u32>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show archive metadata
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Read the whole archive and report corruption
    Verify {
        input: PathBuf,
        /// Also decrypt and decompress every block
        #[arg(short, long)]
        decode: bool,
        #[arg(short, long)]
        password: Option<String>,
        #[arg(long)]
        max_prompts: Option<u32>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {

        // ── Copy ─────────────────────────────────────────────────────────────
        Commands::Copy {
            input, output, filesystems, workers, codec, level, split, password, encrypt,
            max_prompts, json,
        } => {
            if encrypt && password.is_none() {
                return Err("--encrypt needs --password".into());
            }
            let key = derive_key(&input, &password)?;

            let mut options = PipelineOptions::default();
            if !filesystems.is_empty() {
                options.selection = FsSelection::only(filesystems);
            }
            if let Some(n) = workers {
                options.workers = n;
            }

            let mut pipeline = Pipeline::new(options);
            if codec.is_some() || key.is_some() {
                let transform = CodecTransform {
                    codec:   parse_codec(codec.as_deref().unwrap_or("none")),
                    level,
                    decrypt: key.clone(),
                    encrypt: if encrypt { key } else { None },
                };
                pipeline = pipeline.with_transform(Arc::new(transform));
            }

            let sink = Sink::Archive {
                base: output.clone(),
                options: WriterOptions {
                    split_size: split.map(|mib| mib * 1024 * 1024),
                    ..Default::default()
                },
            };
            let report = pipeline.run(open_reader(&input, max_prompts), sink)?;
            print_report(&report, json)?;
            if !report.success {
                return Err("copy failed".into());
            }
            println!("Created: {}", output.display());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let info = peek_archive(&input)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("── fsar archive ─────────────────────────────────────────");
                println!("  Path           {}", input.display());
                println!("  Format version {}", info.format_version);
                println!("  Archive id     {:08x}", info.archive_id);
                println!("  Label          {}", info.label);
                println!("  Created        {}", format_time(info.created));
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, decode, password, max_prompts, json } => {
            let transform: Option<Arc<dyn BlockTransform>> = if decode {
                let mut t = CodecTransform::new(CodecId::None, 0);
                t.decrypt = derive_key(&input, &password)?;
                Some(Arc::new(t))
            } else {
                None
            };
            let reader = open_reader(&input, max_prompts);
            let report = verify_archive(reader, PipelineOptions::default(), transform)?;
            print_report(&report, json)?;
            if !report.success || report.reader.errors > 0 {
                return Err("archive has errors".into());
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_reader(path: &Path, max_prompts: Option<u32>) -> ArchiveReader {
    let options = ReaderOptions { max_prompt_attempts: max_prompts, ..Default::default() };
    ArchiveReader::with_resolver(path, Box::new(StdinResolver), options)
}

fn derive_key(
    input: &Path,
    password: &Option<String>,
) -> Result<Option<BlockKey>, Box<dyn std::error::Error>> {
    Ok(match password {
        Some(pwd) => Some(BlockKey::derive(pwd, &peek_archive(input)?.salt)?),
        None      => None,
    })
}

fn parse_codec(s: &str) -> CodecId {
    CodecId::from_name(s).unwrap_or_else(|| {
        eprintln!("Unknown codec '{}', defaulting to zstd", s);
        CodecId::Zstd
    })
}

fn format_time(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn print_report(report: &PipelineReport, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let r = &report.reader;
    println!("  Volumes read   {}", r.volumes);
    println!("  Headers        {}", r.headers);
    println!(
        "  Blocks         {} ({} skipped, {} corrupt)",
        r.blocks, r.skipped_blocks, r.corrupt_blocks
    );
    println!("  Errors         {}", r.errors);
    if let Some(w) = &report.writer {
        println!("  Volumes out    {} ({} B)", w.volumes, w.bytes);
    }
    for e in report.reader_error.iter().chain(&report.writer_error).chain(&report.worker_errors) {
        println!("  error: {e}");
    }
    Ok(())
}
