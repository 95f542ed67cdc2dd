//! Wires one reader, N transform workers and one consumer around a shared
//! [`PipelineContext`] and runs them on named threads.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};
use scopeguard::{OnUnwind, ScopeGuard};
use serde::Serialize;

use crate::context::{FsSelection, PipelineContext};
use crate::io_stream::{
    run_reader, run_writer, ArchiveError, ArchiveReader, ArchiveWriter, ReadSummary, WriteSummary,
    WriterOptions,
};
use crate::queue::{QueueError, DEFAULT_QUEUE_CAPACITY};
use crate::transform::{run_worker, BlockTransform};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    /// Transform worker threads.  Ignored when the pipeline has no transform,
    /// raised to one when it has.
    pub workers:        usize,
    pub selection:      FsSelection,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers:        thread::available_parallelism().map_or(1, |n| n.get().min(8)),
            selection:      FsSelection::all(),
        }
    }
}

/// Where the queue drains to.
pub enum Sink {
    Archive { base: PathBuf, options: WriterOptions },
    /// Dequeue and drop everything.  Used to verify an archive.
    Discard,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub reader:             ReadSummary,
    pub writer:             Option<WriteSummary>,
    pub reader_error:       Option<String>,
    pub writer_error:       Option<String>,
    pub worker_errors:      Vec<String>,
    pub blocks_transformed: u64,
    pub items_discarded:    u64,
    pub success:            bool,
}

pub struct Pipeline {
    options:   PipelineOptions,
    transform: Option<Arc<dyn BlockTransform>>,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options, transform: None }
    }

    pub fn with_transform(mut self, transform: Arc<dyn BlockTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// A pipeline with a transform always runs at least one worker, so the
    /// transform is never bypassed.
    fn worker_count(&self) -> usize {
        match self.transform {
            Some(_) => self.options.workers.max(1),
            None => 0,
        }
    }

    /// Run to completion.  Only a failure to start a thread is returned as
    /// an error; everything else lands in the report.
    pub fn run(
        self,
        mut reader: ArchiveReader,
        sink: Sink,
    ) -> Result<PipelineReport, ArchiveError> {
        let selection = self.options.selection.clone();
        let ctx = Arc::new(PipelineContext::new(self.options.queue_capacity, selection));
        let workers = self.worker_count();
        info!("starting pipeline with {workers} transform worker(s)");

        let mut spawned = Spawned::default();
        let started = (|| -> io::Result<()> {
            let c = Arc::clone(&ctx);
            spawned.reader = Some(spawn("fsar-reader", move || {
                let result = run_reader(&c, &mut reader);
                (reader.summary().clone(), result)
            })?);

            if let Some(transform) = &self.transform {
                for i in 0..workers {
                    let c = Arc::clone(&ctx);
                    let t = Arc::clone(transform);
                    spawned.workers.push(spawn(&format!("fsar-worker-{i}"), move || {
                        let _abort = abort_on_unwind(&c);
                        run_worker(&c, t.as_ref()).map_err(|e| e.to_string())
                    })?);
                }
            }

            let c = Arc::clone(&ctx);
            spawned.consumer = Some(spawn("fsar-writer", move || {
                let _abort = abort_on_unwind(&c);
                match sink {
                    Sink::Archive { base, mut options } => {
                        options.accept_pending = workers == 0;
                        let mut writer = ArchiveWriter::new(base, options);
                        let result = run_writer(&c, &mut writer);
                        Consumed { writer: Some(writer.summary().clone()), discarded: 0, result }
                    }
                    Sink::Discard => {
                        let (discarded, result) = run_discard(&c, workers == 0);
                        Consumed { writer: None, discarded, result }
                    }
                }
            })?);
            Ok(())
        })();

        if let Err(e) = started {
            error!("could not start pipeline thread: {e}");
            ctx.request_stop_filling();
            ctx.queue.close();
            ctx.queue.drain_and_discard();
            spawned.join();
            return Err(e.into());
        }

        let report = spawned.join();
        debug!("pipeline finished, {} thread(s) still registered", ctx.secondary_threads());
        Ok(report)
    }
}

/// Stream `reader` through a discarding consumer.
pub fn verify_archive(
    reader:    ArchiveReader,
    options:   PipelineOptions,
    transform: Option<Arc<dyn BlockTransform>>,
) -> Result<PipelineReport, ArchiveError> {
    let mut pipeline = Pipeline::new(options);
    pipeline.transform = transform;
    pipeline.run(reader, Sink::Discard)
}

// ── Threads ──────────────────────────────────────────────────────────────────

struct Consumed {
    writer:    Option<WriteSummary>,
    discarded: u64,
    result:    Result<(), ArchiveError>,
}

#[derive(Default)]
struct Spawned {
    reader:   Option<JoinHandle<(ReadSummary, Result<(), ArchiveError>)>>,
    workers:  Vec<JoinHandle<Result<u64, String>>>,
    consumer: Option<JoinHandle<Consumed>>,
}

impl Spawned {
    fn join(self) -> PipelineReport {
        let mut report = PipelineReport::default();

        if let Some(handle) = self.reader {
            match handle.join() {
                Ok((summary, result)) => {
                    report.reader = summary;
                    report.reader_error = result.err().map(|e| e.to_string());
                }
                Err(_) => report.reader_error = Some("reader thread panicked".into()),
            }
        }
        for handle in self.workers {
            match handle.join() {
                Ok(Ok(n)) => report.blocks_transformed += n,
                Ok(Err(e)) => report.worker_errors.push(e),
                Err(_) => report.worker_errors.push("worker thread panicked".into()),
            }
        }

        if let Some(handle) = self.consumer {
            match handle.join() {
                Ok(consumed) => {
                    report.writer = consumed.writer;
                    report.items_discarded = consumed.discarded;
                    report.writer_error = consumed.result.err().map(|e| e.to_string());
                }
                Err(_) => report.writer_error = Some("writer thread panicked".into()),
            }
        }

        report.success = report.reader_error.is_none()
            && report.writer_error.is_none()
            && report.worker_errors.is_empty();
        report
    }
}

fn spawn<T, F>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new().name(name.to_owned()).spawn(f)
}

/// Unblock every other thread if the current one panics.
fn abort_on_unwind(ctx: &PipelineContext) -> ScopeGuard<(), impl FnOnce(()) + '_, OnUnwind> {
    scopeguard::guard_on_unwind((), move |_| {
        ctx.request_stop_filling();
        ctx.queue.close();
    })
}

/// Consumer that drops every item.  Returns how many it took.
fn run_discard(ctx: &PipelineContext, accept_pending: bool) -> (u64, Result<(), ArchiveError>) {
    let _thread = ctx.enter_thread();
    let mut taken = 0u64;
    loop {
        let next = if accept_pending {
            ctx.queue.dequeue_pending()
        } else {
            ctx.queue.dequeue_first()
        };
        match next {
            Ok(_) => taken += 1,
            Err(QueueError::EndOfQueue) => return (taken, Ok(())),
            Err(QueueError::Closed) => {
                debug!("discarding consumer stopped: queue closed");
                drain_to_end_of_queue(ctx);
                return (taken, Ok(()));
            }
            Err(e) => {
                error!("discarding consumer failed: {e}");
                ctx.request_stop_filling();
                ctx.queue.close();
                drain_to_end_of_queue(ctx);
                return (taken, Err(e.into()));
            }
        }
    }
}

fn drain_to_end_of_queue(ctx: &PipelineContext) {
    while !ctx.queue.is_end_of_queue() {
        ctx.queue.discard_first(Duration::from_millis(100));
    }
}
