//! State shared by every thread of one pipeline run.
//!
//! Nothing here is process-global: each pipeline builds its own context and
//! hands it to its threads behind an `Arc`, so several pipelines can run side
//! by side (and tests stay deterministic).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::header::FSID_GLOBAL;
use crate::queue::WorkQueue;

/// Which filesystems of the archive are wanted.  Fixed before the pipeline
/// starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsSelection {
    /// `None` selects every filesystem.
    wanted: Option<BTreeSet<u16>>,
}

impl FsSelection {
    pub fn all() -> Self {
        Self { wanted: None }
    }

    pub fn only<I: IntoIterator<Item = u16>>(ids: I) -> Self {
        Self { wanted: Some(ids.into_iter().collect()) }
    }

    /// Archive-global headers are always wanted.
    pub fn is_selected(&self, fsid: u16) -> bool {
        if fsid == FSID_GLOBAL {
            return true;
        }
        self.wanted.as_ref().map_or(true, |set| set.contains(&fsid))
    }
}

pub struct PipelineContext {
    pub queue: WorkQueue,
    selection: FsSelection,
    stop_filling: AtomicBool,
    secondary_threads: AtomicUsize,
}

impl PipelineContext {
    pub fn new(queue_capacity: usize, selection: FsSelection) -> Self {
        Self {
            queue: WorkQueue::new(queue_capacity),
            selection,
            stop_filling: AtomicBool::new(false),
            secondary_threads: AtomicUsize::new(0),
        }
    }

    pub fn selection(&self) -> &FsSelection {
        &self.selection
    }

    pub fn is_selected(&self, fsid: u16) -> bool {
        self.selection.is_selected(fsid)
    }

    /// Ask the reader to stop producing.  One way: never cleared.
    pub fn request_stop_filling(&self) {
        self.stop_filling.store(true, Ordering::Release);
    }

    pub fn stop_filling_requested(&self) -> bool {
        self.stop_filling.load(Ordering::Acquire)
    }

    /// Number of reader, writer and worker threads currently running.
    pub fn secondary_threads(&self) -> usize {
        self.secondary_threads.load(Ordering::Acquire)
    }

    /// Count the calling thread as running until the guard drops.
    pub fn enter_thread(&self) -> ThreadGuard<'_> {
        self.secondary_threads.fetch_add(1, Ordering::AcqRel);
        ThreadGuard { ctx: self }
    }
}

pub struct ThreadGuard<'a> {
    ctx: &'a PipelineContext,
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        self.ctx.secondary_threads.fetch_sub(1, Ordering::AcqRel);
    }
}
