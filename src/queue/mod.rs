//! Bounded, ordered work queue shared by the reader, the transform workers
//! and the writer.
//!
//! # Ordering
//! Items live in slots kept in enqueue order.  Workers transform blocks in
//! place: [`WorkQueue::claim_todo`] takes the payload out of its slot and
//! [`WorkQueue::complete`] puts the result back into the same slot.  The
//! consumer only ever removes the head slot, and only once it is `DONE`, so
//! the order seen by the writer is the order the reader produced, whatever
//! the number of workers and however they interleave.
//!
//! # Termination
//! - `end_of_queue` is set by the producer once nothing more will arrive.
//!   Consumers that find the queue empty with the flag set get
//!   [`QueueError::EndOfQueue`] instead of blocking.
//! - `closed` is set by a consumer (or a failing worker) that refuses further
//!   input.  Producers get [`QueueError::Closed`].
//!
//! Every state change wakes all waiters, so a thread that re-checks a flag
//! after it was posted always observes it.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::block::{BlockRecord, BlockStatus};
use crate::header::HeaderRecord;

/// Default number of slots.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("end of queue")]
    EndOfQueue,
    #[error("queue fault: {0}")]
    Internal(&'static str),
}

#[derive(Debug)]
pub enum QueueItem {
    Header(HeaderRecord),
    Block(BlockRecord),
}

impl QueueItem {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueItem::Header(_) => "header",
            QueueItem::Block(_) => "block",
        }
    }
}

/// Identifies the slot of a block claimed by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Todo,
    Processing,
    Done,
}

struct Slot {
    ticket: u64,
    state: SlotState,
    item: Option<QueueItem>,
}

#[derive(Default)]
struct QueueState {
    slots: VecDeque<Slot>,
    next_ticket: u64,
    end_of_queue: bool,
    closed: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    capacity: usize,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ── Producer side ────────────────────────────────────────────────────────

    /// Headers never need a transform and are queued as `DONE`.
    pub fn enqueue_header(&self, header: HeaderRecord) -> Result<u64, QueueError> {
        self.push(QueueItem::Header(header), SlotState::Done)
    }

    pub fn enqueue_block(
        &self,
        block: BlockRecord,
        status: BlockStatus,
    ) -> Result<u64, QueueError> {
        let state = match status {
            BlockStatus::Todo => SlotState::Todo,
            BlockStatus::Done => SlotState::Done,
        };
        self.push(QueueItem::Block(block), state)
    }

    fn push(&self, item: QueueItem, state: SlotState) -> Result<u64, QueueError> {
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return Err(QueueError::Closed);
            }
            if st.end_of_queue {
                return Err(QueueError::EndOfQueue);
            }
            if st.slots.len() < self.capacity {
                break;
            }
            self.changed.wait(&mut st);
        }
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.slots.push_back(Slot { ticket, state, item: Some(item) });
        self.changed.notify_all();
        Ok(ticket)
    }

    // ── Worker side ──────────────────────────────────────────────────────────

    /// Take the oldest `TODO` block out of its slot.
    ///
    /// Returns `None` once the queue is closed, or once end-of-queue is set
    /// and no `TODO` block remains.
    pub fn claim_todo(&self) -> Option<(Ticket, BlockRecord)> {
        let mut st = self.state.lock();
        loop {
            if st.closed {
                return None;
            }
            if let Some(slot) = st.slots.iter_mut().find(|s| s.state == SlotState::Todo) {
                match slot.item.take() {
                    Some(QueueItem::Block(block)) => {
                        slot.state = SlotState::Processing;
                        return Some((Ticket(slot.ticket), block));
                    }
                    other => {
                        // Only blocks are ever queued as TODO.
                        slot.item = other;
                        slot.state = SlotState::Done;
                        self.changed.notify_all();
                        continue;
                    }
                }
            }
            if st.end_of_queue {
                return None;
            }
            self.changed.wait(&mut st);
        }
    }

    /// Return a transformed block to its slot as `DONE`.
    ///
    /// If the slot was discarded meanwhile (abort in progress) the block is
    /// released here and `false` is returned.
    pub fn complete(&self, ticket: Ticket, block: BlockRecord) -> bool {
        let mut st = self.state.lock();
        match st.slots.iter_mut().find(|s| s.ticket == ticket.0) {
            Some(slot) => {
                slot.item = Some(QueueItem::Block(block));
                slot.state = SlotState::Done;
                self.changed.notify_all();
                true
            }
            None => {
                debug!("slot {} was discarded before its block completed", ticket.0);
                false
            }
        }
    }

    // ── Consumer side ────────────────────────────────────────────────────────

    /// Remove the head item once it is `DONE`.
    pub fn dequeue_first(&self) -> Result<QueueItem, QueueError> {
        self.dequeue(false)
    }

    /// Remove the head item once it is `DONE` or still `TODO`.  For consumers
    /// running without transform workers.
    pub fn dequeue_pending(&self) -> Result<QueueItem, QueueError> {
        self.dequeue(true)
    }

    fn dequeue(&self, accept_todo: bool) -> Result<QueueItem, QueueError> {
        let mut st = self.state.lock();
        loop {
            // Closing wins over ready items and over end-of-queue.
            if st.closed {
                return Err(QueueError::Closed);
            }
            match st.slots.front().map(|s| s.state) {
                Some(SlotState::Done) => break,
                Some(SlotState::Todo) if accept_todo => break,
                Some(_) => {}
                None if st.end_of_queue => return Err(QueueError::EndOfQueue),
                None => {}
            }
            self.changed.wait(&mut st);
        }
        let slot = st.slots.pop_front().ok_or(QueueError::Internal("head slot vanished"))?;
        self.changed.notify_all();
        slot.item.ok_or(QueueError::Internal("ready slot holds no item"))
    }

    /// Refuse further input.  Producers and workers unblock.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ── Termination ──────────────────────────────────────────────────────────

    pub fn mark_end_of_queue(&self, flag: bool) {
        let mut st = self.state.lock();
        st.end_of_queue = flag;
        self.changed.notify_all();
    }

    /// True once the producer is done and every item has left the queue.
    pub fn is_end_of_queue(&self) -> bool {
        let st = self.state.lock();
        st.end_of_queue && st.slots.is_empty()
    }

    /// Drop the head item whatever its state, waiting at most `wait` for one
    /// to show up.  Returns whether an item was discarded.
    pub fn discard_first(&self, wait: Duration) -> bool {
        let mut st = self.state.lock();
        if st.slots.is_empty() && !st.end_of_queue {
            self.changed.wait_for(&mut st, wait);
        }
        match st.slots.pop_front() {
            Some(slot) => {
                drop(slot);
                self.changed.notify_all();
                true
            }
            None => false,
        }
    }

    /// Drop every queued item.  Returns how many were discarded.
    pub fn drain_and_discard(&self) -> usize {
        let mut st = self.state.lock();
        let n = st.slots.len();
        st.slots.clear();
        self.changed.notify_all();
        n
    }

    /// Approximate depth.  Only meant for pacing user output.
    pub fn count(&self) -> usize {
        self.state.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dico::Dico;
    use crate::header::Magic;
    use std::sync::Arc;
    use std::thread;

    fn header(n: u32) -> HeaderRecord {
        let mut dico = Dico::new();
        dico.put_u32(1, n);
        HeaderRecord::new(Magic::OBJECT, 1, dico)
    }

    fn block(offset: u64) -> BlockRecord {
        BlockRecord::stored(offset, vec![offset as u8; 16], 1)
    }

    fn describe(item: QueueItem) -> String {
        match item {
            QueueItem::Header(h) => format!("h{}", h.dico.get_u32(1).unwrap()),
            QueueItem::Block(b) => format!("b{}", b.meta.offset),
        }
    }

    #[test]
    fn single_consumer_sees_enqueue_order() {
        let q = WorkQueue::new(32);
        let mut expected = Vec::new();
        for i in 0..5u32 {
            q.enqueue_header(header(i)).unwrap();
            expected.push(format!("h{i}"));
            for j in 0..3u64 {
                let off = (i as u64) * 10 + j;
                q.enqueue_block(block(off), BlockStatus::Done).unwrap();
                expected.push(format!("b{off}"));
            }
        }
        q.mark_end_of_queue(true);

        let mut seen = Vec::new();
        loop {
            match q.dequeue_first() {
                Ok(item) => seen.push(describe(item)),
                Err(QueueError::EndOfQueue) => break,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(seen, expected);
        assert!(q.is_end_of_queue());
    }

    #[test]
    fn out_of_order_completion_keeps_fifo() {
        let q = WorkQueue::new(8);
        q.enqueue_block(block(0), BlockStatus::Todo).unwrap();
        q.enqueue_block(block(1), BlockStatus::Todo).unwrap();
        q.enqueue_header(header(9)).unwrap();

        let (t0, b0) = q.claim_todo().unwrap();
        let (t1, b1) = q.claim_todo().unwrap();
        assert_eq!(b0.meta.offset, 0);
        assert_eq!(b1.meta.offset, 1);

        assert!(q.complete(t1, b1));
        q.mark_end_of_queue(true);
        assert!(q.claim_todo().is_none());

        let consumer = {
            let q = Arc::new(q);
            let qc = Arc::clone(&q);
            let handle = thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(item) = qc.dequeue_first() {
                    seen.push(describe(item));
                }
                seen
            });
            thread::sleep(Duration::from_millis(20));
            assert!(q.complete(t0, b0));
            handle
        };
        assert_eq!(consumer.join().unwrap(), vec!["b0", "b1", "h9"]);
    }

    #[test]
    fn end_of_queue_releases_blocked_consumer() {
        let q = Arc::new(WorkQueue::new(4));
        let qc = Arc::clone(&q);
        let handle = thread::spawn(move || qc.dequeue_first());
        thread::sleep(Duration::from_millis(20));
        q.mark_end_of_queue(true);
        assert_eq!(handle.join().unwrap().unwrap_err(), QueueError::EndOfQueue);
    }

    #[test]
    fn full_queue_blocks_until_consumed() {
        let q = Arc::new(WorkQueue::new(1));
        q.enqueue_header(header(0)).unwrap();
        let qp = Arc::clone(&q);
        let producer = thread::spawn(move || qp.enqueue_header(header(1)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.count(), 1);
        assert_eq!(describe(q.dequeue_first().unwrap()), "h0");
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(describe(q.dequeue_first().unwrap()), "h1");
    }

    #[test]
    fn closed_queue_refuses_producers() {
        let q = WorkQueue::new(4);
        q.close();
        assert_eq!(q.enqueue_header(header(0)).unwrap_err(), QueueError::Closed);
        assert!(q.claim_todo().is_none());
    }

    #[test]
    fn closed_queue_stops_consumers_before_ready_items() {
        let q = WorkQueue::new(4);
        q.enqueue_header(header(0)).unwrap();
        q.close();
        q.mark_end_of_queue(true);
        assert_eq!(q.dequeue_first().unwrap_err(), QueueError::Closed);
        assert_eq!(q.dequeue_pending().unwrap_err(), QueueError::Closed);
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn pending_dequeue_accepts_todo_head() {
        let q = WorkQueue::new(4);
        q.enqueue_block(block(3), BlockStatus::Todo).unwrap();
        q.mark_end_of_queue(true);
        assert_eq!(describe(q.dequeue_pending().unwrap()), "b3");
        assert_eq!(q.dequeue_pending().unwrap_err(), QueueError::EndOfQueue);
    }

    #[test]
    fn completion_after_drain_releases_block() {
        let q = WorkQueue::new(4);
        q.enqueue_block(block(5), BlockStatus::Todo).unwrap();
        let (ticket, b) = q.claim_todo().unwrap();
        assert_eq!(q.drain_and_discard(), 1);
        assert!(!q.complete(ticket, b));
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn discard_drains_to_end_of_queue() {
        let q = Arc::new(WorkQueue::new(8));
        for i in 0..6 {
            q.enqueue_block(block(i), BlockStatus::Todo).unwrap();
        }
        let qp = Arc::clone(&q);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            qp.mark_end_of_queue(true);
        });

        let mut discarded = 0;
        let mut rounds = 0;
        while !q.is_end_of_queue() {
            if q.discard_first(Duration::from_millis(5)) {
                discarded += 1;
            }
            rounds += 1;
            assert!(rounds < 1000, "drain did not terminate");
        }
        producer.join().unwrap();
        assert_eq!(discarded, 6);
        assert_eq!(q.count(), 0);
    }
}
