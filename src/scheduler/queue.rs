//! In-memory priority queue of planned occurrences.
//!
//! A hand-rolled min-heap keyed by `(scheduled_for, job_id)` with a side map
//! from job id to heap slot, so replacing or cancelling a job's entry is
//! O(log n). The queue holds at most one entry per job: either the next
//! occurrence or the pending retry of the current one.

use crate::data::models::{ExecutionId, JobId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A planned dispatch: one attempt of one occurrence of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// When this attempt should fire. Equals `origin_scheduled_for` for
    /// attempt 1; later attempts carry the backoff-shifted instant.
    pub scheduled_for: DateTime<Utc>,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// The instant the occurrence was originally due; cadence is derived
    /// from this, never from the wall clock at dispatch.
    pub origin_scheduled_for: DateTime<Utc>,
    /// Pre-allocated execution row, set only for ad-hoc dispatches.
    pub execution_id: Option<ExecutionId>,
}

impl QueueEntry {
    /// First attempt of a regular occurrence.
    pub fn occurrence(job_id: JobId, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            job_id,
            scheduled_for,
            attempt: 1,
            origin_scheduled_for: scheduled_for,
            execution_id: None,
        }
    }

    fn key(&self) -> (DateTime<Utc>, JobId) {
        (self.scheduled_for, self.job_id)
    }
}

#[derive(Default)]
struct Heap {
    entries: Vec<QueueEntry>,
    /// job id -> slot in `entries`; kept consistent through every sift.
    index: HashMap<JobId, usize>,
}

/// Min-heap of [`QueueEntry`] with an async wait for the earliest due entry.
#[derive(Default)]
pub struct DueQueue {
    heap: Mutex<Heap>,
    /// Re-arms [`DueQueue::wait_until_due`] whenever a mutation may have
    /// changed the root.
    notify: Notify,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any existing entry for the same job.
    pub fn push(&self, entry: QueueEntry) {
        let mut heap = self.heap.lock().unwrap();
        if let Some(&slot) = heap.index.get(&entry.job_id) {
            heap.remove_at(slot);
        }
        let slot = heap.entries.len();
        heap.index.insert(entry.job_id, slot);
        heap.entries.push(entry);
        heap.sift_up(slot);
        drop(heap);
        self.notify.notify_one();
    }

    /// The earliest entry, without removing it.
    pub fn peek(&self) -> Option<QueueEntry> {
        self.heap.lock().unwrap().entries.first().cloned()
    }

    /// Pop the earliest entry iff it is due at `now`.
    pub fn pop_if_due(&self, now: DateTime<Utc>) -> Option<QueueEntry> {
        let mut heap = self.heap.lock().unwrap();
        let root = heap.entries.first()?;
        if root.scheduled_for > now {
            return None;
        }
        Some(heap.remove_at(0))
    }

    /// Remove the entry for `job_id`, if any.
    pub fn remove(&self, job_id: JobId) -> bool {
        let mut heap = self.heap.lock().unwrap();
        let Some(&slot) = heap.index.get(&job_id) else {
            return false;
        };
        heap.remove_at(slot);
        drop(heap);
        self.notify.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sleep until the root entry is due, re-arming on every queue mutation.
    ///
    /// Blocks indefinitely while the queue is empty. Never pops, so callers
    /// may drop this future at any point (e.g. inside `select!`) without
    /// losing an entry; drain with [`DueQueue::pop_if_due`] afterwards.
    pub async fn wait_until_due(&self) {
        loop {
            let next_at = self.peek().map(|entry| entry.scheduled_for);
            match next_at {
                Some(at) => {
                    let now = Utc::now();
                    if at <= now {
                        return;
                    }
                    let sleep = (at - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => return,
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

impl Heap {
    /// Remove the entry at `slot`, restoring heap order and the index map.
    fn remove_at(&mut self, slot: usize) -> QueueEntry {
        let last = self.entries.len() - 1;
        self.entries.swap(slot, last);
        let removed = self.entries.pop().unwrap();
        self.index.remove(&removed.job_id);
        if slot < self.entries.len() {
            let moved = self.entries[slot].job_id;
            self.index.insert(moved, slot);
            self.sift_down(slot);
            self.sift_up(slot);
        }
        removed
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot].key() >= self.entries[parent].key() {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            if left >= self.entries.len() {
                break;
            }
            let right = left + 1;
            let smallest_child = if right < self.entries.len()
                && self.entries[right].key() < self.entries[left].key()
            {
                right
            } else {
                left
            };
            if self.entries[slot].key() <= self.entries[smallest_child].key() {
                break;
            }
            self.swap_slots(slot, smallest_child);
            slot = smallest_child;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.index.insert(self.entries[a].job_id, a);
        self.index.insert(self.entries[b].job_id, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(job_id: JobId, secs: i64) -> QueueEntry {
        QueueEntry::occurrence(job_id, at(secs))
    }

    /// The index map must mirror heap contents exactly.
    fn assert_consistent(queue: &DueQueue) {
        let heap = queue.heap.lock().unwrap();
        assert_eq!(heap.index.len(), heap.entries.len());
        for (slot, e) in heap.entries.iter().enumerate() {
            assert_eq!(heap.index[&e.job_id], slot, "index out of sync at {slot}");
        }
    }

    #[test]
    fn pops_in_scheduled_order() {
        let queue = DueQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push(entry(a, 30));
        queue.push(entry(b, 10));
        queue.push(entry(c, 20));
        assert_consistent(&queue);

        let order: Vec<JobId> = std::iter::from_fn(|| queue.pop_if_due(at(100)))
            .map(|e| e.job_id)
            .collect();
        assert_eq!(order, vec![b, c, a]);
        assert!(queue.is_empty());
    }

    #[test]
    fn job_id_breaks_ties_deterministically() {
        let queue = DueQueue::new();
        let mut ids: Vec<JobId> = (0..8).map(|_| Uuid::new_v4()).collect();
        for &id in &ids {
            queue.push(entry(id, 5));
        }
        ids.sort();

        let order: Vec<JobId> = std::iter::from_fn(|| queue.pop_if_due(at(5)))
            .map(|e| e.job_id)
            .collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn push_replaces_existing_entry_for_job() {
        let queue = DueQueue::new();
        let job = Uuid::new_v4();
        queue.push(entry(job, 10));
        queue.push(entry(job, 50));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().scheduled_for, at(50));
        assert_consistent(&queue);
    }

    #[test]
    fn pop_if_due_respects_boundary() {
        let queue = DueQueue::new();
        let job = Uuid::new_v4();
        queue.push(entry(job, 10));

        assert!(queue.pop_if_due(at(9)).is_none());
        // due exactly at the scheduled instant
        let popped = queue.pop_if_due(at(10)).unwrap();
        assert_eq!(popped.job_id, job);
        assert!(queue.pop_if_due(at(10)).is_none());
    }

    #[test]
    fn remove_by_job_id() {
        let queue = DueQueue::new();
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        queue.push(entry(keep, 10));
        queue.push(entry(gone, 5));

        assert!(queue.remove(gone));
        assert!(!queue.remove(gone));
        assert_consistent(&queue);
        assert_eq!(queue.peek().unwrap().job_id, keep);
    }

    #[test]
    fn interior_removal_keeps_heap_valid() {
        let queue = DueQueue::new();
        let ids: Vec<JobId> = (0..32).map(|_| Uuid::new_v4()).collect();
        for (i, &id) in ids.iter().enumerate() {
            queue.push(entry(id, (i as i64 * 7) % 31));
        }
        for id in ids.iter().step_by(3) {
            queue.remove(*id);
            assert_consistent(&queue);
        }

        let mut last = at(-1);
        while let Some(e) = queue.pop_if_due(at(100)) {
            assert!(e.scheduled_for >= last);
            last = e.scheduled_for;
        }
    }

    #[tokio::test]
    async fn wait_wakes_on_earlier_insertion() {
        let queue = std::sync::Arc::new(DueQueue::new());
        let job = Uuid::new_v4();
        queue.push(QueueEntry::occurrence(job, Utc::now() + chrono::Duration::seconds(60)));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_until_due().await })
        };
        // Root is a minute out; an already-due entry must wake the waiter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(QueueEntry::occurrence(Uuid::new_v4(), Utc::now()));

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_on_empty_queue() {
        let queue = DueQueue::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(100), queue.wait_until_due())
            .await
            .is_err();
        assert!(timed_out, "empty queue must block");
    }
}
