use std::marker::PhantomData;

use super::{Cursor, IterState};

/// Yields the share of one worker of every window of a source iterator.
///
/// Each window of `n` rows is split into `count` contiguous shares.
/// Worker `i` gets `n / count + 1` rows if `i < n % count`, otherwise `n / count` rows.
/// A worker whose share is empty still receives the window with a count of 0,
/// so all workers see the same sequence of tables.
/// Windows without rows are only yielded to worker 0.
pub struct WorkerIter<'w, I> {
    source:   I,
    state:    IterState<'w>,
    index:    usize,
    count:    usize,
    finished: bool,
    _ph:      PhantomData<&'w ()>,
}

/// The offset and length of the share of worker `index` in `rows` rows.
pub(crate) fn share(rows: usize, index: usize, count: usize) -> (usize, usize) {
    let per_worker = rows / count;
    let remainder = rows % count;

    if index < remainder {
        (per_worker * index + index, per_worker + 1)
    } else {
        (per_worker * index + remainder, per_worker)
    }
}

impl<'w, I: Cursor<'w>> WorkerIter<'w, I> {
    pub(crate) fn new(source: I, index: usize, count: usize) -> Self {
        assert!(count > 0, "worker count must be positive");
        assert!(index < count, "worker index {index} out of bounds for {count} workers");

        let state = source.state().clone();
        Self { source, state, index, count, finished: false, _ph: PhantomData }
    }

    /// The index of this worker.
    pub fn index(&self) -> usize { self.index }

    /// The number of workers.
    pub fn worker_count(&self) -> usize { self.count }
}

impl<'w, I: Cursor<'w>> Cursor<'w> for WorkerIter<'w, I> {
    fn next(&mut self) -> bool {
        assert!(!self.finished, "next called on a finished iterator");

        loop {
            if !self.source.next() {
                self.fini();
                return false;
            }
            self.state.copy_from(self.source.state());

            if self.state.table.is_none() {
                if self.index == 0 {
                    return true;
                }
                continue;
            }

            let (first, rows) = share(self.state.count, self.index, self.count);
            self.state.offset += first;
            self.state.count = rows;
            return true;
        }
    }

    fn fini(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.source.fini();
        self.state.clear();
    }

    fn state(&self) -> &IterState<'w> { &self.state }

    fn is_finished(&self) -> bool { self.finished }
}
