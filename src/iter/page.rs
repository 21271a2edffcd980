use std::marker::PhantomData;

use super::{Cursor, IterState};

/// Restricts the rows of a source iterator to `[offset, offset + limit)`
/// of the concatenation of all its windows.
///
/// Windows entirely before the offset are skipped,
/// and the source is finished as soon as the limit is reached.
pub struct PageIter<'w, I> {
    source:    I,
    state:     IterState<'w>,
    /// Rows still to skip.
    offset:    usize,
    limit:     usize,
    /// Rows still to yield if `limit` is not 0.
    remaining: usize,
    finished:  bool,
    _ph:       PhantomData<&'w ()>,
}

impl<'w, I: Cursor<'w>> PageIter<'w, I> {
    pub(crate) fn new(source: I, offset: usize, limit: usize) -> Self {
        let state = source.state().clone();
        Self { source, state, offset, limit, remaining: limit, finished: false, _ph: PhantomData }
    }

    /// The wrapped iterator.
    pub fn source(&self) -> &I { &self.source }
}

impl<'w, I: Cursor<'w>> Cursor<'w> for PageIter<'w, I> {
    fn next(&mut self) -> bool {
        assert!(!self.finished, "next called on a finished iterator");

        loop {
            if self.limit != 0 && self.remaining == 0 {
                self.fini();
                return false;
            }

            if !self.source.next() {
                self.fini();
                return false;
            }
            self.state.copy_from(self.source.state());

            if self.state.table.is_none() {
                // results without rows are not paged
                return true;
            }

            if self.offset > 0 {
                if self.state.count <= self.offset {
                    self.offset -= self.state.count;
                    continue;
                }
                self.state.offset += self.offset;
                self.state.count -= self.offset;
                self.offset = 0;
            }

            if self.limit != 0 {
                if self.remaining > self.state.count {
                    self.remaining -= self.state.count;
                } else {
                    self.state.count = self.remaining;
                    self.remaining = 0;
                }
            }

            if self.state.count > 0 {
                return true;
            }
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
