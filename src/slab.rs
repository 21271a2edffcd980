use std::mem::{self, MaybeUninit};

use bitvec::prelude::BitVec;

/// A `Vec<Option<T>>`-like arena with recycled slots
/// and discriminant storage optimized with [`BitVec`].
///
/// Slot indices are stable until the slot is removed.
pub(crate) struct Slab<T> {
    is_set: BitVec,
    data:   Vec<MaybeUninit<T>>,
    free:   Vec<usize>,
    len:    usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self { Self { is_set: BitVec::new(), data: Vec::new(), free: Vec::new(), len: 0 } }
}

impl<T> Slab<T> {
    /// Returns the number of occupied slots.
    pub(crate) fn len(&self) -> usize { self.len }

    /// Returns `true` if no slots are occupied.
    pub(crate) fn is_empty(&self) -> bool { self.len == 0 }

    /// Returns the index that the next [`insert`](Self::insert) call will use.
    pub(crate) fn next_index(&self) -> usize {
        self.free.last().copied().unwrap_or(self.data.len())
    }

    /// Stores `value` in a vacant slot and returns its index.
    pub(crate) fn insert(&mut self, value: T) -> usize {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            debug_assert!(!self.is_set[index], "free list contains an occupied slot");
            self.is_set.set(index, true);
            self.data[index] = MaybeUninit::new(value);
            index
        } else {
            let index = self.data.len();
            self.is_set.push(true);
            self.data.push(MaybeUninit::new(value));
            index
        }
    }

    /// Removes the value at `index`, returning it if the slot was occupied.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let was_set = *self.is_set.get(index)?;
        if !was_set {
            return None;
        }

        self.is_set.set(index, false);
        self.free.push(index);
        self.len -= 1;

        let slot = self.data.get_mut(index).expect("is_set is as long as data");
        let value = mem::replace(slot, MaybeUninit::uninit());
        // SAFETY: The `is_set` bit was set, so the `data` slot was initialized.
        // The bit is now cleared, so the value will not be read or dropped again.
        Some(unsafe { value.assume_init() })
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if *self.is_set.get(index)? {
            let data = self.data.get(index).expect("is_set is as long as data");
            // SAFETY: The `is_set` bit is set, so the `data` slot is initialized.
            unsafe { Some(data.assume_init_ref()) }
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if *self.is_set.get(index)? {
            let data = self.data.get_mut(index).expect("is_set is as long as data");
            // SAFETY: The `is_set` bit is set, so the `data` slot is initialized.
            unsafe { Some(data.assume_init_mut()) }
        } else {
            None
        }
    }

    /// Borrows two distinct slots mutably.
    ///
    /// # Panics
    /// Panics if `a == b`.
    pub(crate) fn get2_mut(&mut self, a: usize, b: usize) -> (Option<&mut T>, Option<&mut T>) {
        assert_ne!(a, b, "cannot borrow the same slot twice");

        let a_set = self.is_set.get(a).map_or(false, |bit| *bit);
        let b_set = self.is_set.get(b).map_or(false, |bit| *bit);

        let (low, high, swapped) = if a < b { (a, b, false) } else { (b, a, true) };
        let data_len = self.data.len();
        let (head, tail) = self.data.split_at_mut(high.min(data_len));

        let low_ref = head.get_mut(low);
        let high_ref = tail.first_mut();
        let (a_ref, b_ref) = if swapped { (high_ref, low_ref) } else { (low_ref, high_ref) };

        // SAFETY: a slot is only dereferenced when its `is_set` bit is set.
        let a_ref = a_ref.filter(|_| a_set).map(|data| unsafe { data.assume_init_mut() });
        let b_ref = b_ref.filter(|_| b_set).map(|data| unsafe { data.assume_init_mut() });
        (a_ref, b_ref)
    }

    /// Iterates over occupied slots in index order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.is_set.iter_ones().map(|index| {
            let data = self.data.get(index).expect("is_set is as long as data");
            // SAFETY: `iter_ones` only yields indices whose `is_set` bit is set.
            (index, unsafe { data.assume_init_ref() })
        })
    }

    /// Iterates over occupied slots in index order.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        self.data.iter_mut().zip(self.is_set.iter().by_vals()).enumerate().filter_map(
            |(index, (data, set))| {
                // SAFETY: the slot is only dereferenced when its `is_set` bit is set.
                set.then(|| (index, unsafe { data.assume_init_mut() }))
            },
        )
    }
}

impl<T> Drop for Slab<T> {
    fn drop(&mut self) {
        for index in self.is_set.iter_ones() {
            let data = self.data.get_mut(index).expect("is_set is as long as data");
            // SAFETY: `iter_ones` only yields initialized slots, each dropped exactly once here.
            unsafe { data.assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Slab;

    #[test]
    fn recycles_slots() {
        let mut slab = Slab::default();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.next_index(), a);
        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec!["c", "b"]);
    }

    #[test]
    fn borrows_two_slots() {
        let mut slab = Slab::default();
        let a = slab.insert(1);
        let b = slab.insert(2);
        let (x, y) = slab.get2_mut(b, a);
        std::mem::swap(x.unwrap(), y.unwrap());
        assert_eq!(slab.get(a), Some(&2));
        assert_eq!(slab.get(b), Some(&1));
    }

    #[test]
    fn drops_remaining_values() {
        let counter = std::rc::Rc::new(());
        let mut slab = Slab::default();
        slab.insert(counter.clone());
        let index = slab.insert(counter.clone());
        slab.remove(index);
        assert_eq!(std::rc::Rc::strong_count(&counter), 2);
        drop(slab);
        assert_eq!(std::rc::Rc::strong_count(&counter), 1);
    }
}
