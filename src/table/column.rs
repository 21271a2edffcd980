use std::any::{self, Any};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::component::Component;
use crate::Id;

/// Type-erased operations on the dense storage of one component in one table.
pub(crate) trait AnyColumn: Send + Sync {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send + Sync);

    fn len(&self) -> usize;

    /// Drops the value at `row`, moving the last value into its place.
    fn swap_remove(&mut self, row: usize);

    /// Moves the value at `row` to the end of `dest`,
    /// moving the last value of `self` into its place.
    fn move_row(&mut self, row: usize, dest: &mut dyn AnyColumn);

    fn type_name(&self) -> &'static str;
}

impl<C: Component> AnyColumn for Vec<C> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) { self }
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send + Sync) { self }

    fn len(&self) -> usize { Vec::len(self) }

    fn swap_remove(&mut self, row: usize) { drop(Vec::swap_remove(self, row)); }

    fn move_row(&mut self, row: usize, dest: &mut dyn AnyColumn) {
        let dest = dest
            .as_any_mut()
            .downcast_mut::<Vec<C>>()
            .expect("columns of the same id have the same component type");
        dest.push(Vec::swap_remove(self, row));
    }

    fn type_name(&self) -> &'static str { any::type_name::<C>() }
}

/// Creates an empty column for `C`.
pub(crate) fn new_column<C: Component>() -> Box<dyn AnyColumn> { Box::new(Vec::<C>::new()) }

/// The storage of one data component in a table.
///
/// The data is behind a lock so that disjoint row ranges of the same table
/// can be borrowed from multiple threads while the world is shared.
pub(crate) struct Column {
    pub(crate) id: Id,
    data:          RwLock<Box<dyn AnyColumn>>,
}

impl Column {
    pub(crate) fn new(id: Id, data: Box<dyn AnyColumn>) -> Self { Self { id, data: RwLock::new(data) } }

    pub(crate) fn get_mut(&mut self) -> &mut dyn AnyColumn { &mut **self.data.get_mut() }

    pub(crate) fn len(&mut self) -> usize { self.data.get_mut().len() }

    /// Returns the typed vector for exclusive access.
    ///
    /// # Panics
    /// Panics if the column does not store `C`.
    pub(crate) fn typed_mut<C: Component>(&mut self) -> &mut Vec<C> {
        let data = self.data.get_mut();
        let type_name = data.type_name();
        data.as_any_mut().downcast_mut::<Vec<C>>().unwrap_or_else(|| {
            panic!("column stores {type_name}, not {}", any::type_name::<C>())
        })
    }

    /// Borrows `range` of the column as `C`.
    ///
    /// Blocks while another thread borrows the column mutably.
    ///
    /// # Panics
    /// Panics if the column does not store `C`, the range is out of bounds,
    /// or the column is mutably borrowed on the current thread.
    pub(crate) fn read<C: Component>(&self, range: std::ops::Range<usize>) -> ColumnRead<'_, [C]> {
        let borrow = Borrow::new(self, false);
        let guard = self.data.read();
        assert_type::<C>(&**guard);
        let guard = RwLockReadGuard::map(guard, move |data| {
            let vec = data.as_any().downcast_ref::<Vec<C>>().expect("type checked above");
            &vec[range]
        });
        ColumnRead { guard, _borrow: borrow }
    }

    /// Mutably borrows `range` of the column as `C`.
    ///
    /// Blocks while another thread borrows the column.
    ///
    /// # Panics
    /// Panics if the column does not store `C`, the range is out of bounds,
    /// or the column is already borrowed on the current thread.
    pub(crate) fn write<C: Component>(&self, range: std::ops::Range<usize>) -> ColumnWrite<'_, [C]> {
        let borrow = Borrow::new(self, true);
        let guard = self.data.write();
        assert_type::<C>(&**guard);
        let guard = RwLockWriteGuard::map(guard, move |data| {
            let vec = data.as_any_mut().downcast_mut::<Vec<C>>().expect("type checked above");
            &mut vec[range]
        });
        ColumnWrite { guard, _borrow: borrow }
    }
}

thread_local! {
    /// The columns borrowed by the current thread, and whether each borrow is mutable.
    static BORROWS: RefCell<Vec<(usize, bool)>> = const { RefCell::new(Vec::new()) };
}

/// Registers a borrow of a column by the current thread until dropped.
///
/// Conflicting borrows on one thread panic instead of waiting on the lock forever.
struct Borrow {
    column:    usize,
    mutable:   bool,
    /// The registration belongs to the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl Borrow {
    fn new(column: &Column, mutable: bool) -> Self {
        let key = column as *const Column as usize;
        BORROWS.with(|borrows| {
            let mut borrows = borrows.borrow_mut();
            let conflict = borrows.iter().find(|&&(held, held_mut)| held == key && (mutable || held_mut));
            if let Some(&(_, held_mut)) = conflict {
                let state = if held_mut { "mutably borrowed" } else { "borrowed" };
                panic!("column of {:?} is already {state} on this thread", column.id);
            }
            borrows.push((key, mutable));
        });
        Self { column: key, mutable, _not_send: PhantomData }
    }
}

impl Drop for Borrow {
    fn drop(&mut self) {
        let entry = (self.column, self.mutable);
        let _ = BORROWS.try_with(|borrows| {
            let mut borrows = borrows.borrow_mut();
            if let Some(index) = borrows.iter().rposition(|&held| held == entry) {
                borrows.swap_remove(index);
            }
        });
    }
}

/// A shared borrow of column data.
pub struct ColumnRead<'a, T: ?Sized> {
    guard:   MappedRwLockReadGuard<'a, T>,
    _borrow: Borrow,
}

impl<'a, T: ?Sized> ColumnRead<'a, T> {
    /// Narrows the borrow to a part of the data.
    pub fn map<U: ?Sized>(this: Self, f: impl FnOnce(&T) -> &U) -> ColumnRead<'a, U> {
        ColumnRead { guard: MappedRwLockReadGuard::map(this.guard, f), _borrow: this._borrow }
    }
}

impl<'a, T: ?Sized> Deref for ColumnRead<'a, T> {
    type Target = T;

    fn deref(&self) -> &T { &self.guard }
}

/// An exclusive borrow of column data.
pub struct ColumnWrite<'a, T: ?Sized> {
    guard:   MappedRwLockWriteGuard<'a, T>,
    _borrow: Borrow,
}

impl<'a, T: ?Sized> Deref for ColumnWrite<'a, T> {
    type Target = T;

    fn deref(&self) -> &T { &self.guard }
}

impl<'a, T: ?Sized> DerefMut for ColumnWrite<'a, T> {
    fn deref_mut(&mut self) -> &mut T { &mut self.guard }
}

fn assert_type<C: Component>(data: &dyn AnyColumn) {
    assert!(
        data.as_any().is::<Vec<C>>(),
        "column stores {}, not {}",
        data.type_name(),
        any::type_name::<C>()
    );
}
