//! Sorted iteration of cached tables.
//!
//! Rows are not reordered in their tables.
//! Instead, the rows of each table are ordered by the component value,
//! and the per-table orders are merged into slices of contiguous rows.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::{Component, Entity, Id, TableId, World};

/// A contiguous range of rows visited in sorted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slice {
    pub(crate) table:  TableId,
    pub(crate) offset: usize,
    pub(crate) count:  usize,
}

/// The sorted slices and the state they were built from.
pub(crate) struct SortState {
    pub(crate) slices:      Arc<[Slice]>,
    /// The cache match count when the slices were built.
    pub(crate) match_count: Option<u32>,
    /// The row and sorted column versions of each table when the slices were built.
    pub(crate) versions:    Vec<(TableId, u32, u32)>,
}

impl Default for SortState {
    fn default() -> Self { Self { slices: Arc::from(Vec::new()), match_count: None, versions: Vec::new() } }
}

/// Merges the rows of `tables` ordered by `compare` into slices.
pub(crate) fn build_slices<C: Component>(
    world: &World,
    component: Entity,
    tables: &[TableId],
    compare: &impl Fn(Entity, &C, Entity, &C) -> Ordering,
) -> Vec<Slice> {
    let id = Id::from(component);

    let columns: Vec<_> = tables
        .iter()
        .map(|&table_id| {
            let table = world.table(table_id);
            let column = table.column_for_id(id).expect("sorted tables store the sorted component");
            (table.entities(), table.column(column).read::<C>(0..table.count()))
        })
        .collect();

    let orders: Vec<Vec<usize>> = columns
        .iter()
        .map(|(entities, data)| {
            let mut rows: Vec<usize> = (0..entities.len()).collect();
            rows.sort_by(|&a, &b| compare(entities[a], &data[a], entities[b], &data[b]));
            rows
        })
        .collect();

    let total = orders.iter().map(Vec::len).sum();
    let mut heads = vec![0; tables.len()];
    let mut slices: Vec<Slice> = Vec::new();

    for _ in 0..total {
        let mut best: Option<(usize, usize)> = None;
        for (index, order) in orders.iter().enumerate() {
            let Some(&row) = order.get(heads[index]) else { continue };
            let better = match best {
                None => true,
                Some((best_index, best_row)) => {
                    let (entities, data) = &columns[index];
                    let (best_entities, best_data) = &columns[best_index];
                    compare(entities[row], &data[row], best_entities[best_row], &best_data[best_row])
                        == Ordering::Less
                }
            };
            if better {
                best = Some((index, row));
            }
        }

        let (index, row) = best.expect("rows remain until total is reached");
        heads[index] += 1;

        match slices.last_mut() {
            Some(last) if last.table == tables[index] && last.offset + last.count == row => last.count += 1,
            _ => slices.push(Slice { table: tables[index], offset: row, count: 1 }),
        }
    }

    slices
}
