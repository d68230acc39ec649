//! Jacobian sparsity pattern construction.
//!
//! Devices declare the `(row, col)` entries they will ever write. The builder
//! returns an opaque [`JacHandle`] for each request; after [`SparsityBuilder::finalize`]
//! the handle resolves to a fixed storage slot in the compressed-row layout.
//! Requests for the same entry from different devices share one slot, and
//! contributions accumulate.

use std::ops::Range;

use indexmap::IndexSet;

use crate::error::{Error, Result};
use crate::topology::VarId;

/// Opaque reference to one Jacobian entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JacHandle(usize);

/// Collects requested entries before the pattern is frozen.
#[derive(Debug, Clone)]
pub struct SparsityBuilder {
    size: usize,
    entries: IndexSet<(usize, usize)>,
}

impl SparsityBuilder {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            entries: IndexSet::new(),
        }
    }

    /// Request storage for entry `(row, col)`.
    pub fn request(&mut self, row: VarId, col: VarId) -> Result<JacHandle> {
        let (r, c) = (row.index(), col.index());
        if r >= self.size || c >= self.size {
            return Err(Error::EntryOutOfBounds {
                row: r,
                col: c,
                size: self.size,
            });
        }
        let (index, _) = self.entries.insert_full((r, c));
        Ok(JacHandle(index))
    }

    /// Request an entry where either side may be ground.
    pub fn request_opt(
        &mut self,
        row: Option<VarId>,
        col: Option<VarId>,
    ) -> Result<Option<JacHandle>> {
        match (row, col) {
            (Some(r), Some(c)) => self.request(r, c).map(Some),
            _ => Ok(None),
        }
    }

    /// Add every diagonal entry so each row has a pivot slot.
    pub fn ensure_diagonal(&mut self) {
        for i in 0..self.size {
            self.entries.insert((i, i));
        }
    }

    pub fn num_requests(&self) -> usize {
        self.entries.len()
    }

    /// Freeze the pattern into compressed-row form.
    pub fn finalize(self) -> SparsityPattern {
        let mut order: Vec<(usize, usize, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(handle, &(r, c))| (r, c, handle))
            .collect();
        order.sort_unstable();

        let mut row_ptr = vec![0usize; self.size + 1];
        let mut col_idx = Vec::with_capacity(order.len());
        let mut handle_slot = vec![0usize; order.len()];

        for (slot, &(r, c, handle)) in order.iter().enumerate() {
            row_ptr[r + 1] += 1;
            col_idx.push(c);
            handle_slot[handle] = slot;
        }
        for i in 0..self.size {
            row_ptr[i + 1] += row_ptr[i];
        }

        SparsityPattern {
            size: self.size,
            row_ptr,
            col_idx,
            handle_slot,
        }
    }
}

/// Frozen compressed-row sparsity pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    size: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    handle_slot: Vec<usize>,
}

impl SparsityPattern {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// Storage slot for a handle.
    #[inline]
    pub fn slot(&self, handle: JacHandle) -> usize {
        self.handle_slot[handle.0]
    }

    /// Storage slot for `(row, col)`, if the entry is in the pattern.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        if row >= self.size {
            return None;
        }
        let range = self.row_range(row);
        let start = range.start;
        self.col_idx[range]
            .binary_search(&col)
            .ok()
            .map(|offset| start + offset)
    }

    pub fn row_range(&self, row: usize) -> Range<usize> {
        self.row_ptr[row]..self.row_ptr[row + 1]
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    pub fn col_idx(&self) -> &[usize] {
        &self.col_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(i: usize) -> VarId {
        VarId::new(i)
    }

    #[test]
    fn shared_entries_share_a_slot() {
        let mut builder = SparsityBuilder::new(3);
        let h1 = builder.request(v(0), v(1)).unwrap();
        let h2 = builder.request(v(0), v(1)).unwrap();
        assert_eq!(h1, h2);

        builder.ensure_diagonal();
        let pattern = builder.finalize();
        assert_eq!(pattern.nnz(), 4);
        assert_eq!(pattern.slot(h1), pattern.position(0, 1).unwrap());
    }

    #[test]
    fn rows_are_sorted() {
        let mut builder = SparsityBuilder::new(2);
        let h10 = builder.request(v(1), v(0)).unwrap();
        let h01 = builder.request(v(0), v(1)).unwrap();
        let h00 = builder.request(v(0), v(0)).unwrap();
        let pattern = builder.finalize();

        assert_eq!(pattern.row_ptr(), &[0, 2, 3]);
        assert_eq!(pattern.col_idx(), &[0, 1, 0]);
        assert_eq!(pattern.slot(h00), 0);
        assert_eq!(pattern.slot(h01), 1);
        assert_eq!(pattern.slot(h10), 2);
        assert_eq!(pattern.position(1, 1), None);
    }

    #[test]
    fn out_of_bounds_request_fails() {
        let mut builder = SparsityBuilder::new(2);
        assert!(matches!(
            builder.request(v(2), v(0)),
            Err(Error::EntryOutOfBounds { .. })
        ));
        assert_eq!(builder.request_opt(None, Some(v(0))).unwrap(), None);
    }
}
