//! Per tensor scheduling state, indexed by [TensorId].

use crate::tensor::TensorId;

/// Backend assignment and memoized split input copies of each tensor
#[derive(Debug)]
pub struct TensorTable {
    n_backends: usize,
    n_copies: usize,
    backend_ids: Vec<Option<usize>>,
    // [tensor][backend][copy]
    copies: Vec<Option<TensorId>>,
}

impl TensorTable {
    #[must_use]
    pub fn new(size: usize, n_backends: usize, n_copies: usize) -> TensorTable {
        TensorTable {
            n_backends,
            n_copies,
            backend_ids: vec![None; size],
            copies: vec![None; size * n_backends * n_copies],
        }
    }

    /// Forgets all assignments and copies, keeping capacity for `size` tensors
    pub fn reset(&mut self, size: usize) {
        self.backend_ids.clear();
        self.backend_ids.resize(size, None);
        self.copies.clear();
        self.copies.resize(size * self.n_backends * self.n_copies, None);
    }

    fn grow(&mut self, id: TensorId) {
        let size = usize::from(id) + 1;
        if self.backend_ids.len() < size {
            self.backend_ids.resize(size, None);
            self.copies.resize(size * self.n_backends * self.n_copies, None);
        }
    }

    #[must_use]
    pub fn backend_id(&self, id: TensorId) -> Option<usize> {
        self.backend_ids.get(usize::from(id)).copied().flatten()
    }

    pub fn set_backend_id(&mut self, id: TensorId, backend_id: Option<usize>) {
        debug_assert!(backend_id.map_or(true, |b| b < self.n_backends));
        self.grow(id);
        self.backend_ids[usize::from(id)] = backend_id;
    }

    fn copy_index(&self, id: TensorId, backend_id: usize, copy: usize) -> usize {
        assert!(backend_id < self.n_backends && copy < self.n_copies);
        (usize::from(id) * self.n_backends + backend_id) * self.n_copies + copy
    }

    /// Copy of `id` living on `backend_id` in copy slot `copy`
    #[must_use]
    pub fn copy(&self, id: TensorId, backend_id: usize, copy: usize) -> Option<TensorId> {
        self.copies.get(self.copy_index(id, backend_id, copy)).copied().flatten()
    }

    pub fn set_copy(&mut self, id: TensorId, backend_id: usize, copy: usize, tensor: TensorId) {
        self.grow(id);
        let i = self.copy_index(id, backend_id, copy);
        self.copies[i] = Some(tensor);
    }
}

#[test]
fn copies_are_memoized() {
    let mut table = TensorTable::new(4, 2, 2);
    let x = TensorId::from(3);
    assert_eq!(table.copy(x, 1, 0), None);
    table.set_copy(x, 1, 0, TensorId::from(7));
    table.set_copy(x, 1, 1, TensorId::from(8));
    assert_eq!(table.copy(x, 1, 0), Some(TensorId::from(7)));
    assert_eq!(table.copy(x, 1, 0), table.copy(x, 1, 0));
    assert_eq!(table.copy(x, 0, 0), None);
    // Ids past the initial size grow the table
    table.set_backend_id(TensorId::from(10), Some(1));
    assert_eq!(table.backend_id(TensorId::from(10)), Some(1));
    assert_eq!(table.backend_id(TensorId::from(11)), None);
    table.reset(2);
    assert_eq!(table.copy(x, 1, 0), None);
    assert_eq!(table.backend_id(TensorId::from(10)), None);
}
