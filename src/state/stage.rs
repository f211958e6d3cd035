// state/stage.rs — host staging memory.
//
// A stage is a zero-initialised host array a state copies through. It is
// recorded in the worker's ledger like device memory, so the release order
// between a stage and its device buffer is visible in the journal.

use std::cell::{Ref, RefCell, RefMut};

use bytemuck::Pod;

use crate::error::Result;
use crate::ledger::{ResourceId, ResourceKind};
use crate::platform::MemId;
use crate::worker::Worker;

pub(crate) struct Stage<T> {
    resource: ResourceId,
    cells: RefCell<Vec<T>>,
}

impl<T: Pod> Stage<T> {
    pub fn new(worker: &Worker, len: usize) -> Self {
        Stage {
            resource: worker.track(ResourceKind::Stage, len * std::mem::size_of::<T>()),
            cells: RefCell::new(vec![T::zeroed(); len]),
        }
    }

    pub fn borrow(&self) -> Ref<'_, [T]> {
        Ref::map(self.cells.borrow(), |v| v.as_slice())
    }

    pub fn borrow_mut(&self) -> RefMut<'_, [T]> {
        RefMut::map(self.cells.borrow_mut(), |v| v.as_mut_slice())
    }

    pub fn zero(&self) {
        self.cells.borrow_mut().fill(T::zeroed());
    }

    /// Blocking write of the first `len` staged items to the start of `mem`.
    pub fn upload(&self, worker: &Worker, mem: MemId, len: usize) -> Result<()> {
        let cells = self.cells.borrow();
        worker.write_buffer(mem, 0, bytemuck::cast_slice(&cells[..len]))
    }

    /// Blocking read of `len` items from the start of `mem` into the stage.
    pub fn download(&self, worker: &Worker, mem: MemId, len: usize) -> Result<()> {
        let mut cells = self.cells.borrow_mut();
        worker.read_buffer(mem, 0, bytemuck::cast_slice_mut(&mut cells[..len]))
    }

    pub fn release(&self, worker: &Worker) {
        let mut cells = self.cells.borrow_mut();
        cells.clear();
        cells.shrink_to_fit();
        worker.untrack(self.resource);
    }
}
