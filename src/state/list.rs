// state/list.rs — a counted list of plain-data items.
//
// Layout: `size` records of `each` items of T, `total = size * each` items
// in one device buffer, mirrored by a host stage of the same length. The
// list owns a `CountState` that kernels use as their append cursor.
//
// Release order: item stage, item buffer, then the counter (stage, buffer).

use std::cell::{Ref, RefMut};

use log::warn;

use super::count::CountState;
use super::stage::Stage;
use super::{Item, ItemDesc, WorkState};
use crate::error::{Error, Result};
use crate::platform::MemId;
use crate::worker::{Tracked, Worker};

pub struct ListState<'w, T: Item> {
    count: CountState<'w>,
    each: u32,
    total: usize,
    bytes: usize,
    buffer: Tracked<MemId>,
    stage: Stage<T>,
    released: bool,
}

impl<'w, T: Item> ListState<'w, T> {
    /// Allocate a list of `size` records of `each` items. Both must be
    /// positive.
    pub fn new(worker: &'w Worker, size: u32, each: u32) -> Result<Self> {
        if each == 0 {
            return Err(Error::invalid("items per record must be positive"));
        }
        let total = size as u64 * each as u64;
        let bytes = total
            .checked_mul(std::mem::size_of::<T>() as u64)
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| {
                Error::invalid(format!("{size}×{each} {} items do not fit in memory", T::NAME))
            })?;

        let count = CountState::new(worker, size)?;
        let buffer = match worker.create_buffer(bytes) {
            Ok(b) => b,
            Err(e) => {
                if let Err(re) = count.close() {
                    warn!("releasing counter after failed list allocation: {re}");
                }
                return Err(e);
            }
        };
        let stage = Stage::new(worker, total as usize);

        Ok(ListState {
            count,
            each,
            total: total as usize,
            bytes,
            buffer,
            stage,
            released: false,
        })
    }

    // --- shape ---

    /// Number of records.
    pub fn size(&self) -> u32 {
        self.count.size()
    }

    /// Items per record.
    pub fn each(&self) -> u32 {
        self.each
    }

    /// `size * each`.
    pub fn total(&self) -> u64 {
        self.total as u64
    }

    /// Device allocation in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn item(&self) -> ItemDesc {
        ItemDesc::of::<T>()
    }

    /// Device buffer holding the items.
    pub fn mem(&self) -> MemId {
        self.buffer.handle
    }

    pub fn counter(&self) -> &CountState<'w> {
        &self.count
    }

    // --- counter ---

    pub fn set_count(&self, value: i32) -> Result<()> {
        self.count.set_count(value)
    }

    pub fn get_count(&self) -> Result<i32> {
        self.count.get_count()
    }

    pub fn valid_count(&self) -> Result<usize> {
        self.count.valid_count()
    }

    // --- staged transfers ---

    /// Blocking write of the whole stage to the device.
    pub fn write(&self) -> Result<()> {
        self.stage.upload(self.worker(), self.buffer.handle, self.total)
    }

    /// Blocking read of the whole device buffer into the stage.
    pub fn read(&self) -> Result<()> {
        self.stage.download(self.worker(), self.buffer.handle, self.total)
    }

    /// Clear the stage. The device buffer is untouched.
    pub fn zero(&self) {
        self.stage.zero();
    }

    /// Clear the stage and write it, zeroing the device buffer.
    pub fn write_zero(&self) -> Result<()> {
        self.zero();
        self.write()
    }

    pub fn stage(&self) -> Ref<'_, [T]> {
        self.stage.borrow()
    }

    pub fn stage_mut(&self) -> RefMut<'_, [T]> {
        self.stage.borrow_mut()
    }

    // --- item-level access ---

    /// Write `items` as the list's content and set the counter to the
    /// number of records they form.
    pub fn set_items(&self, items: &[T]) -> Result<()> {
        let each = self.each as usize;
        if items.len() % each != 0 || items.len() > self.total {
            return Err(Error::shape(
                format!("a multiple of {each} {} items, at most {}", T::NAME, self.total),
                format!("{} items", items.len()),
            ));
        }
        let records = record_count(items.len(), each)?;
        self.stage.borrow_mut()[..items.len()].copy_from_slice(items);
        if !items.is_empty() {
            self.stage.upload(self.worker(), self.buffer.handle, items.len())?;
        }
        self.count.set_count(records)
    }

    /// Read back the `valid_count() * each` items kernels produced.
    pub fn get_items(&self) -> Result<Vec<T>> {
        let n = self.valid_count()? * self.each as usize;
        if n > 0 {
            self.stage.download(self.worker(), self.buffer.handle, n)?;
        }
        Ok(self.stage.borrow()[..n].to_vec())
    }

    /// Device-side copy of items and counter from `other`, which must have
    /// the same shape and live on the same worker. Blocks until done.
    pub fn copy_from(&self, other: &ListState<'_, T>) -> Result<()> {
        if !std::ptr::eq(self.worker(), other.worker()) {
            return Err(Error::invalid(
                "copy_from needs both lists on the same worker; use copy_from_via_host",
            ));
        }
        if (self.size(), self.each) != (other.size(), other.each) {
            return Err(Error::shape(
                format!("{}×{}", self.size(), self.each),
                format!("{}×{}", other.size(), other.each),
            ));
        }
        let worker = self.worker();
        worker.copy_buffer(other.buffer.handle, self.buffer.handle, self.bytes)?;
        worker.copy_buffer(other.count.mem(), self.count.mem(), std::mem::size_of::<i32>())?;
        worker.finish()
    }

    /// Copy the valid items of `other` through host memory. Works across
    /// workers and devices.
    pub fn copy_from_via_host(&self, other: &ListState<'_, T>) -> Result<()> {
        let items = other.get_items()?;
        self.set_items(&items)
    }

    // --- release ---

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.stage.release(self.worker());
        let items = self.worker().release_mem(self.buffer);
        let count = self.count.release();
        items.and(count)
    }
}

impl<'w, T: Item> WorkState<'w> for ListState<'w, T> {
    fn worker(&self) -> &'w Worker {
        self.count.worker()
    }
}

impl<T: Item> crate::Closable for ListState<'_, T> {
    fn close(self) -> Result<()> {
        ListState::close(self)
    }
}

impl<T: Item> Drop for ListState<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            warn!("ListState<{}> dropped without close, releasing", T::NAME);
            if let Err(e) = self.release() {
                warn!("ListState<{}> release on drop failed: {e}", T::NAME);
            }
        }
    }
}

/// Number of `each`-item records in `len` items, as a device counter value.
fn record_count(len: usize, each: usize) -> Result<i32> {
    i32::try_from(len / each)
        .map_err(|_| Error::invalid(format!("{} records exceed the i32 counter", len / each)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::host::HostPlatform;
    use crate::platform::Platform;
    use std::sync::Arc;

    fn worker() -> Worker {
        let p = Arc::new(HostPlatform::new());
        let d = p.devices().unwrap().remove(0);
        Worker::new(p, d).unwrap()
    }

    #[test]
    fn test_shape() {
        let w = worker();
        let l = ListState::<f32>::new(&w, 100, 3).unwrap();
        assert_eq!(l.total(), 300);
        assert_eq!(l.bytes(), 1200);
        assert_eq!(l.stage().len(), 300);
        assert_eq!(l.item().name, "f32");
        l.close().unwrap();
    }

    #[test]
    fn test_zero_each_is_rejected() {
        let w = worker();
        assert!(matches!(ListState::<i32>::new(&w, 4, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(ListState::<i32>::new(&w, 0, 2), Err(Error::InvalidArgument(_))));
        // Nothing leaked by the failed constructors.
        assert_eq!(w.live_resources().len(), 2);
    }

    #[test]
    fn test_set_items_checks_shape() {
        let w = worker();
        let l = ListState::<i32>::new(&w, 4, 2).unwrap();
        assert!(matches!(l.set_items(&[1, 2, 3]), Err(Error::ShapeMismatch { .. })));
        assert!(matches!(l.set_items(&[0; 10]), Err(Error::ShapeMismatch { .. })));
        l.set_items(&[1, 2, 3, 4]).unwrap();
        assert_eq!(l.get_count().unwrap(), 2);
        assert_eq!(l.get_items().unwrap(), vec![1, 2, 3, 4]);
        l.close().unwrap();
    }

    #[test]
    fn test_stage_mut_then_write_read() {
        let w = worker();
        let l = ListState::<u16>::new(&w, 3, 1).unwrap();
        l.stage_mut().copy_from_slice(&[7, 8, 9]);
        l.write().unwrap();
        l.zero();
        assert_eq!(&*l.stage(), &[0, 0, 0]);
        l.read().unwrap();
        assert_eq!(&*l.stage(), &[7, 8, 9]);
        l.close().unwrap();
    }

    #[test]
    fn test_record_count_does_not_wrap() {
        assert_eq!(record_count(6, 2).unwrap(), 3);
        assert_eq!(record_count(i32::MAX as usize * 2, 2).unwrap(), i32::MAX);
        assert!(matches!(
            record_count(i32::MAX as usize + 1, 1),
            Err(Error::InvalidArgument(_))
        ));
    }
}
