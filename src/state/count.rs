// state/count.rs — a single device-side i32 counter.
//
// Kernels that append to a list bump this counter atomically; the host
// resets it before a launch and reads it back afterwards. `size` is the
// capacity of the list the counter belongs to. The device value is allowed
// to run past it (every candidate is counted, only `size` are stored), so
// `get_count` returns the raw value and `valid_count` the clamped one.

use log::warn;

use super::stage::Stage;
use super::WorkState;
use crate::error::{Error, Result};
use crate::platform::MemId;
use crate::worker::{Tracked, Worker};

pub struct CountState<'w> {
    worker: &'w Worker,
    size: u32,
    buffer: Tracked<MemId>,
    stage: Stage<i32>,
    released: bool,
}

impl<'w> CountState<'w> {
    /// Allocate the counter buffer and its staging cell. `size` must be
    /// positive.
    pub fn new(worker: &'w Worker, size: u32) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("count size must be positive"));
        }
        let buffer = worker.create_buffer(std::mem::size_of::<i32>())?;
        let stage = Stage::new(worker, 1);
        Ok(CountState {
            worker,
            size,
            buffer,
            stage,
            released: false,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Device buffer holding the counter, for binding as a kernel argument.
    pub fn mem(&self) -> MemId {
        self.buffer.handle
    }

    /// Blocking write of `value` to the device counter.
    pub fn set_count(&self, value: i32) -> Result<()> {
        self.stage.borrow_mut()[0] = value;
        self.stage.upload(self.worker, self.buffer.handle, 1)
    }

    /// Blocking read of the device counter. Waits for every command
    /// enqueued before it on the worker's queue.
    pub fn get_count(&self) -> Result<i32> {
        self.stage.download(self.worker, self.buffer.handle, 1)?;
        Ok(self.stage.borrow()[0])
    }

    /// `get_count` clamped to `0..=size`: how many list entries are valid.
    pub fn valid_count(&self) -> Result<usize> {
        let count = self.get_count()?;
        Ok(count.clamp(0, self.size.min(i32::MAX as u32) as i32) as usize)
    }

    /// Release the staging cell, then the device buffer.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    pub(crate) fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.stage.release(self.worker);
        self.worker.release_mem(self.buffer)
    }
}

impl<'w> WorkState<'w> for CountState<'w> {
    fn worker(&self) -> &'w Worker {
        self.worker
    }
}

impl crate::Closable for CountState<'_> {
    fn close(self) -> Result<()> {
        CountState::close(self)
    }
}

impl Drop for CountState<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("CountState dropped without close, releasing");
            if let Err(e) = self.release() {
                warn!("CountState release on drop failed: {e}");
            }
        }
    }
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
    fn test_zero_size_is_rejected() {
        let w = worker();
        assert!(matches!(CountState::new(&w, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_round_trip() {
        let w = worker();
        let c = CountState::new(&w, 10).unwrap();
        assert_eq!(c.get_count().unwrap(), 0);
        for v in [0, 1, -1, 42, i32::MAX, i32::MIN] {
            c.set_count(v).unwrap();
            assert_eq!(c.get_count().unwrap(), v);
        }
        c.close().unwrap();
    }

    #[test]
    fn test_valid_count_clamps() {
        let w = worker();
        let c = CountState::new(&w, 10).unwrap();
        c.set_count(25).unwrap();
        assert_eq!(c.get_count().unwrap(), 25);
        assert_eq!(c.valid_count().unwrap(), 10);
        c.set_count(-3).unwrap();
        assert_eq!(c.valid_count().unwrap(), 0);
        c.close().unwrap();
    }
}
