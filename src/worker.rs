// worker.rs — the execution context every state and step is built on.
//
// A worker references one device and owns a context plus an in-order queue
// on it. States and steps borrow the worker (`&'w Worker`), so none of them
// can outlive it; they allocate through the worker's helpers, which record
// every acquisition in the worker's ledger.
//
// LIFECYCLE
//   new / with_config   context over [device], then queue. If the queue
//                       cannot be created the context is released before
//                       the error is returned.
//   from_parts          adopts an existing (device, context, queue).
//   close               releases the queue, then the context. The device is
//                       never released; it belongs to the platform.
//   Drop                same as close for a worker that was not closed,
//                       with a warning.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::error::Result;
use crate::format::PixelFormat;
use crate::ledger::{Ledger, LedgerEvent, LiveResource, ResourceId, ResourceKind};
use crate::platform::{
    ContextId, Device, KernelArg, KernelId, MemId, NdRange, Platform, ProgramId, QueueId,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Worker options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Upper bound for `default_local_size`.
    pub local_size_cap: usize,
    /// Record every acquire/release in order, see [`Worker::journal`].
    pub journal: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            local_size_cap: 512,
            journal: false,
        }
    }
}

impl WorkerConfig {
    pub fn local_size_cap(mut self, cap: usize) -> Self {
        self.local_size_cap = cap;
        self
    }

    pub fn journal(mut self, on: bool) -> Self {
        self.journal = on;
        self
    }
}

// ---------------------------------------------------------------------------
// Tracked handles
// ---------------------------------------------------------------------------

/// A platform handle together with its ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tracked<H> {
    pub handle: H,
    pub resource: ResourceId,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    platform: Arc<dyn Platform>,
    /// Always exactly one device.
    devices: Vec<Device>,
    context: Tracked<ContextId>,
    queue: Tracked<QueueId>,
    config: WorkerConfig,
    ledger: Mutex<Ledger>,
    released: bool,
}

impl Worker {
    pub fn new(platform: Arc<dyn Platform>, device: Device) -> Result<Self> {
        Self::with_config(platform, device, WorkerConfig::default())
    }

    pub fn with_config(
        platform: Arc<dyn Platform>,
        device: Device,
        config: WorkerConfig,
    ) -> Result<Self> {
        let context = platform.create_context(&[device.id])?;
        let queue = match platform.create_queue(context, device.id) {
            Ok(q) => q,
            Err(e) => {
                if let Err(re) = platform.release_context(context) {
                    warn!("releasing {context} after failed queue creation: {re}");
                }
                return Err(e);
            }
        };
        info!("worker on {} via {}: {context}, {queue}", device, platform.name());
        Ok(Self::adopt(platform, device, context, queue, config))
    }

    /// Adopt an existing context and queue created on `device`. The worker
    /// takes ownership of both and releases them on close.
    pub fn from_parts(
        platform: Arc<dyn Platform>,
        device: Device,
        context: ContextId,
        queue: QueueId,
    ) -> Self {
        debug!("worker on {device} adopting {context}, {queue}");
        Self::adopt(platform, device, context, queue, WorkerConfig::default())
    }

    fn adopt(
        platform: Arc<dyn Platform>,
        device: Device,
        context: ContextId,
        queue: QueueId,
        config: WorkerConfig,
    ) -> Self {
        let mut ledger = Ledger::new(config.journal);
        let context = Tracked {
            handle: context,
            resource: ledger.acquire(ResourceKind::Context, 0),
        };
        let queue = Tracked {
            handle: queue,
            resource: ledger.acquire(ResourceKind::Queue, 0),
        };
        Worker {
            platform,
            devices: vec![device],
            context,
            queue,
            config,
            ledger: Mutex::new(ledger),
            released: false,
        }
    }

    // --- accessors ---

    /// Display name of the device.
    pub fn name(&self) -> &str {
        &self.devices[0].name
    }

    pub fn device(&self) -> &Device {
        &self.devices[0]
    }

    /// The worker's device as a one-element slice, the shape program
    /// creation expects.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn context(&self) -> ContextId {
        self.context.handle
    }

    pub fn queue(&self) -> QueueId {
        self.queue.handle
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    // --- queue ---

    pub fn barrier(&self) -> Result<()> {
        self.platform.barrier(self.queue.handle)
    }

    /// Block until everything enqueued so far has completed.
    pub fn finish(&self) -> Result<()> {
        self.platform.finish(self.queue.handle)
    }

    // --- local work size ---

    pub fn max_local_size(&self) -> usize {
        self.devices[0].max_work_group_size
    }

    /// `min(local_size_cap, max_local_size)`, never below one.
    pub fn default_local_size(&self) -> usize {
        self.config.local_size_cap.min(self.max_local_size()).max(1)
    }

    /// Round `items` up to a multiple of the default local size.
    pub fn pad_global_size(&self, items: usize) -> usize {
        items.next_multiple_of(self.default_local_size())
    }

    // --- ledger ---

    /// Live resources of this worker, its own context and queue included.
    pub fn live_resources(&self) -> Vec<LiveResource> {
        self.ledger().live()
    }

    /// Acquire/release journal; empty unless `WorkerConfig::journal` is set.
    pub fn journal(&self) -> Vec<LedgerEvent> {
        self.ledger().journal().to_vec()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track(&self, kind: ResourceKind, bytes: usize) -> ResourceId {
        let id = self.ledger().acquire(kind, bytes);
        debug!("{}: acquired {kind} {id} ({bytes} bytes)", self.name());
        id
    }

    pub(crate) fn untrack(&self, id: ResourceId) {
        if self.ledger().release(id) {
            debug!("{}: released {id}", self.name());
        } else {
            warn!("{}: {id} released but not live", self.name());
        }
    }

    // --- allocation helpers for states and steps ---

    pub(crate) fn create_buffer(&self, bytes: usize) -> Result<Tracked<MemId>> {
        let handle = self.platform.create_buffer(self.context.handle, bytes)?;
        Ok(Tracked {
            handle,
            resource: self.track(ResourceKind::Buffer, bytes),
        })
    }

    pub(crate) fn create_image(
        &self,
        format: PixelFormat,
        nx: usize,
        ny: usize,
    ) -> Result<Tracked<MemId>> {
        let handle = self.platform.create_image(self.context.handle, format, nx, ny)?;
        Ok(Tracked {
            handle,
            resource: self.track(ResourceKind::Image, nx * ny * format.bytes_per_pixel()),
        })
    }

    pub(crate) fn release_mem(&self, mem: Tracked<MemId>) -> Result<()> {
        self.untrack(mem.resource);
        self.platform.release_mem(mem.handle)
    }

    pub(crate) fn create_program(&self, source: &str) -> Result<Tracked<ProgramId>> {
        let handle = self
            .platform
            .create_program(self.context.handle, &self.device_ids(), source)?;
        Ok(Tracked {
            handle,
            resource: self.track(ResourceKind::Program, 0),
        })
    }

    pub(crate) fn build_program(&self, program: ProgramId, options: &str) -> Result<()> {
        self.platform.build_program(program, &self.device_ids(), options)
    }

    pub(crate) fn release_program(&self, program: Tracked<ProgramId>) -> Result<()> {
        self.untrack(program.resource);
        self.platform.release_program(program.handle)
    }

    pub(crate) fn create_kernel(&self, program: ProgramId, name: &str) -> Result<Tracked<KernelId>> {
        let handle = self.platform.create_kernel(program, name)?;
        Ok(Tracked {
            handle,
            resource: self.track(ResourceKind::Kernel, 0),
        })
    }

    pub(crate) fn release_kernel(&self, kernel: Tracked<KernelId>) -> Result<()> {
        self.untrack(kernel.resource);
        self.platform.release_kernel(kernel.handle)
    }

    // --- transfers on the worker's queue ---

    pub(crate) fn write_buffer(&self, mem: MemId, offset: usize, data: &[u8]) -> Result<()> {
        self.platform.write_buffer(self.queue.handle, mem, offset, data)
    }

    pub(crate) fn read_buffer(&self, mem: MemId, offset: usize, out: &mut [u8]) -> Result<()> {
        self.platform.read_buffer(self.queue.handle, mem, offset, out)
    }

    pub(crate) fn copy_buffer(&self, src: MemId, dst: MemId, bytes: usize) -> Result<()> {
        self.platform.copy_buffer(self.queue.handle, src, dst, bytes)
    }

    pub(crate) fn write_image(&self, image: MemId, data: &[u8]) -> Result<()> {
        self.platform.write_image(self.queue.handle, image, data)
    }

    pub(crate) fn read_image(&self, image: MemId, out: &mut [u8]) -> Result<()> {
        self.platform.read_image(self.queue.handle, image, out)
    }

    pub(crate) fn enqueue_kernel(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        range: NdRange,
    ) -> Result<()> {
        self.platform.enqueue_kernel(self.queue.handle, kernel, args, range)
    }

    fn device_ids(&self) -> Vec<crate::platform::DeviceId> {
        self.devices.iter().map(|d| d.id).collect()
    }

    // --- release ---

    /// Release the queue, then the context. Both are attempted; the first
    /// error is returned.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let leftover = self.ledger().live().len().saturating_sub(2);
        if leftover > 0 {
            warn!("{}: closing with {leftover} state/step resource(s) still live", self.name());
        }

        let queue = self.platform.release_queue(self.queue.handle);
        self.untrack(self.queue.resource);
        let context = self.platform.release_context(self.context.handle);
        self.untrack(self.context.resource);
        debug!("{}: worker closed", self.name());
        queue.and(context)
    }
}

impl crate::Closable for Worker {
    fn close(self) -> Result<()> {
        Worker::close(self)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("{}: worker dropped without close, releasing", self.name());
        if let Err(e) = self.release() {
            warn!("{}: release on drop failed: {e}", self.name());
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("device", &self.devices[0])
            .field("platform", &self.platform.name())
            .field("context", &self.context.handle)
            .field("queue", &self.queue.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::host::{HostDevice, HostPlatform};

    fn host(max: usize) -> (Arc<HostPlatform>, Device) {
        let p = Arc::new(
            HostPlatform::builder()
                .device(HostDevice::new("cpu").max_work_group_size(max))
                .build(),
        );
        let d = p.devices().unwrap().remove(0);
        (p, d)
    }

    #[test]
    fn test_local_sizes() {
        let (p, d) = host(1024);
        let w = Worker::new(p, d).unwrap();
        assert_eq!(w.max_local_size(), 1024);
        assert_eq!(w.default_local_size(), 512);
        assert_eq!(w.pad_global_size(1), 512);
        assert_eq!(w.pad_global_size(512), 512);
        assert_eq!(w.pad_global_size(513), 1024);
        w.close().unwrap();
    }

    #[test]
    fn test_pad_without_power_of_two() {
        let (p, d) = host(384);
        let w = Worker::new(p, d).unwrap();
        assert_eq!(w.default_local_size(), 384);
        assert_eq!(w.pad_global_size(385), 768);
        assert_eq!(w.pad_global_size(0), 0);
        w.close().unwrap();
    }

    #[test]
    fn test_ledger_tracks_context_and_queue() {
        let (p, d) = host(256);
        let w = Worker::with_config(p.clone(), d, WorkerConfig::default().journal(true)).unwrap();
        let kinds: Vec<_> = w.live_resources().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::Context, ResourceKind::Queue]);
        w.close().unwrap();
        assert_eq!(p.live_contexts(), 0);
        assert_eq!(p.live_queues(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let (p, d) = host(256);
        {
            let _w = Worker::new(p.clone(), d).unwrap();
            assert_eq!(p.live_queues(), 1);
        }
        assert_eq!(p.live_queues(), 0);
        assert_eq!(p.live_contexts(), 0);
    }
}
