// platform/mod.rs — the device API every worker, state and step talks to.
//
// The `Platform` trait is deliberately shaped like a C compute API: objects
// are plain integer handles, created and released explicitly. Ownership is
// layered on top by `Worker`, the states and the steps; the platform itself
// only issues handles, tombstones released ones, and reports misuse.
//
// Two implementations ship with the crate:
//
//   host  — an in-process device. Queue commands are deferred until a
//           synchronisation point, kernels are native Rust functions looked
//           up by entry-point name. Used by the test-suite and anywhere a
//           GPU is not available.
//
//   gpu   — wgpu. Adapters are devices, a context is a wgpu device/queue
//           pair, programs are WGSL modules, kernels are compute pipelines.
//
// TRANSFER SEMANTICS
// All buffer/image reads and writes are blocking: they return once the data
// is visible on the other side and every command enqueued before them on
// the same queue has completed. Kernel launches and buffer copies are only
// enqueued. The queue is FIFO; there is no other ordering mechanism.

pub mod gpu;
pub mod host;
mod table;

pub(crate) use table::HandleTable;

use std::fmt;

use crate::error::Result;
use crate::format::PixelFormat;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const KIND: &'static str = $kind;

            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

handle!(
    /// A compute device as enumerated by its platform. Never released.
    DeviceId, "device"
);
handle!(
    /// A context bound to one or more devices.
    ContextId, "context"
);
handle!(
    /// An in-order command queue over one context/device pair.
    QueueId, "queue"
);
handle!(
    /// A device buffer or image.
    MemId, "mem"
);
handle!(
    /// A program created from kernel source.
    ProgramId, "program"
);
handle!(
    /// One entry point materialised from a built program.
    KernelId, "kernel"
);

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// An enumerated compute device.
///
/// Cheap to clone; it carries only the handle and the descriptive fields a
/// worker needs. The platform owns the device itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Largest 1D work-group the device accepts.
    pub max_work_group_size: usize,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

// ---------------------------------------------------------------------------
// Kernel launch description
// ---------------------------------------------------------------------------

/// One kernel argument, bound by position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// A buffer or image.
    Mem(MemId),
    Int(i32),
    Uint(u32),
    Float(f32),
}

/// Global problem size of a launch, in work items per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [usize; 3],
}

impl NdRange {
    pub const fn d1(x: usize) -> Self {
        NdRange { global: [x, 1, 1] }
    }

    pub const fn d2(x: usize, y: usize) -> Self {
        NdRange { global: [x, y, 1] }
    }

    pub const fn d3(x: usize, y: usize, z: usize) -> Self {
        NdRange { global: [x, y, z] }
    }

    /// Total number of work items.
    pub fn items(&self) -> usize {
        self.global.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.items() == 0
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.global;
        write!(f, "{x}×{y}×{z}")
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// A compute platform: device enumeration plus the handle-based device API.
///
/// Implementations are internally synchronised; every method takes `&self`
/// and may be called from any thread. Queue submission is serialised per
/// platform.
pub trait Platform: Send + Sync {
    /// Platform display name, for logs.
    fn name(&self) -> &str;

    /// Every device this platform can create contexts on.
    fn devices(&self) -> Result<Vec<Device>>;

    // --- contexts and queues ---

    /// Create a context over `devices` with default properties.
    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId>;

    /// Create an in-order queue on `device` inside `context`.
    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId>;

    fn release_queue(&self, queue: QueueId) -> Result<()>;

    fn release_context(&self, context: ContextId) -> Result<()>;

    // --- memory ---

    /// Allocate a read/write device buffer of `bytes` bytes, zero-filled.
    fn create_buffer(&self, context: ContextId, bytes: usize) -> Result<MemId>;

    /// Allocate a 2D device image of `nx × ny` pixels, zero-filled.
    fn create_image(
        &self,
        context: ContextId,
        format: PixelFormat,
        nx: usize,
        ny: usize,
    ) -> Result<MemId>;

    /// Byte count requested when `mem` was created.
    fn mem_size(&self, mem: MemId) -> Result<usize>;

    /// Blocking write of `data` into `mem` at byte `offset`.
    fn write_buffer(&self, queue: QueueId, mem: MemId, offset: usize, data: &[u8]) -> Result<()>;

    /// Blocking read of `out.len()` bytes from `mem` at byte `offset`.
    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Enqueue a device-side copy of `bytes` bytes from the start of `src`
    /// to the start of `dst`.
    fn copy_buffer(&self, queue: QueueId, src: MemId, dst: MemId, bytes: usize) -> Result<()>;

    /// Blocking write of a whole image. `data` is tightly packed rows.
    fn write_image(&self, queue: QueueId, image: MemId, data: &[u8]) -> Result<()>;

    /// Blocking read of a whole image into tightly packed rows.
    fn read_image(&self, queue: QueueId, image: MemId, out: &mut [u8]) -> Result<()>;

    fn release_mem(&self, mem: MemId) -> Result<()>;

    // --- programs and kernels ---

    /// Create a program from source text for `devices`. Source that cannot
    /// be compiled is reported as `Error::Compile`.
    fn create_program(&self, context: ContextId, devices: &[DeviceId], source: &str)
        -> Result<ProgramId>;

    /// Target-specific build of a program with compiler `options`.
    fn build_program(&self, program: ProgramId, devices: &[DeviceId], options: &str) -> Result<()>;

    /// Materialise one named entry point of a built program.
    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId>;

    /// Enqueue a kernel launch. Returns before the kernel runs.
    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        args: &[KernelArg],
        range: NdRange,
    ) -> Result<()>;

    fn release_kernel(&self, kernel: KernelId) -> Result<()>;

    fn release_program(&self, program: ProgramId) -> Result<()>;

    // --- synchronisation ---

    /// Enqueue a barrier: later commands start after earlier ones finish.
    fn barrier(&self, queue: QueueId) -> Result<()>;

    /// Block until every command enqueued on `queue` has completed.
    fn finish(&self, queue: QueueId) -> Result<()>;
}
