// gpuwork: GPU work scheduling with explicit resource lifecycles
//
// A `Worker` owns one device context and one in-order queue. Work states
// (`CountState`, `ListState`, `ImageState`) hold device memory with host
// staging, and work steps (`SimpleStep`, `PreFastStep`) bind compiled
// kernels to those states. Every object is released exactly once, in
// reverse order of acquisition, either through `close` or on drop.
//
// Two platforms implement the `Platform` seam: `HostPlatform`, which runs
// registered native kernels on the CPU, and `GpuPlatform` on wgpu.

pub mod error;
pub mod format;
pub mod image;
pub mod ledger;
pub mod platform;
pub mod source;
pub mod state;
pub mod step;
pub mod worker;

pub use error::{Error, Result};
pub use format::{ChannelOrder, ChannelType, PixelFormat};
pub use image::{Image, Pixel};
pub use ledger::{LiveResource, ResourceId, ResourceKind};
pub use platform::gpu::{GpuConfig, GpuPlatform};
pub use platform::host::HostPlatform;
pub use platform::{Device, KernelArg, NdRange, Platform};
pub use source::{DirSources, EmbeddedSources, SourceLoader};
pub use state::{CountState, ImageState, Item, ListState, WorkState};
pub use step::{PreFastStep, SimpleStep, StepState, WorkStep};
pub use worker::{Worker, WorkerConfig};

/// Explicit, fallible release.
///
/// Everything that holds platform objects implements this. Dropping an
/// unclosed object still releases it, but logs a warning and discards any
/// release error.
pub trait Closable {
    fn close(self) -> Result<()>;
}
