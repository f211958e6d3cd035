// platform/gpu.rs — wgpu implementation of the platform API.
//
// MAPPING
//   device   — a wgpu adapter, enumerated once when the platform is created.
//   context  — a wgpu Device/Queue pair requested from one adapter.
//   queue    — a view of the context's wgpu queue. wgpu queues are already
//              in-order, so several queue handles on one context simply
//              share it.
//   mem      — a storage buffer, or a 2D texture for images.
//   program  — a WGSL shader module.
//   kernel   — a compute pipeline with an automatically derived layout.
//
// KERNEL ARGUMENTS
// Arguments map to bind group 0 in order: argument i is binding i. Buffers
// are bound as storage buffers, images as texture views, scalars as 16-byte
// uniform buffers holding the value in their first four bytes.
//
// WORKGROUP SIZES
// Programs are parsed with naga to find their compute entry points and
// pipeline-overridable constants.
// A program that declares `override WORKGROUP_X` (and `WORKGROUP_Y`) gets
// the active profile's `WorkgroupSize` injected through
// `PipelineCompilationOptions::constants`, and launches are divided into
// workgroups of that size. A program without the overrides is assumed to
// use `@workgroup_size(1)` and is dispatched one workgroup per work item.
//
// DEVICE LIMITS
// A non-Native profile requests *lower* limits than the hardware supports,
// so dispatches that would fail on the target board fail here as well.
//
// BLOCKING TRANSFERS
// Writes go through `Queue::write_buffer`/`write_texture` followed by an
// empty submit and `poll(Maintain::Wait)`. Reads copy into a MAP_READ
// staging buffer and wait for the map callback.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use wgpu::util::DeviceExt;

use super::{
    ContextId, Device, DeviceId, HandleTable, KernelArg, KernelId, MemId, NdRange,
    Platform, ProgramId, QueueId,
};
use crate::error::{Error, Result};
use crate::format::{ChannelOrder, ChannelType, PixelFormat};

// ---------------------------------------------------------------------------
// Profile and workgroup size
// ---------------------------------------------------------------------------

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits.
    #[default]
    Native,
    /// Simulate Raspberry Pi 4/5 (VideoCore VI/VII, V3DV Vulkan): 256
    /// invocations per workgroup, 4096² textures.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// A 2D workgroup configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Override constants for `PipelineCompilationOptions`.
    pub fn as_constants(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("WORKGROUP_X".to_string(), self.x as f64),
            ("WORKGROUP_Y".to_string(), self.y as f64),
        ])
    }

    /// Default for a profile. 16×8 lines up with 32-wide warps and 64-wide
    /// wavefronts; 8×8 leaves headroom under the V3DV 256 limit.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for [`GpuPlatform::with_config`].
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub profile: DeviceProfile,
    pub backends: wgpu::Backends,
    /// Workgroup size override; `None` uses the profile default.
    pub workgroup: Option<WorkgroupSize>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            profile: DeviceProfile::Native,
            backends: wgpu::Backends::VULKAN,
            workgroup: None,
        }
    }
}

impl GpuConfig {
    pub fn profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn backends(mut self, backends: wgpu::Backends) -> Self {
        self.backends = backends;
        self
    }

    pub fn workgroup(mut self, x: u32, y: u32) -> Self {
        self.workgroup = Some(WorkgroupSize { x, y });
        self
    }
}

// ---------------------------------------------------------------------------
// Limits helpers
// ---------------------------------------------------------------------------

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::RaspberryPi => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    limits_for_profile(profile).max_compute_invocations_per_workgroup
}

/// Round `value` up to the next multiple of `alignment`.
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Native texture format for a pixel format. Three-channel formats have no
/// wgpu equivalent.
fn texture_format(format: PixelFormat) -> Result<wgpu::TextureFormat> {
    use wgpu::TextureFormat as T;
    use ChannelOrder::*;
    use ChannelType::*;

    let f = match (format.order, format.channel) {
        (Intensity, U8) => T::R8Uint,
        (Intensity, U16) => T::R16Uint,
        (Intensity, U32) => T::R32Uint,
        (Intensity, I8) => T::R8Sint,
        (Intensity, I16) => T::R16Sint,
        (Intensity, I32) => T::R32Sint,
        (Intensity, F32) => T::R32Float,
        (Rg, U8) => T::Rg8Uint,
        (Rg, U16) => T::Rg16Uint,
        (Rg, U32) => T::Rg32Uint,
        (Rg, I8) => T::Rg8Sint,
        (Rg, I16) => T::Rg16Sint,
        (Rg, I32) => T::Rg32Sint,
        (Rg, F32) => T::Rg32Float,
        (Rgba, U8) => T::Rgba8Uint,
        (Rgba, U16) => T::Rgba16Uint,
        (Rgba, U32) => T::Rgba32Uint,
        (Rgba, I8) => T::Rgba8Sint,
        (Rgba, I16) => T::Rgba16Sint,
        (Rgba, I32) => T::Rgba32Sint,
        (Rgba, F32) => T::Rgba32Float,
        (Rgb, _) => {
            return Err(Error::Unsupported(format!("{format} images have no wgpu texture format")))
        }
    };
    Ok(f)
}

/// Parse build options of the form `NAME=VALUE` (an OpenCL-style `-D`
/// prefix is accepted) into override constants.
fn parse_options(options: &str) -> Result<HashMap<String, f64>> {
    let mut constants = HashMap::new();
    for token in options.split_whitespace() {
        let token = token.strip_prefix("-D").unwrap_or(token);
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| Error::invalid(format!("build option `{token}` is not NAME=VALUE")))?;
        let value: f64 = value
            .parse()
            .map_err(|_| Error::invalid(format!("build option `{token}` has a non-numeric value")))?;
        constants.insert(name.to_string(), value);
    }
    Ok(constants)
}

/// Workgroup counts covering `range`. Uses ceiling division, so kernels must
/// guard against ids past the end. Fails if a dimension needs more than
/// `max` workgroups.
fn dispatch_counts(
    range: NdRange,
    workgroup: Option<WorkgroupSize>,
    max: u32,
) -> Result<[u32; 3]> {
    let per_group = match workgroup {
        Some(wg) => [wg.x, wg.y, 1],
        None => [1, 1, 1],
    };
    let mut counts = [0u32; 3];
    for (dim, count) in counts.iter_mut().enumerate() {
        let groups = range.global[dim].div_ceil(per_group[dim] as usize);
        *count = u32::try_from(groups)
            .ok()
            .filter(|&g| g <= max)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "{range} needs {groups} workgroups in dimension {dim}, the device allows {max}"
                ))
            })?;
    }
    Ok(counts)
}

/// What a WGSL program exposes to the host.
#[derive(Debug, Default)]
struct Reflection {
    entries: Vec<String>,
    overrides: HashSet<String>,
}

fn reflect(source: &str) -> Result<Reflection> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| Error::Compile {
        log: e.emit_to_string(source),
    })?;
    Ok(Reflection {
        entries: module
            .entry_points
            .iter()
            .filter(|e| e.stage == naga::ShaderStage::Compute)
            .map(|e| e.name.clone())
            .collect(),
        overrides: module.overrides.iter().filter_map(|(_, o)| o.name.clone()).collect(),
    })
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

struct Adapter {
    adapter: wgpu::Adapter,
    info: wgpu::AdapterInfo,
    profile: DeviceProfile,
    workgroup: WorkgroupSize,
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    workgroup: WorkgroupSize,
}

struct ContextEntry {
    devices: Vec<DeviceId>,
    gpu: Arc<GpuContext>,
}

struct QueueEntry {
    context: ContextId,
    gpu: Arc<GpuContext>,
}

enum MemKind {
    Buffer {
        buffer: wgpu::Buffer,
        size: usize,
    },
    Image {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
        format: PixelFormat,
        nx: u32,
        ny: u32,
    },
}

struct MemEntry {
    context: ContextId,
    kind: MemKind,
}

struct ProgramEntry {
    context: ContextId,
    gpu: Arc<GpuContext>,
    reflection: Reflection,
    module: wgpu::ShaderModule,
    constants: Option<HashMap<String, f64>>,
}

impl ProgramEntry {
    fn workgroup(&self) -> Option<WorkgroupSize> {
        self.reflection
            .overrides
            .contains("WORKGROUP_X")
            .then_some(self.gpu.workgroup)
    }
}

struct KernelEntry {
    name: String,
    gpu: Arc<GpuContext>,
    pipeline: wgpu::ComputePipeline,
    workgroup: Option<WorkgroupSize>,
}

struct GpuInner {
    contexts: HandleTable<ContextEntry>,
    queues: HandleTable<QueueEntry>,
    mems: HandleTable<MemEntry>,
    programs: HandleTable<ProgramEntry>,
    kernels: HandleTable<KernelEntry>,
}

impl GpuInner {
    fn mem_on(&self, queue: QueueId, mem: MemId) -> Result<(&Arc<GpuContext>, &MemKind)> {
        let q = self.queues.get(queue.0)?;
        let m = self.mems.get(mem.0)?;
        if m.context != q.context {
            return Err(Error::invalid(format!("{mem} belongs to {}, not {}", m.context, q.context)));
        }
        Ok((&q.gpu, &m.kind))
    }

    fn buffer_on(&self, queue: QueueId, mem: MemId) -> Result<(&Arc<GpuContext>, &wgpu::Buffer, usize)> {
        match self.mem_on(queue, mem)? {
            (gpu, MemKind::Buffer { buffer, size }) => Ok((gpu, buffer, *size)),
            _ => Err(Error::invalid(format!("{mem} is an image, not a buffer"))),
        }
    }
}

// ---------------------------------------------------------------------------
// GpuPlatform
// ---------------------------------------------------------------------------

/// wgpu-backed compute platform.
///
/// Field order matters: `_instance` is declared last so the wgpu instance
/// outlives every device created from it.
pub struct GpuPlatform {
    adapters: Vec<Adapter>,
    inner: Mutex<GpuInner>,
    _instance: wgpu::Instance,
}

impl GpuPlatform {
    pub fn new() -> Result<Self> {
        Self::with_config(GpuConfig::default())
    }

    /// Enumerate adapters for `config.backends`, preferring real hardware
    /// over software renderers.
    pub fn with_config(config: GpuConfig) -> Result<Self> {
        if let Some(wg) = config.workgroup {
            let max = max_invocations_for_profile(config.profile);
            if wg.total() > max {
                return Err(Error::invalid(format!(
                    "workgroup size {} exceeds the {} limit of {max} invocations",
                    wg.total(),
                    config.profile
                )));
            }
        }

        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: config.backends,
            flags,
            ..Default::default()
        });

        let mut all: Vec<wgpu::Adapter> = instance.enumerate_adapters(config.backends);
        for a in &all {
            let info = a.get_info();
            debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }
        // Software renderers only when nothing else exists.
        if all.iter().any(|a| a.get_info().device_type != wgpu::DeviceType::Cpu) {
            all.retain(|a| a.get_info().device_type != wgpu::DeviceType::Cpu);
        }
        if all.is_empty() {
            return Err(Error::Device(format!(
                "no adapter found for backends {:?}",
                config.backends
            )));
        }

        let adapters = all
            .into_iter()
            .map(|adapter| {
                let info = adapter.get_info();
                let profile = match config.profile {
                    DeviceProfile::Native if info.name.to_ascii_lowercase().contains("v3d") => {
                        info!("V3D adapter `{}` detected, using RaspberryPi profile", info.name);
                        DeviceProfile::RaspberryPi
                    }
                    other => other,
                };
                let workgroup = config.workgroup.unwrap_or(WorkgroupSize::for_profile(profile));
                Adapter { adapter, info, profile, workgroup }
            })
            .collect();

        Ok(GpuPlatform {
            adapters,
            inner: Mutex::new(GpuInner {
                contexts: HandleTable::new(ContextId::KIND),
                queues: HandleTable::new(QueueId::KIND),
                mems: HandleTable::new(MemId::KIND),
                programs: HandleTable::new(ProgramId::KIND),
                kernels: HandleTable::new(KernelId::KIND),
            }),
            _instance: instance,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GpuInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adapter(&self, id: DeviceId) -> Result<&Adapter> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|i| self.adapters.get(i))
            .ok_or(Error::UnknownHandle { kind: DeviceId::KIND, id: id.0 })
    }

    /// Profile in effect for `device` after V3D auto-detection.
    pub fn profile(&self, device: DeviceId) -> Result<DeviceProfile> {
        Ok(self.adapter(device)?.profile)
    }
}

fn check_devices(entry: &ContextEntry, context: ContextId, devices: &[DeviceId]) -> Result<()> {
    match devices.iter().find(|d| !entry.devices.contains(d)) {
        Some(d) => Err(Error::invalid(format!("{d} is not part of {context}"))),
        None => Ok(()),
    }
}

fn check_range(mem: MemId, size: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::invalid(format!(
            "{len} bytes at offset {offset} exceed the {size} bytes of {mem}"
        ))),
    }
}

/// Submit an empty batch and wait, so staged writes have landed.
fn flush_writes(gpu: &GpuContext) {
    gpu.queue.submit(std::iter::empty());
    gpu.device.poll(wgpu::Maintain::Wait);
}

/// Wait for `staging` to map and return its contents.
fn map_read(gpu: &GpuContext, staging: &wgpu::Buffer) -> Result<Vec<u8>> {
    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| Error::Transfer("map callback never fired".into()))?
        .map_err(|e| Error::Transfer(e.to_string()))?;
    let data = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

/// Copy `len` bytes at `offset` of `buffer` into host memory. `offset` and
/// `len` must be multiples of four.
fn read_range(gpu: &GpuContext, buffer: &wgpu::Buffer, offset: u64, len: u64) -> Result<Vec<u8>> {
    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("gpuwork::read"),
        size: len,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("gpuwork::read") });
    encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, len);
    gpu.queue.submit(std::iter::once(encoder.finish()));
    map_read(gpu, &staging)
}

/// Run `f` inside a validation error scope and report what it raised.
fn scoped<T>(gpu: &GpuContext, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let err = pollster::block_on(gpu.device.pop_error_scope());
    (value, err)
}

impl Platform for GpuPlatform {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(i, a)| Device {
                id: DeviceId(i as u64 + 1),
                name: a.info.name.clone(),
                max_work_group_size: a
                    .adapter
                    .limits()
                    .max_compute_invocations_per_workgroup
                    .min(max_invocations_for_profile(a.profile)) as usize,
            })
            .collect())
    }

    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        let [device] = devices else {
            return Err(Error::Unsupported(format!(
                "a wgpu context spans exactly one adapter, {} requested",
                devices.len()
            )));
        };
        let a = self.adapter(*device)?;

        let (gpu_device, queue): (wgpu::Device, wgpu::Queue) =
            pollster::block_on(a.adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpuwork"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(a.profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            ))
            .map_err(|e| Error::Device(format!("{}: {e}", a.info.name)))?;

        gpu_device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            error!("uncaptured wgpu error: {e}");
        }));

        let id = ContextId(self.lock().contexts.insert(ContextEntry {
            devices: vec![*device],
            gpu: Arc::new(GpuContext {
                device: gpu_device,
                queue,
                workgroup: a.workgroup,
            }),
        }));
        info!(
            "created {id} on {} ({:?}), profile {}, workgroup {}",
            a.info.name, a.info.backend, a.profile, a.workgroup
        );
        Ok(id)
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let mut inner = self.lock();
        let ctx = inner.contexts.get(context.0)?;
        check_devices(ctx, context, &[device])?;
        let gpu = Arc::clone(&ctx.gpu);
        let id = QueueId(inner.queues.insert(QueueEntry { context, gpu }));
        debug!("created {id} on {context}");
        Ok(id)
    }

    fn release_queue(&self, queue: QueueId) -> Result<()> {
        let entry = self.lock().queues.remove(queue.0)?;
        entry.gpu.device.poll(wgpu::Maintain::Wait);
        debug!("released {queue}");
        Ok(())
    }

    fn release_context(&self, context: ContextId) -> Result<()> {
        let mut inner = self.lock();
        inner.contexts.remove(context.0)?;
        let alive = inner.queues.values().filter(|q| q.context == context).count()
            + inner.mems.values().filter(|m| m.context == context).count()
            + inner.programs.values().filter(|p| p.context == context).count();
        if alive > 0 {
            warn!("released {context} with {alive} object(s) still alive");
        } else {
            debug!("released {context}");
        }
        Ok(())
    }

    fn create_buffer(&self, context: ContextId, bytes: usize) -> Result<MemId> {
        if bytes == 0 {
            return Err(Error::invalid("buffer size must be positive"));
        }
        let mut inner = self.lock();
        let ctx = inner.contexts.get(context.0)?;
        let (buffer, err) = scoped(&ctx.gpu, || {
            ctx.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("gpuwork::buffer"),
                size: align_to(bytes as u64, wgpu::COPY_BUFFER_ALIGNMENT),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if let Some(e) = err {
            return Err(Error::Device(e.to_string()));
        }
        let id = MemId(inner.mems.insert(MemEntry {
            context,
            kind: MemKind::Buffer { buffer, size: bytes },
        }));
        debug!("created {id}: buffer of {bytes} bytes");
        Ok(id)
    }

    fn create_image(
        &self,
        context: ContextId,
        format: PixelFormat,
        nx: usize,
        ny: usize,
    ) -> Result<MemId> {
        if nx == 0 || ny == 0 {
            return Err(Error::invalid(format!("image dimensions {nx}×{ny} must be positive")));
        }
        let texture_format = texture_format(format)?;
        let (nx, ny) = (nx as u32, ny as u32);

        let mut inner = self.lock();
        let ctx = inner.contexts.get(context.0)?;
        let (texture, err) = scoped(&ctx.gpu, || {
            ctx.gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("gpuwork::image"),
                size: wgpu::Extent3d { width: nx, height: ny, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        });
        if let Some(e) = err {
            return Err(Error::Device(e.to_string()));
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = MemId(inner.mems.insert(MemEntry {
            context,
            kind: MemKind::Image { texture, view, format, nx, ny },
        }));
        debug!("created {id}: {nx}×{ny} {format} image ({texture_format:?})");
        Ok(id)
    }

    fn mem_size(&self, mem: MemId) -> Result<usize> {
        Ok(match &self.lock().mems.get(mem.0)?.kind {
            MemKind::Buffer { size, .. } => *size,
            MemKind::Image { format, nx, ny, .. } => {
                *nx as usize * *ny as usize * format.bytes_per_pixel()
            }
        })
    }

    fn write_buffer(&self, queue: QueueId, mem: MemId, offset: usize, data: &[u8]) -> Result<()> {
        let inner = self.lock();
        let (gpu, buffer, size) = inner.buffer_on(queue, mem)?;
        check_range(mem, size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        // write_buffer wants 4-byte aligned offsets and sizes; patch the
        // covering aligned range otherwise.
        let start = offset as u64 & !(wgpu::COPY_BUFFER_ALIGNMENT - 1);
        let end = align_to((offset + data.len()) as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        if start == offset as u64 && end == (offset + data.len()) as u64 {
            gpu.queue.write_buffer(buffer, start, data);
        } else {
            let mut chunk = read_range(gpu, buffer, start, end - start)?;
            let at = offset - start as usize;
            chunk[at..at + data.len()].copy_from_slice(data);
            gpu.queue.write_buffer(buffer, start, &chunk);
        }
        flush_writes(gpu);
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: usize, out: &mut [u8]) -> Result<()> {
        let inner = self.lock();
        let (gpu, buffer, size) = inner.buffer_on(queue, mem)?;
        check_range(mem, size, offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        let start = offset as u64 & !(wgpu::COPY_BUFFER_ALIGNMENT - 1);
        let end = align_to((offset + out.len()) as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let chunk = read_range(gpu, buffer, start, end - start)?;
        let at = offset - start as usize;
        out.copy_from_slice(&chunk[at..at + out.len()]);
        Ok(())
    }

    fn copy_buffer(&self, queue: QueueId, src: MemId, dst: MemId, bytes: usize) -> Result<()> {
        let inner = self.lock();
        let (gpu, from, from_size) = inner.buffer_on(queue, src)?;
        let (_, to, to_size) = inner.buffer_on(queue, dst)?;
        check_range(src, from_size, 0, bytes)?;
        check_range(dst, to_size, 0, bytes)?;

        // Both allocations are padded to four bytes, so the rounded copy
        // stays inside them.
        let len = align_to(bytes as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("gpuwork::copy") });
        encoder.copy_buffer_to_buffer(from, 0, to, 0, len);
        gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn write_image(&self, queue: QueueId, image: MemId, data: &[u8]) -> Result<()> {
        let inner = self.lock();
        let (gpu, kind) = inner.mem_on(queue, image)?;
        let MemKind::Image { texture, format, nx, ny, .. } = kind else {
            return Err(Error::invalid(format!("{image} is a buffer, not an image")));
        };
        let row = *nx as usize * format.bytes_per_pixel();
        let expected = row * *ny as usize;
        if data.len() != expected {
            return Err(Error::shape(
                format!("{nx}×{ny} {format} ({expected} bytes)"),
                format!("{} bytes", data.len()),
            ));
        }

        gpu.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(row as u32),
                rows_per_image: Some(*ny),
            },
            wgpu::Extent3d { width: *nx, height: *ny, depth_or_array_layers: 1 },
        );
        flush_writes(gpu);
        Ok(())
    }

    fn read_image(&self, queue: QueueId, image: MemId, out: &mut [u8]) -> Result<()> {
        let inner = self.lock();
        let (gpu, kind) = inner.mem_on(queue, image)?;
        let MemKind::Image { texture, format, nx, ny, .. } = kind else {
            return Err(Error::invalid(format!("{image} is a buffer, not an image")));
        };
        let row = *nx as usize * format.bytes_per_pixel();
        let expected = row * *ny as usize;
        if out.len() != expected {
            return Err(Error::shape(
                format!("{nx}×{ny} {format} ({expected} bytes)"),
                format!("{} bytes", out.len()),
            ));
        }

        // Rows in the staging buffer are padded to 256 bytes.
        let aligned_row = align_to(row as u64, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64);
        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpuwork::read_image"),
            size: aligned_row * *ny as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("gpuwork::read_image"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_row as u32),
                    rows_per_image: Some(*ny),
                },
            },
            wgpu::Extent3d { width: *nx, height: *ny, depth_or_array_layers: 1 },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let mapped = map_read(gpu, &staging)?;
        for (y, dst) in out.chunks_exact_mut(row).enumerate() {
            let at = y * aligned_row as usize;
            dst.copy_from_slice(&mapped[at..at + row]);
        }
        Ok(())
    }

    fn release_mem(&self, mem: MemId) -> Result<()> {
        let entry = self.lock().mems.remove(mem.0)?;
        match entry.kind {
            MemKind::Buffer { buffer, .. } => buffer.destroy(),
            MemKind::Image { texture, .. } => texture.destroy(),
        }
        debug!("released {mem}");
        Ok(())
    }

    fn create_program(
        &self,
        context: ContextId,
        devices: &[DeviceId],
        source: &str,
    ) -> Result<ProgramId> {
        let mut inner = self.lock();
        let ctx = inner.contexts.get(context.0)?;
        check_devices(ctx, context, devices)?;
        let gpu = Arc::clone(&ctx.gpu);
        let reflection = reflect(source)?;

        let (module, err) = scoped(&gpu, || {
            gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("gpuwork::program"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        if let Some(e) = err {
            return Err(Error::Compile { log: e.to_string() });
        }

        let id = ProgramId(inner.programs.insert(ProgramEntry {
            context,
            gpu,
            reflection,
            module,
            constants: None,
        }));
        debug!("created {id}");
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, devices: &[DeviceId], options: &str) -> Result<()> {
        let mut inner = self.lock();
        let context = inner.programs.get(program.0)?.context;
        check_devices(inner.contexts.get(context.0)?, context, devices)?;

        let mut constants = parse_options(options)?;
        let p = inner.programs.get_mut(program.0)?;
        if let Some(wg) = p.workgroup() {
            constants.extend(wg.as_constants());
            if !p.reflection.overrides.contains("WORKGROUP_Y") {
                constants.remove("WORKGROUP_Y");
            }
        }
        debug!("built {program} with constants {constants:?}");
        p.constants = Some(constants);
        Ok(())
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut inner = self.lock();
        let p = inner.programs.get(program.0)?;
        let Some(constants) = &p.constants else {
            return Err(Error::InvalidState {
                op: "create_kernel",
                state: "the program is not built",
            });
        };
        if !p.reflection.entries.iter().any(|e| e == name) {
            return Err(Error::KernelNotFound { name: name.to_string() });
        }

        let (pipeline, err) = scoped(&p.gpu, || {
            p.gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: None,
                module: &p.module,
                entry_point: Some(name),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants,
                    ..Default::default()
                },
                cache: None,
            })
        });
        if let Some(e) = err {
            return Err(Error::Compile { log: e.to_string() });
        }

        let entry = KernelEntry {
            name: name.to_string(),
            gpu: Arc::clone(&p.gpu),
            pipeline,
            workgroup: p.workgroup(),
        };
        let id = KernelId(inner.kernels.insert(entry));
        debug!("created {id} `{name}` from {program}");
        Ok(id)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        args: &[KernelArg],
        range: NdRange,
    ) -> Result<()> {
        let inner = self.lock();
        let k = inner.kernels.get(kernel.0)?;
        let gpu = &inner.queues.get(queue.0)?.gpu;
        if !Arc::ptr_eq(gpu, &k.gpu) {
            return Err(Error::invalid(format!("{kernel} and {queue} live in different contexts")));
        }

        let scalar = |bytes: [u8; 4]| {
            let mut contents = [0u8; 16];
            contents[..4].copy_from_slice(&bytes);
            gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("gpuwork::scalar"),
                contents: &contents,
                usage: wgpu::BufferUsages::UNIFORM,
            })
        };

        // Scalars need their own buffers, created before the entries borrow
        // them.
        let mut uniforms: HashMap<usize, wgpu::Buffer> = HashMap::new();
        for (i, arg) in args.iter().enumerate() {
            let bytes = match *arg {
                KernelArg::Mem(_) => continue,
                KernelArg::Int(v) => v.to_le_bytes(),
                KernelArg::Uint(v) => v.to_le_bytes(),
                KernelArg::Float(v) => v.to_le_bytes(),
            };
            uniforms.insert(i, scalar(bytes));
        }

        let mut entries = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let resource = match arg {
                KernelArg::Mem(mem) => match inner.mem_on(queue, *mem)?.1 {
                    MemKind::Buffer { buffer, .. } => buffer.as_entire_binding(),
                    MemKind::Image { view, .. } => wgpu::BindingResource::TextureView(view),
                },
                _ => match uniforms.get(&i) {
                    Some(buffer) => buffer.as_entire_binding(),
                    None => return Err(Error::invalid(format!("scalar argument {i} has no buffer"))),
                },
            };
            entries.push(wgpu::BindGroupEntry { binding: i as u32, resource });
        }

        let layout = k.pipeline.get_bind_group_layout(0);
        let (bind_group, err) = scoped(gpu, || {
            gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(k.name.as_str()),
                layout: &layout,
                entries: &entries,
            })
        });
        if let Some(e) = err {
            return Err(Error::invalid(format!("arguments of `{}`: {e}", k.name)));
        }

        let max = gpu.device.limits().max_compute_workgroups_per_dimension;
        let [wx, wy, wz] = dispatch_counts(range, k.workgroup, max)?;
        let ((), err) = scoped(gpu, || {
            let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(k.name.as_str()),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(k.name.as_str()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&k.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(wx, wy, wz);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()));
        });
        match err {
            Some(e) => Err(Error::Device(format!("launching `{}` over {range}: {e}", k.name))),
            None => Ok(()),
        }
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<()> {
        self.lock().kernels.remove(kernel.0)?;
        debug!("released {kernel}");
        Ok(())
    }

    fn release_program(&self, program: ProgramId) -> Result<()> {
        self.lock().programs.remove(program.0)?;
        debug!("released {program}");
        Ok(())
    }

    fn barrier(&self, queue: QueueId) -> Result<()> {
        // Submissions on a wgpu queue already execute in order.
        self.lock().queues.get(queue.0)?;
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let inner = self.lock();
        inner.queues.get(queue.0)?.gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
