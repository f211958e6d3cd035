// platform/host/mod.rs — in-process compute device.
//
// The host platform implements the full handle API without a GPU:
//
//   - Memory objects are byte vectors owned by the platform.
//   - Kernel launches, buffer copies and barriers are appended to the
//     queue's pending list and only executed at a synchronisation point
//     (a blocking transfer, `finish`, or queue release). FIFO ordering is
//     therefore observable: a read after `enqueue_kernel` sees the kernel's
//     writes, and `pending()` shows what has not run yet.
//   - Programs are validated structurally (see `compile.rs`) and kernels
//     resolve to native Rust functions registered under the entry-point
//     name (see `native.rs`).
//   - Devices can be told to refuse contexts or queues, so error paths of
//     the worker constructor can be driven from tests.
//
// Every released handle is tombstoned; using or releasing it again is an
// error rather than a silent no-op. Releasing a mem object, kernel or program
// first drains the queues of its context, so commands enqueued before the
// release still see it.

pub(crate) mod compile;
mod native;

pub use native::{Invocation, MemShape, NativeFn, NativeKernel};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use super::{
    ContextId, Device, DeviceId, HandleTable, KernelArg, KernelId, MemId, NdRange, Platform,
    ProgramId, QueueId,
};
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use native::Bound;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Description of one host device.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    max_work_group_size: usize,
    refuse_contexts: bool,
    refuse_queues: bool,
}

impl HostDevice {
    pub fn new(name: impl Into<String>) -> Self {
        HostDevice {
            name: name.into(),
            max_work_group_size: 1024,
            refuse_contexts: false,
            refuse_queues: false,
        }
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    /// Make `create_context` fail for this device.
    pub fn refuse_contexts(mut self) -> Self {
        self.refuse_contexts = true;
        self
    }

    /// Make `create_queue` fail for this device.
    pub fn refuse_queues(mut self) -> Self {
        self.refuse_queues = true;
        self
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        HostDevice::new("host")
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`HostPlatform`].
pub struct HostPlatformBuilder {
    devices: Vec<HostDevice>,
    kernels: HashMap<String, NativeKernel>,
}

impl HostPlatformBuilder {
    pub fn device(mut self, device: HostDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Register a native kernel under `name`. Replaces a builtin of the
    /// same name.
    pub fn kernel<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(body));
        self
    }

    pub fn build(self) -> HostPlatform {
        let devices = if self.devices.is_empty() {
            vec![HostDevice::default()]
        } else {
            self.devices
        };
        HostPlatform {
            devices,
            natives: self.kernels,
            inner: Mutex::new(HostInner::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

struct HostContext {
    devices: Vec<DeviceId>,
}

struct HostQueue {
    context: ContextId,
    pending: VecDeque<Command>,
}

struct HostMem {
    context: ContextId,
    shape: MemShape,
    data: Vec<u8>,
}

struct HostProgram {
    context: ContextId,
    entries: Vec<String>,
    options: Option<String>,
}

struct HostKernel {
    context: ContextId,
    name: String,
    body: NativeKernel,
}

enum Command {
    Kernel {
        name: String,
        body: NativeKernel,
        args: Vec<KernelArg>,
        range: NdRange,
    },
    Copy {
        src: MemId,
        dst: MemId,
        bytes: usize,
    },
    Barrier,
}

struct HostInner {
    contexts: HandleTable<HostContext>,
    queues: HandleTable<HostQueue>,
    mems: HandleTable<HostMem>,
    programs: HandleTable<HostProgram>,
    kernels: HandleTable<HostKernel>,
}

impl HostInner {
    fn new() -> Self {
        HostInner {
            contexts: HandleTable::new(ContextId::KIND),
            queues: HandleTable::new(QueueId::KIND),
            mems: HandleTable::new(MemId::KIND),
            programs: HandleTable::new(ProgramId::KIND),
            kernels: HandleTable::new(KernelId::KIND),
        }
    }

    /// Run every pending command of `queue` in order.
    fn flush(&mut self, queue: QueueId) -> Result<()> {
        let commands = std::mem::take(&mut self.queues.get_mut(queue.0)?.pending);
        let total = commands.len();
        for (done, command) in commands.into_iter().enumerate() {
            if let Err(e) = self.execute(command) {
                warn!("{queue}: command {} of {total} failed, dropping the rest: {e}", done + 1);
                return Err(e);
            }
        }
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Barrier => Ok(()),
            Command::Copy { src, dst, bytes } => {
                let chunk = self
                    .mems
                    .get(src.0)?
                    .data
                    .get(..bytes)
                    .ok_or_else(|| Error::invalid(format!("{src} is smaller than {bytes} bytes")))?
                    .to_vec();
                let target = self
                    .mems
                    .get_mut(dst.0)?
                    .data
                    .get_mut(..bytes)
                    .ok_or_else(|| Error::invalid(format!("{dst} is smaller than {bytes} bytes")))?;
                target.copy_from_slice(&chunk);
                Ok(())
            }
            Command::Kernel { name, body, args, range } => {
                let mut bound = self.bind(&args)?;
                let result = body(&mut Invocation { range, args: &mut bound });
                self.unbind(bound);
                result.map_err(|e| {
                    debug!("kernel `{name}` over {range} failed: {e}");
                    e
                })
            }
        }
    }

    /// Run the pending commands of every queue on `context`. Every queue is
    /// drained even if one fails; the first failure is returned.
    fn flush_context(&mut self, context: ContextId) -> Result<()> {
        let queues: Vec<QueueId> = self
            .queues
            .iter()
            .filter(|(_, q)| q.context == context && !q.pending.is_empty())
            .map(|(id, _)| QueueId(id))
            .collect();
        let mut first = Ok(());
        for queue in queues {
            if let Err(e) = self.flush(queue) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    /// Move argument memory out of the table for the duration of a launch.
    fn bind(&mut self, args: &[KernelArg]) -> Result<Vec<Bound>> {
        let mut seen = HashSet::new();
        for arg in args {
            if let KernelArg::Mem(id) = arg {
                self.mems.get(id.0)?;
                if !seen.insert(*id) {
                    return Err(Error::invalid(format!("{id} is bound to two kernel arguments")));
                }
            }
        }

        let mut bound = Vec::with_capacity(args.len());
        for arg in args {
            bound.push(match *arg {
                KernelArg::Mem(id) => {
                    let mem = self.mems.get_mut(id.0)?;
                    Bound::Mem {
                        id,
                        shape: mem.shape,
                        data: std::mem::take(&mut mem.data),
                    }
                }
                KernelArg::Int(v) => Bound::Int(v),
                KernelArg::Uint(v) => Bound::Uint(v),
                KernelArg::Float(v) => Bound::Float(v),
            });
        }
        Ok(bound)
    }

    fn unbind(&mut self, bound: Vec<Bound>) {
        for b in bound {
            if let Bound::Mem { id, data, .. } = b {
                if let Ok(mem) = self.mems.get_mut(id.0) {
                    mem.data = data;
                }
            }
        }
    }

    /// Look up a buffer that may be used on `queue`.
    fn buffer_on(&self, queue: QueueId, mem: MemId) -> Result<&HostMem> {
        let context = self.queues.get(queue.0)?.context;
        let m = self.mems.get(mem.0)?;
        if m.context != context {
            return Err(Error::invalid(format!("{mem} belongs to {}, not {context}", m.context)));
        }
        Ok(m)
    }
}

// ---------------------------------------------------------------------------
// HostPlatform
// ---------------------------------------------------------------------------

/// In-process compute platform with deferred, inspectable queues.
pub struct HostPlatform {
    devices: Vec<HostDevice>,
    natives: HashMap<String, NativeKernel>,
    inner: Mutex<HostInner>,
}

impl HostPlatform {
    /// One default device and the builtin kernels.
    pub fn new() -> Self {
        HostPlatform::builder().build()
    }

    pub fn builder() -> HostPlatformBuilder {
        HostPlatformBuilder {
            devices: Vec::new(),
            kernels: native::builtin()
                .into_iter()
                .map(|(name, body)| (name.to_string(), body))
                .collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, id: DeviceId) -> Result<&HostDevice> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|i| self.devices.get(i))
            .ok_or(Error::UnknownHandle { kind: DeviceId::KIND, id: id.0 })
    }

    // --- inspection ---

    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn live_queues(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn live_mems(&self) -> usize {
        self.lock().mems.len()
    }

    pub fn live_programs(&self) -> usize {
        self.lock().programs.len()
    }

    pub fn live_kernels(&self) -> usize {
        self.lock().kernels.len()
    }

    /// Commands enqueued on `queue` that have not run yet.
    pub fn pending(&self, queue: QueueId) -> Result<usize> {
        Ok(self
            .lock()
            .queues
            .get(queue.0)?
            .pending
            .iter()
            .filter(|c| !matches!(c, Command::Barrier))
            .count())
    }

    /// Build options `program` was last built with.
    pub fn build_options(&self, program: ProgramId) -> Result<Option<String>> {
        Ok(self.lock().programs.get(program.0)?.options.clone())
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        HostPlatform::new()
    }
}

impl Platform for HostPlatform {
    fn name(&self) -> &str {
        "host"
    }

    fn devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| Device {
                id: DeviceId(i as u64 + 1),
                name: d.name.clone(),
                max_work_group_size: d.max_work_group_size,
            })
            .collect())
    }

    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextId> {
        if devices.is_empty() {
            return Err(Error::invalid("a context needs at least one device"));
        }
        for &id in devices {
            let device = self.device(id)?;
            if device.refuse_contexts {
                return Err(Error::Device(format!("{} refused to create a context", device.name)));
            }
        }
        let id = ContextId(self.lock().contexts.insert(HostContext {
            devices: devices.to_vec(),
        }));
        debug!("created {id}");
        Ok(id)
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId> {
        let dev = self.device(device)?;
        let mut inner = self.lock();
        if !inner.contexts.get(context.0)?.devices.contains(&device) {
            return Err(Error::invalid(format!("{device} is not part of {context}")));
        }
        if dev.refuse_queues {
            return Err(Error::Device(format!("{} refused to create a queue", dev.name)));
        }
        let id = QueueId(inner.queues.insert(HostQueue {
            context,
            pending: VecDeque::new(),
        }));
        debug!("created {id} on {context}");
        Ok(id)
    }

    fn release_queue(&self, queue: QueueId) -> Result<()> {
        let mut inner = self.lock();
        inner.queues.releasable(queue.0)?;
        let flushed = inner.flush(queue);
        inner.queues.remove(queue.0)?;
        debug!("released {queue}");
        flushed
    }

    fn release_context(&self, context: ContextId) -> Result<()> {
        let mut inner = self.lock();
        inner.contexts.remove(context.0)?;
        let queues = inner.queues.values().filter(|q| q.context == context).count();
        let mems = inner.mems.values().filter(|m| m.context == context).count();
        let programs = inner.programs.values().filter(|p| p.context == context).count();
        if queues + mems + programs > 0 {
            warn!(
                "released {context} with {queues} queue(s), {mems} mem object(s) \
                 and {programs} program(s) still alive"
            );
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
        inner.contexts.get(context.0)?;
        let id = MemId(inner.mems.insert(HostMem {
            context,
            shape: MemShape::Buffer,
            data: vec![0; bytes],
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
        let mut inner = self.lock();
        inner.contexts.get(context.0)?;
        let id = MemId(inner.mems.insert(HostMem {
            context,
            shape: MemShape::Image { format, nx, ny },
            data: vec![0; nx * ny * format.bytes_per_pixel()],
        }));
        debug!("created {id}: {nx}×{ny} {format} image");
        Ok(id)
    }

    fn mem_size(&self, mem: MemId) -> Result<usize> {
        Ok(self.lock().mems.get(mem.0)?.data.len())
    }

    fn write_buffer(&self, queue: QueueId, mem: MemId, offset: usize, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.flush(queue)?;
        let m = inner.buffer_on(queue, mem)?;
        check_buffer_range(mem, m, offset, data.len())?;
        let m = inner.mems.get_mut(mem.0)?;
        m.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: usize, out: &mut [u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.flush(queue)?;
        let m = inner.buffer_on(queue, mem)?;
        check_buffer_range(mem, m, offset, out.len())?;
        out.copy_from_slice(&m.data[offset..offset + out.len()]);
        Ok(())
    }

    fn copy_buffer(&self, queue: QueueId, src: MemId, dst: MemId, bytes: usize) -> Result<()> {
        let mut inner = self.lock();
        for mem in [src, dst] {
            let m = inner.buffer_on(queue, mem)?;
            check_buffer_range(mem, m, 0, bytes)?;
        }
        inner
            .queues
            .get_mut(queue.0)?
            .pending
            .push_back(Command::Copy { src, dst, bytes });
        Ok(())
    }

    fn write_image(&self, queue: QueueId, image: MemId, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.flush(queue)?;
        let m = inner.buffer_on(queue, image)?;
        check_image_len(image, m, data.len())?;
        inner.mems.get_mut(image.0)?.data.copy_from_slice(data);
        Ok(())
    }

    fn read_image(&self, queue: QueueId, image: MemId, out: &mut [u8]) -> Result<()> {
        let mut inner = self.lock();
        inner.flush(queue)?;
        let m = inner.buffer_on(queue, image)?;
        check_image_len(image, m, out.len())?;
        out.copy_from_slice(&m.data);
        Ok(())
    }

    fn release_mem(&self, mem: MemId) -> Result<()> {
        let mut inner = self.lock();
        let context = inner.mems.get(mem.0).map(|m| m.context);
        inner.mems.releasable(mem.0)?;
        let flushed = context.and_then(|c| inner.flush_context(c));
        inner.mems.remove(mem.0)?;
        debug!("released {mem}");
        flushed
    }

    fn create_program(
        &self,
        context: ContextId,
        devices: &[DeviceId],
        source: &str,
    ) -> Result<ProgramId> {
        let mut inner = self.lock();
        let ctx = inner.contexts.get(context.0)?;
        if let Some(d) = devices.iter().find(|d| !ctx.devices.contains(d)) {
            return Err(Error::invalid(format!("{d} is not part of {context}")));
        }
        let entries = compile::entry_points(source)?;
        let id = ProgramId(inner.programs.insert(HostProgram {
            context,
            entries,
            options: None,
        }));
        debug!("created {id}");
        Ok(id)
    }

    fn build_program(&self, program: ProgramId, devices: &[DeviceId], options: &str) -> Result<()> {
        let mut inner = self.lock();
        let context = inner.programs.get(program.0)?.context;
        let ctx = inner.contexts.get(context.0)?;
        if let Some(d) = devices.iter().find(|d| !ctx.devices.contains(d)) {
            return Err(Error::invalid(format!("{d} is not part of {context}")));
        }
        inner.programs.get_mut(program.0)?.options = Some(options.to_string());
        debug!("built {program} with options {options:?}");
        Ok(())
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut inner = self.lock();
        let p = inner.programs.get(program.0)?;
        if p.options.is_none() {
            return Err(Error::InvalidState {
                op: "create_kernel",
                state: "the program is not built",
            });
        }
        if !p.entries.iter().any(|e| e == name) {
            return Err(Error::KernelNotFound { name: name.to_string() });
        }
        let body = match self.natives.get(name) {
            Some(body) => Arc::clone(body),
            None => {
                debug!("{program} declares `{name}` but no native body is registered");
                return Err(Error::KernelNotFound { name: name.to_string() });
            }
        };
        let context = p.context;
        let id = KernelId(inner.kernels.insert(HostKernel {
            context,
            name: name.to_string(),
            body,
        }));
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
        let mut inner = self.lock();
        for arg in args {
            if let KernelArg::Mem(mem) = arg {
                inner.buffer_on(queue, *mem)?;
            }
        }
        let k = inner.kernels.get(kernel.0)?;
        let command = Command::Kernel {
            name: k.name.clone(),
            body: Arc::clone(&k.body),
            args: args.to_vec(),
            range,
        };
        inner.queues.get_mut(queue.0)?.pending.push_back(command);
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<()> {
        let mut inner = self.lock();
        let context = inner.kernels.get(kernel.0).map(|k| k.context);
        inner.kernels.releasable(kernel.0)?;
        let flushed = context.and_then(|c| inner.flush_context(c));
        inner.kernels.remove(kernel.0)?;
        debug!("released {kernel}");
        flushed
    }

    fn release_program(&self, program: ProgramId) -> Result<()> {
        let mut inner = self.lock();
        let context = inner.programs.get(program.0).map(|p| p.context);
        inner.programs.releasable(program.0)?;
        let flushed = context.and_then(|c| inner.flush_context(c));
        inner.programs.remove(program.0)?;
        debug!("released {program}");
        flushed
    }

    fn barrier(&self, queue: QueueId) -> Result<()> {
        self.lock()
            .queues
            .get_mut(queue.0)?
            .pending
            .push_back(Command::Barrier);
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        self.lock().flush(queue)
    }
}

fn check_buffer_range(id: MemId, mem: &HostMem, offset: usize, len: usize) -> Result<()> {
    if mem.shape != MemShape::Buffer {
        return Err(Error::invalid(format!("{id} is an image, not a buffer")));
    }
    match offset.checked_add(len) {
        Some(end) if end <= mem.data.len() => Ok(()),
        _ => Err(Error::invalid(format!(
            "{len} bytes at offset {offset} exceed the {} bytes of {id}",
            mem.data.len()
        ))),
    }
}

fn check_image_len(id: MemId, mem: &HostMem, len: usize) -> Result<()> {
    match mem.shape {
        MemShape::Buffer => Err(Error::invalid(format!("{id} is a buffer, not an image"))),
        MemShape::Image { format, nx, ny } if len != mem.data.len() => Err(Error::shape(
            format!("{nx}×{ny} {format} ({} bytes)", mem.data.len()),
            format!("{len} bytes"),
        )),
        MemShape::Image { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(platform: &HostPlatform) -> (ContextId, QueueId) {
        let device = platform.devices().unwrap()[0].id;
        let ctx = platform.create_context(&[device]).unwrap();
        let queue = platform.create_queue(ctx, device).unwrap();
        (ctx, queue)
    }

    #[test]
    fn test_default_device() {
        let p = HostPlatform::new();
        let devices = p.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, DeviceId(1));
        assert_eq!(devices[0].name, "host");
    }

    #[test]
    fn test_refusing_device() {
        let p = HostPlatform::builder()
            .device(HostDevice::new("no-ctx").refuse_contexts())
            .device(HostDevice::new("no-queue").refuse_queues())
            .build();
        assert!(matches!(p.create_context(&[DeviceId(1)]), Err(Error::Device(_))));
        let ctx = p.create_context(&[DeviceId(2)]).unwrap();
        assert!(matches!(p.create_queue(ctx, DeviceId(2)), Err(Error::Device(_))));
        assert!(matches!(
            p.create_context(&[DeviceId(9)]),
            Err(Error::UnknownHandle { kind: "device", .. })
        ));
    }

    #[test]
    fn test_buffer_round_trip_and_bounds() {
        let p = HostPlatform::new();
        let (ctx, q) = setup(&p);
        let buf = p.create_buffer(ctx, 8).unwrap();
        p.write_buffer(q, buf, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [9u8; 8];
        p.read_buffer(q, buf, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(matches!(
            p.write_buffer(q, buf, 6, &[0; 4]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_copy_is_deferred_until_sync() {
        let p = HostPlatform::new();
        let (ctx, q) = setup(&p);
        let a = p.create_buffer(ctx, 4).unwrap();
        let b = p.create_buffer(ctx, 4).unwrap();
        p.write_buffer(q, a, 0, &[7; 4]).unwrap();
        p.copy_buffer(q, a, b, 4).unwrap();
        assert_eq!(p.pending(q).unwrap(), 1);
        p.finish(q).unwrap();
        assert_eq!(p.pending(q).unwrap(), 0);
        let mut out = [0u8; 4];
        p.read_buffer(q, b, 0, &mut out).unwrap();
        assert_eq!(out, [7; 4]);
    }

    #[test]
    fn test_release_drains_pending_commands() {
        let p = HostPlatform::builder()
            .kernel("mark", |inv: &mut Invocation<'_>| inv.write_i32(0, 0, 5))
            .build();
        let (ctx, q) = setup(&p);
        let dev = [DeviceId(1)];
        let prog = p.create_program(ctx, &dev, "@compute @workgroup_size(1) fn mark() {}").unwrap();
        p.build_program(prog, &dev, "").unwrap();
        let k = p.create_kernel(prog, "mark").unwrap();
        let a = p.create_buffer(ctx, 4).unwrap();
        let b = p.create_buffer(ctx, 4).unwrap();

        p.enqueue_kernel(q, k, &[KernelArg::Mem(a)], NdRange::d1(1)).unwrap();
        p.copy_buffer(q, a, b, 4).unwrap();
        p.release_kernel(k).unwrap();
        p.release_program(prog).unwrap();
        p.release_mem(a).unwrap();
        assert_eq!(p.pending(q).unwrap(), 0);

        let mut out = [0u8; 4];
        p.read_buffer(q, b, 0, &mut out).unwrap();
        assert_eq!(i32::from_ne_bytes(out), 5);
        p.release_mem(b).unwrap();
        p.release_queue(q).unwrap();
        p.release_context(ctx).unwrap();
    }

    #[test]
    fn test_double_release_and_use_after_release() {
        let p = HostPlatform::new();
        let (ctx, q) = setup(&p);
        let buf = p.create_buffer(ctx, 4).unwrap();
        p.release_mem(buf).unwrap();
        assert!(matches!(p.release_mem(buf), Err(Error::DoubleRelease { .. })));
        let mut out = [0u8; 4];
        assert!(matches!(
            p.read_buffer(q, buf, 0, &mut out),
            Err(Error::UseAfterRelease { kind: "mem", .. })
        ));
        p.release_queue(q).unwrap();
        p.release_context(ctx).unwrap();
        assert!(matches!(p.release_queue(q), Err(Error::DoubleRelease { .. })));
        assert_eq!(p.live_contexts(), 0);
    }

    #[test]
    fn test_image_length_mismatch() {
        let p = HostPlatform::new();
        let (ctx, q) = setup(&p);
        let img = p.create_image(ctx, PixelFormat::GRAY8, 4, 2).unwrap();
        assert_eq!(p.mem_size(img).unwrap(), 8);
        assert!(matches!(
            p.write_image(q, img, &[0; 7]),
            Err(Error::ShapeMismatch { .. })
        ));
        p.write_image(q, img, &[3; 8]).unwrap();
        let mut out = [0u8; 8];
        p.read_image(q, img, &mut out).unwrap();
        assert_eq!(out, [3; 8]);
    }

    #[test]
    fn test_program_lifecycle() {
        let p = HostPlatform::builder()
            .kernel("fill", |inv: &mut Invocation<'_>| {
                let value = inv.int(1)?;
                let n = inv.range().items();
                for i in 0..n {
                    inv.write_i32(0, i, value)?;
                }
                Ok(())
            })
            .build();
        let (ctx, q) = setup(&p);
        let dev = [DeviceId(1)];
        let src = "@compute @workgroup_size(64) fn fill() {}";

        let prog = p.create_program(ctx, &dev, src).unwrap();
        assert!(matches!(p.create_kernel(prog, "fill"), Err(Error::InvalidState { .. })));
        p.build_program(prog, &dev, "").unwrap();
        assert!(matches!(p.create_kernel(prog, "nope"), Err(Error::KernelNotFound { .. })));

        let k = p.create_kernel(prog, "fill").unwrap();
        let buf = p.create_buffer(ctx, 16).unwrap();
        p.enqueue_kernel(q, k, &[KernelArg::Mem(buf), KernelArg::Int(-2)], NdRange::d1(4))
            .unwrap();
        let mut out = [0u8; 16];
        p.read_buffer(q, buf, 0, &mut out).unwrap();
        let values: Vec<i32> = bytemuck::pod_collect_to_vec(&out);
        assert_eq!(values, [-2, -2, -2, -2]);
    }

    #[test]
    fn test_declared_entry_without_native_body() {
        let p = HostPlatform::new();
        let (ctx, _) = setup(&p);
        let dev = [DeviceId(1)];
        let prog = p
            .create_program(ctx, &dev, "@compute @workgroup_size(1) fn mystery() {}")
            .unwrap();
        p.build_program(prog, &dev, "").unwrap();
        assert!(matches!(
            p.create_kernel(prog, "mystery"),
            Err(Error::KernelNotFound { .. })
        ));
    }

    #[test]
    fn test_same_mem_twice_is_rejected_at_run() {
        let p = HostPlatform::builder().kernel("noop", |_: &mut Invocation<'_>| Ok(())).build();
        let (ctx, q) = setup(&p);
        let dev = [DeviceId(1)];
        let prog = p.create_program(ctx, &dev, "kernel void noop() {}").unwrap();
        p.build_program(prog, &dev, "").unwrap();
        let k = p.create_kernel(prog, "noop").unwrap();
        let buf = p.create_buffer(ctx, 4).unwrap();
        p.enqueue_kernel(q, k, &[KernelArg::Mem(buf), KernelArg::Mem(buf)], NdRange::d1(1))
            .unwrap();
        assert!(matches!(p.finish(q), Err(Error::InvalidArgument(_))));
        // The buffer is still intact after the failed launch.
        assert_eq!(p.mem_size(buf).unwrap(), 4);
    }
}
