//! The device seam: what the runtime needs from a GPU implementation.
//!
//! A [`GpuDevice`] compiles programs, creates kernel objects with positional
//! arguments, launches them on its single queue and manages linear buffers.
//! Everything above this trait (runtime, tuner, functors) is device-agnostic.

use core::fmt;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::Result;
use crate::future::CallStats;
use crate::runtime::program::BuildOptions;

/// Identifies a compiled program inside one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

/// Identifies a kernel object (a program entry point with its own argument slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u64);

/// Identifies a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Capabilities reported once when the device is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Global sizes need not be multiples of the local size.
    pub non_uniform_work_groups: bool,
    /// Kernels may be built with the device-side out-of-range check.
    pub out_of_range_check: bool,
    /// Per-dimension local size ceilings.
    pub max_work_group_dims: [u32; 3],
    /// The device can export and import program binaries.
    pub program_binaries: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            non_uniform_work_groups: false,
            out_of_range_check: true,
            max_work_group_dims: [256, 256, 64],
            program_binaries: false,
        }
    }
}

/// A preprocessed program ready for compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource {
    /// Program name (the source file it came from).
    pub name: String,
    /// Entry point symbol after renaming.
    pub entry: String,
    /// Source text with every build option applied.
    pub text: String,
    /// The option set the text was produced with.
    pub options: BuildOptions,
}

/// A positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferId),
    U32(u32),
    I32(i32),
    F32(f32),
}

/// Operations every GPU implementation provides.
///
/// Argument slots belong to a kernel object and persist across launches until
/// overwritten. Buffer arguments are bound by id; binding a buffer does not
/// keep it alive.
pub trait GpuDevice: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> String;

    fn capabilities(&self) -> Capabilities;

    /// Compiles a program from source.
    fn compile_program(&self, source: &ProgramSource) -> Result<ProgramId>;

    /// Restores a program from a binary exported by [`GpuDevice::program_binary`].
    ///
    /// Returns `Ok(None)` when the binary is unusable and the program must be
    /// compiled from source.
    fn load_program_binary(&self, _source: &ProgramSource, _binary: &[u8]) -> Result<Option<ProgramId>> {
        Ok(None)
    }

    /// Exports a compiled program, if the device supports binaries.
    fn program_binary(&self, _program: ProgramId) -> Option<Vec<u8>> {
        None
    }

    /// Creates a fresh kernel object with empty argument slots.
    fn create_kernel(&self, program: ProgramId) -> Result<KernelId>;

    /// Frees a kernel object and everything bound to its argument slots.
    fn release_kernel(&self, kernel: KernelId);

    /// Largest local size (product of dimensions) this kernel can launch with.
    fn kernel_max_work_group_size(&self, kernel: KernelId) -> u32;

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<()>;

    /// Enqueues one launch. With `wait` the call returns after completion and
    /// the returned stats cover execution; otherwise they cover submission.
    fn enqueue_kernel(&self, kernel: KernelId, global: [u32; 3], local: [u32; 3], wait: bool) -> Result<CallStats>;

    /// Allocates `bytes` of zeroed device memory.
    fn allocate(&self, bytes: usize) -> Result<BufferId>;

    fn release(&self, buffer: BufferId);

    /// Overwrites the start of a buffer.
    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> Result<()>;

    /// Reads the start of a buffer after all queued work has completed.
    fn read_buffer(&self, buffer: BufferId, out: &mut [u8]) -> Result<()>;
}

struct BufferInner {
    device: Arc<dyn GpuDevice>,
    id: BufferId,
    len: usize,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.device.release(self.id);
    }
}

/// Reference-counted handle to device memory. Clones share the allocation,
/// which is released when the last clone is dropped.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

impl DeviceBuffer {
    /// Allocates `len` bytes on `device`.
    pub fn allocate(device: Arc<dyn GpuDevice>, len: usize) -> Result<Self> {
        let id = device.allocate(len)?;
        Ok(Self {
            inner: Arc::new(BufferInner { device, id, len }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Size in bytes as requested at allocation.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// The device that owns this buffer.
    pub fn device(&self) -> Arc<dyn GpuDevice> {
        Arc::clone(&self.inner.device)
    }

    /// Overwrites the start of the buffer with `data`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.inner.device.write_buffer(self.inner.id, data)
    }

    /// Maps the buffer for host access. The mapping is released when the
    /// returned guard is dropped; modified contents are written back then.
    pub fn map(&self) -> Result<MappedBuffer<'_>> {
        let mut data = vec![0u8; self.inner.len];
        self.inner.device.read_buffer(self.inner.id, &mut data)?;
        Ok(MappedBuffer {
            buffer: self,
            data,
            dirty: false,
        })
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .finish()
    }
}

impl PartialEq for DeviceBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Host view of a mapped [`DeviceBuffer`].
pub struct MappedBuffer<'a> {
    buffer: &'a DeviceBuffer,
    data: Vec<u8>,
    dirty: bool,
}

impl MappedBuffer<'_> {
    /// Releases the mapping, reporting a failed write-back.
    pub fn unmap(mut self) -> Result<()> {
        let result = self.write_back();
        self.dirty = false;
        result
    }

    fn write_back(&mut self) -> Result<()> {
        if self.dirty {
            self.buffer.write(&self.data)?;
        }
        Ok(())
    }
}

impl Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MappedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.write_back() {
            tracing::error!(buffer = ?self.buffer.id(), "failed to write back mapped buffer: {err}");
        }
    }
}

struct KernelInner {
    device: Arc<dyn GpuDevice>,
    id: KernelId,
    name: String,
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        self.device.release_kernel(self.id);
    }
}

/// A kernel object created by [`ComputeRuntime::build_kernel`](crate::runtime::ComputeRuntime::build_kernel).
///
/// Clones share the object, which is released when the last clone is dropped.
#[derive(Clone)]
pub struct KernelHandle {
    inner: Arc<KernelInner>,
}

impl KernelHandle {
    pub(crate) fn new(device: Arc<dyn GpuDevice>, id: KernelId, name: String) -> Self {
        Self {
            inner: Arc::new(KernelInner { device, id, name }),
        }
    }

    pub fn id(&self) -> KernelId {
        self.inner.id
    }

    /// Program name the kernel was built from.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn set_arg(&self, index: u32, arg: KernelArg) -> Result<()> {
        self.inner.device.set_kernel_arg(self.inner.id, index, arg)
    }

    pub fn max_work_group_size(&self) -> u32 {
        self.inner.device.kernel_max_work_group_size(self.inner.id)
    }

    /// Launches with explicit global and local sizes.
    pub fn enqueue(&self, global: [u32; 3], local: [u32; 3], wait: bool) -> Result<CallStats> {
        self.inner.device.enqueue_kernel(self.inner.id, global, local, wait)
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}
