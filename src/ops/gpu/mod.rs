//! GPU operator functors.
//!
//! Every functor drives one or more [`GpuKernel`]s through the same lifecycle:
//!
//! ```text
//! Uninitialized --first call--> Built --bind--> Bound
//!                                 ^               |
//!                                 +--new shape----+
//! ```
//!
//! Building derives the build options from the element type and the runtime's
//! capability flags, compiles (or reuses) the program and allocates the error
//! buffer. Binding sets every kernel argument in declaration order and happens
//! only when the input shape or the identity of a bound buffer differs from
//! the previous call.

mod channel_shuffle;
mod slice;

pub use channel_shuffle::ChannelShuffleGpu;
pub use slice::SliceGpu;

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::future::StatsFuture;
use crate::runtime::program::obfuscate_symbol;
use crate::runtime::{BufferId, BuildOptions, ComputeRuntime, DeviceBuffer, KernelArg, KernelHandle};
use crate::tensors::{DeviceElement, Tensor};

/// Everything derived from one build; dropped together.
struct KernelCache {
    kernel: KernelHandle,
    max_work_group_size: u32,
    error: Option<DeviceBuffer>,
}

/// What the current bindings were made for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BindKey {
    shape: Vec<usize>,
    buffers: Vec<BufferId>,
}

enum KernelState {
    Uninitialized,
    Built(KernelCache),
    Bound { cache: KernelCache, key: BindKey },
}

/// Sets kernel arguments at consecutive indices.
pub(crate) struct ArgBinder<'a> {
    kernel: &'a KernelHandle,
    next: u32,
}

impl ArgBinder<'_> {
    fn set(&mut self, arg: KernelArg) -> Result<()> {
        self.kernel.set_arg(self.next, arg)?;
        self.next += 1;
        Ok(())
    }

    pub(crate) fn buffer(&mut self, buffer: &DeviceBuffer) -> Result<()> {
        self.set(KernelArg::Buffer(buffer.id()))
    }

    pub(crate) fn u32(&mut self, value: u32) -> Result<()> {
        self.set(KernelArg::U32(value))
    }
}

/// One kernel object with its lazily built state.
pub(crate) struct GpuKernel<T> {
    runtime: Arc<ComputeRuntime>,
    program: &'static str,
    state: KernelState,
    bind_count: usize,
    _element: PhantomData<fn() -> T>,
}

impl<T: DeviceElement> GpuKernel<T> {
    pub(crate) fn new(runtime: Arc<ComputeRuntime>, program: &'static str) -> Self {
        Self {
            runtime,
            program,
            state: KernelState::Uninitialized,
            bind_count: 0,
            _element: PhantomData,
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<ComputeRuntime> {
        &self.runtime
    }

    /// Times arguments were (re)bound.
    pub(crate) fn bind_count(&self) -> usize {
        self.bind_count
    }

    pub(crate) fn is_built(&self) -> bool {
        !matches!(self.state, KernelState::Uninitialized)
    }

    fn cache(&self) -> Option<&KernelCache> {
        match &self.state {
            KernelState::Uninitialized => None,
            KernelState::Built(cache) | KernelState::Bound { cache, .. } => Some(cache),
        }
    }

    fn build_options(&self) -> BuildOptions {
        let mut options = BuildOptions::new();
        options
            .define_value(self.program, obfuscate_symbol(self.program))
            .define_value("DATA_TYPE", T::KERNEL_TYPE);
        if self.runtime.is_out_of_range_check_enabled() {
            options.define("OUT_OF_RANGE_CHECK");
        }
        if self.runtime.is_non_uniform_workgroups_supported() {
            options.define("NON_UNIFORM_WORK_GROUP");
        }
        options
    }

    /// Builds the kernel on first use and returns its work-group ceiling.
    pub(crate) fn build(&mut self) -> Result<u32> {
        if let Some(cache) = self.cache() {
            return Ok(cache.max_work_group_size);
        }
        let options = self.build_options();
        let entry = obfuscate_symbol(self.program);
        let kernel = self.runtime.build_kernel(self.program, &entry, &options)?;
        let max_work_group_size = self.runtime.kernel_max_work_group_size(&kernel);

        let error = if self.runtime.is_out_of_range_check_enabled() {
            let buf = self.runtime.allocate(4)?;
            let mut mapped = buf.map()?;
            mapped.fill(0);
            mapped.unmap()?;
            Some(buf)
        } else {
            None
        };

        tracing::debug!(program = self.program, %options, max_work_group_size, "built kernel");
        self.state = KernelState::Built(KernelCache {
            kernel,
            max_work_group_size,
            error,
        });
        Ok(max_work_group_size)
    }

    /// Binds every argument unless `shape` and the `buffers` passed to `bind`
    /// match the previous call.
    ///
    /// The error buffer and the global size are bound first as needed; `bind`
    /// then sets the operator's own arguments in declaration order.
    pub(crate) fn bind_if_changed(
        &mut self,
        shape: &[usize],
        buffers: &[&DeviceBuffer],
        gws: [u32; 3],
        bind: impl FnOnce(&mut ArgBinder<'_>) -> Result<()>,
    ) -> Result<bool> {
        let key = BindKey {
            shape: shape.to_vec(),
            buffers: buffers.iter().map(|b| b.id()).collect(),
        };
        let state = std::mem::replace(&mut self.state, KernelState::Uninitialized);
        let cache = match state {
            KernelState::Bound { cache, key: bound } if bound == key => {
                self.state = KernelState::Bound { cache, key: bound };
                return Ok(false);
            }
            KernelState::Bound { cache, .. } | KernelState::Built(cache) => cache,
            KernelState::Uninitialized => {
                return Err(Error::precondition(format!("kernel '{}' bound before build", self.program)));
            }
        };

        let mut binder = ArgBinder {
            kernel: &cache.kernel,
            next: 0,
        };
        let result = (|| {
            if let Some(error) = &cache.error {
                binder.buffer(error)?;
            }
            if !self.runtime.is_non_uniform_workgroups_supported() {
                for g in gws {
                    binder.u32(g)?;
                }
            }
            bind(&mut binder)
        })();

        match result {
            Ok(()) => {
                self.bind_count += 1;
                tracing::debug!(program = self.program, ?shape, ?gws, "bound kernel arguments");
                self.state = KernelState::Bound { cache, key };
                Ok(true)
            }
            Err(err) => {
                self.state = KernelState::Built(cache);
                Err(err)
            }
        }
    }

    /// Launches through the tuner, then checks the error buffer.
    pub(crate) fn run(
        &self,
        signature: &str,
        gws: [u32; 3],
        default_lws: [u32; 3],
        future: Option<&mut StatsFuture>,
    ) -> Result<()> {
        let KernelState::Bound { cache, .. } = &self.state else {
            return Err(Error::precondition(format!("kernel '{}' launched before bind", self.program)));
        };
        self.runtime
            .tuner()
            .run_or_tune(&cache.kernel, signature, gws, default_lws, future)?;

        if let Some(error) = &cache.error {
            let mut mapped = error.map()?;
            let code = u32::from_le_bytes([mapped[0], mapped[1], mapped[2], mapped[3]]);
            if code != 0 {
                // cleared so the next launch reports only its own fault
                mapped.fill(0);
            }
            mapped.unmap()?;
            if code != 0 {
                tracing::error!(program = self.program, code, "kernel reported an out-of-range access");
                return Err(Error::KernelFault {
                    kernel: self.program.to_string(),
                    code,
                });
            }
        }
        Ok(())
    }
}

/// Device buffer of `tensor`, which a GPU functor requires.
pub(crate) fn device_buffer<'a, T: DeviceElement>(tensor: &'a Tensor<T>, what: &str) -> Result<&'a DeviceBuffer> {
    tensor
        .device_buffer()
        .ok_or_else(|| Error::precondition(format!("{what} must be a device tensor")))
}

/// Resizes `output` to `shape`, moving it onto the device first if it lives on the host.
pub(crate) fn prepare_output<T: DeviceElement>(
    runtime: &ComputeRuntime,
    output: &mut Tensor<T>,
    shape: &[usize],
) -> Result<()> {
    if output.is_on_device() {
        output.resize(shape)
    } else {
        *output = Tensor::on_device(runtime, shape.to_vec())?;
        Ok(())
    }
}

/// Converts a dimension to a kernel scalar.
pub(crate) fn dim_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::precondition(format!("{what} ({value}) exceeds u32")))
}
