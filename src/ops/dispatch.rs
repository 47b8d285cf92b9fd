//! Operation Dispatch Layer
//!
//! Each operator is an enum with one variant per device family. The variant is
//! chosen once, when the functor is constructed from a [`DeviceType`]; every
//! later call goes straight to that implementation.
//!
//! A functor asked for [`DeviceType::Gpu`] in a context without a compute
//! runtime falls back to the CPU, with a warning.
//!
//! # Example
//! ```rust
//! use ferrokern::backend::DeviceType;
//! use ferrokern::ops::dispatch::{ExecContext, Slice};
//! use ferrokern::runtime::ThreadPolicy;
//! use ferrokern::tensors::Tensor;
//!
//! let ctx = ExecContext::cpu_only(&ThreadPolicy::default()).unwrap();
//! let mut slice = Slice::<f32>::new(DeviceType::Cpu, 1, &ctx);
//! let input = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
//! let mut outputs = vec![Tensor::empty(), Tensor::empty()];
//! slice.run(&input, &mut outputs, None).unwrap();
//! assert_eq!(outputs[0].data().unwrap(), &[1.0, 3.0]);
//! ```

use std::sync::Arc;
use std::time::Instant;

use crate::backend::DeviceType;
use crate::error::Result;
use crate::future::{CallStats, StatsFuture};
use crate::ops::cpu;
use crate::ops::gpu::{ChannelShuffleGpu, SliceGpu};
use crate::runtime::{ComputeRuntime, CpuExecutor, ThreadPolicy};
use crate::tensors::{DeviceElement, Tensor};

/// What functors may run on: always a CPU pool, optionally a GPU runtime.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub runtime: Option<Arc<ComputeRuntime>>,
    pub cpu: Arc<CpuExecutor>,
}

impl ExecContext {
    pub fn cpu_only(policy: &ThreadPolicy) -> Result<Self> {
        Ok(Self {
            runtime: None,
            cpu: Arc::new(CpuExecutor::new(policy)?),
        })
    }

    pub fn with_runtime(runtime: Arc<ComputeRuntime>, policy: &ThreadPolicy) -> Result<Self> {
        Ok(Self {
            runtime: Some(runtime),
            cpu: Arc::new(CpuExecutor::new(policy)?),
        })
    }

    /// Runtime for a GPU functor, or `None` after warning that `op` falls back to the CPU.
    fn gpu_runtime(&self, device: DeviceType, op: &str) -> Option<Arc<ComputeRuntime>> {
        match (device, &self.runtime) {
            (DeviceType::Gpu, Some(runtime)) => Some(Arc::clone(runtime)),
            (DeviceType::Gpu, None) => {
                tracing::warn!(op, "no compute runtime available; running on the cpu");
                None
            }
            (DeviceType::Cpu, _) => None,
        }
    }
}

/// Runs `op` on `executor` and reports its wall time into `future`.
fn run_on_cpu(executor: &CpuExecutor, future: Option<&mut StatsFuture>, op: impl FnOnce() -> Result<()> + Send) -> Result<()> {
    let start = Instant::now();
    executor.install(op)?;
    if let Some(future) = future {
        future.record(CallStats::new(start, Instant::now()));
    }
    Ok(())
}

/// Channel shuffle on the device chosen at construction.
pub enum ChannelShuffle<T> {
    Cpu { groups: usize, executor: Arc<CpuExecutor> },
    Gpu(ChannelShuffleGpu<T>),
}

impl<T: DeviceElement> ChannelShuffle<T> {
    pub fn new(device: DeviceType, groups: usize, ctx: &ExecContext) -> Self {
        match ctx.gpu_runtime(device, "channel_shuffle") {
            Some(runtime) => Self::Gpu(ChannelShuffleGpu::new(runtime, groups)),
            None => Self::Cpu {
                groups,
                executor: Arc::clone(&ctx.cpu),
            },
        }
    }

    /// The device this functor actually runs on.
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Cpu { .. } => DeviceType::Cpu,
            Self::Gpu(_) => DeviceType::Gpu,
        }
    }

    pub fn as_gpu(&self) -> Option<&ChannelShuffleGpu<T>> {
        match self {
            Self::Gpu(gpu) => Some(gpu),
            Self::Cpu { .. } => None,
        }
    }

    pub fn run(&mut self, input: &Tensor<T>, output: &mut Tensor<T>, future: Option<&mut StatsFuture>) -> Result<()> {
        match self {
            Self::Cpu { groups, executor } => {
                let groups = *groups;
                run_on_cpu(executor, future, || cpu::channel_shuffle(input, groups, output))
            }
            Self::Gpu(gpu) => gpu.run(input, output, future),
        }
    }
}

/// Slice on the device chosen at construction.
pub enum Slice<T> {
    Cpu { axis: usize, executor: Arc<CpuExecutor> },
    Gpu(SliceGpu<T>),
}

impl<T: DeviceElement> Slice<T> {
    pub fn new(device: DeviceType, axis: usize, ctx: &ExecContext) -> Self {
        match ctx.gpu_runtime(device, "slice") {
            Some(runtime) => Self::Gpu(SliceGpu::new(runtime, axis)),
            None => Self::Cpu {
                axis,
                executor: Arc::clone(&ctx.cpu),
            },
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Cpu { .. } => DeviceType::Cpu,
            Self::Gpu(_) => DeviceType::Gpu,
        }
    }

    pub fn as_gpu(&self) -> Option<&SliceGpu<T>> {
        match self {
            Self::Gpu(gpu) => Some(gpu),
            Self::Cpu { .. } => None,
        }
    }

    pub fn run(&mut self, input: &Tensor<T>, outputs: &mut [Tensor<T>], future: Option<&mut StatsFuture>) -> Result<()> {
        match self {
            Self::Cpu { axis, executor } => {
                let axis = *axis;
                run_on_cpu(executor, future, || cpu::slice(input, axis, outputs))
            }
            Self::Gpu(gpu) => gpu.run(input, outputs, future),
        }
    }
}
