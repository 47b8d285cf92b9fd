use std::sync::Arc;

use crate::error::{Result, ensure};
use crate::future::StatsFuture;
use crate::ops::gpu::{GpuKernel, device_buffer, dim_u32, prepare_output};
use crate::runtime::ComputeRuntime;
use crate::tensors::{DeviceElement, Tensor};

/// Splits a device tensor along `axis` into equal parts on the GPU.
///
/// Each output owns a kernel object, since arguments differ per output. When
/// the axis does not divide evenly the trailing remainder is dropped.
pub struct SliceGpu<T> {
    axis: usize,
    runtime: Arc<ComputeRuntime>,
    kernels: Vec<GpuKernel<T>>,
}

impl<T: DeviceElement> SliceGpu<T> {
    pub fn new(runtime: Arc<ComputeRuntime>, axis: usize) -> Self {
        Self {
            axis,
            runtime,
            kernels: Vec::new(),
        }
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    /// Total argument bindings over every per-output kernel.
    pub fn bind_count(&self) -> usize {
        self.kernels.iter().map(GpuKernel::bind_count).sum()
    }

    pub fn is_built(&self) -> bool {
        self.kernels.iter().any(GpuKernel::is_built)
    }

    /// Fills every tensor in `outputs` with its slab of `input`.
    pub fn run(&mut self, input: &Tensor<T>, outputs: &mut [Tensor<T>], mut future: Option<&mut StatsFuture>) -> Result<()> {
        let axis = self.axis;
        ensure!(axis < input.rank(), "slice axis {axis} out of range for shape {:?}", input.shape());
        ensure!(!outputs.is_empty(), "slice needs at least one output");
        let src = device_buffer(input, "slice input")?;

        let count = outputs.len();
        let output_channels = input.dim(axis) / count;
        let mut output_shape = input.shape().to_vec();
        output_shape[axis] = output_channels;
        let outer: usize = output_shape[..axis].iter().product();
        let inner: usize = output_shape[axis + 1..].iter().product();
        let run = output_channels * inner;
        let src_stride = dim_u32(input.dim(axis) * inner, "input stride")?;
        let gws = [dim_u32(run, "slice run")?, dim_u32(outer, "outer size")?, 1];

        if self.kernels.len() != count {
            self.kernels = (0..count)
                .map(|_| GpuKernel::new(Arc::clone(&self.runtime), "slice"))
                .collect();
        }

        for (i, (kernel, output)) in self.kernels.iter_mut().zip(outputs.iter_mut()).enumerate() {
            prepare_output(&self.runtime, output, &output_shape)?;
            if gws.contains(&0) {
                continue;
            }
            let kwg_size = kernel.build()?;
            let dst = device_buffer(output, "slice output")?;
            let src_offset = dim_u32(i * run, "slice offset")?;

            kernel.bind_if_changed(input.shape(), &[src, dst], gws, |args| {
                args.buffer(src)?;
                args.u32(src_stride)?;
                args.u32(src_offset)?;
                args.buffer(dst)
            })?;

            let dims: Vec<String> = output_shape.iter().map(ToString::to_string).collect();
            let signature = format!("slice_gpu_kernel_{}_{i}", dims.join("_"));
            let lws = [kwg_size.min(64), (kwg_size / 64).max(1), 1];
            kernel.run(&signature, gws, lws, future.as_deref_mut())?;
        }
        Ok(())
    }
}
