use std::sync::Arc;

use crate::error::{Result, ensure};
use crate::future::StatsFuture;
use crate::ops::gpu::{GpuKernel, device_buffer, dim_u32, prepare_output};
use crate::runtime::ComputeRuntime;
use crate::tensors::{DeviceElement, Tensor};

/// Channel shuffle on the GPU for NHWC device tensors.
///
/// Each invocation handles a block of four channels in every group, so both
/// the channels per group and the group count must be multiples of 4.
pub struct ChannelShuffleGpu<T> {
    groups: usize,
    kernel: GpuKernel<T>,
}

impl<T: DeviceElement> ChannelShuffleGpu<T> {
    pub fn new(runtime: Arc<ComputeRuntime>, groups: usize) -> Self {
        Self {
            groups,
            kernel: GpuKernel::new(runtime, "channel_shuffle"),
        }
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Times the kernel arguments were bound.
    pub fn bind_count(&self) -> usize {
        self.kernel.bind_count()
    }

    pub fn is_built(&self) -> bool {
        self.kernel.is_built()
    }

    /// Shuffles `input` into `output`, which is resized to the input shape.
    ///
    /// # Errors
    /// [`Error::Precondition`](crate::Error::Precondition) before any build
    /// when the input is not 4-D or the channel layout does not fit the kernel;
    /// [`Error::KernelFault`](crate::Error::KernelFault) if the out-of-range
    /// check trips.
    pub fn run(&mut self, input: &Tensor<T>, output: &mut Tensor<T>, future: Option<&mut StatsFuture>) -> Result<()> {
        ensure!(input.rank() == 4, "channel shuffle expects NHWC input, got shape {:?}", input.shape());
        let (batch, height, width, channels) = (input.dim(0), input.dim(1), input.dim(2), input.dim(3));
        let groups = self.groups;
        ensure!(
            groups > 0 && channels % groups == 0,
            "channels ({channels}) must be divisible by groups ({groups})"
        );
        let channels_per_group = channels / groups;
        ensure!(
            channels_per_group % 4 == 0,
            "channels per group ({channels_per_group}) must be a multiple of 4"
        );
        ensure!(groups % 4 == 0, "groups ({groups}) must be a multiple of 4");
        let src = device_buffer(input, "channel shuffle input")?;

        let gws = [
            dim_u32(channels_per_group / 4, "channel blocks")?,
            dim_u32(width, "width")?,
            dim_u32(height * batch, "height * batch")?,
        ];
        let groups_u32 = dim_u32(groups, "groups")?;
        let cpg_u32 = dim_u32(channels_per_group, "channels per group")?;

        let kwg_size = self.kernel.build()?;
        prepare_output(self.kernel.runtime(), output, input.shape())?;
        if gws.contains(&0) {
            return Ok(());
        }
        let dst = device_buffer(output, "channel shuffle output")?;

        self.kernel.bind_if_changed(input.shape(), &[src, dst], gws, |args| {
            args.buffer(src)?;
            args.u32(groups_u32)?;
            args.u32(cpg_u32)?;
            args.buffer(dst)
        })?;

        let lws = [8, (kwg_size / 64).max(1), 8];
        let signature = format!(
            "channel_shuffle_gpu_kernel_{}_{}_{}_{}",
            output.dim(0),
            output.dim(1),
            output.dim(2),
            output.dim(3)
        );
        self.kernel.run(&signature, gws, lws, future)
    }
}
