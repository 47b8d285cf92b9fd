//! Parallel CPU operator kernels
//!
//! # CPU Backend
//!
//! Host implementations of the operators, used when a functor is constructed
//! for [`DeviceType::Cpu`](crate::backend::DeviceType::Cpu) or when no compute
//! runtime is available.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon); callers pick
//!   the pool through [`CpuExecutor::install`](crate::runtime::CpuExecutor::install)
//! - Runs are copied with [`Element::copy_run`], a bulk copy for plain data
//!   and an element-wise clone for everything else
//!
//! ## Implemented Ops
//!
//! - `slice`: split along an axis into equal parts
//! - `channel_shuffle`: NHWC group/channel transpose

use rayon::prelude::*;

use crate::error::{Error, Result, ensure};
use crate::tensors::{Element, Tensor};

fn ensure_host<T: Element>(output: &Tensor<T>) -> Result<()> {
    if output.is_on_device() {
        return Err(Error::precondition("CPU operators write host tensors only"));
    }
    Ok(())
}

/// Splits `input` along `axis` into `outputs.len()` equal parts.
///
/// Every output is resized to the input shape with `axis` set to
/// `input.dim(axis) / outputs.len()`; a remainder is dropped.
///
/// # Example
/// ```rust
/// use ferrokern::ops::cpu::slice;
/// use ferrokern::tensors::Tensor;
///
/// let input = Tensor::new(vec![1, 4], vec![1, 2, 3, 4]);
/// let mut outputs = vec![Tensor::empty(), Tensor::empty()];
/// slice(&input, 1, &mut outputs).unwrap();
/// assert_eq!(outputs[1].data().unwrap(), &[3, 4]);
/// ```
pub fn slice<T: Element>(input: &Tensor<T>, axis: usize, outputs: &mut [Tensor<T>]) -> Result<()> {
    ensure!(axis < input.rank(), "slice axis {axis} out of range for shape {:?}", input.shape());
    ensure!(!outputs.is_empty(), "slice needs at least one output");

    let input_channels = input.dim(axis);
    let output_channels = input_channels / outputs.len();
    let mut output_shape = input.shape().to_vec();
    output_shape[axis] = output_channels;
    let inner: usize = output_shape[axis + 1..].iter().product();
    let run = output_channels * inner;
    let in_stride = input_channels * inner;

    let src = input.data()?;
    for (i, output) in outputs.iter_mut().enumerate() {
        ensure_host(output)?;
        output.resize(&output_shape)?;
        if run == 0 {
            continue;
        }
        let offset = i * run;
        output
            .data_mut()?
            .par_chunks_mut(run)
            .enumerate()
            .for_each(|(outer, dst)| {
                let start = outer * in_stride + offset;
                T::copy_run(dst, &src[start..start + run]);
            });
    }
    Ok(())
}

/// Shuffles the channels of an NHWC tensor across `groups`.
///
/// Output channel `c * groups + g` takes input channel `g * channels_per_group + c`.
pub fn channel_shuffle<T: Element>(input: &Tensor<T>, groups: usize, output: &mut Tensor<T>) -> Result<()> {
    ensure!(input.rank() == 4, "channel shuffle expects NHWC input, got shape {:?}", input.shape());
    let channels = input.dim(3);
    ensure!(
        groups > 0 && channels % groups == 0,
        "channels ({channels}) must be divisible by groups ({groups})"
    );
    let channels_per_group = channels / groups;

    ensure_host(output)?;
    output.resize_like(input)?;
    if channels == 0 {
        return Ok(());
    }
    let src = input.data()?;
    output
        .data_mut()?
        .par_chunks_mut(channels)
        .zip(src.par_chunks(channels))
        .for_each(|(dst, pixel)| {
            for g in 0..groups {
                for c in 0..channels_per_group {
                    dst[c * groups + g].clone_from(&pixel[g * channels_per_group + c]);
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_drops_the_remainder() {
        let input = Tensor::new(vec![2, 5], (0..10).collect::<Vec<i32>>());
        let mut outputs = vec![Tensor::empty(), Tensor::empty()];
        slice(&input, 1, &mut outputs).unwrap();
        assert_eq!(outputs[0].shape(), &[2, 2]);
        assert_eq!(outputs[0].data().unwrap(), &[0, 1, 5, 6]);
        assert_eq!(outputs[1].data().unwrap(), &[2, 3, 7, 8]);
    }

    #[test]
    fn shuffle_with_one_group_is_identity() {
        let input = Tensor::new(vec![1, 1, 2, 3], vec![1u8, 2, 3, 4, 5, 6]);
        let mut output = Tensor::empty();
        channel_shuffle(&input, 1, &mut output).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn shuffle_interleaves_groups() {
        let input = Tensor::new(vec![1, 1, 1, 6], vec![0, 1, 2, 10, 11, 12]);
        let mut output = Tensor::empty();
        channel_shuffle(&input, 2, &mut output).unwrap();
        assert_eq!(output.data().unwrap(), &[0, 10, 1, 11, 2, 12]);
    }
}
