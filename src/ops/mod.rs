//! # Operator Functors
//!
//! This module defines the operators and dispatches them across the compute
//! backends: the rayon CPU pool and GPU kernels run through a
//! [`ComputeRuntime`](crate::runtime::ComputeRuntime).
//!
//! ## Submodules
//!
//! - [`cpu`] — multi-threaded host kernels (default fallback backend)
//! - [`gpu`] — GPU functors with lazy build, rebind-on-shape-change and tuning
//! - [`dispatch`] — per-operator enums picking a backend once at construction
//!
//! ## Backend Selection
//!
//! Callers name a [`DeviceType`](crate::backend::DeviceType) when constructing a
//! functor; from then on the functor is a fixed CPU or GPU implementation.
//!
//! Example:
//! ```rust
//! use ferrokern::backend::DeviceType;
//! use ferrokern::ops::{ChannelShuffle, ExecContext};
//! use ferrokern::runtime::ThreadPolicy;
//! use ferrokern::tensors::Tensor;
//!
//! let ctx = ExecContext::cpu_only(&ThreadPolicy::default()).unwrap();
//! // no runtime in this context, so the GPU request falls back to the CPU
//! let mut shuffle = ChannelShuffle::<f32>::new(DeviceType::Gpu, 2, &ctx);
//! assert_eq!(shuffle.device_type(), DeviceType::Cpu);
//!
//! let input = Tensor::new(vec![1, 1, 1, 4], vec![0.0, 1.0, 2.0, 3.0]);
//! let mut output = Tensor::empty();
//! shuffle.run(&input, &mut output, None).unwrap();
//! assert_eq!(output.data().unwrap(), &[0.0, 2.0, 1.0, 3.0]);
//! ```
//!
//! ## Extending
//!
//! To add an operator:
//!
//! 1. Write the host kernel in `cpu` and the functor in `gpu`, with its WGSL
//!    program registered in [`runtime::program`](crate::runtime::program)
//! 2. Add a dispatch enum for it
//! 3. Check preconditions before building anything

pub mod cpu;
pub mod dispatch;
pub mod gpu;

pub use dispatch::{ChannelShuffle, ExecContext, Slice};
