//! ferrokern: heterogeneous operator execution with GPU kernel autotuning.
//!
//! Neural-network operators run either on a multi-threaded CPU pool or as GPU
//! compute kernels. The GPU path compiles kernels lazily, caches programs per
//! build-option set, rebinds arguments only when input shapes change, and
//! tunes launch parameters once per kernel signature, persisting the results.
//!
//! # Features
//!
//! - Device-polymorphic operator functors chosen once at construction
//! - GPU kernel lifecycle with an explicit `Uninitialized → Built → Bound` state
//! - Local work-group size autotuning backed by a pluggable key-value store
//! - Optional device-side out-of-range checks reported as fatal errors
//!
//! # Modules
//!
//! - [`tensors`] — tensors, element types and device transfer
//! - [`runtime`] — compute runtime, device seam, kernel programs, CPU pool
//! - [`tuning`] — the autotuner and its records
//! - [`storage`] — key-value stores for tuned parameters
//! - [`ops`] — channel shuffle and slice functors
//! - [`future`] — timing handles returned by functor calls
//!
//! # Cargo Features
//!
//! - `wgpu` — a real GPU device built on `wgpu`
//! - `obfuscate` — hash kernel entry-point names
//!
//! # Example
//!
//! ```rust
//! use ferrokern::backend::DeviceType;
//! use ferrokern::ops::{ExecContext, Slice};
//! use ferrokern::runtime::ThreadPolicy;
//! use ferrokern::tensor;
//!
//! let ctx = ExecContext::cpu_only(&ThreadPolicy::default()).unwrap();
//! let mut slice = Slice::<i32>::new(DeviceType::Cpu, 0, &ctx);
//! let input = tensor!([[1, 2], [3, 4]]);
//! let mut outputs = vec![ferrokern::tensors::Tensor::empty(), ferrokern::tensors::Tensor::empty()];
//! slice.run(&input, &mut outputs, None).unwrap();
//! assert_eq!(outputs[1].data().unwrap(), &[3, 4]);
//! ```

pub mod backend;
pub mod error;
pub mod future;
pub mod ops;
pub mod runtime;
pub mod storage;
pub mod tensors;
pub mod tuning;

pub use error::{Error, Result};
