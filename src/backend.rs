//! Device-type tags.
//!
//! Every operator functor is constructed for exactly one [`DeviceType`]. The tag
//! is consulted once, at construction, to pick the CPU or GPU implementation;
//! nothing on the execution path branches on it again.
//!
//! # Supported Devices
//!
//! - `Cpu` — rayon worker pool over host memory (default, always available).
//! - `Gpu` — compute kernels on the device owned by a
//!   [`ComputeRuntime`](crate::runtime::ComputeRuntime).

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;

/// Enumeration of the devices an operator can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeviceType {
    /// Host execution on the CPU worker pool (default).
    #[default]
    Cpu = 0,
    /// Compute kernels on the GPU.
    Gpu,
}

impl TryFrom<u8> for DeviceType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Gpu),
            _ => Err(()),
        }
    }
}

impl FromStr for DeviceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "opencl" | "wgpu" => Ok(Self::Gpu),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu => f.write_str("gpu"),
        }
    }
}
