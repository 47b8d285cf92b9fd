//! Tensors, element types and their storage.
//!
//! # Core Tensor Utilities
//!
//! A [`Tensor`] is a shape plus storage. Storage is either a host vector or a
//! [`DeviceBuffer`] owned by a compute device. Functors read and write tensors
//! that the caller owns; they never keep them.
//!
//! ## Design Highlights
//! - Row-major layout; 4-D image tensors use the NHWC convention
//! - Shape is a `Vec<usize>` checked at runtime
//! - [`Element`] types know how to copy runs of themselves
//! - [`DeviceElement`] types (`f32`, `i32`, `u32`) can also live on a GPU
//! - The `tensor!` macro builds host tensors from nested literal arrays
//!
//! ## Example
//!
//! ```rust
//! use ferrokern::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape(), &[2, 3]);
//! ```

use crate::error::{Error, Result};
use crate::runtime::{ComputeRuntime, DeviceBuffer};

/// A type that can be stored in a [`Tensor`].
///
/// `copy_run` is the slab copy used by the CPU kernels. The default clones
/// element by element; plain-old-data types override it with a bulk copy.
pub trait Element: Clone + Default + Send + Sync + 'static {
    /// Copies `src` into `dst`. Both slices have the same length.
    fn copy_run(dst: &mut [Self], src: &[Self]) {
        for (d, s) in dst.iter_mut().zip(src) {
            d.clone_from(s);
        }
    }
}

macro_rules! pod_element {
    ($($t:ty),* $(,)?) => {
        $(
            impl Element for $t {
                #[inline]
                fn copy_run(dst: &mut [Self], src: &[Self]) {
                    dst.copy_from_slice(src);
                }
            }
        )*
    };
}

pod_element!(bool, u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// An element with a 32-bit little-endian device representation.
pub trait DeviceElement: Element + Copy {
    /// Name of the type inside kernel sources.
    const KERNEL_TYPE: &'static str;

    /// Little-endian bytes of `self`.
    fn to_le(self) -> [u8; 4];

    /// Reads a value from little-endian bytes.
    fn from_le(bytes: [u8; 4]) -> Self;
}

macro_rules! device_element {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl DeviceElement for $t {
                const KERNEL_TYPE: &'static str = $name;

                fn to_le(self) -> [u8; 4] {
                    self.to_le_bytes()
                }

                fn from_le(bytes: [u8; 4]) -> Self {
                    <$t>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

device_element! {
    f32 => "f32",
    i32 => "i32",
    u32 => "u32",
}

/// Serializes device elements into a byte vector.
pub fn encode_elements<T: DeviceElement>(values: &[T]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le()).collect()
}

/// Deserializes device elements; trailing bytes that do not form a full word are ignored.
pub fn decode_elements<T: DeviceElement>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(4)
        .map(|c| T::from_le([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Backing memory of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage<T> {
    /// Host vector in row-major order.
    Host(Vec<T>),
    /// Device buffer holding the same row-major layout.
    Device(DeviceBuffer),
}

/// Represents an N-dimensional tensor with a shape and row-major storage.
///
/// Cloning a device tensor shares its buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    storage: Storage<T>,
}

impl<T: Element> Tensor<T> {
    /// Creates a host tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            storage: Storage::Host(data),
        }
    }

    /// A host tensor filled with `T::default()`.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            storage: Storage::Host(vec![T::default(); len]),
        }
    }

    /// An empty host tensor, typically an output that a functor will resize.
    pub fn empty() -> Self {
        Self {
            shape: vec![0],
            storage: Storage::Host(Vec::new()),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of dimension `index`.
    ///
    /// # Panics
    /// Panics if `index` is not below the rank.
    pub fn dim(&self, index: usize) -> usize {
        self.shape[index]
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn storage(&self) -> &Storage<T> {
        &self.storage
    }

    pub fn is_on_device(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    /// The device buffer, if this tensor is device-resident.
    pub fn device_buffer(&self) -> Option<&DeviceBuffer> {
        match &self.storage {
            Storage::Device(buf) => Some(buf),
            Storage::Host(_) => None,
        }
    }

    /// Host data in row-major order.
    ///
    /// # Errors
    /// Fails if the tensor lives on a device.
    pub fn data(&self) -> Result<&[T]> {
        match &self.storage {
            Storage::Host(data) => Ok(data),
            Storage::Device(_) => Err(Error::precondition("tensor is device-resident")),
        }
    }

    /// Mutable host data in row-major order.
    ///
    /// # Errors
    /// Fails if the tensor lives on a device.
    pub fn data_mut(&mut self) -> Result<&mut [T]> {
        match &mut self.storage {
            Storage::Host(data) => Ok(data),
            Storage::Device(_) => Err(Error::precondition("tensor is device-resident")),
        }
    }

    /// Changes the shape, reallocating storage when the element count changes.
    ///
    /// Host contents are truncated or padded with `T::default()`. A device
    /// buffer keeps its identity when its byte size is unchanged; otherwise a
    /// fresh buffer is allocated on the same device.
    pub fn resize(&mut self, shape: &[usize]) -> Result<()> {
        let len: usize = shape.iter().product();
        match &mut self.storage {
            Storage::Host(data) => data.resize(len, T::default()),
            Storage::Device(buf) => {
                let bytes = len * core::mem::size_of::<T>();
                if buf.len() != bytes {
                    *buf = DeviceBuffer::allocate(buf.device(), bytes)?;
                }
            }
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// Resizes to the shape of `other`.
    pub fn resize_like<U: Element>(&mut self, other: &Tensor<U>) -> Result<()> {
        self.resize(other.shape())
    }

    #[doc(hidden)]
    pub fn into_host_vec(self) -> Vec<T> {
        match self.storage {
            Storage::Host(data) => data,
            Storage::Device(_) => Vec::new(),
        }
    }
}

impl<T: DeviceElement> Tensor<T> {
    /// A zero-filled tensor allocated on the runtime's device.
    pub fn on_device(runtime: &ComputeRuntime, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        let len: usize = shape.iter().product();
        let buf = runtime.allocate(len * core::mem::size_of::<T>())?;
        Ok(Self {
            shape,
            storage: Storage::Device(buf),
        })
    }

    /// Copies this tensor to the runtime's device. Device tensors are returned as-is.
    pub fn to_device(&self, runtime: &ComputeRuntime) -> Result<Self> {
        match &self.storage {
            Storage::Device(_) => Ok(self.clone()),
            Storage::Host(data) => {
                let bytes = encode_elements(data);
                let buf = runtime.allocate(bytes.len())?;
                buf.write(&bytes)?;
                Ok(Self {
                    shape: self.shape.clone(),
                    storage: Storage::Device(buf),
                })
            }
        }
    }

    /// Copies this tensor back to host memory.
    pub fn to_host(&self) -> Result<Self> {
        match &self.storage {
            Storage::Host(_) => Ok(self.clone()),
            Storage::Device(buf) => {
                let mapped = buf.map()?;
                let data: Vec<T> = decode_elements(&mapped);
                Ok(Self::new(self.shape.clone(), data))
            }
        }
    }
}

/// Defines a host tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use ferrokern::tensor;
/// let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(::std::vec::Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = ::std::vec::Vec::with_capacity(children.len() * children[0].len());
        for c in children { data.extend(c.into_host_vec()); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
