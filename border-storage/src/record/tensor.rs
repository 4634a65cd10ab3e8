//! Dense tensors, the leaves of records.
use crate::error::StorageError;
use anyhow::Result;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

/// Element type of a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Boolean, stored as one byte.
    Bool,
}

impl DType {
    /// Size of an element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::U8 | DType::I8 | DType::Bool => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::U8 => "uint8",
            DType::I8 => "int8",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

/// Logical placement tag of a tensor.
///
/// Storages keep every buffer in host memory; the tag records where the data
/// is meant to live and is carried through writes, reads and compression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory.
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// Shape-only placement without data.
    Meta,
    /// Any other named placement.
    Other(String),
}

impl Device {
    /// Returns `true` for CPU-class placement.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
            Device::Meta => write!(f, "meta"),
            Device::Other(s) => write!(f, "{}", s),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Ok(match s {
            "cpu" => Device::Cpu,
            "cuda" => Device::Cuda(0),
            "meta" => Device::Meta,
            _ => match s.strip_prefix("cuda:") {
                Some(ordinal) => Device::Cuda(ordinal.parse().map_err(|_| {
                    StorageError::Config(format!("invalid device string '{}'", s))
                })?),
                None => Device::Other(s.to_string()),
            },
        })
    }
}

/// Device of a storage: fixed, or inferred from the first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSpec {
    /// Take the device of the first record written to the storage.
    Auto,
    /// Always place the data on this device.
    Fixed(Device),
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec::Fixed(Device::Cpu)
    }
}

impl From<Device> for DeviceSpec {
    fn from(device: Device) -> Self {
        DeviceSpec::Fixed(device)
    }
}

/// Rust scalar types that can be held in a [`Tensor`].
pub trait Element: Copy + Default + 'static {
    /// The corresponding element type.
    const DTYPE: DType;

    /// Appends the native-endian bytes of the value.
    fn write_ne(&self, out: &mut Vec<u8>);

    /// Reads a value from exactly `DTYPE.size()` native-endian bytes.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_ne(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn read_ne(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(buf)
            }
        }
    };
}

impl_element!(u8, DType::U8);
impl_element!(i8, DType::I8);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn write_ne(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// A dense, row-major array of a single element type.
///
/// The byte payload is reference counted: cloning a tensor, or a record
/// holding it, never copies the array data. Use [`Tensor::shares_data`] to
/// check whether two tensors are backed by the same payload.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    device: Device,
    data: Arc<Vec<u8>>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={:?}, dtype={}, device={})",
            self.shape, self.dtype, self.device
        )
    }
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    /// Builds a tensor from raw native-endian bytes.
    pub fn from_bytes(bytes: Vec<u8>, dtype: DType, shape: &[usize], device: Device) -> Result<Self> {
        let expected = numel(shape) * dtype.size();
        if bytes.len() != expected {
            return Err(StorageError::Type(format!(
                "{} bytes cannot be viewed as a {} tensor of shape {:?} ({} bytes expected)",
                bytes.len(),
                dtype,
                shape,
                expected
            ))
            .into());
        }
        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            device,
            data: Arc::new(bytes),
        })
    }

    /// Builds a CPU tensor from a vector of elements.
    pub fn from_vec<T: Element>(values: Vec<T>, shape: &[usize]) -> Result<Self> {
        let mut bytes = Vec::with_capacity(values.len() * T::DTYPE.size());
        values.iter().for_each(|v| v.write_ne(&mut bytes));
        Self::from_bytes(bytes, T::DTYPE, shape, Device::Cpu)
    }

    /// Builds a CPU tensor from an [`ndarray`] array, in logical order.
    pub fn from_array<T: Element>(array: ArrayD<T>) -> Self {
        let mut bytes = Vec::with_capacity(array.len() * T::DTYPE.size());
        array.iter().for_each(|v| v.write_ne(&mut bytes));
        Self {
            dtype: T::DTYPE,
            shape: array.shape().to_vec(),
            device: Device::Cpu,
            data: Arc::new(bytes),
        }
    }

    /// A zero-dimensional CPU tensor.
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut bytes = Vec::with_capacity(T::DTYPE.size());
        value.write_ne(&mut bytes);
        Self {
            dtype: T::DTYPE,
            shape: vec![],
            device: Device::Cpu,
            data: Arc::new(bytes),
        }
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            device,
            data: Arc::new(vec![0u8; numel(shape) * dtype.size()]),
        }
    }

    /// Converts the tensor into an [`ndarray`] array of the matching element type.
    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>> {
        let values = self.to_vec::<T>()?;
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), values)?)
    }

    /// Copies the elements out in row-major order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(StorageError::Type(format!(
                "cannot read a {} tensor as {}",
                self.dtype,
                T::DTYPE
            ))
            .into());
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::read_ne)
            .collect())
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Placement tag.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// Size of the payload in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Raw payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` if both tensors are backed by the same payload.
    pub fn shares_data(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Re-tags the tensor with another device without copying the payload.
    pub fn to_device(&self, device: &Device) -> Tensor {
        Self {
            device: device.clone(),
            ..self.clone()
        }
    }

    /// Views the payload with another shape of the same number of elements.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        if numel(shape) != self.numel() {
            return Err(StorageError::Type(format!(
                "cannot reshape a tensor of shape {:?} into {:?}",
                self.shape, shape
            ))
            .into());
        }
        Ok(Self {
            shape: shape.to_vec(),
            ..self.clone()
        })
    }

    /// Bytes occupied by one item along the leading axis.
    fn item_nbytes(&self) -> usize {
        numel(&self.shape[1..]) * self.dtype.size()
    }

    fn leading_dim(&self) -> Result<usize> {
        self.shape.first().copied().ok_or_else(|| {
            StorageError::Type("a zero-dimensional tensor has no leading axis".into()).into()
        })
    }

    /// Gathers items along the leading axis.
    pub fn select(&self, ixs: &[usize]) -> Result<Tensor> {
        let n = self.leading_dim()?;
        let slab = self.item_nbytes();
        let mut bytes = Vec::with_capacity(ixs.len() * slab);
        for &ix in ixs {
            if ix >= n {
                return Err(StorageError::Index(format!(
                    "index {} is out of bounds for axis 0 with size {}",
                    ix, n
                ))
                .into());
            }
            bytes.extend_from_slice(&self.data[ix * slab..(ix + 1) * slab]);
        }
        let mut shape = self.shape.clone();
        shape[0] = ixs.len();
        Tensor::from_bytes(bytes, self.dtype, &shape, self.device.clone())
    }

    /// Splits the tensor into its items along the leading axis.
    pub fn unbind(&self) -> Result<Vec<Tensor>> {
        let n = self.leading_dim()?;
        let slab = self.item_nbytes();
        (0..n)
            .map(|i| {
                Tensor::from_bytes(
                    self.data[i * slab..(i + 1) * slab].to_vec(),
                    self.dtype,
                    &self.shape[1..],
                    self.device.clone(),
                )
            })
            .collect()
    }

    /// Stacks tensors of identical shape and dtype along a new axis `dim`.
    pub fn stack(tensors: &[Tensor], dim: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| StorageError::Type("cannot stack an empty list of tensors".into()))?;
        if dim > first.ndim() {
            return Err(StorageError::Index(format!(
                "stack dimension {} is out of range for tensors with {} dimensions",
                dim,
                first.ndim()
            ))
            .into());
        }
        for t in tensors.iter() {
            if t.shape != first.shape || t.dtype != first.dtype {
                return Err(StorageError::Type(format!(
                    "cannot stack tensors of shape/dtype {:?}/{} and {:?}/{}",
                    first.shape, first.dtype, t.shape, t.dtype
                ))
                .into());
            }
        }
        let outer = numel(&first.shape[..dim]);
        let chunk = numel(&first.shape[dim..]) * first.dtype.size();
        let mut bytes = Vec::with_capacity(outer * chunk * tensors.len());
        for o in 0..outer {
            for t in tensors.iter() {
                bytes.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        let mut shape = first.shape.clone();
        shape.insert(dim, tensors.len());
        Tensor::from_bytes(bytes, first.dtype, &shape, first.device.clone())
    }
}
