//! Configurations of storages.
//!
//! Every configuration can be built with builder-style setters and
//! loaded from or saved to a YAML file:
//!
//! ```rust
//! use border_storage::storage::TensorStorageConfig;
//!
//! let config = TensorStorageConfig::default()
//!     .max_size(1000)
//!     .ndim(2)
//!     .compilable(true);
//! ```
use crate::record::{Device, DeviceSpec};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

macro_rules! impl_yaml_io {
    ($config:ty) => {
        impl $config {
            /// Loads the configuration from a YAML file.
            ///
            /// # Arguments
            ///
            /// * `path` - Path to the configuration file
            ///
            /// # Errors
            ///
            /// Returns an error if the file cannot be read or parsed
            pub fn load(path: impl AsRef<Path>) -> Result<Self> {
                let file = File::open(path)?;
                let rdr = BufReader::new(file);
                let b = serde_yaml::from_reader(rdr)?;
                Ok(b)
            }

            /// Saves the configuration to a YAML file.
            ///
            /// # Arguments
            ///
            /// * `path` - Path where the configuration should be saved
            ///
            /// # Errors
            ///
            /// Returns an error if the file cannot be written
            pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
                let mut file = File::create(path)?;
                file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
                Ok(())
            }
        }
    };
}

/// Configuration of [`ListStorage`](super::ListStorage).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct ListStorageConfig {
    /// Maximum number of items. Unbounded if `None`.
    pub max_size: Option<usize>,

    /// Device every written item is moved to. Items are kept as they are if `None`.
    pub device: Option<Device>,

    /// If `true`, the length is kept in a plain in-process counter.
    pub compilable: bool,
}

impl ListStorageConfig {
    /// Sets the capacity.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sets the device of the stored items.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the `compilable` flag.
    pub fn compilable(mut self, compilable: bool) -> Self {
        self.compilable = compilable;
        self
    }
}

impl_yaml_io!(ListStorageConfig);

/// Configuration of [`LazyStackStorage`](super::LazyStackStorage).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct LazyStackStorageConfig {
    /// Maximum number of items. Unbounded if `None`.
    pub max_size: Option<usize>,

    /// Device every written item is moved to.
    pub device: Option<Device>,

    /// If `true`, the length is kept in a plain in-process counter.
    pub compilable: bool,

    /// Axis along which sampled items are stacked.
    ///
    /// A negative value is resolved relative to the number of batch
    /// dimensions of the items, as `ndim + 1 + stack_dim`.
    pub stack_dim: i64,
}

impl LazyStackStorageConfig {
    /// Sets the capacity.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sets the device of the stored items.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the `compilable` flag.
    pub fn compilable(mut self, compilable: bool) -> Self {
        self.compilable = compilable;
        self
    }

    /// Sets the stacking axis.
    pub fn stack_dim(mut self, stack_dim: i64) -> Self {
        self.stack_dim = stack_dim;
        self
    }
}

impl_yaml_io!(LazyStackStorageConfig);

/// Configuration of a pre-allocated [`TensorStorage`](super::TensorStorage)
/// living in process memory.
///
/// # Fields
///
/// * `max_size` - Capacity. With `ndim > 1` it counts elements over the
///   leading `ndim` axes and is rounded up to a whole number of rows.
/// * `ndim` - Number of leading axes that count toward the capacity
/// * `device` - Device of the buffers, or [`DeviceSpec::Auto`] to take the
///   device of the first record
/// * `compilable` - If `true`, the length is kept in a plain in-process counter
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct TensorStorageConfig {
    /// Capacity.
    pub max_size: usize,

    /// Number of leading axes that count toward the capacity.
    pub ndim: usize,

    /// Device of the buffers.
    pub device: DeviceSpec,

    /// Whether the length counter stays in process memory.
    pub compilable: bool,
}

impl Default for TensorStorageConfig {
    fn default() -> Self {
        Self {
            max_size: 10000,
            ndim: 1,
            device: DeviceSpec::default(),
            compilable: false,
        }
    }
}

impl TensorStorageConfig {
    /// Sets the capacity.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the number of capacity axes.
    pub fn ndim(mut self, ndim: usize) -> Self {
        self.ndim = ndim;
        self
    }

    /// Sets the device of the buffers.
    pub fn device(mut self, device: impl Into<DeviceSpec>) -> Self {
        self.device = device.into();
        self
    }

    /// Sets the `compilable` flag.
    pub fn compilable(mut self, compilable: bool) -> Self {
        self.compilable = compilable;
        self
    }
}

impl_yaml_io!(TensorStorageConfig);

/// Configuration of a file-backed [`TensorStorage`](super::TensorStorage).
///
/// Leaf buffers are created as files under `scratch_dir`, one per field
/// path. If `scratch_dir` is `None`, a fresh directory under the temporary
/// directory of the system is used.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct MemmapStorageConfig {
    /// Capacity.
    pub max_size: usize,

    /// Number of leading axes that count toward the capacity.
    pub ndim: usize,

    /// Device of the buffers. Only CPU placement is supported.
    pub device: DeviceSpec,

    /// Directory of the leaf files.
    pub scratch_dir: Option<PathBuf>,

    /// Whether existing leaf files of the right size are reused.
    pub existsok: bool,

    /// Whether the length counter stays in process memory.
    pub compilable: bool,
}

impl Default for MemmapStorageConfig {
    fn default() -> Self {
        Self {
            max_size: 10000,
            ndim: 1,
            device: DeviceSpec::default(),
            scratch_dir: None,
            existsok: false,
            compilable: false,
        }
    }
}

impl MemmapStorageConfig {
    /// Sets the capacity.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the number of capacity axes.
    pub fn ndim(mut self, ndim: usize) -> Self {
        self.ndim = ndim;
        self
    }

    /// Sets the device of the buffers.
    pub fn device(mut self, device: impl Into<DeviceSpec>) -> Self {
        self.device = device.into();
        self
    }

    /// Sets the directory of the leaf files.
    pub fn scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(scratch_dir.into());
        self
    }

    /// Sets the `existsok` flag.
    pub fn existsok(mut self, existsok: bool) -> Self {
        self.existsok = existsok;
        self
    }

    /// Sets the `compilable` flag.
    pub fn compilable(mut self, compilable: bool) -> Self {
        self.compilable = compilable;
        self
    }
}

impl_yaml_io!(MemmapStorageConfig);

/// Configuration of [`CompressedListStorage`](super::CompressedListStorage).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct CompressedListStorageConfig {
    /// Capacity.
    pub max_size: usize,

    /// Level of the default zstd compressor.
    pub compression_level: i32,

    /// Device the decompressed items are moved to. The recorded device is used if `None`.
    pub device: Option<Device>,

    /// Whether the length counter stays in process memory.
    pub compilable: bool,
}

impl Default for CompressedListStorageConfig {
    fn default() -> Self {
        Self {
            max_size: 10000,
            compression_level: 3,
            device: None,
            compilable: false,
        }
    }
}

impl CompressedListStorageConfig {
    /// Sets the capacity.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the compression level.
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the device of the decompressed items.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the `compilable` flag.
    pub fn compilable(mut self, compilable: bool) -> Self {
        self.compilable = compilable;
        self
    }
}

impl_yaml_io!(CompressedListStorageConfig);
