#![warn(missing_docs)]
//! Storages of replay buffers for reinforcement learning.
//!
//! A storage is a fixed-capacity container of [`Record`]s. Writers hand a
//! cursor and a record to [`Storage::set`]; samplers read the items at an
//! index with [`Storage::get`].
//!
//! ```rust
//! use border_storage::{
//!     record::{Record, Tensor},
//!     storage::{Storage, TensorStorage, TensorStorageConfig},
//! };
//! # fn main() -> anyhow::Result<()> {
//! let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(100))?;
//! let obs = Tensor::from_vec(vec![0f32; 4 * 3], &[4, 3])?;
//! storage.set(&(0..4).into(), Record::from_fields([("obs", Record::Tensor(obs))]), true)?;
//! assert_eq!(storage.len(), 4);
//!
//! let batch = storage.get(&vec![0usize, 3].into())?;
//! assert_eq!(batch.batch_shape(), vec![2, 3]);
//! # Ok(())
//! # }
//! ```
pub mod error;
pub mod index;
pub mod record;
pub mod storage;

pub use error::StorageError;
pub use index::{Cursor, Index};
pub use record::Record;
pub use storage::Storage;
