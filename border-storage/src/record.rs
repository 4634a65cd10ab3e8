//! Records written to and read from storages.
//!
//! A [`Record`] is the logical unit handled by every storage:
//!
//! * [`Record::Tensor`] - a single dense array,
//! * [`Record::Struct`] - a tree of named fields whose leaves are tensors or
//!   opaque [`Value`]s,
//! * [`Record::List`] - a sequence of items, e.g., a batch returned by a
//!   list-backed storage,
//! * [`Record::Stacked`] - items presented as stacked along an axis without
//!   copying them.
//!
//! ```rust
//! use border_storage::record::{Record, Tensor, Value};
//! # fn main() -> anyhow::Result<()> {
//! let transition = Record::from_fields([
//!     ("obs", Record::Tensor(Tensor::from_vec(vec![0f32, 1., 2.], &[3])?)),
//!     ("reward", Record::Tensor(Tensor::scalar(1f32))),
//!     ("info", Record::Value(Value::from("ok"))),
//! ]);
//! let (leaves, spec) = transition.flatten()?;
//! assert_eq!(leaves.len(), 2);
//! assert_eq!(Record::unflatten(leaves, &spec)?, transition);
//! # Ok(())
//! # }
//! ```
mod base;
mod lazy_stack;
mod tensor;
pub use base::{FieldPath, Fields, Record, TreeSpec, Value};
pub use lazy_stack::LazyStackedRecord;
pub use tensor::{DType, Device, DeviceSpec, Element, Tensor};
