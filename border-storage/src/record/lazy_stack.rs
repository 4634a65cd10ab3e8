//! Lazily stacked records.
use super::{FieldPath, Record, Tensor};
use crate::error::StorageError;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Items presented as if they were stacked along `stack_dim`.
///
/// The items are kept as they were written: no array data is copied until
/// [`LazyStackedRecord::to_dense`] is called. Selecting a field keeps the
/// result lazy, so the tensors of the view share their payload with the
/// stored items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyStackedRecord {
    items: Vec<Record>,
    stack_dim: usize,
}

impl LazyStackedRecord {
    /// Creates a lazy stack of `items` along `stack_dim`.
    ///
    /// `stack_dim` may be at most the number of batch dimensions of the items.
    pub fn new(items: Vec<Record>, stack_dim: usize) -> Result<Self> {
        if let Some(first) = items.first() {
            let ndim = first.ndim();
            if stack_dim > ndim {
                return Err(StorageError::Index(format!(
                    "stack_dim {} is out of range for items with {} batch dimensions",
                    stack_dim, ndim
                ))
                .into());
            }
        }
        Ok(Self { items, stack_dim })
    }

    /// Number of stacked items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if there is no item.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Axis along which the items are stacked.
    pub fn stack_dim(&self) -> usize {
        self.stack_dim
    }

    /// The stacked items.
    pub fn items(&self) -> &[Record] {
        &self.items
    }

    /// Gets the `i`-th item.
    pub fn item(&self, i: usize) -> Option<&Record> {
        self.items.get(i)
    }

    pub(crate) fn into_items(self) -> Vec<Record> {
        self.items
    }

    /// Shape of the stack: the batch shape of the first item with the number
    /// of items inserted at `stack_dim`.
    pub fn batch_shape(&self) -> Vec<usize> {
        let mut shape = self
            .items
            .first()
            .map(|r| r.batch_shape())
            .unwrap_or_default();
        let dim = self.stack_dim.min(shape.len());
        shape.insert(dim, self.items.len());
        shape
    }

    /// Lazy stack of a field of every item.
    pub fn field(&self, name: &str) -> Result<LazyStackedRecord> {
        self.field_path(&FieldPath::new([name]))
    }

    /// Lazy stack of a nested field of every item.
    pub fn field_path(&self, path: &FieldPath) -> Result<LazyStackedRecord> {
        let items = self
            .items
            .iter()
            .map(|r| {
                r.get_path(path).cloned().ok_or_else(|| {
                    StorageError::Index(format!("field '{}' is missing in a stacked item", path))
                        .into()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            items,
            stack_dim: self.stack_dim,
        })
    }

    /// Materializes the stack by copying the items into contiguous tensors.
    pub fn to_dense(&self) -> Result<Record> {
        let first = self.items.first().ok_or_else(|| {
            StorageError::Type("cannot materialize an empty lazy stack".into())
        })?;
        let (_, spec) = first.flatten()?;
        let mut columns: Vec<Vec<Tensor>> = vec![vec![]; spec.num_leaves()];
        for item in self.items.iter() {
            let (leaves, s) = item.flatten()?;
            if s != spec {
                return Err(StorageError::Type(
                    "stacked items do not share the same tree structure".into(),
                )
                .into());
            }
            leaves
                .into_iter()
                .zip(columns.iter_mut())
                .for_each(|(t, col)| col.push(t));
        }
        let leaves = columns
            .iter()
            .map(|col| Tensor::stack(col, self.stack_dim))
            .collect::<Result<Vec<_>>>()?;
        Record::unflatten(leaves, &spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_field_shares_data() -> Result<()> {
        let items = (0..3)
            .map(|i| -> Result<Record> {
                Ok(Record::from_fields([(
                    "obs",
                    Record::Tensor(Tensor::from_vec(vec![i as f32; 4], &[2, 2])?),
                )]))
            })
            .collect::<Result<Vec<_>>>()?;
        let stack = LazyStackedRecord::new(items.clone(), 1)?;
        assert_eq!(stack.batch_shape(), vec![2, 3, 2]);

        let obs = stack.field("obs")?;
        let a = obs.item(2).and_then(Record::as_tensor).unwrap();
        let b = items[2].field("obs").and_then(Record::as_tensor).unwrap();
        assert!(a.shares_data(b));

        let dense = stack.to_dense()?;
        let t = dense.field("obs").and_then(Record::as_tensor).unwrap();
        assert_eq!(t.shape(), &[2, 3, 2]);
        Ok(())
    }

    #[test]
    fn test_stack_dim_out_of_range() -> Result<()> {
        let item = Record::Tensor(Tensor::from_vec(vec![0u8; 2], &[2])?);
        assert!(LazyStackedRecord::new(vec![item], 2).is_err());
        Ok(())
    }
}
