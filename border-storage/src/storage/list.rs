//! List-backed storages.
use super::{
    AttachedEntities, Entity, LazyStackStorageConfig, ListStorageCheckpointer,
    ListStorageConfig, SharedRng, StateDict, Storage, StorageCheckpointer,
};
use crate::{
    error::StorageError,
    index::{resolve_int, slice_indices, Cursor, Index},
    record::{Device, LazyStackedRecord, Record},
};
use anyhow::Result;
use std::{fmt, path::Path, sync::Arc};

/// Slots of a list-backed storage, written through [`set_items`].
pub(crate) trait ItemSlots {
    fn storage_name(&self) -> &'static str;

    fn capacity(&self) -> usize;

    /// Raw length of the backing sequence.
    fn slots_len(&self) -> usize;

    fn device(&self) -> Option<&Device>;

    /// Writes at `cursor <= slots_len()`.
    fn write_item(&mut self, cursor: usize, data: Record) -> Result<()>;

    /// Writes the items of a slice cursor.
    fn write_slice(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        items: Vec<Record>,
    ) -> Result<()>;
}

/// Splits a record used as a batch into its items.
pub(crate) fn batch_items(name: &str, data: Record) -> Result<Vec<Record>> {
    match data {
        Record::Value(_) => Err(StorageError::Type(format!(
            "Cannot extend a {} with data of type {}. \
             Provide a list, tensor, struct or lazy stack instead.",
            name,
            data.kind()
        ))
        .into()),
        data => data.unbind(),
    }
}

/// Writes `data` at `cursor` following the append discipline of list storages.
pub(crate) fn set_items<S: ItemSlots>(slots: &mut S, cursor: &Cursor, data: Record) -> Result<()> {
    match cursor {
        Index::Int(ix) => {
            let len = slots.slots_len();
            let ix = if *ix < 0 { resolve_int(*ix, len)? } else { *ix as usize };
            if ix > len {
                return Err(StorageError::Range(format!(
                    "Cannot append data located more than one item away from \
                     the storage size: the storage size is {} \
                     and the index of the item to be set is {}.",
                    len, ix
                ))
                .into());
            }
            if ix >= slots.capacity() {
                return Err(StorageError::Range(format!(
                    "Cannot append data to the list storage: \
                     maximum capacity is {} \
                     and the index of the item to be set is {}.",
                    slots.capacity(),
                    ix
                ))
                .into());
            }
            let data = match slots.device() {
                Some(device) => data.to_device(device),
                None => data,
            };
            slots.write_item(ix, data)
        }
        Index::Slice { start, stop, step } => {
            let data = match slots.device() {
                Some(device) => data.to_device(device),
                None => data,
            };
            let items = batch_items(slots.storage_name(), data)?;
            slots.write_slice(*start, *stop, *step, items)
        }
        Index::List(ixs) => {
            let items = batch_items(slots.storage_name(), data)?;
            if items.len() != ixs.len() {
                return Err(StorageError::Range(format!(
                    "the cursor has {} positions but the data has {} items",
                    ixs.len(),
                    items.len()
                ))
                .into());
            }
            ixs.iter()
                .zip(items)
                .try_for_each(|(&ix, item)| set_items(slots, &Index::Int(ix), item))
        }
        Index::Tuple(parts) if parts.len() == 1 => set_items(slots, &parts[0], data),
        Index::Tuple(_) => Err(StorageError::Index(format!(
            "{} can only be indexed with one-length tuples.",
            slots.storage_name()
        ))
        .into()),
    }
}

/// A storage keeping items in a growable list.
///
/// Items are not required to share a shape or a structure. Writes follow an
/// append discipline: a scalar cursor may overwrite an existing item or
/// append right after the last one, never further.
///
/// ```rust
/// use border_storage::{record::{Record, Tensor}, storage::{ListStorage, Storage}};
/// # fn main() -> anyhow::Result<()> {
/// let mut storage = ListStorage::new(Some(5));
/// storage.set(&0.into(), Record::Tensor(Tensor::scalar(1f32)), true)?;
/// assert_eq!(storage.len(), 1);
/// assert!(storage.set(&2.into(), Record::Tensor(Tensor::scalar(2f32)), true).is_err());
/// # Ok(())
/// # }
/// ```
pub struct ListStorage {
    max_size: usize,
    device: Option<Device>,
    compilable: bool,
    storage: Vec<Record>,
    attached: AttachedEntities,
    rng: Option<SharedRng>,
    checkpointer: Arc<dyn StorageCheckpointer<ListStorage>>,
}

impl ListStorage {
    /// Creates an empty storage. Unbounded if `max_size` is `None`.
    pub fn new(max_size: Option<usize>) -> Self {
        Self::build(&ListStorageConfig {
            max_size,
            ..Default::default()
        })
    }

    /// Creates an empty storage from a configuration.
    pub fn build(config: &ListStorageConfig) -> Self {
        Self {
            max_size: config.max_size.unwrap_or(i64::MAX as usize),
            device: config.device.clone(),
            compilable: config.compilable,
            storage: vec![],
            attached: AttachedEntities::default(),
            rng: None,
            checkpointer: Arc::new(ListStorageCheckpointer),
        }
    }

    /// Replaces the checkpointer.
    pub fn with_checkpointer(
        mut self,
        checkpointer: impl StorageCheckpointer<ListStorage> + 'static,
    ) -> Self {
        self.checkpointer = Arc::new(checkpointer);
        self
    }

    /// Device the items are moved to on write.
    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Whether the storage was created as compilable.
    pub fn compilable(&self) -> bool {
        self.compilable
    }

    fn get_item(&self, ix: i64) -> Result<Record> {
        Ok(self.storage[resolve_int(ix, self.storage.len())?].clone())
    }
}

impl ItemSlots for ListStorage {
    fn storage_name(&self) -> &'static str {
        "ListStorage"
    }

    fn capacity(&self) -> usize {
        self.max_size
    }

    fn slots_len(&self) -> usize {
        self.storage.len()
    }

    fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    fn write_item(&mut self, cursor: usize, data: Record) -> Result<()> {
        if cursor == self.storage.len() {
            self.storage.push(data);
        } else {
            self.storage[cursor] = data;
        }
        Ok(())
    }

    fn write_slice(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        items: Vec<Record>,
    ) -> Result<()> {
        let len = self.storage.len();
        let positions = slice_indices(start, stop, step, len)?;
        if step.unwrap_or(1) == 1 {
            // Contiguous slices replace the range and may grow or shrink the list.
            let start = match start {
                None => 0,
                Some(v) => {
                    let v = if v < 0 { v + len as i64 } else { v };
                    v.clamp(0, len as i64) as usize
                }
            };
            let end = start + positions.len();
            let new_len = len - positions.len() + items.len();
            if new_len > self.max_size {
                return Err(StorageError::Range(format!(
                    "Cannot append data to the list storage: \
                     maximum capacity is {} and the slice assignment \
                     would grow the storage to {} items.",
                    self.max_size, new_len
                ))
                .into());
            }
            self.storage.splice(start..end, items);
            return Ok(());
        }
        if positions.len() != items.len() {
            return Err(StorageError::Range(format!(
                "attempt to assign a sequence of size {} to an extended slice of size {}",
                items.len(),
                positions.len()
            ))
            .into());
        }
        positions
            .into_iter()
            .zip(items)
            .for_each(|(i, item)| self.storage[i] = item);
        Ok(())
    }
}

impl Storage for ListStorage {
    fn name(&self) -> &'static str {
        "ListStorage"
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn len(&self) -> usize {
        self.storage.len()
    }

    fn set(&mut self, cursor: &Cursor, data: Record, _set_cursor: bool) -> Result<()> {
        set_items(self, cursor, data)
    }

    fn get(&self, index: &Index) -> Result<Record> {
        match index {
            Index::Int(ix) => self.get_item(*ix),
            Index::Tuple(parts) if parts.len() == 1 => self.get(&parts[0]),
            Index::Tuple(_) => Err(StorageError::Index(format!(
                "{} can only be indexed with one-length tuples.",
                self.name()
            ))
            .into()),
            index => Ok(Record::List(
                index
                    .positions(self.storage.len())?
                    .into_iter()
                    .map(|i| self.storage[i].clone())
                    .collect(),
            )),
        }
    }

    fn contains(&self, item: i64) -> Result<bool> {
        let len = self.storage.len() as i64;
        let item = if item < 0 { item + len } else { item };
        Ok(0 <= item && item < len)
    }

    fn empty(&mut self) {
        self.storage.clear();
    }

    fn state_dict(&self) -> Result<StateDict> {
        Ok(StateDict::List {
            storage: self.storage.clone(),
        })
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        match state_dict {
            StateDict::List { storage } => {
                self.storage = storage;
                Ok(())
            }
            other => Err(StorageError::Type(format!(
                "Objects of type {} are not supported by {}.load_state_dict",
                other.kind(),
                self.name()
            ))
            .into()),
        }
    }

    fn attach(&mut self, entity: &Entity) {
        self.attached.attach(entity);
    }

    fn attached_entities(&self) -> Vec<Entity> {
        self.attached.live()
    }

    fn dumps(&self, path: &Path) -> Result<()> {
        self.checkpointer.dumps(self, path)
    }

    fn loads(&mut self, path: &Path) -> Result<()> {
        let checkpointer = self.checkpointer.clone();
        checkpointer.loads(self, path)
    }

    fn set_rng(&mut self, rng: SharedRng) {
        self.rng = Some(rng);
    }

    fn rng(&self) -> Option<SharedRng> {
        self.rng.clone()
    }
}

impl fmt::Debug for ListStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.storage.first() {
            None => write!(f, "ListStorage()"),
            Some(item) => write!(f, "ListStorage(items=[{:?}, ...])", item),
        }
    }
}

/// A list storage whose multi-item reads are lazily stacked.
///
/// Reading several items returns a [`Record::Stacked`] view over the stored
/// items instead of copying them into contiguous arrays. Items of different
/// shapes can thus be sampled together.
pub struct LazyStackStorage {
    inner: ListStorage,
    stack_dim: i64,
    checkpointer: Arc<dyn StorageCheckpointer<LazyStackStorage>>,
}

impl LazyStackStorage {
    /// Creates an empty storage from a configuration.
    pub fn build(config: &LazyStackStorageConfig) -> Self {
        let inner = ListStorage::build(&ListStorageConfig {
            max_size: config.max_size,
            device: config.device.clone(),
            compilable: config.compilable,
        });
        Self {
            inner,
            stack_dim: config.stack_dim,
            checkpointer: Arc::new(ListStorageCheckpointer),
        }
    }

    /// Replaces the checkpointer.
    pub fn with_checkpointer(
        mut self,
        checkpointer: impl StorageCheckpointer<LazyStackStorage> + 'static,
    ) -> Self {
        self.checkpointer = Arc::new(checkpointer);
        self
    }

    /// Stacking axis as configured, possibly negative.
    pub fn stack_dim(&self) -> i64 {
        self.stack_dim
    }

    fn resolve_stack_dim(&self, items: &[Record]) -> Result<usize> {
        if self.stack_dim >= 0 {
            return Ok(self.stack_dim as usize);
        }
        let ndim = items.first().map(|r| r.ndim()).unwrap_or(0) as i64;
        let dim = ndim + 1 + self.stack_dim;
        if dim < 0 {
            return Err(StorageError::Index(format!(
                "stack_dim {} is out of range for items with {} batch dimensions",
                self.stack_dim, ndim
            ))
            .into());
        }
        Ok(dim as usize)
    }
}

impl Storage for LazyStackStorage {
    fn name(&self) -> &'static str {
        "LazyStackStorage"
    }

    fn max_size(&self) -> usize {
        self.inner.max_size()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn set(&mut self, cursor: &Cursor, data: Record, set_cursor: bool) -> Result<()> {
        self.inner.set(cursor, data, set_cursor)
    }

    fn get(&self, index: &Index) -> Result<Record> {
        match self.inner.get(index)? {
            Record::List(items) => {
                let stack_dim = self.resolve_stack_dim(&items)?;
                Ok(Record::Stacked(LazyStackedRecord::new(items, stack_dim)?))
            }
            item => Ok(item),
        }
    }

    fn contains(&self, item: i64) -> Result<bool> {
        self.inner.contains(item)
    }

    fn empty(&mut self) {
        self.inner.empty()
    }

    fn state_dict(&self) -> Result<StateDict> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        self.inner.load_state_dict(state_dict)
    }

    fn attach(&mut self, entity: &Entity) {
        self.inner.attach(entity)
    }

    fn attached_entities(&self) -> Vec<Entity> {
        self.inner.attached_entities()
    }

    fn dumps(&self, path: &Path) -> Result<()> {
        self.checkpointer.dumps(self, path)
    }

    fn loads(&mut self, path: &Path) -> Result<()> {
        let checkpointer = self.checkpointer.clone();
        checkpointer.loads(self, path)
    }

    fn set_rng(&mut self, rng: SharedRng) {
        self.inner.set_rng(rng)
    }

    fn rng(&self) -> Option<SharedRng> {
        self.inner.rng()
    }
}

impl fmt::Debug for LazyStackStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LazyStackStorage(len={}, stack_dim={})",
            self.len(),
            self.stack_dim
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Tensor, Value};

    fn item(v: f32) -> Record {
        Record::Tensor(Tensor::scalar(v))
    }

    #[test_log::test]
    fn test_append_discipline() -> Result<()> {
        let mut storage = ListStorage::new(Some(5));
        for i in 0..3 {
            storage.set(&i.into(), item(i as f32), true)?;
        }
        let err = storage.set(&4.into(), item(4.), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Range(_))
        ));
        storage.set(&3.into(), item(3.), true)?;
        storage.set(&4.into(), item(4.), true)?;
        let err = storage.set(&5.into(), item(5.), true).unwrap_err();
        assert!(err.to_string().contains("maximum capacity is 5"));
        assert_eq!(storage.len(), 5);

        // Overwrite in place
        storage.set_at(&(-1i64).into(), item(-1.))?;
        assert_eq!(storage.get(&4.into())?, item(-1.));
        Ok(())
    }

    #[test_log::test]
    fn test_multi_cursor() -> Result<()> {
        let mut storage = ListStorage::new(None);
        let batch = Record::List(vec![item(0.), item(1.), item(2.)]);
        storage.set(&vec![0usize, 1, 2].into(), batch, true)?;
        assert_eq!(storage.len(), 3);

        let err = storage
            .set(&vec![0usize, 1].into(), Record::List(vec![item(0.)]), true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Range(_))
        ));

        let err = storage
            .set(&vec![0usize].into(), Record::Value(Value::Int(1)), true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Type(_))
        ));

        // A tensor batch is split along its leading axis.
        let t = Tensor::from_vec(vec![5f32, 6.], &[2])?;
        storage.set(&vec![3usize, 4].into(), Record::Tensor(t), true)?;
        assert_eq!(storage.get(&4.into())?, item(6.));
        Ok(())
    }

    #[test_log::test]
    fn test_slices() -> Result<()> {
        let mut storage = ListStorage::new(Some(4));
        storage.set(&(0..2).into(), Record::List(vec![item(0.), item(1.)]), true)?;
        assert_eq!(storage.len(), 2);
        let out = storage.get(&(0..2).into())?;
        assert_eq!(out, Record::List(vec![item(0.), item(1.)]));
        assert!(storage
            .set(&(2..7).into(), Record::List(vec![item(0.); 5]), true)
            .is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_contains_and_empty() -> Result<()> {
        let mut storage = ListStorage::new(Some(4));
        storage.set(&0.into(), item(0.), true)?;
        storage.set(&1.into(), item(1.), true)?;
        assert!(storage.contains(-1)?);
        assert!(!storage.contains(2)?);
        assert_eq!(storage.contains_many(&[0, 3, -2])?, vec![true, false, true]);

        storage.empty();
        assert_eq!(storage.len(), 0);
        assert!(storage.get(&0.into()).is_err());
        assert!(storage.share().is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_lazy_stack_negative_dim() -> Result<()> {
        let mut storage = LazyStackStorage::build(&LazyStackStorageConfig::default().stack_dim(-1));
        for i in 0..3 {
            let t = Tensor::from_vec(vec![i as f32; 4], &[4])?;
            storage.set(&i.into(), Record::Tensor(t), true)?;
        }
        let out = storage.get(&vec![0usize, 2].into())?;
        let stacked = out.as_stacked().unwrap();
        assert_eq!(stacked.stack_dim(), 1);
        assert_eq!(stacked.batch_shape(), vec![4, 2]);
        assert!(storage.get(&1.into())?.as_tensor().is_some());
        Ok(())
    }
}
