//! Interface of storages.
use super::{CompressedItem, ItemMetadata};
use crate::{
    error::StorageError,
    index::{Cursor, Index},
    record::Record,
};
use anyhow::Result;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    path::Path,
    sync::{Arc, Weak},
};

/// Random number generator shared by a storage and its samplers.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Creates a [`SharedRng`] from a seed.
pub fn shared_rng(seed: u64) -> SharedRng {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

/// An object reading from a storage, e.g., a priority tracker of a sampler.
pub type Entity = Arc<dyn Any + Send + Sync>;

/// Weak references to the entities attached to a storage.
///
/// The storage never keeps an entity alive. Entities dropped by their owner
/// disappear from the set.
#[derive(Default, Clone)]
pub struct AttachedEntities(Vec<Weak<dyn Any + Send + Sync>>);

impl AttachedEntities {
    /// Registers an entity. Returns `false` if it was already registered.
    pub fn attach(&mut self, entity: &Entity) -> bool {
        self.prune();
        let ptr = Arc::as_ptr(entity) as *const ();
        if self.0.iter().any(|w| w.as_ptr() as *const () == ptr) {
            return false;
        }
        self.0.push(Arc::downgrade(entity));
        true
    }

    /// Entities that are still alive.
    pub fn live(&self) -> Vec<Entity> {
        self.0.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of entities that are still alive.
    pub fn len(&self) -> usize {
        self.0.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Returns `true` if no live entity is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&mut self) {
        self.0.retain(|w| w.strong_count() > 0);
    }
}

impl std::fmt::Debug for AttachedEntities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttachedEntities({})", self.len())
    }
}

/// Full contents of a storage, as exchanged with checkpointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateDict {
    /// Items of a list-backed storage.
    List {
        /// Stored items, in order.
        storage: Vec<Record>,
    },

    /// Buffers of a pre-allocated storage.
    Tensor {
        /// The whole buffer tree, `None` if the storage is not initialized.
        storage: Option<Record>,
        /// Whether the buffers were allocated.
        initialized: bool,
        /// Occupied length.
        len: usize,
    },

    /// Slots of a compressed storage.
    Compressed {
        /// Compressed payloads, `None` for empty slots.
        storage: Vec<Option<CompressedItem>>,
        /// Metadata needed to decompress each slot.
        metadata: Vec<Option<ItemMetadata>>,
    },
}

impl StateDict {
    /// Name of the variant, used in messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StateDict::List { .. } => "list",
            StateDict::Tensor { .. } => "tensor",
            StateDict::Compressed { .. } => "compressed",
        }
    }
}

/// A capacity-bounded container of records.
///
/// Writers call [`Storage::set`] with a cursor they manage; samplers call
/// [`Storage::get`] with indices drawn within [`Storage::len`] or
/// [`Storage::shape`].
pub trait Storage: Send + Sync {
    /// Name of the storage type, used in messages.
    fn name(&self) -> &'static str;

    /// Capacity of the storage.
    fn max_size(&self) -> usize;

    /// Number of leading axes that count toward the capacity.
    fn ndim(&self) -> usize {
        1
    }

    /// Number of occupied positions.
    fn len(&self) -> usize;

    /// Returns `true` if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the storage reached its capacity.
    fn is_full(&self) -> bool {
        self.len() >= self.max_size()
    }

    /// Writes `data` at `cursor`.
    ///
    /// # Arguments
    ///
    /// * `cursor` - Position(s) to write. A non-scalar cursor is zipped with
    ///   the items of `data` along its leading axis.
    /// * `data` - The record, or a [`Record::List`] of items.
    /// * `set_cursor` - If `false`, the write does not change the length
    ///   bookkeeping of the storage.
    fn set(&mut self, cursor: &Cursor, data: Record, set_cursor: bool) -> Result<()>;

    /// Overwrites items in place without updating the length bookkeeping.
    fn set_at(&mut self, cursor: &Cursor, data: Record) -> Result<()> {
        self.set(cursor, data, false)
    }

    /// Reads the items at `index`.
    fn get(&self, index: &Index) -> Result<Record>;

    /// Returns `true` if `item` addresses an occupied position.
    ///
    /// Negative values wrap around the current length.
    fn contains(&self, item: i64) -> Result<bool>;

    /// Elementwise version of [`Storage::contains`].
    fn contains_many(&self, items: &[i64]) -> Result<Vec<bool>> {
        items.iter().map(|&i| self.contains(i)).collect()
    }

    /// Resets the length to zero. The contents may not be erased.
    fn empty(&mut self);

    /// Returns the contents of the storage.
    fn state_dict(&self) -> Result<StateDict>;

    /// Restores the contents returned by [`Storage::state_dict`].
    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()>;

    /// Registers an entity reading from this storage.
    fn attach(&mut self, entity: &Entity);

    /// Entities registered with [`Storage::attach`] that are still alive.
    fn attached_entities(&self) -> Vec<Entity>;

    /// Writes the storage to the directory `path` with its checkpointer.
    fn dumps(&self, path: &Path) -> Result<()>;

    /// Restores the storage from the directory `path` with its checkpointer.
    fn loads(&mut self, path: &Path) -> Result<()>;

    /// Alias of [`Storage::dumps`].
    fn save(&self, path: &Path) -> Result<()> {
        self.dumps(path)
    }

    /// Alias of [`Storage::loads`].
    fn load(&mut self, path: &Path) -> Result<()> {
        self.loads(path)
    }

    /// Installs a random number generator used by [`Storage::rand_given_ndim`].
    fn set_rng(&mut self, rng: SharedRng);

    /// The random number generator, if any.
    fn rng(&self) -> Option<SharedRng>;

    /// Draws `batch_size` indices uniformly among the occupied positions.
    ///
    /// The default implementation supports `ndim == 1` only.
    fn rand_given_ndim(&self, batch_size: usize) -> Result<Index> {
        if self.ndim() != 1 {
            return Err(StorageError::Unsupported(format!(
                "Random number generation is not implemented for storage of type {} with ndim {}.",
                self.name(),
                self.ndim()
            ))
            .into());
        }
        let len = self.len();
        if len == 0 {
            return Err(
                StorageError::Range("cannot draw indices from an empty storage".into()).into(),
            );
        }
        let ixs = match self.rng() {
            Some(rng) => {
                let mut rng = rng.lock();
                draw(&mut *rng, len, batch_size)
            }
            None => draw(&mut rand::thread_rng(), len, batch_size),
        };
        Ok(Index::List(ixs))
    }

    /// Shape of the storage along its capacity axes.
    fn shape(&self) -> Result<Vec<usize>> {
        if self.ndim() == 1 {
            return Ok(vec![self.max_size()]);
        }
        Err(StorageError::Unsupported(format!(
            "storage.shape is not supported for storages of type {} when ndim > 1.",
            self.name()
        ))
        .into())
    }

    /// Capacity along the leading axis.
    fn max_size_along_dim0(&self) -> Result<usize> {
        if self.ndim() == 1 {
            return Ok(self.max_size());
        }
        Err(StorageError::Unsupported(format!(
            "storage.max_size_along_dim0 is not supported for storages of type {} when ndim > 1.",
            self.name()
        ))
        .into())
    }

    /// Iterates over the stored items in order.
    fn iter(&self) -> Box<dyn Iterator<Item = Result<Record>> + '_> {
        Box::new((0..self.len()).map(move |i| self.get(&Index::Int(i as i64))))
    }

    /// Returns another handle on the same storage, for a concurrent worker.
    fn share(&self) -> Result<Self>
    where
        Self: Sized,
    {
        Err(StorageError::Unsupported(format!(
            "Cannot share a storage of type {} between processes.",
            self.name()
        ))
        .into())
    }
}

fn draw<R: Rng>(rng: &mut R, len: usize, batch_size: usize) -> Vec<i64> {
    (0..batch_size)
        .map(|_| rng.gen_range(0..len) as i64)
        .collect()
}
