//! Read-only composition of storages.
use super::{SharedRng, Storage, StorageCheckpointer, StorageEnsembleCheckpointer};
use crate::{
    error::StorageError,
    index::{resolve_int, Cursor, Index},
    record::Record,
};
use anyhow::Result;
use parking_lot::RwLock;
use std::{fmt, path::Path, sync::Arc};

/// A storage behind a lock, shared by an ensemble and the writers of the storage.
pub type SharedStorage = Arc<RwLock<dyn Storage>>;

/// Wraps a storage into a [`SharedStorage`].
pub fn shared(storage: impl Storage + 'static) -> SharedStorage {
    Arc::new(RwLock::new(storage))
}

/// A function applied to the records read from a member of an ensemble.
pub type Transform = Arc<dyn Fn(Record) -> Result<Record> + Send + Sync>;

/// Index of [`StorageEnsemble::get`].
///
/// `buffer_ids[i]` selects the member read at `index[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleIndex {
    /// Members to read from.
    pub buffer_ids: Vec<usize>,
    /// Index passed to each member.
    pub index: Vec<Index>,
}

/// Result of [`StorageEnsemble::select`].
pub enum EnsembleSelection {
    /// A single member.
    Storage(SharedStorage),
    /// A sub-ensemble, with the transforms of the selected members.
    Ensemble(StorageEnsemble),
    /// Items read from a single member.
    Record(Record),
    /// Items read from each selected member, in order.
    Records(Vec<Record>),
}

impl fmt::Debug for EnsembleSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnsembleSelection::Storage(s) => write!(f, "Storage({})", s.read().name()),
            EnsembleSelection::Ensemble(e) => write!(f, "Ensemble({:?})", e),
            EnsembleSelection::Record(r) => write!(f, "Record({:?})", r),
            EnsembleSelection::Records(r) => write!(f, "Records({:?})", r),
        }
    }
}

const INDEX_ERR: &str = "Expected an index of type int, slice, list or tuple";

fn read_only(op: &str) -> anyhow::Error {
    StorageError::ReadOnly(format!(
        "{} is not supported by StorageEnsemble. Write to the member storages directly.",
        op
    ))
    .into()
}

/// An ensemble of storages.
///
/// The ensemble holds no data of its own: it routes reads to its members and
/// applies the transform paired with each member, if any. Reads return the
/// member id along with the records so that callers can process the records
/// of each member differently.
///
/// Writes are not supported. Members are written through their own handles.
///
/// ```rust
/// use border_storage::{
///     index::Index,
///     record::{Record, Tensor},
///     storage::{shared, EnsembleIndex, ListStorage, Storage, StorageEnsemble},
/// };
/// # fn main() -> anyhow::Result<()> {
/// let a = shared(ListStorage::new(None));
/// let b = shared(ListStorage::new(None));
/// for i in 0..4 {
///     a.write().set(&i.into(), Record::Tensor(Tensor::scalar(i as f32)), true)?;
///     b.write().set(&i.into(), Record::Tensor(Tensor::scalar(10. + i as f32)), true)?;
/// }
/// let ensemble = StorageEnsemble::new(vec![a, b], None)?;
/// let out = ensemble.get(&EnsembleIndex {
///     buffer_ids: vec![0, 1],
///     index: vec![Index::Int(2), Index::Int(3)],
/// })?;
/// assert_eq!(out[1].0, 1);
/// assert_eq!(out[1].1, Record::Tensor(Tensor::scalar(13f32)));
/// # Ok(())
/// # }
/// ```
pub struct StorageEnsemble {
    storages: Vec<SharedStorage>,
    transforms: Vec<Option<Transform>>,
    rng: Option<SharedRng>,
    checkpointer: Arc<dyn StorageCheckpointer<StorageEnsemble>>,
}

impl StorageEnsemble {
    /// Creates an ensemble.
    ///
    /// If given, `transforms` must have one entry per storage.
    pub fn new(
        storages: Vec<SharedStorage>,
        transforms: Option<Vec<Option<Transform>>>,
    ) -> Result<Self> {
        let transforms = match transforms {
            None => vec![None; storages.len()],
            Some(t) if t.len() == storages.len() => t,
            Some(_) => {
                return Err(StorageError::Type(
                    "transforms must have the same length as the storages provided.".into(),
                )
                .into())
            }
        };
        Ok(Self {
            storages,
            transforms,
            rng: None,
            checkpointer: Arc::new(StorageEnsembleCheckpointer),
        })
    }

    /// Replaces the checkpointer.
    pub fn with_checkpointer(
        mut self,
        checkpointer: impl StorageCheckpointer<StorageEnsemble> + 'static,
    ) -> Self {
        self.checkpointer = Arc::new(checkpointer);
        self
    }

    /// Members of the ensemble.
    pub fn storages(&self) -> &[SharedStorage] {
        &self.storages
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    /// Returns `true` if the ensemble has no member.
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    fn member(&self, id: usize) -> Result<&SharedStorage> {
        self.storages.get(id).ok_or_else(|| {
            StorageError::Index(format!(
                "buffer id {} is out of range for an ensemble of {} storages",
                id,
                self.storages.len()
            ))
            .into()
        })
    }

    /// Reads `index.index[i]` from member `index.buffer_ids[i]` for every `i`.
    ///
    /// Returns the member id with each record, after the transform of the member.
    pub fn get(&self, index: &EnsembleIndex) -> Result<Vec<(usize, Record)>> {
        if index.buffer_ids.len() != index.index.len() {
            return Err(StorageError::Index(format!(
                "got {} buffer ids for {} indices",
                index.buffer_ids.len(),
                index.index.len()
            ))
            .into());
        }
        index
            .buffer_ids
            .iter()
            .zip(index.index.iter())
            .map(|(&id, ix)| {
                let record = self.member(id)?.read().get(ix)?;
                let record = match &self.transforms[id] {
                    Some(transform) => transform(record)?,
                    None => record,
                };
                Ok((id, record))
            })
            .collect()
    }

    /// Always fails: the ensemble is read-only.
    pub fn set(&mut self, _cursor: &Cursor, _data: Record) -> Result<()> {
        Err(read_only("set"))
    }

    /// Always fails: the ensemble is read-only.
    pub fn extend(&mut self, _data: Record) -> Result<()> {
        Err(read_only("extend"))
    }

    /// Always fails: the ensemble is read-only.
    pub fn add(&mut self, _data: Record) -> Result<()> {
        Err(read_only("add"))
    }

    /// Always fails: the state of an ensemble is the state of its members.
    pub fn state_dict(&self) -> Result<super::StateDict> {
        Err(read_only("state_dict"))
    }

    /// Always fails: the state of an ensemble is the state of its members.
    pub fn load_state_dict(&mut self, _state_dict: super::StateDict) -> Result<()> {
        Err(read_only("load_state_dict"))
    }

    /// Selects members, or items of members.
    ///
    /// * An integer returns the member.
    /// * A slice or a list returns a sub-ensemble keeping the paired transforms.
    /// * A tuple selects members with its first component and forwards the
    ///   remaining components to the `get` of the selected member(s).
    pub fn select(&self, index: &Index) -> Result<EnsembleSelection> {
        let n = self.storages.len();
        match index {
            Index::Tuple(parts) => {
                let (first, rest) = parts
                    .split_first()
                    .ok_or_else(|| StorageError::Index(format!("{}, got an empty tuple.", INDEX_ERR)))?;
                let selected = self.select(first)?;
                if rest.is_empty() {
                    return Ok(selected);
                }
                let rest = match rest {
                    [single] => single.clone(),
                    rest => Index::Tuple(rest.to_vec()),
                };
                match selected {
                    EnsembleSelection::Storage(s) => Ok(EnsembleSelection::Record(s.read().get(&rest)?)),
                    EnsembleSelection::Ensemble(e) => Ok(EnsembleSelection::Records(
                        e.storages
                            .iter()
                            .map(|s| s.read().get(&rest))
                            .collect::<Result<_>>()?,
                    )),
                    _ => Err(StorageError::Index(format!("{}, got a nested tuple.", INDEX_ERR)).into()),
                }
            }
            Index::Int(i) => {
                let i = resolve_int(*i, n)
                    .map_err(|_| StorageError::Index(format!("{}, got {:?}.", INDEX_ERR, index)))?;
                Ok(EnsembleSelection::Storage(self.storages[i].clone()))
            }
            Index::List(ixs) if ixs.is_empty() => {
                Err(StorageError::Index(format!("{}, got an empty list.", INDEX_ERR)).into())
            }
            index => {
                let ids = index.positions(n)?;
                let storages = ids.iter().map(|&i| self.storages[i].clone()).collect();
                let transforms = ids.iter().map(|&i| self.transforms[i].clone()).collect();
                Ok(EnsembleSelection::Ensemble(StorageEnsemble::new(
                    storages,
                    Some(transforms),
                )?))
            }
        }
    }

    /// Installs `rng` on the ensemble and on every member.
    pub fn set_rng(&mut self, rng: SharedRng) {
        for storage in self.storages.iter() {
            storage.write().set_rng(rng.clone());
        }
        self.rng = Some(rng);
    }

    /// The random number generator, if any.
    pub fn rng(&self) -> Option<SharedRng> {
        self.rng.clone()
    }

    /// Writes every member with its own checkpointer.
    pub fn dumps(&self, path: &Path) -> Result<()> {
        self.checkpointer.dumps(self, path)
    }

    /// Restores every member with its own checkpointer.
    pub fn loads(&mut self, path: &Path) -> Result<()> {
        let checkpointer = self.checkpointer.clone();
        checkpointer.loads(self, path)
    }
}

impl fmt::Debug for StorageEnsemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.storages.iter().map(|s| s.read().name()).collect();
        write!(f, "StorageEnsemble(storages={:?})", names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::Tensor,
        storage::{shared_rng, ListStorage},
    };

    fn member(offset: f32) -> Result<SharedStorage> {
        let storage = shared(ListStorage::new(Some(10)));
        for i in 0..5 {
            storage.write().set(
                &(i as usize).into(),
                Record::Tensor(Tensor::scalar(offset + i as f32)),
                true,
            )?;
        }
        Ok(storage)
    }

    fn scalar(r: &Record) -> f32 {
        r.as_tensor().unwrap().to_vec::<f32>().unwrap()[0]
    }

    #[test_log::test]
    fn test_routing_and_transforms() -> Result<()> {
        let double: Transform = Arc::new(|r: Record| r.map_tensors(&mut |t| {
            let v: Vec<f32> = t.to_vec::<f32>()?.into_iter().map(|x| 2. * x).collect();
            Tensor::from_vec(v, t.shape())
        }));
        let ensemble = StorageEnsemble::new(
            vec![member(0.)?, member(100.)?],
            Some(vec![None, Some(double)]),
        )?;
        let out = ensemble.get(&EnsembleIndex {
            buffer_ids: vec![0, 1, 1],
            index: vec![Index::Int(2), Index::Int(3), Index::Int(0)],
        })?;
        let out: Vec<(usize, f32)> = out.iter().map(|(id, r)| (*id, scalar(r))).collect();
        assert_eq!(out, vec![(0, 2.), (1, 206.), (1, 200.)]);

        assert!(StorageEnsemble::new(vec![member(0.)?], Some(vec![])).is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_read_only() -> Result<()> {
        let mut ensemble = StorageEnsemble::new(vec![member(0.)?], None)?;
        let data = Record::Tensor(Tensor::scalar(0f32));
        for err in [
            ensemble.set(&0.into(), data.clone()).unwrap_err(),
            ensemble.extend(data.clone()).unwrap_err(),
            ensemble.add(data).unwrap_err(),
            ensemble.state_dict().unwrap_err(),
        ] {
            assert!(matches!(
                err.downcast_ref::<StorageError>(),
                Some(StorageError::ReadOnly(_))
            ));
        }
        Ok(())
    }

    #[test_log::test]
    fn test_select() -> Result<()> {
        let mut ensemble =
            StorageEnsemble::new(vec![member(0.)?, member(100.)?, member(200.)?], None)?;

        match ensemble.select(&Index::Int(-1))? {
            EnsembleSelection::Storage(s) => assert_eq!(s.read().len(), 5),
            other => panic!("unexpected selection {:?}", other),
        }
        match ensemble.select(&Index::from(vec![2usize, 0]))? {
            EnsembleSelection::Ensemble(e) => {
                assert_eq!(e.len(), 2);
                let out = e.get(&EnsembleIndex {
                    buffer_ids: vec![0],
                    index: vec![Index::Int(1)],
                })?;
                assert_eq!(scalar(&out[0].1), 201.);
            }
            other => panic!("unexpected selection {:?}", other),
        }
        match ensemble.select(&Index::Tuple(vec![Index::Int(1), Index::Int(4)]))? {
            EnsembleSelection::Record(r) => assert_eq!(scalar(&r), 104.),
            other => panic!("unexpected selection {:?}", other),
        }
        match ensemble.select(&Index::Tuple(vec![Index::full(), Index::Int(0)]))? {
            EnsembleSelection::Records(r) => {
                assert_eq!(r.iter().map(scalar).collect::<Vec<_>>(), vec![0., 100., 200.])
            }
            other => panic!("unexpected selection {:?}", other),
        }
        assert!(ensemble.select(&Index::List(vec![])).is_err());
        assert!(ensemble.select(&Index::Int(3)).is_err());

        let rng = shared_rng(0);
        ensemble.set_rng(rng.clone());
        for storage in ensemble.storages() {
            let member_rng = storage.read().rng().unwrap();
            assert!(Arc::ptr_eq(&member_rng, &rng));
        }
        Ok(())
    }
}
