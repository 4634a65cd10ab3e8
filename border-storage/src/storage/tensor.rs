//! Pre-allocated storages.
//!
//! A [`TensorStorage`] allocates one buffer per leaf of the first record it
//! receives, sized to its capacity. The buffers live in process memory
//! ([`TensorStorage::lazy`]) or in memory-mapped files
//! ([`TensorStorage::memmap`]).
mod buffer;
mod checkpoint;
use super::{
    AttachedEntities, Entity, LengthCounter, LocalCounter, MemmapStorageConfig, SharedCounter,
    SharedRng, StateDict, Storage, StorageCheckpointer, TensorStorageConfig,
};
use crate::{
    error::StorageError,
    index::{resolve_int, Cursor, Index},
    record::{DType, Device, DeviceSpec, FieldPath, Record, Tensor, TreeSpec},
};
use anyhow::Result;
use buffer::LeafBuffer;
pub use checkpoint::TensorStorageCheckpointer;
use log::{debug, warn};
use rand::Rng;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

const SHARE_ERR: &str =
    "The storage must be place in shared memory or memmapped before being shared between processes.";

/// Buffer of one leaf over the whole capacity.
struct Leaf {
    path: FieldPath,
    dtype: DType,
    /// Full shape, capacity axes first.
    shape: Vec<usize>,
    buffer: LeafBuffer,
}

impl Leaf {
    /// Number of bytes of an entry addressed by the first `depth` axes.
    fn chunk_nbytes(&self, depth: usize) -> usize {
        self.shape[depth..].iter().product::<usize>() * self.dtype.size()
    }

    fn byte_offset(&self, coords: &[usize]) -> usize {
        let linear = coords
            .iter()
            .zip(self.shape.iter())
            .fold(0, |acc, (&c, &d)| acc * d + c);
        linear * self.chunk_nbytes(coords.len())
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_bytes(
            self.buffer.as_slice().to_vec(),
            self.dtype,
            &self.shape,
            device.clone(),
        )
    }
}

#[derive(Clone)]
enum Backend {
    Heap,
    Memmap { scratch_dir: PathBuf, existsok: bool },
}

/// Entries addressed by an index over the leading axes of the buffers.
struct Selection {
    /// Coordinates of each entry over the first `depth` axes.
    coords: Vec<Vec<usize>>,
    /// Leading shape of the result.
    prefix: Vec<usize>,
    depth: usize,
}

impl Selection {
    /// Resolves `index` against the leading axes `dims`.
    ///
    /// Integers drop their axis and slices keep it. Lists are zipped together,
    /// with integers broadcast, and give a single leading axis.
    fn new(index: &Index, dims: &[usize]) -> Result<Self> {
        let parts: Vec<&Index> = match index {
            Index::Tuple(parts) => parts.iter().collect(),
            other => vec![other],
        };
        if parts.len() > dims.len() {
            return Err(StorageError::Index(format!(
                "too many indices: {} components for {} indexable axes",
                parts.len(),
                dims.len()
            ))
            .into());
        }

        let lists: Vec<usize> = parts
            .iter()
            .filter_map(|p| match p {
                Index::List(l) => Some(l.len()),
                _ => None,
            })
            .collect();

        if let Some(&n) = lists.first() {
            if lists.iter().any(|&m| m != n) {
                return Err(StorageError::Index(format!(
                    "shape mismatch: index lists of lengths {:?} cannot be zipped",
                    lists
                ))
                .into());
            }
            let per_axis = parts
                .iter()
                .zip(dims.iter())
                .map(|(p, &d)| -> Result<Vec<usize>> {
                    match p {
                        Index::Int(i) => Ok(vec![resolve_int(*i, d)?; n]),
                        Index::List(l) => l.iter().map(|&i| resolve_int(i, d)).collect(),
                        _ => Err(StorageError::Unsupported(
                            "slices and nested tuples cannot be mixed with index lists".into(),
                        )
                        .into()),
                    }
                })
                .collect::<Result<Vec<Vec<usize>>>>()?;
            let coords = (0..n)
                .map(|j| per_axis.iter().map(|a| a[j]).collect())
                .collect();
            return Ok(Self {
                coords,
                prefix: vec![n],
                depth: parts.len(),
            });
        }

        let mut prefix = vec![];
        let mut coords: Vec<Vec<usize>> = vec![vec![]];
        for (p, &d) in parts.iter().zip(dims.iter()) {
            let axis = match p {
                Index::Tuple(_) => {
                    return Err(StorageError::Index("nested tuple indices are not supported".into()).into())
                }
                Index::Int(i) => vec![resolve_int(*i, d)?],
                slice => {
                    let positions = slice.positions(d)?;
                    prefix.push(positions.len());
                    positions
                }
            };
            coords = coords
                .into_iter()
                .flat_map(|c| {
                    axis.iter().map(move |&i| {
                        let mut c = c.clone();
                        c.push(i);
                        c
                    })
                })
                .collect();
        }
        Ok(Self {
            coords,
            prefix,
            depth: parts.len(),
        })
    }

    fn result_shape(&self, leaf: &Leaf) -> Vec<usize> {
        let mut shape = self.prefix.clone();
        shape.extend_from_slice(&leaf.shape[self.depth..]);
        shape
    }
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// A storage pre-allocating contiguous buffers on its first write.
///
/// The first record written freezes the template of the storage: its tree
/// structure, and the dtype and shape of each leaf. Every buffer gets a
/// leading axis sized to the capacity, and later writes must conform to
/// the template.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> Uninitialized
///     Uninitialized --> Initialized: first set() / load
///     Initialized --> Initialized: set() / get() / empty()
/// ```
///
/// # Capacity with `ndim > 1`
///
/// The leading `ndim` axes count toward the capacity. The `ndim - 1` axes
/// after the first one form a row, and `max_size` is rounded up to a whole
/// number of rows: with `max_size = 100`, `ndim = 2` and records of shape
/// `[7, ..]`, the buffers get 15 rows and `max_size` becomes 105.
///
/// # Sharing
///
/// [`Storage::share`] returns another handle on the same buffers. Only
/// initialized, memory-mapped, non-compilable storages can be shared.
pub struct TensorStorage {
    max_size: usize,
    ndim: usize,
    device: DeviceSpec,
    compilable: bool,
    backend: Backend,
    initialized: bool,
    spec: Option<TreeSpec>,
    leaves: Vec<Leaf>,
    len: Arc<dyn LengthCounter>,
    last_cursor: Option<Cursor>,
    attached: AttachedEntities,
    rng: Option<SharedRng>,
    checkpointer: Arc<dyn StorageCheckpointer<TensorStorage>>,
}

impl TensorStorage {
    fn new_inner(
        max_size: usize,
        ndim: usize,
        device: DeviceSpec,
        compilable: bool,
        backend: Backend,
    ) -> Result<Self> {
        if ndim == 0 {
            return Err(StorageError::Config("ndim must be at least 1".into()).into());
        }
        let len: Arc<dyn LengthCounter> = match (&backend, compilable) {
            (_, true) => Arc::new(LocalCounter::new(0)),
            (Backend::Heap, false) => Arc::new(SharedCounter::new(0)?),
            (Backend::Memmap { scratch_dir, .. }, false) => {
                fs::create_dir_all(scratch_dir)?;
                Arc::new(SharedCounter::open(scratch_dir.join(".length"), true)?)
            }
        };
        Ok(Self {
            max_size,
            ndim,
            device,
            compilable,
            backend,
            initialized: false,
            spec: None,
            leaves: vec![],
            len,
            last_cursor: None,
            attached: AttachedEntities::default(),
            rng: None,
            checkpointer: Arc::new(TensorStorageCheckpointer),
        })
    }

    /// Creates a storage whose buffers are allocated in process memory on
    /// the first write.
    pub fn lazy(config: &TensorStorageConfig) -> Result<Self> {
        Self::new_inner(
            config.max_size,
            config.ndim,
            config.device.clone(),
            config.compilable,
            Backend::Heap,
        )
    }

    /// Creates a storage whose buffers are memory-mapped files, created
    /// under the scratch directory on the first write.
    pub fn memmap(config: &MemmapStorageConfig) -> Result<Self> {
        let device = match &config.device {
            DeviceSpec::Auto => Device::Cpu,
            DeviceSpec::Fixed(device) => device.clone(),
        };
        if !device.is_cpu() {
            return Err(StorageError::Config(
                "Memory map device other than CPU isn't supported. To cast your data to the desired device, \
                 use `buffer.append_transform(lambda x: x.to(device))` or a similar transform."
                    .into(),
            )
            .into());
        }
        let scratch_dir = match &config.scratch_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!(
                "border-storage-{}-{:08x}",
                std::process::id(),
                rand::random::<u32>()
            )),
        };
        Self::new_inner(
            config.max_size,
            config.ndim,
            DeviceSpec::Fixed(device),
            config.compilable,
            Backend::Memmap {
                scratch_dir,
                existsok: config.existsok,
            },
        )
    }

    /// Creates an initialized, full storage over an existing batch.
    ///
    /// The leading axis of `record` gives the capacity along the first axis.
    /// If `max_size` is given, it must be equal to that size.
    pub fn from_record(record: Record, max_size: Option<usize>, ndim: usize) -> Result<Self> {
        let (tensors, spec) = record.flatten()?;
        check_template(&spec)?;
        let batch = record.batch_shape();
        let rows = batch.first().copied().ok_or_else(|| {
            StorageError::Type("a storage cannot be built from a zero-dimensional record".into())
        })?;
        if let Some(max_size) = max_size {
            if max_size != rows {
                return Err(StorageError::Config(format!(
                    "The max-size and the storage shape mismatch: got \
                     max_size={} for a storage of shape {:?}.",
                    max_size, batch
                ))
                .into());
            }
        }
        if batch.len() < ndim {
            return Err(StorageError::Type(format!(
                "a record of batch shape {:?} cannot back a storage with ndim {}",
                batch, ndim
            ))
            .into());
        }
        let total: usize = batch[..ndim].iter().product();
        let device = tensors[0].device().clone();
        let mut storage = Self::new_inner(total, ndim, DeviceSpec::Fixed(device), false, Backend::Heap)?;
        storage.leaves = spec
            .leaf_paths()
            .into_iter()
            .zip(tensors)
            .map(|(path, t)| Leaf {
                path,
                dtype: t.dtype(),
                shape: t.shape().to_vec(),
                buffer: LeafBuffer::Heap(t.as_bytes().to_vec()),
            })
            .collect();
        storage.spec = Some(spec);
        storage.initialized = true;
        storage.len.set(total);
        Ok(storage)
    }

    /// Replaces the checkpointer.
    pub fn with_checkpointer(
        mut self,
        checkpointer: impl StorageCheckpointer<TensorStorage> + 'static,
    ) -> Self {
        self.checkpointer = Arc::new(checkpointer);
        self
    }

    /// Whether the buffers were allocated.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the buffers are memory-mapped files.
    pub fn is_memmap(&self) -> bool {
        matches!(self.backend, Backend::Memmap { .. })
    }

    /// Directory of the leaf files of a memory-mapped storage.
    pub fn scratch_dir(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Heap => None,
            Backend::Memmap { scratch_dir, .. } => Some(scratch_dir),
        }
    }

    /// Device of the buffers, as configured or inferred.
    pub fn device(&self) -> &DeviceSpec {
        &self.device
    }

    /// Whether the length is kept in an in-process counter.
    pub fn compilable(&self) -> bool {
        self.compilable
    }

    /// The last cursor written with `set_cursor = true`.
    pub fn last_cursor(&self) -> Option<&Cursor> {
        self.last_cursor.as_ref()
    }

    /// Template of the stored records, once initialized.
    pub fn tree_spec(&self) -> Option<&TreeSpec> {
        self.spec.as_ref()
    }

    fn resolved_device(&self) -> Device {
        match &self.device {
            DeviceSpec::Fixed(device) => device.clone(),
            DeviceSpec::Auto => Device::Cpu,
        }
    }

    /// Shape of the capacity axes, irrespective of how full the storage is.
    fn total_shape(&self) -> Option<Vec<usize>> {
        self.leaves.first().map(|l| l.shape[..self.ndim].to_vec())
    }

    fn row_numel(&self) -> usize {
        self.total_shape()
            .map(|s| s[1..].iter().product())
            .unwrap_or(1)
    }

    /// Number of occupied positions along the first axis.
    pub fn len_along_dim0(&self) -> usize {
        let len = self.len.get();
        if self.ndim > 1 {
            let row = self.row_numel().max(1);
            return (len + row - 1) / row;
        }
        len
    }

    fn visible_dims(&self) -> Result<Vec<usize>> {
        let mut dims = self.total_shape().ok_or_else(|| {
            StorageError::Uninitialized("Cannot get elements out of a non-initialized storage.".into())
        })?;
        if !self.is_full() {
            dims[0] = self.len_along_dim0().min(dims[0]);
        }
        Ok(dims)
    }

    /// Number of elements a write of `data` at `cursor` adds to the length.
    fn written_numel(&self, data: &Record, cursor: &Cursor) -> Result<usize> {
        let ndim = self.ndim - cursor.is_int() as usize;
        let shape = data.batch_shape();
        if shape.len() < ndim {
            return Err(StorageError::Type(format!(
                "a record of batch shape {:?} cannot be written with a cursor of kind {:?} in a storage with ndim {}",
                shape, cursor, self.ndim
            ))
            .into());
        }
        Ok(shape[..ndim].iter().product())
    }

    fn init(&mut self, item: &Record) -> Result<()> {
        if self.initialized {
            return Err(StorageError::Config(format!(
                "{} is already initialized and cannot be initialized again.",
                self.name()
            ))
            .into());
        }
        debug!("Creating a {}...", self.name());
        let (tensors, spec) = item.flatten()?;
        check_template(&spec)?;
        if self.device == DeviceSpec::Auto {
            self.device = DeviceSpec::Fixed(tensors[0].device().clone());
        }
        let rows = if self.ndim > 1 {
            let batch = item.batch_shape();
            if batch.len() < self.ndim - 1 {
                return Err(StorageError::Type(format!(
                    "records of batch shape {:?} cannot fill a storage with ndim {}",
                    batch, self.ndim
                ))
                .into());
            }
            let row: usize = batch[..self.ndim - 1].iter().product();
            if row == 0 {
                return Err(StorageError::Type("records with empty rows cannot be stored".into()).into());
            }
            let rows = (self.max_size + row - 1) / row;
            self.max_size = rows * row;
            rows
        } else {
            self.max_size
        };
        let templates = spec
            .leaf_paths()
            .into_iter()
            .zip(tensors.iter())
            .map(|(path, t)| {
                let mut shape = vec![rows];
                shape.extend_from_slice(t.shape());
                (path, t.dtype(), shape)
            })
            .collect();
        let existsok = match &self.backend {
            Backend::Heap => false,
            Backend::Memmap { existsok, .. } => *existsok,
        };
        self.allocate(spec, templates, existsok)
    }

    /// Allocates one buffer per leaf with the given full shapes.
    fn allocate(
        &mut self,
        spec: TreeSpec,
        templates: Vec<(FieldPath, DType, Vec<usize>)>,
        existsok: bool,
    ) -> Result<()> {
        let mut leaves = Vec::with_capacity(templates.len());
        for (path, dtype, shape) in templates {
            let nbytes = shape.iter().product::<usize>() * dtype.size();
            let buffer = match &self.backend {
                Backend::Heap => LeafBuffer::heap(nbytes),
                Backend::Memmap { scratch_dir, .. } => {
                    let file = scratch_dir.join(path.to_file_path("memmap"));
                    let buffer = LeafBuffer::create_mapped(&file, nbytes, existsok)?;
                    debug!(
                        "\t{}: {:?}, {} Mb of storage (size: {:?}).",
                        path,
                        file,
                        nbytes as f64 / 1024. / 1024.,
                        shape
                    );
                    buffer
                }
            };
            leaves.push(Leaf {
                path,
                dtype,
                shape,
                buffer,
            });
        }
        self.leaves = leaves;
        self.spec = Some(spec);
        self.initialized = true;
        Ok(())
    }

    /// Matches the leaves of `data` with the buffers, by field path.
    fn match_leaves<'a>(&self, data: &'a Record) -> Result<Vec<&'a Tensor>> {
        let (_, spec) = data.flatten()?;
        if spec.has_values() {
            return Err(StorageError::Type(format!(
                "{} only stores array leaves; the record holds non-array values",
                self.name()
            ))
            .into());
        }
        let given = data.leaves();
        if let Some((path, _)) = given
            .iter()
            .find(|(p, _)| self.leaves.iter().all(|l| &l.path != p))
        {
            return Err(StorageError::Type(format!(
                "the field '{}' is absent from the template of the storage",
                path
            ))
            .into());
        }
        self.leaves
            .iter()
            .map(|leaf| -> Result<&'a Tensor> {
                let (_, t) = given.iter().find(|(p, _)| *p == leaf.path).ok_or_else(|| {
                    StorageError::Type(format!(
                        "the field '{}' of the storage is missing in the record",
                        leaf.path
                    ))
                })?;
                Ok(*t)
            })
            .collect()
    }

    fn write(&mut self, cursor: &Cursor, data: Record) -> Result<()> {
        let capacity = self.leaves[0].shape[0];
        let (cursor, data) = match cursor {
            Index::List(ixs) if ixs.len() > capacity => {
                warn!(
                    "A cursor of length superior to the storage capacity was provided. \
                     To accommodate for this, the cursor will be truncated to its last \
                     elements such that its length matches the capacity of the storage. \
                     Make sure that the storage capacity is big enough to support the \
                     batch size provided."
                );
                let n = ixs.len();
                let keep: Vec<usize> = (n - capacity..n).collect();
                let data = data.map_tensors(&mut |t| t.select(&keep))?;
                (Index::List(ixs[n - capacity..].to_vec()), data)
            }
            cursor => (cursor.clone(), data),
        };

        let dims: Vec<usize> = self.leaves[0].shape[..self.ndim].to_vec();
        let sel = Selection::new(&cursor, &dims)?;
        let tensors = self.match_leaves(&data)?;
        for (leaf, t) in self.leaves.iter().zip(tensors.iter()) {
            let expected = sel.result_shape(leaf);
            if t.dtype() != leaf.dtype || t.shape() != expected.as_slice() {
                return Err(StorageError::Type(format!(
                    "the field '{}' expects {} data of shape {:?} at this cursor, got {} data of shape {:?}",
                    leaf.path,
                    leaf.dtype,
                    expected,
                    t.dtype(),
                    t.shape()
                ))
                .into());
            }
        }
        let tensors: Vec<Tensor> = tensors.into_iter().cloned().collect();
        for (leaf, t) in self.leaves.iter_mut().zip(tensors.iter()) {
            let chunk = leaf.chunk_nbytes(sel.depth);
            let offsets: Vec<usize> = sel.coords.iter().map(|c| leaf.byte_offset(c)).collect();
            let src = t.as_bytes();
            let dst = leaf.buffer.as_mut_slice();
            for (j, start) in offsets.into_iter().enumerate() {
                dst[start..start + chunk].copy_from_slice(&src[j * chunk..(j + 1) * chunk]);
            }
        }
        Ok(())
    }

    fn gather(&self, sel: &Selection) -> Result<Record> {
        let device = self.resolved_device();
        let tensors = self
            .leaves
            .iter()
            .map(|leaf| {
                let chunk = leaf.chunk_nbytes(sel.depth);
                let src = leaf.buffer.as_slice();
                let mut bytes = Vec::with_capacity(chunk * sel.coords.len());
                for c in sel.coords.iter() {
                    let start = leaf.byte_offset(c);
                    bytes.extend_from_slice(&src[start..start + chunk]);
                }
                Tensor::from_bytes(bytes, leaf.dtype, &sel.result_shape(leaf), device.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        let spec = self.spec.as_ref().ok_or_else(|| {
            StorageError::Consistency("an initialized storage has no template".into())
        })?;
        Record::unflatten(tensors, spec)
    }

    /// Whole buffers, irrespective of the occupied length.
    fn full_record(&self) -> Result<Record> {
        let device = self.resolved_device();
        let tensors = self
            .leaves
            .iter()
            .map(|l| l.to_tensor(&device))
            .collect::<Result<Vec<_>>>()?;
        let spec = self.spec.as_ref().ok_or_else(|| {
            StorageError::Consistency("an initialized storage has no template".into())
        })?;
        Record::unflatten(tensors, spec)
    }

    /// Copies whole buffers, as returned by `full_record`, into the leaves.
    fn copy_full(&mut self, record: &Record) -> Result<()> {
        let tensors: Vec<Tensor> = self.match_leaves(record)?.into_iter().cloned().collect();
        for (leaf, t) in self.leaves.iter_mut().zip(tensors.iter()) {
            if t.shape() != leaf.shape.as_slice() || t.dtype() != leaf.dtype {
                return Err(StorageError::Type(format!(
                    "Cannot copy a buffer of shape {:?} ({}) onto another of shape {:?} ({}) for the field '{}'",
                    t.shape(),
                    t.dtype(),
                    leaf.shape,
                    leaf.dtype,
                    leaf.path
                ))
                .into());
            }
            leaf.buffer.as_mut_slice().copy_from_slice(t.as_bytes());
        }
        Ok(())
    }

    /// Returns a storage with the leading `ndim` axes merged into one.
    ///
    /// Only the occupied rows are kept. The result lives in process memory.
    pub fn flatten(&self) -> Result<TensorStorage> {
        if !self.initialized {
            return Err(StorageError::Uninitialized(
                "Cannot flatten a non-initialized storage.".into(),
            )
            .into());
        }
        let rows = self.visible_dims()?[0];
        let data = self.gather(&Selection::new(&Index::range(0, rows as i64), &[rows])?)?;
        let ndim = self.ndim;
        let flat = data.map_tensors(&mut |t| {
            let mut shape: Vec<usize> = vec![t.shape()[..ndim].iter().product()];
            shape.extend_from_slice(&t.shape()[ndim..]);
            t.reshape(&shape)
        })?;
        TensorStorage::from_record(flat, None, 1)
    }

    fn draw_index(&self, batch_size: usize) -> Result<Index> {
        let shape = Storage::shape(self)?;
        if shape.iter().any(|&d| d == 0) {
            return Err(
                StorageError::Range("cannot draw indices from an empty storage".into()).into(),
            );
        }
        let draw = |rng: &mut dyn rand::RngCore| {
            shape
                .iter()
                .map(|&d| {
                    Index::List(
                        (0..batch_size)
                            .map(|_| rng.gen_range(0..d) as i64)
                            .collect(),
                    )
                })
                .collect::<Vec<_>>()
        };
        let parts = match &self.rng {
            Some(rng) => draw(&mut *rng.lock()),
            None => draw(&mut rand::thread_rng()),
        };
        Ok(Index::Tuple(parts))
    }
}

fn check_template(spec: &TreeSpec) -> Result<()> {
    if spec.has_values() {
        return Err(StorageError::Type(
            "pre-allocated storages only store array leaves; the record holds non-array values"
                .into(),
        )
        .into());
    }
    if spec.num_leaves() == 0 {
        return Err(StorageError::Type(
            "cannot allocate a storage for a record without array leaves".into(),
        )
        .into());
    }
    Ok(())
}

/// First item along the leading axis of a batch.
fn first_item(data: &Record) -> Result<Record> {
    data.map_tensors(&mut |t| t.select(&[0])?.reshape(&t.shape()[1..]))
}

impl Storage for TensorStorage {
    fn name(&self) -> &'static str {
        match self.backend {
            Backend::Heap => "TensorStorage",
            Backend::Memmap { .. } => "MemmapStorage",
        }
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn ndim(&self) -> usize {
        self.ndim
    }

    fn len(&self) -> usize {
        self.len.get()
    }

    fn is_full(&self) -> bool {
        self.len.get() == self.max_size
    }

    fn set(&mut self, cursor: &Cursor, data: Record, set_cursor: bool) -> Result<()> {
        let data = match data {
            Record::List(items) => Record::stack(items).map_err(|_| {
                StorageError::Type(format!(
                    "Stacking the elements of the list resulted in an error. \
                     Storages of type {} expect all elements of the list \
                     to have the same tree structure.",
                    self.name()
                ))
            })?,
            Record::Stacked(stack) => stack.to_dense()?,
            data => data,
        };
        let numel = if set_cursor {
            self.written_numel(&data, cursor)?
        } else {
            0
        };
        if !self.initialized {
            if cursor.is_int() {
                self.init(&data)?;
            } else {
                self.init(&first_item(&data)?)?;
            }
        }
        self.write(cursor, data)?;
        if set_cursor {
            self.len.add_bounded(numel, self.max_size);
            self.last_cursor = Some(cursor.clone());
        }
        Ok(())
    }

    fn get(&self, index: &Index) -> Result<Record> {
        if !self.initialized {
            return Err(StorageError::Uninitialized(
                "Cannot get elements out of a non-initialized storage.".into(),
            )
            .into());
        }
        let sel = Selection::new(index, &self.visible_dims()?)?;
        self.gather(&sel)
    }

    fn contains(&self, item: i64) -> Result<bool> {
        if !self.initialized {
            return Err(StorageError::Uninitialized(
                "Cannot check membership in a non-initialized storage.".into(),
            )
            .into());
        }
        let len = self.len_along_dim0() as i64;
        let item = if item < 0 { item + len } else { item };
        Ok(0 <= item && item < len)
    }

    fn empty(&mut self) {
        self.len.set(0);
    }

    fn state_dict(&self) -> Result<StateDict> {
        let storage = if self.initialized {
            Some(self.full_record()?)
        } else {
            None
        };
        Ok(StateDict::Tensor {
            storage,
            initialized: self.initialized,
            len: self.len.get(),
        })
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        let (storage, initialized, len) = match state_dict {
            StateDict::Tensor {
                storage,
                initialized,
                len,
            } => (storage, initialized, len),
            other => {
                return Err(StorageError::Type(format!(
                    "Objects of type {} are not supported by {}.load_state_dict",
                    other.kind(),
                    self.name()
                ))
                .into())
            }
        };
        if let Some(record) = storage {
            if !self.initialized {
                if self.is_memmap() {
                    warn!(
                        "Loading the storage on an uninitialized storage. \
                         It is preferable to load a storage onto a \
                         pre-allocated one whenever possible."
                    );
                }
                let (tensors, spec) = record.flatten()?;
                check_template(&spec)?;
                let templates: Vec<_> = spec
                    .leaf_paths()
                    .into_iter()
                    .zip(tensors.iter())
                    .map(|(p, t)| (p, t.dtype(), t.shape().to_vec()))
                    .collect();
                let existsok = match &self.backend {
                    Backend::Heap => false,
                    Backend::Memmap { existsok, .. } => *existsok,
                };
                if self.device == DeviceSpec::Auto {
                    self.device = DeviceSpec::Fixed(tensors[0].device().clone());
                }
                self.allocate(spec, templates, existsok)?;
                self.max_size = self.total_shape().map(|s| s.iter().product()).unwrap_or(0);
            }
            self.copy_full(&record)?;
        }
        self.initialized = self.initialized || initialized;
        self.len.set(len);
        Ok(())
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

    fn rand_given_ndim(&self, batch_size: usize) -> Result<Index> {
        if self.ndim == 1 {
            let len = self.len.get();
            if len == 0 {
                return Err(
                    StorageError::Range("cannot draw indices from an empty storage".into()).into(),
                );
            }
            return match self.draw_index(batch_size)? {
                Index::Tuple(mut parts) if parts.len() == 1 => Ok(parts.remove(0)),
                other => Ok(other),
            };
        }
        self.draw_index(batch_size)
    }

    fn shape(&self) -> Result<Vec<usize>> {
        let total = self.total_shape().ok_or_else(|| {
            StorageError::Uninitialized("the shape of a non-initialized storage is unknown".into())
        })?;
        if self.is_full() {
            return Ok(total);
        }
        let mut shape = total;
        shape[0] = self.len_along_dim0();
        Ok(shape)
    }

    fn max_size_along_dim0(&self) -> Result<usize> {
        if self.ndim == 1 {
            return Ok(self.max_size);
        }
        let row = self
            .total_shape()
            .map(|s| s[1..].iter().product::<usize>())
            .ok_or_else(|| {
                StorageError::Uninitialized(
                    "the capacity along the first axis is unknown until the storage is initialized"
                        .into(),
                )
            })?;
        Ok((self.max_size + row - 1) / row)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<Record>> + '_> {
        Box::new((0..self.len_along_dim0()).map(move |i| self.get(&Index::Int(i as i64))))
    }

    fn share(&self) -> Result<Self> {
        if !self.initialized {
            return Err(StorageError::Config(format!(
                "Cannot share a storage of type {} between processes if \
                 it has not been initialized yet. Populate the buffer with \
                 some data in the main process before passing it to the other \
                 subprocesses (or create the buffer explicitly with a TensorStorage).",
                self.name()
            ))
            .into());
        }
        if self.compilable
            || !self.len.is_shared()
            || self.leaves.iter().any(|l| !l.buffer.is_shareable())
        {
            return Err(StorageError::Config(SHARE_ERR.into()).into());
        }
        let leaves = self
            .leaves
            .iter()
            .map(|l| -> Result<Leaf> {
                let file = l
                    .buffer
                    .file_path()
                    .ok_or_else(|| StorageError::Config(SHARE_ERR.into()))?;
                Ok(Leaf {
                    path: l.path.clone(),
                    dtype: l.dtype,
                    shape: l.shape.clone(),
                    buffer: LeafBuffer::open_mapped(file)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            max_size: self.max_size,
            ndim: self.ndim,
            device: self.device.clone(),
            compilable: self.compilable,
            backend: self.backend.clone(),
            initialized: true,
            spec: self.spec.clone(),
            leaves,
            len: self.len.clone(),
            last_cursor: self.last_cursor.clone(),
            attached: AttachedEntities::default(),
            rng: None,
            checkpointer: self.checkpointer.clone(),
        })
    }
}

impl fmt::Debug for TensorStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = Storage::shape(self).ok();
        write!(
            f,
            "{}(shape={:?}, len={}, max_size={})",
            self.name(),
            shape,
            self.len.get(),
            self.max_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::{Fields, Value},
        storage::shared_rng,
    };
    use tempdir::TempDir;

    fn batch(n: usize, offset: f32) -> Result<Record> {
        let obs: Vec<f32> = (0..n * 3).map(|i| i as f32 + offset).collect();
        let act: Vec<i64> = (0..n).map(|i| i as i64).collect();
        Ok(Record::from_fields([
            ("obs", Record::Tensor(Tensor::from_vec(obs, &[n, 3])?)),
            (
                "next",
                Record::from_fields([("act", Record::Tensor(Tensor::from_vec(act, &[n])?))]),
            ),
        ]))
    }

    #[test_log::test]
    fn test_lazy_allocation() -> Result<()> {
        let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(10))?;
        assert!(!storage.is_initialized());
        assert!(storage.get(&0.into()).is_err());

        storage.set(&vec![0usize, 1, 2, 3].into(), batch(4, 0.)?, true)?;
        assert!(storage.is_initialized());
        assert_eq!(storage.len(), 4);
        assert_eq!(Storage::shape(&storage)?, vec![4]);
        assert_eq!(storage.last_cursor(), Some(&Index::from(vec![0usize, 1, 2, 3])));

        let item = storage.get(&2.into())?;
        let obs = item.field("obs").and_then(Record::as_tensor).unwrap();
        assert_eq!(obs.to_vec::<f32>()?, vec![6., 7., 8.]);

        // Reads are limited to the occupied length.
        assert!(storage.get(&5.into()).is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_template_is_frozen() -> Result<()> {
        let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(10))?;
        storage.set(&(0..2).into(), batch(2, 0.)?, true)?;

        let wrong_shape = Record::from_fields([
            ("obs", Record::Tensor(Tensor::from_vec(vec![0f32; 4], &[1, 4])?)),
            (
                "next",
                Record::from_fields([("act", Record::Tensor(Tensor::from_vec(vec![0i64], &[1])?))]),
            ),
        ]);
        assert!(storage.set(&vec![2usize].into(), wrong_shape, true).is_err());

        let mut extra: Fields = [("obs", Record::Tensor(Tensor::from_vec(vec![0f32; 3], &[1, 3])?))]
            .into_iter()
            .collect();
        extra.insert("done", Record::Tensor(Tensor::from_vec(vec![true], &[1])?));
        assert!(storage.set(&vec![2usize].into(), Record::Struct(extra), true).is_err());

        // Field order does not matter.
        let reordered = Record::from_fields([
            (
                "next",
                Record::from_fields([("act", Record::Tensor(Tensor::from_vec(vec![9i64], &[1])?))]),
            ),
            ("obs", Record::Tensor(Tensor::from_vec(vec![1f32; 3], &[1, 3])?)),
        ]);
        storage.set(&vec![2usize].into(), reordered, true)?;
        let act = storage.get(&2.into())?;
        let act = act.get_path(&"next.act".into()).and_then(Record::as_tensor).unwrap();
        assert_eq!(act.to_vec::<i64>()?, vec![9]);
        Ok(())
    }

    #[test_log::test]
    fn test_ndim2_capacity_and_sampling() -> Result<()> {
        let mut storage =
            TensorStorage::lazy(&TensorStorageConfig::default().max_size(100).ndim(2))?;
        let row = Tensor::from_vec((0..7).map(|i| i as f32).collect::<Vec<_>>(), &[7])?;
        storage.set(&0.into(), Record::Tensor(row), true)?;
        assert_eq!(storage.max_size(), 105);
        assert_eq!(storage.max_size_along_dim0()?, 15);
        assert_eq!(storage.len(), 7);
        assert_eq!(storage.len_along_dim0(), 1);
        assert_eq!(Storage::shape(&storage)?, vec![1, 7]);

        storage.set_rng(shared_rng(42));
        let ix = storage.rand_given_ndim(5)?;
        match &ix {
            Index::Tuple(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected one index list per axis"),
        }
        let out = storage.get(&ix)?;
        assert_eq!(out.as_tensor().unwrap().shape(), &[5]);

        let flat = storage.flatten()?;
        assert_eq!(flat.max_size(), 7);
        assert_eq!(flat.ndim(), 1);
        Ok(())
    }

    #[test_log::test]
    fn test_from_record() -> Result<()> {
        let data = batch(5, 0.)?;
        assert!(TensorStorage::from_record(data.clone(), Some(4), 1).is_err());
        let storage = TensorStorage::from_record(data, Some(5), 1)?;
        assert!(storage.is_full());
        assert_eq!(storage.len(), 5);
        assert_eq!(storage.iter().count(), 5);
        Ok(())
    }

    #[test_log::test]
    fn test_cursor_truncation() -> Result<()> {
        let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(3))?;
        let cursor: Vec<usize> = vec![0, 1, 2, 0, 1];
        storage.set(&cursor.into(), batch(5, 0.)?, true)?;
        assert_eq!(storage.len(), 3);
        let act = storage.get(&Index::full())?;
        let act = act.get_path(&"next.act".into()).and_then(Record::as_tensor).unwrap();
        assert_eq!(act.to_vec::<i64>()?, vec![3, 4, 2]);
        Ok(())
    }

    #[test_log::test]
    fn test_memmap_share() -> Result<()> {
        let dir = TempDir::new("memmap_share")?;
        assert!(TensorStorage::memmap(
            &MemmapStorageConfig::default().device(Device::Cuda(0))
        )
        .is_err());

        let config = MemmapStorageConfig::default()
            .max_size(8)
            .scratch_dir(dir.path().join("storage"));
        let mut storage = TensorStorage::memmap(&config)?;
        assert!(storage.share().is_err());

        storage.set(&(0..2).into(), batch(2, 0.)?, true)?;
        assert!(dir.path().join("storage/obs.memmap").exists());
        assert!(dir.path().join("storage/next/act.memmap").exists());

        let mut other = storage.share()?;
        other.set(&vec![2usize].into(), batch(1, 100.)?, true)?;
        assert_eq!(storage.len(), 3);
        let obs = storage.get(&2.into())?;
        let obs = obs.field("obs").and_then(Record::as_tensor).unwrap();
        assert_eq!(obs.to_vec::<f32>()?, vec![100., 101., 102.]);

        let heap = TensorStorage::lazy(&TensorStorageConfig::default().max_size(8))?;
        assert!(heap.share().is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_rejected_write_keeps_length() -> Result<()> {
        let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(10))?;
        let with_value = Record::from_fields([
            ("obs", Record::Tensor(Tensor::from_vec(vec![0f32; 3], &[3])?)),
            ("info", Record::Value(Value::Int(1))),
        ]);
        assert!(storage.set(&0.into(), with_value, true).is_err());
        assert!(!storage.is_initialized());
        assert_eq!(storage.len(), 0);
        assert_eq!(storage.last_cursor(), None);

        storage.set(&vec![0usize].into(), batch(1, 0.)?, true)?;
        let wrong_dtype = Record::from_fields([
            ("obs", Record::Tensor(Tensor::from_vec(vec![0f64; 3], &[1, 3])?)),
            (
                "next",
                Record::from_fields([("act", Record::Tensor(Tensor::from_vec(vec![0i64], &[1])?))]),
            ),
        ]);
        assert!(storage.set(&vec![1usize].into(), wrong_dtype, true).is_err());
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.last_cursor(), Some(&Index::from(vec![0usize])));
        assert!(storage.get(&1.into()).is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_rand_given_ndim() -> Result<()> {
        let mut storage = TensorStorage::lazy(&TensorStorageConfig::default().max_size(10))?;
        assert!(storage.rand_given_ndim(4).is_err());

        storage.set(&(0..5).into(), batch(5, 0.)?, true)?;
        storage.set_rng(shared_rng(3));
        match storage.rand_given_ndim(16)? {
            Index::List(ixs) => {
                assert_eq!(ixs.len(), 16);
                assert!(ixs.iter().all(|i| (0..5).contains(i)));
            }
            other => panic!("expected a list of positions, got {:?}", other),
        }

        storage.set_rng(shared_rng(3));
        let first = storage.rand_given_ndim(8)?;
        storage.set_rng(shared_rng(3));
        assert_eq!(storage.rand_given_ndim(8)?, first);
        assert_eq!(storage.get(&first)?.batch_shape(), vec![8]);
        Ok(())
    }

    #[test_log::test]
    fn test_memmap_dotted_field_names() -> Result<()> {
        let dir = TempDir::new("memmap_dotted")?;
        let config = MemmapStorageConfig::default()
            .max_size(4)
            .scratch_dir(dir.path().join("storage"));
        let mut storage = TensorStorage::memmap(&config)?;
        let item = Record::from_fields([
            ("obs.a", Record::Tensor(Tensor::from_vec(vec![1f32; 3], &[3])?)),
            ("obs.b", Record::Tensor(Tensor::from_vec(vec![2f32; 3], &[3])?)),
        ]);
        storage.set(&0.into(), item, true)?;
        assert!(dir.path().join("storage/obs.a.memmap").exists());
        assert!(dir.path().join("storage/obs.b.memmap").exists());

        let out = storage.get(&0.into())?;
        let a = out.field("obs.a").and_then(Record::as_tensor).unwrap();
        let b = out.field("obs.b").and_then(Record::as_tensor).unwrap();
        assert_eq!(a.to_vec::<f32>()?, vec![1., 1., 1.]);
        assert_eq!(b.to_vec::<f32>()?, vec![2., 2., 2.]);
        Ok(())
    }

    #[test_log::test]
    fn test_memmap_existsok() -> Result<()> {
        let dir = TempDir::new("memmap_existsok")?;
        let config = MemmapStorageConfig::default()
            .max_size(4)
            .scratch_dir(dir.path().join("storage"));
        let mut storage = TensorStorage::memmap(&config)?;
        storage.set(&(0..2).into(), batch(2, 0.)?, true)?;

        let mut fresh = TensorStorage::memmap(&config)?;
        let err = fresh.set(&(0..2).into(), batch(2, 0.)?, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Config(_))
        ));
        assert!(!fresh.is_initialized());

        // The reopened storage maps the files of the first one.
        let mut resumed = TensorStorage::memmap(&config.clone().existsok(true))?;
        resumed.set(&vec![0usize].into(), batch(1, 50.)?, true)?;
        assert_eq!(storage.len(), 1);
        let obs = storage.get(&0.into())?;
        let obs = obs.field("obs").and_then(Record::as_tensor).unwrap();
        assert_eq!(obs.to_vec::<f32>()?, vec![50., 51., 52.]);
        Ok(())
    }
}
