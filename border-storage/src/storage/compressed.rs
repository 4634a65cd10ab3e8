//! A list storage compressing array leaves.
use super::{
    list::{set_items, ItemSlots},
    AttachedEntities, CompressedListStorageCheckpointer, CompressedListStorageConfig, Entity,
    SharedRng, StateDict, Storage, StorageCheckpointer,
};
use crate::{
    error::StorageError,
    index::{resolve_int, slice_indices, Cursor, Index},
    record::{DType, Device, Fields, Record, Tensor},
};
use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc};

/// Compresses the bytes of an array.
pub type CompressionFn = Arc<dyn Fn(&Tensor) -> Result<Vec<u8>> + Send + Sync>;

/// Rebuilds an array from its compressed bytes and metadata.
pub type DecompressionFn = Arc<dyn Fn(&[u8], &LeafMetadata) -> Result<Tensor> + Send + Sync>;

/// What is needed to rebuild a compressed array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafMetadata {
    /// Shape of the array.
    pub shape: Vec<usize>,
    /// Element type of the array.
    pub dtype: DType,
    /// Device of the array when it was written.
    pub device: Device,
}

impl LeafMetadata {
    fn of(t: &Tensor) -> Self {
        Self {
            shape: t.shape().to_vec(),
            dtype: t.dtype(),
            device: t.device().clone(),
        }
    }

    /// Size of the uncompressed bytes.
    pub fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size()
    }
}

/// Metadata of a stored item, mirroring its structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemMetadata {
    /// A compressed array.
    Tensor(LeafMetadata),
    /// A struct whose fields were processed one by one.
    Struct(Vec<(String, ItemMetadata)>),
    /// A value stored as it is.
    Other,
}

/// Payload of a stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompressedItem {
    /// Compressed bytes of an array.
    Bytes(Vec<u8>),
    /// Payloads of the fields of a struct.
    Struct(Vec<(String, CompressedItem)>),
    /// A record stored without compression.
    Passthrough(Record),
}

impl CompressedItem {
    fn nbytes(&self) -> Result<usize> {
        Ok(match self {
            CompressedItem::Bytes(b) => b.len(),
            CompressedItem::Struct(fields) => fields
                .iter()
                .map(|(_, v)| v.nbytes())
                .sum::<Result<usize>>()?,
            CompressedItem::Passthrough(r) => bincode::serialized_size(r)? as usize,
        })
    }
}

fn zstd_compressor(level: i32) -> CompressionFn {
    Arc::new(move |t: &Tensor| Ok(zstd::bulk::compress(t.as_bytes(), level)?))
}

fn zstd_decompressor() -> DecompressionFn {
    Arc::new(|bytes: &[u8], meta: &LeafMetadata| {
        let raw = zstd::bulk::decompress(bytes, meta.nbytes())?;
        Tensor::from_bytes(raw, meta.dtype, &meta.shape, meta.device.clone())
    })
}

/// A list storage keeping every array leaf compressed.
///
/// Items are compressed one by one on write and decompressed on read.
/// Arrays are compressed with zstd unless another codec is installed with
/// [`CompressedListStorage::with_codec`]. Fields that are not arrays are
/// stored as they are.
///
/// Positions may be left empty, e.g., by a slice write starting past the
/// last item. Empty positions do not count in the length, and reading one
/// of them is an error.
pub struct CompressedListStorage {
    max_size: usize,
    compression_level: i32,
    device: Option<Device>,
    compilable: bool,
    storage: Vec<Option<CompressedItem>>,
    metadata: Vec<Option<ItemMetadata>>,
    compress: CompressionFn,
    decompress: DecompressionFn,
    attached: AttachedEntities,
    rng: Option<SharedRng>,
    checkpointer: Arc<dyn StorageCheckpointer<CompressedListStorage>>,
}

impl CompressedListStorage {
    /// Creates an empty storage with the default zstd codec.
    pub fn build(config: &CompressedListStorageConfig) -> Self {
        Self {
            max_size: config.max_size,
            compression_level: config.compression_level,
            device: config.device.clone(),
            compilable: config.compilable,
            storage: vec![],
            metadata: vec![],
            compress: zstd_compressor(config.compression_level),
            decompress: zstd_decompressor(),
            attached: AttachedEntities::default(),
            rng: None,
            checkpointer: Arc::new(CompressedListStorageCheckpointer),
        }
    }

    /// Replaces the codec of the arrays.
    pub fn with_codec(mut self, compress: CompressionFn, decompress: DecompressionFn) -> Self {
        self.compress = compress;
        self.decompress = decompress;
        self
    }

    /// Replaces the checkpointer.
    pub fn with_checkpointer(
        mut self,
        checkpointer: impl StorageCheckpointer<CompressedListStorage> + 'static,
    ) -> Self {
        self.checkpointer = Arc::new(checkpointer);
        self
    }

    /// Level of the default compressor.
    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    /// Whether the storage was created as compilable.
    pub fn compilable(&self) -> bool {
        self.compilable
    }

    /// Total size of the stored payloads, in bytes.
    pub fn bytes(&self) -> Result<usize> {
        if self.storage.iter().all(Option::is_none) {
            warn!("Compressed storage is empty, returning 0 bytes.");
            return Ok(0);
        }
        let total = self
            .storage
            .iter()
            .flatten()
            .map(CompressedItem::nbytes)
            .sum::<Result<usize>>()?;
        if total == 0 {
            return Err(StorageError::Consistency(
                "Compressed storage is not empty but the compressed size is 0. This is a bug."
                    .into(),
            )
            .into());
        }
        Ok(total)
    }

    fn compress_item(&self, data: &Record) -> Result<(CompressedItem, ItemMetadata)> {
        Ok(match data {
            Record::Tensor(t) => (
                CompressedItem::Bytes((self.compress)(t)?),
                ItemMetadata::Tensor(LeafMetadata::of(t)),
            ),
            Record::Struct(fields) => {
                let mut items = Vec::with_capacity(fields.len());
                let mut metas = Vec::with_capacity(fields.len());
                for (name, value) in fields.iter() {
                    let (item, meta) = self.compress_item(value)?;
                    items.push((name.clone(), item));
                    metas.push((name.clone(), meta));
                }
                (CompressedItem::Struct(items), ItemMetadata::Struct(metas))
            }
            other => (CompressedItem::Passthrough(other.clone()), ItemMetadata::Other),
        })
    }

    fn decompress_item(&self, item: &CompressedItem, meta: &ItemMetadata) -> Result<Record> {
        match (item, meta) {
            (CompressedItem::Bytes(bytes), ItemMetadata::Tensor(meta)) => {
                let t = (self.decompress)(bytes, meta)?;
                Ok(Record::Tensor(match &self.device {
                    Some(device) => t.to_device(device),
                    None => t,
                }))
            }
            (CompressedItem::Struct(items), ItemMetadata::Struct(metas)) => {
                let mut fields = Fields::new();
                for ((name, item), (_, meta)) in items.iter().zip(metas.iter()) {
                    fields.insert(name.clone(), self.decompress_item(item, meta)?);
                }
                Ok(Record::Struct(fields))
            }
            (CompressedItem::Passthrough(record), ItemMetadata::Other) => Ok(record.clone()),
            _ => Err(StorageError::Consistency(
                "the metadata of a stored item does not match its payload".into(),
            )
            .into()),
        }
    }

    fn get_item(&self, ix: i64) -> Result<Record> {
        let not_set = || StorageError::Index(format!("Index {} out of bounds or not set", ix));
        let i = resolve_int(ix, self.storage.len()).map_err(|_| not_set())?;
        match (&self.storage[i], &self.metadata[i]) {
            (Some(item), Some(meta)) => self.decompress_item(item, meta),
            _ => Err(not_set().into()),
        }
    }

    fn put(&mut self, cursor: usize, data: &Record) -> Result<()> {
        let (item, meta) = self.compress_item(data)?;
        if cursor >= self.storage.len() {
            self.storage.resize(cursor + 1, None);
            self.metadata.resize(cursor + 1, None);
        }
        self.storage[cursor] = Some(item);
        self.metadata[cursor] = Some(meta);
        Ok(())
    }
}

impl ItemSlots for CompressedListStorage {
    fn storage_name(&self) -> &'static str {
        "CompressedListStorage"
    }

    fn capacity(&self) -> usize {
        self.max_size
    }

    fn slots_len(&self) -> usize {
        self.storage.len()
    }

    fn device(&self) -> Option<&Device> {
        None
    }

    fn write_item(&mut self, cursor: usize, data: Record) -> Result<()> {
        self.put(cursor, &data)
    }

    // Slices are resolved against the stored items. An explicit non-negative
    // start with a positive step may point past the last item, up to the
    // capacity. Extra positions or items are ignored.
    fn write_slice(
        &mut self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
        items: Vec<Record>,
    ) -> Result<()> {
        let len = self.storage.len();
        match (start, step.unwrap_or(1)) {
            (Some(first), step) if first >= 0 && step > 0 => {
                let first = first as usize;
                let stop = match stop {
                    None => self.max_size,
                    Some(v) if v < 0 => (v + len as i64).max(0) as usize,
                    Some(v) => (v as usize).min(self.max_size),
                };
                (first..stop.max(first))
                    .step_by(step as usize)
                    .zip(items.iter())
                    .try_for_each(|(i, item)| self.put(i, item))
            }
            _ => slice_indices(start, stop, step, len)?
                .into_iter()
                .zip(items.iter())
                .try_for_each(|(i, item)| self.put(i, item)),
        }
    }
}

impl Storage for CompressedListStorage {
    fn name(&self) -> &'static str {
        "CompressedListStorage"
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn len(&self) -> usize {
        self.storage.iter().filter(|s| s.is_some()).count()
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
            Index::List(ixs) => Ok(Record::List(
                ixs.iter()
                    .map(|&i| self.get_item(i))
                    .collect::<Result<_>>()?,
            )),
            slice => Ok(Record::List(
                slice
                    .positions(self.storage.len())?
                    .into_iter()
                    .filter(|&i| self.storage[i].is_some())
                    .map(|i| self.get_item(i as i64))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    fn contains(&self, item: i64) -> Result<bool> {
        let len = self.storage.len() as i64;
        let item = if item < 0 { item + len } else { item };
        Ok(0 <= item && item < len && self.storage[item as usize].is_some())
    }

    fn empty(&mut self) {
        self.storage.clear();
        self.metadata.clear();
    }

    fn state_dict(&self) -> Result<StateDict> {
        Ok(StateDict::Compressed {
            storage: self.storage.clone(),
            metadata: self.metadata.clone(),
        })
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        match state_dict {
            StateDict::Compressed { storage, metadata } => {
                if storage.len() != metadata.len() {
                    return Err(StorageError::Consistency(format!(
                        "{} payloads were given with {} metadata entries",
                        storage.len(),
                        metadata.len()
                    ))
                    .into());
                }
                self.storage = storage;
                self.metadata = metadata;
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

impl fmt::Debug for CompressedListStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompressedListStorage(len={}, max_size={}, compression_level={})",
            self.len(),
            self.max_size,
            self.compression_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: u8) -> Result<Record> {
        Ok(Record::from_fields([
            ("pixels", Record::Tensor(Tensor::from_vec(vec![v; 64], &[8, 8])?)),
            ("label", Record::Value("frame".into())),
        ]))
    }

    #[test_log::test]
    fn test_compress_round_trip() -> Result<()> {
        let mut storage =
            CompressedListStorage::build(&CompressedListStorageConfig::default().max_size(4));
        assert_eq!(storage.bytes()?, 0);
        storage.set(&0.into(), frame(3)?, true)?;
        storage.set(&1.into(), frame(5)?, true)?;
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get(&1.into())?, frame(5)?);

        // Constant frames compress below their raw size.
        assert!(storage.bytes()? > 0);
        assert!(storage.bytes()? < 2 * 64);

        assert!(storage.set(&4.into(), frame(0)?, true).is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_unset_slots() -> Result<()> {
        let mut storage =
            CompressedListStorage::build(&CompressedListStorageConfig::default().max_size(8));
        let batch = Record::List(vec![frame(1)?, frame(2)?]);
        storage.set(&Index::Slice { start: Some(3), stop: None, step: None }, batch, true)?;
        assert_eq!(storage.len(), 2);
        assert!(!storage.contains(0)?);
        assert!(storage.contains(3)?);
        assert!(storage.contains(-1)?);

        let err = storage.get(&0.into()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::Index("Index 0 out of bounds or not set".into()))
        );
        match storage.get(&Index::full())? {
            Record::List(items) => assert_eq!(items, vec![frame(1)?, frame(2)?]),
            other => panic!("unexpected record {:?}", other),
        }

        storage.empty();
        assert_eq!(storage.len(), 0);
        assert!(!storage.contains(3)?);
        Ok(())
    }

    #[test_log::test]
    fn test_negative_slice_start() -> Result<()> {
        let mut storage =
            CompressedListStorage::build(&CompressedListStorageConfig::default().max_size(8));
        storage.set(&0.into(), frame(0)?, true)?;
        storage.set(&1.into(), frame(1)?, true)?;

        let slice = Index::Slice { start: Some(-1), stop: None, step: None };
        storage.set(&slice, Record::List(vec![frame(9)?]), true)?;
        assert_eq!(storage.len(), 2);
        assert!(!storage.contains(7)?);
        assert_eq!(storage.get(&1.into())?, frame(9)?);
        assert_eq!(storage.get(&0.into())?, frame(0)?);

        // Open slices cover the stored items only.
        storage.set(&Index::full(), Record::List(vec![frame(4)?, frame(5)?, frame(6)?]), true)?;
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.get(&1.into())?, frame(5)?);
        Ok(())
    }

    #[test_log::test]
    fn test_custom_codec() -> Result<()> {
        let compress: CompressionFn = Arc::new(|t: &Tensor| Ok(t.as_bytes().to_vec()));
        let decompress: DecompressionFn = Arc::new(|b: &[u8], m: &LeafMetadata| {
            Tensor::from_bytes(b.to_vec(), m.dtype, &m.shape, m.device.clone())
        });
        let mut storage =
            CompressedListStorage::build(&CompressedListStorageConfig::default())
                .with_codec(compress, decompress);
        storage.set(&0.into(), frame(7)?, true)?;
        assert_eq!(storage.bytes()?, 64 + bincode::serialized_size(&Record::Value("frame".into()))? as usize);
        assert_eq!(storage.get(&0.into())?, frame(7)?);
        Ok(())
    }
}
