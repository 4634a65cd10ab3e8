//! Checkpointers of storages.
//!
//! A checkpointer writes the contents of a storage to a directory and
//! restores them. Each storage nominates a default checkpointer, which can
//! be replaced at construction.
use super::{CompressedListStorage, StateDict, Storage, StorageEnsemble};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::Path,
};

/// Name of the file holding the serialized state dict.
pub const STORAGE_FILE: &str = "storage.bin";

/// Name of the JSON file describing a checkpoint.
pub const METADATA_FILE: &str = "storage_metadata.json";

/// Persistence strategy of a storage of type `S`.
pub trait StorageCheckpointer<S: ?Sized>: Send + Sync {
    /// Writes `storage` to the directory `path`.
    fn dumps(&self, storage: &S, path: &Path) -> Result<()>;

    /// Restores `storage` from the directory `path`.
    fn loads(&self, storage: &mut S, path: &Path) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ListCheckpointMetadata {
    storage_type: String,
    len: usize,
    max_size: usize,
    compressed_bytes: Option<usize>,
}

pub(crate) fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn write_state_dict(state: &StateDict, path: &Path) -> Result<()> {
    let file = File::create(path.join(STORAGE_FILE))?;
    bincode::serialize_into(BufWriter::new(file), state)?;
    Ok(())
}

fn read_state_dict(path: &Path) -> Result<StateDict> {
    let file = File::open(path.join(STORAGE_FILE))?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

/// Default checkpointer of list-backed storages.
///
/// The state dict is written with bincode to `storage.bin`, and a short
/// description of the storage to `storage_metadata.json`.
#[derive(Debug, Default, Clone)]
pub struct ListStorageCheckpointer;

impl<S: Storage> StorageCheckpointer<S> for ListStorageCheckpointer {
    fn dumps(&self, storage: &S, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        write_state_dict(&storage.state_dict()?, path)?;
        let metadata = ListCheckpointMetadata {
            storage_type: storage.name().to_string(),
            len: storage.len(),
            max_size: storage.max_size(),
            compressed_bytes: None,
        };
        write_json(&metadata, &path.join(METADATA_FILE))?;
        info!(
            "Dumped {} with {} items to {:?}",
            storage.name(),
            storage.len(),
            path
        );
        Ok(())
    }

    fn loads(&self, storage: &mut S, path: &Path) -> Result<()> {
        storage.load_state_dict(read_state_dict(path)?)?;
        info!(
            "Loaded {} with {} items from {:?}",
            storage.name(),
            storage.len(),
            path
        );
        Ok(())
    }
}

/// Default checkpointer of [`CompressedListStorage`].
///
/// Payloads are written as they are, without decompressing them.
#[derive(Debug, Default, Clone)]
pub struct CompressedListStorageCheckpointer;

impl StorageCheckpointer<CompressedListStorage> for CompressedListStorageCheckpointer {
    fn dumps(&self, storage: &CompressedListStorage, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        write_state_dict(&storage.state_dict()?, path)?;
        let bytes = storage.bytes()?;
        let metadata = ListCheckpointMetadata {
            storage_type: storage.name().to_string(),
            len: storage.len(),
            max_size: storage.max_size(),
            compressed_bytes: Some(bytes),
        };
        write_json(&metadata, &path.join(METADATA_FILE))?;
        info!(
            "Dumped {} with {} items ({} compressed bytes) to {:?}",
            storage.name(),
            storage.len(),
            bytes,
            path
        );
        Ok(())
    }

    fn loads(&self, storage: &mut CompressedListStorage, path: &Path) -> Result<()> {
        storage.load_state_dict(read_state_dict(path)?)?;
        info!(
            "Loaded {} with {} items from {:?}",
            storage.name(),
            storage.len(),
            path
        );
        Ok(())
    }
}

/// Default checkpointer of [`StorageEnsemble`].
///
/// Member `i` is written with its own checkpointer to `<path>/<i>`.
#[derive(Debug, Default, Clone)]
pub struct StorageEnsembleCheckpointer;

impl StorageCheckpointer<StorageEnsemble> for StorageEnsembleCheckpointer {
    fn dumps(&self, ensemble: &StorageEnsemble, path: &Path) -> Result<()> {
        for (i, storage) in ensemble.storages().iter().enumerate() {
            storage.read().dumps(&path.join(i.to_string()))?;
        }
        info!("Dumped an ensemble of {} storages to {:?}", ensemble.len(), path);
        Ok(())
    }

    fn loads(&self, ensemble: &mut StorageEnsemble, path: &Path) -> Result<()> {
        for (i, storage) in ensemble.storages().iter().enumerate() {
            storage.write().loads(&path.join(i.to_string()))?;
        }
        info!("Loaded an ensemble of {} storages from {:?}", ensemble.len(), path);
        Ok(())
    }
}
