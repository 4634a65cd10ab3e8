use super::{Backend, TensorStorage};
use crate::{
    error::StorageError,
    record::{DType, DeviceSpec, FieldPath, TreeSpec},
    storage::{
        checkpointer::{read_json, write_json},
        Storage, StorageCheckpointer, METADATA_FILE,
    },
};
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Serialize, Deserialize)]
struct LeafMetadata {
    path: FieldPath,
    dtype: DType,
    shape: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorCheckpointMetadata {
    storage_type: String,
    ndim: usize,
    max_size: usize,
    len: usize,
    initialized: bool,
    device: DeviceSpec,
    spec: Option<TreeSpec>,
    leaves: Vec<LeafMetadata>,
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Default checkpointer of [`TensorStorage`].
///
/// Each leaf is written as raw bytes to `<path>/storage/<field path>.memmap`,
/// next to a `storage_metadata.json` file describing the template.
///
/// If a memory-mapped storage lives in `<path>/storage` already, its files
/// are flushed instead of copied, and loading skips them.
#[derive(Debug, Default, Clone)]
pub struct TensorStorageCheckpointer;

impl StorageCheckpointer<TensorStorage> for TensorStorageCheckpointer {
    fn dumps(&self, storage: &TensorStorage, path: &Path) -> Result<()> {
        let dir = path.join("storage");
        fs::create_dir_all(&dir)?;
        for leaf in storage.leaves.iter() {
            let file = dir.join(leaf.path.to_file_path("memmap"));
            match leaf.buffer.file_path() {
                Some(current) if same_file(current, &file) => leaf.buffer.flush()?,
                _ => {
                    if let Some(parent) = file.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&file, leaf.buffer.as_slice())?;
                }
            }
        }

        let metadata = TensorCheckpointMetadata {
            storage_type: storage.name().to_string(),
            ndim: storage.ndim,
            max_size: storage.max_size,
            len: storage.len.get(),
            initialized: storage.initialized,
            device: storage.device.clone(),
            spec: storage.spec.clone(),
            leaves: storage
                .leaves
                .iter()
                .map(|l| LeafMetadata {
                    path: l.path.clone(),
                    dtype: l.dtype,
                    shape: l.shape.clone(),
                })
                .collect(),
        };
        write_json(&metadata, &path.join(METADATA_FILE))?;
        info!(
            "Dumped {} with {} items to {:?}",
            storage.name(),
            storage.len.get(),
            path
        );
        Ok(())
    }

    fn loads(&self, storage: &mut TensorStorage, path: &Path) -> Result<()> {
        let metadata: TensorCheckpointMetadata = read_json(&path.join(METADATA_FILE))?;
        if metadata.ndim != storage.ndim {
            return Err(StorageError::Config(format!(
                "the checkpoint was written by a storage with ndim {}, cannot load it into one with ndim {}",
                metadata.ndim, storage.ndim
            ))
            .into());
        }
        let dir = path.join("storage");

        if metadata.initialized {
            if !storage.initialized {
                if matches!(storage.backend, Backend::Memmap { .. }) {
                    warn!(
                        "Loading the storage on an uninitialized storage. \
                         It is preferable to load a storage onto a \
                         pre-allocated one whenever possible."
                    );
                }
                let spec = metadata.spec.clone().ok_or_else(|| {
                    StorageError::Consistency(
                        "the checkpoint of an initialized storage has no template".into(),
                    )
                })?;
                if storage.device == DeviceSpec::Auto {
                    storage.device = metadata.device.clone();
                }
                let templates = metadata
                    .leaves
                    .iter()
                    .map(|l| (l.path.clone(), l.dtype, l.shape.clone()))
                    .collect();
                storage.allocate(spec, templates, true)?;
                storage.max_size = metadata.max_size;
            } else {
                let matches = storage.leaves.len() == metadata.leaves.len()
                    && storage.leaves.iter().zip(metadata.leaves.iter()).all(|(a, b)| {
                        a.path == b.path && a.dtype == b.dtype && a.shape == b.shape
                    });
                if !matches {
                    return Err(StorageError::Type(format!(
                        "the checkpoint at {:?} does not match the template of the storage",
                        path
                    ))
                    .into());
                }
            }

            for leaf in storage.leaves.iter_mut() {
                let file = dir.join(leaf.path.to_file_path("memmap"));
                if let Some(current) = leaf.buffer.file_path() {
                    if same_file(current, &file) {
                        continue;
                    }
                }
                let bytes = fs::read(&file)?;
                if bytes.len() != leaf.buffer.len() {
                    return Err(StorageError::Consistency(format!(
                        "{:?} holds {} bytes but the field '{}' needs {}",
                        file,
                        bytes.len(),
                        leaf.path,
                        leaf.buffer.len()
                    ))
                    .into());
                }
                leaf.buffer.as_mut_slice().copy_from_slice(&bytes);
            }
        }
        storage.len.set(metadata.len);
        info!(
            "Loaded {} with {} items from {:?}",
            storage.name(),
            metadata.len,
            path
        );
        Ok(())
    }
}
