//! Backing buffers of the leaves of a [`TensorStorage`](super::TensorStorage).
use crate::error::StorageError;
use anyhow::Result;
use log::debug;
use memmap2::{MmapMut, MmapOptions};
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

/// A leaf buffer mapped from a file.
pub(crate) struct MappedLeaf {
    path: PathBuf,
    _file: File,
    // `None` for zero-sized buffers, which cannot be mapped.
    mmap: Option<MmapMut>,
}

/// Bytes of one leaf over the whole capacity of a storage.
pub(crate) enum LeafBuffer {
    Heap(Vec<u8>),
    Mapped(MappedLeaf),
}

impl LeafBuffer {
    pub fn heap(nbytes: usize) -> Self {
        LeafBuffer::Heap(vec![0u8; nbytes])
    }

    /// Creates the file of a leaf and maps it.
    ///
    /// An existing file is reused only if `existsok` is set and its size is `nbytes`.
    pub fn create_mapped(path: &Path, nbytes: usize, existsok: bool) -> Result<Self> {
        if path.exists() {
            if !existsok {
                return Err(StorageError::Config(format!(
                    "the file {:?} already exists. Set existsok to reuse it.",
                    path
                ))
                .into());
            }
            let size = fs::metadata(path)?.len();
            if size != nbytes as u64 {
                return Err(StorageError::Config(format!(
                    "the existing file {:?} has {} bytes but {} bytes are expected",
                    path, size, nbytes
                ))
                .into());
            }
            debug!("Reusing {:?}", path);
            return Self::open_mapped(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(nbytes as u64)?;
        Self::map(path, file, nbytes)
    }

    /// Maps the existing file of a leaf.
    pub fn open_mapped(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let nbytes = file.metadata()?.len() as usize;
        Self::map(path, file, nbytes)
    }

    fn map(path: &Path, file: File, nbytes: usize) -> Result<Self> {
        let mmap = if nbytes == 0 {
            None
        } else {
            // SAFETY: the file was opened with read and write access and is
            // kept alive next to the map. Concurrent writers to the same
            // positions must be coordinated by the caller, as for any shared
            // storage.
            Some(unsafe { MmapOptions::new().len(nbytes).map_mut(&file)? })
        };
        Ok(LeafBuffer::Mapped(MappedLeaf {
            path: path.to_path_buf(),
            _file: file,
            mmap,
        }))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            LeafBuffer::Heap(v) => &v[..],
            LeafBuffer::Mapped(m) => m.mmap.as_deref().unwrap_or(&[]),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            LeafBuffer::Heap(v) => &mut v[..],
            LeafBuffer::Mapped(m) => match m.mmap.as_mut() {
                Some(mmap) => &mut mmap[..],
                None => &mut [],
            },
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Flushes a mapped buffer to its file.
    pub fn flush(&self) -> Result<()> {
        if let LeafBuffer::Mapped(MappedLeaf {
            mmap: Some(mmap), ..
        }) = self
        {
            mmap.flush()?;
        }
        Ok(())
    }

    /// File backing the buffer, if any.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            LeafBuffer::Heap(_) => None,
            LeafBuffer::Mapped(m) => Some(&m.path),
        }
    }

    /// Returns `true` if another handle can map the same bytes.
    pub fn is_shareable(&self) -> bool {
        matches!(self, LeafBuffer::Mapped(_))
    }
}
