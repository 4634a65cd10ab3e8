//! Occupied-length counters.
//!
//! The length of a storage is the only state that concurrent workers may
//! update at the same time. [`LocalCounter`] keeps it in process memory;
//! [`SharedCounter`] keeps it in a shared memory map so that every handle
//! on the storage, in this or another process, observes the same value.
use anyhow::Result;
use memmap2::{MmapMut, MmapOptions};
use std::{
    fmt::Debug,
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

const CELL_SIZE: usize = std::mem::size_of::<AtomicU64>();

/// A length counter of a storage.
pub trait LengthCounter: Send + Sync + Debug {
    /// Current value.
    fn get(&self) -> usize;

    /// Overwrites the value.
    fn set(&self, value: usize);

    /// Adds `n`, saturating at `max`, and returns the new value.
    fn add_bounded(&self, n: usize, max: usize) -> usize;

    /// Returns `true` if the value is visible to other processes.
    fn is_shared(&self) -> bool;
}

/// In-process counter.
#[derive(Debug, Default)]
pub struct LocalCounter(AtomicUsize);

impl LocalCounter {
    /// Creates a counter holding `value`.
    pub fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }
}

impl LengthCounter for LocalCounter {
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, value: usize) {
        self.0.store(value, Ordering::SeqCst)
    }

    fn add_bounded(&self, n: usize, max: usize) -> usize {
        let prev = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(n).min(max))
            })
            .unwrap_or_else(|v| v);
        prev.saturating_add(n).min(max)
    }

    fn is_shared(&self) -> bool {
        false
    }
}

/// Counter living in a shared memory map.
///
/// [`SharedCounter::new`] maps anonymous memory, inherited by child
/// processes. [`SharedCounter::open`] maps a small file, so that unrelated
/// processes opening the same file share the counter.
pub struct SharedCounter {
    mmap: MmapMut,
    path: Option<PathBuf>,
}

impl SharedCounter {
    /// Creates a counter in anonymous shared memory.
    pub fn new(value: usize) -> Result<Self> {
        let mmap = MmapOptions::new().len(CELL_SIZE).map_anon()?;
        let counter = Self { mmap, path: None };
        counter.set(value);
        Ok(counter)
    }

    /// Maps the counter stored in the file at `path`, creating it if needed.
    ///
    /// If `reset` is `true` the counter is set to zero.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != CELL_SIZE as u64 {
            file.set_len(CELL_SIZE as u64)?;
        }
        // SAFETY: the file has the size of the cell and is only accessed
        // through atomic operations on the mapped cell.
        let mmap = unsafe { MmapOptions::new().len(CELL_SIZE).map_mut(&file)? };
        let counter = Self {
            mmap,
            path: Some(path.to_path_buf()),
        };
        if reset {
            counter.set(0);
        }
        Ok(counter)
    }

    /// File backing the counter, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn cell(&self) -> &AtomicU64 {
        // SAFETY: the map is page aligned, at least `CELL_SIZE` bytes long and
        // lives as long as `self`. Every access goes through the atomic.
        unsafe { &*(self.mmap.as_ptr() as *const AtomicU64) }
    }
}

impl Debug for SharedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCounter")
            .field("value", &self.get())
            .field("path", &self.path)
            .finish()
    }
}

impl LengthCounter for SharedCounter {
    fn get(&self) -> usize {
        self.cell().load(Ordering::SeqCst) as usize
    }

    fn set(&self, value: usize) {
        self.cell().store(value as u64, Ordering::SeqCst)
    }

    fn add_bounded(&self, n: usize, max: usize) -> usize {
        let (n, max) = (n as u64, max as u64);
        let prev = self
            .cell()
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(n).min(max))
            })
            .unwrap_or_else(|v| v);
        prev.saturating_add(n).min(max) as usize
    }

    fn is_shared(&self) -> bool {
        true
    }
}
