//! Storages of replay buffers.
//!
//! All storages implement [`Storage`]:
//!
//! * [`ListStorage`] and [`LazyStackStorage`] keep items in a growable list,
//! * [`TensorStorage`] pre-allocates contiguous buffers, in process memory
//!   or in memory-mapped files,
//! * [`CompressedListStorage`] keeps array leaves compressed.
//!
//! [`StorageEnsemble`] routes reads to several storages.
mod base;
mod checkpointer;
mod compressed;
mod config;
mod counter;
mod ensemble;
mod list;
mod tensor;
pub use base::{shared_rng, AttachedEntities, Entity, SharedRng, StateDict, Storage};
pub use checkpointer::{
    CompressedListStorageCheckpointer, ListStorageCheckpointer, StorageCheckpointer,
    StorageEnsembleCheckpointer, METADATA_FILE, STORAGE_FILE,
};
pub use compressed::{
    CompressedItem, CompressedListStorage, CompressionFn, DecompressionFn, ItemMetadata,
    LeafMetadata,
};
pub use config::{
    CompressedListStorageConfig, LazyStackStorageConfig, ListStorageConfig, MemmapStorageConfig,
    TensorStorageConfig,
};
pub use counter::{LengthCounter, LocalCounter, SharedCounter};
pub use ensemble::{
    shared, EnsembleIndex, EnsembleSelection, SharedStorage, StorageEnsemble, Transform,
};
pub use list::{LazyStackStorage, ListStorage};
pub use tensor::{TensorStorage, TensorStorageCheckpointer};
