//! The record-store substrate: memory-mapped files, the two primitive
//! allocators, the hash-table overlay, and the multimap built on top of
//! them.

pub mod file_lock;
pub mod hash_table;
pub mod mmap_file;
pub mod multimap;
pub mod record_store;
pub mod slab_store;

pub use file_lock::DirectoryLock;
pub use hash_table::{RecordHashTable, SlabHashTable};
pub use mmap_file::MemoryMap;
pub use multimap::MultiMap;
pub use record_store::RecordAllocator;
pub use slab_store::SlabAllocator;
