// Bitvault Infrastructure - Filesystem Adapter
// Implements: Storage

pub mod local_storage;

pub use local_storage::LocalStorage;
