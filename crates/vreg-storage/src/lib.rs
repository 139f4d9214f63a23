//! vreg storage layer
//!
//! Key-addressed object storage for cached package files, with a local
//! disk backend and an in-memory backend.

pub mod backend;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::StorageBackend;
pub use error::StorageError;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
