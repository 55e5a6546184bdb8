//! Shared service registry: `name=url` lines in one file, mutated only while
//! holding a cross-process lock.

pub mod lock;
pub mod store;

pub use lock::{DirLock, LockBackend, LockGuard, MemoryLock, StalePolicy};
pub use store::{FileRegistry, MemoryRegistry, RegistryStore};
