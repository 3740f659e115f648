//! Cross-process primitives: named shared memory and its garbage collector.

pub mod garbage_collector;
pub mod queue;
pub mod shared_memory;

pub use garbage_collector::{GarbageCollector, GarbageCollectorConfig, default_registry_name};
pub use queue::SharedQueue;
pub use shared_memory::{AccessMode, ScopedAccess, SharedMemory};
