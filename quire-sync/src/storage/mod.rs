//! Document persistence.
//!
//! Architecture:
//! ```text
//! ┌────────────┐   StorageKey    ┌────────────────┐   joined key   ┌──────────────┐
//! │ Repository │ ──────────────► │ StorageAdapter │ ─────────────► │  KvBackend   │
//! └────────────┘                 │  + ValueCache  │                ├──────────────┤
//!                                └────────────────┘                │ MemoryBackend│
//!                                                                  │ SqlBackend   │
//!                                                                  │ RocksBackend │
//!                                                                  └──────────────┘
//! ```
//!
//! One generic adapter owns the cache, range and failure-policy logic; the
//! backends only implement flat `(key, value)` rows with prefix scans.
//!
//! ## Performance Targets
//!
//! | Metric                 | Target  |
//! |------------------------|---------|
//! | Cached load            | <5μs    |
//! | Chunk save (1KB, Rocks)| <50μs   |
//! | Document range load    | <1ms    |

pub mod adapter;
pub mod backend;
pub mod memory;
pub mod rocks;
pub mod sql;

pub use adapter::{StorageAdapter, StorageConfig, StorageError, WritePolicy};
pub use backend::{BackendError, KvBackend};
pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, RocksConfig};
pub use sql::{SqlBackend, SqlConfig};
