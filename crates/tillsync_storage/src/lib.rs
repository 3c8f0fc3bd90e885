//! # tillsync storage
//!
//! Byte-level persistence for the tillsync local replica.
//!
//! Backends are **opaque append-only byte stores**. The record log in
//! `tillsync_core` owns framing, checksums and replay; a backend only
//! promises that bytes it acknowledged as synced survive a process crash.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and ephemeral terminals, with write fault
//!   injection for exercising the degraded read-only path
//! - [`FileBackend`] - a single log file with atomic whole-file replacement
//!   used by compaction
//!
//! ## Example
//!
//! ```rust
//! use tillsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! backend.sync().unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::{FaultSwitch, InMemoryBackend};
