//! Chunked Upload Module
//!
//! Implements resumable, content-addressed uploads with:
//! - Fragment storage keyed by client-computed fingerprint and index
//! - Instant upload when the finished artifact already exists
//! - One assembly per fingerprint at a time, merged by fixed offsets
//!
//! Protocol Flow:
//! 1. Client computes the file fingerprint and checks what already arrived
//! 2. Client uploads only the missing fragments, in any order
//! 3. Client requests a merge; the server assembles the artifact
//! 4. Later uploads of the same fingerprint short-circuit to the artifact

pub mod assembly;
pub mod deduplication;
pub mod fragment_store;
pub mod intake;
pub mod lock;
pub mod types;

pub use assembly::{AssemblyConfig, AssemblyCoordinator};
pub use deduplication::{CacheStats, DedupIndex};
pub use fragment_store::FragmentStore;
pub use intake::UploadService;
pub use lock::{AssemblyLockGuard, AssemblyLocks};
pub use types::*;
