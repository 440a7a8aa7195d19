//! Transparent per-file encryption over an opaque host storage.
//!
//! Applications read and write plaintext through [`StreamInterceptor`];
//! content lands in host storage as authenticated blocks under a per-file
//! key. Each file key is wrapped once per authorized principal, and
//! [`ReKeyCoordinator`] keeps those wrappings in step with the sharing
//! subsystem, re-keys files on hard revoke and migrates the whole system
//! between per-user keys and a single master key.
//!
//! ```text
//! application ──plaintext──> StreamInterceptor ──blocks──> HostStorage
//!                                  │
//!                     Session ─────┤ (unwraps file key)
//!                                  │
//! sharing events ──> ReKeyCoordinator ──record sets──> KeyStore
//! ```
//!
//! [`Engine`] wires the pieces together and exposes provisioning, recovery
//! and master key administration.

mod config;
mod context;
mod engine;
mod error;
mod format;
mod interceptor;
mod locks;
pub mod logging;
mod migration;
mod policy;
mod reader;
mod rekey;
mod storage;
mod writer;

pub use config::{EngineConfig, RevokePolicy};
pub use engine::{Engine, KeyStatus};
pub use error::{EngineError, EngineResult};
pub use format::{FileHeader, FORMAT_VERSION, HEADER_SIZE, MAGIC, content_object};
pub use interceptor::StreamInterceptor;
pub use locks::{FileLockGuard, FileLocks};
pub use migration::MigrationReport;
pub use policy::{AccessPolicy, MemoryAccessPolicy};
pub use reader::EncryptedReader;
pub use rekey::{BatchReport, ConsistencyReport, ReKeyCoordinator};
pub use storage::{FsStorage, HostStorage, MemoryStorage};
pub use writer::EncryptedWriter;

pub use sealfs_keystore::{FileId, KeyMode, PrincipalId};
pub use sealfs_session::{Session, SessionState};
