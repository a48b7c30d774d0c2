//! xsync - command submission and cross-process synchronization harness
//!
//! The harness drives an accelerator through a narrow driver interface ([`driver::Driver`]),
//! waits for its work correctly in both the queued and the immediate execution model
//! ([`bundle::CommandBundle`]), and hands memory and event pools between processes
//! ([`ipc`]). The bundled reference driver runs on the CPU and keeps exportable objects in
//! POSIX shared memory, so exchanges between processes are real.

pub mod bundle;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod fence;
pub mod handle;
pub mod harness;
pub mod index;
pub mod ipc;
pub mod logging;
pub mod memory;
pub mod shm;
pub mod timestamp;

pub use bundle::{BundleDesc, CommandBundle};
pub use config::HarnessConfig;
pub use driver::Driver;
pub use error::{Error, Result};
pub use event::EventPool;
pub use harness::Harness;
pub use index::EventIndexAllocator;
pub use memory::{Buffer, ImportedBuffer, MemoryType, SharedScope};
