// Checkpoint Core Library
//
// This library provides per-resource shared/exclusive access control:
// callers obtain passes to resource ids, optionally bounded by a global
// admission limit and optionally reentrant per caller.

// =================================================================
// Primitives
// =================================================================

// Counting Semaphore
// Multi-permit acquisition with optional FIFO fairness
pub mod semaphore;

// Thread Interruption
// Per-thread interrupt flags that abort blocking acquisitions
pub mod interrupt;

// Sharded storage shared by the registry and the reentrancy table
mod shard;

// =================================================================
// Checkpoint components
// =================================================================

// Resource Gates
// Permit pool and reference count of a single resource id
pub mod gate;

// Resource Registries
// On-demand gate creation with reference-counted eviction
pub mod registry;

// Passes
// RAII proof of an acquisition
pub mod pass;

// Checkpoint Protocol
// The shared/exclusive entry points and the non-reentrant checkpoint
pub mod checkpoint;

// Reentrancy
// Per-caller nesting over a non-reentrant checkpoint
pub mod reentrant;

// =================================================================
// Setup
// =================================================================

// Error Handling
pub mod error;

// Configuration
pub mod config;

// Construction from configuration
pub mod builder;

// Logging initialization
pub mod tracing;

// Re-export important types for easier access
pub use builder::{AnyCheckpoint, CheckpointBuilder};
pub use checkpoint::{Checkpoint, SimpleCheckpoint};
pub use config::CheckpointConfig;
pub use error::{CheckpointError, ConfigError, ConfigResult, Result};
pub use gate::{AccessMode, GateFactory, ResourceGate, ResourceKey};
pub use interrupt::{interrupted, Interrupter};
pub use pass::Pass;
pub use reentrant::{CallerContext, ReentrantCheckpoint, ThreadCaller};
pub use registry::{
    PinnedRegistry, RefCountedRegistry, RegistryKind, ResourceRegistry, DEFAULT_CONCURRENCY_LEVEL,
};
pub use semaphore::{Semaphore, WaitPolicy};
