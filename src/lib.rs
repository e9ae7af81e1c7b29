// Molecule definition, snapshot-style mutation
pub mod molecule;

// Canonical text encoding and parsing
pub mod canonize;

// Substructure matching
pub mod substructure;

// Fingerprint handlers and bit-vector helpers
pub mod fingerprint;

// Fingerprint cache with per-thread handlers
pub mod memoize;

// Cutting molecules into connector-marked fragments
pub mod split;

// Joining fragments back together
pub mod assembly;

// Topology signatures and buckets
pub mod topology;

// Approximate nearest-neighbour search
pub mod ann;

// Disk-sharded maps and resettable line streams
pub mod shards;

// Reactions, positions, synthons and hit expansion
pub mod space;

// Space files on disk
pub mod loader;

// The orchestrator: substructure and similarity queries
pub mod search;

// Cooperative cancellation
pub mod cancel;

// Errors
pub mod error;

// Utility functions
mod utils;

// Python library
#[cfg(feature = "python")]
pub mod python;

pub use error::{Result, SpaceError};
