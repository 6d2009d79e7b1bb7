//! Shared building blocks for the blockvault storage engine:
//! object identifiers, the common error type, and engine configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, ImmediateCommit, RegionConfig};
pub use error::{Error, Result};
pub use types::{pool_of, ObjectId, ObjectVersion, PoolId};
