//! Storage backend implementations.

pub mod memory;

pub use memory::{MemoryEnvironment, MemoryEnvironmentConfig};
