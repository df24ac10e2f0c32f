//! Memory management for tree construction

mod arena;
mod blocked_vector;
mod classification;

// Re-export
pub use arena::*;
pub use blocked_vector::*;
pub use classification::*;
