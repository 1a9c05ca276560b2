//! The collaborators of the block allocator.
//!
//! Each module defines the interface the allocator uses, together with an in-memory implementation.

pub mod alloc;
pub mod cache;
pub mod disk;
pub mod quota;
pub mod snapshot;
