//! Block allocation for FFS/UFS file systems.
//!
//! This library maps logical blocks of files to disk blocks. It allocates blocks and fragments on
//! demand, grows trailing fragments into full blocks as files grow, and builds the single, double
//! and triple indirect blocks of large files.
//!
//! The on-disk tree is kept consistent at all times: new indirect blocks reach the disk before
//! anything points to them, and a failed allocation is unwound such that no pointer to freed space
//! remains.
//!
//! The free-space allocator, the buffer cache, the quota subsystem, and the snapshot hook are
//! collaborators behind traits (see `io`). In-memory implementations of all of them are provided.

#[macro_use]
extern crate slog;
#[macro_use]
extern crate quick_error;
extern crate byteorder;

pub mod balloc;
pub mod error;
pub mod geometry;
pub mod inode;
pub mod io;
pub mod planner;
pub mod pointer;
pub mod pref;
pub mod transaction;

pub use crate::balloc::{Balloc, Block, Flags};
pub use crate::error::{Error, Kind};
pub use crate::geometry::{Geometry, Options};
pub use crate::inode::Inode;
pub use crate::pointer::{BlockPointer, Endian, Format};
