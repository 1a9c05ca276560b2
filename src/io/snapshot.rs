//! The snapshot copy-on-write hook.
//!
//! Before a block shared with a snapshot is modified, the snapshot layer gets a chance to copy the
//! old content away. The allocator only calls the hook; what happens inside is not its business.

use crate::io::cache::Buffer;
use crate::Error;

/// A copy-on-write hook.
pub trait CowHook {
    /// Preserve the content of `buf` for any snapshot before it is modified.
    fn copy_on_write(&mut self, buf: &mut Buffer) -> Result<(), Error>;
}

/// No snapshots. The hook does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

impl CowHook for NoSnapshots {
    fn copy_on_write(&mut self, _: &mut Buffer) -> Result<(), Error> {
        Ok(())
    }
}
