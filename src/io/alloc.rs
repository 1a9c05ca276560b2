//! Block and fragment allocation.
//!
//! The disk is split into cylinder groups, each holding a fixed number of fragments. The first
//! block of every group holds the group's free-space summary and is never handed out.
//!
//! This module defines the interface of the free-space allocator, and an in-memory allocator
//! keeping a fragment bitmap.

use slog::Logger;

use crate::geometry::Geometry;
use crate::{Error, Flags};

/// A cylinder group number.
pub type Group = u32;

/// A free-space allocator.
///
/// All addresses are fragment addresses and all sizes are in bytes. The allocator never touches
/// inodes or quotas; that is up to the caller.
pub trait Allocator {
    /// Allocate a fragment run of `size` bytes for logical block `lbn` of inode `ino`.
    ///
    /// The run lies within a single block. `pref` is the preferred address, or zero for no
    /// preference. If no space is left, `Error::OutOfSpace` is returned.
    fn alloc(&mut self, ino: u64, lbn: i64, pref: u64, size: usize, flags: Flags)
        -> Result<u64, Error>;
    /// Grow the fragment run at `old` from `old_size` to `new_size` bytes.
    ///
    /// The run is extended in place if the following fragments are free. Otherwise a new run is
    /// allocated near `pref` and the old run is freed. The address of the grown run is returned.
    fn grow_fragment(&mut self, ino: u64, lbn: i64, old: u64, pref: u64, old_size: usize,
                     new_size: usize) -> Result<u64, Error>;
    /// Free the run of `size` bytes at `blkno`, which belonged to inode `ino`.
    fn free(&mut self, blkno: u64, size: usize, ino: u64);

    /// The number of cylinder groups.
    fn group_count(&self) -> Group;
    /// The cylinder group holding inode `ino`.
    fn inode_group(&self, ino: u64) -> Group;
    /// The cylinder group holding fragment `blkno`.
    fn block_group(&self, blkno: u64) -> Group;
    /// The address of the first fragment of cylinder group `cg`.
    fn group_base(&self, cg: Group) -> u64;
    /// The number of free full blocks in cylinder group `cg`.
    fn group_free_blocks(&self, cg: Group) -> u64;
    /// The address of the summary block keeping track of fragment `blkno`.
    fn summary_block(&self, blkno: u64) -> u64;

    /// The average number of free full blocks per cylinder group.
    fn average_free_blocks(&self) -> u64 {
        let total: u64 = (0..self.group_count()).map(|cg| self.group_free_blocks(cg)).sum();
        total / u64::from(self.group_count())
    }
}

/// The number of inodes per cylinder group of the in-memory allocator.
pub const INODES_PER_GROUP: u64 = 64;

/// An in-memory fragment allocator.
///
/// Allocation is first fit, starting at the preference (or the inode's group) and sweeping the
/// groups from there. Fragment runs are taken from partially used blocks before breaking up a free
/// block.
pub struct MemAllocator {
    /// The file system geometry.
    geometry: Geometry,
    /// The number of fragments per cylinder group.
    fpg: u64,
    /// The number of cylinder groups.
    groups: Group,
    /// The fragment bitmap. `true` means in use.
    used: Vec<bool>,
    /// The number of `alloc` and `grow_fragment` calls so far.
    calls: usize,
    /// The call which shall fail, if any.
    fail_at: Option<usize>,
    /// The logger.
    log: Logger,
}

impl MemAllocator {
    /// Create an allocator of `groups` cylinder groups, each `fpg` fragments large.
    ///
    /// `fpg` must be a multiple of the number of fragments per block, of at least two blocks.
    pub fn new(geometry: Geometry, groups: Group, fpg: u64) -> Result<MemAllocator, Error> {
        let frag = geometry.frag() as u64;
        if groups == 0 || fpg % frag != 0 || fpg < 2 * frag {
            return Err(Error::InvalidGeometry {
                reason: "a cylinder group must hold a whole number of blocks, at least two",
            });
        }

        let mut used = vec![false; (fpg * u64::from(groups)) as usize];
        // Reserve the summary block of every group.
        for cg in 0..u64::from(groups) {
            for n in 0..frag {
                used[(cg * fpg + n) as usize] = true;
            }
        }

        Ok(MemAllocator {
            geometry: geometry,
            fpg: fpg,
            groups: groups,
            used: used,
            calls: 0,
            fail_at: None,
            log: Logger::root(slog::Discard, o!()),
        })
    }

    /// Log through `log`.
    pub fn with_logger(mut self, log: Logger) -> MemAllocator {
        self.log = log;
        self
    }

    /// The total number of fragments.
    pub fn size(&self) -> u64 {
        self.used.len() as u64
    }

    /// Make the `n`'th allocating call from now fail with `Error::OutOfSpace`.
    ///
    /// `n = 1` makes the very next call fail.
    pub fn fail_on_call(&mut self, n: usize) {
        self.fail_at = Some(self.calls + n);
    }

    /// The number of `alloc` and `grow_fragment` calls so far.
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// The number of fragments in use, summary blocks included.
    pub fn used_fragments(&self) -> u64 {
        self.used.iter().filter(|&&x| x).count() as u64
    }

    /// Is fragment `blkno` in use?
    pub fn is_allocated(&self, blkno: u64) -> bool {
        self.used.get(blkno as usize).cloned().unwrap_or(false)
    }

    /// Mark the run of `size` bytes at `blkno` as used, without going through the allocator.
    pub fn reserve(&mut self, blkno: u64, size: usize) {
        let n = self.geometry.numfrags(self.geometry.fragroundup(size));
        for b in blkno..blkno + n {
            self.used[b as usize] = true;
        }
    }

    /// Count the call, and check if it was told to fail.
    fn tick(&mut self) -> Result<(), Error> {
        self.calls += 1;
        if self.fail_at == Some(self.calls) {
            self.fail_at = None;
            info!(self.log, "failing allocation on request"; "call" => self.calls);
            return Err(Error::OutOfSpace);
        }

        Ok(())
    }

    /// Are the `n` fragments starting at `blkno` free and within one block?
    fn run_is_free(&self, blkno: u64, n: u64) -> bool {
        let frag = self.geometry.frag() as u64;
        blkno % frag + n <= frag
            && blkno + n <= self.size()
            && (blkno..blkno + n).all(|b| !self.used[b as usize])
    }

    /// Is any fragment of the block starting at `block` in use?
    fn block_is_partial(&self, block: u64) -> bool {
        let frag = self.geometry.frag() as u64;
        (block..block + frag).any(|b| self.used[b as usize])
    }

    /// Find a free run of `n` fragments in group `cg`.
    fn search_group(&self, cg: Group, n: u64) -> Option<u64> {
        let frag = self.geometry.frag() as u64;
        let base = self.group_base(cg);
        let blocks = (base..base + self.fpg).step_by(frag as usize);

        if n < frag {
            // Fragment runs go into broken blocks first.
            for block in blocks.clone().filter(|&block| self.block_is_partial(block)) {
                if let Some(b) = (block..block + frag - n + 1).find(|&b| self.run_is_free(b, n)) {
                    return Some(b);
                }
            }
        }

        blocks.clone().find(|&block| self.run_is_free(block, n))
    }

    /// Find a free run of `n` fragments, preferably at `pref`.
    fn search(&self, ino: u64, pref: u64, n: u64) -> Option<u64> {
        let frag = self.geometry.frag() as u64;
        let pref = if pref >= self.size() { 0 } else { pref };

        let start = if pref == 0 {
            self.inode_group(ino)
        } else {
            // Try the exact preference first, aligned to a block for full blocks.
            let at = if n == frag { pref - pref % frag } else { pref };
            if self.run_is_free(at, n) {
                return Some(at);
            }

            self.block_group(pref)
        };

        (0..self.groups)
            .map(|i| (start + i) % self.groups)
            .filter_map(|cg| self.search_group(cg, n))
            .next()
    }

    /// Mark or unmark a run.
    fn set(&mut self, blkno: u64, n: u64, used: bool) {
        for b in blkno..blkno + n {
            self.used[b as usize] = used;
        }
    }
}

impl Allocator for MemAllocator {
    fn alloc(&mut self, ino: u64, lbn: i64, pref: u64, size: usize, flags: Flags)
        -> Result<u64, Error> {
        self.tick()?;

        assert!(size > 0 && size <= self.geometry.bsize(), "allocating {} bytes", size);
        let n = self.geometry.numfrags(self.geometry.fragroundup(size));

        let blkno = self.search(ino, pref, n).ok_or(Error::OutOfSpace)?;
        self.set(blkno, n, true);

        debug!(self.log, "allocated run"; "ino" => ino, "lbn" => lbn, "pref" => pref,
               "blkno" => blkno, "size" => size, "metadata" => flags.metadata_only);

        Ok(blkno)
    }

    fn grow_fragment(&mut self, ino: u64, lbn: i64, old: u64, pref: u64, old_size: usize,
                     new_size: usize) -> Result<u64, Error> {
        self.tick()?;

        assert!(old_size < new_size && new_size <= self.geometry.bsize(),
                "growing a run from {} to {} bytes", old_size, new_size);
        let old_n = self.geometry.numfrags(old_size);
        let new_n = self.geometry.numfrags(new_size);

        // Check for extension in the existing location.
        if old % self.geometry.frag() as u64 + new_n <= self.geometry.frag() as u64
            && self.run_is_free(old + old_n, new_n - old_n) {
            self.set(old + old_n, new_n - old_n, true);
            debug!(self.log, "extended run in place"; "ino" => ino, "lbn" => lbn,
                   "blkno" => old, "old size" => old_size, "new size" => new_size);

            return Ok(old);
        }

        let blkno = self.search(ino, pref, new_n).ok_or(Error::OutOfSpace)?;
        self.set(blkno, new_n, true);
        self.set(old, old_n, false);

        debug!(self.log, "moved run"; "ino" => ino, "lbn" => lbn, "from" => old,
               "to" => blkno, "old size" => old_size, "new size" => new_size);

        Ok(blkno)
    }

    fn free(&mut self, blkno: u64, size: usize, ino: u64) {
        let n = self.geometry.numfrags(self.geometry.fragroundup(size));
        debug!(self.log, "freeing run"; "ino" => ino, "blkno" => blkno, "size" => size);

        for b in blkno..blkno + n {
            assert!(self.used[b as usize], "freeing free fragment {} (inode {})", b, ino);
        }
        self.set(blkno, n, false);
    }

    fn group_count(&self) -> Group {
        self.groups
    }

    fn inode_group(&self, ino: u64) -> Group {
        ((ino / INODES_PER_GROUP) % u64::from(self.groups)) as Group
    }

    fn block_group(&self, blkno: u64) -> Group {
        (blkno / self.fpg) as Group
    }

    fn group_base(&self, cg: Group) -> u64 {
        u64::from(cg) * self.fpg
    }

    fn group_free_blocks(&self, cg: Group) -> u64 {
        let frag = self.geometry.frag() as u64;
        let base = self.group_base(cg);
        (base..base + self.fpg)
            .step_by(frag as usize)
            .filter(|&block| !self.block_is_partial(block))
            .count() as u64
    }

    fn summary_block(&self, blkno: u64) -> u64 {
        self.group_base(self.block_group(blkno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Options;
    use crate::pointer::Format;

    fn alloc() -> MemAllocator {
        let geometry = Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap();
        MemAllocator::new(geometry, 4, 2048).unwrap()
    }

    #[test]
    fn summary_blocks_are_reserved() {
        let alloc = alloc();
        assert_eq!(alloc.used_fragments(), 4 * 8);
        assert!(alloc.is_allocated(2048));
        assert!(!alloc.is_allocated(2056));
        assert_eq!(alloc.group_free_blocks(0), 255);
        assert_eq!(alloc.summary_block(3000), 2048);
    }

    #[test]
    fn honours_preference() {
        let mut alloc = alloc();
        assert_eq!(alloc.alloc(2, 0, 104, 4096, Flags::default()), Ok(104));
        // Occupied, so the next free block of the group is taken.
        assert_eq!(alloc.alloc(2, 1, 104, 4096, Flags::default()), Ok(8));
        // No preference means the inode's group.
        assert_eq!(alloc.alloc(70, 0, 0, 4096, Flags::default()), Ok(2056));
    }

    #[test]
    fn fragments_fill_broken_blocks() {
        let mut alloc = alloc();
        let a = alloc.alloc(2, 0, 0, 512, Flags::default()).unwrap();
        let b = alloc.alloc(3, 0, 0, 1024, Flags::default()).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 9);
        assert_eq!(alloc.group_free_blocks(0), 254);
    }

    #[test]
    fn grow_in_place_and_moved() {
        let mut alloc = alloc();
        let a = alloc.alloc(2, 0, 0, 1024, Flags::default()).unwrap();
        assert_eq!(alloc.grow_fragment(2, 0, a, 0, 1024, 2048), Ok(a));

        // Block the way.
        alloc.reserve(a + 4, 512);
        let b = alloc.grow_fragment(2, 0, a, 0, 2048, 4096).unwrap();
        assert_ne!(a, b);
        assert_eq!(b % 8, 0);
        assert!(!alloc.is_allocated(a));
        assert!((b..b + 8).all(|x| alloc.is_allocated(x)));
    }

    #[test]
    fn injected_failure() {
        let mut alloc = alloc();
        alloc.fail_on_call(2);
        assert!(alloc.alloc(2, 0, 0, 4096, Flags::default()).is_ok());
        assert_eq!(alloc.alloc(2, 1, 0, 4096, Flags::default()), Err(Error::OutOfSpace));
        assert!(alloc.alloc(2, 1, 0, 4096, Flags::default()).is_ok());
        assert_eq!(alloc.calls(), 3);
    }

    #[test]
    fn out_of_space() {
        let geometry = Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap();
        let mut alloc = MemAllocator::new(geometry, 1, 16).unwrap();
        assert_eq!(alloc.alloc(2, 0, 0, 4096, Flags::default()), Ok(8));
        assert_eq!(alloc.alloc(2, 1, 0, 512, Flags::default()), Err(Error::OutOfSpace));
    }

    #[test]
    #[should_panic]
    fn double_free() {
        let mut alloc = alloc();
        let a = alloc.alloc(2, 0, 0, 4096, Flags::default()).unwrap();
        alloc.free(a, 4096, 2);
        alloc.free(a, 4096, 2);
    }
}
