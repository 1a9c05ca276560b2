//! Allocation transactions.
//!
//! Every call into the block allocator runs inside a transaction, which records the allocations
//! made so far and the shallowest level at which a new block was linked into the tree. If the call
//! fails, the transaction is aborted: the new subtree is unlinked with a single pointer store, and
//! every block allocated by the call is given back.
//!
//! New indirect blocks are always written to disk before they are linked, so at any point the tree
//! on disk is valid. Aborting never writes a pointer to freed space: if the unlink fails, the new
//! blocks stay allocated and referenced, and the space leaks instead.

use std::fmt;

use slog::Logger;

use crate::geometry::{Geometry, NIADDR};
use crate::inode::Inode;
use crate::io::alloc::Allocator;
use crate::io::cache::{Buffer, BufferCache, WriteMode};
use crate::io::quota::Quota;
use crate::planner::Plan;
use crate::pointer::BlockPointer;
use crate::Error;

/// An allocation made during a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new indirect block at level `level` (1 for the block pointed to by the inode).
    IndirectBlock {
        /// The level of the block.
        level: usize,
        /// The logical block number of the indirect block.
        lbn: i64,
        /// The address of the block.
        blkno: u64,
    },
    /// A new data block.
    DataBlock {
        /// The logical block number.
        lbn: i64,
        /// The address of the block.
        blkno: u64,
        /// The size of the block in bytes.
        size: usize,
    },
    /// A fragment run at the end of the file was grown.
    FragmentGrow {
        /// The logical block number.
        lbn: i64,
        /// The address of the run after growing.
        blkno: u64,
        /// The size of the run before growing.
        old_size: usize,
        /// The size of the run after growing.
        new_size: usize,
        /// The file size before growing.
        old_file_size: u64,
        /// The old content, if the run was moved.
        ///
        /// The old location is free once the run moved, so this is the only copy until the new
        /// location has been written.
        head: Option<Vec<u8>>,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Event::IndirectBlock { level, lbn, blkno } =>
                write!(f, "indirect block {} (lbn {}, level {})", blkno, lbn, level),
            Event::DataBlock { lbn, blkno, size } =>
                write!(f, "data block {} (lbn {}, {} bytes)", blkno, lbn, size),
            Event::FragmentGrow { lbn, blkno, old_size, new_size, .. } =>
                write!(f, "fragment {} (lbn {}) grown from {} to {} bytes", blkno, lbn, old_size,
                       new_size),
        }
    }
}

/// An allocation transaction.
///
/// A transaction must be finished with either `commit` or `abort`.
pub struct Transaction {
    /// The indirection chain of the block being resolved.
    plan: Plan,
    /// The allocations made so far, in order.
    events: Vec<Event>,
    /// The level of the first new link, if any.
    ///
    /// Zero means the pointer in the inode, `i > 0` a slot in the indirect block of level `i`.
    unwind: Option<usize>,
    /// The address of the indirect block of every level reached so far.
    chain: [Option<u64>; NIADDR + 1],
    /// Has the transaction been committed or aborted?
    finished: bool,
    /// The logger.
    log: Logger,
}

impl Transaction {
    /// Start a transaction resolving the block at the end of `plan`.
    pub fn new(log: &Logger, plan: Plan) -> Transaction {
        Transaction {
            plan: plan,
            events: Vec::new(),
            unwind: None,
            chain: [None; NIADDR + 1],
            finished: false,
            log: log.clone(),
        }
    }

    /// The indirection chain.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// The allocations recorded so far.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The level of the first new link, if any.
    pub fn unwind_index(&self) -> Option<usize> {
        self.unwind
    }

    /// Record an allocation.
    pub fn record(&mut self, event: Event) {
        trace!(self.log, "recording allocation"; "event" => %event);
        self.events.push(event);
    }

    /// Note that the indirect block of level `level` lives at `blkno`.
    pub fn descend(&mut self, level: usize, blkno: u64) {
        self.chain[level] = Some(blkno);
    }

    /// Note that a new block was linked into the tree at level `level`.
    ///
    /// Only the first link counts: everything below it is new.
    pub fn link(&mut self, level: usize) {
        if self.unwind.is_none() {
            self.unwind = Some(level);
        }
    }

    /// Commit the transaction.
    pub fn commit(mut self) {
        trace!(self.log, "committing allocation"; "allocations" => self.events.len());
        self.finished = true;
    }

    /// Abort the transaction, undoing its allocations.
    ///
    /// The error which caused the abort is returned unchanged.
    pub fn abort<P, A, C, Q>(mut self, fs: &Geometry, alloc: &mut A, cache: &mut C,
                             quota: &mut Q, inode: &mut Inode<P>, err: Error) -> Error
    where P: BlockPointer,
          A: Allocator,
          C: BufferCache,
          Q: Quota {
        self.finished = true;
        if self.events.is_empty() && self.unwind.is_none() {
            return err;
        }

        warn!(self.log, "unwinding failed allocation"; "ino" => inode.number, "error" => %err,
              "allocations" => self.events.len(), "unwind index" => ?self.unwind);

        let mut unlinked = true;
        if let Some(unwind) = self.unwind {
            self.settle(alloc, cache, unwind);
            unlinked = match self.unlink(fs, cache, inode, unwind) {
                Ok(()) => true,
                Err(err) => {
                    crit!(self.log, "failed to unlink new blocks, leaking them"; "ino" => inode.number,
                          "unwind index" => unwind, "error" => %err);
                    false
                },
            };

            // The blocks below the link are gone, so are their buffers.
            for level in unwind + 1..=self.plan.depth() {
                if let Some(blkno) = self.chain[level] {
                    cache.invalidate(blkno);
                }
            }
        }

        // Free the blocks, in the order they were allocated.
        let mut freed = 0;
        for event in &self.events {
            match *event {
                Event::IndirectBlock { blkno, .. } | Event::DataBlock { blkno, .. }
                    if !unlinked => {
                    crit!(self.log, "leaking block"; "ino" => inode.number, "blkno" => blkno);
                },
                Event::IndirectBlock { lbn, blkno, .. } => {
                    self.discard(cache, lbn, blkno, fs.bsize());
                    alloc.free(blkno, fs.bsize(), inode.number);
                    freed += fs.sectors(fs.bsize());
                },
                Event::DataBlock { lbn, blkno, size } => {
                    // New direct blocks are linked by the inode alone.
                    if self.plan.depth() == 0 && inode.direct(lbn as usize) == blkno {
                        // Zero always fits.
                        let _ = inode.set_direct(lbn as usize, 0);
                    }

                    self.discard(cache, lbn, blkno, size);
                    alloc.free(blkno, size, inode.number);
                    freed += fs.sectors(size);
                },
                Event::FragmentGrow {
                    lbn, blkno, old_size, new_size, old_file_size, ref head
                } => {
                    if let Some(ref head) = *head {
                        self.restore_head(cache, lbn, blkno, head);
                    }

                    let tail = blkno + fs.numfrags(old_size);
                    self.discard(cache, lbn, tail, new_size - old_size);
                    alloc.free(tail, new_size - old_size, inode.number);
                    freed += fs.sectors(new_size - old_size);
                    // The pointer stays on the grown run, whose head holds the old content.
                    inode.size = old_file_size;
                },
            }
        }

        if freed > 0 {
            debug!(self.log, "gave back space"; "ino" => inode.number, "sectors" => freed);
            inode.blocks = inode.blocks.saturating_sub(freed);
            quota.restore(inode.number, freed);
        }
        inode.touch();

        err
    }

    /// Put the indirect blocks from the deepest level up to the unwind level into a known state.
    ///
    /// Pending writes are forced to disk, together with the summary block of their group, so that
    /// the unlink works on what is on disk. Other cached copies are thrown away.
    fn settle<A: Allocator, C: BufferCache>(&self, alloc: &A, cache: &mut C, unwind: usize) {
        for level in (unwind.max(1)..=self.plan.depth()).rev() {
            let blkno = match self.chain[level] {
                Some(blkno) => blkno,
                None => continue,
            };

            if !cache.is_delayed(blkno) {
                cache.invalidate(blkno);
                continue;
            }

            if let Err(err) = cache.flush(blkno) {
                warn!(self.log, "failed to flush indirect block"; "blkno" => blkno,
                      "level" => level, "error" => %err);
            }
            let summary = alloc.summary_block(blkno);
            if cache.is_delayed(summary) {
                if let Err(err) = cache.flush(summary) {
                    warn!(self.log, "failed to flush summary block"; "blkno" => summary,
                          "error" => %err);
                }
            }
        }
    }

    /// Clear the pointer of the first new link.
    fn unlink<P, C>(&self, fs: &Geometry, cache: &mut C, inode: &mut Inode<P>, unwind: usize)
        -> Result<(), Error>
    where P: BlockPointer,
          C: BufferCache {
        let step = self.plan.step(unwind);
        if unwind == 0 {
            return inode.set_indirect(step.off, 0);
        }

        let blkno = match self.chain[unwind] {
            Some(blkno) => blkno,
            // Links are only made in blocks which were descended into.
            None => unreachable!("link at level {} without its indirect block", unwind),
        };
        let mut buf = cache.read_block(step.lbn, blkno, fs.bsize())?;
        P::store(buf.data_mut(), step.off, P::default(), fs.endian());
        cache.write(buf, WriteMode::Sync)?;

        debug!(self.log, "unlinked new blocks"; "ino" => inode.number, "blkno" => blkno,
               "slot" => step.off);

        Ok(())
    }

    /// Write the old content of a moved fragment run to its new location.
    fn restore_head<C: BufferCache>(&self, cache: &mut C, lbn: i64, blkno: u64, head: &[u8]) {
        let buf = Buffer::new(lbn, blkno, head.to_vec());
        match cache.write(buf, WriteMode::Sync) {
            Ok(()) => debug!(self.log, "restored moved fragment"; "lbn" => lbn, "blkno" => blkno),
            Err(err) => crit!(self.log, "failed to restore moved fragment, content lost";
                              "lbn" => lbn, "blkno" => blkno, "error" => %err),
        }
    }

    /// Throw away a block about to be freed.
    #[cfg(not(feature = "security"))]
    fn discard<C: BufferCache>(&self, cache: &mut C, _: i64, blkno: u64, _: usize) {
        cache.invalidate(blkno);
    }

    /// Throw away a block about to be freed, overwriting it with zeros.
    #[cfg(feature = "security")]
    fn discard<C: BufferCache>(&self, cache: &mut C, lbn: i64, blkno: u64, size: usize) {
        if let Err(err) = cache.write(Buffer::new(lbn, blkno, vec![0; size]), WriteMode::Sync) {
            warn!(self.log, "failed to wipe freed block"; "blkno" => blkno, "error" => %err);
        }
        cache.invalidate(blkno);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.events.is_empty() {
            crit!(self.log, "allocation transaction dropped unfinished, space leaked";
                  "allocations" => self.events.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Options;
    use crate::io::alloc::MemAllocator;
    use crate::io::cache::Cached;
    use crate::io::disk::MemDisk;
    use crate::io::quota::MemQuota;
    use crate::planner;
    use crate::pointer::Format;
    use crate::Flags;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn only_the_first_link_counts() {
        let fs = Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap();
        let mut tx = Transaction::new(&log(), planner::plan(&fs, 2000).unwrap());
        assert_eq!(tx.unwind_index(), None);
        tx.link(1);
        tx.link(2);
        assert_eq!(tx.unwind_index(), Some(1));
        tx.commit();
    }

    #[test]
    fn abort_gives_back_space() {
        let fs = Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap();
        let mut alloc = MemAllocator::new(fs, 4, 2048).unwrap();
        let mut cache = Cached::new(MemDisk::new(512, 4 * 2048));
        let mut quota = MemQuota::default();
        let mut inode = Inode::<u32>::new(2);
        let baseline = alloc.used_fragments();

        let mut tx = Transaction::new(&log(), planner::plan(&fs, 3).unwrap());
        let blkno = alloc.alloc(2, 3, 0, 2048, Flags::default()).unwrap();
        quota.charge(2, 4).unwrap();
        inode.blocks += 4;
        tx.record(Event::DataBlock { lbn: 3, blkno: blkno, size: 2048 });
        assert_eq!(tx.events(), &[Event::DataBlock { lbn: 3, blkno: blkno, size: 2048 }][..]);

        let err = tx.abort(&fs, &mut alloc, &mut cache, &mut quota, &mut inode, Error::OutOfSpace);
        assert_eq!(err, Error::OutOfSpace);
        assert_eq!(alloc.used_fragments(), baseline);
        assert_eq!(inode.blocks, 0);
        assert_eq!(quota.usage(2), 0);
    }

    #[test]
    fn abort_undoes_fragment_growth() {
        let fs = Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap();
        let mut alloc = MemAllocator::new(fs, 4, 2048).unwrap();
        let mut cache = Cached::new(MemDisk::new(512, 4 * 2048));
        let mut quota = MemQuota::default();
        let mut inode = Inode::<u32>::new(2);

        let blkno = alloc.alloc(2, 0, 0, 1024, Flags::default()).unwrap();
        inode.set_direct(0, blkno).unwrap();
        inode.size = 1000;
        inode.blocks = 2;
        quota.charge(2, 2).unwrap();
        let before = alloc.used_fragments();

        let mut tx = Transaction::new(&log(), planner::plan(&fs, 1).unwrap());
        assert_eq!(alloc.grow_fragment(2, 0, blkno, 0, 1024, 4096), Ok(blkno));
        quota.charge(2, 6).unwrap();
        inode.blocks += 6;
        inode.size = 4096;
        tx.record(Event::FragmentGrow {
            lbn: 0,
            blkno: blkno,
            old_size: 1024,
            new_size: 4096,
            old_file_size: 1000,
            head: None,
        });

        tx.abort(&fs, &mut alloc, &mut cache, &mut quota, &mut inode, Error::OutOfSpace);
        assert_eq!(alloc.used_fragments(), before);
        assert!(alloc.is_allocated(blkno + 1));
        assert!(!alloc.is_allocated(blkno + 2));
        assert_eq!(inode.size, 1000);
        assert_eq!(inode.blocks, 2);
        assert_eq!(quota.usage(2), 2);
        assert_eq!(inode.direct(0), blkno);
    }
}
