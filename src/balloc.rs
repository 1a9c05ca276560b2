//! The block allocator.
//!
//! This is the center point of the crate: it maps logical blocks of a file to disk blocks,
//! allocating blocks, fragments, and indirect blocks on demand.

use std::cmp;
use std::marker::PhantomData;

use slog::Logger;

use crate::geometry::{Geometry, NDADDR};
use crate::inode::Inode;
use crate::io::alloc::Allocator;
use crate::io::cache::{Buffer, BufferCache, WriteMode};
use crate::io::quota::Quota;
use crate::io::snapshot::{CowHook, NoSnapshots};
use crate::planner;
use crate::pointer::BlockPointer;
use crate::pref::blkpref;
use crate::transaction::{Event, Transaction};
use crate::Error;

/// Evaluate a `Result`, releasing buffer `$buf` before returning on error.
macro_rules! try_release {
    ($this:expr, $buf:ident, $res:expr) => {
        match $res {
            Ok(x) => x,
            Err(err) => {
                $this.cache.release($buf);
                return Err(err.into());
            },
        }
    };
}

/// Allocation flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Only build the indirect blocks, and return the lowest of them instead of a data block.
    pub metadata_only: bool,
    /// Zero the buffer of newly allocated blocks, and read the buffer of existing indirect-mapped
    /// blocks.
    pub clear: bool,
    /// Write modified metadata synchronously.
    pub sync: bool,
    /// Return a buffer of the block.
    pub buffer: bool,
}

impl Flags {
    /// Set `metadata_only`.
    pub fn metadata_only(mut self) -> Flags {
        self.metadata_only = true;
        self
    }

    /// Set `clear`.
    pub fn clear(mut self) -> Flags {
        self.clear = true;
        self
    }

    /// Set `sync`.
    pub fn sync(mut self) -> Flags {
        self.sync = true;
        self
    }

    /// Set `buffer`.
    pub fn buffer(mut self) -> Flags {
        self.buffer = true;
        self
    }

    /// The write mode of updates to existing metadata.
    fn update_mode(self) -> WriteMode {
        if self.sync {
            WriteMode::Sync
        } else {
            WriteMode::Delayed
        }
    }
}

/// A resolved block.
#[derive(Debug)]
pub struct Block {
    /// The logical block number.
    ///
    /// For metadata-only requests, this is the (negative) logical block number of the lowest
    /// indirect block.
    pub lbn: i64,
    /// The disk address.
    pub blkno: u64,
    /// The allocated size in bytes.
    pub size: usize,
    /// The buffer, if requested.
    pub buffer: Option<Buffer>,
}

/// The block allocator of a mounted file system.
///
/// This holds the per-mount state: the geometry and the collaborators. `P` is the on-disk block
/// pointer type, `u32` for UFS1 and `u64` for UFS2.
pub struct Balloc<P, A, C, Q> {
    /// The file system geometry.
    fs: Geometry,
    /// The free-space allocator.
    alloc: A,
    /// The buffer cache.
    cache: C,
    /// The quota subsystem.
    quota: Q,
    /// The snapshot copy-on-write hook.
    cow: Box<dyn CowHook>,
    /// The logger.
    log: Logger,
    _pointer: PhantomData<P>,
}

impl<P, A, C, Q> Balloc<P, A, C, Q>
where P: BlockPointer,
      A: Allocator,
      C: BufferCache,
      Q: Quota {
    /// Set up the block allocator.
    ///
    /// This fails if the pointer type does not match the format of the geometry.
    pub fn new(fs: Geometry, alloc: A, cache: C, quota: Q) -> Result<Balloc<P, A, C, Q>, Error> {
        if fs.format() != P::FORMAT {
            return Err(Error::InvalidGeometry {
                reason: "the pointer width does not match the file system format",
            });
        }

        Ok(Balloc {
            fs: fs,
            alloc: alloc,
            cache: cache,
            quota: quota,
            cow: Box::new(NoSnapshots),
            log: Logger::root(slog::Discard, o!()),
            _pointer: PhantomData,
        })
    }

    /// Log through `log`.
    pub fn with_logger(mut self, log: Logger) -> Balloc<P, A, C, Q> {
        self.log = log;
        self
    }

    /// Run `hook` on indirect blocks before modifying them, and on every buffer handed out.
    pub fn with_snapshot<H: CowHook + 'static>(mut self, hook: H) -> Balloc<P, A, C, Q> {
        self.cow = Box::new(hook);
        self
    }

    /// The file system geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.fs
    }

    /// The free-space allocator.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// The free-space allocator, mutably.
    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.alloc
    }

    /// The buffer cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// The buffer cache, mutably.
    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    /// The quota subsystem.
    pub fn quota(&self) -> &Q {
        &self.quota
    }

    /// The quota subsystem, mutably.
    pub fn quota_mut(&mut self) -> &mut Q {
        &mut self.quota
    }

    /// Resolve logical block `lbn` of `inode`, allocating it if necessary.
    ///
    /// `size` is the number of bytes of the block which are going to be used. Direct blocks at the
    /// end of the file are allocated as fragments just large enough for that; if the file grows
    /// past its last block, a trailing fragment is first grown into a full block.
    ///
    /// A returned buffer has been through the copy-on-write hook. On failure, everything allocated
    /// by the call is given back and the error is returned.
    ///
    /// The size of the inode must cover every block allocated before, since it determines the
    /// allocated size of the trailing fragment. The caller extends it after writing.
    ///
    /// # Panics
    ///
    /// This panics if `size` exceeds the block size, or on a metadata-only request for a direct
    /// block.
    pub fn resolve_or_allocate(&mut self, inode: &mut Inode<P>, lbn: i64, size: usize,
                               flags: Flags) -> Result<Block, Error> {
        assert!(size <= self.fs.bsize(), "balloc: block too big ({} bytes)", size);

        if lbn < 0 {
            return Err(Error::FileTooBig { lbn: lbn });
        }
        // Plan before touching anything, so out-of-range blocks fail without side effects.
        let plan = planner::plan(&self.fs, lbn)?;
        assert!(!flags.metadata_only || plan.depth() > 0,
                "balloc: metadata-only request for direct block {}", lbn);

        trace!(self.log, "resolving block"; "ino" => inode.number, "lbn" => lbn, "size" => size,
               "depth" => plan.depth());

        let mut tx = Transaction::new(&self.log, plan);
        let res = self.resolve(inode, lbn, size, flags, &mut tx)
            .and_then(|block| self.hand_out(block));
        match res {
            Ok(block) => {
                tx.commit();
                Ok(block)
            },
            Err(err) => Err(tx.abort(&self.fs, &mut self.alloc, &mut self.cache, &mut self.quota,
                                     inode, err)),
        }
    }

    /// Resolve `len` bytes starting at byte `offset`, allocating if necessary.
    ///
    /// The range must lie within one block.
    pub fn balloc(&mut self, inode: &mut Inode<P>, offset: u64, len: usize, flags: Flags)
        -> Result<Block, Error> {
        let lbn = self.fs.lblkno(offset);
        let size = self.fs.blkoff(offset) + len;
        self.resolve_or_allocate(inode, lbn, size, flags)
    }

    /// Allocate every block touched by `len` bytes starting at byte `offset`.
    ///
    /// The blocks are allocated one at a time, and the file size is extended after each of them,
    /// so only the last block of the range can end up a fragment. On failure, the blocks allocated
    /// so far stay allocated, and the file size covers them.
    pub fn allocate_range(&mut self, inode: &mut Inode<P>, offset: u64, len: u64, flags: Flags)
        -> Result<(), Error> {
        debug!(self.log, "allocating range"; "ino" => inode.number, "offset" => offset,
               "len" => len);

        let flags = Flags {
            metadata_only: false,
            buffer: false,
            ..flags
        };
        let bsize = self.fs.bsize() as u64;

        let mut offset = offset;
        let mut len = len;
        while len > 0 {
            let delta = cmp::min(bsize - self.fs.blkoff(offset) as u64, len);
            self.balloc(inode, offset, delta as usize, flags)?;

            // The trailing fragment rule needs an up-to-date end of file.
            if inode.size < offset + delta {
                inode.size = offset + delta;
                inode.touch();
            }

            offset += delta;
            len -= delta;
        }

        Ok(())
    }

    /// Look up the disk address of logical block `lbn` without allocating.
    ///
    /// `None` means a hole.
    pub fn lookup(&mut self, inode: &Inode<P>, lbn: i64) -> Result<Option<u64>, Error> {
        if lbn < 0 {
            return Err(Error::FileTooBig { lbn: lbn });
        }
        let plan = planner::plan(&self.fs, lbn)?;

        let mut nb = if plan.depth() == 0 {
            inode.direct(lbn as usize)
        } else {
            inode.indirect(plan.step(0).off)
        };

        for step in plan.indirs().iter().skip(1) {
            if nb == 0 {
                break;
            }

            let buf = self.cache.read_block(step.lbn, nb, self.fs.bsize())?;
            nb = P::load(buf.data(), step.off, self.fs.endian());
            self.cache.release(buf);
        }

        Ok(if nb == 0 { None } else { Some(nb) })
    }

    /// Resolve a block inside a transaction.
    fn resolve(&mut self, inode: &mut Inode<P>, lbn: i64, size: usize, flags: Flags,
               tx: &mut Transaction) -> Result<Block, Error> {
        // If the file is about to grow past its last block, and that block is a fragment, it has
        // to become a full block first.
        let lastlbn = self.fs.lblkno(inode.size);
        if lastlbn < NDADDR as i64 && lastlbn < lbn {
            self.promote(inode, lastlbn, flags, tx)?;
        }

        if tx.plan().depth() == 0 {
            self.resolve_direct(inode, lbn, size, flags, tx)
        } else {
            self.resolve_indirect(inode, lbn, flags, tx)
        }
    }

    /// Run the copy-on-write hook on the buffer of `block`, if any, before the caller gets it.
    fn hand_out(&mut self, mut block: Block) -> Result<Block, Error> {
        if let Some(mut buf) = block.buffer.take() {
            try_release!(self, buf, self.cow.copy_on_write(&mut buf));
            block.buffer = Some(buf);
        }

        Ok(block)
    }

    /// Grow the trailing fragment at `nb` into a full block.
    fn promote(&mut self, inode: &mut Inode<P>, nb: i64, flags: Flags, tx: &mut Transaction)
        -> Result<(), Error> {
        let osize = self.fs.blksize(inode.size, nb);
        if osize == 0 || osize >= self.fs.bsize() || inode.direct(nb as usize) == 0 {
            return Ok(());
        }

        debug!(self.log, "promoting trailing fragment"; "ino" => inode.number, "lbn" => nb,
               "size" => osize);

        let pref = self.direct_pref(inode, nb);
        let buf = self.grow_fragment(inode, nb, pref, osize, self.fs.bsize(), tx)?;
        inode.size = self.fs.lblktosize(nb + 1);
        inode.touch();

        let mode = if flags.sync { WriteMode::Sync } else { WriteMode::Async };
        self.cache.write(buf, mode)?;

        Ok(())
    }

    /// Resolve a direct block.
    fn resolve_direct(&mut self, inode: &mut Inode<P>, lbn: i64, size: usize, flags: Flags,
                      tx: &mut Transaction) -> Result<Block, Error> {
        let bsize = self.fs.bsize();
        let n = lbn as usize;
        let nb = inode.direct(n);

        // The block is already allocated, and is a full block.
        if nb != 0 && inode.size >= self.fs.lblktosize(lbn + 1) {
            let buffer = if flags.buffer {
                Some(self.cache.read_block(lbn, nb, bsize)?)
            } else {
                None
            };

            return Ok(Block {
                lbn: lbn,
                blkno: nb,
                size: bsize,
                buffer: buffer,
            });
        }

        // The block is a trailing fragment. It might have to grow.
        if nb != 0 {
            let osize = self.fs.fragroundup(self.fs.blkoff(inode.size));
            let nsize = self.fs.fragroundup(size);

            if nsize <= osize {
                trace!(self.log, "fragment is large enough"; "lbn" => lbn, "size" => osize);
                let buffer = if flags.buffer {
                    Some(self.cache.read_block(lbn, nb, osize)?)
                } else {
                    None
                };

                return Ok(Block {
                    lbn: lbn,
                    blkno: nb,
                    size: osize,
                    buffer: buffer,
                });
            }

            let pref = self.direct_pref(inode, lbn);
            let buf = self.grow_fragment(inode, lbn, pref, osize, nsize, tx)?;
            let blkno = buf.blkno();
            let buffer = if flags.buffer {
                Some(buf)
            } else {
                // The old content has to reach the new location.
                self.cache.write(buf, WriteMode::Delayed)?;
                None
            };

            return Ok(Block {
                lbn: lbn,
                blkno: blkno,
                size: nsize,
                buffer: buffer,
            });
        }

        // The block is not allocated. A block past the end of the file gets just enough fragments.
        let nsize = if inode.size < self.fs.lblktosize(lbn + 1) {
            self.fs.fragroundup(cmp::max(size, 1))
        } else {
            bsize
        };

        let pref = self.direct_pref(inode, lbn);
        let ptr = self.alloc_block(inode, lbn, pref, nsize, flags, tx, None)?;
        let buffer = if flags.buffer {
            Some(self.cache.get_block(lbn, ptr.blkno(), nsize, flags.clear)?)
        } else {
            None
        };
        inode.set_direct(n, ptr.blkno())?;

        Ok(Block {
            lbn: lbn,
            blkno: ptr.blkno(),
            size: nsize,
            buffer: buffer,
        })
    }

    /// Resolve a block through the indirect blocks.
    fn resolve_indirect(&mut self, inode: &mut Inode<P>, lbn: i64, flags: Flags,
                        tx: &mut Transaction) -> Result<Block, Error> {
        let plan = *tx.plan();
        let num = plan.depth();
        let bsize = self.fs.bsize();
        let endian = self.fs.endian();
        let meta = Flags {
            metadata_only: true,
            ..flags
        };
        let mut pref = 0;

        // Fetch the first indirect block, allocating if necessary.
        let top = plan.step(0).off;
        let mut nb = inode.indirect(top);
        if nb == 0 {
            pref = blkpref(&self.fs, &self.alloc, inode.number, lbn, 0, 0);
            nb = self.alloc_block(inode, plan.step(1).lbn, pref, bsize, meta, tx, Some(1))?.blkno();
            tx.descend(1, nb);

            // Write synchronously, so the inode never points to garbage.
            let buf = self.cache.get_block(plan.step(1).lbn, nb, bsize, true)?;
            self.cache.write(buf, WriteMode::Sync)?;

            tx.link(0);
            inode.set_indirect(top, nb)?;
        } else {
            tx.descend(1, nb);
        }

        // Fetch through the indirect blocks, allocating as necessary.
        let mut i = 1;
        let mut buf;
        loop {
            buf = self.cache.read_block(plan.step(i).lbn, nb, bsize)?;
            let slot = plan.step(i).off;
            nb = P::load(buf.data(), slot, endian);
            if i == num {
                break;
            }

            i += 1;
            if nb != 0 {
                self.cache.release(buf);
                tx.descend(i, nb);
                continue;
            }

            try_release!(self, buf, self.cow.copy_on_write(&mut buf));

            if inode.snapshot && i == num && slot > 0 {
                // Keep the lowest indirect blocks of snapshots together.
                let prev = P::load(buf.data(), slot - 1, endian);
                pref = blkpref(&self.fs, &self.alloc, inode.number, lbn, slot, prev);
            } else if pref == 0 {
                pref = blkpref(&self.fs, &self.alloc, inode.number, lbn, 0, 0);
            }

            let ptr = try_release!(self, buf,
                                   self.alloc_block(inode, plan.step(i).lbn, pref, bsize, meta, tx,
                                                    Some(i)));
            nb = ptr.blkno();
            tx.descend(i, nb);

            // Write synchronously, so the parent never points to garbage.
            let child = try_release!(self, buf,
                                     self.cache.get_block(plan.step(i).lbn, nb, bsize, true));
            try_release!(self, buf, self.cache.write(child, WriteMode::Sync));

            P::store(buf.data_mut(), slot, ptr, endian);
            tx.link(i - 1);
            self.cache.write(buf, flags.update_mode())?;
        }

        // Metadata-only requests want the lowest indirect block.
        if flags.metadata_only {
            return Ok(Block {
                lbn: plan.step(num).lbn,
                blkno: buf.blkno(),
                size: bsize,
                buffer: Some(buf),
            });
        }

        // Get the data block, allocating if necessary.
        let slot = plan.step(num).off;
        if nb == 0 {
            try_release!(self, buf, self.cow.copy_on_write(&mut buf));

            let prev = if slot > 0 { P::load(buf.data(), slot - 1, endian) } else { 0 };
            let pref = blkpref(&self.fs, &self.alloc, inode.number, lbn, slot, prev);
            let ptr = try_release!(self, buf,
                                   self.alloc_block(inode, lbn, pref, bsize, flags, tx, None));

            let buffer = if flags.buffer {
                Some(try_release!(self, buf,
                                  self.cache.get_block(lbn, ptr.blkno(), bsize, flags.clear)))
            } else {
                None
            };

            P::store(buf.data_mut(), slot, ptr, endian);
            tx.link(num);
            self.cache.write(buf, flags.update_mode())?;

            return Ok(Block {
                lbn: lbn,
                blkno: ptr.blkno(),
                size: bsize,
                buffer: buffer,
            });
        }

        self.cache.release(buf);
        let buffer = if !flags.buffer {
            None
        } else if flags.clear {
            Some(self.cache.read_block(lbn, nb, bsize)?)
        } else {
            Some(self.cache.get_block(lbn, nb, bsize, false)?)
        };

        Ok(Block {
            lbn: lbn,
            blkno: nb,
            size: bsize,
            buffer: buffer,
        })
    }

    /// The preferred address of direct block `lbn`.
    fn direct_pref(&self, inode: &Inode<P>, lbn: i64) -> u64 {
        let n = lbn as usize;
        let prev = if n > 0 { inode.direct(n - 1) } else { 0 };
        blkpref(&self.fs, &self.alloc, inode.number, lbn, n, prev)
    }

    /// Allocate a block or fragment run, charging it to the inode and recording it.
    ///
    /// `level` is the level of a new indirect block, or `None` for data. The address is checked to
    /// fit in a block pointer.
    fn alloc_block(&mut self, inode: &mut Inode<P>, lbn: i64, pref: u64, size: usize,
                   flags: Flags, tx: &mut Transaction, level: Option<usize>) -> Result<P, Error> {
        let sectors = self.fs.sectors(size);
        self.quota.charge(inode.number, sectors)?;

        let blkno = match self.alloc.alloc(inode.number, lbn, pref, size, flags) {
            Ok(blkno) => blkno,
            Err(err) => {
                self.quota.restore(inode.number, sectors);
                return Err(err);
            },
        };

        inode.blocks += sectors;
        inode.touch();
        tx.record(match level {
            Some(level) => Event::IndirectBlock {
                level: level,
                lbn: lbn,
                blkno: blkno,
            },
            None => Event::DataBlock {
                lbn: lbn,
                blkno: blkno,
                size: size,
            },
        });

        P::from_blkno(blkno).ok_or(Error::AddressOverflow { blkno: blkno })
    }

    /// Grow the fragment run of direct block `lbn` from `osize` to `nsize` bytes.
    ///
    /// The returned buffer holds the old content, zero-filled to the new size, at the new address.
    /// The inode points to the grown run.
    fn grow_fragment(&mut self, inode: &mut Inode<P>, lbn: i64, pref: u64, osize: usize,
                     nsize: usize, tx: &mut Transaction) -> Result<Buffer, Error> {
        let n = lbn as usize;
        let old = inode.direct(n);
        let mut buf = self.cache.read_block(lbn, old, osize)?;

        let sectors = self.fs.sectors(nsize - osize);
        try_release!(self, buf, self.quota.charge(inode.number, sectors));

        let blkno = match self.alloc.grow_fragment(inode.number, lbn, old, pref, osize, nsize) {
            Ok(blkno) => blkno,
            Err(err) => {
                self.quota.restore(inode.number, sectors);
                self.cache.release(buf);
                return Err(err);
            },
        };

        inode.blocks += sectors;
        inode.touch();
        tx.record(Event::FragmentGrow {
            lbn: lbn,
            blkno: blkno,
            old_size: osize,
            new_size: nsize,
            old_file_size: inode.size,
            head: if blkno != old { Some(buf.data().to_vec()) } else { None },
        });

        if blkno != old {
            trace!(self.log, "fragment moved"; "lbn" => lbn, "from" => old, "to" => blkno);
            self.cache.invalidate(old);
            buf.relocate(blkno);
        }
        buf.resize(nsize);
        try_release!(self, buf, inode.set_direct(n, blkno));

        Ok(buf)
    }
}
