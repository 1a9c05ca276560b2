//! The buffer cache.
//!
//! Block I/O of the allocator goes through a cache of block-sized buffers. The cache decides when
//! data reaches the disk: a buffer can be written synchronously, handed to the disk without waiting
//! (asynchronously), or left dirty in memory to be written later (delayed).

use std::collections::HashMap;
use std::mem;

use slog::Logger;

use crate::io::disk::{self, Disk};

/// An in-memory copy of a block or fragment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    /// The logical block this buffer holds, negative for indirect blocks.
    lbn: i64,
    /// The disk address of the data.
    blkno: u64,
    /// The data.
    data: Vec<u8>,
}

impl Buffer {
    /// Create a buffer from its content.
    pub fn new(lbn: i64, blkno: u64, data: Vec<u8>) -> Buffer {
        Buffer {
            lbn: lbn,
            blkno: blkno,
            data: data,
        }
    }

    /// The logical block number.
    pub fn lbn(&self) -> i64 {
        self.lbn
    }

    /// The disk address.
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    /// The size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Is the buffer empty?
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The content of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The content of the buffer, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Point the buffer at another disk address.
    ///
    /// This happens when the block behind it is moved by the allocator.
    pub fn relocate(&mut self, blkno: u64) {
        self.blkno = blkno;
    }

    /// Change the size of the buffer, zero-filling any new tail.
    pub fn resize(&mut self, size: usize) {
        self.data.resize(size, 0);
    }
}

/// How a buffer is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write the buffer and wait for the transfer to complete.
    Sync,
    /// Start the transfer without waiting for it.
    Async,
    /// Mark the cached buffer dirty and write it at some later point.
    Delayed,
}

/// A block buffer cache.
pub trait BufferCache {
    /// Get a buffer for a block without necessarily reading it.
    ///
    /// With `zero`, the buffer is zero-filled. Otherwise it holds the cached content, or whatever
    /// happens to be in memory if the block is not cached.
    fn get_block(&mut self, lbn: i64, blkno: u64, size: usize, zero: bool)
        -> Result<Buffer, disk::Error>;
    /// Get a buffer holding the current content of a block.
    fn read_block(&mut self, lbn: i64, blkno: u64, size: usize) -> Result<Buffer, disk::Error>;
    /// Write a buffer back.
    fn write(&mut self, buf: Buffer, mode: WriteMode) -> Result<(), disk::Error>;
    /// Give a buffer back without writing it.
    fn release(&mut self, buf: Buffer);
    /// Does the block at `blkno` have a delayed write pending?
    fn is_delayed(&self, blkno: u64) -> bool;
    /// Force the pending delayed write of `blkno` (if any) to disk.
    fn flush(&mut self, blkno: u64) -> Result<(), disk::Error>;
    /// Throw away the cached copy of `blkno`, including any pending write.
    fn invalidate(&mut self, blkno: u64);
}

/// A cache block.
#[derive(Debug, Clone)]
struct Block {
    /// The logical block last written through this cache block.
    lbn: i64,
    /// The data of the block.
    ///
    /// This shall reflect what is on the disk unless the block is marked delayed.
    data: Vec<u8>,
    /// Does the data in memory differ from the data on the disk?
    ///
    /// This is called _the dirty flag_. Whenever a buffer is written with `WriteMode::Delayed`,
    /// the flag is set, so that the write reaches the disk on the next flush.
    delayed: bool,
}

/// A record of a write accepted by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Write {
    /// The logical block of the buffer.
    pub lbn: i64,
    /// The disk address of the buffer.
    pub blkno: u64,
    /// How the buffer was written. Flushes of delayed writes are recorded as `Sync`.
    pub mode: WriteMode,
}

/// A cached disk.
///
/// This wrapper manages caching of the disk. Every accepted write is appended to a journal, which
/// allows inspecting the order in which blocks were made durable.
pub struct Cached<D> {
    /// The inner disk.
    disk: D,
    /// The disk-address-to-cache-block map.
    blocks: HashMap<u64, Block>,
    /// The writes in the order they were accepted.
    journal: Vec<Write>,
    /// The logger.
    log: Logger,
}

impl<D: Disk> Cached<D> {
    /// Create a cache from a backing disk.
    pub fn new(disk: D) -> Cached<D> {
        Cached {
            disk: disk,
            blocks: HashMap::new(),
            journal: Vec::new(),
            log: Logger::root(slog::Discard, o!()),
        }
    }

    /// Log through `log`.
    pub fn with_logger(mut self, log: Logger) -> Cached<D> {
        self.log = log;
        self
    }

    /// The inner disk.
    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// The inner disk, mutably.
    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.disk
    }

    /// The writes accepted so far.
    pub fn journal(&self) -> &[Write] {
        &self.journal
    }

    /// Empty the journal, returning its content.
    pub fn take_journal(&mut self) -> Vec<Write> {
        mem::replace(&mut self.journal, Vec::new())
    }

    /// Flush every delayed write and drop all cache blocks.
    ///
    /// Afterwards every read goes to the disk.
    pub fn evict_all(&mut self) -> Result<(), disk::Error> {
        info!(self.log, "evicting the cache"; "blocks" => self.blocks.len());

        let mut delayed: Vec<u64> = self.blocks.iter()
            .filter(|&(_, block)| block.delayed)
            .map(|(&blkno, _)| blkno)
            .collect();
        // Flush in address order to keep the journal deterministic.
        delayed.sort();
        for blkno in delayed {
            self.flush(blkno)?;
        }

        self.blocks.clear();

        Ok(())
    }

    /// Write a buffer to the disk.
    ///
    /// If the transfer fails, the cache block (and any pending write of it) is left as it was.
    fn write_through(&mut self, buf: &Buffer) -> Result<(), disk::Error> {
        if let Err(err) = self.disk.write(buf.blkno, &buf.data) {
            warn!(self.log, "write failed"; "blkno" => buf.blkno, "error" => %err);
            return Err(err);
        }

        Ok(())
    }
}

impl<D: Disk> BufferCache for Cached<D> {
    fn get_block(&mut self, lbn: i64, blkno: u64, size: usize, zero: bool)
        -> Result<Buffer, disk::Error> {
        trace!(self.log, "getting block"; "lbn" => lbn, "blkno" => blkno, "size" => size);

        let data = if zero {
            vec![0; size]
        } else if let Some(block) = self.blocks.get(&blkno) {
            let mut data = block.data.clone();
            data.resize(size, 0);
            data
        } else {
            // Whatever the memory held before. Callers asking for no I/O must not rely on it.
            vec![0xA5; size]
        };

        Ok(Buffer::new(lbn, blkno, data))
    }

    fn read_block(&mut self, lbn: i64, blkno: u64, size: usize) -> Result<Buffer, disk::Error> {
        debug!(self.log, "reading block"; "lbn" => lbn, "blkno" => blkno, "size" => size);

        // Check if the block is already available in the cache.
        if let Some(block) = self.blocks.get(&blkno) {
            if block.data.len() >= size {
                trace!(self.log, "cache hit; reading from cache"; "blkno" => blkno);
                return Ok(Buffer::new(lbn, blkno, block.data[..size].to_vec()));
            }
        }

        trace!(self.log, "cache miss; reading from disk"; "blkno" => blkno);
        let mut data = vec![0; size];
        self.disk.read(blkno, &mut data)?;

        // Cached content of a shorter run is newer than the disk.
        let delayed = match self.blocks.get(&blkno) {
            Some(block) => {
                data[..block.data.len()].copy_from_slice(&block.data);
                block.delayed
            },
            None => false,
        };

        self.blocks.insert(blkno, Block {
            lbn: lbn,
            data: data.clone(),
            delayed: delayed,
        });

        Ok(Buffer::new(lbn, blkno, data))
    }

    fn write(&mut self, buf: Buffer, mode: WriteMode) -> Result<(), disk::Error> {
        debug!(self.log, "writing block"; "lbn" => buf.lbn, "blkno" => buf.blkno,
               "mode" => ?mode);

        if mode != WriteMode::Delayed {
            self.write_through(&buf)?;
        }

        self.journal.push(Write {
            lbn: buf.lbn,
            blkno: buf.blkno,
            mode: mode,
        });
        self.blocks.insert(buf.blkno, Block {
            lbn: buf.lbn,
            data: buf.data,
            delayed: mode == WriteMode::Delayed,
        });

        Ok(())
    }

    fn release(&mut self, buf: Buffer) {
        trace!(self.log, "releasing block"; "lbn" => buf.lbn, "blkno" => buf.blkno);
    }

    fn is_delayed(&self, blkno: u64) -> bool {
        self.blocks.get(&blkno).map_or(false, |block| block.delayed)
    }

    fn flush(&mut self, blkno: u64) -> Result<(), disk::Error> {
        let (lbn, data) = match self.blocks.get(&blkno) {
            Some(block) if block.delayed => (block.lbn, block.data.clone()),
            _ => return Ok(()),
        };

        debug!(self.log, "flushing delayed write"; "lbn" => lbn, "blkno" => blkno);

        // A failed flush leaves the write pending.
        self.disk.write(blkno, &data)?;
        if let Some(block) = self.blocks.get_mut(&blkno) {
            block.delayed = false;
        }
        self.journal.push(Write {
            lbn: lbn,
            blkno: blkno,
            mode: WriteMode::Sync,
        });

        Ok(())
    }

    fn invalidate(&mut self, blkno: u64) {
        if let Some(block) = self.blocks.remove(&blkno) {
            debug!(self.log, "invalidating block"; "lbn" => block.lbn, "blkno" => blkno,
                   "delayed" => block.delayed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::disk::MemDisk;

    fn cache() -> Cached<MemDisk> {
        Cached::new(MemDisk::new(512, 64))
    }

    #[test]
    fn delayed_writes_stay_in_memory() {
        let mut cache = cache();
        cache.write(Buffer::new(0, 8, vec![3; 1024]), WriteMode::Delayed).unwrap();

        assert!(cache.is_delayed(8));
        assert_eq!(cache.disk().peek(8, 1024), &[0; 1024][..]);
        assert_eq!(cache.read_block(0, 8, 1024).unwrap().data(), &[3; 1024][..]);

        cache.flush(8).unwrap();
        assert!(!cache.is_delayed(8));
        assert_eq!(cache.disk().peek(8, 1024), &[3; 1024][..]);
        assert_eq!(cache.journal()[1], Write { lbn: 0, blkno: 8, mode: WriteMode::Sync });
    }

    #[test]
    fn invalidate_discards_pending_write() {
        let mut cache = cache();
        cache.write(Buffer::new(-12, 16, vec![9; 4096]), WriteMode::Delayed).unwrap();
        cache.invalidate(16);

        assert!(!cache.is_delayed(16));
        assert_eq!(cache.read_block(-12, 16, 4096).unwrap().data(), &[0; 4096][..]);
    }

    #[test]
    fn get_block() {
        let mut cache = cache();
        assert_eq!(cache.get_block(0, 0, 512, true).unwrap().data(), &[0; 512][..]);
        // Nothing was read from the disk.
        assert_eq!(cache.get_block(0, 0, 512, false).unwrap().data(), &[0xA5; 512][..]);

        cache.write(Buffer::new(0, 0, vec![1; 512]), WriteMode::Async).unwrap();
        assert_eq!(cache.get_block(0, 0, 512, false).unwrap().data(), &[1; 512][..]);
    }

    #[test]
    fn failed_write() {
        let mut cache = cache();
        cache.disk_mut().fail_writes_at(4);

        assert_eq!(cache.write(Buffer::new(0, 4, vec![1; 512]), WriteMode::Sync),
                   Err(disk::Error::Failed { blkno: 4 }));
        assert!(cache.journal().is_empty());

        // A delayed write only fails once it is flushed.
        cache.write(Buffer::new(0, 4, vec![1; 512]), WriteMode::Delayed).unwrap();
        assert_eq!(cache.flush(4), Err(disk::Error::Failed { blkno: 4 }));
        assert!(cache.is_delayed(4));
    }

    #[test]
    fn grown_run_merges_cached_prefix() {
        let mut cache = cache();
        cache.write(Buffer::new(0, 10, vec![2; 512]), WriteMode::Delayed).unwrap();

        let buf = cache.read_block(0, 10, 1024).unwrap();
        assert_eq!(&buf.data()[..512], &[2; 512][..]);
        assert_eq!(&buf.data()[512..], &[0; 512][..]);
    }

    #[test]
    fn evict_all() {
        let mut cache = cache();
        cache.write(Buffer::new(0, 2, vec![5; 512]), WriteMode::Delayed).unwrap();
        cache.evict_all().unwrap();

        assert_eq!(cache.disk().peek(2, 512), &[5; 512][..]);
        cache.disk_mut().fail_reads_at(2);
        assert!(cache.read_block(0, 2, 512).is_err());
    }
}
