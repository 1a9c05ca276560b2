//! Disk I/O
//!
//! This module provides primitives for disk I/O.
//!
//! Disks are addressed in fragments, the smallest allocation unit of the file system. A transfer
//! may span several consecutive fragments (a fragment run or a full block).

use std::collections::HashSet;

/// A fragment address on the disk.
pub type Blkno = u64;

quick_error! {
    /// A disk I/O error.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        /// The read or write exceeded the address space of the disk.
        ///
        /// This is triggered when the fragment read or written to does not exist.
        OutOfBounds { blkno: Blkno } {
            display("disk block {} past end of disk", blkno)
        }
        /// The transfer of fragment `blkno` failed.
        ///
        /// The hardware gave up on the request. No assumption is made about the on-disk content.
        Failed { blkno: Blkno } {
            display("disk block {} failed to transfer", blkno)
        }
    }
}

/// A storage device.
///
/// This trait acts similarly to `std::io::{Read, Write}`, but is designed specifically for disks.
pub trait Disk {
    /// The fragment size of the disk.
    fn fragment_size(&self) -> usize;
    /// The number of fragments on this disk.
    fn number_of_fragments(&self) -> Blkno;

    /// Write data to the disk.
    ///
    /// This writes buffer `buf` starting at fragment `blkno`. The length of `buf` must be a
    /// multiple of the fragment size.
    fn write(&mut self, blkno: Blkno, buf: &[u8]) -> Result<(), Error>;
    /// Read data from the disk.
    ///
    /// This reads into buffer `buf` starting at fragment `blkno`.
    fn read(&mut self, blkno: Blkno, buf: &mut [u8]) -> Result<(), Error>;
}

/// An in-memory disk.
///
/// Besides storing the data, this can be told to fail transfers of particular fragments, so the
/// error paths of the upper layers can be exercised.
#[derive(Debug, Clone)]
pub struct MemDisk {
    /// The fragment size.
    fsize: usize,
    /// The content of the disk.
    data: Vec<u8>,
    /// Fragments whose reads always fail.
    bad_reads: HashSet<Blkno>,
    /// Fragments whose writes always fail.
    bad_writes: HashSet<Blkno>,
    /// Fragments whose next write fails.
    flaky_writes: HashSet<Blkno>,
    /// The number of successful writes so far.
    writes: usize,
}

impl MemDisk {
    /// Create a zeroed disk of `fragments` fragments of `fsize` bytes.
    pub fn new(fsize: usize, fragments: Blkno) -> MemDisk {
        MemDisk {
            fsize: fsize,
            data: vec![0; fsize * fragments as usize],
            bad_reads: HashSet::new(),
            bad_writes: HashSet::new(),
            flaky_writes: HashSet::new(),
            writes: 0,
        }
    }

    /// Make every read touching fragment `blkno` fail.
    pub fn fail_reads_at(&mut self, blkno: Blkno) {
        self.bad_reads.insert(blkno);
    }

    /// Make every write touching fragment `blkno` fail.
    pub fn fail_writes_at(&mut self, blkno: Blkno) {
        self.bad_writes.insert(blkno);
    }

    /// Make the next write touching fragment `blkno` fail.
    pub fn fail_next_write_at(&mut self, blkno: Blkno) {
        self.flaky_writes.insert(blkno);
    }

    /// Forget every injected fault.
    pub fn heal(&mut self) {
        self.bad_reads.clear();
        self.bad_writes.clear();
        self.flaky_writes.clear();
    }

    /// The number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Inspect the raw content of fragment run `blkno` of `len` bytes.
    pub fn peek(&self, blkno: Blkno, len: usize) -> &[u8] {
        let start = blkno as usize * self.fsize;
        &self.data[start..start + len]
    }

    /// Check that the transfer is inside the disk.
    fn check(&self, blkno: Blkno, len: usize) -> Result<std::ops::Range<usize>, Error> {
        let start = blkno as usize * self.fsize;
        if start + len > self.data.len() {
            Err(Error::OutOfBounds { blkno: blkno })
        } else {
            Ok(start..start + len)
        }
    }

    /// The fragments touched by a transfer.
    fn span(&self, blkno: Blkno, len: usize) -> std::ops::Range<Blkno> {
        blkno..blkno + ((len + self.fsize - 1) / self.fsize) as Blkno
    }
}

impl Disk for MemDisk {
    fn fragment_size(&self) -> usize {
        self.fsize
    }

    fn number_of_fragments(&self) -> Blkno {
        (self.data.len() / self.fsize) as Blkno
    }

    fn write(&mut self, blkno: Blkno, buf: &[u8]) -> Result<(), Error> {
        // Check if the fragments are within bounds.
        let range = self.check(blkno, buf.len())?;

        // Consult the injected faults. A one-shot fault is consumed by the attempt.
        for n in self.span(blkno, buf.len()) {
            if self.bad_writes.contains(&n) || self.flaky_writes.remove(&n) {
                return Err(Error::Failed { blkno: n });
            }
        }

        self.data[range].copy_from_slice(buf);
        self.writes += 1;

        Ok(())
    }

    fn read(&mut self, blkno: Blkno, buf: &mut [u8]) -> Result<(), Error> {
        // Check if the fragments are within bounds.
        let range = self.check(blkno, buf.len())?;

        if let Some(n) = self.span(blkno, buf.len()).find(|n| self.bad_reads.contains(n)) {
            return Err(Error::Failed { blkno: n });
        }

        buf.copy_from_slice(&self.data[range]);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write() {
        let mut disk = MemDisk::new(512, 16);
        assert_eq!(disk.fragment_size(), 512);
        assert_eq!(disk.number_of_fragments(), 16);

        disk.write(2, &[7; 1024]).unwrap();
        let mut buf = [0; 1536];
        disk.read(1, &mut buf).unwrap();
        assert_eq!(&buf[..512], &[0; 512][..]);
        assert_eq!(&buf[512..], &[7; 1024][..]);
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    fn out_of_bounds() {
        let mut disk = MemDisk::new(512, 4);
        assert_eq!(disk.write(3, &[0; 1024]), Err(Error::OutOfBounds { blkno: 3 }));
        assert_eq!(disk.read(4, &mut [0; 512]), Err(Error::OutOfBounds { blkno: 4 }));
    }

    #[test]
    fn injected_faults() {
        let mut disk = MemDisk::new(512, 16);

        disk.fail_next_write_at(5);
        assert_eq!(disk.write(4, &[1; 1024]), Err(Error::Failed { blkno: 5 }));
        // The fault was consumed.
        disk.write(4, &[1; 1024]).unwrap();

        disk.fail_reads_at(9);
        assert_eq!(disk.read(8, &mut [0; 2048]), Err(Error::Failed { blkno: 9 }));
        disk.read(10, &mut [0; 512]).unwrap();

        disk.heal();
        disk.read(8, &mut [0; 2048]).unwrap();
    }
}
