// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical memory shared between the guest and host endpoints.
//!
//! Memory is an arena of 4KB pages, addressed by guest page number (GPN).
//! Every access goes through 32-bit atomics, so both endpoints can touch the
//! same page concurrently without `unsafe`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use vmbus_ring::Page;
use vmbus_ring::PAGE_SIZE;

#[derive(Debug, Error)]
pub enum GuestMemoryError {
    #[error("gpn {0:#x} is out of range")]
    OutOfRange(u64),
    #[error("access at {0:#x} is not 4-byte aligned")]
    Unaligned(u64),
}

/// A cloneable handle to guest memory. Clones share the same pages.
#[derive(Clone)]
pub struct GuestMemory {
    pages: Arc<[Box<Page>]>,
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("page_count", &self.pages.len())
            .finish()
    }
}

impl GuestMemory {
    /// Allocates `page_count` zeroed pages.
    pub fn new(page_count: usize) -> Self {
        Self {
            pages: (0..page_count).map(|_| vmbus_ring::zeroed_page()).collect(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Returns the page at `gpn`.
    pub fn page(&self, gpn: u64) -> Result<&Page, GuestMemoryError> {
        usize::try_from(gpn)
            .ok()
            .and_then(|i| self.pages.get(i))
            .map(|page| &**page)
            .ok_or(GuestMemoryError::OutOfRange(gpn))
    }

    /// Returns the page at `index`, which the caller has already checked.
    pub(crate) fn page_at(&self, index: usize) -> &Page {
        &self.pages[index]
    }

    /// Checks that every page in `gpns` exists.
    pub fn check_gpns(&self, gpns: &[u64]) -> Result<(), GuestMemoryError> {
        for &gpn in gpns {
            self.page(gpn)?;
        }
        Ok(())
    }

    fn words(
        &self,
        gpa: u64,
        len: usize,
    ) -> Result<impl Iterator<Item = &std::sync::atomic::AtomicU32>, GuestMemoryError> {
        if gpa % 4 != 0 || len % 4 != 0 {
            return Err(GuestMemoryError::Unaligned(gpa));
        }
        let end = gpa + len as u64;
        if len > 0 {
            // Bounds check both ends up front so a failed access writes nothing.
            self.page(gpa / PAGE_SIZE as u64)?;
            self.page((end - 1) / PAGE_SIZE as u64)?;
        }
        Ok((gpa..end).step_by(4).map(move |addr| {
            &self.pages[(addr / PAGE_SIZE as u64) as usize][(addr % PAGE_SIZE as u64) as usize / 4]
        }))
    }

    /// Reads `data.len()` bytes at guest physical address `gpa`. Both must be
    /// 4-byte aligned.
    pub fn read_at(&self, gpa: u64, data: &mut [u8]) -> Result<(), GuestMemoryError> {
        for (word, b) in self.words(gpa, data.len())?.zip(data.chunks_exact_mut(4)) {
            b.copy_from_slice(&word.load(Ordering::Acquire).to_ne_bytes());
        }
        Ok(())
    }

    /// Writes `data` at guest physical address `gpa`. Both must be 4-byte
    /// aligned.
    pub fn write_at(&self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        for (word, b) in self.words(gpa, data.len())?.zip(data.chunks_exact(4)) {
            let mut value = [0; 4];
            value.copy_from_slice(b);
            word.store(u32::from_ne_bytes(value), Ordering::Release);
        }
        Ok(())
    }

    /// Zeroes the pages in `gpns`.
    pub fn zero_pages(&self, gpns: &[u64]) -> Result<(), GuestMemoryError> {
        self.check_gpns(gpns)?;
        for &gpn in gpns {
            for word in self.page(gpn)?.iter() {
                word.store(0, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_across_pages() {
        let mem = GuestMemory::new(2);
        let data: Vec<u8> = (0..16).collect();
        mem.write_at(4088, &data).unwrap();
        let mut read = [0; 16];
        mem.read_at(4088, &mut read).unwrap();
        assert_eq!(&read[..], &data[..]);

        // The same bytes are visible through another handle.
        let other = mem.clone();
        let mut read = [0; 8];
        other.read_at(4096, &mut read).unwrap();
        assert_eq!(read, [8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_bounds() {
        let mem = GuestMemory::new(1);
        assert!(matches!(
            mem.write_at(4092, &[0; 8]),
            Err(GuestMemoryError::OutOfRange(1))
        ));
        assert!(matches!(
            mem.write_at(2, &[0; 4]),
            Err(GuestMemoryError::Unaligned(2))
        ));
        assert!(mem.page(1).is_err());
        assert!(mem.check_gpns(&[0]).is_ok());

        mem.write_at(0, &[1; 4]).unwrap();
        mem.zero_pages(&[0]).unwrap();
        let mut read = [0xff; 4];
        mem.read_at(0, &mut read).unwrap();
        assert_eq!(read, [0; 4]);
    }
}
