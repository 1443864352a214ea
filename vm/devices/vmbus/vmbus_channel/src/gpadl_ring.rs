// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPADL-backed ring buffers.
//!
//! A channel's ring GPADL is one page-aligned range split at the downstream
//! page offset. Pages before the offset hold the guest-to-host (upstream)
//! ring and pages after it the host-to-guest (downstream) ring. Each ring
//! starts with its control page.

use crate::gpadl::GpadlView;
use crate::memory::GuestMemory;
use crate::memory::GuestMemoryError;
use ring::IncomingRing;
use ring::OutgoingRing;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use vmbus_ring as ring;
use vmbus_ring::Page;

/// A GPADL view that has exactly one page-aligned range.
#[derive(Clone)]
pub struct AlignedGpadlView {
    gpadl: GpadlView,
    offset: u32,
    len: u32,
}

impl AlignedGpadlView {
    /// Validates that `gpadl` is aligned and wraps it.
    pub fn new(gpadl: GpadlView) -> Result<Self, GpadlView> {
        let Some(count) = gpadl.contiguous_aligned().map(|r| r.gpns().len() as u32) else {
            return Err(gpadl);
        };
        Ok(AlignedGpadlView {
            gpadl,
            offset: 0,
            len: count,
        })
    }

    /// Splits the range into two aligned ranges at the page number `offset`.
    pub fn split(
        self,
        offset: u32,
    ) -> Result<(AlignedGpadlView, AlignedGpadlView), AlignedGpadlView> {
        if offset == 0 || self.len <= offset {
            return Err(self);
        }
        let left = AlignedGpadlView {
            gpadl: self.gpadl.clone(),
            offset: self.offset,
            len: offset,
        };
        let right = AlignedGpadlView {
            offset: self.offset + offset,
            len: self.len - offset,
            gpadl: self.gpadl,
        };
        Ok((left, right))
    }

    /// Returns the GPN array for this range.
    pub fn gpns(&self) -> &[u64] {
        let gpns = self.gpadl.first().map_or(&[][..], |r| r.gpns());
        &gpns[self.offset as usize..(self.offset + self.len) as usize]
    }
}

#[derive(Clone)]
struct GpadlPagedMemory {
    _gpadl: AlignedGpadlView,
    mem: GuestMemory,
    pages: Vec<usize>,
}

impl GpadlPagedMemory {
    fn new(gpadl: AlignedGpadlView, mem: &GuestMemory) -> Result<Self, Error> {
        // A ring needs its control page and at least one data page.
        if gpadl.len < 2 {
            return Err(Error::InvalidRingGpadl);
        }
        mem.check_gpns(gpadl.gpns())?;
        let pages = gpadl.gpns().iter().map(|&gpn| gpn as usize).collect();
        Ok(Self {
            _gpadl: gpadl,
            mem: mem.clone(),
            pages,
        })
    }

    fn page(&self, index: usize) -> &Page {
        self.mem.page_at(self.pages[index])
    }
}

impl ring::PagedMemory for GpadlPagedMemory {
    fn control(&self) -> &Page {
        self.page(0)
    }

    #[inline]
    fn data(&self, page: usize) -> &Page {
        self.page(page + 1)
    }

    fn data_page_count(&self) -> usize {
        self.pages.len() - 1
    }
}

impl Debug for GpadlPagedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpadlPagedMemory")
            .field("pages", &self.pages)
            .finish()
    }
}

/// An implementation of [`vmbus_ring::RingMem`] backed by an aligned GPADL
/// view.
#[derive(Debug, Clone)]
pub struct GpadlRingMem {
    ring: ring::PagedRingMem<GpadlPagedMemory>,
}

impl GpadlRingMem {
    /// Creates a new ring memory backed by `gpadl` and `mem`.
    pub fn new(gpadl: AlignedGpadlView, mem: &GuestMemory) -> Result<Self, Error> {
        Ok(Self {
            ring: ring::PagedRingMem::new(GpadlPagedMemory::new(gpadl, mem)?),
        })
    }
}

impl ring::RingMem for GpadlRingMem {
    #[inline]
    fn control(&self) -> &[AtomicU32] {
        self.ring.control()
    }

    #[inline]
    fn data_word(&self, index: usize) -> &AtomicU32 {
        self.ring.data_word(index)
    }

    #[inline]
    fn len(&self) -> usize {
        self.ring.len()
    }
}

/// A ring buffer error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// invalid ring buffer gpadl
    #[error("invalid ring buffer gpadl")]
    InvalidRingGpadl,
    /// memory error accessing the ring
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    /// ring buffer error
    #[error(transparent)]
    Ring(#[from] ring::Error),
}

/// The two rings of a channel, as memory not yet claimed by either side.
#[derive(Debug)]
pub struct GpadlRings {
    /// The guest-to-host ring.
    pub upstream: GpadlRingMem,
    /// The host-to-guest ring.
    pub downstream: GpadlRingMem,
}

impl GpadlRings {
    /// Splits the ring GPADL at `downstream_page_offset`.
    pub fn new(
        mem: &GuestMemory,
        gpadl: GpadlView,
        downstream_page_offset: u32,
    ) -> Result<Self, Error> {
        let gpadl = AlignedGpadlView::new(gpadl).map_err(|_| Error::InvalidRingGpadl)?;
        let (upstream, downstream) = gpadl
            .split(downstream_page_offset)
            .map_err(|_| Error::InvalidRingGpadl)?;
        Ok(Self {
            upstream: GpadlRingMem::new(upstream, mem)?,
            downstream: GpadlRingMem::new(downstream, mem)?,
        })
    }

    /// Returns the host's rings: it reads upstream and writes downstream.
    pub fn host(self) -> Result<(IncomingRing<GpadlRingMem>, OutgoingRing<GpadlRingMem>), Error> {
        Ok((
            IncomingRing::new(self.upstream)?,
            OutgoingRing::new(self.downstream)?,
        ))
    }

    /// Returns the guest's rings: it reads downstream and writes upstream.
    pub fn guest(
        self,
    ) -> Result<(IncomingRing<GpadlRingMem>, OutgoingRing<GpadlRingMem>), Error> {
        Ok((
            IncomingRing::new(self.downstream)?,
            OutgoingRing::new(self.upstream)?,
        ))
    }
}
