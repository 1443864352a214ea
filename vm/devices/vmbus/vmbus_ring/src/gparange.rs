// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPA range lists, as carried by GPADL messages and GPA direct packets.
//!
//! A range list is a buffer of u64 values. Each range starts with a
//! [`GpaRange`] header word followed by the page numbers it covers.

use smallvec::SmallVec;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const PAGE_SIZE: usize = 4096;

pub type GpnList = SmallVec<[u64; 64]>;

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    pub len: u32,
    pub offset: u32,
}

impl GpaRange {
    fn to_u64(self) -> u64 {
        self.len as u64 | (self.offset as u64) << 32
    }
}

/// A byte range over a list of guest pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PagedRange<'a> {
    offset: usize,
    len: usize,
    gpns: &'a [u64],
}

impl<'a> PagedRange<'a> {
    /// Returns a range of `len` bytes starting `offset` bytes into the first
    /// page of `gpns`. Returns `None` if `gpns` is not exactly the pages the
    /// range touches.
    pub fn new(offset: usize, len: usize, gpns: &'a [u64]) -> Option<Self> {
        if offset >= PAGE_SIZE || len == 0 {
            return None;
        }
        if (offset + len).div_ceil(PAGE_SIZE) != gpns.len() {
            return None;
        }
        Some(Self { offset, len, gpns })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn gpns(&self) -> &'a [u64] {
        self.gpns
    }

    /// The number of range buffer values this range encodes to.
    pub fn encoded_len(&self) -> usize {
        1 + self.gpns.len()
    }
}

/// An owned or borrowed buffer of `count` ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MultiPagedRangeBuf<T: AsRef<[u64]>> {
    buf: T,
    count: usize,
}

impl<T: AsRef<[u64]>> MultiPagedRangeBuf<T> {
    /// Checks that `buf` holds exactly `count` well-formed ranges.
    pub fn validate(count: usize, buf: &[u64]) -> Result<(), Error> {
        let mut rem: &[u64] = buf;
        for _ in 0..count {
            let (_, rest) = parse(rem)?;
            rem = rest;
        }
        if !rem.is_empty() {
            return Err(Error::TrailingData);
        }
        Ok(())
    }

    pub fn new(count: usize, buf: T) -> Result<Self, Error> {
        Self::validate(count, buf.as_ref())?;
        Ok(MultiPagedRangeBuf { buf, count })
    }

    pub fn iter(&self) -> MultiPagedRangeIter<'_> {
        MultiPagedRangeIter {
            buf: self.buf.as_ref(),
            count: self.count,
        }
    }

    pub fn range_count(&self) -> usize {
        self.count
    }

    pub fn first(&self) -> Option<PagedRange<'_>> {
        self.iter().next()
    }

    /// Returns the only range if this buffer is a single page-aligned range.
    pub fn contiguous_aligned(&self) -> Option<PagedRange<'_>> {
        if self.count != 1 {
            return None;
        }
        let first = self.first()?;
        if first.offset() != 0 || first.len() % PAGE_SIZE != 0 {
            return None;
        }
        Some(first)
    }

    pub fn range_buffer(&self) -> &[u64] {
        self.buf.as_ref()
    }
}

impl<'a> FromIterator<PagedRange<'a>> for MultiPagedRangeBuf<GpnList> {
    fn from_iter<I: IntoIterator<Item = PagedRange<'a>>>(iter: I) -> Self {
        let mut buf = GpnList::new();
        let mut count = 0;
        for range in iter {
            buf.push(
                GpaRange {
                    len: range.len() as u32,
                    offset: range.offset() as u32,
                }
                .to_u64(),
            );
            buf.extend_from_slice(range.gpns());
            count += 1;
        }
        // Each range was already validated by `PagedRange::new`.
        MultiPagedRangeBuf { buf, count }
    }
}

/// Encodes `ranges` into `buf` in range buffer format.
pub fn encode_ranges(ranges: &[PagedRange<'_>], buf: &mut Vec<u64>) {
    for range in ranges {
        buf.push(
            GpaRange {
                len: range.len() as u32,
                offset: range.offset() as u32,
            }
            .to_u64(),
        );
        buf.extend_from_slice(range.gpns());
    }
}

#[derive(Clone, Debug)]
pub struct MultiPagedRangeIter<'a> {
    buf: &'a [u64],
    count: usize,
}

impl<'a> Iterator for MultiPagedRangeIter<'a> {
    type Item = PagedRange<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }
        // N.B. The buffer was validated on construction.
        let (range, rest) = parse(self.buf).ok()?;
        self.count -= 1;
        self.buf = rest;
        Some(range)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty range")]
    EmptyRange,
    #[error("empty byte count")]
    EmptyByteCount,
    #[error("range too small")]
    RangeTooSmall,
    #[error("data after the last range")]
    TrailingData,
    #[error("integer overflow")]
    Overflow,
}

fn parse(buf: &[u64]) -> Result<(PagedRange<'_>, &[u64]), Error> {
    let (hdr, gpns) = buf.split_first().ok_or(Error::EmptyRange)?;
    let byte_count = *hdr as u32;
    if byte_count == 0 {
        return Err(Error::EmptyByteCount);
    }
    let byte_offset = (*hdr >> 32) as u32 & 0xfff;
    let pages = (byte_count
        .checked_add(4095)
        .ok_or(Error::Overflow)?
        .checked_add(byte_offset)
        .ok_or(Error::Overflow)?) as usize
        / PAGE_SIZE;
    if gpns.len() < pages {
        return Err(Error::RangeTooSmall);
    }
    let (gpns, rest) = gpns.split_at(pages);
    let range = PagedRange::new(byte_offset as usize, byte_count as usize, gpns)
        .ok_or(Error::RangeTooSmall)?;
    Ok((range, rest))
}
