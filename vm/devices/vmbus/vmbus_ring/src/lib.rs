// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements the low-level interface to the VmBus ring buffer. The
//! ring buffer resides in guest memory shared with the host, allowing
//! transfer of variable-sized packets without copying through the hypervisor.
//!
//! Ring buffer packets have headers called descriptors, which can specify a
//! transaction ID and metadata referring to memory outside the ring buffer.
//! Each packet is a multiple of 8 bytes.
//!
//! In practice, ring buffers always come in pairs so that packets can be both
//! sent and received. However, this module's interfaces operate on them singly.

#![forbid(unsafe_code)]

pub mod gparange;

pub use protocol::TransferPageRange;
pub use protocol::PAGE_SIZE;

use crate::gparange::GpnList;
use crate::gparange::MultiPagedRangeBuf;
use crate::gparange::PagedRange;
use protocol::*;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

mod protocol {
    use std::fmt::Debug;
    use std::sync::atomic::AtomicU32;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// VmBus ring buffers are sized in multiples 4KB pages, with a 4KB control page.
    pub const PAGE_SIZE: usize = 4096;

    /// The descriptor header on every packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PacketDescriptor {
        pub packet_type: u16,
        pub data_offset8: u16,
        pub length8: u16,
        pub flags: u16,
        pub transaction_id: u64,
    }

    /// A control page accessor. The slice has been checked to hold at least
    /// `CONTROL_WORD_COUNT` words.
    pub struct Control<'a>(pub &'a [AtomicU32]);

    impl Control<'_> {
        /// The write index, advanced by the producer.
        pub fn inp(&self) -> &AtomicU32 {
            &self.0[0]
        }
        /// The read index, advanced by the consumer.
        pub fn outp(&self) -> &AtomicU32 {
            &self.0[1]
        }
        pub fn interrupt_mask(&self) -> &AtomicU32 {
            &self.0[2]
        }
        pub fn pending_send_size(&self) -> &AtomicU32 {
            &self.0[3]
        }
        /// Set by a producer that found the ring full; cleared by the consumer
        /// when it frees space.
        pub fn writer_blocked(&self) -> &AtomicU32 {
            &self.0[4]
        }
        pub fn feature_bits(&self) -> &AtomicU32 {
            &self.0[16]
        }
    }

    impl Debug for Control<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Control")
                .field("inp", self.inp())
                .field("outp", self.outp())
                .field("interrupt_mask", self.interrupt_mask())
                .field("pending_send_size", self.pending_send_size())
                .field("writer_blocked", self.writer_blocked())
                .field("feature_bits", self.feature_bits())
                .finish()
        }
    }

    /// If set, the consumer's `pending_send_size` is a signal threshold the
    /// producer must honor.
    pub const FEATURE_SUPPORTS_PENDING_SEND_SIZE: u32 = 1;

    /// A transfer range specifying a length and offset within a transfer page
    /// set.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TransferPageRange {
        pub byte_count: u32,
        pub byte_offset: u32,
    }

    /// The extended portion of the packet descriptor that describes a transfer
    /// page packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TransferPageHeader {
        pub transfer_page_set_id: u16,
        pub reserved: u16, // may have garbage non-zero values
        pub range_count: u32,
    }

    /// The extended portion of the packet descriptor describing a GPA direct packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GpaDirectHeader {
        pub reserved: u32, // may have garbage non-zero values
        pub range_count: u32,
    }

    pub const PACKET_FLAG_COMPLETION_REQUESTED: u16 = 1;

    /// The packet footer.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Footer {
        pub reserved: u32,
        /// The ring offset of the packet.
        pub offset: u32,
    }
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid ring buffer pointer")]
    InvalidRingPointer,
    #[error("invalid message length")]
    InvalidMessageLength,
    #[error("invalid data available")]
    InvalidDataAvailable,
    #[error("invalid ring memory")]
    InvalidRingMemory,
    #[error("invalid descriptor offset or length")]
    InvalidDescriptorLengths,
    #[error("unknown packet descriptor flags")]
    InvalidDescriptorFlags,
    #[error("unknown packet descriptor type")]
    InvalidDescriptorType,
    #[error("invalid range count for gpa direct packet")]
    InvalidDescriptorGpaDirectRangeCount,
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("ring buffer empty")]
    Empty,
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The ring does not have room for the packet right now. The value is the
    /// number of bytes the packet needs.
    #[error("ring buffer full")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// The alternate types of incoming packets, with the metadata carried in the
/// variable portion of the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingPacketType {
    InBand,
    Completion,
    GpaDirect(MultiPagedRangeBuf<GpnList>),
    TransferPages(u16, Vec<TransferPageRange>),
}

/// An incoming packet, copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPacket {
    pub transaction_id: Option<u64>,
    pub typ: IncomingPacketType,
    /// The payload, including the padding to the next 8-byte boundary.
    pub payload: Vec<u8>,
}

const PACKET_TYPE_IN_BAND: u16 = 6;
const PACKET_TYPE_TRANSFER_PAGES: u16 = 0x7;
const PACKET_TYPE_GPA_DIRECT: u16 = 0x9;
const PACKET_TYPE_COMPLETION: u16 = 0xb;

const DESCRIPTOR_SIZE: usize = size_of::<PacketDescriptor>();

fn parse_packet<M: RingMem>(
    ring: &M,
    ring_off: u32,
    avail: u32,
) -> Result<(u32, IncomingPacket), ReadError> {
    let off = ring_off as usize;
    let mut desc = PacketDescriptor::new_zeroed();
    ring.read_aligned(off, desc.as_mut_bytes());
    let len = desc.length8 as u32 * 8;
    if desc.length8 < desc.data_offset8
        || desc.data_offset8 < 2
        || avail < len + size_of::<Footer>() as u32
    {
        return Err(ReadError::Corrupt(Error::InvalidDescriptorLengths));
    }

    if (desc.flags & !PACKET_FLAG_COMPLETION_REQUESTED) != 0 {
        return Err(ReadError::Corrupt(Error::InvalidDescriptorFlags));
    }
    let transaction_id = if desc.flags & PACKET_FLAG_COMPLETION_REQUESTED != 0
        || desc.packet_type == PACKET_TYPE_COMPLETION
    {
        Some(desc.transaction_id)
    } else {
        None
    };
    let header_len = desc.data_offset8 as usize * 8;
    let typ = match desc.packet_type {
        PACKET_TYPE_IN_BAND => IncomingPacketType::InBand,
        PACKET_TYPE_COMPLETION => IncomingPacketType::Completion,
        PACKET_TYPE_TRANSFER_PAGES => {
            let mut tph = TransferPageHeader::new_zeroed();
            ring.read_aligned(off + DESCRIPTOR_SIZE, tph.as_mut_bytes());
            let count = tph.range_count as usize;
            if header_len < DESCRIPTOR_SIZE + size_of_val(&tph) + count * 8 {
                return Err(ReadError::Corrupt(Error::InvalidDescriptorLengths));
            }
            let mut ranges = vec![TransferPageRange::new_zeroed(); count];
            ring.read_aligned(
                off + DESCRIPTOR_SIZE + size_of_val(&tph),
                ranges.as_mut_bytes(),
            );
            IncomingPacketType::TransferPages(tph.transfer_page_set_id, ranges)
        }
        PACKET_TYPE_GPA_DIRECT => {
            let mut gph = GpaDirectHeader::new_zeroed();
            ring.read_aligned(off + DESCRIPTOR_SIZE, gph.as_mut_bytes());
            if gph.range_count == 0 || header_len < DESCRIPTOR_SIZE + size_of_val(&gph) {
                return Err(ReadError::Corrupt(
                    Error::InvalidDescriptorGpaDirectRangeCount,
                ));
            }
            let mut buf = GpnList::from_elem(0, (header_len - DESCRIPTOR_SIZE - 8) / 8);
            ring.read_aligned(off + DESCRIPTOR_SIZE + 8, buf.as_mut_bytes());
            let ranges = MultiPagedRangeBuf::new(gph.range_count as usize, buf)
                .map_err(|_| Error::InvalidDescriptorGpaDirectRangeCount)?;
            IncomingPacketType::GpaDirect(ranges)
        }
        _ => return Err(ReadError::Corrupt(Error::InvalidDescriptorType)),
    };
    let mut payload = vec![0; len as usize - header_len];
    ring.read_aligned(off + header_len, &mut payload);
    Ok((
        len,
        IncomingPacket {
            transaction_id,
            typ,
            payload,
        },
    ))
}

/// The size of the control region in 32-bit words.
pub const CONTROL_WORD_COUNT: usize = 32;

/// A page of shared memory, accessed a word at a time.
pub type Page = [AtomicU32; PAGE_SIZE / 4];

/// Returns a zeroed page.
pub fn zeroed_page() -> Box<Page> {
    Box::new(std::array::from_fn(|_| AtomicU32::new(0)))
}

/// A trait for memory backing a ring buffer.
pub trait RingMem: Send {
    /// Returns the control words. Rings fail to construct if there are fewer
    /// than [`CONTROL_WORD_COUNT`].
    fn control(&self) -> &[AtomicU32];

    /// Returns the data word at `index`, in `0..self.len() / 4`.
    fn data_word(&self, index: usize) -> &AtomicU32;

    /// Returns the length of the ring's data area in bytes.
    fn len(&self) -> usize;

    /// Reads from the data portion of the ring, wrapping at the end of the
    /// ring. `addr` and `data.len()` must be multiples of 8.
    fn read_aligned(&self, addr: usize, data: &mut [u8]) {
        debug_assert!(addr % 8 == 0);
        debug_assert!(data.len() % 8 == 0);
        let len = self.len();
        for (i, b) in data.chunks_exact_mut(4).enumerate() {
            let index = (addr + i * 4) % len / 4;
            b.copy_from_slice(&self.data_word(index).load(Ordering::Relaxed).to_ne_bytes());
        }
    }

    /// Writes to the data portion of the ring, as in [`RingMem::read_aligned`].
    fn write_aligned(&self, addr: usize, data: &[u8]) {
        debug_assert!(addr % 8 == 0);
        debug_assert!(data.len() % 8 == 0);
        let len = self.len();
        for (i, b) in data.chunks_exact(4).enumerate() {
            let index = (addr + i * 4) % len / 4;
            let mut word = [0; 4];
            word.copy_from_slice(b);
            self.data_word(index)
                .store(u32::from_ne_bytes(word), Ordering::Relaxed);
        }
    }
}

/// Implementation of `RingMem` for references. Useful for tests.
impl<T: RingMem + Sync> RingMem for &'_ T {
    fn control(&self) -> &[AtomicU32] {
        (*self).control()
    }
    fn data_word(&self, index: usize) -> &AtomicU32 {
        (*self).data_word(index)
    }
    fn len(&self) -> usize {
        (*self).len()
    }

    fn read_aligned(&self, addr: usize, data: &mut [u8]) {
        (*self).read_aligned(addr, data)
    }

    fn write_aligned(&self, addr: usize, data: &[u8]) {
        (*self).write_aligned(addr, data)
    }
}

/// An implementation of `RingMem` over a flat allocation. Useful for tests.
#[derive(Clone)]
pub struct FlatRingMem {
    inner: Arc<FlatRingInner>,
}

struct FlatRingInner {
    control: [AtomicU32; CONTROL_WORD_COUNT],
    data: Vec<AtomicU32>,
}

impl FlatRingMem {
    /// Allocates a new memory with a `len` byte data area.
    pub fn new(len: usize) -> Self {
        let mut data = Vec::new();
        data.resize_with(len / 4, Default::default);
        Self {
            inner: Arc::new(FlatRingInner {
                control: [0; CONTROL_WORD_COUNT].map(Into::into),
                data,
            }),
        }
    }
}

impl Debug for FlatRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatRingMem").finish()
    }
}

impl RingMem for FlatRingMem {
    fn control(&self) -> &[AtomicU32] {
        &self.inner.control
    }

    fn data_word(&self, index: usize) -> &AtomicU32 {
        &self.inner.data[index]
    }

    fn len(&self) -> usize {
        self.inner.data.len() * 4
    }
}

/// A trait for ring buffer memory divided into discontiguous pages.
pub trait PagedMemory: Send {
    /// Returns the control page.
    fn control(&self) -> &Page;
    /// Returns the number of data pages.
    fn data_page_count(&self) -> usize;
    /// Returns a data page, `page` in `0..data_page_count`.
    fn data(&self, page: usize) -> &Page;
}

/// An implementation of [`RingMem`] on top of discontiguous pages.
#[derive(Debug, Clone)]
pub struct PagedRingMem<T>(T);

impl<T: PagedMemory> PagedRingMem<T> {
    /// Returns a new ring memory wrapping a type implementing [`PagedMemory`].
    pub fn new(inner: T) -> Self {
        Self(inner)
    }
}

impl<T: PagedMemory> RingMem for PagedRingMem<T> {
    fn control(&self) -> &[AtomicU32] {
        &self.0.control()[..CONTROL_WORD_COUNT]
    }

    #[inline]
    fn data_word(&self, index: usize) -> &AtomicU32 {
        const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;
        &self.0.data(index / WORDS_PER_PAGE)[index % WORDS_PER_PAGE]
    }

    fn len(&self) -> usize {
        self.0.data_page_count() * PAGE_SIZE
    }
}

/// Information about an outgoing packet.
#[derive(Debug, Copy, Clone)]
pub struct OutgoingPacket<'a> {
    pub transaction_id: u64,
    pub typ: OutgoingPacketType<'a>,
    /// The payload. It is padded with zeroes to a multiple of 8 bytes.
    pub payload: &'a [u8],
}

/// The outgoing packet type variants.
#[derive(Debug, Copy, Clone)]
pub enum OutgoingPacketType<'a> {
    /// A non-transactional data packet.
    InBandNoCompletion,
    /// A transactional data packet.
    InBandWithCompletion,
    /// A completion packet.
    Completion,
    /// A GPA direct packet, which can reference memory outside the ring by address.
    GpaDirect(&'a [PagedRange<'a>]),
    /// A transfer page packet, which can reference memory outside the ring by a
    /// buffer ID and a set of offsets into some pre-established buffer
    /// (typically a GPADL).
    TransferPages(u16, &'a [TransferPageRange]),
}

/// Namespace type with methods to compute packet sizes, for use with
/// `set_pending_send_size`.
pub struct PacketSize(());

impl PacketSize {
    /// Computes the size of an in-band packet.
    pub const fn in_band(payload_len: usize) -> usize {
        DESCRIPTOR_SIZE + ((payload_len + 7) & !7) + size_of::<Footer>()
    }

    /// Computes the size of a completion packet.
    pub const fn completion(payload_len: usize) -> usize {
        Self::in_band(payload_len)
    }

    /// Computes the size of a gpa direct packet.
    pub fn gpa_direct(ranges: &[PagedRange<'_>], payload_len: usize) -> usize {
        Self::in_band(payload_len)
            + size_of::<GpaDirectHeader>()
            + ranges.iter().map(|r| r.encoded_len() * 8).sum::<usize>()
    }

    /// Computes the size of a transfer page packet.
    pub const fn transfer_pages(count: usize, payload_len: usize) -> usize {
        Self::in_band(payload_len)
            + size_of::<TransferPageHeader>()
            + count * size_of::<TransferPageRange>()
    }
}

/// Builds the full ring image of a packet, footer included.
fn encode_packet(packet: &OutgoingPacket<'_>, inp: u32) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(PacketSize::in_band(packet.payload.len()));
    let (packet_type, flags) = match packet.typ {
        OutgoingPacketType::InBandNoCompletion => (PACKET_TYPE_IN_BAND, 0),
        OutgoingPacketType::InBandWithCompletion => {
            (PACKET_TYPE_IN_BAND, PACKET_FLAG_COMPLETION_REQUESTED)
        }
        OutgoingPacketType::Completion => (PACKET_TYPE_COMPLETION, 0),
        OutgoingPacketType::GpaDirect(_) => {
            (PACKET_TYPE_GPA_DIRECT, PACKET_FLAG_COMPLETION_REQUESTED)
        }
        OutgoingPacketType::TransferPages(..) => {
            (PACKET_TYPE_TRANSFER_PAGES, PACKET_FLAG_COMPLETION_REQUESTED)
        }
    };

    // The descriptor lengths are filled in once the header size is known.
    buf.extend_from_slice(&[0; DESCRIPTOR_SIZE]);
    match packet.typ {
        OutgoingPacketType::GpaDirect(ranges) => {
            if ranges.is_empty() {
                return Err(Error::InvalidDescriptorGpaDirectRangeCount);
            }
            let header = GpaDirectHeader {
                reserved: 0,
                range_count: ranges.len() as u32,
            };
            buf.extend_from_slice(header.as_bytes());
            let mut values = Vec::new();
            gparange::encode_ranges(ranges, &mut values);
            buf.extend_from_slice(values.as_bytes());
        }
        OutgoingPacketType::TransferPages(tp_id, ranges) => {
            let header = TransferPageHeader {
                transfer_page_set_id: tp_id,
                reserved: 0,
                range_count: ranges.len() as u32,
            };
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(ranges.as_bytes());
        }
        _ => (),
    }
    let header_size = buf.len();
    buf.extend_from_slice(packet.payload);
    buf.resize(buf.len().next_multiple_of(8), 0);
    let msg_len = buf.len();
    let desc = PacketDescriptor {
        packet_type,
        data_offset8: u16::try_from(header_size / 8).map_err(|_| Error::InvalidMessageLength)?,
        length8: u16::try_from(msg_len / 8).map_err(|_| Error::InvalidMessageLength)?,
        flags,
        transaction_id: packet.transaction_id,
    };
    buf[..DESCRIPTOR_SIZE].copy_from_slice(desc.as_bytes());
    let footer = Footer {
        reserved: 0,
        offset: inp,
    };
    buf.extend_from_slice(footer.as_bytes());
    Ok(buf)
}

/// The interface to the receiving endpoint of a ring buffer.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem> {
    inner: InnerRing<M>,
}

/// The current incoming ring state.
#[derive(Debug, Clone)]
pub struct IncomingOffset {
    cached_in: u32,
    committed_out: u32,
    next_out: u32,
}

impl<M: RingMem> IncomingRing<M> {
    /// Returns a new incoming ring. Fails if the ring memory is not sized
    /// correctly.
    ///
    /// The consumer owns the interrupt mask, the pending send size and the
    /// feature bits, so they are reset here.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        let control = inner.control();
        // Start with interrupts masked.
        control.interrupt_mask().store(1, Ordering::Relaxed);
        control.pending_send_size().store(0, Ordering::Relaxed);
        control
            .feature_bits()
            .store(FEATURE_SUPPORTS_PENDING_SEND_SIZE, Ordering::Release);
        Ok(Self { inner })
    }

    /// Enables or disables the interrupt mask, declaring to the opposite
    /// endpoint that interrupts should not or should be sent when packets
    /// are written.
    pub fn set_interrupt_mask(&self, state: bool) {
        self.inner
            .control()
            .interrupt_mask()
            .store(state as u32, Ordering::SeqCst);
    }

    /// Sets the pending send size: while nonzero, the producer signals only
    /// when a write moves the used byte count from at most `len` to above it.
    ///
    /// Fails if the ring can never hold more than `len` bytes.
    pub fn set_pending_send_size(&self, len: usize) -> Result<(), Error> {
        if len >= self.inner.len() as usize {
            return Err(Error::InvalidMessageLength);
        }
        self.inner
            .control()
            .pending_send_size()
            .store(len as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Returns the current incoming offset, for passing to `read_staged` and
    /// `commit_read`.
    pub fn incoming(&self) -> Result<IncomingOffset, Error> {
        let control = self.inner.control();
        let next_out = self
            .inner
            .validate(control.outp().load(Ordering::Relaxed))?;
        let cached_in = self.inner.validate(control.inp().load(Ordering::Acquire))?;
        Ok(IncomingOffset {
            next_out,
            cached_in,
            committed_out: next_out,
        })
    }

    /// Commits a series of packet reads, returning whether the opposite
    /// endpoint should be signaled.
    ///
    /// This is the case when space was freed while a producer was blocked on
    /// a full ring.
    pub fn commit_read(&self, ptrs: &mut IncomingOffset) -> bool {
        if ptrs.committed_out == ptrs.next_out {
            return false;
        }
        let control = self.inner.control();
        control.outp().store(ptrs.next_out, Ordering::SeqCst);
        ptrs.committed_out = ptrs.next_out;
        control.writer_blocked().swap(0, Ordering::SeqCst) != 0
    }

    /// Parses and copies out the next packet. The caller should commit the
    /// read with `commit_read` to free up space in the ring.
    pub fn read_staged(&self, ptrs: &mut IncomingOffset) -> Result<IncomingPacket, ReadError> {
        let outp = ptrs.next_out;
        let mut inp = ptrs.cached_in;
        if inp == outp {
            inp = self
                .inner
                .validate(self.inner.control().inp().load(Ordering::Acquire))?;
            if inp == outp {
                return Err(ReadError::Empty);
            }
            ptrs.cached_in = inp;
        }
        let avail = self.inner.used(inp, outp);
        if avail < (DESCRIPTOR_SIZE + size_of::<Footer>()) as u32 {
            return Err(ReadError::Corrupt(Error::InvalidDataAvailable));
        }
        let (len, packet) = parse_packet(&self.inner.mem, outp, avail)?;
        ptrs.next_out = self
            .inner
            .add_pointer(outp, len + size_of::<Footer>() as u32);

        Ok(packet)
    }

    /// Reads and commits a single packet, returning it and whether the
    /// opposite endpoint should be signaled.
    pub fn read(&self) -> Result<(IncomingPacket, bool), ReadError> {
        let mut ptrs = self.incoming()?;
        let packet = self.read_staged(&mut ptrs)?;
        let signal = self.commit_read(&mut ptrs);
        Ok((packet, signal))
    }

    /// Returns the number of bytes written but not yet consumed.
    pub fn peek_used_bytes(&self) -> Result<u32, Error> {
        self.inner.peek_used()
    }

    /// Returns the number of bytes that can currently be written.
    pub fn peek_free_bytes(&self) -> Result<u32, Error> {
        Ok(self.inner.len() - 1 - self.inner.peek_used()?)
    }
}

/// The sending side of a ring buffer.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem> {
    inner: InnerRing<M>,
}

/// An outgoing ring offset, used to determine the position to write packets to.
#[derive(Debug, Clone)]
pub struct OutgoingOffset {
    cached_out: u32,
    committed_in: u32,
    next_in: u32,
}

impl OutgoingOffset {
    /// Reverts the insertion of packets that have not yet been committed.
    pub fn revert(&mut self) {
        self.next_in = self.committed_in;
    }
}

impl<M: RingMem> OutgoingRing<M> {
    /// Returns a new outgoing ring over `mem`. The control words belong to
    /// the consumer and are left as they are.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        Ok(Self { inner })
    }

    /// Returns the current outgoing offset, for passing to `write_staged` and
    /// ultimately `commit_write`.
    pub fn outgoing(&self) -> Result<OutgoingOffset, Error> {
        let control = self.inner.control();
        let next_in = self.inner.validate(control.inp().load(Ordering::Relaxed))?;
        let cached_out = self
            .inner
            .validate(control.outp().load(Ordering::Acquire))?;
        Ok(OutgoingOffset {
            cached_out,
            committed_in: next_in,
            next_in,
        })
    }

    /// Indicates whether the consumer asked for pending send size semantics.
    pub fn supports_pending_send_size(&self) -> bool {
        let feature_bits = self.inner.control().feature_bits().load(Ordering::Acquire);
        (feature_bits & FEATURE_SUPPORTS_PENDING_SEND_SIZE) != 0
    }

    /// Returns the maximum packet size that can fit in the ring.
    pub fn maximum_packet_size(&self) -> usize {
        self.inner.len() as usize - 8
    }

    /// Returns the number of bytes written but not yet consumed.
    pub fn peek_used_bytes(&self) -> Result<u32, Error> {
        self.inner.peek_used()
    }

    /// Returns the number of bytes that can currently be written.
    pub fn peek_free_bytes(&self) -> Result<u32, Error> {
        Ok(self.inner.len() - 1 - self.inner.peek_used()?)
    }

    fn pending_send_threshold(&self) -> Option<u32> {
        if !self.supports_pending_send_size() {
            return None;
        }
        match self
            .inner
            .control()
            .pending_send_size()
            .load(Ordering::SeqCst)
        {
            0 => None,
            n => Some(n),
        }
    }

    /// Commits a series of writes that ended at the specified offset, returning
    /// whether the opposite endpoint should be signaled.
    ///
    /// No signal is needed while interrupts are masked. Otherwise, with a
    /// pending send size `t` set the signal is needed when the used byte count
    /// crossed from at most `t` to above it, and without one when the ring
    /// was empty before this commit.
    pub fn commit_write(&self, ptrs: &mut OutgoingOffset) -> Result<bool, Error> {
        if ptrs.committed_in == ptrs.next_in {
            return Ok(false);
        }
        let control = self.inner.control();
        // Nothing is published if the consumer's index is already bad.
        let outp_before = self
            .inner
            .validate(control.outp().load(Ordering::SeqCst))?;
        control.inp().store(ptrs.next_in, Ordering::SeqCst);
        let masked = control.interrupt_mask().load(Ordering::SeqCst) != 0;
        // Reload to see reads that raced the publish. The packets are out
        // either way; a bad value here surfaces on the next operation.
        let outp = self
            .inner
            .validate(control.outp().load(Ordering::SeqCst))
            .unwrap_or(outp_before);

        // The consumer may already have read into the new packets, in which
        // case the ring was empty before the commit.
        let written = self.inner.used(ptrs.next_in, ptrs.committed_in);
        let new_used = self.inner.used(ptrs.next_in, outp);
        let old_used = new_used.saturating_sub(written);
        ptrs.committed_in = ptrs.next_in;

        if masked {
            return Ok(false);
        }
        let signal = match self.pending_send_threshold() {
            Some(threshold) => old_used <= threshold && new_used > threshold,
            None => old_used == 0,
        };
        Ok(signal)
    }

    /// Writes the next packet at the staged offset without publishing it. The
    /// caller should commit the write (or multiple writes) with
    /// `commit_write`.
    ///
    /// Returns `Err(Full(len))` if the ring is full, where `len` is the number
    /// of bytes needed to write the requested packet. The opposite endpoint
    /// will be asked to signal once it frees space.
    pub fn write_staged(
        &self,
        ptrs: &mut OutgoingOffset,
        packet: &OutgoingPacket<'_>,
    ) -> Result<(), WriteError> {
        let inp = ptrs.next_in;
        let buf = encode_packet(packet, inp)?;
        let total_msg_len = buf.len() as u32;
        if buf.len() > self.maximum_packet_size() {
            return Err(WriteError::Corrupt(Error::InvalidMessageLength));
        }
        if self.inner.free(inp, ptrs.cached_out) < total_msg_len {
            let control = self.inner.control();
            let mut outp = self
                .inner
                .validate(control.outp().load(Ordering::Acquire))?;
            if self.inner.free(inp, outp) < total_msg_len {
                control.writer_blocked().store(1, Ordering::SeqCst);
                // Check again in case the consumer freed space before it could
                // see the blocked flag.
                outp = self
                    .inner
                    .validate(control.outp().load(Ordering::SeqCst))?;
                if self.inner.free(inp, outp) < total_msg_len {
                    return Err(WriteError::Full(total_msg_len as usize));
                }
            }
            ptrs.cached_out = outp;
        }

        self.inner.mem.write_aligned(inp as usize, &buf);
        ptrs.next_in = self.inner.add_pointer(inp, total_msg_len);
        Ok(())
    }

    /// Writes and commits a single packet, returning whether the opposite
    /// endpoint should be signaled. Nothing is written on failure.
    pub fn write(&self, packet: &OutgoingPacket<'_>) -> Result<bool, WriteError> {
        self.write_batch(std::slice::from_ref(packet))
    }

    /// Writes and commits a batch of packets, all or none. Returns whether the
    /// opposite endpoint should be signaled.
    pub fn write_batch(&self, packets: &[OutgoingPacket<'_>]) -> Result<bool, WriteError> {
        let mut ptrs = self.outgoing()?;
        for packet in packets {
            if let Err(err) = self.write_staged(&mut ptrs, packet) {
                ptrs.revert();
                return Err(err);
            }
        }
        Ok(self.commit_write(&mut ptrs)?)
    }
}

struct InnerRing<M: RingMem> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Debug for InnerRing<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerRing")
            .field("control", &self.control())
            .field("size", &self.size)
            .finish()
    }
}

impl<M: RingMem> InnerRing<M> {
    pub fn new(mem: M) -> Result<Self, Error> {
        let ring_size = u32::try_from(mem.len()).map_err(|_| Error::InvalidRingMemory)?;
        if ring_size == 0
            || ring_size % PAGE_SIZE as u32 != 0
            || mem.control().len() < CONTROL_WORD_COUNT
        {
            return Err(Error::InvalidRingMemory);
        }
        Ok(InnerRing {
            mem,
            size: ring_size,
        })
    }

    fn control(&self) -> Control<'_> {
        Control(self.mem.control())
    }

    fn len(&self) -> u32 {
        self.size
    }

    fn validate(&self, p: u32) -> Result<u32, Error> {
        if p >= self.size || p % 8 != 0 {
            Err(Error::InvalidRingPointer)
        } else {
            Ok(p)
        }
    }

    fn add_pointer(&self, p: u32, off: u32) -> u32 {
        ((p as u64 + off as u64) % self.size as u64) as u32
    }

    /// The bytes between the read index `outp` and the write index `inp`.
    fn used(&self, inp: u32, outp: u32) -> u32 {
        if inp >= outp {
            // |____outp....inp_____|
            inp - outp
        } else {
            // |....inp____outp.....|
            self.size - (outp - inp)
        }
    }

    /// A full ring would be indistinguishable from an empty one, so one byte
    /// always stays unused.
    fn free(&self, inp: u32, outp: u32) -> u32 {
        self.size - self.used(inp, outp) - 1
    }

    fn peek_used(&self) -> Result<u32, Error> {
        let control = self.control();
        let inp = self.validate(control.inp().load(Ordering::Acquire))?;
        let outp = self.validate(control.outp().load(Ordering::Acquire))?;
        Ok(self.used(inp, outp))
    }
}
