// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vmbus channels: guest memory, GPADLs, the ring buffers carved out of them,
//! and the per-channel lifecycle shared by the host and guest control planes.

#![forbid(unsafe_code)]

pub mod directory;
pub mod gpadl;
pub mod gpadl_ring;
pub mod memory;
pub mod signal;
pub mod state;

use gpadl_ring::GpadlRingMem;
use signal::SignalTarget;
use signal::SignalTransport;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use vmbus_ring::FlatRingMem;
use vmbus_ring::IncomingPacket;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingRing;
use vmbus_ring::ReadError;
use vmbus_ring::RingMem;
use vmbus_ring::WriteError;

/// The ring I/O state of a channel, shared between the channel and the
/// control plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IoState {
    Open = 0,
    Closing = 1,
    Closed = 2,
    Rescinded = 3,
    /// A ring was found corrupt.
    Failed = 4,
}

impl IoState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => IoState::Open,
            1 => IoState::Closing,
            2 => IoState::Closed,
            3 => IoState::Rescinded,
            _ => IoState::Failed,
        }
    }
}

/// A cloneable handle the control plane uses to change a channel's I/O state
/// from outside the context doing the I/O.
#[derive(Clone, Debug)]
pub struct ChannelHandle(Arc<AtomicU8>);

impl ChannelHandle {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(IoState::Open as u8)))
    }

    pub fn io_state(&self) -> IoState {
        IoState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn compare_exchange(&self, from: IoState, to: IoState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Starts closing an open channel. Ring I/O fails from here on. Returns
    /// false if the channel was not open.
    pub fn begin_close(&self) -> bool {
        self.compare_exchange(IoState::Open, IoState::Closing)
    }

    /// Finishes a close started with [`Self::begin_close`].
    pub fn finish_close(&self) -> bool {
        self.compare_exchange(IoState::Closing, IoState::Closed)
    }

    /// Marks the channel rescinded, whatever its state.
    pub fn rescind(&self) {
        self.0.store(IoState::Rescinded as u8, Ordering::Release);
    }

    fn fail(&self) {
        self.compare_exchange(IoState::Open, IoState::Failed);
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("the channel is closed")]
    Closed,
    #[error("the channel was rescinded")]
    Rescinded,
    #[error("the channel failed after a ring error")]
    Failed,
    /// The packet does not fit right now. The value is the number of bytes it
    /// needs.
    #[error("the outgoing ring is full, {0} bytes needed")]
    RingFull(usize),
    #[error("ring buffer error")]
    Ring(#[source] vmbus_ring::Error),
}

/// One end of an open channel: an incoming and an outgoing ring, and the
/// signal used to notify the opposite endpoint.
pub struct Channel<M: RingMem> {
    in_ring: IncomingRing<M>,
    out_ring: OutgoingRing<M>,
    signal: Arc<dyn SignalTransport>,
    target: SignalTarget,
    handle: ChannelHandle,
}

/// A channel whose rings live in a GPADL.
pub type GpadlChannel = Channel<GpadlRingMem>;

impl<M: RingMem> std::fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target)
            .field("state", &self.handle.io_state())
            .finish()
    }
}

impl<M: RingMem> Channel<M> {
    /// Creates a channel that signals `target` through `signal`. Incoming
    /// interrupts are unmasked.
    pub fn new(
        in_ring: IncomingRing<M>,
        out_ring: OutgoingRing<M>,
        signal: Arc<dyn SignalTransport>,
        target: SignalTarget,
    ) -> Self {
        in_ring.set_interrupt_mask(false);
        Self {
            in_ring,
            out_ring,
            signal,
            target,
            handle: ChannelHandle::new(),
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// The target this channel signals.
    pub fn target(&self) -> SignalTarget {
        self.target
    }

    fn check(&self) -> Result<(), ChannelError> {
        match self.handle.io_state() {
            IoState::Open => Ok(()),
            IoState::Closing | IoState::Closed => Err(ChannelError::Closed),
            IoState::Rescinded => Err(ChannelError::Rescinded),
            IoState::Failed => Err(ChannelError::Failed),
        }
    }

    fn fail(&self, err: vmbus_ring::Error) -> ChannelError {
        tracing::error!(
            connection_id = self.target.connection_id.0,
            error = &err as &dyn std::error::Error,
            "channel ring failure"
        );
        self.handle.fail();
        ChannelError::Ring(err)
    }

    fn signal_remote(&self) {
        self.signal.signal(self.target);
    }

    fn written(&self, result: Result<bool, WriteError>) -> Result<(), ChannelError> {
        match result {
            Ok(signal) => {
                if signal {
                    self.signal_remote();
                }
                Ok(())
            }
            Err(WriteError::Full(n)) => Err(ChannelError::RingFull(n)),
            Err(WriteError::Corrupt(err)) => Err(self.fail(err)),
        }
    }

    /// Writes a packet, signaling the opposite endpoint if needed.
    pub fn write(&mut self, packet: &OutgoingPacket<'_>) -> Result<(), ChannelError> {
        self.check()?;
        let result = self.out_ring.write(packet);
        self.written(result)
    }

    /// Writes all of `packets` or none of them.
    pub fn write_batch(&mut self, packets: &[OutgoingPacket<'_>]) -> Result<(), ChannelError> {
        self.check()?;
        let result = self.out_ring.write_batch(packets);
        self.written(result)
    }

    /// Reads the next packet, or returns `None` if the ring is empty.
    pub fn read(&mut self) -> Result<Option<IncomingPacket>, ChannelError> {
        self.check()?;
        match self.in_ring.read() {
            Ok((packet, signal)) => {
                if signal {
                    self.signal_remote();
                }
                Ok(Some(packet))
            }
            Err(ReadError::Empty) => Ok(None),
            Err(ReadError::Corrupt(err)) => Err(self.fail(err)),
        }
    }

    /// Returns the number of bytes that can be written right now.
    pub fn peek_free_bytes(&self) -> Result<u32, ChannelError> {
        self.out_ring.peek_free_bytes().map_err(|err| self.fail(err))
    }

    /// Returns the number of bytes waiting to be read.
    pub fn peek_used_bytes(&self) -> Result<u32, ChannelError> {
        self.in_ring.peek_used_bytes().map_err(|err| self.fail(err))
    }

    /// Masks or unmasks signals from the opposite endpoint's writes.
    pub fn set_interrupt_mask(&mut self, masked: bool) {
        self.in_ring.set_interrupt_mask(masked);
    }

    /// Asks the opposite endpoint to signal only once more than `len` bytes
    /// are waiting. Zero restores signaling on every empty to non-empty
    /// transition.
    pub fn set_pending_send_size(&mut self, len: usize) -> Result<(), ChannelError> {
        self.in_ring
            .set_pending_send_size(len)
            .map_err(ChannelError::Ring)
    }

    /// Returns the largest packet the outgoing ring can ever hold.
    pub fn maximum_packet_size(&self) -> usize {
        self.out_ring.maximum_packet_size()
    }
}

/// Creates a connected pair of channels over flat memory, host first. The
/// host signals `to_guest` and the guest signals `to_host`.
pub fn connected_channels(
    ring_size: usize,
    signal: Arc<dyn SignalTransport>,
    to_host: SignalTarget,
    to_guest: SignalTarget,
) -> Result<(Channel<FlatRingMem>, Channel<FlatRingMem>), vmbus_ring::Error> {
    let (host_in, guest_out) = ring_pair(ring_size)?;
    let (guest_in, host_out) = ring_pair(ring_size)?;
    Ok((
        Channel::new(host_in, host_out, signal.clone(), to_guest),
        Channel::new(guest_in, guest_out, signal, to_host),
    ))
}

fn ring_pair(
    size: usize,
) -> Result<(IncomingRing<FlatRingMem>, OutgoingRing<FlatRingMem>), vmbus_ring::Error> {
    let mem = FlatRingMem::new(size);
    Ok((IncomingRing::new(mem.clone())?, OutgoingRing::new(mem)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalCounter;
    use vmbus_core::protocol::ConnectionId;
    use vmbus_ring::OutgoingPacketType;
    use vmbus_ring::PacketSize;

    const TO_HOST: SignalTarget = SignalTarget {
        connection_id: ConnectionId(0x2005),
        event_flag: 5,
    };
    const TO_GUEST: SignalTarget = SignalTarget {
        connection_id: ConnectionId(0x2006),
        event_flag: 5,
    };

    pub(crate) fn test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    }

    fn pair() -> (
        Arc<SignalCounter>,
        Channel<FlatRingMem>,
        Channel<FlatRingMem>,
    ) {
        test_tracing();
        let counter = Arc::new(SignalCounter::new());
        let (host, guest) = connected_channels(4096, counter.clone(), TO_HOST, TO_GUEST).unwrap();
        (counter, host, guest)
    }

    fn in_band(payload: &[u8]) -> OutgoingPacket<'_> {
        OutgoingPacket {
            transaction_id: 0,
            typ: OutgoingPacketType::InBandNoCompletion,
            payload,
        }
    }

    #[test]
    fn test_round_trip() {
        let (counter, mut host, mut guest) = pair();
        guest.write(&in_band(b"hello vmbus")).unwrap();
        assert_eq!(counter.take(TO_HOST), 1);
        assert_eq!(host.peek_used_bytes().unwrap(), 16 + 16 + 8);

        let packet = host.read().unwrap().unwrap();
        assert_eq!(&packet.payload[..11], b"hello vmbus");
        assert!(host.read().unwrap().is_none());

        host.write(&OutgoingPacket {
            transaction_id: 9,
            typ: OutgoingPacketType::Completion,
            payload: &[1; 8],
        })
        .unwrap();
        assert_eq!(counter.take(TO_GUEST), 1);
        assert_eq!(guest.read().unwrap().unwrap().transaction_id, Some(9));
    }

    #[test]
    fn test_signal_only_when_empty() {
        let (counter, mut host, mut guest) = pair();
        guest.write(&in_band(&[0; 8])).unwrap();
        guest.write(&in_band(&[0; 8])).unwrap();
        assert_eq!(counter.take(TO_HOST), 1);

        // Masked: no signal even on the empty to non-empty transition.
        host.read().unwrap();
        host.read().unwrap();
        host.set_interrupt_mask(true);
        guest.write(&in_band(&[0; 8])).unwrap();
        assert_eq!(counter.count(TO_HOST), 0);
    }

    #[test]
    fn test_pending_send_size() {
        let (counter, mut host, mut guest) = pair();
        host.set_pending_send_size(200).unwrap();
        guest.write(&in_band(&[0; 72])).unwrap();
        assert_eq!(host.peek_used_bytes().unwrap(), 96);
        assert_eq!(counter.count(TO_HOST), 0);
        guest.write(&in_band(&[0; 128])).unwrap();
        assert_eq!(host.peek_used_bytes().unwrap(), 248);
        assert_eq!(counter.take(TO_HOST), 1);
        guest.write(&in_band(&[0; 8])).unwrap();
        assert_eq!(counter.count(TO_HOST), 0);

        assert!(matches!(
            host.set_pending_send_size(4096),
            Err(ChannelError::Ring(vmbus_ring::Error::InvalidMessageLength))
        ));
    }

    #[test]
    fn test_full_wakes_writer() {
        let (counter, mut host, mut guest) = pair();
        let payload = [0; 1000];
        let size = PacketSize::in_band(payload.len());
        let mut written = 0;
        loop {
            match guest.write(&in_band(&payload)) {
                Ok(()) => written += 1,
                Err(ChannelError::RingFull(n)) => {
                    assert_eq!(n, size);
                    break;
                }
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(written, 4095 / size);
        assert!(guest.peek_free_bytes().unwrap() < size as u32);
        counter.take(TO_HOST);

        // The first read after a failed write signals the writer, later
        // reads do not.
        host.read().unwrap().unwrap();
        assert_eq!(counter.take(TO_GUEST), 1);
        host.read().unwrap().unwrap();
        assert_eq!(counter.count(TO_GUEST), 0);
        guest.write(&in_band(&payload)).unwrap();
    }

    #[test]
    fn test_close_and_rescind() {
        let (_counter, mut host, mut guest) = pair();
        guest.write(&in_band(&[1; 8])).unwrap();
        let handle = host.handle();
        assert!(handle.begin_close());
        assert!(!handle.begin_close());
        assert!(matches!(host.read(), Err(ChannelError::Closed)));
        assert!(handle.finish_close());
        assert_eq!(handle.io_state(), IoState::Closed);
        assert!(matches!(
            host.write(&in_band(&[1; 8])),
            Err(ChannelError::Closed)
        ));

        guest.handle().rescind();
        assert!(matches!(
            guest.write(&in_band(&[1; 8])),
            Err(ChannelError::Rescinded)
        ));
        assert!(matches!(guest.read(), Err(ChannelError::Rescinded)));
    }

    #[test]
    fn test_corrupt_ring_fails_channel() {
        test_tracing();
        let counter = Arc::new(SignalCounter::new());
        let mem = FlatRingMem::new(4096);
        let mut host = Channel::new(
            IncomingRing::new(mem.clone()).unwrap(),
            OutgoingRing::new(FlatRingMem::new(4096)).unwrap(),
            counter.clone(),
            TO_GUEST,
        );
        // An unaligned write index.
        mem.control()[0].store(3, Ordering::SeqCst);
        assert!(matches!(
            host.read(),
            Err(ChannelError::Ring(vmbus_ring::Error::InvalidRingPointer))
        ));
        assert_eq!(host.handle().io_state(), IoState::Failed);
        assert!(matches!(host.read(), Err(ChannelError::Failed)));
        assert!(matches!(
            host.write(&in_band(&[0; 8])),
            Err(ChannelError::Failed)
        ));
    }
}
