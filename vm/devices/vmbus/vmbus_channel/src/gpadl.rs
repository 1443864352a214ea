// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPADL support.
//!
//! A GPADL is assembled from a header message (message 0) and numbered body
//! messages, then published atomically by [`GpadlTable::complete`]. Nothing
//! can map a GPADL before that point.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use vmbus_core::protocol::ChannelId;
pub use vmbus_core::protocol::GpadlId;
use vmbus_ring::gparange;
use vmbus_ring::gparange::MultiPagedRangeBuf;

#[derive(Debug, Error)]
pub enum GpadlError {
    #[error("gpadl {0:?} already exists")]
    DuplicateId(GpadlId),
    #[error("unknown gpadl {0:?}")]
    UnknownId(GpadlId),
    #[error("invalid gpadl range buffer length {0}")]
    InvalidLength(usize),
    #[error("gpadl {id:?} message out of order: expected {expected}, got {actual}")]
    OutOfOrder {
        id: GpadlId,
        expected: u32,
        actual: u32,
    },
    #[error("gpadl {0:?} was abandoned after an ordering error")]
    Abandoned(GpadlId),
    #[error("gpadl {0:?} received a message after all data arrived")]
    TooManyMessages(GpadlId),
    #[error("gpadl {0:?} is missing data")]
    Incomplete(GpadlId),
    #[error("gpadl {0:?} is not created")]
    NotCreated(GpadlId),
    #[error("gpadl {0:?} has invalid ranges")]
    InvalidRanges(GpadlId, #[source] gparange::Error),
    #[error("gpadl {0:?} is still in use by a channel")]
    InUse(GpadlId),
}

#[derive(Debug)]
struct Gpadl {
    id: GpadlId,
    channel_id: ChannelId,
    buf: MultiPagedRangeBuf<Vec<u64>>,
    /// The number of bound views.
    map_count: Mutex<usize>,
}

/// A created GPADL bound by its holder. While any view exists the GPADL
/// cannot be torn down.
#[derive(Debug)]
pub struct GpadlView(Arc<Gpadl>);

impl Clone for GpadlView {
    fn clone(&self) -> Self {
        *self.0.map_count.lock() += 1;
        GpadlView(self.0.clone())
    }
}

impl GpadlView {
    /// Returns the GPADL identifier.
    pub fn id(&self) -> GpadlId {
        self.0.id
    }

    /// Returns the channel the GPADL was created for.
    pub fn channel_id(&self) -> ChannelId {
        self.0.channel_id
    }
}

impl Deref for GpadlView {
    type Target = MultiPagedRangeBuf<Vec<u64>>;
    fn deref(&self) -> &Self::Target {
        &self.0.buf
    }
}

impl Drop for GpadlView {
    fn drop(&mut self) {
        *self.0.map_count.lock() -= 1;
    }
}

#[derive(Debug)]
struct Building {
    channel_id: ChannelId,
    count: u16,
    /// The declared length, in u64 values.
    len: usize,
    buf: Vec<u64>,
    next_message: u32,
    abandoned: bool,
}

#[derive(Debug)]
enum Entry {
    Building(Building),
    Created(Arc<Gpadl>),
}

impl Entry {
    fn channel_id(&self) -> ChannelId {
        match self {
            Entry::Building(b) => b.channel_id,
            Entry::Created(gpadl) => gpadl.channel_id,
        }
    }

    fn accumulated(&self) -> usize {
        match self {
            Entry::Building(b) => b.buf.len(),
            Entry::Created(gpadl) => gpadl.buf.range_buffer().len(),
        }
    }

    fn in_use(&self) -> bool {
        match self {
            Entry::Created(gpadl) => *gpadl.map_count.lock() > 0,
            _ => false,
        }
    }
}

/// The GPADLs of one connection.
#[derive(Debug, Default)]
pub struct GpadlTable {
    map: Mutex<HashMap<GpadlId, Entry>>,
}

impl GpadlTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts assembling `id` from a header declaring `count` ranges in
    /// `byte_len` bytes of range buffer. Returns whether all the data has
    /// already arrived.
    pub fn begin(
        &self,
        id: GpadlId,
        channel_id: ChannelId,
        count: u16,
        byte_len: usize,
        first: &[u64],
    ) -> Result<bool, GpadlError> {
        if byte_len == 0 || byte_len % 8 != 0 {
            return Err(GpadlError::InvalidLength(byte_len));
        }
        let mut map = self.map.lock();
        if map.contains_key(&id) {
            return Err(GpadlError::DuplicateId(id));
        }
        let len = byte_len / 8;
        let mut building = Building {
            channel_id,
            count,
            len,
            buf: Vec::with_capacity(len),
            next_message: 1,
            abandoned: false,
        };
        let done = building.push(first);
        map.insert(id, Entry::Building(building));
        Ok(done)
    }

    /// Appends body message `message_number` to `id`. Returns whether all the
    /// data has arrived.
    ///
    /// A message number other than the next expected one abandons the GPADL.
    /// Its data is kept as it was, but it can no longer be appended to or
    /// completed.
    pub fn append(
        &self,
        id: GpadlId,
        message_number: u32,
        more: &[u64],
    ) -> Result<bool, GpadlError> {
        let mut map = self.map.lock();
        let entry = map.get_mut(&id).ok_or(GpadlError::UnknownId(id))?;
        let building = match entry {
            Entry::Building(building) => building,
            Entry::Created(_) => return Err(GpadlError::TooManyMessages(id)),
        };
        if building.abandoned {
            return Err(GpadlError::Abandoned(id));
        }
        if building.is_done() {
            return Err(GpadlError::TooManyMessages(id));
        }
        if message_number != building.next_message {
            building.abandoned = true;
            return Err(GpadlError::OutOfOrder {
                id,
                expected: building.next_message,
                actual: message_number,
            });
        }
        building.next_message += 1;
        Ok(building.push(more))
    }

    /// Validates the assembled ranges and publishes the GPADL.
    ///
    /// On failure the GPADL is removed, except when it is merely incomplete.
    pub fn complete(&self, id: GpadlId) -> Result<GpadlId, GpadlError> {
        let mut map = self.map.lock();
        let done = match map.get(&id) {
            None => return Err(GpadlError::UnknownId(id)),
            Some(Entry::Created(_)) => return Ok(id),
            Some(Entry::Building(building)) if building.abandoned => {
                return Err(GpadlError::Abandoned(id));
            }
            Some(Entry::Building(building)) => building.is_done(),
        };
        if !done {
            return Err(GpadlError::Incomplete(id));
        }
        let Some(Entry::Building(building)) = map.remove(&id) else {
            return Err(GpadlError::UnknownId(id));
        };
        let buf = MultiPagedRangeBuf::new(building.count.into(), building.buf)
            .map_err(|err| GpadlError::InvalidRanges(id, err))?;
        map.insert(
            id,
            Entry::Created(Arc::new(Gpadl {
                id,
                channel_id: building.channel_id,
                buf,
                map_count: Mutex::new(0),
            })),
        );
        Ok(id)
    }

    /// Binds a view of a created GPADL.
    pub fn view(&self, id: GpadlId) -> Result<GpadlView, GpadlError> {
        let map = self.map.lock();
        match map.get(&id) {
            None => Err(GpadlError::UnknownId(id)),
            Some(Entry::Created(gpadl)) => {
                *gpadl.map_count.lock() += 1;
                Ok(GpadlView(gpadl.clone()))
            }
            Some(Entry::Building(_)) => Err(GpadlError::NotCreated(id)),
        }
    }

    /// Removes `id`. Fails if a view of it is still bound, since the holder
    /// may still be accessing the memory.
    pub fn teardown(&self, id: GpadlId) -> Result<(), GpadlError> {
        let mut map = self.map.lock();
        let entry = map.get(&id).ok_or(GpadlError::UnknownId(id))?;
        if entry.in_use() {
            return Err(GpadlError::InUse(id));
        }
        map.remove(&id);
        Ok(())
    }

    /// Returns the channel `id` was created for.
    pub fn channel_id(&self, id: GpadlId) -> Option<ChannelId> {
        self.map.lock().get(&id).map(Entry::channel_id)
    }

    /// Returns the number of range buffer values received for `id`.
    pub fn accumulated(&self, id: GpadlId) -> Option<usize> {
        self.map.lock().get(&id).map(Entry::accumulated)
    }

    /// Drops every GPADL of `channel_id` that is not bound. Returns the
    /// removed ids.
    pub fn remove_channel(&self, channel_id: ChannelId) -> Vec<GpadlId> {
        let mut map = self.map.lock();
        let ids: Vec<_> = map
            .iter()
            .filter(|(_, entry)| entry.channel_id() == channel_id && !entry.in_use())
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            map.remove(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl Building {
    fn is_done(&self) -> bool {
        self.buf.len() == self.len
    }

    /// Appends data, ignoring anything past the declared length since some
    /// peers always send full messages.
    fn push(&mut self, data: &[u64]) -> bool {
        let n = data.len().min(self.len - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        self.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNEL: ChannelId = ChannelId(5);

    /// A single aligned range over `pages` pages starting at gpn 100.
    fn range_buffer(pages: u64) -> Vec<u64> {
        let mut buf = vec![pages * 4096];
        buf.extend(100..100 + pages);
        buf
    }

    #[test]
    fn test_single_message() {
        let table = GpadlTable::new();
        let buf = range_buffer(4);
        assert!(table
            .begin(GpadlId(1), CHANNEL, 1, buf.len() * 8, &buf)
            .unwrap());
        table.complete(GpadlId(1)).unwrap();
        let view = table.view(GpadlId(1)).unwrap();
        assert_eq!(view.id(), GpadlId(1));
        assert_eq!(view.channel_id(), CHANNEL);
        assert_eq!(view.first().unwrap().gpns(), &[100, 101, 102, 103]);
    }

    #[test]
    fn test_multiple_messages() {
        let table = GpadlTable::new();
        let buf = range_buffer(60);
        let len = buf.len() * 8;
        assert!(!table.begin(GpadlId(2), CHANNEL, 1, len, &buf[..27]).unwrap());
        assert!(matches!(
            table.complete(GpadlId(2)),
            Err(GpadlError::Incomplete(_))
        ));
        assert!(matches!(
            table.view(GpadlId(2)),
            Err(GpadlError::NotCreated(_))
        ));
        assert!(!table.append(GpadlId(2), 1, &buf[27..55]).unwrap());
        assert_eq!(table.accumulated(GpadlId(2)), Some(55));

        // Trailing data past the declared length is ignored.
        let mut last = buf[55..].to_vec();
        last.extend([0xdead; 4]);
        assert!(table.append(GpadlId(2), 2, &last).unwrap());
        assert_eq!(table.accumulated(GpadlId(2)), Some(61));
        table.complete(GpadlId(2)).unwrap();
        assert_eq!(table.view(GpadlId(2)).unwrap().range_buffer(), &buf[..]);
    }

    #[test]
    fn test_duplicate_id() {
        let table = GpadlTable::new();
        let buf = range_buffer(1);
        table.begin(GpadlId(3), CHANNEL, 1, 16, &buf).unwrap();
        assert!(matches!(
            table.begin(GpadlId(3), CHANNEL, 1, 16, &buf),
            Err(GpadlError::DuplicateId(GpadlId(3)))
        ));
    }

    #[test]
    fn test_out_of_order_abandons() {
        let table = GpadlTable::new();
        let buf = range_buffer(60);
        table
            .begin(GpadlId(4), CHANNEL, 1, buf.len() * 8, &buf[..27])
            .unwrap();
        assert!(matches!(
            table.append(GpadlId(4), 2, &buf[27..55]),
            Err(GpadlError::OutOfOrder {
                expected: 1,
                actual: 2,
                ..
            })
        ));
        // The handle is dead, and its data is unchanged.
        assert_eq!(table.accumulated(GpadlId(4)), Some(27));
        assert!(matches!(
            table.append(GpadlId(4), 1, &buf[27..55]),
            Err(GpadlError::Abandoned(_))
        ));
        assert!(matches!(
            table.complete(GpadlId(4)),
            Err(GpadlError::Abandoned(_))
        ));
        table.teardown(GpadlId(4)).unwrap();
    }

    #[test]
    fn test_duplicate_message_abandons() {
        let table = GpadlTable::new();
        let buf = range_buffer(60);
        table
            .begin(GpadlId(4), CHANNEL, 1, buf.len() * 8, &buf[..27])
            .unwrap();
        table.append(GpadlId(4), 1, &buf[27..55]).unwrap();
        assert!(matches!(
            table.append(GpadlId(4), 1, &buf[27..55]),
            Err(GpadlError::OutOfOrder { .. })
        ));
        assert_eq!(table.accumulated(GpadlId(4)), Some(55));
    }

    #[test]
    fn test_invalid_ranges() {
        let table = GpadlTable::new();
        // Claims two ranges but holds one.
        let buf = range_buffer(2);
        table
            .begin(GpadlId(6), CHANNEL, 2, buf.len() * 8, &buf)
            .unwrap();
        assert!(matches!(
            table.complete(GpadlId(6)),
            Err(GpadlError::InvalidRanges(..))
        ));
        assert!(table.is_empty());

        assert!(matches!(
            table.begin(GpadlId(7), CHANNEL, 1, 12, &buf),
            Err(GpadlError::InvalidLength(12))
        ));
    }

    #[test]
    fn test_teardown_while_bound() {
        let table = GpadlTable::new();
        let buf = range_buffer(4);
        table
            .begin(GpadlId(7), CHANNEL, 1, buf.len() * 8, &buf)
            .unwrap();
        table.complete(GpadlId(7)).unwrap();
        let view = table.view(GpadlId(7)).unwrap();
        let view2 = view.clone();
        assert!(matches!(
            table.teardown(GpadlId(7)),
            Err(GpadlError::InUse(_))
        ));
        drop(view);
        assert!(matches!(
            table.teardown(GpadlId(7)),
            Err(GpadlError::InUse(_))
        ));
        drop(view2);
        table.teardown(GpadlId(7)).unwrap();
        assert!(matches!(
            table.view(GpadlId(7)),
            Err(GpadlError::UnknownId(_))
        ));
    }

    #[test]
    fn test_remove_channel() {
        let table = GpadlTable::new();
        let buf = range_buffer(1);
        for id in 1..=3 {
            table
                .begin(GpadlId(id), CHANNEL, 1, buf.len() * 8, &buf)
                .unwrap();
            table.complete(GpadlId(id)).unwrap();
        }
        table
            .begin(GpadlId(4), ChannelId(6), 1, buf.len() * 8, &buf)
            .unwrap();
        let _view = table.view(GpadlId(2)).unwrap();
        let mut removed = table.remove_channel(CHANNEL);
        removed.sort();
        assert_eq!(removed, [GpadlId(1), GpadlId(3)]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.channel_id(GpadlId(4)), Some(ChannelId(6)));
    }
}
