// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types shared by both ends of the VMBus control plane: the wire protocol,
//! version negotiation results, and the control message transport.

#![forbid(unsafe_code)]

pub mod guid;
pub mod protocol;

use parking_lot::Mutex;
use protocol::MessageHeader;
use protocol::VmbusMessage;
use protocol::HEADER_SIZE;
use protocol::MAX_MESSAGE_SIZE;
use std::collections::VecDeque;
use std::str::FromStr;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Represents information about a negotiated version.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: protocol::Version,
    pub feature_flags: protocol::FeatureFlags,
}

impl VersionInfo {
    /// Returns whether the negotiated version defines feature flags at all.
    /// Before Copper the field does not exist, so no flag can be read.
    pub fn defines_feature_flags(&self) -> bool {
        self.version >= protocol::Version::Copper
    }
}

/// Limits the version and features that may be negotiated.
#[derive(Copy, Clone, Debug)]
pub struct MaxVersionInfo {
    pub version: u32,
    pub feature_flags: protocol::FeatureFlags,
}

impl MaxVersionInfo {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            feature_flags: protocol::FeatureFlags::new(),
        }
    }
}

impl Default for MaxVersionInfo {
    fn default() -> Self {
        Self {
            version: protocol::Version::Copper as u32,
            feature_flags: protocol::FeatureFlags::all(),
        }
    }
}

impl From<VersionInfo> for MaxVersionInfo {
    fn from(info: VersionInfo) -> Self {
        Self {
            version: info.version as u32,
            feature_flags: info.feature_flags,
        }
    }
}

/// Parses a string of the form "major.minor" (e.g "5.3") into a vmbus
/// version number.
///
/// N.B. This doesn't check whether the specified version actually exists.
pub fn parse_vmbus_version(value: &str) -> Result<u32, String> {
    || -> Option<u32> {
        let (major, minor) = value.split_once('.')?;
        let major = u16::from_str(major).ok()?;
        let minor = u16::from_str(minor).ok()?;
        Some(protocol::make_version(major, minor))
    }()
    .ok_or_else(|| format!("invalid vmbus version '{}'", value))
}

/// A control message ready to be posted.
#[derive(Clone)]
pub struct OutgoingMessage {
    data: [u8; MAX_MESSAGE_SIZE],
    len: u8,
}

impl OutgoingMessage {
    /// Creates a message for `message`, with the header filled in.
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        let mut data = [0; MAX_MESSAGE_SIZE];
        let header = MessageHeader::new(T::MESSAGE_TYPE);
        let message_bytes = message.as_bytes();
        let len = HEADER_SIZE + message_bytes.len();
        data[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        data[HEADER_SIZE..len].copy_from_slice(message_bytes);
        Self {
            data,
            len: len as u8,
        }
    }

    /// Creates a message for `message` followed by `data`, as used by the
    /// GPADL messages.
    ///
    /// Panics if the result does not fit in a message. Callers size `data`
    /// with the message's `MAX_DATA_VALUES`.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Self {
        let mut message = OutgoingMessage::new(message);
        let old_len = message.len as usize;
        let len = old_len + data.len();
        message.data[old_len..len].copy_from_slice(data);
        message.len = len as u8;
        message
    }

    /// Gets the binary representation of the message.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("len", &self.len)
            .field("data", &self.data())
            .finish()
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

/// The ordered, reliable transport for control messages.
///
/// On Hyper-V this is the SynIC message port; in-process it is a
/// [`MessageQueue`].
pub trait MessageSink: Send + Sync {
    /// Posts a message to the opposite endpoint.
    fn post_message(&self, message: OutgoingMessage);
}

/// An in-memory [`MessageSink`] that queues messages until they are popped.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<OutgoingMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the oldest queued message.
    pub fn pop(&self) -> Option<OutgoingMessage> {
        self.messages.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl MessageSink for MessageQueue {
    fn post_message(&self, message: OutgoingMessage) {
        self.messages.lock().push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelId;
    use crate::protocol::GpadlId;

    #[test]
    fn test_outgoing_message() {
        let message = OutgoingMessage::new(&protocol::RelIdReleased {
            channel_id: ChannelId(0x21),
        });

        assert_eq!(&[0xd, 0, 0, 0, 0, 0, 0, 0, 0x21, 0, 0, 0], message.data())
    }

    #[test]
    fn test_outgoing_message_empty() {
        let message = OutgoingMessage::new(&protocol::AllOffersDelivered {});

        assert_eq!(&[0x4, 0, 0, 0, 0, 0, 0, 0], message.data())
    }

    #[test]
    fn test_outgoing_message_with_data() {
        let message = OutgoingMessage::with_data(
            &protocol::GpadlBody {
                message_number: 2,
                gpadl_id: GpadlId(7),
            },
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
        );

        assert_eq!(
            &[
                0x9, 0, 0, 0, 0, 0, 0, 0, 0x2, 0, 0, 0, 0x7, 0, 0, 0, 0x11, 0x22, 0x33, 0x44, 0x55,
                0x66, 0x77, 0x88
            ],
            message.data()
        )
    }

    #[test]
    fn test_message_queue_order() {
        let queue = MessageQueue::new();
        queue.post_message(OutgoingMessage::new(&protocol::RequestOffers {}));
        queue.post_message(OutgoingMessage::new(&protocol::Unload {}));
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.pop().unwrap(),
            OutgoingMessage::new(&protocol::RequestOffers {})
        );
        assert_eq!(
            queue.pop().unwrap(),
            OutgoingMessage::new(&protocol::Unload {})
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_parse_vmbus_version() {
        assert_eq!(parse_vmbus_version("5.3"), Ok(protocol::Version::Iron as u32));
        assert_eq!(parse_vmbus_version("0.13"), Ok(protocol::Version::V1 as u32));
        assert!(parse_vmbus_version("6").is_err());
        assert!(parse_vmbus_version("x.1").is_err());
    }
}
