// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VMBus control message definitions.

use crate::guid::Guid;
use crate::VersionInfo;
use bitfield_struct::bitfield;
use std::ops::BitAnd;
use std::ops::BitOr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = 0x8000ffff_u32 as i32;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

/// The payload size of a hypervisor synthetic interrupt message.
pub const MAX_MESSAGE_SIZE: usize = 240;

/// The number of bytes of device-specific data in offers and open requests.
pub const MAX_USER_DEFINED_BYTES: usize = 120;

// This table defines the MessageType constants, the Message enum with its
// parse method, and the VmbusMessage impls.
//
// Syntax: number name { struct min_version [options],* },*
//
// A message with several layouts lists one struct per layout, newest first;
// the first whose conditions hold is used. A min_version of 0 means the
// message is accepted before a version is negotiated.
//
// Options:
// - features: one or more feature flags, at least one of which must have
//             been negotiated.
// - check_size: only match if the message is at least the size of the
//               struct, otherwise fall through to the next layout. Without
//               this, a short message is a parse failure.
vmbus_messages! {
    pub enum Message, MessageType {
        1 OFFER_CHANNEL { OfferChannel V1 },
        2 RESCIND_CHANNEL_OFFER { RescindChannelOffer V1 },
        3 REQUEST_OFFERS { RequestOffers V1 },
        4 ALL_OFFERS_DELIVERED { AllOffersDelivered V1 },
        5 OPEN_CHANNEL {
            OpenChannel2 Copper features:(guest_specified_signal_parameters | channel_interrupt_redirection),
            OpenChannel V1
        },
        6 OPEN_CHANNEL_RESULT { OpenResult V1 },
        7 CLOSE_CHANNEL { CloseChannel V1 },
        8 GPADL_HEADER { GpadlHeader V1 },
        9 GPADL_BODY { GpadlBody V1 },
        10 GPADL_CREATED { GpadlCreated V1 },
        11 GPADL_TEARDOWN { GpadlTeardown V1 },
        12 GPADL_TORNDOWN { GpadlTorndown V1 },
        13 REL_ID_RELEASED { RelIdReleased V1 },
        14 INITIATE_CONTACT {
            // The version is not known yet when contact is initiated, so the
            // longer layout can only be told apart by its size.
            InitiateContact2 0 check_size:true,
            InitiateContact 0
        },
        15 VERSION_RESPONSE {
            VersionResponse2 0 check_size:true,
            VersionResponse 0
        },
        16 UNLOAD { Unload V1 },
        17 UNLOAD_COMPLETE { UnloadComplete Win7 },
        22 MODIFY_CHANNEL { ModifyChannel Win10Rs3_0 },
        24 MODIFY_CHANNEL_RESPONSE { ModifyChannelResponse Iron },
    }
}

/// An error parsing a control message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The message is shorter than its message type requires.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is unknown, or not defined by the negotiated version
    /// and features.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Implemented by every control message struct.
pub trait VmbusMessage: Sized {
    /// The message type for the struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header of a control message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct FeatureFlags {
    /// The guest chooses the connection ID and event flag when opening a
    /// channel, instead of using the ones from the offer.
    pub guest_specified_signal_parameters: bool,

    /// The `redirect_interrupt` open flag is understood.
    pub channel_interrupt_redirection: bool,

    /// ModifyConnection is understood.
    pub modify_connection: bool,

    /// The guest identifies itself with a client ID in InitiateContact.
    pub client_id: bool,

    /// The confidential offer flags are understood.
    pub confidential_channels: bool,

    #[bits(27)]
    _reserved: u32,
}

impl FeatureFlags {
    pub const fn all() -> Self {
        Self::new()
            .with_guest_specified_signal_parameters(true)
            .with_channel_interrupt_redirection(true)
            .with_modify_connection(true)
            .with_client_id(true)
            .with_confidential_channels(true)
    }
}

impl BitAnd for FeatureFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        (self.into_bits() & rhs.into_bits()).into()
    }
}

impl BitOr for FeatureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        (self.into_bits() | rhs.into_bits()).into()
    }
}

/// A GPADL handle, unique within a connection.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

/// A channel relid, assigned by the host when the channel is offered.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

/// The target of a guest-to-host signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Formats the connection ID the host uses for a channel.
    pub fn new(channel_id: u32, vtl: u8, sint: u8) -> Self {
        Self(channel_id | (sint as u32) << 12 | (vtl as u32) << 16)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    pub interrupt_page_or_target_info: u64, // sint, vtl, _, feature flags
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

/// InitiateContact with the client ID, sent by guests requesting Copper or
/// later.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact2 {
    pub initiate_contact: InitiateContact,
    pub client_id: Guid,
}

impl From<InitiateContact> for InitiateContact2 {
    fn from(value: InitiateContact) -> Self {
        Self {
            initiate_contact: value,
            ..FromZeros::new_zeroed()
        }
    }
}

/// Interprets `InitiateContact::interrupt_page_or_target_info`.
#[bitfield(u64)]
pub struct TargetInfo {
    pub sint: u8,
    pub vtl: u8,
    pub _padding: u16,
    pub feature_flags: u32,
}

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1 = make_version(0, 13),
    Win7 = make_version(1, 1),
    Win8 = make_version(2, 4),
    Win8_1 = make_version(3, 0),
    Win10 = make_version(4, 0),
    Win10Rs3_0 = make_version(4, 1),
    Win10Rs3_1 = make_version(5, 0),
    Win10Rs4 = make_version(5, 1),
    Win10Rs5 = make_version(5, 2),
    Iron = make_version(5, 3),
    Copper = make_version(6, 0),
}

impl Version {
    /// Every known version, oldest first.
    pub const ALL: [Version; 11] = [
        Version::V1,
        Version::Win7,
        Version::Win8,
        Version::Win8_1,
        Version::Win10,
        Version::Win10Rs3_0,
        Version::Win10Rs3_1,
        Version::Win10Rs4,
        Version::Win10Rs5,
        Version::Iron,
        Version::Copper,
    ];

    pub fn major(self) -> u16 {
        (self as u32 >> 16) as u16
    }

    pub fn minor(self) -> u16 {
        self as u32 as u16
    }
}

impl TryFrom<u32> for Version {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|v| *v as u32 == value)
            .ok_or(value)
    }
}

/// The `VersionResponse::connection_state` field.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ConnectionState(pub u8);

impl ConnectionState {
    pub const SUCCESSFUL: Self = Self(0);
    pub const FAILED_LOW_RESOURCES: Self = Self(1);
    pub const FAILED_UNKNOWN_FAILURE: Self = Self(2);
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: ConnectionState,
    pub padding: u16,
    pub selected_version_or_connection_id: u32,
}

/// VersionResponse with the host's feature flags. Only sent when the
/// requested version is Copper or later and is supported.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse2 {
    pub version_response: VersionResponse,
    pub supported_features: u32,
}

impl From<VersionResponse> for VersionResponse2 {
    fn from(value: VersionResponse) -> Self {
        Self {
            version_response: value,
            ..FromZeros::new_zeroed()
        }
    }
}

/// Device-defined bytes carried in an offer or open request.
#[repr(C, align(4))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UserDefinedData(pub [u8; MAX_USER_DEFINED_BYTES]);

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl From<[u8; MAX_USER_DEFINED_BYTES]> for UserDefinedData {
    fn from(value: [u8; MAX_USER_DEFINED_BYTES]) -> Self {
        Self(value)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    pub connection_id: u32,
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    pub enumerate_device_interface: bool, // 0x1
    /// The ring buffer must be in encrypted memory on an isolated VM.
    pub confidential_ring_buffer: bool, // 0x2
    /// Additional GPADLs and GPA direct ranges must be in encrypted memory.
    pub confidential_external_memory: bool, // 0x4
    #[bits(1)]
    _reserved1: u16,
    pub named_pipe_mode: bool, // 0x10
    #[bits(8)]
    _reserved2: u16,
    pub tlnpi_provider: bool, // 0x2000
    #[bits(2)]
    _reserved3: u16,
}

impl OfferFlags {
    /// The flags a peer understands at `version`. Bits outside this set are
    /// masked off before an offer is sent or interpreted.
    pub fn defined_for(version: VersionInfo) -> Self {
        let mut flags = Self::new()
            .with_enumerate_device_interface(true)
            .with_named_pipe_mode(true);
        if version.version >= Version::Win10 {
            flags.set_tlnpi_provider(true);
        }
        if version.version >= Version::Copper && version.feature_flags.confidential_channels() {
            flags.set_confidential_ring_buffer(true);
            flags.set_confidential_external_memory(true);
        }
        flags
    }
}

impl BitAnd for OfferFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        (self.into_bits() & rhs.into_bits()).into()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    /// The byte length of the range buffer.
    pub len: u16,
    /// The number of ranges.
    pub count: u16,
}

impl GpadlHeader {
    /// The maximum number of range buffer values that fit after the header.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    /// The message number within the GPADL. The header is message 0.
    pub message_number: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// The maximum number of range buffer values that fit after the body.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    /// The page offset of the host-to-guest ring within the GPADL.
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OpenChannelFlags {
    /// Deliver the host-to-guest interrupt to the redirected SINT.
    pub redirect_interrupt: bool,

    #[bits(15)]
    pub unused: u16,
}

/// OpenChannel with guest-chosen signal parameters. Only parsed when
/// `guest_specified_signal_parameters` or `channel_interrupt_redirection` has
/// been negotiated.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel2 {
    pub open_channel: OpenChannel,

    // guest_specified_signal_parameters
    pub connection_id: u32,
    pub event_flag: u16,

    // channel_interrupt_redirection
    pub flags: OpenChannelFlags,
}

impl From<OpenChannel> for OpenChannel2 {
    fn from(value: OpenChannel) -> Self {
        Self {
            open_channel: value,
            ..FromZeros::new_zeroed()
        }
    }
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ModifyChannel {
    pub channel_id: ChannelId,
    pub target_vp: u32,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ModifyChannelResponse {
    pub channel_id: ChannelId,
    pub status: i32,
}

// Empty messages still get structs so that every message goes through
// VmbusMessage.

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestOffers {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AllOffersDelivered {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Unload {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UnloadComplete {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutgoingMessage;

    fn v1() -> Option<VersionInfo> {
        Some(VersionInfo {
            version: Version::V1,
            feature_flags: FeatureFlags::new(),
        })
    }

    fn copper() -> Option<VersionInfo> {
        Some(VersionInfo {
            version: Version::Copper,
            feature_flags: FeatureFlags::all(),
        })
    }

    fn open_channel2() -> OpenChannel2 {
        OpenChannel2 {
            open_channel: OpenChannel {
                channel_id: ChannelId(3),
                open_id: 1,
                ring_buffer_gpadl_id: GpadlId(9),
                target_vp: 0,
                downstream_ring_buffer_page_offset: 2,
                user_data: UserDefinedData::default(),
            },
            connection_id: 0x4444,
            event_flag: 12,
            flags: OpenChannelFlags::new(),
        }
    }

    #[test]
    fn test_sizes() {
        assert_eq!(size_of::<OfferChannel>(), 188);
        assert_eq!(size_of::<OpenChannel>(), 140);
        assert_eq!(size_of::<OpenChannel2>(), 148);
        assert_eq!(size_of::<InitiateContact>(), 32);
        assert_eq!(GpadlHeader::MAX_DATA_VALUES, 27);
        assert_eq!(GpadlBody::MAX_DATA_VALUES, 28);
    }

    #[test]
    fn test_open_channel_gated_by_version() {
        let message = OutgoingMessage::new(&open_channel2());

        // Copper with the feature parses the long form.
        match Message::parse(message.data(), copper()).unwrap() {
            Message::OpenChannel2(open, rest) => {
                assert_eq!(open.connection_id, 0x4444);
                assert!(rest.is_empty());
            }
            msg => panic!("unexpected {msg:?}"),
        }

        // V1 only knows the short form; the Copper fields are left
        // uninterpreted.
        match Message::parse(message.data(), v1()).unwrap() {
            Message::OpenChannel(open, rest) => {
                assert_eq!(open.channel_id, ChannelId(3));
                assert_eq!(rest.len(), 8);
            }
            msg => panic!("unexpected {msg:?}"),
        }
    }

    #[test]
    fn test_message_not_defined_for_version() {
        let message = OutgoingMessage::new(&ModifyChannelResponse {
            channel_id: ChannelId(1),
            status: STATUS_SUCCESS,
        });
        assert!(matches!(
            Message::parse(message.data(), v1()),
            Err(ParseError::InvalidMessageType(MessageType::MODIFY_CHANNEL_RESPONSE))
        ));
        assert!(matches!(
            Message::parse(message.data(), copper()),
            Ok(Message::ModifyChannelResponse(..))
        ));
    }

    #[test]
    fn test_disconnected_parse() {
        let message = OutgoingMessage::new(&RequestOffers {});
        assert!(matches!(
            Message::parse(message.data(), None),
            Err(ParseError::InvalidMessageType(MessageType::REQUEST_OFFERS))
        ));

        let contact = OutgoingMessage::new(&InitiateContact {
            version_requested: Version::Win10 as u32,
            target_message_vp: 0,
            interrupt_page_or_target_info: 0,
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        });
        let msg = Message::parse(contact.data(), None).unwrap();
        assert_eq!(msg.message_type(), MessageType::INITIATE_CONTACT);
        assert!(matches!(msg, Message::InitiateContact(..)));
    }

    #[test]
    fn test_short_message() {
        let message = OutgoingMessage::new(&GpadlTorndown {
            gpadl_id: GpadlId(1),
        });
        assert!(matches!(
            Message::parse(&message.data()[..6], v1()),
            Err(ParseError::MessageTooSmall(None))
        ));
        assert!(matches!(
            Message::parse(&message.data()[..10], v1()),
            Err(ParseError::MessageTooSmall(Some(MessageType::GPADL_TORNDOWN)))
        ));
    }

    #[test]
    fn test_offer_flags_for_version() {
        let flags = OfferFlags::new()
            .with_named_pipe_mode(true)
            .with_tlnpi_provider(true)
            .with_confidential_ring_buffer(true);

        let masked = flags & OfferFlags::defined_for(v1().unwrap());
        assert!(masked.named_pipe_mode());
        assert!(!masked.tlnpi_provider());
        assert!(!masked.confidential_ring_buffer());

        let masked = flags & OfferFlags::defined_for(copper().unwrap());
        assert_eq!(masked, flags);
    }

    #[test]
    fn test_version_from_u32() {
        assert_eq!(Version::try_from(make_version(5, 3)), Ok(Version::Iron));
        assert_eq!(Version::try_from(make_version(5, 4)), Err(0x50004));
        assert_eq!(Version::Win10Rs3_0.major(), 4);
        assert_eq!(Version::Win10Rs3_0.minor(), 1);
    }
}
