// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guest side of the vmbus control plane.
//!
//! [`Client`] negotiates the protocol version with the host, tracks offered
//! channels, builds GPADLs and opens channels. Requests go out through a
//! [`MessageSink`]; the host's replies are fed back one at a time through
//! [`Client::handle_message`], which reports what happened as a
//! [`ClientEvent`].

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use vmbus_channel::directory::ChannelDirectory;
use vmbus_channel::directory::DirectoryError;
use vmbus_channel::directory::FeatureFlag;
use vmbus_channel::gpadl::GpadlError;
use vmbus_channel::gpadl::GpadlTable;
use vmbus_channel::gpadl_ring;
use vmbus_channel::gpadl_ring::GpadlRings;
use vmbus_channel::memory::GuestMemory;
use vmbus_channel::memory::GuestMemoryError;
use vmbus_channel::signal::SignalTarget;
use vmbus_channel::signal::SignalTransport;
use vmbus_channel::state::ChannelState;
use vmbus_channel::state::InvalidTransition;
use vmbus_channel::Channel;
use vmbus_channel::ChannelHandle;
use vmbus_channel::GpadlChannel;
use vmbus_core::guid::Guid;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::Version;
use vmbus_core::protocol::VmbusMessage;
use vmbus_core::MaxVersionInfo;
use vmbus_core::MessageSink;
use vmbus_core::OutgoingMessage;
use vmbus_core::VersionInfo;
use vmbus_ring::gparange;
use vmbus_ring::PAGE_SIZE;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const SINT: u8 = 2;
const VTL: u8 = 0;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to parse message")]
    Parse(#[from] protocol::ParseError),
    #[error("unexpected message {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("the host supports none of the requested versions")]
    NoSupportedVersions,
    #[error("the host failed the connection: {0:?}")]
    FailedToConnect(ConnectionState),
    #[error("{0:?} is not supported by the negotiated version")]
    UnsupportedByVersion(MessageType),
    #[error("unknown channel id {0:?}")]
    UnknownChannel(ChannelId),
    #[error("channel {0:?} was rescinded")]
    ChannelRescinded(ChannelId),
    #[error("channel {0:?} is not open")]
    ChannelNotOpen(ChannelId),
    #[error("unknown gpadl {0:?}")]
    UnknownGpadl(GpadlId),
    #[error("gpadl {0:?} is not created")]
    GpadlNotCreated(GpadlId),
    #[error("invalid gpadl page list")]
    InvalidGpadlPages,
    #[error("channel directory error")]
    Directory(#[from] DirectoryError),
    #[error("invalid channel state")]
    State(#[from] InvalidTransition),
    #[error("gpadl error")]
    Gpadl(#[from] GpadlError),
    #[error("guest memory error")]
    Memory(#[from] GuestMemoryError),
    #[error("failed to map channel rings")]
    Ring(#[from] gpadl_ring::Error),
}

/// Parameters for connecting to the host.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// The VP the host sends control messages to.
    pub target_message_vp: u32,
    /// Identifies this client to the host. Sent at Copper and later.
    pub client_id: Guid,
    /// The features to request. Limited by the client's maximum version info.
    pub feature_flags: FeatureFlags,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self {
            target_message_vp: 0,
            client_id: Guid::ZERO,
            feature_flags: FeatureFlags::all(),
        }
    }
}

/// Parameters for opening a channel.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// A created GPADL holding both rings.
    pub ring_gpadl_id: GpadlId,
    /// The page within the GPADL where the host-to-guest ring starts.
    pub downstream_ring_buffer_page_offset: u32,
    pub target_vp: u32,
    pub user_data: UserDefinedData,
    /// Where to signal the host. Only honored when guest-specified signal
    /// parameters were negotiated; otherwise the offer's connection ID is
    /// used.
    pub guest_signal: Option<SignalTarget>,
}

impl OpenRequest {
    pub fn new(ring_gpadl_id: GpadlId, downstream_ring_buffer_page_offset: u32) -> Self {
        Self {
            ring_gpadl_id,
            downstream_ring_buffer_page_offset,
            target_vp: 0,
            user_data: UserDefinedData::default(),
            guest_signal: None,
        }
    }
}

/// Something the host told the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected(VersionInfo),
    Offer {
        channel_id: ChannelId,
        interface_id: Guid,
        instance_id: Guid,
    },
    OffersDelivered,
    /// The host rescinded a channel. If `released` is false the channel was
    /// in use, and must be released with [`Client::release_channel`].
    Rescinded {
        channel_id: ChannelId,
        released: bool,
    },
    GpadlCreated {
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        status: i32,
    },
    Opened(ChannelId),
    OpenFailed {
        channel_id: ChannelId,
        status: u32,
    },
    GpadlTorndown(GpadlId),
    ModifyChannelResponse {
        channel_id: ChannelId,
        status: i32,
    },
    Unloaded,
}

#[derive(Debug)]
enum ClientState {
    Disconnected,
    Connecting {
        version: Version,
        request: ConnectRequest,
    },
    Connected {
        offers_delivered: bool,
    },
    Unloading,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum GpadlState {
    Creating,
    Created,
    TearingDown,
}

#[derive(Debug, Default)]
struct ClientChannel {
    handle: Option<ChannelHandle>,
    /// The guest end of the rings, until taken.
    channel: Option<GpadlChannel>,
}

impl ClientChannel {
    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.begin_close();
            handle.finish_close();
        }
        self.channel = None;
    }
}

/// The guest end of a vmbus connection.
pub struct Client {
    max_version: MaxVersionInfo,
    sink: Arc<dyn MessageSink>,
    mem: GuestMemory,
    signal: Arc<dyn SignalTransport>,
    state: ClientState,
    version: Option<VersionInfo>,
    directory: ChannelDirectory,
    channels: HashMap<ChannelId, ClientChannel>,
    gpadls: HashMap<GpadlId, (ChannelId, GpadlState)>,
    /// The guest's own view of its GPADLs, used to map channel rings.
    table: GpadlTable,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("version", &self.version)
            .field("channels", &self.directory.len())
            .finish()
    }
}

impl Client {
    pub fn new(
        max_version: MaxVersionInfo,
        sink: Arc<dyn MessageSink>,
        mem: GuestMemory,
        signal: Arc<dyn SignalTransport>,
    ) -> Self {
        Self {
            max_version,
            sink,
            mem,
            signal,
            state: ClientState::Disconnected,
            version: None,
            directory: ChannelDirectory::new(),
            channels: HashMap::new(),
            gpadls: HashMap::new(),
            table: GpadlTable::new(),
        }
    }

    /// The negotiated version, once connected.
    pub fn version(&self) -> Option<VersionInfo> {
        self.version
    }

    /// Returns whether all offers present at connect time have arrived.
    pub fn offers_delivered(&self) -> bool {
        matches!(
            self.state,
            ClientState::Connected {
                offers_delivered: true
            }
        )
    }

    /// The channels offered by the host.
    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    pub fn channel_state(&self, channel_id: ChannelId) -> Option<ChannelState> {
        self.directory
            .find_by_relid(channel_id)
            .map(|entry| entry.state)
    }

    fn send<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(&self, message: &T) {
        self.sink.post_message(OutgoingMessage::new(message));
    }

    fn send_with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        &self,
        message: &T,
        data: &[u64],
    ) {
        self.sink
            .post_message(OutgoingMessage::with_data(message, data.as_bytes()));
    }

    fn connected_version(&self) -> Result<VersionInfo, ClientError> {
        match self.state {
            ClientState::Connected { .. } => self.version.ok_or(ClientError::NotConnected),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Starts connecting, requesting the newest version allowed by the
    /// client's maximum.
    pub fn connect(&mut self, request: ConnectRequest) -> Result<(), ClientError> {
        if !matches!(self.state, ClientState::Disconnected) {
            return Err(ClientError::AlreadyConnected);
        }
        let version = Version::ALL
            .into_iter()
            .rev()
            .find(|v| *v as u32 <= self.max_version.version)
            .ok_or(ClientError::NoSupportedVersions)?;
        self.initiate_contact(version, &request);
        self.state = ClientState::Connecting { version, request };
        Ok(())
    }

    fn initiate_contact(&self, version: Version, request: &ConnectRequest) {
        let feature_flags = if version >= Version::Copper {
            request.feature_flags & self.max_version.feature_flags
        } else {
            FeatureFlags::new()
        };
        // Before Win10Rs3_1 this field held the interrupt page, which is not
        // used.
        let target_info = if version >= Version::Win10Rs3_1 {
            protocol::TargetInfo::new()
                .with_sint(SINT)
                .with_vtl(VTL)
                .with_feature_flags(feature_flags.into_bits())
                .into_bits()
        } else {
            0
        };
        let contact = protocol::InitiateContact {
            version_requested: version as u32,
            target_message_vp: request.target_message_vp,
            interrupt_page_or_target_info: target_info,
            parent_to_child_monitor_page_gpa: 0,
            child_to_parent_monitor_page_gpa: 0,
        };
        tracing::debug!(version = ?version, "initiating contact");
        if version >= Version::Copper {
            self.send(&protocol::InitiateContact2 {
                initiate_contact: contact,
                client_id: request.client_id,
            });
        } else {
            self.send(&contact);
        }
    }

    /// Handles a control message from the host.
    pub fn handle_message(&mut self, data: &[u8]) -> Result<Option<ClientEvent>, ClientError> {
        let result = self.handle_message_inner(data);
        if let Err(err) = &result {
            tracing::warn!(
                error = err as &dyn std::error::Error,
                "failed to handle host message"
            );
        }
        result
    }

    fn handle_message_inner(&mut self, data: &[u8]) -> Result<Option<ClientEvent>, ClientError> {
        let message = Message::parse(data, self.version)?;
        tracing::trace!(?message, "received vmbus message");
        match message {
            Message::VersionResponse2(input, _) => self.handle_version_response(&input),
            Message::VersionResponse(input, _) => self.handle_version_response(&input.into()),
            Message::OfferChannel(input, _) => self.handle_offer(&input),
            Message::AllOffersDelivered(..) => self.handle_offers_delivered(),
            Message::RescindChannelOffer(input, _) => self.handle_rescind(input.channel_id),
            Message::GpadlCreated(input, _) => self.handle_gpadl_created(&input),
            Message::OpenResult(input, _) => self.handle_open_result(&input),
            Message::GpadlTorndown(input, _) => self.handle_gpadl_torndown(input.gpadl_id),
            Message::ModifyChannelResponse(input, _) => {
                Ok(Some(ClientEvent::ModifyChannelResponse {
                    channel_id: input.channel_id,
                    status: input.status,
                }))
            }
            Message::UnloadComplete(..) => self.handle_unload_complete(),
            message => Err(ClientError::UnexpectedMessage(message.message_type())),
        }
    }

    fn handle_version_response(
        &mut self,
        input: &protocol::VersionResponse2,
    ) -> Result<Option<ClientEvent>, ClientError> {
        let ClientState::Connecting { version, request } =
            std::mem::replace(&mut self.state, ClientState::Disconnected)
        else {
            return Err(ClientError::UnexpectedMessage(MessageType::VERSION_RESPONSE));
        };
        let response = &input.version_response;
        if response.version_supported == 0 {
            let Some(next_version) = Version::ALL
                .into_iter()
                .rev()
                .find(|v| *v < version)
            else {
                return Err(ClientError::NoSupportedVersions);
            };
            tracing::debug!(
                version = ?version,
                next_version = ?next_version,
                "unsupported version, retrying"
            );
            self.initiate_contact(next_version, &request);
            self.state = ClientState::Connecting {
                version: next_version,
                request,
            };
            return Ok(None);
        }

        if response.connection_state != ConnectionState::SUCCESSFUL {
            return Err(ClientError::FailedToConnect(response.connection_state));
        }

        let feature_flags = if version >= Version::Copper {
            request.feature_flags
                & self.max_version.feature_flags
                & FeatureFlags::from(input.supported_features)
        } else {
            FeatureFlags::new()
        };
        let version = VersionInfo {
            version,
            feature_flags,
        };
        self.version = Some(version);
        self.directory.set_version(Some(version));
        self.state = ClientState::Connected {
            offers_delivered: false,
        };
        self.send(&protocol::RequestOffers {});
        tracing::info!(?version, "vmbus client connected, requesting offers");
        Ok(Some(ClientEvent::Connected(version)))
    }

    fn handle_offer(
        &mut self,
        offer: &protocol::OfferChannel,
    ) -> Result<Option<ClientEvent>, ClientError> {
        self.connected_version()?;
        self.directory.offer_message(offer)?;
        self.channels
            .insert(offer.channel_id, ClientChannel::default());
        Ok(Some(ClientEvent::Offer {
            channel_id: offer.channel_id,
            interface_id: offer.interface_id,
            instance_id: offer.instance_id,
        }))
    }

    fn handle_offers_delivered(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        let ClientState::Connected { offers_delivered } = &mut self.state else {
            return Err(ClientError::UnexpectedMessage(
                MessageType::ALL_OFFERS_DELIVERED,
            ));
        };
        *offers_delivered = true;
        tracing::info!(offers = self.directory.len(), "all offers delivered");
        Ok(Some(ClientEvent::OffersDelivered))
    }

    fn handle_rescind(&mut self, channel_id: ChannelId) -> Result<Option<ClientEvent>, ClientError> {
        let old_state = self
            .channel_state(channel_id)
            .ok_or(ClientError::UnknownChannel(channel_id))?;
        self.directory.rescind(channel_id)?;
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            if let Some(handle) = &channel.handle {
                handle.rescind();
            }
            if old_state == ChannelState::Opening {
                // The open will never be used.
                channel.channel = None;
            }
        }

        // A channel that is not in use can be released right away.
        let released = matches!(old_state, ChannelState::Offered | ChannelState::Closed);
        if released {
            self.release(channel_id)?;
        }
        Ok(Some(ClientEvent::Rescinded {
            channel_id,
            released,
        }))
    }

    fn handle_gpadl_created(
        &mut self,
        input: &protocol::GpadlCreated,
    ) -> Result<Option<ClientEvent>, ClientError> {
        match self.gpadls.get_mut(&input.gpadl_id) {
            Some((channel_id, state))
                if *channel_id == input.channel_id && *state == GpadlState::Creating =>
            {
                if input.status == protocol::STATUS_SUCCESS {
                    *state = GpadlState::Created;
                } else {
                    self.gpadls.remove(&input.gpadl_id);
                    self.table.teardown(input.gpadl_id)?;
                }
            }
            _ => return Err(ClientError::UnexpectedMessage(MessageType::GPADL_CREATED)),
        }
        tracing::debug!(
            channel_id = input.channel_id.0,
            gpadl_id = input.gpadl_id.0,
            status = input.status,
            "gpadl created"
        );
        Ok(Some(ClientEvent::GpadlCreated {
            channel_id: input.channel_id,
            gpadl_id: input.gpadl_id,
            status: input.status,
        }))
    }

    fn handle_open_result(
        &mut self,
        input: &protocol::OpenResult,
    ) -> Result<Option<ClientEvent>, ClientError> {
        let channel_id = input.channel_id;
        let entry = self.directory.get_mut(channel_id)?;
        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or(ClientError::UnknownChannel(channel_id))?;
        tracing::debug!(
            channel_id = channel_id.0,
            status = input.status,
            "received open result"
        );
        match entry.state {
            ChannelState::Opening => {}
            ChannelState::Rescinded => {
                // Raced with a rescind; the channel is already dead.
                channel.close();
                return Ok(None);
            }
            _ => return Err(ClientError::UnexpectedMessage(MessageType::OPEN_CHANNEL_RESULT)),
        }

        if input.status == protocol::STATUS_SUCCESS as u32 {
            entry.state.transition(ChannelState::Open)?;
            Ok(Some(ClientEvent::Opened(channel_id)))
        } else {
            entry.state.transition(ChannelState::Offered)?;
            channel.close();
            Ok(Some(ClientEvent::OpenFailed {
                channel_id,
                status: input.status,
            }))
        }
    }

    fn handle_gpadl_torndown(
        &mut self,
        gpadl_id: GpadlId,
    ) -> Result<Option<ClientEvent>, ClientError> {
        match self.gpadls.get(&gpadl_id) {
            Some((_, GpadlState::TearingDown)) => {
                self.gpadls.remove(&gpadl_id);
                tracing::debug!(gpadl_id = gpadl_id.0, "gpadl torn down");
                Ok(Some(ClientEvent::GpadlTorndown(gpadl_id)))
            }
            _ => Err(ClientError::UnexpectedMessage(MessageType::GPADL_TORNDOWN)),
        }
    }

    fn handle_unload_complete(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        if !matches!(self.state, ClientState::Unloading) {
            return Err(ClientError::UnexpectedMessage(MessageType::UNLOAD_COMPLETE));
        }
        for channel in self.channels.values_mut() {
            channel.close();
        }
        self.channels.clear();
        self.directory.clear();
        self.gpadls.clear();
        // Channels still held by the caller keep their views alive, so
        // start over rather than clearing.
        self.table = GpadlTable::new();
        self.version = None;
        self.state = ClientState::Disconnected;
        tracing::info!("vmbus client unloaded");
        Ok(Some(ClientEvent::Unloaded))
    }

    /// Describes `gpns` to the host as GPADL `gpadl_id` for `channel_id`. The
    /// pages form one page-aligned range.
    pub fn create_gpadl(
        &mut self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        gpns: &[u64],
    ) -> Result<(), ClientError> {
        self.connected_version()?;
        match self.channel_state(channel_id) {
            None => return Err(ClientError::UnknownChannel(channel_id)),
            Some(ChannelState::Rescinded) => return Err(ClientError::ChannelRescinded(channel_id)),
            Some(_) => {}
        }
        if self.gpadls.contains_key(&gpadl_id) {
            return Err(GpadlError::DuplicateId(gpadl_id).into());
        }
        self.mem.check_gpns(gpns)?;
        let range = gparange::PagedRange::new(0, gpns.len() * PAGE_SIZE, gpns)
            .ok_or(ClientError::InvalidGpadlPages)?;
        let mut buf = Vec::new();
        gparange::encode_ranges(&[range], &mut buf);
        let byte_len = buf.len() * size_of::<u64>();
        let len = u16::try_from(byte_len).map_err(|_| ClientError::InvalidGpadlPages)?;

        self.table.begin(gpadl_id, channel_id, 1, byte_len, &buf)?;
        self.table.complete(gpadl_id)?;
        self.gpadls
            .insert(gpadl_id, (channel_id, GpadlState::Creating));

        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            pages = gpns.len(),
            "creating gpadl"
        );
        let (first, remaining) = buf.split_at(buf.len().min(protocol::GpadlHeader::MAX_DATA_VALUES));
        self.send_with_data(
            &protocol::GpadlHeader {
                channel_id,
                gpadl_id,
                len,
                count: 1,
            },
            first,
        );
        for (i, chunk) in remaining
            .chunks(protocol::GpadlBody::MAX_DATA_VALUES)
            .enumerate()
        {
            self.send_with_data(
                &protocol::GpadlBody {
                    message_number: i as u32 + 1,
                    gpadl_id,
                },
                chunk,
            );
        }
        Ok(())
    }

    /// Asks the host to tear down a GPADL. Fails if a channel still has its
    /// rings mapped from it.
    pub fn teardown_gpadl(
        &mut self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
    ) -> Result<(), ClientError> {
        self.connected_version()?;
        match self.gpadls.get(&gpadl_id) {
            Some((id, GpadlState::Created)) if *id == channel_id => {}
            Some((id, _)) if *id == channel_id => {
                return Err(ClientError::GpadlNotCreated(gpadl_id))
            }
            _ => return Err(ClientError::UnknownGpadl(gpadl_id)),
        }
        self.table.teardown(gpadl_id)?;
        self.gpadls
            .insert(gpadl_id, (channel_id, GpadlState::TearingDown));
        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            "tearing down gpadl"
        );
        self.send(&protocol::GpadlTeardown {
            channel_id,
            gpadl_id,
        });
        Ok(())
    }

    /// Maps the guest end of the rings and asks the host to open the channel.
    pub fn open_channel(
        &mut self,
        channel_id: ChannelId,
        request: &OpenRequest,
    ) -> Result<(), ClientError> {
        self.connected_version()?;
        let gpadl_id = request.ring_gpadl_id;
        match self.gpadls.get(&gpadl_id) {
            Some((id, GpadlState::Created)) if *id == channel_id => {}
            Some((id, _)) if *id == channel_id => {
                return Err(ClientError::GpadlNotCreated(gpadl_id))
            }
            _ => return Err(ClientError::UnknownGpadl(gpadl_id)),
        }

        let guest_specified = self
            .directory
            .feature(FeatureFlag::GuestSpecifiedSignalParameters)
            .unwrap_or(false);
        let extended = guest_specified
            || self
                .directory
                .feature(FeatureFlag::ChannelInterruptRedirection)
                .unwrap_or(false);

        let entry = self.directory.get_mut(channel_id)?;
        entry.state.transition(ChannelState::Opening)?;
        let target = match request.guest_signal {
            Some(target) if guest_specified => target,
            _ => SignalTarget {
                connection_id: ConnectionId(entry.connection_id),
                event_flag: channel_id.0 as u16,
            },
        };

        let rings = self
            .table
            .view(gpadl_id)
            .map_err(ClientError::from)
            .and_then(|view| {
                // The pages may hold rings from an earlier open. Both rings
                // must start out empty.
                if let Some(range) = view.first() {
                    self.mem.zero_pages(range.gpns())?;
                }
                Ok(GpadlRings::new(
                    &self.mem,
                    view,
                    request.downstream_ring_buffer_page_offset,
                )?
                .guest()?)
            });
        let (in_ring, out_ring) = match rings {
            Ok(rings) => rings,
            Err(err) => {
                entry.state.transition(ChannelState::Offered)?;
                return Err(err);
            }
        };
        let channel = Channel::new(in_ring, out_ring, self.signal.clone(), target);
        let client_channel = self.channels.entry(channel_id).or_default();
        client_channel.handle = Some(channel.handle());
        client_channel.channel = Some(channel);

        let open_channel = protocol::OpenChannel {
            channel_id,
            open_id: channel_id.0,
            ring_buffer_gpadl_id: gpadl_id,
            target_vp: request.target_vp,
            downstream_ring_buffer_page_offset: request.downstream_ring_buffer_page_offset,
            user_data: request.user_data,
        };
        tracing::debug!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            extended,
            "opening channel"
        );
        if extended {
            let (connection_id, event_flag) = if guest_specified {
                (target.connection_id.0, target.event_flag)
            } else {
                (0, 0)
            };
            self.send(&protocol::OpenChannel2 {
                open_channel,
                connection_id,
                event_flag,
                flags: protocol::OpenChannelFlags::new(),
            });
        } else {
            self.send(&open_channel);
        }
        Ok(())
    }

    /// Takes the guest end of an open channel.
    pub fn take_channel(&mut self, channel_id: ChannelId) -> Option<GpadlChannel> {
        if self.channel_state(channel_id) != Some(ChannelState::Open) {
            return None;
        }
        self.channels.get_mut(&channel_id)?.channel.take()
    }

    /// Closes an open channel. Ring I/O on it fails from here on; the GPADL
    /// stays bound until the channel is dropped.
    pub fn close_channel(&mut self, channel_id: ChannelId) -> Result<(), ClientError> {
        let entry = self.directory.get_mut(channel_id)?;
        entry.state.transition(ChannelState::Closing)?;
        let channel = self.channels.entry(channel_id).or_default();
        if let Some(handle) = &channel.handle {
            handle.begin_close();
        }
        self.sink
            .post_message(OutgoingMessage::new(&protocol::CloseChannel { channel_id }));
        channel.close();
        entry.state.transition(ChannelState::Closed)?;
        tracing::debug!(channel_id = channel_id.0, "channel closed");
        Ok(())
    }

    /// Releases a channel that is not open, making its relid reusable.
    pub fn release_channel(&mut self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.release(channel_id)
    }

    fn release(&mut self, channel_id: ChannelId) -> Result<(), ClientError> {
        self.directory.release(channel_id)?;
        if let Some(mut channel) = self.channels.remove(&channel_id) {
            channel.close();
        }
        // The host drops the channel's GPADLs along with it.
        self.table.remove_channel(channel_id);
        self.gpadls.retain(|_, (id, _)| *id != channel_id);
        self.send(&protocol::RelIdReleased { channel_id });
        tracing::info!(channel_id = channel_id.0, "channel released");
        Ok(())
    }

    /// Asks the host to deliver the channel's interrupts to `target_vp`.
    pub fn modify_channel(
        &mut self,
        channel_id: ChannelId,
        target_vp: u32,
    ) -> Result<(), ClientError> {
        let version = self.connected_version()?;
        if version.version < Version::Win10Rs3_0 {
            return Err(ClientError::UnsupportedByVersion(
                MessageType::MODIFY_CHANNEL,
            ));
        }
        if self.channel_state(channel_id) != Some(ChannelState::Open) {
            return Err(ClientError::ChannelNotOpen(channel_id));
        }
        self.send(&protocol::ModifyChannel {
            channel_id,
            target_vp,
        });
        Ok(())
    }

    /// Starts disconnecting. All channels are closed and forgotten once the
    /// host confirms.
    pub fn unload(&mut self) -> Result<(), ClientError> {
        self.connected_version()?;
        self.send(&protocol::Unload {});
        self.state = ClientState::Unloading;
        Ok(())
    }
}
