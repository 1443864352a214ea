// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The host side of the vmbus control plane.
//!
//! [`Server`] answers the guest's contact request, offers channels, assembles
//! GPADLs and opens the host end of each channel's rings. It is driven one
//! control message at a time through [`Server::handle_message`], and replies
//! through a [`MessageSink`].

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
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlHeader;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::Version;
use vmbus_core::protocol::VmbusMessage;
use vmbus_core::MaxVersionInfo;
use vmbus_core::MessageSink;
use vmbus_core::OutgoingMessage;
use vmbus_core::VersionInfo;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The SINT the guest receives vmbus messages and events on.
pub const SINT: u8 = 2;

/// The connection ID reported in the version response for Win10Rs3_1 and
/// later, used by the guest to post further messages.
const MESSAGE_CONNECTION_ID: u32 = 1;

/// The largest relid that can be assigned. Relids index the guest's event
/// flag bitmap, and bit 0 is reserved.
pub const MAX_CHANNELS: u32 = 2047;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to parse message")]
    Parse(#[from] protocol::ParseError),
    #[error("unexpected message {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("the guest is already connected")]
    AlreadyConnected,
    #[error("unknown channel id {0:?}")]
    UnknownChannel(ChannelId),
    #[error("gpadl {gpadl_id:?} belongs to channel {actual:?}, not {expected:?}")]
    GpadlChannelMismatch {
        gpadl_id: GpadlId,
        expected: ChannelId,
        actual: Option<ChannelId>,
    },
    #[error("channel {0:?} is not open")]
    ChannelNotOpen(ChannelId),
    #[error("channel directory error")]
    Directory(#[from] DirectoryError),
    #[error("invalid channel state")]
    State(#[from] InvalidTransition),
    #[error("gpadl error")]
    Gpadl(#[from] GpadlError),
    #[error("failed to map channel rings")]
    Ring(#[from] gpadl_ring::Error),
}

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("too many channels")]
    TooManyChannels,
    #[error("channel directory error")]
    Directory(#[from] DirectoryError),
}

/// The parameters of a channel offer.
#[derive(Debug, Clone)]
pub struct OfferParams {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub flags: OfferFlags,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
}

impl OfferParams {
    pub fn new(interface_id: Guid, instance_id: Guid) -> Self {
        Self {
            interface_id,
            instance_id,
            flags: OfferFlags::new(),
            user_defined: UserDefinedData::default(),
            subchannel_index: 0,
        }
    }
}

/// Host-side state of an offered channel beyond its directory entry.
#[derive(Debug, Default)]
struct ServerChannel {
    target_vp: u32,
    /// Where the guest signals the host, once open.
    guest_target: Option<SignalTarget>,
    handle: Option<ChannelHandle>,
    /// The host end of the rings, until taken.
    channel: Option<GpadlChannel>,
}

impl ServerChannel {
    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.begin_close();
            handle.finish_close();
        }
        self.channel = None;
        self.guest_target = None;
    }
}

/// The host end of a vmbus connection.
pub struct Server {
    max_version: MaxVersionInfo,
    sink: Arc<dyn MessageSink>,
    mem: GuestMemory,
    signal: Arc<dyn SignalTransport>,
    version: Option<VersionInfo>,
    target_sint: u8,
    offers_requested: bool,
    directory: ChannelDirectory,
    channels: HashMap<ChannelId, ServerChannel>,
    gpadls: GpadlTable,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("version", &self.version)
            .field("offers_requested", &self.offers_requested)
            .field("channels", &self.directory.len())
            .finish()
    }
}

impl Server {
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
            version: None,
            target_sint: SINT,
            offers_requested: false,
            directory: ChannelDirectory::new(),
            channels: HashMap::new(),
            gpadls: GpadlTable::new(),
        }
    }

    /// The negotiated version, if the guest is connected.
    pub fn version(&self) -> Option<VersionInfo> {
        self.version
    }

    /// Returns the state of `channel_id`.
    pub fn channel_state(&self, channel_id: ChannelId) -> Option<ChannelState> {
        self.directory
            .find_by_relid(channel_id)
            .map(|entry| entry.state)
    }

    /// Returns where the guest signals the host for an open channel.
    pub fn guest_signal_target(&self, channel_id: ChannelId) -> Option<SignalTarget> {
        self.channels.get(&channel_id)?.guest_target
    }

    /// Returns the VP the guest asked to receive the channel's interrupts on.
    pub fn target_vp(&self, channel_id: ChannelId) -> Option<u32> {
        self.channels.get(&channel_id).map(|c| c.target_vp)
    }

    pub fn gpadls(&self) -> &GpadlTable {
        &self.gpadls
    }

    /// Takes the host end of an open channel.
    pub fn take_channel(&mut self, channel_id: ChannelId) -> Option<GpadlChannel> {
        self.channels.get_mut(&channel_id)?.channel.take()
    }

    /// Offers a channel, sending the offer right away if the guest has
    /// already requested offers.
    pub fn offer_channel(&mut self, params: OfferParams) -> Result<ChannelId, OfferError> {
        let channel_id = (1..=MAX_CHANNELS)
            .map(ChannelId)
            .find(|id| self.directory.find_by_relid(*id).is_none())
            .ok_or(OfferError::TooManyChannels)?;

        self.directory.offer(
            params.interface_id,
            params.instance_id,
            channel_id,
            params.flags,
        )?;
        let entry = self.directory.get_mut(channel_id)?;
        entry.user_defined = params.user_defined;
        entry.subchannel_index = params.subchannel_index;
        entry.connection_id = ConnectionId::new(channel_id.0, 0, SINT).0;
        self.channels.insert(channel_id, ServerChannel::default());

        if self.offers_requested {
            self.send_offer(channel_id);
        }
        Ok(channel_id)
    }

    /// Rescinds a channel. Ring I/O on it fails from now on.
    pub fn rescind_channel(&mut self, channel_id: ChannelId) -> Result<(), ServerError> {
        self.directory.rescind(channel_id)?;
        if let Some(handle) = self
            .channels
            .get(&channel_id)
            .and_then(|c| c.handle.as_ref())
        {
            handle.rescind();
        }
        if self.offers_requested {
            self.send(&protocol::RescindChannelOffer { channel_id });
        } else {
            // The guest never saw the offer, so there is nobody to release it.
            self.release(channel_id)?;
        }
        Ok(())
    }

    /// Handles a control message from the guest.
    pub fn handle_message(&mut self, data: &[u8]) -> Result<(), ServerError> {
        let result = self.handle_message_inner(data);
        if let Err(err) = &result {
            tracing::warn!(
                error = err as &dyn std::error::Error,
                "guest protocol error"
            );
        }
        result
    }

    fn handle_message_inner(&mut self, data: &[u8]) -> Result<(), ServerError> {
        let message = Message::parse(data, self.version)?;
        tracing::trace!(?message, "received vmbus message");
        match message {
            Message::InitiateContact2(input, _) => self.handle_initiate_contact(&input),
            Message::InitiateContact(input, _) => self.handle_initiate_contact(&input.into()),
            Message::RequestOffers(..) => self.handle_request_offers(),
            Message::GpadlHeader(input, data) => self.handle_gpadl_header(&input, data),
            Message::GpadlBody(input, data) => self.handle_gpadl_body(&input, data),
            Message::OpenChannel2(input, _) => self.handle_open_channel(&input, true),
            Message::OpenChannel(input, _) => self.handle_open_channel(&input.into(), false),
            Message::CloseChannel(input, _) => self.handle_close_channel(input.channel_id),
            Message::GpadlTeardown(input, _) => self.handle_gpadl_teardown(&input),
            Message::RelIdReleased(input, _) => self.release(input.channel_id),
            Message::ModifyChannel(input, _) => self.handle_modify_channel(&input),
            Message::Unload(..) => self.handle_unload(),
            message => Err(ServerError::UnexpectedMessage(message.message_type())),
        }
    }

    fn send<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(&self, message: &T) {
        self.sink.post_message(OutgoingMessage::new(message));
    }

    fn check_version_supported(
        &self,
        version_requested: u32,
        requested_features: u32,
    ) -> Option<VersionInfo> {
        let version = Version::try_from(version_requested).ok()?;
        if version as u32 > self.max_version.version {
            return None;
        }
        let feature_flags = if version >= Version::Copper {
            self.max_version.feature_flags & FeatureFlags::from(requested_features)
        } else {
            FeatureFlags::new()
        };
        if feature_flags.into_bits() != requested_features {
            tracing::warn!(
                supported = feature_flags.into_bits(),
                requested = requested_features,
                "guest requested unsupported feature flags"
            );
        }
        Some(VersionInfo {
            version,
            feature_flags,
        })
    }

    fn handle_initiate_contact(
        &mut self,
        input: &protocol::InitiateContact2,
    ) -> Result<(), ServerError> {
        if self.version.is_some() {
            return Err(ServerError::AlreadyConnected);
        }
        let contact = &input.initiate_contact;
        let target_info = protocol::TargetInfo::from(contact.interrupt_page_or_target_info);
        let requested_features = if contact.version_requested >= Version::Copper as u32 {
            target_info.feature_flags()
        } else {
            0
        };

        let Some(version) =
            self.check_version_supported(contact.version_requested, requested_features)
        else {
            tracing::info!(
                version_requested = contact.version_requested,
                "guest requested unsupported version"
            );
            self.send(&protocol::VersionResponse {
                version_supported: 0,
                connection_state: protocol::ConnectionState::SUCCESSFUL,
                padding: 0,
                selected_version_or_connection_id: 0,
            });
            return Ok(());
        };

        self.target_sint = if version.version >= Version::Win10Rs3_1 {
            target_info.sint()
        } else {
            SINT
        };
        self.version = Some(version);
        self.directory.set_version(Some(version));

        let response = protocol::VersionResponse {
            version_supported: 1,
            connection_state: protocol::ConnectionState::SUCCESSFUL,
            padding: 0,
            selected_version_or_connection_id: if version.version >= Version::Win10Rs3_1 {
                MESSAGE_CONNECTION_ID
            } else {
                version.version as u32
            },
        };
        if version.version >= Version::Copper {
            self.send(&protocol::VersionResponse2 {
                version_response: response,
                supported_features: version.feature_flags.into(),
            });
        } else {
            self.send(&response);
        }

        tracing::info!(
            version = ?version.version,
            feature_flags = version.feature_flags.into_bits(),
            client_id = %input.client_id,
            "guest connected"
        );
        Ok(())
    }

    fn send_offer(&self, channel_id: ChannelId) {
        let Some(entry) = self.directory.find_by_relid(channel_id) else {
            return;
        };
        let message = protocol::OfferChannel {
            interface_id: entry.interface_id,
            instance_id: entry.instance_id,
            rsvd: [0; 4],
            flags: entry.flags,
            mmio_megabytes: 0,
            user_defined: entry.user_defined,
            subchannel_index: entry.subchannel_index,
            mmio_megabytes_optional: 0,
            channel_id,
            monitor_id: 0,
            monitor_allocated: 0,
            // All channels are dedicated with Win8+ hosts. Older guests
            // ignore the field.
            is_dedicated: 1,
            connection_id: entry.connection_id,
        };
        tracing::info!(
            channel_id = channel_id.0,
            connection_id = message.connection_id,
            interface_id = %message.interface_id,
            instance_id = %message.instance_id,
            "sending offer to guest"
        );
        self.send(&message);
    }

    fn handle_request_offers(&mut self) -> Result<(), ServerError> {
        if self.offers_requested {
            return Err(ServerError::UnexpectedMessage(MessageType::REQUEST_OFFERS));
        }
        self.offers_requested = true;
        let offered: Vec<_> = self
            .directory
            .iter()
            .filter(|entry| entry.state != ChannelState::Rescinded)
            .map(|entry| entry.relid)
            .collect();
        for channel_id in offered {
            self.send_offer(channel_id);
        }
        self.send(&protocol::AllOffersDelivered {});
        Ok(())
    }

    fn send_gpadl_created(&self, channel_id: ChannelId, gpadl_id: GpadlId, status: i32) {
        self.send(&protocol::GpadlCreated {
            channel_id,
            gpadl_id,
            status,
        });
    }

    /// Completes `gpadl_id` once all of its data has arrived.
    fn finish_gpadl(&self, channel_id: ChannelId, gpadl_id: GpadlId) -> Result<(), ServerError> {
        match self.gpadls.complete(gpadl_id) {
            Ok(_) => {
                tracing::debug!(
                    channel_id = channel_id.0,
                    gpadl_id = gpadl_id.0,
                    "gpadl created"
                );
                self.send_gpadl_created(channel_id, gpadl_id, protocol::STATUS_SUCCESS);
                Ok(())
            }
            Err(err) => {
                self.send_gpadl_created(channel_id, gpadl_id, protocol::STATUS_UNSUCCESSFUL);
                Err(err.into())
            }
        }
    }

    fn handle_gpadl_header(
        &mut self,
        input: &protocol::GpadlHeader,
        data: &[u8],
    ) -> Result<(), ServerError> {
        let state = self
            .channel_state(input.channel_id)
            .ok_or(ServerError::UnknownChannel(input.channel_id))?;
        if state == ChannelState::Rescinded {
            return Err(ServerError::UnknownChannel(input.channel_id));
        }
        let values = range_values(data, GpadlHeader::MAX_DATA_VALUES);
        let done = self.gpadls.begin(
            input.gpadl_id,
            input.channel_id,
            input.count,
            input.len.into(),
            &values,
        )?;
        tracing::debug!(
            channel_id = input.channel_id.0,
            gpadl_id = input.gpadl_id.0,
            len = input.len,
            count = input.count,
            "gpadl header"
        );
        if done {
            self.finish_gpadl(input.channel_id, input.gpadl_id)?;
        }
        Ok(())
    }

    fn handle_gpadl_body(
        &mut self,
        input: &protocol::GpadlBody,
        data: &[u8],
    ) -> Result<(), ServerError> {
        let channel_id = self
            .gpadls
            .channel_id(input.gpadl_id)
            .ok_or(GpadlError::UnknownId(input.gpadl_id))?;
        let values = range_values(data, protocol::GpadlBody::MAX_DATA_VALUES);
        match self
            .gpadls
            .append(input.gpadl_id, input.message_number, &values)
        {
            Ok(true) => self.finish_gpadl(channel_id, input.gpadl_id),
            Ok(false) => Ok(()),
            Err(err @ GpadlError::OutOfOrder { .. }) => {
                // The handle can never complete now. Tell the guest so it can
                // tear it down.
                self.send_gpadl_created(channel_id, input.gpadl_id, protocol::STATUS_UNSUCCESSFUL);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn handle_gpadl_teardown(&mut self, input: &protocol::GpadlTeardown) -> Result<(), ServerError> {
        let actual = self.gpadls.channel_id(input.gpadl_id);
        if actual.is_some() && actual != Some(input.channel_id) {
            return Err(ServerError::GpadlChannelMismatch {
                gpadl_id: input.gpadl_id,
                expected: input.channel_id,
                actual,
            });
        }
        self.gpadls.teardown(input.gpadl_id)?;
        tracing::debug!(
            channel_id = input.channel_id.0,
            gpadl_id = input.gpadl_id.0,
            "gpadl torn down"
        );
        self.send(&protocol::GpadlTorndown {
            gpadl_id: input.gpadl_id,
        });
        Ok(())
    }

    fn handle_open_channel(
        &mut self,
        input: &protocol::OpenChannel2,
        extended: bool,
    ) -> Result<(), ServerError> {
        let open = &input.open_channel;
        let channel_id = open.channel_id;
        self.directory
            .get_mut(channel_id)?
            .state
            .transition(ChannelState::Opening)?;

        let status = match self.open_rings(input, extended) {
            Ok((channel, guest_target)) => {
                self.directory
                    .get_mut(channel_id)?
                    .state
                    .transition(ChannelState::Open)?;
                let server_channel = self.channels.entry(channel_id).or_default();
                server_channel.target_vp = open.target_vp;
                server_channel.guest_target = Some(guest_target);
                server_channel.handle = Some(channel.handle());
                server_channel.channel = Some(channel);
                tracing::debug!(
                    channel_id = channel_id.0,
                    gpadl_id = open.ring_buffer_gpadl_id.0,
                    target_vp = open.target_vp,
                    "channel opened"
                );
                protocol::STATUS_SUCCESS
            }
            Err(err) => {
                tracing::warn!(
                    channel_id = channel_id.0,
                    error = &err as &dyn std::error::Error,
                    "failed to open channel"
                );
                self.directory
                    .get_mut(channel_id)?
                    .state
                    .transition(ChannelState::Offered)?;
                protocol::STATUS_UNSUCCESSFUL
            }
        };

        self.send(&protocol::OpenResult {
            channel_id,
            open_id: open.open_id,
            status: status as u32,
        });
        Ok(())
    }

    /// Maps the host end of the rings described by an open request.
    fn open_rings(
        &self,
        input: &protocol::OpenChannel2,
        extended: bool,
    ) -> Result<(GpadlChannel, SignalTarget), ServerError> {
        let open = &input.open_channel;
        let channel_id = open.channel_id;
        let gpadl_id = open.ring_buffer_gpadl_id;
        let actual = self.gpadls.channel_id(gpadl_id);
        if actual != Some(channel_id) {
            return Err(ServerError::GpadlChannelMismatch {
                gpadl_id,
                expected: channel_id,
                actual,
            });
        }
        let view = self.gpadls.view(gpadl_id)?;
        let (in_ring, out_ring) =
            GpadlRings::new(&self.mem, view, open.downstream_ring_buffer_page_offset)?.host()?;

        let entry = self
            .directory
            .find_by_relid(channel_id)
            .ok_or(ServerError::UnknownChannel(channel_id))?;
        let guest_specified = extended
            && self
                .directory
                .feature(FeatureFlag::GuestSpecifiedSignalParameters)
                .unwrap_or(false);
        let guest_target = if guest_specified {
            SignalTarget {
                connection_id: ConnectionId(input.connection_id),
                event_flag: input.event_flag,
            }
        } else {
            SignalTarget {
                connection_id: ConnectionId(entry.connection_id),
                event_flag: channel_id.0 as u16,
            }
        };
        let to_guest = SignalTarget {
            connection_id: ConnectionId::new(channel_id.0, 0, self.target_sint),
            event_flag: channel_id.0 as u16,
        };
        let channel = Channel::new(in_ring, out_ring, self.signal.clone(), to_guest);
        Ok((channel, guest_target))
    }

    fn handle_close_channel(&mut self, channel_id: ChannelId) -> Result<(), ServerError> {
        let entry = self.directory.get_mut(channel_id)?;
        if entry.state == ChannelState::Rescinded {
            // Closing a rescinded channel only stops I/O; the release that
            // follows finishes the job.
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.channel = None;
            }
            return Ok(());
        }
        if entry.state != ChannelState::Open {
            return Err(ServerError::ChannelNotOpen(channel_id));
        }
        entry.state.transition(ChannelState::Closing)?;
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.close();
        }
        entry.state.transition(ChannelState::Closed)?;
        tracing::debug!(channel_id = channel_id.0, "channel closed");
        Ok(())
    }

    fn release(&mut self, channel_id: ChannelId) -> Result<(), ServerError> {
        let entry = self.directory.release(channel_id)?;
        if let Some(mut channel) = self.channels.remove(&channel_id) {
            channel.close();
        }
        let removed = self.gpadls.remove_channel(channel_id);
        tracing::info!(
            channel_id = channel_id.0,
            interface_id = %entry.interface_id,
            gpadls = removed.len(),
            "channel released"
        );
        Ok(())
    }

    fn handle_modify_channel(&mut self, input: &protocol::ModifyChannel) -> Result<(), ServerError> {
        let channel_id = input.channel_id;
        let result = match self.channel_state(channel_id) {
            None => Err(ServerError::UnknownChannel(channel_id)),
            Some(ChannelState::Open) => {
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.target_vp = input.target_vp;
                }
                tracing::debug!(
                    channel_id = channel_id.0,
                    target_vp = input.target_vp,
                    "channel retargeted"
                );
                Ok(())
            }
            Some(_) => Err(ServerError::ChannelNotOpen(channel_id)),
        };
        // Older guests do not expect a response.
        if self
            .version
            .is_some_and(|version| version.version >= Version::Iron)
        {
            self.send(&protocol::ModifyChannelResponse {
                channel_id,
                status: if result.is_ok() {
                    protocol::STATUS_SUCCESS
                } else {
                    protocol::STATUS_UNSUCCESSFUL
                },
            });
        }
        result
    }

    fn handle_unload(&mut self) -> Result<(), ServerError> {
        for channel in self.channels.values_mut() {
            channel.close();
        }
        // Offers rescinded before the unload are gone for good; the rest will
        // be offered again on the next connection.
        let rescinded: Vec<_> = self
            .directory
            .iter()
            .filter(|entry| entry.state == ChannelState::Rescinded)
            .map(|entry| entry.relid)
            .collect();
        for channel_id in rescinded {
            self.release(channel_id)?;
        }
        let relids: Vec<_> = self.directory.iter().map(|entry| entry.relid).collect();
        for channel_id in relids {
            self.directory.get_mut(channel_id)?.state = ChannelState::Offered;
        }
        // Views held by channels the caller took stay valid on their own.
        self.gpadls = GpadlTable::new();
        self.version = None;
        self.directory.set_version(None);
        self.offers_requested = false;
        self.target_sint = SINT;
        tracing::info!("guest unloaded");
        self.send(&protocol::UnloadComplete {});
        Ok(())
    }
}

/// Reads the range buffer values that follow a GPADL message, at most
/// `max` of them.
fn range_values(data: &[u8], max: usize) -> Vec<u64> {
    let mut values = vec![0u64; (data.len() / 8).min(max)];
    let len = values.len() * 8;
    values.as_mut_bytes().copy_from_slice(&data[..len]);
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbus_channel::signal::SignalCounter;
    use vmbus_core::MessageQueue;
    use vmbus_ring::OutgoingPacket;
    use vmbus_ring::OutgoingPacketType;
    use zerocopy::FromBytes;

    const INTERFACE: Guid = Guid::from_u128(0x8b2a4a43_a48d_4c7b_b6cf_3e4fc85d8ab4);
    const INSTANCE: Guid = Guid::from_u128(0x3d13bb6a_1c1e_4e0e_ae43_2e3a6cb8b1d2);

    fn test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    }

    struct TestEnv {
        server: Server,
        queue: Arc<MessageQueue>,
        mem: GuestMemory,
        signals: Arc<SignalCounter>,
    }

    impl TestEnv {
        fn new(max_version: Version) -> Self {
            test_tracing();
            let queue = Arc::new(MessageQueue::new());
            let mem = GuestMemory::new(16);
            let signals = Arc::new(SignalCounter::new());
            let server = Server::new(
                MaxVersionInfo {
                    version: max_version as u32,
                    feature_flags: FeatureFlags::all(),
                },
                queue.clone(),
                mem.clone(),
                signals.clone(),
            );
            Self {
                server,
                queue,
                mem,
                signals,
            }
        }

        fn send<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
            &mut self,
            message: &T,
        ) -> Result<(), ServerError> {
            self.server
                .handle_message(OutgoingMessage::new(message).data())
        }

        fn send_with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
            &mut self,
            message: &T,
            data: &[u64],
        ) -> Result<(), ServerError> {
            self.server
                .handle_message(OutgoingMessage::with_data(message, data.as_bytes()).data())
        }

        /// Pops the next reply and returns it parsed as `T`.
        fn expect<T: FromBytes + VmbusMessage>(&self) -> T {
            let message = self.queue.pop().expect("no reply");
            let data = message.data();
            assert_eq!(&data[..4], T::MESSAGE_TYPE.0.as_bytes());
            T::read_from_prefix(&data[protocol::HEADER_SIZE..])
                .ok()
                .expect("reply too short")
                .0
        }

        fn connect(&mut self, version: Version, features: FeatureFlags) {
            let target_info = protocol::TargetInfo::new()
                .with_sint(SINT)
                .with_feature_flags(features.into_bits());
            let contact = protocol::InitiateContact {
                version_requested: version as u32,
                target_message_vp: 0,
                interrupt_page_or_target_info: target_info.into_bits(),
                parent_to_child_monitor_page_gpa: 0,
                child_to_parent_monitor_page_gpa: 0,
            };
            if version >= Version::Copper {
                self.send(&protocol::InitiateContact2::from(contact))
                    .unwrap();
            } else {
                self.send(&contact).unwrap();
            }
        }

        fn create_ring_gpadl(&mut self, channel_id: ChannelId, gpadl_id: GpadlId) {
            self.send_with_data(
                &GpadlHeader {
                    channel_id,
                    gpadl_id,
                    len: 40,
                    count: 1,
                },
                &[4 * 4096, 4, 5, 6, 7],
            )
            .unwrap();
            let created: protocol::GpadlCreated = self.expect();
            assert_eq!(created.status, protocol::STATUS_SUCCESS);
        }

        fn open(&mut self, channel_id: ChannelId, gpadl_id: GpadlId) -> protocol::OpenResult {
            self.send(&protocol::OpenChannel {
                channel_id,
                open_id: 1,
                ring_buffer_gpadl_id: gpadl_id,
                target_vp: 0,
                downstream_ring_buffer_page_offset: 2,
                user_data: UserDefinedData::default(),
            })
            .unwrap();
            self.expect()
        }
    }

    #[test]
    fn test_version_negotiation() {
        let mut env = TestEnv::new(Version::Iron);
        env.connect(Version::Copper, FeatureFlags::all());
        let response: protocol::VersionResponse = env.expect();
        assert_eq!(response.version_supported, 0);
        assert!(env.queue.is_empty());
        assert!(env.server.version().is_none());

        env.connect(Version::Iron, FeatureFlags::all());
        let response: protocol::VersionResponse = env.expect();
        assert_eq!(response.version_supported, 1);
        assert_eq!(response.selected_version_or_connection_id, 1);
        assert!(env.queue.is_empty());
        let version = env.server.version().unwrap();
        assert_eq!(version.version, Version::Iron);
        // No feature flags exist before Copper.
        assert_eq!(version.feature_flags, FeatureFlags::new());

        assert!(matches!(
            env.connect_result(Version::Iron),
            Err(ServerError::AlreadyConnected)
        ));
    }

    impl TestEnv {
        fn connect_result(&mut self, version: Version) -> Result<(), ServerError> {
            self.send(&protocol::InitiateContact {
                version_requested: version as u32,
                target_message_vp: 0,
                interrupt_page_or_target_info: 0,
                parent_to_child_monitor_page_gpa: 0,
                child_to_parent_monitor_page_gpa: 0,
            })
        }
    }

    #[test]
    fn test_copper_response_features() {
        let mut env = TestEnv::new(Version::Copper);
        let requested = FeatureFlags::new()
            .with_guest_specified_signal_parameters(true)
            .with_client_id(true);
        env.connect(Version::Copper, requested);
        let response: protocol::VersionResponse2 = env.expect();
        assert_eq!(response.version_response.version_supported, 1);
        assert_eq!(response.supported_features, requested.into_bits());
    }

    #[test]
    fn test_messages_before_contact() {
        let mut env = TestEnv::new(Version::Copper);
        assert!(matches!(
            env.send(&protocol::RequestOffers {}),
            Err(ServerError::Parse(protocol::ParseError::InvalidMessageType(
                MessageType::REQUEST_OFFERS
            )))
        ));
    }

    #[test]
    fn test_offers() {
        let mut env = TestEnv::new(Version::Copper);
        let a = env
            .server
            .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
            .unwrap();
        assert_eq!(a, ChannelId(1));
        assert!(env.queue.is_empty());
        assert!(matches!(
            env.server
                .offer_channel(OfferParams::new(INTERFACE, INSTANCE)),
            Err(OfferError::Directory(DirectoryError::DuplicateKey { .. }))
        ));

        env.connect(Version::Win10, FeatureFlags::new());
        let _: protocol::VersionResponse = env.expect();
        env.send(&protocol::RequestOffers {}).unwrap();
        let offer: protocol::OfferChannel = env.expect();
        assert_eq!(offer.channel_id, a);
        assert_eq!(offer.connection_id, ConnectionId::new(1, 0, SINT).0);
        let _: protocol::AllOffersDelivered = env.expect();

        // Later offers are sent right away.
        let mut params = OfferParams::new(INTERFACE, Guid::from_u128(2));
        params.flags = OfferFlags::new()
            .with_named_pipe_mode(true)
            .with_confidential_ring_buffer(true);
        let b = env.server.offer_channel(params).unwrap();
        let offer: protocol::OfferChannel = env.expect();
        assert_eq!(offer.channel_id, b);
        assert_eq!(
            offer.flags,
            OfferFlags::new().with_named_pipe_mode(true),
            "flags not defined at Win10 are masked"
        );
    }

    #[test]
    fn test_gpadl_and_open() {
        let mut env = TestEnv::new(Version::Copper);
        let channel_id = env
            .server
            .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
            .unwrap();
        env.connect(Version::Copper, FeatureFlags::new());
        let _: protocol::VersionResponse2 = env.expect();
        env.send(&protocol::RequestOffers {}).unwrap();
        let _: protocol::OfferChannel = env.expect();
        let _: protocol::AllOffersDelivered = env.expect();

        // Opening with an unknown gpadl fails and returns to Offered.
        let result = env.open(channel_id, GpadlId(7));
        assert_eq!(result.status, protocol::STATUS_UNSUCCESSFUL as u32);
        assert_eq!(
            env.server.channel_state(channel_id),
            Some(ChannelState::Offered)
        );

        env.create_ring_gpadl(channel_id, GpadlId(7));
        let result = env.open(channel_id, GpadlId(7));
        assert_eq!(result.status, 0);
        assert_eq!(env.server.channel_state(channel_id), Some(ChannelState::Open));
        assert_eq!(
            env.server.guest_signal_target(channel_id),
            Some(SignalTarget {
                connection_id: ConnectionId::new(channel_id.0, 0, SINT),
                event_flag: channel_id.0 as u16,
            })
        );

        // A second open without a close is a protocol error.
        assert!(matches!(
            env.open_result(channel_id, GpadlId(7)),
            Err(ServerError::State(_))
        ));

        let mut channel = env.server.take_channel(channel_id).unwrap();
        channel
            .write(&OutgoingPacket {
                transaction_id: 0,
                typ: OutgoingPacketType::InBandNoCompletion,
                payload: &[0xab; 8],
            })
            .unwrap();
        // The host-to-guest ring starts at gpn 6, with data on gpn 7.
        let mut data = [0; 8];
        env.mem.read_at(7 * 4096 + 16, &mut data).unwrap();
        assert_eq!(data, [0xab; 8]);
        assert_eq!(env.signals.count(channel.target()), 1);

        // Teardown is refused while the channel holds the gpadl.
        assert!(matches!(
            env.send(&protocol::GpadlTeardown {
                channel_id,
                gpadl_id: GpadlId(7),
            }),
            Err(ServerError::Gpadl(GpadlError::InUse(_)))
        ));

        env.send(&protocol::CloseChannel { channel_id }).unwrap();
        assert_eq!(
            env.server.channel_state(channel_id),
            Some(ChannelState::Closed)
        );
        assert!(channel.read().is_err());
        drop(channel);
        env.send(&protocol::GpadlTeardown {
            channel_id,
            gpadl_id: GpadlId(7),
        })
        .unwrap();
        let torndown: protocol::GpadlTorndown = env.expect();
        assert_eq!(torndown.gpadl_id, GpadlId(7));

        env.send(&protocol::RelIdReleased { channel_id }).unwrap();
        assert_eq!(env.server.channel_state(channel_id), None);
    }

    impl TestEnv {
        fn open_result(
            &mut self,
            channel_id: ChannelId,
            gpadl_id: GpadlId,
        ) -> Result<(), ServerError> {
            self.send(&protocol::OpenChannel {
                channel_id,
                open_id: 2,
                ring_buffer_gpadl_id: gpadl_id,
                target_vp: 0,
                downstream_ring_buffer_page_offset: 2,
                user_data: UserDefinedData::default(),
            })
        }
    }

    #[test]
    fn test_gpadl_out_of_order() {
        let mut env = TestEnv::new(Version::Copper);
        let channel_id = env
            .server
            .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
            .unwrap();
        env.connect(Version::Win8, FeatureFlags::new());
        let _: protocol::VersionResponse = env.expect();

        // 60 pages need a header and two bodies.
        let mut buf = vec![60 * 4096];
        buf.extend(0..60);
        env.send_with_data(
            &GpadlHeader {
                channel_id,
                gpadl_id: GpadlId(3),
                len: (buf.len() * 8) as u16,
                count: 1,
            },
            &buf[..27],
        )
        .unwrap();
        assert!(matches!(
            env.send_with_data(
                &protocol::GpadlBody {
                    message_number: 2,
                    gpadl_id: GpadlId(3),
                },
                &buf[27..55],
            ),
            Err(ServerError::Gpadl(GpadlError::OutOfOrder { .. }))
        ));
        let created: protocol::GpadlCreated = env.expect();
        assert_eq!(created.status, protocol::STATUS_UNSUCCESSFUL);
        assert_eq!(env.server.gpadls().accumulated(GpadlId(3)), Some(27));
    }

    #[test]
    fn test_rescind_open_channel() {
        let mut env = TestEnv::new(Version::Copper);
        let channel_id = env
            .server
            .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
            .unwrap();
        env.connect(Version::Win10, FeatureFlags::new());
        let _: protocol::VersionResponse = env.expect();
        env.send(&protocol::RequestOffers {}).unwrap();
        let _: protocol::OfferChannel = env.expect();
        let _: protocol::AllOffersDelivered = env.expect();
        env.create_ring_gpadl(channel_id, GpadlId(7));
        assert_eq!(env.open(channel_id, GpadlId(7)).status, 0);
        let mut channel = env.server.take_channel(channel_id).unwrap();

        env.server.rescind_channel(channel_id).unwrap();
        let rescind: protocol::RescindChannelOffer = env.expect();
        assert_eq!(rescind.channel_id, channel_id);
        assert!(matches!(
            channel.read(),
            Err(vmbus_channel::ChannelError::Rescinded)
        ));

        env.send(&protocol::CloseChannel { channel_id }).unwrap();
        env.send(&protocol::RelIdReleased { channel_id }).unwrap();
        assert_eq!(env.server.channel_state(channel_id), None);
        // The relid can be assigned again.
        assert_eq!(
            env.server
                .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
                .unwrap(),
            channel_id
        );
    }

    #[test]
    fn test_modify_channel_response_gating() {
        for (version, response) in [(Version::Win10Rs5, false), (Version::Iron, true)] {
            let mut env = TestEnv::new(Version::Copper);
            let channel_id = env
                .server
                .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
                .unwrap();
            env.connect(version, FeatureFlags::new());
            let _: protocol::VersionResponse = env.expect();
            env.send(&protocol::RequestOffers {}).unwrap();
            let _: protocol::OfferChannel = env.expect();
            let _: protocol::AllOffersDelivered = env.expect();
            env.create_ring_gpadl(channel_id, GpadlId(1));
            assert_eq!(env.open(channel_id, GpadlId(1)).status, 0);

            env.send(&protocol::ModifyChannel {
                channel_id,
                target_vp: 3,
            })
            .unwrap();
            assert_eq!(env.server.target_vp(channel_id), Some(3));
            if response {
                let response: protocol::ModifyChannelResponse = env.expect();
                assert_eq!(response.status, protocol::STATUS_SUCCESS);
            }
            assert!(env.queue.is_empty());
        }
    }

    #[test]
    fn test_unload() {
        let mut env = TestEnv::new(Version::Copper);
        let channel_id = env
            .server
            .offer_channel(OfferParams::new(INTERFACE, INSTANCE))
            .unwrap();
        env.connect(Version::Win10, FeatureFlags::new());
        let _: protocol::VersionResponse = env.expect();
        env.send(&protocol::RequestOffers {}).unwrap();
        let _: protocol::OfferChannel = env.expect();
        let _: protocol::AllOffersDelivered = env.expect();
        env.create_ring_gpadl(channel_id, GpadlId(1));
        assert_eq!(env.open(channel_id, GpadlId(1)).status, 0);

        env.send(&protocol::Unload {}).unwrap();
        let _: protocol::UnloadComplete = env.expect();
        assert!(env.server.version().is_none());
        assert_eq!(
            env.server.channel_state(channel_id),
            Some(ChannelState::Offered)
        );
        assert!(env.server.gpadls().is_empty());

        // The guest can connect again and sees the same offer.
        env.connect(Version::Win10, FeatureFlags::new());
        let _: protocol::VersionResponse = env.expect();
        env.send(&protocol::RequestOffers {}).unwrap();
        let offer: protocol::OfferChannel = env.expect();
        assert_eq!(offer.channel_id, channel_id);
    }
}
