// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The catalogue of offered channels.

use crate::state::ChannelState;
use crate::state::InvalidTransition;
use std::collections::BTreeMap;
use thiserror::Error;
use vmbus_core::guid::Guid;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::VersionInfo;

/// Identifies an offer within one directory. Never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OfferId(pub u64);

/// A negotiated connection feature.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureFlag {
    GuestSpecifiedSignalParameters,
    ChannelInterruptRedirection,
    ModifyConnection,
    ClientId,
    ConfidentialChannels,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("channel id {0:?} is already offered")]
    DuplicateRelid(ChannelId),
    #[error("an offer for interface {interface_id}, instance {instance_id} already exists")]
    DuplicateKey {
        interface_id: Guid,
        instance_id: Guid,
    },
    #[error("unknown channel id {0:?}")]
    UnknownRelid(ChannelId),
    #[error("{0:?} is not defined by the negotiated version")]
    UndefinedFeature(FeatureFlag),
    #[error("invalid channel state")]
    State(#[from] InvalidTransition),
}

/// An offered channel.
#[derive(Debug, Clone)]
pub struct OfferEntry {
    pub id: OfferId,
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub relid: ChannelId,
    /// The flags after masking to the negotiated version.
    pub flags: OfferFlags,
    pub subchannel_index: u16,
    pub connection_id: u32,
    pub user_defined: UserDefinedData,
    pub state: ChannelState,
    requested_flags: OfferFlags,
}

impl OfferEntry {
    /// Returns whether the ring buffer must live in confidential memory.
    /// Fails if `version` does not define the flag.
    pub fn confidential_ring_buffer(&self, version: VersionInfo) -> Result<bool, DirectoryError> {
        if !OfferFlags::defined_for(version).confidential_ring_buffer() {
            return Err(DirectoryError::UndefinedFeature(
                FeatureFlag::ConfidentialChannels,
            ));
        }
        Ok(self.flags.confidential_ring_buffer())
    }
}

/// Tracks offered channels until they are released, keyed by relid and
/// unique by (interface, instance).
#[derive(Debug, Default)]
pub struct ChannelDirectory {
    version: Option<VersionInfo>,
    entries: BTreeMap<ChannelId, OfferEntry>,
    next_offer_id: u64,
}

impl ChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Option<VersionInfo> {
        self.version
    }

    /// Sets the negotiated version and re-masks the flags of every entry.
    pub fn set_version(&mut self, version: Option<VersionInfo>) {
        self.version = version;
        for entry in self.entries.values_mut() {
            entry.flags = mask_flags(version, entry.relid, entry.requested_flags);
        }
    }

    /// Adds an offer.
    pub fn offer(
        &mut self,
        interface_id: Guid,
        instance_id: Guid,
        relid: ChannelId,
        flags: OfferFlags,
    ) -> Result<OfferId, DirectoryError> {
        if self.entries.contains_key(&relid) {
            return Err(DirectoryError::DuplicateRelid(relid));
        }
        if self.find(interface_id, instance_id).is_some() {
            return Err(DirectoryError::DuplicateKey {
                interface_id,
                instance_id,
            });
        }
        let id = OfferId(self.next_offer_id);
        self.next_offer_id += 1;
        self.entries.insert(
            relid,
            OfferEntry {
                id,
                interface_id,
                instance_id,
                relid,
                flags: mask_flags(self.version, relid, flags),
                subchannel_index: 0,
                connection_id: 0,
                user_defined: UserDefinedData::default(),
                state: ChannelState::Offered,
                requested_flags: flags,
            },
        );
        tracing::info!(
            channel_id = relid.0,
            %interface_id,
            %instance_id,
            offer_id = id.0,
            "channel offered"
        );
        Ok(id)
    }

    /// Adds the offer described by an OfferChannel message.
    pub fn offer_message(&mut self, offer: &OfferChannel) -> Result<OfferId, DirectoryError> {
        let id = self.offer(
            offer.interface_id,
            offer.instance_id,
            offer.channel_id,
            offer.flags,
        )?;
        if let Some(entry) = self.entries.get_mut(&offer.channel_id) {
            entry.subchannel_index = offer.subchannel_index;
            entry.connection_id = offer.connection_id;
            entry.user_defined = offer.user_defined;
        }
        Ok(id)
    }

    pub fn find_by_relid(&self, relid: ChannelId) -> Option<&OfferEntry> {
        self.entries.get(&relid)
    }

    pub fn find(&self, interface_id: Guid, instance_id: Guid) -> Option<&OfferEntry> {
        self.entries
            .values()
            .find(|entry| entry.interface_id == interface_id && entry.instance_id == instance_id)
    }

    pub fn get_mut(&mut self, relid: ChannelId) -> Result<&mut OfferEntry, DirectoryError> {
        self.entries
            .get_mut(&relid)
            .ok_or(DirectoryError::UnknownRelid(relid))
    }

    /// Moves `relid` to the rescinded state.
    pub fn rescind(&mut self, relid: ChannelId) -> Result<&mut OfferEntry, DirectoryError> {
        let entry = self.get_mut(relid)?;
        entry.state.transition(ChannelState::Rescinded)?;
        tracing::info!(channel_id = relid.0, "channel rescinded");
        Ok(entry)
    }

    /// Releases `relid` and removes it, making the relid reusable.
    pub fn release(&mut self, relid: ChannelId) -> Result<OfferEntry, DirectoryError> {
        let entry = self.get_mut(relid)?;
        entry.state.transition(ChannelState::Released)?;
        let entry = self
            .entries
            .remove(&relid)
            .ok_or(DirectoryError::UnknownRelid(relid))?;
        tracing::debug!(channel_id = relid.0, "channel released");
        Ok(entry)
    }

    /// Returns whether `flag` was negotiated. Fails if the negotiated version
    /// does not define feature flags.
    pub fn feature(&self, flag: FeatureFlag) -> Result<bool, DirectoryError> {
        let version = self
            .version
            .filter(VersionInfo::defines_feature_flags)
            .ok_or(DirectoryError::UndefinedFeature(flag))?;
        let flags = version.feature_flags;
        Ok(match flag {
            FeatureFlag::GuestSpecifiedSignalParameters => flags.guest_specified_signal_parameters(),
            FeatureFlag::ChannelInterruptRedirection => flags.channel_interrupt_redirection(),
            FeatureFlag::ModifyConnection => flags.modify_connection(),
            FeatureFlag::ClientId => flags.client_id(),
            FeatureFlag::ConfidentialChannels => flags.confidential_channels(),
        })
    }

    /// Iterates over the entries in relid order.
    pub fn iter(&self) -> impl Iterator<Item = &OfferEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry and forgets the version.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.version = None;
    }
}

fn mask_flags(version: Option<VersionInfo>, relid: ChannelId, flags: OfferFlags) -> OfferFlags {
    let Some(version) = version else {
        return flags;
    };
    let masked = flags & OfferFlags::defined_for(version);
    if masked != flags {
        tracing::warn!(
            channel_id = relid.0,
            version = ?version.version,
            flags = flags.into_bits(),
            masked = masked.into_bits(),
            "offer flags not defined by the negotiated version were cleared"
        );
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbus_core::protocol::FeatureFlags;
    use vmbus_core::protocol::Version;

    const INTERFACE: Guid = Guid::from_u128(0xf8615163_df3e_46c5_913f_f2d2f965ed0e);

    fn instance(n: u128) -> Guid {
        Guid::from_u128(0x1000 + n)
    }

    fn all_flags() -> OfferFlags {
        OfferFlags::new()
            .with_enumerate_device_interface(true)
            .with_named_pipe_mode(true)
            .with_tlnpi_provider(true)
            .with_confidential_ring_buffer(true)
            .with_confidential_external_memory(true)
    }

    #[test]
    fn test_offer_and_find() {
        let mut dir = ChannelDirectory::new();
        let a = dir
            .offer(INTERFACE, instance(1), ChannelId(5), OfferFlags::new())
            .unwrap();
        let b = dir
            .offer(INTERFACE, instance(2), ChannelId(6), OfferFlags::new())
            .unwrap();
        assert!(a < b);
        assert_eq!(dir.find_by_relid(ChannelId(5)).unwrap().id, a);
        assert_eq!(dir.find(INTERFACE, instance(2)).unwrap().relid, ChannelId(6));
        assert!(dir.find(INTERFACE, instance(3)).is_none());

        assert!(matches!(
            dir.offer(INTERFACE, instance(3), ChannelId(5), OfferFlags::new()),
            Err(DirectoryError::DuplicateRelid(ChannelId(5)))
        ));
        assert!(matches!(
            dir.offer(INTERFACE, instance(1), ChannelId(7), OfferFlags::new()),
            Err(DirectoryError::DuplicateKey { .. })
        ));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_flags_masked_by_version() {
        let mut dir = ChannelDirectory::new();
        dir.set_version(Some(VersionInfo {
            version: Version::Win8_1,
            feature_flags: FeatureFlags::new(),
        }));
        dir.offer(INTERFACE, instance(1), ChannelId(1), all_flags())
            .unwrap();
        let flags = dir.find_by_relid(ChannelId(1)).unwrap().flags;
        assert!(flags.enumerate_device_interface());
        assert!(flags.named_pipe_mode());
        assert!(!flags.tlnpi_provider());
        assert!(!flags.confidential_ring_buffer());

        // A newer version restores the bits it defines.
        dir.set_version(Some(VersionInfo {
            version: Version::Copper,
            feature_flags: FeatureFlags::new().with_confidential_channels(true),
        }));
        assert_eq!(dir.find_by_relid(ChannelId(1)).unwrap().flags, all_flags());
    }

    #[test]
    fn test_undefined_feature() {
        let mut dir = ChannelDirectory::new();
        assert!(matches!(
            dir.feature(FeatureFlag::ClientId),
            Err(DirectoryError::UndefinedFeature(FeatureFlag::ClientId))
        ));

        let iron = VersionInfo {
            version: Version::Iron,
            feature_flags: FeatureFlags::new(),
        };
        dir.set_version(Some(iron));
        assert!(matches!(
            dir.feature(FeatureFlag::ModifyConnection),
            Err(DirectoryError::UndefinedFeature(_))
        ));
        dir.offer(INTERFACE, instance(1), ChannelId(1), all_flags())
            .unwrap();
        assert!(matches!(
            dir.find_by_relid(ChannelId(1))
                .unwrap()
                .confidential_ring_buffer(iron),
            Err(DirectoryError::UndefinedFeature(_))
        ));

        let copper = VersionInfo {
            version: Version::Copper,
            feature_flags: FeatureFlags::new()
                .with_client_id(true)
                .with_confidential_channels(true),
        };
        dir.set_version(Some(copper));
        assert!(dir.feature(FeatureFlag::ClientId).unwrap());
        assert!(!dir.feature(FeatureFlag::ModifyConnection).unwrap());
        assert!(dir
            .find_by_relid(ChannelId(1))
            .unwrap()
            .confidential_ring_buffer(copper)
            .unwrap());
    }

    #[test]
    fn test_rescind_and_release() {
        let mut dir = ChannelDirectory::new();
        dir.offer(INTERFACE, instance(1), ChannelId(5), OfferFlags::new())
            .unwrap();
        let entry = dir.get_mut(ChannelId(5)).unwrap();
        entry.state.transition(ChannelState::Opening).unwrap();
        entry.state.transition(ChannelState::Open).unwrap();

        // An open channel cannot be released.
        assert!(matches!(
            dir.release(ChannelId(5)),
            Err(DirectoryError::State(_))
        ));
        assert_eq!(
            dir.rescind(ChannelId(5)).unwrap().state,
            ChannelState::Rescinded
        );
        let entry = dir.release(ChannelId(5)).unwrap();
        assert_eq!(entry.state, ChannelState::Released);
        assert!(dir.is_empty());

        // The relid is reusable and gets a new offer id.
        let id = dir
            .offer(INTERFACE, instance(1), ChannelId(5), OfferFlags::new())
            .unwrap();
        assert_eq!(id, OfferId(1));
        assert!(matches!(
            dir.rescind(ChannelId(9)),
            Err(DirectoryError::UnknownRelid(_))
        ));
    }
}
