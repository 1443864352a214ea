// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Signal delivery between channel endpoints.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use vmbus_core::protocol::ConnectionId;

/// Where a signal is delivered: the connection the peer listens on and the
/// event flag identifying the channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignalTarget {
    pub connection_id: ConnectionId,
    pub event_flag: u16,
}

/// Delivers "there is work on this channel" notifications to the opposite
/// endpoint. On Hyper-V this is a SynIC event; in-process it can be anything
/// that wakes the peer.
pub trait SignalTransport: Send + Sync {
    fn signal(&self, target: SignalTarget);
}

impl<T: SignalTransport + ?Sized> SignalTransport for Arc<T> {
    fn signal(&self, target: SignalTarget) {
        (**self).signal(target)
    }
}

/// A [`SignalTransport`] that counts the signals sent to each target.
#[derive(Debug, Default)]
pub struct SignalCounter {
    counts: Mutex<HashMap<SignalTarget, u64>>,
}

impl SignalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of signals sent to `target`.
    pub fn count(&self, target: SignalTarget) -> u64 {
        self.counts.lock().get(&target).copied().unwrap_or(0)
    }

    /// Returns and resets the number of signals sent to `target`.
    pub fn take(&self, target: SignalTarget) -> u64 {
        self.counts.lock().remove(&target).unwrap_or(0)
    }
}

impl SignalTransport for SignalCounter {
    fn signal(&self, target: SignalTarget) {
        tracing::trace!(
            connection_id = target.connection_id.0,
            event_flag = target.event_flag,
            "signal"
        );
        *self.counts.lock().entry(target).or_default() += 1;
    }
}
