// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control-plane lifecycle of a channel.

use thiserror::Error;

/// The lifecycle state of an offered channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Offered by the host and not open.
    Offered,
    /// An open request is outstanding.
    Opening,
    /// Open, with rings over the ring GPADL.
    Open,
    /// A close has started; ring I/O fails.
    Closing,
    /// Closed. The channel can be opened again or released.
    Closed,
    /// The relid has been released and may be reused.
    Released,
    /// The host revoked the offer.
    Rescinded,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid channel state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ChannelState,
    pub to: ChannelState,
}

impl ChannelState {
    /// Returns whether moving from `self` to `to` is allowed.
    pub fn can_transition(self, to: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, to),
            (Offered, Opening)
                | (Opening, Open)
                | (Opening, Offered)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closed, Opening)
                | (Closed, Released)
                | (Offered, Released)
                | (Rescinded, Released)
                | (Offered | Opening | Open | Closing | Closed, Rescinded)
        )
    }

    /// Moves to `to`, or fails leaving the state unchanged.
    pub fn transition(&mut self, to: ChannelState) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelState::*;
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut state = Offered;
        for to in [Opening, Open, Closing, Closed, Released] {
            state.transition(to).unwrap();
        }
        assert_eq!(state, Released);
    }

    #[test]
    fn test_open_failure_and_reopen() {
        let mut state = Offered;
        state.transition(Opening).unwrap();
        state.transition(Offered).unwrap();
        state.transition(Opening).unwrap();
        state.transition(Open).unwrap();

        // Opening twice without a close is refused.
        assert_eq!(
            state.transition(Opening),
            Err(InvalidTransition {
                from: Open,
                to: Opening
            })
        );
        assert_eq!(state, Open);

        state.transition(Closing).unwrap();
        state.transition(Closed).unwrap();
        state.transition(Opening).unwrap();
    }

    #[test]
    fn test_rescind() {
        for from in [Offered, Opening, Open, Closing, Closed] {
            let mut state = from;
            state.transition(Rescinded).unwrap();
            assert!(state.transition(Opening).is_err());
            state.transition(Released).unwrap();
        }
        assert!(Released.transition(Rescinded).is_err());
        assert!(!Released.can_transition(Rescinded));
    }
}
