use crate::message::{Envelope, ProtocolError};
use serde_json::Value;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    AwaitingReply(i64),
}

/// What became of an envelope handed to [`Correlator::accept`].
#[derive(Clone, Debug, PartialEq)]
pub enum Accepted {
    /// A spontaneous message, deliverable right away.
    Notification(Value),
    /// A spontaneous message that arrived while a call was in flight. It was
    /// queued and will be handed out by `next_deferred` once the call resolves.
    Deferred,
    /// The reply to the pending call. The correlator is idle again.
    Reply(Value),
}

/// Matches replies to the single outstanding call of a connection.
///
/// Call indices are negative and strictly decreasing, so an index is never
/// handed out twice on the same connection.
#[derive(Debug)]
pub struct Correlator {
    state: CorrelatorState,
    last_index: i64,
    deferred: VecDeque<Value>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            state: CorrelatorState::Idle,
            last_index: -1,
            deferred: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CorrelatorState {
        self.state
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Allocates the index for a new call and starts waiting for its reply.
    pub fn begin_call(&mut self) -> Result<i64, ProtocolError> {
        if let CorrelatorState::AwaitingReply(pending) = self.state {
            return Err(ProtocolError::CallPending { pending });
        }
        self.last_index -= 1;
        self.state = CorrelatorState::AwaitingReply(self.last_index);
        Ok(self.last_index)
    }

    /// Gives up on the pending call without a reply, e.g. because the channel
    /// went away underneath it.
    pub fn abandon_call(&mut self) {
        self.state = CorrelatorState::Idle;
    }

    pub fn accept(&mut self, envelope: Envelope) -> Result<Accepted, ProtocolError> {
        let Envelope { index, payload } = envelope;
        match self.state {
            CorrelatorState::Idle if index < 0 => Err(ProtocolError::UnsolicitedReply(index)),
            CorrelatorState::Idle => Ok(Accepted::Notification(payload)),
            CorrelatorState::AwaitingReply(expected) if index == expected => {
                self.state = CorrelatorState::Idle;
                Ok(Accepted::Reply(payload))
            }
            CorrelatorState::AwaitingReply(_) if index >= 0 => {
                self.deferred.push_back(payload);
                Ok(Accepted::Deferred)
            }
            CorrelatorState::AwaitingReply(expected) => Err(ProtocolError::UnexpectedReply {
                expected,
                received: index,
            }),
        }
    }

    /// Oldest message deferred during a call. Nothing is handed out while a
    /// call is still pending.
    pub fn next_deferred(&mut self) -> Option<Value> {
        match self.state {
            CorrelatorState::Idle => self.deferred.pop_front(),
            CorrelatorState::AwaitingReply(_) => None,
        }
    }
}
