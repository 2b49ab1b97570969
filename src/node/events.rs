//! Consensus event notifications.

use tokio::sync::broadcast;

use crate::consensus::UnitId;

/// Something other components may want to react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// Fired once per MCI, in order
    MciBecameStable { mci: u64 },
    /// A unit was permanently discarded: invalid, poisoned by a bad
    /// dependency, or finalized as bad by conflict resolution
    UnitRejected { unit: UnitId, reason: String },
}

/// Broadcast channel for [`ConsensusEvent`]s.
///
/// Sending never blocks; slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ConsensusEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::constants::EVENT_CHANNEL_CAPACITY)
    }
}
