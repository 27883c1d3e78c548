use std::sync::Arc;

use crate::media::KeyEpoch;

/// Key epoch bookkeeping of a pipeline
#[derive(Debug, Clone)]
pub enum EpochState {
    /// No key material yet, packets are dropped until an epoch is announced
    AwaitingEpoch,
    Active {
        epoch: Arc<KeyEpoch>,
        consecutive_failures: u32,
    },
    /// A resync was requested; packets are dropped until a newer epoch shows up
    Resyncing { last_epoch_id: u64 },
}

impl EpochState {
    pub fn epoch_id(&self) -> Option<u64> {
        match self {
            EpochState::Active { epoch, .. } => Some(epoch.id),
            _ => None,
        }
    }

    /// Whether an announced epoch ends this state
    pub fn accepts(&self, announced: &KeyEpoch) -> bool {
        match self {
            EpochState::AwaitingEpoch => true,
            EpochState::Active { epoch, .. } => announced.id > epoch.id,
            EpochState::Resyncing { last_epoch_id } => announced.id > *last_epoch_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EpochState::AwaitingEpoch => "awaiting-epoch",
            EpochState::Active { .. } => "active",
            EpochState::Resyncing { .. } => "resyncing",
        }
    }
}
