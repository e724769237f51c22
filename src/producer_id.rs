//! Producer-ID recovery (C5): classifies broker errors attached to the
//! shared producer-ID value and transitions it into a reload-pending or
//! fatal state per spec §4.5.

use std::sync::{Arc, RwLock};

use tracing::{error, warn};

use crate::error::BrokerErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerIdState {
    Uninitialized,
    Healthy { id: i64, epoch: i16 },
    ReloadPending,
    Fatal(String),
}

/// Shared value with fields {id, epoch, error} (spec §3 "Producer-ID").
pub struct ProducerId {
    state: RwLock<Arc<ProducerIdState>>,
}

impl Default for ProducerId {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerId {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(ProducerIdState::Uninitialized)),
        }
    }

    pub fn current(&self) -> Arc<ProducerIdState> {
        self.state.read().expect("producer id lock poisoned").clone()
    }

    pub fn set_healthy(&self, id: i64, epoch: i16) {
        *self.state.write().expect("producer id lock poisoned") =
            Arc::new(ProducerIdState::Healthy { id, epoch });
    }

    fn set(&self, next: ProducerIdState) {
        *self.state.write().expect("producer id lock poisoned") = Arc::new(next);
    }

    /// `id_version >= 3` and one of {UnknownProducerID, InvalidProducerIDMapping} -> KIP-360.
    /// `id_version >= 4` and InvalidProducerEpoch -> KIP-588.
    /// Anything else is fatal.
    pub fn classify(id_version: u32, err: BrokerErrorCode) -> Recovery {
        let kip_360 = id_version >= 3
            && (err == BrokerErrorCode::UNKNOWN_PRODUCER_ID
                || err == BrokerErrorCode::INVALID_PRODUCER_ID_MAPPING);
        let kip_588 = id_version >= 4 && err == BrokerErrorCode::INVALID_PRODUCER_EPOCH;

        if kip_360 || kip_588 {
            Recovery::Recoverable
        } else {
            Recovery::Fatal
        }
    }

    /// Applies the recovery decision to the shared state. `is_protocol_error`
    /// distinguishes a non-broker error (always fatal, per spec) from a
    /// broker error code that still needs classification.
    pub fn handle_error(&self, id_version: u32, err: Option<BrokerErrorCode>, context: &str) {
        let Some(err) = err else {
            error!(context, "producer id observed a non-protocol error; marking fatal");
            self.set(ProducerIdState::Fatal(context.to_string()));
            return;
        };

        match Self::classify(id_version, err) {
            Recovery::Recoverable => {
                warn!(context, ?err, "producer id error is recoverable; reload pending");
                self.set(ProducerIdState::ReloadPending);
            }
            Recovery::Fatal => {
                error!(context, ?err, "producer id error is fatal");
                self.set(ProducerIdState::Fatal(context.to_string()));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Recoverable,
    Fatal,
}
