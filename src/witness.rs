//! Audit trail. Every committed transition leaves a witness behind.
use chrono::Utc;

use crate::error::{LedgerError, Result};
use crate::types::TimeStamp;

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Witness {
    #[n(0)]
    pub entity_id: String, // the batch, delivery, request or reservation acted on
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub action: WitnessAction,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum WitnessAction {
    #[n(0)]
    BatchCreated {
        #[n(0)]
        quantity: u64,
    },
    #[n(1)]
    BatchReady,
    #[n(2)]
    BatchReserved {
        #[n(0)]
        delivery_id: String,
        #[n(1)]
        quantity: u64,
    },
    #[n(3)]
    BatchReleased {
        #[n(0)]
        delivery_id: String,
        #[n(1)]
        quantity: u64,
    },
    #[n(4)]
    BatchCompleted,
    #[n(5)]
    BatchExpired,
    #[n(6)]
    OfferCreated {
        #[n(0)]
        quantity: u64,
    },
    #[n(7)]
    Reserved {
        #[n(0)]
        quantity: u64,
    },
    #[n(8)]
    Committed {
        #[n(0)]
        child_id: String,
        #[n(1)]
        quantity: u64,
    },
    #[n(9)]
    SplitRestored {
        #[n(0)]
        child_id: String,
        #[n(1)]
        quantity: u64,
    },
    #[n(10)]
    PickedUp,
    #[n(11)]
    InTransit,
    #[n(12)]
    Delivered,
    #[n(13)]
    DeliveryExpired,
    #[n(14)]
    RequestCreated {
        #[n(0)]
        items: u32,
    },
    #[n(15)]
    ReservationCreated {
        #[n(0)]
        request_id: String,
        #[n(1)]
        quantity: u64,
    },
    #[n(16)]
    ReservationDelivered,
    #[n(17)]
    Cancelled {
        #[n(0)]
        restored: u64,
    },
}

impl Witness {
    pub fn new(
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
        timestamp: TimeStamp<Utc>,
        action: WitnessAction,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor_id: actor_id.into(),
            timestamp,
            action,
        }
    }
    /// Returns the sha256 digest of the CBOR encoding alongside the encoding itself.
    pub fn build(&self) -> Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self).map_err(|e| LedgerError::Encoding(e.to_string()))?;
        let hash = sha256::digest(cbor.as_slice());

        Ok((hash, cbor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_witnesses_hash_identically() {
        let at: TimeStamp<Utc> = Utc::now().into();
        let a = Witness::new("batch1x", "user1y", at.clone(), WitnessAction::BatchReady);
        let b = Witness::new("batch1x", "user1y", at.clone(), WitnessAction::BatchReady);
        let c = Witness::new("batch1x", "user1y", at, WitnessAction::BatchCompleted);

        let (hash_a, cbor_a) = a.build().unwrap();
        assert_eq!(hash_a, b.build().unwrap().0);
        assert_ne!(hash_a, c.build().unwrap().0);

        let decoded: Witness = minicbor::decode(&cbor_a).unwrap();
        assert_eq!(decoded, a);
    }
}
