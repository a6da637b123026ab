//! Producer-published lots of a single good.
//!
//! `quantity` is fixed at creation. `quantity_available` only moves through
//! [`Batch::reserve`] and [`Batch::release`] and always stays in
//! `0..=quantity`.
use std::fmt;

use chrono::{TimeDelta, Utc};

use crate::cancel::Cancellable;
use crate::delivery::{self, Delivery};
use crate::error::{LedgerError, Result};
use crate::store::{Row, Txn};
use crate::types::{Actor, EntityKind, TimeStamp, expiry};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    #[n(0)]
    Producing,
    #[n(1)]
    Ready,
    #[n(2)]
    InDelivery,
    #[n(3)]
    Completed,
    #[n(4)]
    Cancelled,
    #[n(5)]
    Expired,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a producer supplies when publishing a batch.
#[derive(Debug, Clone, Default)]
pub struct NewBatch {
    pub good: String,
    pub quantity: u64,
    pub shelf_life: Option<TimeDelta>,
    pub notes: Option<String>,
}

impl NewBatch {
    pub fn new(good: impl Into<String>, quantity: u64) -> Self {
        Self {
            good: good.into(),
            quantity,
            ..Default::default()
        }
    }
    pub fn with_shelf_life(mut self, shelf_life: TimeDelta) -> Self {
        self.shelf_life = Some(shelf_life);
        self
    }
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub producer_id: String,
    #[n(2)]
    pub good: String,
    #[n(3)]
    quantity: u64,
    #[n(4)]
    quantity_available: u64,
    #[n(5)]
    status: BatchStatus,
    #[n(6)]
    pub shelf_life_secs: i64,
    #[n(7)]
    pub notes: Option<String>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub ready_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub expires_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub closed_at: Option<TimeStamp<Utc>>, // completed, cancelled or expired
}

impl Batch {
    pub fn create(
        id: String,
        producer_id: String,
        new: NewBatch,
        default_shelf_life: TimeDelta,
        now: TimeStamp<Utc>,
    ) -> Result<Self> {
        if new.quantity == 0 {
            return Err(LedgerError::InvalidQuantity {
                requested: 0,
                reason: "a batch must hold at least one unit",
            });
        }
        // stored in whole seconds, so anything under one second is no shelf life at all
        let shelf_life = new.shelf_life.unwrap_or(default_shelf_life);
        if shelf_life.num_seconds() <= 0 {
            return Err(LedgerError::InvalidWindow { window: shelf_life });
        }
        expiry(&now, shelf_life)?;

        Ok(Self {
            id,
            producer_id,
            good: new.good,
            quantity: new.quantity,
            quantity_available: new.quantity,
            status: BatchStatus::Producing,
            shelf_life_secs: shelf_life.num_seconds(),
            notes: new.notes,
            created_at: now,
            ready_at: None,
            expires_at: None,
            closed_at: None,
        })
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn quantity_available(&self) -> u64 {
        self.quantity_available
    }

    /// The stored status. Prefer [`Batch::effective_status`] when reporting.
    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Ready batches whose `expires_at` has passed read as expired.
    pub fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.status == BatchStatus::Ready
            && self.expires_at.as_ref().is_some_and(|at| at.has_passed(now))
    }

    pub fn effective_status(&self, now: &TimeStamp<Utc>) -> BatchStatus {
        if self.is_expired(now) {
            BatchStatus::Expired
        } else {
            self.status
        }
    }

    pub fn mark_ready(&mut self, now: TimeStamp<Utc>) -> Result<()> {
        if self.status != BatchStatus::Producing {
            return Err(self.invalid_state("mark ready"));
        }
        let shelf_life = TimeDelta::try_seconds(self.shelf_life_secs).ok_or(
            LedgerError::InvalidWindow {
                window: TimeDelta::MAX,
            },
        )?;
        self.expires_at = Some(expiry(&now, shelf_life)?);
        self.ready_at = Some(now);
        self.status = BatchStatus::Ready;

        Ok(())
    }

    /// Take up to `requested` units. Returns the amount actually taken.
    pub fn reserve(&mut self, requested: u64, now: &TimeStamp<Utc>) -> Result<u64> {
        if requested == 0 {
            return Err(LedgerError::InvalidQuantity {
                requested,
                reason: "must reserve at least one unit",
            });
        }
        if self.status != BatchStatus::Ready {
            return Err(LedgerError::NotReady {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        if self.is_expired(now) {
            return Err(LedgerError::Expired {
                entity: EntityKind::Batch,
                id: self.id.clone(),
            });
        }

        let actual = requested.min(self.quantity_available);
        if actual == 0 {
            return Err(LedgerError::NotReady {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.quantity_available -= actual;
        if self.quantity_available == 0 {
            self.status = BatchStatus::InDelivery;
        }

        Ok(actual)
    }

    /// Give back units taken by [`Batch::reserve`]. Never exceeds `quantity`.
    /// Returns the amount actually restored.
    pub fn release(&mut self, quantity: u64) -> u64 {
        let restored = quantity.min(self.quantity - self.quantity_available);
        self.quantity_available += restored;
        if self.status == BatchStatus::InDelivery && self.quantity_available > 0 {
            self.status = BatchStatus::Ready;
        }

        restored
    }

    /// Close out a fully claimed batch once nothing holding its quantity is
    /// still outstanding. Returns whether the batch completed.
    pub fn settle(&mut self, outstanding: usize, now: TimeStamp<Utc>) -> bool {
        if self.status == BatchStatus::InDelivery && self.quantity_available == 0 && outstanding == 0
        {
            self.status = BatchStatus::Completed;
            self.closed_at = Some(now);
            return true;
        }
        false
    }

    pub fn cancel(&mut self, active_deliveries: usize, now: TimeStamp<Utc>) -> Result<()> {
        if !matches!(self.status, BatchStatus::Producing | BatchStatus::Ready) {
            return Err(self.invalid_state("cancel"));
        }
        if active_deliveries > 0 {
            return Err(LedgerError::HasActiveDeliveries {
                entity: EntityKind::Batch,
                id: self.id.clone(),
                count: active_deliveries,
            });
        }
        self.status = BatchStatus::Cancelled;
        self.closed_at = Some(now);

        Ok(())
    }

    /// Persist the lazily observed expiry. Returns whether anything changed.
    pub fn expire(&mut self, now: &TimeStamp<Utc>) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        self.status = BatchStatus::Expired;
        self.closed_at = Some(now.clone());
        true
    }

    fn invalid_state(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidState {
            entity: EntityKind::Batch,
            id: self.id.clone(),
            status: self.status.to_string(),
            action,
        }
    }
}

impl Row for Batch {
    const PREFIX: &'static str = "batch";
    const KIND: EntityKind = EntityKind::Batch;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Where a batch's original quantity currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLedger {
    pub quantity: u64,
    pub available: u64,
    pub active: u64,
    pub delivered: u64,
}

impl BatchLedger {
    pub fn tally(batch: &Batch, deliveries: &[Delivery]) -> Self {
        let mut ledger = Self {
            quantity: batch.quantity,
            available: batch.quantity_available,
            active: 0,
            delivered: 0,
        };
        for d in deliveries.iter().filter(|d| d.holds(&batch.id)) {
            if d.status.is_claimed() {
                ledger.active += d.quantity;
            } else if d.status == delivery::DeliveryStatus::Delivered {
                ledger.delivered += d.quantity;
            }
        }
        ledger
    }

    pub fn is_balanced(&self) -> bool {
        self.available + self.active + self.delivered == self.quantity
    }
}

impl Cancellable for Batch {
    fn lock_for_cancel(txn: &mut Txn<'_>, id: &str) -> Result<Self> {
        txn.lock(id)
    }

    fn may_cancel(&self, _txn: &Txn<'_>, actor: &Actor) -> Result<bool> {
        Ok(actor.id == self.producer_id)
    }

    fn cancellable_status(&self) -> bool {
        matches!(self.status, BatchStatus::Producing | BatchStatus::Ready)
    }

    fn status_error(&self) -> LedgerError {
        self.invalid_state("cancel")
    }

    fn restore(mut self, txn: &mut Txn<'_>, _actor: &Actor, now: &TimeStamp<Utc>) -> Result<u64> {
        let active = delivery::referencing_batch(txn, &self.id)?
            .iter()
            .filter(|d| d.status.is_active())
            .count();
        self.cancel(active, now.clone())?;
        txn.put(&self)?;

        Ok(0)
    }
}
