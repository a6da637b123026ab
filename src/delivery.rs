//! Courier claims on quantity, and the handoff protocol that moves them.
//!
//! A delivery comes into being in one of three ways:
//!
//! - a courier reserves straight from a ready [`Batch`] (`Reserved`),
//! - a producer or receiving site publishes a direct offer (`Available`),
//! - a courier commits to part or all of an offer, splitting it into a
//!   `PendingConfirmation` child that points back at the offer through
//!   `parent_delivery_id`.
//!
//! Cancelling undoes exactly what the claim took: batch quantity goes back to
//! the batch, split quantity goes back to the parent offer.
use std::fmt;

use chrono::{TimeDelta, Utc};
use tracing::warn;

use crate::batch::Batch;
use crate::cancel::Cancellable;
use crate::code::{generate_code, validate_format};
use crate::error::{LedgerError, Result};
use crate::store::{Row, Txn};
use crate::types::{Actor, EntityKind, Role, TimeStamp, expiry};
use crate::witness::{Witness, WitnessAction};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    #[n(0)]
    Available,
    #[n(1)]
    Reserved,
    #[n(2)]
    PendingConfirmation,
    #[n(3)]
    PickedUp,
    #[n(4)]
    InTransit,
    #[n(5)]
    Delivered,
    #[n(6)]
    Cancelled,
    #[n(7)]
    Expired,
}

impl DeliveryStatus {
    /// Not yet in a terminal state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Available
                | DeliveryStatus::Reserved
                | DeliveryStatus::PendingConfirmation
                | DeliveryStatus::PickedUp
                | DeliveryStatus::InTransit
        )
    }

    /// Held by a courier and still moving.
    pub fn is_claimed(self) -> bool {
        self.is_active() && self != DeliveryStatus::Available
    }

    /// Anything past the final pickup handoff is irreversible.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Available
                | DeliveryStatus::PendingConfirmation
                | DeliveryStatus::Reserved
                | DeliveryStatus::PickedUp
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A direct offer published by a producer or a receiving site.
#[derive(Debug, Clone, Default)]
pub struct NewOffer {
    pub good: String,
    pub quantity: u64,
    pub batch_id: Option<String>,
    pub site_id: Option<String>,
    pub expires_in: Option<TimeDelta>,
}

impl NewOffer {
    pub fn new(good: impl Into<String>, quantity: u64) -> Self {
        Self {
            good: good.into(),
            quantity,
            ..Default::default()
        }
    }
    pub fn from_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
    pub fn to_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }
    pub fn expires_in(mut self, window: TimeDelta) -> Self {
        self.expires_in = Some(window);
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub good: String,
    #[n(2)]
    pub quantity: u64,
    #[n(3)]
    pub offered_quantity: Option<u64>, // original size of a direct offer
    #[n(4)]
    pub status: DeliveryStatus,
    #[n(5)]
    pub batch_id: Option<String>,
    #[n(6)]
    pub holds_batch: bool, // quantity was taken out of `batch_id`
    #[n(7)]
    pub parent_delivery_id: Option<String>,
    #[n(8)]
    pub courier_id: Option<String>,
    #[n(9)]
    pub producer_id: Option<String>,
    #[n(10)]
    pub site_id: Option<String>,
    #[n(11)]
    pub pickup_code: Option<String>,
    #[n(12)]
    pub delivery_code: Option<String>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
    #[n(14)]
    pub accepted_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub picked_up_at: Option<TimeStamp<Utc>>,
    #[n(16)]
    pub in_transit_at: Option<TimeStamp<Utc>>,
    #[n(17)]
    pub delivered_at: Option<TimeStamp<Utc>>,
    #[n(18)]
    pub expires_at: Option<TimeStamp<Utc>>,
}

impl Delivery {
    /// Claim up to `requested` units straight from a ready batch.
    pub fn reserve_from_batch(
        id: String,
        courier: &Actor,
        batch: &mut Batch,
        requested: u64,
        site_id: Option<String>,
        now: TimeStamp<Utc>,
        window: TimeDelta,
    ) -> Result<Self> {
        let expires_at = expiry(&now, window)?;
        let quantity = batch.reserve(requested, &now)?;

        Ok(Self {
            id,
            good: batch.good.clone(),
            quantity,
            offered_quantity: None,
            status: DeliveryStatus::Reserved,
            batch_id: Some(batch.id.clone()),
            holds_batch: true,
            parent_delivery_id: None,
            courier_id: Some(courier.id.clone()),
            producer_id: Some(batch.producer_id.clone()),
            site_id,
            pickup_code: Some(generate_code()),
            delivery_code: None,
            created_at: now.clone(),
            accepted_at: Some(now.clone()),
            picked_up_at: None,
            in_transit_at: None,
            delivered_at: None,
            expires_at: Some(expires_at),
        })
    }

    pub fn offer(id: String, creator: &Actor, new: NewOffer, now: TimeStamp<Utc>) -> Result<Self> {
        if new.quantity == 0 {
            return Err(LedgerError::InvalidQuantity {
                requested: 0,
                reason: "an offer must hold at least one unit",
            });
        }
        let expires_at = new
            .expires_in
            .map(|window| expiry(&now, window))
            .transpose()?;
        let (producer_id, site_id) = match creator.role {
            Role::Producer => (Some(creator.id.clone()), new.site_id),
            Role::Site => (None, Some(creator.id.clone())),
            Role::Courier => {
                return Err(LedgerError::unauthorized(
                    &creator.id,
                    "publish",
                    EntityKind::Delivery,
                    &id,
                ));
            }
        };

        Ok(Self {
            id,
            good: new.good,
            quantity: new.quantity,
            offered_quantity: Some(new.quantity),
            status: DeliveryStatus::Available,
            batch_id: new.batch_id,
            holds_batch: false,
            parent_delivery_id: None,
            courier_id: None,
            producer_id,
            site_id,
            pickup_code: None,
            delivery_code: None,
            created_at: now.clone(),
            accepted_at: None,
            picked_up_at: None,
            in_transit_at: None,
            delivered_at: None,
            expires_at,
        })
    }

    /// Split `requested` units off this offer into a new child claimed by `courier`.
    ///
    /// When the offer is backed by a batch the same amount is reserved from
    /// it; should the batch hold less, the claim is clamped to what it holds.
    /// The offer stays alive even at zero so cancelled children have
    /// somewhere to return to.
    pub fn commit(
        &mut self,
        child_id: String,
        courier: &Actor,
        requested: u64,
        batch: Option<&mut Batch>,
        now: TimeStamp<Utc>,
        window: TimeDelta,
    ) -> Result<Delivery> {
        if requested == 0 || requested > self.quantity {
            return Err(LedgerError::InvalidQuantity {
                requested,
                reason: "must be positive and no more than the offer holds",
            });
        }
        if self.status != DeliveryStatus::Available || self.courier_id.is_some() {
            return Err(LedgerError::NotAvailable {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        if self.is_lapsed(&now) {
            return Err(self.expired());
        }
        let expires_at = expiry(&now, window)?;

        let (quantity, holds_batch) = match batch {
            Some(batch) => (batch.reserve(requested, &now)?, true),
            None => (requested, false),
        };
        self.quantity -= quantity;

        Ok(Delivery {
            id: child_id,
            good: self.good.clone(),
            quantity,
            offered_quantity: None,
            status: DeliveryStatus::PendingConfirmation,
            batch_id: self.batch_id.clone(),
            holds_batch,
            parent_delivery_id: Some(self.id.clone()),
            courier_id: Some(courier.id.clone()),
            producer_id: self.producer_id.clone(),
            site_id: self.site_id.clone(),
            pickup_code: Some(generate_code()),
            delivery_code: Some(generate_code()),
            created_at: now.clone(),
            accepted_at: Some(now.clone()),
            picked_up_at: None,
            in_transit_at: None,
            delivered_at: None,
            expires_at: Some(expires_at),
        })
    }

    pub fn confirm_pickup(&mut self, code: &str, now: TimeStamp<Utc>) -> Result<()> {
        if !matches!(
            self.status,
            DeliveryStatus::Reserved | DeliveryStatus::PendingConfirmation
        ) {
            return Err(self.invalid_state("confirm pickup"));
        }
        if self.is_lapsed(&now) {
            return Err(self.expired());
        }
        self.check_code(self.pickup_code.as_deref(), code)?;

        if self.delivery_code.is_none() {
            self.delivery_code = Some(generate_code());
        }
        self.picked_up_at = Some(now);
        self.status = DeliveryStatus::PickedUp;

        Ok(())
    }

    pub fn start_transit(&mut self, now: TimeStamp<Utc>) -> Result<()> {
        if self.status != DeliveryStatus::PickedUp {
            return Err(self.invalid_state("start transit"));
        }
        self.in_transit_at = Some(now);
        self.status = DeliveryStatus::InTransit;

        Ok(())
    }

    /// Direct offers may go straight from `PendingConfirmation` to delivered.
    pub fn confirm_delivery(&mut self, code: &str, now: TimeStamp<Utc>) -> Result<()> {
        if !matches!(
            self.status,
            DeliveryStatus::PickedUp | DeliveryStatus::InTransit | DeliveryStatus::PendingConfirmation
        ) {
            return Err(self.invalid_state("confirm delivery"));
        }
        if self.is_lapsed(&now) {
            return Err(self.expired());
        }
        self.check_code(self.delivery_code.as_deref(), code)?;

        self.delivered_at = Some(now);
        self.status = DeliveryStatus::Delivered;

        Ok(())
    }

    /// Persist a lapse the sweeper observed. Quantity restoration is the caller's job.
    pub fn expire(&mut self, now: &TimeStamp<Utc>) -> Result<()> {
        if !self.is_lapsed(now) {
            return Err(self.invalid_state("expire"));
        }
        self.status = DeliveryStatus::Expired;
        Ok(())
    }

    /// Give split quantity back to this offer. Returns the amount restored.
    pub fn restore_split(&mut self, quantity: u64) -> u64 {
        let ceiling = self.offered_quantity.unwrap_or(u64::MAX);
        let restored = quantity.min(ceiling.saturating_sub(self.quantity));
        self.quantity += restored;
        restored
    }

    /// True when this delivery took `batch_id`'s quantity.
    pub fn holds(&self, batch_id: &str) -> bool {
        self.holds_batch && self.batch_id.as_deref() == Some(batch_id)
    }

    /// A claim or offer whose pickup window has closed without a handoff.
    pub fn is_lapsed(&self, now: &TimeStamp<Utc>) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Available | DeliveryStatus::Reserved | DeliveryStatus::PendingConfirmation
        ) && self.expires_at.as_ref().is_some_and(|at| at.has_passed(now))
    }

    pub fn effective_status(&self, now: &TimeStamp<Utc>) -> DeliveryStatus {
        if self.is_lapsed(now) {
            DeliveryStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_assigned_to(&self, actor: &Actor) -> bool {
        self.courier_id.as_deref() == Some(actor.id.as_str())
    }

    pub(crate) fn invalid_state(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidState {
            entity: EntityKind::Delivery,
            id: self.id.clone(),
            status: self.status.to_string(),
            action,
        }
    }

    fn expired(&self) -> LedgerError {
        LedgerError::Expired {
            entity: EntityKind::Delivery,
            id: self.id.clone(),
        }
    }

    fn check_code(&self, expected: Option<&str>, submitted: &str) -> Result<()> {
        match expected {
            Some(expected) if validate_format(submitted) && expected == submitted => Ok(()),
            _ => Err(LedgerError::InvalidCode {
                delivery_id: self.id.clone(),
            }),
        }
    }
}

impl Row for Delivery {
    const PREFIX: &'static str = "delivery";
    const KIND: EntityKind = EntityKind::Delivery;

    fn id(&self) -> &str {
        &self.id
    }

    fn index_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(batch_id) = &self.batch_id {
            keys.push(by_batch(batch_id));
        }
        if let Some(parent_id) = &self.parent_delivery_id {
            keys.push(by_parent(parent_id));
        }
        if let Some(courier_id) = &self.courier_id {
            keys.push(by_courier(courier_id));
        }
        keys
    }
}

fn by_batch(batch_id: &str) -> String {
    format!("batch/{batch_id}")
}

fn by_parent(parent_id: &str) -> String {
    format!("parent/{parent_id}")
}

fn by_courier(courier_id: &str) -> String {
    format!("courier/{courier_id}")
}

/// Every delivery that names `batch_id`, whether or not it holds batch quantity.
pub fn referencing_batch(txn: &Txn<'_>, batch_id: &str) -> Result<Vec<Delivery>> {
    txn.lookup(&by_batch(batch_id))
}

pub fn children_of(txn: &Txn<'_>, parent_id: &str) -> Result<Vec<Delivery>> {
    txn.lookup(&by_parent(parent_id))
}

/// Claims a courier is still carrying or could still pick up.
pub fn active_for_courier(
    txn: &Txn<'_>,
    courier_id: &str,
    now: &TimeStamp<Utc>,
) -> Result<Vec<Delivery>> {
    Ok(txn
        .lookup::<Delivery>(&by_courier(courier_id))?
        .into_iter()
        .filter(|d| d.status.is_claimed() && !d.is_lapsed(now))
        .collect())
}

/// Lock order for anything touching a delivery: batch, then parent, then the delivery.
pub(crate) fn lock_with_upstream(txn: &mut Txn<'_>, id: &str) -> Result<Delivery> {
    let peek: Delivery = txn
        .read(id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::Delivery, id))?;
    if let Some(batch_id) = &peek.batch_id {
        txn.lock_row::<Batch>(batch_id)?;
    }
    if let Some(parent_id) = &peek.parent_delivery_id {
        txn.lock_row::<Delivery>(parent_id)?;
    }
    txn.lock(id)
}

/// Hand claimed quantity back to wherever it came from and return how much moved.
pub(crate) fn restore_upstream(
    txn: &mut Txn<'_>,
    delivery: &Delivery,
    actor_id: &str,
    now: &TimeStamp<Utc>,
) -> Result<u64> {
    let mut restored = 0;

    if delivery.holds_batch {
        if let Some(batch_id) = &delivery.batch_id {
            let mut batch: Batch = txn.lock(batch_id)?;
            restored = batch.release(delivery.quantity);
            txn.put(&batch)?;
            txn.witness(Witness::new(
                batch_id.as_str(),
                actor_id,
                now.clone(),
                WitnessAction::BatchReleased {
                    delivery_id: delivery.id.clone(),
                    quantity: restored,
                },
            ))?;
        }
    }

    if let Some(parent_id) = &delivery.parent_delivery_id {
        txn.lock_row::<Delivery>(parent_id)?;
        match txn.read::<Delivery>(parent_id)? {
            Some(mut parent) => {
                let returned = parent.restore_split(delivery.quantity);
                restored = restored.max(returned);
                txn.put(&parent)?;
                txn.witness(Witness::new(
                    parent_id.as_str(),
                    actor_id,
                    now.clone(),
                    WitnessAction::SplitRestored {
                        child_id: delivery.id.clone(),
                        quantity: returned,
                    },
                ))?;
            }
            None => warn!(
                delivery_id = %delivery.id,
                parent_id = %parent_id,
                "parent offer is gone; split quantity not restored"
            ),
        }
    }

    Ok(restored)
}

impl Cancellable for Delivery {
    fn lock_for_cancel(txn: &mut Txn<'_>, id: &str) -> Result<Self> {
        lock_with_upstream(txn, id)
    }

    /// The assigned courier, the owning producer, or the receiving site.
    fn may_cancel(&self, txn: &Txn<'_>, actor: &Actor) -> Result<bool> {
        let allowed = match actor.role {
            Role::Courier => self.is_assigned_to(actor),
            Role::Producer => match &self.batch_id {
                Some(batch_id) => txn
                    .read::<Batch>(batch_id)?
                    .is_some_and(|b| b.producer_id == actor.id),
                None => self.producer_id.as_deref() == Some(actor.id.as_str()),
            },
            Role::Site => self.site_id.as_deref() == Some(actor.id.as_str()),
        };
        Ok(allowed)
    }

    fn cancellable_status(&self) -> bool {
        self.status.is_cancellable()
    }

    fn status_error(&self) -> LedgerError {
        self.invalid_state("cancel")
    }

    fn restore(self, txn: &mut Txn<'_>, actor: &Actor, now: &TimeStamp<Utc>) -> Result<u64> {
        if self.status == DeliveryStatus::Available {
            let outstanding = children_of(txn, &self.id)?
                .iter()
                .filter(|c| c.status.is_active())
                .count();
            if outstanding > 0 {
                return Err(LedgerError::HasActiveDeliveries {
                    entity: EntityKind::Delivery,
                    id: self.id.clone(),
                    count: outstanding,
                });
            }
        }

        let restored = restore_upstream(txn, &self, &actor.id, now)?;
        txn.remove(&self);

        Ok(restored)
    }
}
