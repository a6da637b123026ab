//! Receiving-site requests and the courier reservations filling them.
//!
//! A request's status is never set directly. It is recomputed from its items
//! by [`derive_status`] after every reservation, cancellation or delivery.
use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;

use crate::cancel::Cancellable;
use crate::error::{LedgerError, Result};
use crate::store::{Row, Txn};
use crate::types::{Actor, EntityKind, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    #[n(0)]
    Requesting,
    #[n(1)]
    PartiallyReserved,
    #[n(2)]
    Reserved,
    #[n(3)]
    Completed,
    #[n(4)]
    Cancelled,
    #[n(5)]
    Expired,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    #[n(0)]
    Reserved,
    #[n(1)]
    Delivered,
    #[n(2)]
    Cancelled,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A line a site asks for.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub name: String,
    pub quantity: u64,
}

impl NewItem {
    pub fn new(name: impl Into<String>, quantity: u64) -> Self {
        Self {
            name: name.into(),
            quantity,
        }
    }
}

/// A courier's claim on one line of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemClaim {
    pub item_id: String,
    pub quantity: u64,
}

impl ItemClaim {
    pub fn new(item_id: impl Into<String>, quantity: u64) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub site_id: String,
    #[n(2)]
    pub item_ids: Vec<String>,
    #[n(3)]
    status: RequestStatus,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub expires_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ResourceItem {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub quantity: u64,
    #[n(4)]
    pub quantity_reserved: u64, // includes whatever has since been delivered
    #[n(5)]
    pub quantity_delivered: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ReservationItem {
    #[n(0)]
    pub resource_item_id: String,
    #[n(1)]
    pub quantity: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ResourceReservation {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub courier_id: String,
    #[n(3)]
    pub status: ReservationStatus,
    #[n(4)]
    pub items: Vec<ReservationItem>,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub delivered_at: Option<TimeStamp<Utc>>,
}

/// Status as a pure function of item state.
pub fn derive_status(items: &[ResourceItem]) -> RequestStatus {
    if items.is_empty() {
        return RequestStatus::Requesting;
    }
    if items.iter().all(|i| i.quantity_delivered >= i.quantity) {
        RequestStatus::Completed
    } else if items.iter().all(|i| i.quantity_reserved >= i.quantity) {
        RequestStatus::Reserved
    } else if items.iter().any(|i| i.quantity_reserved > 0) {
        RequestStatus::PartiallyReserved
    } else {
        RequestStatus::Requesting
    }
}

/// Fold duplicate claims on the same item together, ordered by item id.
pub fn merge_claims(claims: &[ItemClaim]) -> Result<Vec<ItemClaim>> {
    if claims.is_empty() {
        return Err(LedgerError::InvalidQuantity {
            requested: 0,
            reason: "a reservation must claim at least one item",
        });
    }
    let mut merged: BTreeMap<&str, u64> = BTreeMap::new();
    for claim in claims {
        if claim.quantity == 0 {
            return Err(LedgerError::InvalidQuantity {
                requested: 0,
                reason: "each claimed item needs a positive quantity",
            });
        }
        let total = merged.entry(claim.item_id.as_str()).or_default();
        *total = total.saturating_add(claim.quantity);
    }

    Ok(merged
        .into_iter()
        .map(|(item_id, quantity)| ItemClaim::new(item_id, quantity))
        .collect())
}

impl ResourceRequest {
    pub fn new(
        id: String,
        site_id: String,
        item_ids: Vec<String>,
        expires_at: Option<TimeStamp<Utc>>,
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            site_id,
            item_ids,
            status: RequestStatus::Requesting,
            created_at: now,
            expires_at,
            cancelled_at: None,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Requests nobody has fully covered lapse once `expires_at` passes.
    pub fn effective_status(&self, now: &TimeStamp<Utc>) -> RequestStatus {
        let lapsed = self.expires_at.as_ref().is_some_and(|at| at.has_passed(now));
        match self.status {
            RequestStatus::Requesting | RequestStatus::PartiallyReserved if lapsed => {
                RequestStatus::Expired
            }
            status => status,
        }
    }

    pub fn recompute(&mut self, items: &[ResourceItem]) {
        self.status = if self.cancelled_at.is_some() {
            RequestStatus::Cancelled
        } else {
            derive_status(items)
        };
    }

    pub fn accepts_reservations(&self, now: &TimeStamp<Utc>) -> Result<()> {
        match self.effective_status(now) {
            RequestStatus::Requesting | RequestStatus::PartiallyReserved => Ok(()),
            RequestStatus::Expired => Err(LedgerError::Expired {
                entity: EntityKind::Request,
                id: self.id.clone(),
            }),
            status => Err(LedgerError::InvalidState {
                entity: EntityKind::Request,
                id: self.id.clone(),
                status: status.to_string(),
                action: "accept reservations",
            }),
        }
    }
}

impl ResourceItem {
    pub fn new(id: String, request_id: String, name: String, quantity: u64) -> Self {
        Self {
            id,
            request_id,
            name,
            quantity,
            quantity_reserved: 0,
            quantity_delivered: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.quantity_reserved)
    }

    pub fn reserve(&mut self, quantity: u64) -> Result<()> {
        let remaining = self.remaining();
        if quantity > remaining {
            return Err(LedgerError::InsufficientQuantity {
                item_id: self.id.clone(),
                requested: quantity,
                remaining,
            });
        }
        self.quantity_reserved += quantity;
        Ok(())
    }

    /// Floored at zero; the stored count is never trusted to be consistent.
    pub fn unreserve(&mut self, quantity: u64) {
        self.quantity_reserved = self.quantity_reserved.saturating_sub(quantity);
    }

    pub fn deliver(&mut self, quantity: u64) {
        self.quantity_delivered = (self.quantity_delivered + quantity).min(self.quantity_reserved);
    }
}

impl ResourceReservation {
    pub fn new(
        id: String,
        request_id: String,
        courier_id: String,
        claims: &[ItemClaim],
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            request_id,
            courier_id,
            status: ReservationStatus::Reserved,
            items: claims
                .iter()
                .map(|c| ReservationItem {
                    resource_item_id: c.item_id.clone(),
                    quantity: c.quantity,
                })
                .collect(),
            created_at: now,
            delivered_at: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.items.iter().map(|i| i.quantity).sum()
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.resource_item_id.clone()).collect()
    }

    pub fn mark_delivered(&mut self, now: TimeStamp<Utc>) -> Result<()> {
        if self.status != ReservationStatus::Reserved {
            return Err(LedgerError::InvalidState {
                entity: EntityKind::Reservation,
                id: self.id.clone(),
                status: self.status.to_string(),
                action: "deliver",
            });
        }
        self.status = ReservationStatus::Delivered;
        self.delivered_at = Some(now);
        Ok(())
    }
}

impl Row for ResourceRequest {
    const PREFIX: &'static str = "request";
    const KIND: EntityKind = EntityKind::Request;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Row for ResourceItem {
    const PREFIX: &'static str = "item";
    const KIND: EntityKind = EntityKind::Item;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Row for ResourceReservation {
    const PREFIX: &'static str = "reservation";
    const KIND: EntityKind = EntityKind::Reservation;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Lock order: request, then its items ascending, then the reservation.
pub(crate) fn lock_reservation(
    txn: &mut Txn<'_>,
    id: &str,
) -> Result<(ResourceRequest, ResourceReservation)> {
    let peek: ResourceReservation = txn
        .read(id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::Reservation, id))?;
    let request: ResourceRequest = txn.lock(&peek.request_id)?;
    txn.lock_all::<ResourceItem>(&peek.item_ids())?;
    let reservation = txn.lock(id)?;

    Ok((request, reservation))
}

/// Write back the request with its status recomputed from current items.
pub(crate) fn refresh_request(txn: &mut Txn<'_>, request: &mut ResourceRequest) -> Result<()> {
    let mut items = Vec::with_capacity(request.item_ids.len());
    for item_id in &request.item_ids {
        let item = txn
            .read::<ResourceItem>(item_id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Item, item_id))?;
        items.push(item);
    }
    request.recompute(&items);
    txn.put(&*request)
}

impl Cancellable for ResourceReservation {
    fn lock_for_cancel(txn: &mut Txn<'_>, id: &str) -> Result<Self> {
        lock_reservation(txn, id).map(|(_, reservation)| reservation)
    }

    fn may_cancel(&self, _txn: &Txn<'_>, actor: &Actor) -> Result<bool> {
        Ok(actor.id == self.courier_id)
    }

    fn cancellable_status(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    fn status_error(&self) -> LedgerError {
        LedgerError::WrongState {
            id: self.id.clone(),
            status: self.status.to_string(),
        }
    }

    fn restore(self, txn: &mut Txn<'_>, _actor: &Actor, _now: &TimeStamp<Utc>) -> Result<u64> {
        for claim in &self.items {
            let mut item: ResourceItem = txn.lock(&claim.resource_item_id)?;
            item.unreserve(claim.quantity);
            txn.put(&item)?;
        }
        txn.remove(&self);

        let mut request: ResourceRequest = txn.lock(&self.request_id)?;
        refresh_request(txn, &mut request)?;

        Ok(self.total())
    }
}

impl Cancellable for ResourceRequest {
    fn lock_for_cancel(txn: &mut Txn<'_>, id: &str) -> Result<Self> {
        txn.lock(id)
    }

    fn may_cancel(&self, _txn: &Txn<'_>, actor: &Actor) -> Result<bool> {
        Ok(actor.id == self.site_id)
    }

    /// Only while nothing has been reserved against it.
    fn cancellable_status(&self) -> bool {
        matches!(self.status, RequestStatus::Requesting)
    }

    fn status_error(&self) -> LedgerError {
        LedgerError::InvalidState {
            entity: EntityKind::Request,
            id: self.id.clone(),
            status: self.status.to_string(),
            action: "cancel",
        }
    }

    fn restore(mut self, txn: &mut Txn<'_>, _actor: &Actor, now: &TimeStamp<Utc>) -> Result<u64> {
        self.cancelled_at = Some(now.clone());
        self.status = RequestStatus::Cancelled;
        txn.put(&self)?;

        Ok(0)
    }
}
