//! Service layer API for the reservation and fulfillment workflow
//!
//! Every public operation runs as one transaction against the store: lock
//! the rows it touches, apply the transition, append witnesses, commit. Any
//! error before the commit leaves the store exactly as it was.
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{info, warn};

use crate::batch::{Batch, BatchLedger, NewBatch};
use crate::cancel::{self, CancelTarget, Cancelled};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::delivery::{self, Delivery, NewOffer};
use crate::error::{LedgerError, Result};
use crate::resource::{
    self, ItemClaim, NewItem, RequestStatus, ResourceItem, ResourceRequest, ResourceReservation,
};
use crate::store::{Store, Txn};
use crate::types::{Actor, EntityKind, Role, TimeStamp, expiry};
use crate::utils::new_uuid_to_bech32;
use crate::witness::{Witness, WitnessAction};

/// Actor id recorded on witnesses written by [`RelayService::sweep_expired`].
pub const SWEEPER_ID: &str = "system:sweeper";

/// A request together with its line items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub request: ResourceRequest,
    pub items: Vec<ResourceItem>,
}

impl RequestView {
    pub fn status(&self, now: &TimeStamp<Utc>) -> RequestStatus {
        self.request.effective_status(now)
    }

    pub fn item(&self, name: &str) -> Option<&ResourceItem> {
        self.items.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub batches_expired: usize,
    pub deliveries_expired: usize,
    pub skipped: usize,
}

pub struct RelayService {
    store: Store,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl RelayService {
    pub fn new(instance: Arc<sled::Db>, config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Store::new(instance, config.lock_timeout);
        Self {
            store,
            clock,
            config,
        }
    }

    /// Open the database at `config.db_path` on the system clock.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        let db = sled::open(&config.db_path)?;
        info!(path = %config.db_path.display(), "relay ledger opened");
        Ok(Self::new(Arc::new(db), config, Arc::new(SystemClock)))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn now(&self) -> TimeStamp<Utc> {
        self.clock.now()
    }

    // Batches

    pub fn create_batch(&self, producer: &Actor, new: NewBatch) -> Result<Batch> {
        let id = new_uuid_to_bech32("batch")?;
        require_role(producer, Role::Producer, "publish", EntityKind::Batch, &id)?;
        let now = self.now();

        let batch = Batch::create(
            id,
            producer.id.clone(),
            new,
            self.config.default_shelf_life,
            now.clone(),
        )?;

        let mut txn = self.store.begin();
        txn.put(&batch)?;
        txn.witness(Witness::new(
            batch.id.as_str(),
            producer.id.as_str(),
            now,
            WitnessAction::BatchCreated {
                quantity: batch.quantity(),
            },
        ))?;
        txn.commit()?;

        info!(batch_id = %batch.id, good = %batch.good, quantity = batch.quantity(), "batch created");
        Ok(batch)
    }

    pub fn mark_batch_ready(&self, producer: &Actor, batch_id: &str) -> Result<Batch> {
        let now = self.now();
        let mut txn = self.store.begin();

        let mut batch: Batch = txn.lock(batch_id)?;
        if batch.producer_id != producer.id {
            return Err(LedgerError::unauthorized(
                &producer.id,
                "mark ready",
                EntityKind::Batch,
                batch_id,
            ));
        }
        batch.mark_ready(now.clone())?;

        txn.put(&batch)?;
        txn.witness(Witness::new(
            batch_id,
            producer.id.as_str(),
            now,
            WitnessAction::BatchReady,
        ))?;
        txn.commit()?;

        info!(batch_id, "batch ready");
        Ok(batch)
    }

    pub fn batch(&self, batch_id: &str) -> Result<Batch> {
        self.store
            .get(batch_id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Batch, batch_id))
    }

    /// Where every unit of the batch currently sits.
    pub fn batch_ledger(&self, batch_id: &str) -> Result<BatchLedger> {
        let batch = self.batch(batch_id)?;
        let deliveries = delivery::referencing_batch(&self.store.begin(), batch_id)?;
        Ok(BatchLedger::tally(&batch, &deliveries))
    }

    // Deliveries

    pub fn reserve_from_batch(
        &self,
        courier: &Actor,
        batch_id: &str,
        quantity: u64,
        site_id: Option<&str>,
    ) -> Result<Delivery> {
        require_role(courier, Role::Courier, "reserve from", EntityKind::Batch, batch_id)?;
        let now = self.now();
        let mut txn = self.store.begin();

        self.ensure_no_conflicting_claim(&mut txn, courier, &now)?;
        let mut batch: Batch = txn.lock(batch_id)?;

        let delivery = Delivery::reserve_from_batch(
            new_uuid_to_bech32("delivery")?,
            courier,
            &mut batch,
            quantity,
            site_id.map(str::to_string),
            now.clone(),
            self.config.reservation_window,
        )?;

        txn.put(&batch)?;
        txn.put(&delivery)?;
        txn.witness(Witness::new(
            batch_id,
            courier.id.as_str(),
            now.clone(),
            WitnessAction::BatchReserved {
                delivery_id: delivery.id.clone(),
                quantity: delivery.quantity,
            },
        ))?;
        txn.witness(Witness::new(
            delivery.id.as_str(),
            courier.id.as_str(),
            now,
            WitnessAction::Reserved {
                quantity: delivery.quantity,
            },
        ))?;
        txn.commit()?;

        info!(
            batch_id,
            delivery_id = %delivery.id,
            requested = quantity,
            reserved = delivery.quantity,
            available = batch.quantity_available(),
            "reserved from batch"
        );
        Ok(delivery)
    }

    /// Publish a direct offer, optionally backed by one of the producer's batches.
    pub fn create_offer(&self, actor: &Actor, new: NewOffer) -> Result<Delivery> {
        let now = self.now();
        let id = new_uuid_to_bech32("delivery")?;
        let mut txn = self.store.begin();

        if let Some(batch_id) = &new.batch_id {
            let batch: Batch = txn.lock(batch_id)?;
            if batch.producer_id != actor.id {
                return Err(LedgerError::unauthorized(
                    &actor.id,
                    "offer from",
                    EntityKind::Batch,
                    batch_id,
                ));
            }
        }
        let offer = Delivery::offer(id, actor, new, now.clone())?;

        txn.put(&offer)?;
        txn.witness(Witness::new(
            offer.id.as_str(),
            actor.id.as_str(),
            now,
            WitnessAction::OfferCreated {
                quantity: offer.quantity,
            },
        ))?;
        txn.commit()?;

        info!(delivery_id = %offer.id, quantity = offer.quantity, "offer published");
        Ok(offer)
    }

    /// Claim `quantity` of an available offer. Returns the new child delivery.
    pub fn commit(&self, courier: &Actor, delivery_id: &str, quantity: u64) -> Result<Delivery> {
        require_role(courier, Role::Courier, "commit to", EntityKind::Delivery, delivery_id)?;
        let now = self.now();
        let mut txn = self.store.begin();

        self.ensure_no_conflicting_claim(&mut txn, courier, &now)?;
        let peek: Delivery = txn
            .read(delivery_id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Delivery, delivery_id))?;
        let mut batch = match &peek.batch_id {
            Some(batch_id) => Some(txn.lock::<Batch>(batch_id)?),
            None => None,
        };
        let mut parent: Delivery = txn.lock(delivery_id)?;

        let child = parent.commit(
            new_uuid_to_bech32("delivery")?,
            courier,
            quantity,
            batch.as_mut(),
            now.clone(),
            self.config.reservation_window,
        )?;

        if let Some(batch) = &batch {
            txn.put(batch)?;
            txn.witness(Witness::new(
                batch.id.as_str(),
                courier.id.as_str(),
                now.clone(),
                WitnessAction::BatchReserved {
                    delivery_id: child.id.clone(),
                    quantity: child.quantity,
                },
            ))?;
        }
        txn.put(&parent)?;
        txn.put(&child)?;
        txn.witness(Witness::new(
            delivery_id,
            courier.id.as_str(),
            now,
            WitnessAction::Committed {
                child_id: child.id.clone(),
                quantity: child.quantity,
            },
        ))?;
        txn.commit()?;

        info!(
            parent_id = delivery_id,
            delivery_id = %child.id,
            quantity = child.quantity,
            remaining = parent.quantity,
            "committed to offer"
        );
        Ok(child)
    }

    pub fn confirm_pickup(&self, courier: &Actor, delivery_id: &str, code: &str) -> Result<Delivery> {
        let now = self.now();
        let mut txn = self.store.begin();

        let mut delivery = lock_assigned(&mut txn, courier, delivery_id, "confirm pickup of")?;
        delivery.confirm_pickup(code, now.clone())?;

        txn.put(&delivery)?;
        txn.witness(Witness::new(
            delivery_id,
            courier.id.as_str(),
            now,
            WitnessAction::PickedUp,
        ))?;
        txn.commit()?;

        info!(delivery_id, "pickup confirmed");
        Ok(delivery)
    }

    pub fn start_transit(&self, courier: &Actor, delivery_id: &str) -> Result<Delivery> {
        let now = self.now();
        let mut txn = self.store.begin();

        let mut delivery = lock_assigned(&mut txn, courier, delivery_id, "start transit of")?;
        delivery.start_transit(now.clone())?;

        txn.put(&delivery)?;
        txn.witness(Witness::new(
            delivery_id,
            courier.id.as_str(),
            now,
            WitnessAction::InTransit,
        ))?;
        txn.commit()?;

        info!(delivery_id, "in transit");
        Ok(delivery)
    }

    /// Final handoff. Completes the batch when this was its last outstanding claim.
    pub fn confirm_delivery(
        &self,
        courier: &Actor,
        delivery_id: &str,
        code: &str,
    ) -> Result<Delivery> {
        let now = self.now();
        let mut txn = self.store.begin();

        delivery::lock_with_upstream(&mut txn, delivery_id)?;
        let mut delivery = lock_assigned(&mut txn, courier, delivery_id, "confirm delivery of")?;
        delivery.confirm_delivery(code, now.clone())?;
        txn.put(&delivery)?;
        txn.witness(Witness::new(
            delivery_id,
            courier.id.as_str(),
            now.clone(),
            WitnessAction::Delivered,
        ))?;

        if let Some(batch_id) = delivery.batch_id.as_deref().filter(|_| delivery.holds_batch) {
            let mut batch: Batch = txn.lock(batch_id)?;
            let outstanding = delivery::referencing_batch(&txn, batch_id)?
                .iter()
                .filter(|d| d.holds(batch_id) && d.status.is_claimed())
                .count();
            if batch.settle(outstanding, now.clone()) {
                txn.put(&batch)?;
                txn.witness(Witness::new(
                    batch_id,
                    courier.id.as_str(),
                    now,
                    WitnessAction::BatchCompleted,
                ))?;
                info!(batch_id, "batch completed");
            }
        }
        txn.commit()?;

        info!(delivery_id, quantity = delivery.quantity, "delivery confirmed");
        Ok(delivery)
    }

    pub fn delivery(&self, delivery_id: &str) -> Result<Delivery> {
        self.store
            .get(delivery_id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Delivery, delivery_id))
    }

    pub fn cancel_delivery(&self, actor: &Actor, delivery_id: &str) -> Result<Cancelled> {
        self.cancel(actor, CancelTarget::Delivery(delivery_id.to_string()))
    }

    // Resource requests

    pub fn create_request(
        &self,
        site: &Actor,
        items: &[NewItem],
        expires_in: Option<TimeDelta>,
    ) -> Result<RequestView> {
        let request_id = new_uuid_to_bech32("request")?;
        require_role(site, Role::Site, "open", EntityKind::Request, &request_id)?;
        if items.is_empty() {
            return Err(LedgerError::InvalidQuantity {
                requested: 0,
                reason: "a request must ask for at least one item",
            });
        }
        let now = self.now();
        let expires_at = expires_in
            .map(|window| expiry(&now, window))
            .transpose()?;

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            if item.quantity == 0 {
                return Err(LedgerError::InvalidQuantity {
                    requested: 0,
                    reason: "each requested item needs a positive quantity",
                });
            }
            rows.push(ResourceItem::new(
                new_uuid_to_bech32("item")?,
                request_id.clone(),
                item.name.clone(),
                item.quantity,
            ));
        }
        let request = ResourceRequest::new(
            request_id,
            site.id.clone(),
            rows.iter().map(|i| i.id.clone()).collect(),
            expires_at,
            now.clone(),
        );

        let mut txn = self.store.begin();
        for row in &rows {
            txn.put(row)?;
        }
        txn.put(&request)?;
        txn.witness(Witness::new(
            request.id.as_str(),
            site.id.as_str(),
            now,
            WitnessAction::RequestCreated {
                items: u32::try_from(rows.len()).unwrap_or(u32::MAX),
            },
        ))?;
        txn.commit()?;

        info!(request_id = %request.id, items = rows.len(), "request opened");
        Ok(RequestView {
            request,
            items: rows,
        })
    }

    /// Reserve against several items at once. All claims succeed or none do.
    pub fn create_reservation(
        &self,
        courier: &Actor,
        request_id: &str,
        claims: &[ItemClaim],
    ) -> Result<ResourceReservation> {
        require_role(courier, Role::Courier, "reserve against", EntityKind::Request, request_id)?;
        let claims = resource::merge_claims(claims)?;
        let now = self.now();
        let mut txn = self.store.begin();

        let mut request: ResourceRequest = txn.lock(request_id)?;
        request.accepts_reservations(&now)?;
        if let Some(stray) = claims.iter().find(|c| !request.item_ids.contains(&c.item_id)) {
            return Err(LedgerError::not_found(EntityKind::Item, &stray.item_id));
        }

        let item_ids: Vec<String> = claims.iter().map(|c| c.item_id.clone()).collect();
        let mut items = txn.lock_all::<ResourceItem>(&item_ids)?;
        for (item, claim) in items.iter_mut().zip(&claims) {
            item.reserve(claim.quantity)?;
        }
        for item in &items {
            txn.put(item)?;
        }

        let reservation = ResourceReservation::new(
            new_uuid_to_bech32("reservation")?,
            request.id.clone(),
            courier.id.clone(),
            &claims,
            now.clone(),
        );
        txn.put(&reservation)?;
        resource::refresh_request(&mut txn, &mut request)?;
        txn.witness(Witness::new(
            reservation.id.as_str(),
            courier.id.as_str(),
            now,
            WitnessAction::ReservationCreated {
                request_id: request.id.clone(),
                quantity: reservation.total(),
            },
        ))?;
        txn.commit()?;

        info!(
            request_id,
            reservation_id = %reservation.id,
            quantity = reservation.total(),
            status = %request.status(),
            "reservation created"
        );
        Ok(reservation)
    }

    pub fn cancel_reservation(&self, courier: &Actor, reservation_id: &str) -> Result<Cancelled> {
        self.cancel(courier, CancelTarget::Reservation(reservation_id.to_string()))
    }

    /// The courier handed everything in the reservation to the site.
    pub fn deliver_reservation(
        &self,
        courier: &Actor,
        reservation_id: &str,
    ) -> Result<ResourceReservation> {
        let now = self.now();
        let mut txn = self.store.begin();

        let (mut request, mut reservation) = resource::lock_reservation(&mut txn, reservation_id)?;
        if reservation.courier_id != courier.id {
            return Err(LedgerError::unauthorized(
                &courier.id,
                "deliver",
                EntityKind::Reservation,
                reservation_id,
            ));
        }
        reservation.mark_delivered(now.clone())?;

        for claim in &reservation.items {
            let mut item: ResourceItem = txn.lock(&claim.resource_item_id)?;
            item.deliver(claim.quantity);
            txn.put(&item)?;
        }
        txn.put(&reservation)?;
        resource::refresh_request(&mut txn, &mut request)?;
        txn.witness(Witness::new(
            reservation_id,
            courier.id.as_str(),
            now,
            WitnessAction::ReservationDelivered,
        ))?;
        txn.commit()?;

        info!(reservation_id, status = %request.status(), "reservation delivered");
        Ok(reservation)
    }

    pub fn request(&self, request_id: &str) -> Result<RequestView> {
        let request: ResourceRequest = self
            .store
            .get(request_id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Request, request_id))?;
        let mut items = Vec::with_capacity(request.item_ids.len());
        for item_id in &request.item_ids {
            let item = self
                .store
                .get(item_id)?
                .ok_or_else(|| LedgerError::not_found(EntityKind::Item, item_id))?;
            items.push(item);
        }
        Ok(RequestView { request, items })
    }

    pub fn reservation(&self, reservation_id: &str) -> Result<ResourceReservation> {
        self.store
            .get(reservation_id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Reservation, reservation_id))
    }

    // Cancellation, expiry, audit

    /// Uniform undo for batches, deliveries, reservations and requests.
    pub fn cancel(&self, actor: &Actor, target: CancelTarget) -> Result<Cancelled> {
        let now = self.now();
        let mut txn = self.store.begin();

        let cancelled = cancel::dispatch(&mut txn, actor, &target, &now)?;
        txn.commit()?;

        info!(
            kind = %cancelled.kind,
            id = %cancelled.id,
            restored = cancelled.restored,
            actor = %actor.id,
            "cancelled"
        );
        Ok(cancelled)
    }

    /// Persist expiry for lapsed batches and claims. Lapsed claims give their
    /// quantity back exactly as a cancel would, but their rows are kept.
    pub fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.now();
        let mut report = SweepReport::default();

        for batch in self.store.scan::<Batch>()? {
            if !batch.is_expired(&now) {
                continue;
            }
            match self.expire_batch(&batch.id, &now) {
                Ok(true) => report.batches_expired += 1,
                Ok(false) => {}
                Err(err) if err.is_retryable() => {
                    warn!(batch_id = %batch.id, %err, "sweep skipped batch");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        for delivery in self.store.scan::<Delivery>()? {
            if !delivery.is_lapsed(&now) {
                continue;
            }
            match self.expire_delivery(&delivery.id, &now) {
                Ok(true) => report.deliveries_expired += 1,
                Ok(false) => {}
                Err(err) if err.is_retryable() => {
                    warn!(delivery_id = %delivery.id, %err, "sweep skipped delivery");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            batches = report.batches_expired,
            deliveries = report.deliveries_expired,
            skipped = report.skipped,
            "expiry sweep finished"
        );
        Ok(report)
    }

    pub fn history(&self, entity_id: &str) -> Result<Vec<Witness>> {
        self.store.history(entity_id)
    }

    fn expire_batch(&self, batch_id: &str, now: &TimeStamp<Utc>) -> Result<bool> {
        let mut txn = self.store.begin();
        let mut batch: Batch = txn.lock(batch_id)?;
        if !batch.expire(now) {
            return Ok(false);
        }
        txn.put(&batch)?;
        txn.witness(Witness::new(
            batch_id,
            SWEEPER_ID,
            now.clone(),
            WitnessAction::BatchExpired,
        ))?;
        txn.commit()?;
        Ok(true)
    }

    fn expire_delivery(&self, delivery_id: &str, now: &TimeStamp<Utc>) -> Result<bool> {
        let mut txn = self.store.begin();
        let mut delivery = delivery::lock_with_upstream(&mut txn, delivery_id)?;
        if !delivery.is_lapsed(now) {
            return Ok(false);
        }
        if delivery.status.is_claimed() {
            delivery::restore_upstream(&mut txn, &delivery, SWEEPER_ID, now)?;
        }
        delivery.expire(now)?;
        txn.put(&delivery)?;
        txn.witness(Witness::new(
            delivery_id,
            SWEEPER_ID,
            now.clone(),
            WitnessAction::DeliveryExpired,
        ))?;
        txn.commit()?;
        Ok(true)
    }

    /// One courier, one live claim. Earlier claims inside the grace window
    /// are treated as retries of the same intent.
    fn ensure_no_conflicting_claim(
        &self,
        txn: &mut Txn<'_>,
        courier: &Actor,
        now: &TimeStamp<Utc>,
    ) -> Result<()> {
        txn.lock_key(&format!("courier/{}", courier.id))?;
        let held = delivery::active_for_courier(txn, &courier.id, now)?
            .into_iter()
            .find(|d| {
                d.accepted_at
                    .as_ref()
                    .is_some_and(|at| now.since(at) > self.config.claim_grace)
            });
        if let Some(held) = held {
            warn!(courier_id = %courier.id, delivery_id = %held.id, "courier already holds a claim");
            return Err(LedgerError::Conflict {
                courier_id: courier.id.clone(),
                delivery_id: held.id,
            });
        }
        Ok(())
    }
}

fn require_role(
    actor: &Actor,
    role: Role,
    action: &'static str,
    entity: EntityKind,
    id: &str,
) -> Result<()> {
    if actor.is(role) {
        Ok(())
    } else {
        Err(LedgerError::unauthorized(&actor.id, action, entity, id))
    }
}

fn lock_assigned(
    txn: &mut Txn<'_>,
    courier: &Actor,
    delivery_id: &str,
    action: &'static str,
) -> Result<Delivery> {
    let delivery: Delivery = txn.lock(delivery_id)?;
    if !delivery.is_assigned_to(courier) {
        return Err(LedgerError::unauthorized(
            &courier.id,
            action,
            EntityKind::Delivery,
            delivery_id,
        ));
    }
    Ok(delivery)
}
