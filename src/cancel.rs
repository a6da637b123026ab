//! One cancel operation for every entity kind.
//!
//! Each kind supplies its lock order, who may cancel it, which statuses are
//! cancellable, and how its quantity is restored. The checks run in the same
//! order for all of them, inside the caller's transaction.
use chrono::Utc;

use crate::batch::Batch;
use crate::delivery::Delivery;
use crate::error::{LedgerError, Result};
use crate::resource::{ResourceRequest, ResourceReservation};
use crate::store::{Row, Txn};
use crate::types::{Actor, EntityKind, TimeStamp};
use crate::witness::{Witness, WitnessAction};

pub(crate) trait Cancellable: Row + Sized {
    /// Take every lock the restoration needs, in order, ending with this row.
    fn lock_for_cancel(txn: &mut Txn<'_>, id: &str) -> Result<Self>;

    fn may_cancel(&self, txn: &Txn<'_>, actor: &Actor) -> Result<bool>;

    fn cancellable_status(&self) -> bool;

    fn status_error(&self) -> LedgerError;

    /// Undo whatever this entity took and retire it. Returns the quantity handed back.
    fn restore(self, txn: &mut Txn<'_>, actor: &Actor, now: &TimeStamp<Utc>) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    Batch(String),
    Delivery(String),
    Reservation(String),
    Request(String),
}

impl CancelTarget {
    pub fn kind(&self) -> EntityKind {
        match self {
            CancelTarget::Batch(_) => EntityKind::Batch,
            CancelTarget::Delivery(_) => EntityKind::Delivery,
            CancelTarget::Reservation(_) => EntityKind::Reservation,
            CancelTarget::Request(_) => EntityKind::Request,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CancelTarget::Batch(id)
            | CancelTarget::Delivery(id)
            | CancelTarget::Reservation(id)
            | CancelTarget::Request(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
    pub kind: EntityKind,
    pub id: String,
    pub restored: u64,
}

pub(crate) fn dispatch(
    txn: &mut Txn<'_>,
    actor: &Actor,
    target: &CancelTarget,
    now: &TimeStamp<Utc>,
) -> Result<Cancelled> {
    match target {
        CancelTarget::Batch(id) => cancel_in::<Batch>(txn, actor, id, now),
        CancelTarget::Delivery(id) => cancel_in::<Delivery>(txn, actor, id, now),
        CancelTarget::Reservation(id) => cancel_in::<ResourceReservation>(txn, actor, id, now),
        CancelTarget::Request(id) => cancel_in::<ResourceRequest>(txn, actor, id, now),
    }
}

fn cancel_in<C: Cancellable>(
    txn: &mut Txn<'_>,
    actor: &Actor,
    id: &str,
    now: &TimeStamp<Utc>,
) -> Result<Cancelled> {
    let row = C::lock_for_cancel(txn, id)?;

    // ownership before status: a stranger learns nothing about the row's state
    if !row.may_cancel(txn, actor)? {
        return Err(LedgerError::unauthorized(&actor.id, "cancel", C::KIND, id));
    }
    if !row.cancellable_status() {
        return Err(row.status_error());
    }

    let restored = row.restore(txn, actor, now)?;
    txn.witness(Witness::new(
        id,
        actor.id.as_str(),
        now.clone(),
        WitnessAction::Cancelled { restored },
    ))?;

    Ok(Cancelled {
        kind: C::KIND,
        id: id.to_string(),
        restored,
    })
}
