//! Inventory-conserving reservation ledger for donated goods.
//!
//! Producers publish batches, couriers claim quantity from them (or from
//! direct offers) and carry it to receiving sites through code-gated
//! handoffs. Sites may also post multi-item requests that couriers reserve
//! against. Every transition runs through [`service::RelayService`], which
//! keeps `available + claimed + delivered` equal to what was published.

pub mod batch;
pub mod cancel;
pub mod clock;
pub mod code;
pub mod config;
pub mod delivery;
pub mod error;
pub mod resource;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
pub mod witness;

pub use batch::{Batch, BatchLedger, BatchStatus, NewBatch};
pub use cancel::{CancelTarget, Cancelled};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use delivery::{Delivery, DeliveryStatus, NewOffer};
pub use error::{ErrorKind, LedgerError, Result};
pub use resource::{
    ItemClaim, NewItem, RequestStatus, ReservationStatus, ResourceItem, ResourceRequest,
    ResourceReservation,
};
pub use service::{RelayService, RequestView, SweepReport};
pub use types::{Actor, EntityKind, Role, TimeStamp};
