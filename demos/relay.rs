//! Walk one batch from publication to delivery against a scratch database.
//!
//! `GOODS_RELAY_*` variables override the defaults, except the database path,
//! which always points at a temporary directory here.
use anyhow::Context;
use goods_relay::{Actor, LedgerConfig, NewBatch, RelayService};

fn main() -> anyhow::Result<()> {
    let scratch = tempfile::tempdir()?;
    let mut config = LedgerConfig::from_env()?;
    config.db_path = scratch.path().join("relay.db");

    let service = RelayService::open(config)?;
    let producer = Actor::producer("farm1");
    let courier = Actor::courier("rider1");

    let batch = service.create_batch(&producer, NewBatch::new("apples", 50).with_notes("crates by the gate"))?;
    service.mark_batch_ready(&producer, &batch.id)?;

    let delivery = service
        .reserve_from_batch(&courier, &batch.id, 20, Some("shelter1"))
        .context("reserve")?;
    println!("reserved {} of {} as {}", delivery.quantity, batch.id, delivery.id);

    let pickup = delivery.pickup_code.clone().unwrap_or_default();
    let delivery = service.confirm_pickup(&courier, &delivery.id, &pickup)?;
    let dropoff = delivery.delivery_code.clone().unwrap_or_default();
    service.confirm_delivery(&courier, &delivery.id, &dropoff)?;

    let ledger = service.batch_ledger(&batch.id)?;
    println!(
        "available {} / active {} / delivered {} of {}",
        ledger.available, ledger.active, ledger.delivered, ledger.quantity
    );
    for witness in service.history(&delivery.id)? {
        println!("{} {} {:?}", witness.timestamp, witness.actor_id, witness.action);
    }

    service.store().flush()?;
    Ok(())
}
