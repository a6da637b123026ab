use std::sync::Arc;
use std::thread;

use chrono::{TimeDelta, TimeZone, Utc};
use sled::open;
use tempfile::{TempDir, tempdir};

use goods_relay::{
    Actor, CancelTarget, ErrorKind, ItemClaim, LedgerConfig, LedgerError, ManualClock, NewItem,
    RelayService, RequestStatus, ReservationStatus,
};

fn service(name: &str) -> anyhow::Result<(TempDir, RelayService, Arc<ManualClock>)> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join(format!("{name}.db"));
    let db = Arc::new(open(&db_path)?);

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap(),
    ));
    let service = RelayService::new(db, LedgerConfig::new(db_path), clock.clone());

    Ok((temp_dir, service, clock))
}

#[test]
fn reservations_drive_request_status() -> anyhow::Result<()> {
    let (_dir, service, _clock) = service("request_status")?;
    let site = Actor::site("shelter1");
    let rider1 = Actor::courier("rider1");
    let rider2 = Actor::courier("rider2");

    let view = service.create_request(
        &site,
        &[NewItem::new("rice", 10), NewItem::new("beans", 4)],
        None,
    )?;
    assert_eq!(view.request.status(), RequestStatus::Requesting);
    let rice = view.item("rice").unwrap().id.clone();
    let beans = view.item("beans").unwrap().id.clone();

    let first = service.create_reservation(&rider1, &view.request.id, &[ItemClaim::new(&rice, 4)])?;
    assert_eq!(first.status, ReservationStatus::Reserved);
    let view = service.request(&view.request.id)?;
    assert_eq!(view.request.status(), RequestStatus::PartiallyReserved);

    // all or nothing: beans would fit, rice does not
    let err = service
        .create_reservation(
            &rider2,
            &view.request.id,
            &[ItemClaim::new(&rice, 7), ItemClaim::new(&beans, 1)],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientQuantity { requested: 7, remaining: 6, .. }
    ));
    let view = service.request(&view.request.id)?;
    assert_eq!(view.item("beans").unwrap().quantity_reserved, 0);
    assert_eq!(view.item("rice").unwrap().quantity_reserved, 4);

    // duplicate lines for one item are summed
    let second = service.create_reservation(
        &rider2,
        &view.request.id,
        &[
            ItemClaim::new(&rice, 3),
            ItemClaim::new(&beans, 4),
            ItemClaim::new(&rice, 3),
        ],
    )?;
    assert_eq!(second.total(), 10);
    let view = service.request(&view.request.id)?;
    assert_eq!(view.request.status(), RequestStatus::Reserved);

    let err = service
        .create_reservation(&rider1, &view.request.id, &[ItemClaim::new(&rice, 1)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    service.cancel_reservation(&rider1, &first.id)?;
    let view = service.request(&view.request.id)?;
    assert_eq!(view.request.status(), RequestStatus::PartiallyReserved);
    assert_eq!(view.item("rice").unwrap().quantity_reserved, 6);
    assert_eq!(service.reservation(&first.id).unwrap_err().kind(), ErrorKind::NotFound);

    Ok(())
}

#[test]
fn delivering_every_reservation_completes_the_request() -> anyhow::Result<()> {
    let (_dir, service, _clock) = service("request_complete")?;
    let site = Actor::site("shelter1");
    let courier = Actor::courier("rider1");

    let view = service.create_request(&site, &[NewItem::new("diapers", 5)], None)?;
    let item_id = view.items[0].id.clone();
    let reservation =
        service.create_reservation(&courier, &view.request.id, &[ItemClaim::new(&item_id, 5)])?;

    let err = service
        .deliver_reservation(&Actor::courier("rider2"), &reservation.id)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let delivered = service.deliver_reservation(&courier, &reservation.id)?;
    assert_eq!(delivered.status, ReservationStatus::Delivered);
    assert!(delivered.delivered_at.is_some());

    let view = service.request(&view.request.id)?;
    assert_eq!(view.request.status(), RequestStatus::Completed);
    assert_eq!(view.items[0].quantity_delivered, 5);

    // a delivered reservation is history, not something to undo
    let err = service
        .cancel_reservation(&courier, &reservation.id)
        .unwrap_err();
    assert!(matches!(err, LedgerError::WrongState { .. }));

    Ok(())
}

#[test]
fn only_the_reserving_courier_may_cancel() -> anyhow::Result<()> {
    let (_dir, service, _clock) = service("reservation_owner")?;
    let site = Actor::site("shelter1");
    let courier = Actor::courier("rider1");

    let view = service.create_request(&site, &[NewItem::new("soap", 2)], None)?;
    let reservation = service.create_reservation(
        &courier,
        &view.request.id,
        &[ItemClaim::new(&view.items[0].id, 1)],
    )?;

    for actor in [Actor::courier("rider2"), site.clone()] {
        let err = service
            .cancel(&actor, CancelTarget::Reservation(reservation.id.clone()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
    assert_eq!(service.reservation(&reservation.id)?.status, ReservationStatus::Reserved);

    // once delivered the owner sees the state, everyone else is still turned away
    service.deliver_reservation(&courier, &reservation.id)?;
    let err = service
        .cancel(&Actor::courier("rider2"), CancelTarget::Reservation(reservation.id.clone()))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Unauthorized { .. }));
    let err = service.cancel_reservation(&courier, &reservation.id).unwrap_err();
    assert!(matches!(err, LedgerError::WrongState { .. }));

    Ok(())
}

#[test]
fn bad_reservations_are_rejected() -> anyhow::Result<()> {
    let (_dir, service, _clock) = service("bad_reservations")?;
    let site = Actor::site("shelter1");
    let courier = Actor::courier("rider1");

    let err = service.create_request(&site, &[], None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);
    let err = service
        .create_request(&site, &[NewItem::new("soap", 0)], None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);

    for window in [TimeDelta::zero(), TimeDelta::MAX, TimeDelta::days(300 * 365)] {
        let err = service
            .create_request(&site, &[NewItem::new("soap", 2)], Some(window))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidWindow { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidQuantity);
    }

    let view = service.create_request(&site, &[NewItem::new("soap", 2)], None)?;
    let other = service.create_request(&site, &[NewItem::new("towels", 2)], None)?;

    let err = service
        .create_reservation(&courier, &view.request.id, &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);

    let err = service
        .create_reservation(&courier, &view.request.id, &[ItemClaim::new(&view.items[0].id, 0)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuantity);

    // an item that belongs to another request
    let err = service
        .create_reservation(&courier, &view.request.id, &[ItemClaim::new(&other.items[0].id, 1)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = service
        .create_reservation(&courier, "request1missing", &[ItemClaim::new(&view.items[0].id, 1)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = service
        .create_reservation(&site, &view.request.id, &[ItemClaim::new(&view.items[0].id, 1)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    Ok(())
}

#[test]
fn requests_expire_and_cancel() -> anyhow::Result<()> {
    let (_dir, service, clock) = service("request_expiry")?;
    let site = Actor::site("shelter1");
    let courier = Actor::courier("rider1");

    let lapsing = service.create_request(
        &site,
        &[NewItem::new("milk", 3)],
        Some(TimeDelta::hours(1)),
    )?;
    let open_ended = service.create_request(&site, &[NewItem::new("tea", 3)], None)?;

    clock.advance(TimeDelta::hours(2));
    let now = service.now();
    assert_eq!(service.request(&lapsing.request.id)?.status(&now), RequestStatus::Expired);
    assert_eq!(
        service.request(&open_ended.request.id)?.status(&now),
        RequestStatus::Requesting
    );

    let err = service
        .create_reservation(
            &courier,
            &lapsing.request.id,
            &[ItemClaim::new(&lapsing.items[0].id, 1)],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);

    let target = CancelTarget::Request(open_ended.request.id.clone());
    let err = service
        .cancel(&Actor::site("shelter2"), target.clone())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let cancelled = service.cancel(&site, target)?;
    assert_eq!(cancelled.restored, 0);
    let view = service.request(&open_ended.request.id)?;
    assert_eq!(view.request.status(), RequestStatus::Cancelled);
    assert!(view.request.cancelled_at.is_some());

    let err = service
        .create_reservation(
            &courier,
            &open_ended.request.id,
            &[ItemClaim::new(&open_ended.items[0].id, 1)],
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    Ok(())
}

#[test]
fn requests_with_reservations_cannot_be_cancelled() -> anyhow::Result<()> {
    let (_dir, service, _clock) = service("request_cancel_reserved")?;
    let site = Actor::site("shelter1");

    let view = service.create_request(&site, &[NewItem::new("rice", 3)], None)?;
    service.create_reservation(
        &Actor::courier("rider1"),
        &view.request.id,
        &[ItemClaim::new(&view.items[0].id, 1)],
    )?;

    let err = service
        .cancel(&site, CancelTarget::Request(view.request.id.clone()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    Ok(())
}

#[test]
fn concurrent_multi_item_reservations_never_overcommit() -> anyhow::Result<()> {
    let (_dir, service, _clock) = service("request_race")?;
    let site = Actor::site("shelter1");

    let view = service.create_request(
        &site,
        &[
            NewItem::new("rice", 50),
            NewItem::new("beans", 30),
            NewItem::new("oil", 50),
        ],
        None,
    )?;
    let request_id = view.request.id.clone();
    let rice = view.item("rice").unwrap().id.clone();
    let beans = view.item("beans").unwrap().id.clone();
    let oil = view.item("oil").unwrap().id.clone();

    // twelve couriers each want 5 rice, 3 beans and 5 oil: room for exactly ten
    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..12)
            .map(|i| {
                let service = &service;
                let request_id = &request_id;
                let mut claims = vec![
                    ItemClaim::new(&rice, 5),
                    ItemClaim::new(&beans, 3),
                    ItemClaim::new(&oil, 5),
                ];
                // every courier names the items in a different order
                claims.rotate_left(i % 3);
                if i % 2 == 1 {
                    claims.reverse();
                }
                scope.spawn(move || {
                    let courier = Actor::courier(format!("rider{i}"));
                    service.create_reservation(&courier, request_id, &claims)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let (granted, refused): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(|o| o.is_ok());
    assert_eq!(granted.len(), 10);
    for err in refused.into_iter().map(|o| o.unwrap_err()) {
        // no lock timeouts: opposing claim orders must not deadlock
        assert!(
            matches!(err, LedgerError::InsufficientQuantity { .. }),
            "{err}"
        );
    }

    let view = service.request(&request_id)?;
    assert_eq!(view.item("rice").unwrap().quantity_reserved, 50);
    assert_eq!(view.item("beans").unwrap().quantity_reserved, 30);
    assert_eq!(view.item("oil").unwrap().quantity_reserved, 50);
    assert_eq!(view.request.status(), RequestStatus::Reserved);

    Ok(())
}
