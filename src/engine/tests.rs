use super::*;
use crate::limits::*;
use chrono::Datelike;
use rust_decimal::Decimal;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tourdesk_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn window(sh: u32, sm: u32, eh: u32, em: u32) -> TimeWindow {
    TimeWindow::new(t(sh, sm), t(eh, em))
}

/// 2025-06-02 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
}

fn guest(name: &str) -> CustomerIdentity {
    CustomerIdentity::Guest {
        name: name.into(),
        phone: "+49 30 1234567".into(),
        email: None,
    }
}

fn booking_req(slot_id: Ulid, participants: u32) -> NewBooking {
    NewBooking {
        id: Ulid::new(),
        slot_id,
        participants,
        customer: guest("Ann"),
        notes: None,
        initial_status: None,
    }
}

async fn tour(engine: &Engine, base_price: i64, max: Option<u32>) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_tour(id, Decimal::from(base_price), 1, max)
        .await
        .unwrap();
    id
}

async fn resource(engine: &Engine, quantity: u32, seats_per_unit: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_resource(id, "Jeep".into(), quantity, seats_per_unit)
        .await
        .unwrap();
    id
}

async fn template(
    engine: &Engine,
    tour_id: Ulid,
    day_start: NaiveTime,
    day_end: NaiveTime,
    slot_minutes: u32,
    break_minutes: u32,
) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_template(AvailabilityTemplate {
            id,
            tour_id,
            weekdays: WeekdaySet::every_day(),
            day_start,
            day_end,
            slot_duration_minutes: slot_minutes,
            break_duration_minutes: break_minutes,
            active: true,
        })
        .await
        .unwrap();
    id
}

async fn slot(engine: &Engine, tour_id: Ulid, w: TimeWindow) -> Ulid {
    let id = Ulid::new();
    engine
        .create_slot(id, tour_id, monday(), w, None)
        .await
        .unwrap();
    id
}

// ── Slot generation ──────────────────────────────────────

#[tokio::test]
async fn generate_tiles_each_eligible_day() {
    let engine = new_engine("generate_tiles.wal");
    let tid = tour(&engine, 50, Some(8)).await;
    let tpl = template(&engine, tid, t(9, 0), t(18, 0), 60, 30).await;

    let report = engine
        .generate_schedules(tpl, monday(), monday() + chrono::Duration::days(1), false, true)
        .await
        .unwrap();
    assert_eq!(report.slots_created, 12);
    assert_eq!(report.slots_skipped, 0);
    assert!(report.conflicts.is_empty());

    let slots = engine.list_slots(tid, Some(monday()), Some(monday())).await;
    let starts: Vec<_> = slots.iter().map(|s| s.window.start).collect();
    assert_eq!(
        starts,
        vec![t(9, 0), t(10, 30), t(12, 0), t(13, 30), t(15, 0), t(16, 30)]
    );
    assert!(slots.iter().all(|s| s.window.end <= t(18, 0)));
    assert!(slots.iter().all(|s| s.total_capacity == 8 && s.booked_count == 0));
    assert!(slots.iter().all(|s| s.template_id == Some(tpl)));
}

#[tokio::test]
async fn generate_honours_weekdays() {
    let engine = new_engine("generate_weekdays.wal");
    let tid = tour(&engine, 50, None).await;
    let id = Ulid::new();
    engine
        .upsert_template(AvailabilityTemplate {
            id,
            tour_id: tid,
            weekdays: WeekdaySet::from_days(&[6, 7]).unwrap(),
            day_start: t(10, 0),
            day_end: t(12, 0),
            slot_duration_minutes: 120,
            break_duration_minutes: 0,
            active: true,
        })
        .await
        .unwrap();

    let report = engine
        .generate_schedules(id, monday(), monday() + chrono::Duration::days(13), false, true)
        .await
        .unwrap();
    // Two weekends.
    assert_eq!(report.slots_created, 4);
    let slots = engine.list_slots(tid, None, None).await;
    assert!(slots.iter().all(|s| s.date.weekday().number_from_monday() >= 6));
    assert!(slots.iter().all(|s| s.total_capacity == DEFAULT_SLOT_CAPACITY));
}

#[tokio::test]
async fn generate_is_idempotent() {
    let engine = new_engine("generate_idempotent.wal");
    let tid = tour(&engine, 50, Some(8)).await;
    let tpl = template(&engine, tid, t(9, 0), t(18, 0), 60, 30).await;

    let first = engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();
    let second = engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();
    assert_eq!(first.slots_created, 6);
    assert_eq!(second.slots_created, 0);
    assert_eq!(second.slots_skipped, 6);
    assert_eq!(engine.list_slots(tid, None, None).await.len(), 6);
}

#[tokio::test]
async fn generate_reports_resource_exhaustion() {
    let engine = new_engine("generate_exhaustion.wal");
    let jeep = resource(&engine, 2, 4).await;
    let mut tours = Vec::new();
    for _ in 0..3 {
        let tid = tour(&engine, 50, Some(4)).await;
        engine.set_requirement(tid, jeep, 1).await.unwrap();
        tours.push(tid);
    }

    slot(&engine, tours[0], window(9, 0, 11, 0)).await;
    slot(&engine, tours[1], window(10, 0, 12, 0)).await;

    let tpl = template(&engine, tours[2], t(10, 30), t(11, 30), 60, 0).await;
    let report = engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();
    assert_eq!(report.slots_created, 0);
    assert_eq!(report.slots_skipped, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert!(report.conflicts[0].starts_with("2025-06-02 10:30"));
    assert!(report.conflicts[0].contains("Jeep"));
    assert!(engine.list_slots(tours[2], None, None).await.is_empty());

    // Without the check the slot is created anyway.
    let report = engine
        .generate_schedules(tpl, monday(), monday(), false, false)
        .await
        .unwrap();
    assert_eq!(report.slots_created, 1);
}

#[tokio::test]
async fn generation_continues_past_conflicting_windows() {
    let engine = new_engine("generate_partial.wal");
    let jeep = resource(&engine, 1, 4).await;
    let blocker = tour(&engine, 50, Some(4)).await;
    let tid = tour(&engine, 50, Some(4)).await;
    engine.set_requirement(blocker, jeep, 1).await.unwrap();
    engine.set_requirement(tid, jeep, 1).await.unwrap();

    slot(&engine, blocker, window(10, 0, 11, 0)).await;
    let tpl = template(&engine, tid, t(9, 0), t(12, 0), 60, 0).await;
    let report = engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();
    assert_eq!(report.slots_created, 2);
    assert_eq!(report.slots_skipped, 1);
    assert_eq!(report.conflicts.len(), 1);
    let starts: Vec<_> = engine
        .list_slots(tid, None, None)
        .await
        .iter()
        .map(|s| s.window.start)
        .collect();
    assert_eq!(starts, vec![t(9, 0), t(11, 0)]);
}

#[tokio::test]
async fn requirement_quantity_is_capped() {
    let engine = new_engine("requirement_cap.wal");
    let boat = resource(&engine, MAX_RESOURCE_QUANTITY, 12).await;
    let tid = tour(&engine, 50, Some(8)).await;
    assert!(matches!(
        engine.set_requirement(tid, boat, MAX_RESOURCE_QUANTITY + 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.set_requirement(tid, boat, 3_000_000_000).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(engine.tours.get(&tid).unwrap().requirements.is_empty());

    // Unchecked overlapping generations over-commit the boats.
    engine
        .set_requirement(tid, boat, MAX_RESOURCE_QUANTITY)
        .await
        .unwrap();
    let early = template(&engine, tid, t(9, 0), t(10, 0), 60, 0).await;
    let late = template(&engine, tid, t(9, 30), t(10, 30), 60, 0).await;
    for tpl in [early, late] {
        let report = engine
            .generate_schedules(tpl, monday(), monday(), false, false)
            .await
            .unwrap();
        assert_eq!(report.slots_created, 1);
    }
    let needs_one = [ResourceRequirement {
        resource_id: boat,
        quantity_needed: 1,
    }];
    let shortfall = engine
        .check_availability(&needs_one, monday(), t(9, 0), t(11, 0), None)
        .await
        .unwrap()
        .expect("boats are over-committed");
    assert_eq!(shortfall.available, 0);
}

#[tokio::test]
async fn overwrite_replaces_empty_slots_only() {
    let engine = new_engine("generate_overwrite.wal");
    let tid = tour(&engine, 50, Some(8)).await;
    let tpl = template(&engine, tid, t(9, 0), t(11, 0), 60, 0).await;
    engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();
    let before = engine.list_slots(tid, None, None).await;
    assert_eq!(before.len(), 2);
    let booked = engine
        .create_booking(booking_req(before[0].id, 2))
        .await
        .unwrap();

    let report = engine
        .generate_schedules(tpl, monday(), monday(), true, true)
        .await
        .unwrap();
    assert_eq!(report.slots_created, 1);
    assert_eq!(report.slots_skipped, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert!(report.conflicts[0].contains("has bookings"));

    let after = engine.list_slots(tid, None, None).await;
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].booked_count, 2);
    assert_ne!(after[1].id, before[1].id);
    assert!(engine.get_slot(&before[1].id).is_none());
    assert_eq!(engine.get_booking(booked.id).await.unwrap().slot_id, before[0].id);
}

#[tokio::test]
async fn overwrite_frees_resources_of_the_replaced_slot() {
    let engine = new_engine("generate_overwrite_ledger.wal");
    let jeep = resource(&engine, 1, 4).await;
    let tid = tour(&engine, 50, Some(4)).await;
    engine.set_requirement(tid, jeep, 1).await.unwrap();
    let tpl = template(&engine, tid, t(9, 0), t(10, 0), 60, 0).await;

    engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();
    // The old slot's own commitment must not block its replacement.
    let report = engine
        .generate_schedules(tpl, monday(), monday(), true, true)
        .await
        .unwrap();
    assert_eq!(report.slots_created, 1);
    assert!(report.conflicts.is_empty());

    let shortfall = engine
        .check_availability(
            &[ResourceRequirement {
                resource_id: jeep,
                quantity_needed: 1,
            }],
            monday(),
            t(9, 0),
            t(10, 0),
            None,
        )
        .await
        .unwrap();
    assert_eq!(shortfall.map(|s| s.available), Some(0));
}

#[tokio::test]
async fn inactive_template_is_refused() {
    let engine = new_engine("generate_inactive.wal");
    let tid = tour(&engine, 50, None).await;
    let tpl = template(&engine, tid, t(9, 0), t(10, 0), 60, 0).await;
    engine
        .update_template(
            tpl,
            TemplateUpdate {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn generation_range_is_limited() {
    let engine = new_engine("generate_range.wal");
    let tid = tour(&engine, 50, None).await;
    let tpl = template(&engine, tid, t(9, 0), t(10, 0), 60, 0).await;

    let too_far = monday() + chrono::Duration::days(MAX_GENERATION_DAYS + 1);
    let result = engine
        .generate_schedules(tpl, monday(), too_far, false, true)
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let backwards = engine
        .generate_schedules(tpl, monday(), monday() - chrono::Duration::days(1), false, true)
        .await;
    assert!(matches!(backwards, Err(EngineError::Validation(_))));
    assert!(engine.list_slots(tid, None, None).await.is_empty());
}

#[tokio::test]
async fn unknown_template_is_not_found() {
    let engine = new_engine("generate_unknown.wal");
    let id = Ulid::new();
    let result = engine
        .generate_schedules(id, monday(), monday(), false, true)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == id));
}

#[tokio::test]
async fn preview_matches_generation() {
    let engine = new_engine("preview.wal");
    let jeep = resource(&engine, 3, 4).await;
    let tid = tour(&engine, 50, Some(8)).await;
    engine.set_requirement(tid, jeep, 2).await.unwrap();
    let tpl = template(&engine, tid, t(9, 0), t(18, 0), 60, 30).await;
    let end = monday() + chrono::Duration::days(6);

    let preview = engine.preview_generation(tpl, monday(), end).unwrap();
    assert_eq!(preview.days.len(), 7);
    assert_eq!(preview.days[0].weekday, 1);
    assert_eq!(preview.days[0].slots, 6);
    assert_eq!(preview.total_slots, 42);
    assert_eq!(preview.requirements.len(), 1);
    assert_eq!(preview.requirements[0].quantity_needed, 2);
    assert!(engine.list_slots(tid, None, None).await.is_empty());

    let report = engine
        .generate_schedules(tpl, monday(), end, false, true)
        .await
        .unwrap();
    assert_eq!(report.slots_created, preview.total_slots);
}

// ── Conflict checking ────────────────────────────────────

#[tokio::test]
async fn adjacent_windows_do_not_conflict() {
    let engine = new_engine("conflict_adjacent.wal");
    let jeep = resource(&engine, 1, 4).await;
    let a = tour(&engine, 50, Some(4)).await;
    let b = tour(&engine, 50, Some(4)).await;
    engine.set_requirement(a, jeep, 1).await.unwrap();
    engine.set_requirement(b, jeep, 1).await.unwrap();

    slot(&engine, a, window(9, 0, 10, 0)).await;
    slot(&engine, b, window(10, 0, 11, 0)).await;

    let result = engine
        .create_slot(Ulid::new(), b, monday(), window(9, 30, 10, 30), None)
        .await;
    match result {
        Err(EngineError::ResourceConflict(msg)) => {
            assert!(msg.contains("needs 1, available 0"), "{msg}");
        }
        other => panic!("expected ResourceConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn other_dates_do_not_conflict() {
    let engine = new_engine("conflict_dates.wal");
    let jeep = resource(&engine, 1, 4).await;
    let a = tour(&engine, 50, Some(4)).await;
    engine.set_requirement(a, jeep, 1).await.unwrap();

    slot(&engine, a, window(9, 0, 10, 0)).await;
    engine
        .create_slot(
            Ulid::new(),
            a,
            monday() + chrono::Duration::days(1),
            window(9, 0, 10, 0),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelled_slot_releases_its_resources() {
    let engine = new_engine("conflict_cancel.wal");
    let jeep = resource(&engine, 1, 4).await;
    let a = tour(&engine, 50, Some(4)).await;
    let b = tour(&engine, 50, Some(4)).await;
    engine.set_requirement(a, jeep, 1).await.unwrap();
    engine.set_requirement(b, jeep, 1).await.unwrap();

    let first = slot(&engine, a, window(9, 0, 10, 0)).await;
    assert!(engine
        .create_slot(Ulid::new(), b, monday(), window(9, 0, 10, 0), None)
        .await
        .is_err());

    engine.cancel_slot(first).await.unwrap();
    slot(&engine, b, window(9, 0, 10, 0)).await;
}

#[tokio::test]
async fn availability_check_excludes_a_slot() {
    let engine = new_engine("conflict_exclude.wal");
    let jeep = resource(&engine, 1, 4).await;
    let a = tour(&engine, 50, Some(4)).await;
    engine.set_requirement(a, jeep, 1).await.unwrap();
    let sid = slot(&engine, a, window(9, 0, 10, 0)).await;

    let reqs = [ResourceRequirement {
        resource_id: jeep,
        quantity_needed: 1,
    }];
    let blocked = engine
        .check_availability(&reqs, monday(), t(9, 0), t(10, 0), None)
        .await
        .unwrap();
    assert!(blocked.is_some());
    let free = engine
        .check_availability(&reqs, monday(), t(9, 0), t(10, 0), Some(sid))
        .await
        .unwrap();
    assert!(free.is_none());
}

#[tokio::test]
async fn duplicate_manual_slot_is_refused() {
    let engine = new_engine("slot_duplicate.wal");
    let a = tour(&engine, 50, Some(4)).await;
    slot(&engine, a, window(9, 0, 10, 0)).await;
    let result = engine
        .create_slot(Ulid::new(), a, monday(), window(9, 0, 9, 30), None)
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

// ── Booking allocation ───────────────────────────────────

#[tokio::test]
async fn cancellation_releases_seats() {
    let engine = new_engine("booking_release.wal");
    let tid = tour(&engine, 100, Some(5)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

    let first = engine.create_booking(booking_req(sid, 3)).await.unwrap();
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().free_seats(), 2);

    let refused = engine.create_booking(booking_req(sid, 3)).await;
    assert!(matches!(
        refused,
        Err(EngineError::CapacityExceeded {
            requested: 3,
            free: 2
        })
    ));

    engine
        .cancel_booking(first.id, Some("weather".into()))
        .await
        .unwrap();
    let snapshot = engine.get_slot_snapshot(sid).await.unwrap();
    assert_eq!(snapshot.booked_count, 0);
    assert_eq!(snapshot.free_seats(), 5);

    engine.create_booking(booking_req(sid, 5)).await.unwrap();
    let availability = engine.check_slot_availability(sid, 1).await.unwrap();
    assert!(!availability.ok);
    assert_eq!(availability.free_seats, 0);
}

#[tokio::test]
async fn concurrent_bookings_never_overbook() {
    let engine = Arc::new(new_engine("booking_concurrent.wal"));
    let tid = tour(&engine, 10, Some(10)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_booking(booking_req(sid, 1)).await
        }));
    }
    let mut ok = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::CapacityExceeded { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 10);
    assert_eq!(rejected, 15);

    let audit = engine.audit_slot(sid).await.unwrap();
    assert_eq!(audit.counter, 10);
    assert!(audit.is_consistent());
}

#[tokio::test]
async fn booking_prices_from_base_price() {
    let engine = new_engine("booking_price.wal");
    let jeep = resource(&engine, 3, 4).await;
    let tid = tour(&engine, 2000, Some(8)).await;
    engine.set_requirement(tid, jeep, 2).await.unwrap();
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

    let booking = engine.create_booking(booking_req(sid, 3)).await.unwrap();
    assert_eq!(booking.total_price, Decimal::from(6000));
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.tour_id, tid);
    assert_eq!(
        booking.resources,
        vec![BookingResourceLine {
            resource_id: jeep,
            units: 1,
        }]
    );
    assert!(booking.code.starts_with("BK"));
    assert_eq!(booking.code.len(), 10);

    let quote = engine.quote(tid, sid, 6).await.unwrap();
    assert_eq!(quote.total_price, Decimal::from(12000));
    assert_eq!(quote.manifest[0].units_needed, 2);
    assert_eq!(quote.manifest[0].capacity, 8);
    assert_eq!(quote.free_seats, 5);
    assert!(quote.available);
}

#[tokio::test]
async fn quote_checks_slot_belongs_to_tour() {
    let engine = new_engine("quote_mismatch.wal");
    let a = tour(&engine, 10, None).await;
    let b = tour(&engine, 10, None).await;
    let sid = slot(&engine, a, window(9, 0, 10, 0)).await;
    assert!(matches!(
        engine.quote(b, sid, 1).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.quote(a, sid, 0).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn booking_respects_tour_participant_limits() {
    let engine = new_engine("booking_limits.wal");
    let tid = Ulid::new();
    engine
        .upsert_tour(tid, Decimal::from(10), 2, Some(4))
        .await
        .unwrap();
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

    assert!(matches!(
        engine.create_booking(booking_req(sid, 1)).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.create_booking(booking_req(sid, 0)).await,
        Err(EngineError::Validation(_))
    ));
    engine.create_booking(booking_req(sid, 2)).await.unwrap();
}

#[tokio::test]
async fn booking_on_cancelled_slot_is_refused() {
    let engine = new_engine("booking_cancelled_slot.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    engine.cancel_slot(sid).await.unwrap();
    assert!(matches!(
        engine.create_booking(booking_req(sid, 1)).await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(
        engine.slot_stats(sid).await.unwrap().status,
        OccupancyStatus::Cancelled
    );
}

#[tokio::test]
async fn guest_booking_needs_contact_details() {
    let engine = new_engine("booking_guest.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let mut req = booking_req(sid, 1);
    req.customer = CustomerIdentity::Guest {
        name: "Ann".into(),
        phone: "  ".into(),
        email: None,
    };
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::Validation(_))
    ));

    let mut req = booking_req(sid, 1);
    req.customer = CustomerIdentity::Registered {
        user_id: "user-7".into(),
    };
    engine.create_booking(req).await.unwrap();
}

#[tokio::test]
async fn duplicate_booking_id_is_refused() {
    let engine = new_engine("booking_duplicate.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let req = booking_req(sid, 1);
    engine.create_booking(req.clone()).await.unwrap();
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn concurrent_retries_with_one_id_book_once() {
    let engine = Arc::new(new_engine("booking_duplicate_concurrent.wal"));
    let tid = tour(&engine, 10, Some(10)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let other = slot(&engine, tid, window(11, 0, 12, 0)).await;
    let req = booking_req(sid, 2);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let mut req = req.clone();
        // Half the retries point the same id at a different slot.
        if i % 2 == 1 {
            req.slot_id = other;
        }
        handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::AlreadyExists(id)) => assert_eq!(id, req.id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);

    let on_first = engine.bookings_for_slot(sid).await.unwrap();
    let on_other = engine.bookings_for_slot(other).await.unwrap();
    assert_eq!(on_first.len() + on_other.len(), 1);
    let home = if on_first.is_empty() { other } else { sid };
    assert_eq!(engine.slot_for_booking(&req.id), Some(home));

    let audit = engine.audit_slot(home).await.unwrap();
    assert_eq!(audit.counter, 2);
    assert!(audit.is_consistent());
    let idle = if home == sid { other } else { sid };
    assert_eq!(engine.audit_slot(idle).await.unwrap().counter, 0);

    // The one booking that exists can still be cancelled.
    engine.cancel_booking(req.id, None).await.unwrap();
    assert_eq!(engine.audit_slot(home).await.unwrap().counter, 0);
}

#[tokio::test]
async fn failed_booking_releases_its_id() {
    let engine = new_engine("booking_id_released.wal");
    let tid = tour(&engine, 10, Some(4)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let mut req = booking_req(sid, 6);
    assert!(engine.create_booking(req.clone()).await.is_err());
    assert_eq!(engine.slot_for_booking(&req.id), None);

    req.participants = 2;
    engine.create_booking(req).await.unwrap();
}

// ── Booking state machine ────────────────────────────────

#[tokio::test]
async fn pending_cannot_complete_directly() {
    let engine = new_engine("status_pending_complete.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let b = engine.create_booking(booking_req(sid, 2)).await.unwrap();

    let result = engine
        .update_booking_status(b.id, BookingStatus::Completed, None)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Pending,
            to: BookingStatus::Completed
        })
    ));
    assert!(matches!(
        engine
            .update_booking_status(b.id, BookingStatus::Pending, None)
            .await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn full_lifecycle_sets_timestamps() {
    let engine = new_engine("status_lifecycle.wal");
    let tid = tour(&engine, 10, Some(6)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let b = engine.create_booking(booking_req(sid, 2)).await.unwrap();

    let b = engine
        .update_booking_status(b.id, BookingStatus::Confirmed, Some("called".into()))
        .await
        .unwrap();
    assert!(b.confirmed_at.is_some());
    assert!(b.notes.as_deref().unwrap().contains("called"));
    let b = engine
        .update_booking_status(b.id, BookingStatus::Paid, None)
        .await
        .unwrap();
    assert!(b.paid_at.is_some());
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().booked_count, 2);

    let b = engine
        .update_booking_status(b.id, BookingStatus::Completed, None)
        .await
        .unwrap();
    assert!(b.completed_at.is_some());
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().booked_count, 0);

    // Terminal.
    assert!(matches!(
        engine.cancel_booking(b.id, None).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn paid_booking_can_be_cancelled() {
    let engine = new_engine("status_paid_cancel.wal");
    let tid = tour(&engine, 10, Some(6)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let mut req = booking_req(sid, 4);
    req.initial_status = Some(BookingStatus::Paid);
    let b = engine.create_booking(req).await.unwrap();
    assert!(b.confirmed_at.is_some());
    assert!(b.paid_at.is_some());

    let b = engine
        .cancel_booking(b.id, Some("sick".into()))
        .await
        .unwrap();
    assert_eq!(b.status, BookingStatus::Cancelled);
    assert!(b.cancelled_at.is_some());
    assert!(b.notes.unwrap().contains("cancellation reason: sick"));
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().free_seats(), 6);
}

#[tokio::test]
async fn booking_cannot_start_cancelled() {
    let engine = new_engine("status_initial.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let mut req = booking_req(sid, 1);
    req.initial_status = Some(BookingStatus::Cancelled);
    assert!(matches!(
        engine.create_booking(req).await,
        Err(EngineError::Validation(_))
    ));
}

// ── Booking maintenance ──────────────────────────────────

#[tokio::test]
async fn delete_booking_rules() {
    let engine = new_engine("booking_delete.wal");
    let tid = tour(&engine, 10, Some(6)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

    let pending = engine.create_booking(booking_req(sid, 2)).await.unwrap();
    let mut req = booking_req(sid, 1);
    req.initial_status = Some(BookingStatus::Confirmed);
    let confirmed = engine.create_booking(req).await.unwrap();
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().booked_count, 3);

    assert!(matches!(
        engine.delete_booking(confirmed.id).await,
        Err(EngineError::Validation(_))
    ));
    engine.delete_booking(pending.id).await.unwrap();
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().booked_count, 1);
    assert!(matches!(
        engine.get_booking(pending.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.find_booking_by_code(&pending.code).await.is_none());
}

#[tokio::test]
async fn update_booking_contact() {
    let engine = new_engine("booking_contact.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let b = engine.create_booking(booking_req(sid, 1)).await.unwrap();

    let updated = engine
        .update_booking(
            b.id,
            BookingUpdate {
                customer_email: Some("ann@example.com".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        updated.customer,
        CustomerIdentity::Guest {
            name: "Ann".into(),
            phone: "+49 30 1234567".into(),
            email: Some("ann@example.com".into()),
        }
    );

    let mut req = booking_req(sid, 1);
    req.customer = CustomerIdentity::Registered {
        user_id: "user-9".into(),
    };
    let registered = engine.create_booking(req).await.unwrap();
    assert!(matches!(
        engine
            .update_booking(registered.id, BookingUpdate::default())
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn find_booking_by_code_ignores_case() {
    let engine = new_engine("booking_code.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let b = engine.create_booking(booking_req(sid, 1)).await.unwrap();

    let found = engine
        .find_booking_by_code(&b.code.to_lowercase())
        .await
        .unwrap();
    assert_eq!(found.id, b.id);
    assert!(engine.find_booking_by_code("nope").await.is_none());
}

#[tokio::test]
async fn bookings_for_slot_skip_cancelled() {
    let engine = new_engine("booking_list.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let a = engine.create_booking(booking_req(sid, 1)).await.unwrap();
    let b = engine.create_booking(booking_req(sid, 2)).await.unwrap();
    engine.cancel_booking(a.id, None).await.unwrap();

    let listed = engine.bookings_for_slot(sid).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, b.id);
}

#[tokio::test]
async fn booking_stats_sum_revenue() {
    let engine = new_engine("booking_stats.wal");
    let tid = tour(&engine, 100, Some(20)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

    let pending = engine.create_booking(booking_req(sid, 1)).await.unwrap();
    let mut req = booking_req(sid, 2);
    req.initial_status = Some(BookingStatus::Confirmed);
    engine.create_booking(req).await.unwrap();
    let mut req = booking_req(sid, 3);
    req.initial_status = Some(BookingStatus::Paid);
    engine.create_booking(req).await.unwrap();
    let cancelled = engine.create_booking(booking_req(sid, 4)).await.unwrap();
    engine.cancel_booking(cancelled.id, None).await.unwrap();

    let stats = engine.booking_stats(None, None).await;
    assert_eq!(stats.total, 4);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.confirmed, 1);
    assert_eq!(stats.paid, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.revenue, Decimal::from(500));
    assert_eq!(stats.participants, 5);

    let created = chrono::DateTime::from_timestamp_millis(pending.created_at)
        .unwrap()
        .date_naive();
    let none = engine
        .booking_stats(Some(created + chrono::Duration::days(1)), None)
        .await;
    assert_eq!(none.total, 0);
}

// ── Slot maintenance ─────────────────────────────────────

#[tokio::test]
async fn slot_stats_report_occupancy() {
    let engine = new_engine("slot_stats.wal");
    let tid = tour(&engine, 10, Some(6)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    assert_eq!(
        engine.slot_stats(sid).await.unwrap().status,
        OccupancyStatus::Available
    );

    let pending = engine.create_booking(booking_req(sid, 2)).await.unwrap();
    let mut req = booking_req(sid, 3);
    req.initial_status = Some(BookingStatus::Paid);
    let paid = engine.create_booking(req).await.unwrap();

    let stats = engine.slot_stats(sid).await.unwrap();
    assert_eq!(stats.total_capacity, 6);
    assert_eq!(stats.booked, 5);
    assert_eq!(stats.free, 1);
    assert_eq!(stats.pending_count, 2);
    assert_eq!(stats.confirmed_count, 3);
    assert_eq!(stats.bookings_count, 2);
    assert_eq!(stats.status, OccupancyStatus::PartiallyBooked);

    engine.create_booking(booking_req(sid, 1)).await.unwrap();
    assert_eq!(
        engine.slot_stats(sid).await.unwrap().status,
        OccupancyStatus::FullyBooked
    );

    // Completed bookings free their seats but still count as bookings.
    engine
        .update_booking_status(paid.id, BookingStatus::Completed, None)
        .await
        .unwrap();
    let stats = engine.slot_stats(sid).await.unwrap();
    assert_eq!(stats.booked, 3);
    assert_eq!(stats.bookings_count, 3);

    engine.cancel_booking(pending.id, None).await.unwrap();
    assert_eq!(engine.slot_stats(sid).await.unwrap().bookings_count, 2);
}

#[tokio::test]
async fn delete_slot_only_when_empty() {
    let engine = new_engine("slot_delete.wal");
    let tid = tour(&engine, 10, Some(6)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let b = engine.create_booking(booking_req(sid, 1)).await.unwrap();

    assert!(matches!(
        engine.delete_slot(sid).await,
        Err(EngineError::IntegrityConflict(_))
    ));
    engine.cancel_booking(b.id, None).await.unwrap();
    engine.delete_slot(sid).await.unwrap();
    assert!(engine.get_slot(&sid).is_none());
    assert!(matches!(
        engine.get_booking(b.id).await,
        Err(EngineError::NotFound(_))
    ));

    // The start time is free again.
    slot(&engine, tid, window(9, 0, 10, 0)).await;
}

#[tokio::test]
async fn update_slot_keeps_capacity_above_bookings() {
    let engine = new_engine("slot_update.wal");
    let tid = tour(&engine, 10, Some(6)).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    engine.create_booking(booking_req(sid, 4)).await.unwrap();

    assert!(matches!(
        engine
            .update_slot(
                sid,
                SlotUpdate {
                    total_capacity: Some(3),
                    notes: None,
                }
            )
            .await,
        Err(EngineError::Validation(_))
    ));
    let updated = engine
        .update_slot(
            sid,
            SlotUpdate {
                total_capacity: Some(12),
                notes: Some("meet at the pier".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.free_seats(), 8);
    assert_eq!(updated.notes.as_deref(), Some("meet at the pier"));
}

#[tokio::test]
async fn template_delete_refused_while_slots_exist() {
    let engine = new_engine("template_delete.wal");
    let tid = tour(&engine, 10, None).await;
    let tpl = template(&engine, tid, t(9, 0), t(11, 0), 60, 0).await;
    engine
        .generate_schedules(tpl, monday(), monday(), false, true)
        .await
        .unwrap();

    match engine.delete_template(tpl).await {
        Err(EngineError::IntegrityConflict(msg)) => {
            assert!(msg.contains("2 generated slots"), "{msg}")
        }
        other => panic!("expected IntegrityConflict, got {other:?}"),
    }
    for s in engine.list_slots(tid, None, None).await {
        engine.delete_slot(s.id).await.unwrap();
    }
    engine.delete_template(tpl).await.unwrap();
    assert!(engine.templates.get(&tpl).is_none());
}

#[tokio::test]
async fn template_update_is_validated() {
    let engine = new_engine("template_update.wal");
    let tid = tour(&engine, 10, None).await;
    let tpl = template(&engine, tid, t(9, 0), t(11, 0), 60, 0).await;
    let result = engine
        .update_template(
            tpl,
            TemplateUpdate {
                day_end: Some(t(8, 0)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert_eq!(engine.templates.get(&tpl).unwrap().day_end, t(11, 0));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn booking_events_are_published_per_tour() {
    let engine = new_engine("notify_tour.wal");
    let tid = tour(&engine, 10, None).await;
    let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
    let mut rx = engine.notify.subscribe(tid);

    let b = engine.create_booking(booking_req(sid, 1)).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::BookingCreated { booking } => assert_eq!(booking.id, b.id),
        other => panic!("expected BookingCreated, got {other:?}"),
    }
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_state.wal");
    let (tid, sid, jeep, booking, cancelled) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let jeep = resource(&engine, 1, 4).await;
        let tid = tour(&engine, 75, Some(6)).await;
        engine.set_requirement(tid, jeep, 1).await.unwrap();
        let tpl = template(&engine, tid, t(9, 0), t(10, 0), 60, 0).await;
        engine
            .generate_schedules(tpl, monday(), monday(), false, true)
            .await
            .unwrap();
        let sid = engine.list_slots(tid, None, None).await[0].id;
        let booking = engine.create_booking(booking_req(sid, 2)).await.unwrap();
        let other = engine.create_booking(booking_req(sid, 3)).await.unwrap();
        let cancelled = engine.cancel_booking(other.id, None).await.unwrap();
        (tid, sid, jeep, booking, cancelled)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let snapshot = engine.get_slot_snapshot(sid).await.unwrap();
    assert_eq!(snapshot.booked_count, 2);
    assert!(engine.audit_slot(sid).await.unwrap().is_consistent());
    assert_eq!(engine.get_booking(booking.id).await.unwrap(), booking);
    assert_eq!(
        engine.get_booking(cancelled.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(
        engine.find_booking_by_code(&booking.code).await.unwrap().id,
        booking.id
    );
    assert_eq!(engine.tours.get(&tid).unwrap().requirements.len(), 1);

    // The replayed ledger still holds the jeep.
    let other = tour(&engine, 10, Some(4)).await;
    engine.set_requirement(other, jeep, 1).await.unwrap();
    assert!(matches!(
        engine
            .create_slot(Ulid::new(), other, monday(), window(9, 30, 10, 30), None)
            .await,
        Err(EngineError::ResourceConflict(_))
    ));
}

#[tokio::test]
async fn replay_after_overwrite_and_delete() {
    let path = test_wal_path("replay_overwrite.wal");
    let (tid, remaining) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let tid = tour(&engine, 10, Some(4)).await;
        let tpl = template(&engine, tid, t(9, 0), t(11, 0), 60, 0).await;
        engine
            .generate_schedules(tpl, monday(), monday(), false, true)
            .await
            .unwrap();
        engine
            .generate_schedules(tpl, monday(), monday(), true, true)
            .await
            .unwrap();
        let slots = engine.list_slots(tid, None, None).await;
        engine.delete_slot(slots[0].id).await.unwrap();
        (tid, slots[1].id)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let slots = engine.list_slots(tid, None, None).await;
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].id, remaining);
    assert_eq!(engine.slots.len(), 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let (sid, paid, cancelled_slot) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let jeep = resource(&engine, 2, 4).await;
        let tid = tour(&engine, 40, Some(8)).await;
        engine.set_requirement(tid, jeep, 1).await.unwrap();
        let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;
        let cancelled_slot = slot(&engine, tid, window(11, 0, 12, 0)).await;
        engine.cancel_slot(cancelled_slot).await.unwrap();

        let mut req = booking_req(sid, 3);
        req.initial_status = Some(BookingStatus::Paid);
        let paid = engine.create_booking(req).await.unwrap();
        for _ in 0..10 {
            let b = engine.create_booking(booking_req(sid, 1)).await.unwrap();
            engine.cancel_booking(b.id, None).await.unwrap();
        }

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "{after} < {before}");
        (sid, paid, cancelled_slot)
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let snapshot = engine.get_slot_snapshot(sid).await.unwrap();
    assert_eq!(snapshot.booked_count, 3);
    assert_eq!(engine.get_booking(paid.id).await.unwrap(), paid);
    assert_eq!(engine.bookings_for_slot(sid).await.unwrap().len(), 1);
    assert_eq!(
        engine.get_slot_snapshot(cancelled_slot).await.unwrap().status,
        SlotStatus::Cancelled
    );
    assert!(engine.audit_slot(sid).await.unwrap().is_consistent());
}

#[tokio::test]
async fn compaction_does_not_lose_concurrent_writes() {
    let path = test_wal_path("compact_concurrent.wal");
    let (sid, expected) = {
        let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());
        let tid = tour(&engine, 10, Some(200)).await;
        let sid = slot(&engine, tid, window(9, 0, 10, 0)).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.create_booking(booking_req(sid, 1)).await.unwrap();
            }));
        }
        let compactor = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.compact_wal().await.unwrap() })
        };
        for h in handles {
            h.await.unwrap();
        }
        compactor.await.unwrap();
        (sid, engine.get_slot_snapshot(sid).await.unwrap().booked_count)
    };
    assert_eq!(expected, 50);

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.get_slot_snapshot(sid).await.unwrap().booked_count, 50);
    assert_eq!(engine.bookings_for_slot(sid).await.unwrap().len(), 50);
}
