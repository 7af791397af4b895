use super::*;
use std::sync::Arc;

use chrono::NaiveDate;

fn d(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

/// `hour` o'clock on `date`.
fn at(date: &str, hour: i64) -> Ms {
    date_start_ms(d(date)) + hour * HOUR_MS
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("haven_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("wal.tmp"));
    path
}

fn new_engine(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    (Engine::new(path.clone()).unwrap(), path)
}

async fn add_resource(
    engine: &Engine,
    kind: ResourceKind,
    capacity: u32,
    buffer_after: Option<Ms>,
    max_occupancy: Option<u32>,
) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(ResourceInfo {
            id,
            kind,
            name: format!("{} {}", kind.as_str(), id),
            capacity,
            buffer_after,
            max_occupancy,
        })
        .await
        .unwrap();
    id
}

async fn room(engine: &Engine) -> Ulid {
    add_resource(engine, ResourceKind::Room, 1, None, Some(4)).await
}

async fn place(engine: &Engine) -> Ulid {
    add_resource(engine, ResourceKind::Place, 1, None, None).await
}

async fn reserve(engine: &Engine, start: &str, end: &str, status: ReservationStatus) -> Ulid {
    let id = Ulid::new();
    engine
        .create_reservation(NewReservation {
            id,
            group_name: "Hanbit Elementary".into(),
            contact_name: Some("Kim".into()),
            contact_phone: None,
            category: "social_contribution".into(),
            start_date: d(start),
            end_date: d(end),
            status,
            hold_until: None,
            notes: None,
        })
        .await
        .unwrap();
    id
}

fn stay(room_id: Ulid, check_in: &str, check_out: &str) -> RoomAssignment {
    RoomAssignment {
        id: Ulid::new(),
        room_id,
        check_in: d(check_in),
        check_out: d(check_out),
        occupants: 2,
    }
}

fn place_booking(place_id: Ulid, start: Ms, end: Ms) -> PlaceBooking {
    PlaceBooking {
        id: Ulid::new(),
        place_id,
        span: Span::new(start, end),
        headcount: 20,
        purpose: None,
    }
}

fn ledger_item(kind: LedgerKind, phase: LedgerPhase, category: &str, amount: Won) -> LedgerItem {
    LedgerItem {
        id: Ulid::new(),
        kind,
        phase,
        category: category.into(),
        description: None,
        amount,
    }
}

async fn add_staff(engine: &Engine, role: StaffRole, rate: Won) -> Ulid {
    let id = Ulid::new();
    engine
        .create_staff(Staff {
            id,
            name: format!("{} {}", role.as_str(), id),
            role,
            rate,
        })
        .await
        .unwrap();
    id
}

fn session(name: &str, span: Span, place_id: Option<Ulid>, instructor_id: Option<Ulid>) -> ProgramSession {
    ProgramSession {
        id: Ulid::new(),
        name: name.into(),
        span,
        place_id,
        instructor_id,
        assistant_id: None,
        helper_id: None,
        headcount: 15,
    }
}

// ── Resources, closures, staff ───────────────────────────

#[tokio::test]
async fn resource_lifecycle() {
    let (engine, _) = new_engine("resource_lifecycle.wal");
    let r = room(&engine).await;
    let p = place(&engine).await;

    assert_eq!(engine.list_resources(None).await.len(), 2);
    let rooms = engine.list_resources(Some(ResourceKind::Room)).await;
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].id, r);

    let patch = ResourcePatch {
        name: Some("Pine 101".into()),
        capacity: Some(2),
        ..ResourcePatch::default()
    };
    let updated = engine.update_resource(r, patch).await.unwrap();
    assert_eq!(updated.name, "Pine 101");
    assert_eq!(updated.capacity, 2);

    let zero = ResourcePatch {
        capacity: Some(0),
        ..ResourcePatch::default()
    };
    assert!(matches!(
        engine.update_resource(r, zero).await,
        Err(EngineError::Invalid(_))
    ));

    engine.delete_resource(p).await.unwrap();
    assert!(matches!(
        engine.delete_resource(p).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(engine.list_resources(None).await.len(), 1);
}

#[tokio::test]
async fn ids_are_unique_across_record_kinds() {
    let (engine, _) = new_engine("unique_ids.wal");
    let r = room(&engine).await;
    let clash = Staff {
        id: r,
        name: "Lee".into(),
        role: StaffRole::Helper,
        rate: 50_000,
    };
    assert!(matches!(
        engine.create_staff(clash).await,
        Err(EngineError::AlreadyExists(id)) if id == r
    ));
}

#[tokio::test]
async fn resource_with_bookings_cannot_be_deleted() {
    let (engine, _) = new_engine("delete_booked_resource.wal");
    let r = room(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;
    engine
        .assign_rooms(rid, vec![stay(r, "2030-05-01", "2030-05-03")])
        .await
        .unwrap();
    assert!(matches!(
        engine.delete_resource(r).await,
        Err(EngineError::HasBookings(_))
    ));
}

#[tokio::test]
async fn closures_block_bookings() {
    let (engine, _) = new_engine("closures.wal");
    let p = place(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;

    let closure = Ulid::new();
    engine
        .add_closure(
            closure,
            p,
            Span::new(at("2030-05-01", 9), at("2030-05-01", 12)),
            Some("floor repair".into()),
        )
        .await
        .unwrap();
    let closures = engine.get_closures(p).await;
    assert_eq!(closures.len(), 1);
    assert_eq!(closures[0].reason.as_deref(), Some("floor repair"));

    let blocked = place_booking(p, at("2030-05-01", 11), at("2030-05-01", 13));
    assert!(matches!(
        engine.book_place(rid, blocked.clone()).await,
        Err(EngineError::ClosedForBooking { closure: c, .. }) if c == closure
    ));

    engine.remove_closure(closure).await.unwrap();
    assert!(engine.get_closures(p).await.is_empty());
    engine.book_place(rid, blocked.clone()).await.unwrap();

    // A closure cannot be laid over an existing booking.
    assert!(matches!(
        engine
            .add_closure(Ulid::new(), p, Span::new(at("2030-05-01", 12), at("2030-05-01", 14)), None)
            .await,
        Err(EngineError::Conflict { with, .. }) if with == blocked.id
    ));
}

#[tokio::test]
async fn staff_in_use_is_protected() {
    let (engine, _) = new_engine("staff_in_use.wal");
    let instructor = add_staff(&engine, StaffRole::Instructor, 80_000).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let s = session(
        "Forest bathing",
        Span::new(at("2030-05-01", 10), at("2030-05-01", 12)),
        None,
        Some(instructor),
    );
    engine.schedule_program(rid, s.clone()).await.unwrap();

    assert!(matches!(
        engine.delete_staff(instructor).await,
        Err(EngineError::StaffInUse(_))
    ));
    let promote = StaffPatch {
        role: Some(StaffRole::Helper),
        ..StaffPatch::default()
    };
    assert!(matches!(
        engine.update_staff(instructor, promote.clone()).await,
        Err(EngineError::StaffInUse(_))
    ));
    let raise = StaffPatch {
        rate: Some(90_000),
        ..StaffPatch::default()
    };
    assert_eq!(engine.update_staff(instructor, raise).await.unwrap().rate, 90_000);

    engine.remove_entry(EntryKind::Program, s.id).await.unwrap();
    engine.update_staff(instructor, promote).await.unwrap();
    engine.delete_staff(instructor).await.unwrap();
    assert!(engine.get_staff(instructor).is_none());
}

#[tokio::test]
async fn program_staff_must_match_role() {
    let (engine, _) = new_engine("program_roles.wal");
    let helper = add_staff(&engine, StaffRole::Helper, 60_000).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let s = session(
        "Yoga",
        Span::new(at("2030-05-01", 10), at("2030-05-01", 11)),
        None,
        Some(helper),
    );
    assert!(matches!(
        engine.schedule_program(rid, s).await,
        Err(EngineError::Invalid(_))
    ));
    let unknown = session(
        "Yoga",
        Span::new(at("2030-05-01", 10), at("2030-05-01", 11)),
        None,
        Some(Ulid::new()),
    );
    assert!(matches!(
        engine.schedule_program(rid, unknown).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Booking rules ────────────────────────────────────────

#[tokio::test]
async fn overlapping_stays_conflict_back_to_back_do_not() {
    let (engine, _) = new_engine("room_conflict.wal");
    let r = room(&engine).await;
    let first = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;
    let second = reserve(&engine, "2030-05-02", "2030-05-05", ReservationStatus::Tentative).await;

    let held = stay(r, "2030-05-01", "2030-05-03");
    engine.assign_rooms(first, vec![held.clone()]).await.unwrap();

    assert!(matches!(
        engine
            .assign_rooms(second, vec![stay(r, "2030-05-02", "2030-05-04")])
            .await,
        Err(EngineError::Conflict { with, .. }) if with == held.id
    ));
    // Checking in the day the first group checks out is fine.
    engine
        .assign_rooms(second, vec![stay(r, "2030-05-03", "2030-05-05")])
        .await
        .unwrap();
    assert_eq!(engine.get_bookings(r).await.len(), 2);
}

#[tokio::test]
async fn room_batch_is_all_or_nothing() {
    let (engine, _) = new_engine("room_batch.wal");
    let a = room(&engine).await;
    let b = room(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;

    // The third row collides with the first row of the same batch.
    let rows = vec![
        stay(a, "2030-05-01", "2030-05-03"),
        stay(b, "2030-05-01", "2030-05-03"),
        stay(a, "2030-05-02", "2030-05-03"),
    ];
    assert!(engine.assign_rooms(rid, rows).await.unwrap_err().is_conflict());
    assert!(engine.get_bookings(a).await.is_empty());
    assert!(engine.get_bookings(b).await.is_empty());
    assert!(engine.get_reservation(rid).await.unwrap().rooms.is_empty());

    let rows = vec![stay(a, "2030-05-01", "2030-05-03"), stay(b, "2030-05-01", "2030-05-02")];
    engine.assign_rooms(rid, rows).await.unwrap();
    assert_eq!(engine.get_reservation(rid).await.unwrap().rooms.len(), 2);
}

#[tokio::test]
async fn changeover_buffer_separates_place_bookings() {
    let (engine, _) = new_engine("place_buffer.wal");
    let hall = add_resource(&engine, ResourceKind::Place, 1, Some(30 * 60_000), None).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-01", ReservationStatus::Confirmed).await;

    engine
        .book_place(rid, place_booking(hall, at("2030-05-01", 9), at("2030-05-01", 11)))
        .await
        .unwrap();
    let too_soon = place_booking(hall, at("2030-05-01", 11) + 10 * 60_000, at("2030-05-01", 12));
    assert!(matches!(
        engine.book_place(rid, too_soon).await,
        Err(EngineError::Conflict { .. })
    ));
    let ends_too_late = place_booking(hall, at("2030-05-01", 8), at("2030-05-01", 9) - 10 * 60_000);
    assert!(matches!(
        engine.book_place(rid, ends_too_late).await,
        Err(EngineError::Conflict { .. })
    ));
    engine
        .book_place(rid, place_booking(hall, at("2030-05-01", 11) + 30 * 60_000, at("2030-05-01", 13)))
        .await
        .unwrap();
}

#[tokio::test]
async fn shared_place_honours_capacity() {
    let (engine, _) = new_engine("place_capacity.wal");
    let field = add_resource(&engine, ResourceKind::Place, 2, None, None).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-01", ReservationStatus::Confirmed).await;

    engine
        .book_place(rid, place_booking(field, at("2030-05-01", 9), at("2030-05-01", 12)))
        .await
        .unwrap();
    engine
        .book_place(rid, place_booking(field, at("2030-05-01", 10), at("2030-05-01", 13)))
        .await
        .unwrap();
    assert!(matches!(
        engine
            .book_place(rid, place_booking(field, at("2030-05-01", 11), at("2030-05-01", 14)))
            .await,
        Err(EngineError::CapacityExceeded { capacity: 2, .. })
    ));
    engine
        .book_place(rid, place_booking(field, at("2030-05-01", 12), at("2030-05-01", 14)))
        .await
        .unwrap();
}

#[tokio::test]
async fn program_session_books_its_place() {
    let (engine, _) = new_engine("program_place.wal");
    let hall = place(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let span = Span::new(at("2030-05-01", 14), at("2030-05-01", 16));

    engine
        .schedule_program(rid, session("Tea ceremony", span, Some(hall), None))
        .await
        .unwrap();
    assert!(matches!(
        engine.book_place(rid, place_booking(hall, span.start, span.end)).await,
        Err(EngineError::Conflict { .. })
    ));
    let bookings = engine.get_bookings(hall).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].reservation_id, rid);
}

#[tokio::test]
async fn resource_kind_and_occupancy_are_enforced() {
    let (engine, _) = new_engine("kind_occupancy.wal");
    let r = room(&engine).await;
    let hall = place(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;

    assert!(matches!(
        engine
            .assign_rooms(rid, vec![stay(hall, "2030-05-01", "2030-05-02")])
            .await,
        Err(EngineError::WrongResourceKind { expected: ResourceKind::Room, .. })
    ));
    assert!(matches!(
        engine
            .book_place(rid, place_booking(r, at("2030-05-01", 9), at("2030-05-01", 10)))
            .await,
        Err(EngineError::WrongResourceKind { expected: ResourceKind::Place, .. })
    ));

    let mut crowded = stay(r, "2030-05-01", "2030-05-02");
    crowded.occupants = 5;
    assert!(matches!(
        engine.assign_rooms(rid, vec![crowded]).await,
        Err(EngineError::OccupancyExceeded { max: 4, requested: 5, .. })
    ));
}

#[tokio::test]
async fn details_must_fall_inside_the_stay() {
    let (engine, _) = new_engine("out_of_range.wal");
    let r = room(&engine).await;
    let hall = place(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;

    assert!(matches!(
        engine
            .assign_rooms(rid, vec![stay(r, "2030-04-30", "2030-05-02")])
            .await,
        Err(EngineError::OutOfRange { what: "room stay", .. })
    ));
    assert!(matches!(
        engine
            .book_place(rid, place_booking(hall, at("2030-05-03", 22), at("2030-05-04", 1)))
            .await,
        Err(EngineError::OutOfRange { .. })
    ));
    let late_meal = MealOrder {
        id: Ulid::new(),
        date: d("2030-05-04"),
        meal: Meal::Breakfast,
        headcount: 20,
        unit_price: 8_000,
    };
    assert!(matches!(
        engine.order_meal(rid, late_meal).await,
        Err(EngineError::OutOfRange { what: "meal date", .. })
    ));

    // The last day is bookable all day.
    engine
        .book_place(rid, place_booking(hall, at("2030-05-03", 20), at("2030-05-03", 23)))
        .await
        .unwrap();

    // Shrinking the stay below existing details is refused.
    engine
        .assign_rooms(rid, vec![stay(r, "2030-05-01", "2030-05-03")])
        .await
        .unwrap();
    let shrink = ReservationPatch {
        end_date: Some(d("2030-05-02")),
        ..ReservationPatch::default()
    };
    assert!(matches!(
        engine.update_reservation(rid, shrink).await,
        Err(EngineError::OutOfRange { .. })
    ));
}

// ── Reservation lifecycle ────────────────────────────────

#[tokio::test]
async fn cancelling_releases_every_booking() {
    let (engine, _) = new_engine("cancel_release.wal");
    let r = room(&engine).await;
    let hall = place(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;
    engine
        .assign_rooms(rid, vec![stay(r, "2030-05-01", "2030-05-03")])
        .await
        .unwrap();
    engine
        .book_place(rid, place_booking(hall, at("2030-05-02", 9), at("2030-05-02", 12)))
        .await
        .unwrap();

    let cancelled = engine.set_status(rid, ReservationStatus::Cancelled).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert!(engine.get_bookings(r).await.is_empty());
    assert!(engine.get_bookings(hall).await.is_empty());

    // Records stay on the cancelled reservation.
    let state = engine.get_reservation(rid).await.unwrap();
    assert_eq!(state.rooms.len(), 1);
    assert_eq!(state.places.len(), 1);

    let other = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;
    engine
        .assign_rooms(other, vec![stay(r, "2030-05-01", "2030-05-03")])
        .await
        .unwrap();

    assert!(matches!(
        engine.set_status(rid, ReservationStatus::Confirmed).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn closed_reservation_accepts_only_bookkeeping() {
    let (engine, _) = new_engine("closed_reservation.wal");
    let r = room(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let held = stay(r, "2030-05-01", "2030-05-02");
    engine.assign_rooms(rid, vec![held.clone()]).await.unwrap();
    engine.set_status(rid, ReservationStatus::Completed).await.unwrap();

    assert!(matches!(
        engine
            .assign_rooms(rid, vec![stay(room(&engine).await, "2030-05-01", "2030-05-02")])
            .await,
        Err(EngineError::ReservationClosed { status: ReservationStatus::Completed, .. })
    ));
    assert!(matches!(
        engine.remove_entry(EntryKind::Room, held.id).await,
        Err(EngineError::ReservationClosed { .. })
    ));
    assert!(matches!(
        engine.set_participants(rid, Participants::default()).await,
        Err(EngineError::ReservationClosed { .. })
    ));

    let item = ledger_item(LedgerKind::Income, LedgerPhase::Actual, "fees", 500_000);
    engine.add_ledger_item(rid, item.clone()).await.unwrap();
    engine
        .add_document(
            rid,
            Document {
                id: Ulid::new(),
                kind: "receipt".into(),
                title: "Final receipt".into(),
                issued_on: Some(d("2030-05-03")),
            },
        )
        .await
        .unwrap();
    engine.remove_entry(EntryKind::Ledger, item.id).await.unwrap();
    let state = engine.get_reservation(rid).await.unwrap();
    assert!(state.ledger.is_empty());
    assert_eq!(state.documents.len(), 1);
}

#[tokio::test]
async fn remove_entry_checks_the_table() {
    let (engine, _) = new_engine("remove_entry_kind.wal");
    let r = room(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let held = stay(r, "2030-05-01", "2030-05-02");
    engine.assign_rooms(rid, vec![held.clone()]).await.unwrap();

    assert!(matches!(
        engine.remove_entry(EntryKind::Meal, held.id).await,
        Err(EngineError::NotFound(_))
    ));
    engine.remove_entry(EntryKind::Room, held.id).await.unwrap();
    assert!(engine.get_bookings(r).await.is_empty());
    assert!(matches!(
        engine.remove_entry(EntryKind::Room, held.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleting_a_reservation_cascades() {
    let (engine, _) = new_engine("delete_cascade.wal");
    let r = room(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let held = stay(r, "2030-05-01", "2030-05-02");
    engine.assign_rooms(rid, vec![held.clone()]).await.unwrap();
    let meal = MealOrder {
        id: Ulid::new(),
        date: d("2030-05-01"),
        meal: Meal::Dinner,
        headcount: 12,
        unit_price: 9_000,
    };
    engine.order_meal(rid, meal.clone()).await.unwrap();

    engine.delete_reservation(rid).await.unwrap();
    assert!(matches!(
        engine.get_reservation(rid).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.get_bookings(r).await.is_empty());
    assert!(matches!(
        engine.remove_entry(EntryKind::Meal, meal.id).await,
        Err(EngineError::NotFound(_))
    ));
    // The room is deletable once nothing holds it.
    engine.delete_resource(r).await.unwrap();
}

#[tokio::test]
async fn expired_holds_are_cancelled() {
    let (engine, _) = new_engine("expired_holds.wal");
    let r = room(&engine).await;
    let rid = Ulid::new();
    engine
        .create_reservation(NewReservation {
            id: rid,
            group_name: "Walk-in".into(),
            contact_name: None,
            contact_phone: None,
            category: "general".into(),
            start_date: d("2030-05-01"),
            end_date: d("2030-05-02"),
            status: ReservationStatus::Tentative,
            hold_until: Some(1_000),
            notes: None,
        })
        .await
        .unwrap();
    engine
        .assign_rooms(rid, vec![stay(r, "2030-05-01", "2030-05-02")])
        .await
        .unwrap();
    let kept = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Tentative).await;

    assert!(engine.collect_expired_holds(999).is_empty());
    let expired = engine.collect_expired_holds(1_000);
    assert_eq!(expired, vec![rid]);

    assert!(engine.expire_hold(rid, 1_000).await.unwrap());
    assert!(!engine.expire_hold(rid, 1_000).await.unwrap());
    assert!(!engine.expire_hold(kept, 1_000).await.unwrap());

    let state = engine.get_reservation(rid).await.unwrap();
    assert_eq!(state.reservation.status, ReservationStatus::Cancelled);
    assert_eq!(state.reservation.hold_until, None);
    assert!(engine.get_bookings(r).await.is_empty());
}

#[tokio::test]
async fn listing_filters_reservations() {
    let (engine, _) = new_engine("list_filter.wal");
    let may = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    reserve(&engine, "2030-06-01", "2030-06-02", ReservationStatus::Tentative).await;

    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 2);
    let filter = ReservationFilter {
        status: Some(ReservationStatus::Confirmed),
        ..ReservationFilter::default()
    };
    let confirmed = engine.list_reservations(&filter).await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].id, may);

    let filter = ReservationFilter {
        from: Some(d("2030-05-15")),
        to: Some(d("2030-06-30")),
        ..ReservationFilter::default()
    };
    assert_eq!(engine.list_reservations(&filter).await.len(), 1);
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_and_vacancies() {
    let (engine, _) = new_engine("availability.wal");
    let hall = place(&engine).await;
    let other = place(&engine).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-01", ReservationStatus::Confirmed).await;
    engine
        .book_place(rid, place_booking(hall, at("2030-05-01", 10), at("2030-05-01", 12)))
        .await
        .unwrap();

    let free = engine
        .compute_availability(hall, at("2030-05-01", 8), at("2030-05-01", 18), None)
        .await
        .unwrap();
    assert_eq!(
        free,
        vec![
            Span::new(at("2030-05-01", 8), at("2030-05-01", 10)),
            Span::new(at("2030-05-01", 12), at("2030-05-01", 18)),
        ]
    );
    let long_only = engine
        .compute_availability(hall, at("2030-05-01", 8), at("2030-05-01", 18), Some(3 * HOUR_MS))
        .await
        .unwrap();
    assert_eq!(long_only, vec![Span::new(at("2030-05-01", 12), at("2030-05-01", 18))]);

    let vacant = engine
        .free_resources(
            ResourceKind::Place,
            Span::new(at("2030-05-01", 11), at("2030-05-01", 13)),
        )
        .await
        .unwrap();
    assert_eq!(vacant.iter().map(|r| r.id).collect::<Vec<_>>(), vec![other]);

    assert!(matches!(
        engine
            .compute_availability(hall, at("2030-05-01", 18), at("2030-05-01", 8), None)
            .await,
        Err(EngineError::Invalid(_))
    ));
    assert!(
        engine
            .compute_availability(Ulid::new(), at("2030-05-01", 8), at("2030-05-01", 9), None)
            .await
            .unwrap()
            .is_empty()
    );
}

// ── Persistence ──────────────────────────────────────────

async fn populate(engine: &Engine) -> (Ulid, Ulid, Ulid) {
    let r = room(engine).await;
    let hall = place(engine).await;
    engine
        .add_closure(
            Ulid::new(),
            hall,
            Span::new(at("2030-05-10", 0), at("2030-05-11", 0)),
            Some("holiday".into()),
        )
        .await
        .unwrap();
    let instructor = add_staff(engine, StaffRole::Instructor, 70_000).await;
    let rid = reserve(engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;
    engine
        .set_participants(
            rid,
            Participants {
                male: 10,
                female: 12,
                male_leaders: 1,
                female_leaders: 1,
                age_group: Some("teen".into()),
                participant_type: None,
            },
        )
        .await
        .unwrap();
    engine
        .assign_rooms(rid, vec![stay(r, "2030-05-01", "2030-05-03")])
        .await
        .unwrap();
    engine
        .schedule_program(
            rid,
            session(
                "Healing walk",
                Span::new(at("2030-05-02", 9), at("2030-05-02", 11)),
                Some(hall),
                Some(instructor),
            ),
        )
        .await
        .unwrap();
    engine
        .add_ledger_item(rid, ledger_item(LedgerKind::Income, LedgerPhase::Planned, "fees", 1_000_000))
        .await
        .unwrap();
    let cancelled = reserve(engine, "2030-05-01", "2030-05-03", ReservationStatus::Tentative).await;
    engine.set_status(cancelled, ReservationStatus::Cancelled).await.unwrap();
    (rid, r, hall)
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("replay.wal");
    let (rid, r, hall) = {
        let engine = Engine::new(path.clone()).unwrap();
        populate(&engine).await
    };

    let engine = Engine::new(path).unwrap();
    let state = engine.get_reservation(rid).await.unwrap();
    assert_eq!(state.participants.as_ref().map(Participants::total), Some(24));
    assert_eq!(state.rooms.len(), 1);
    assert_eq!(state.programs.len(), 1);
    assert_eq!(state.ledger.len(), 1);
    assert_eq!(engine.get_bookings(r).await.len(), 1);
    assert_eq!(engine.get_bookings(hall).await.len(), 1);
    assert_eq!(engine.get_closures(hall).await.len(), 1);
    assert_eq!(engine.list_staff().len(), 1);
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).await.len(), 2);

    // Replayed bookings still guard the room.
    let other = reserve(&engine, "2030-05-01", "2030-05-03", ReservationStatus::Confirmed).await;
    assert!(
        engine
            .assign_rooms(other, vec![stay(r, "2030-05-02", "2030-05-03")])
            .await
            .unwrap_err()
            .is_conflict()
    );
}

#[tokio::test]
async fn compaction_keeps_state_and_resets_counter() {
    let path = test_wal_path("compact.wal");
    let (rid, r, hall) = {
        let engine = Engine::new(path.clone()).unwrap();
        let ids = populate(&engine).await;
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        ids
    };

    let engine = Engine::new(path).unwrap();
    let state = engine.get_reservation(rid).await.unwrap();
    assert_eq!(state.rooms.len(), 1);
    assert_eq!(state.programs.len(), 1);
    assert_eq!(engine.get_bookings(r).await.len(), 1);
    assert_eq!(engine.get_bookings(hall).await.len(), 1);
    assert_eq!(engine.get_closures(hall).await.len(), 1);
    let cancelled: Vec<_> = engine
        .list_reservations(&ReservationFilter {
            status: Some(ReservationStatus::Cancelled),
            ..ReservationFilter::default()
        })
        .await;
    assert_eq!(cancelled.len(), 1);
}

// ── Reports ──────────────────────────────────────────────

#[tokio::test]
async fn reports_read_engine_state() {
    let (engine, _) = new_engine("reports.wal");
    let instructor = add_staff(&engine, StaffRole::Instructor, 50_000).await;
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    // 90 minutes bills as two started hours.
    engine
        .schedule_program(
            rid,
            session(
                "Breathing",
                Span::new(at("2030-05-01", 10), at("2030-05-01", 10) + 90 * 60_000),
                None,
                Some(instructor),
            ),
        )
        .await
        .unwrap();
    engine
        .order_meal(
            rid,
            MealOrder {
                id: Ulid::new(),
                date: d("2030-05-01"),
                meal: Meal::Lunch,
                headcount: 10,
                unit_price: 7_000,
            },
        )
        .await
        .unwrap();
    for item in [
        ledger_item(LedgerKind::Income, LedgerPhase::Planned, "fees", 400_000),
        ledger_item(LedgerKind::Income, LedgerPhase::Actual, "fees", 380_000),
        ledger_item(LedgerKind::Expense, LedgerPhase::Actual, "meals", 70_000),
    ] {
        engine.add_ledger_item(rid, item).await.unwrap();
    }

    let pay = engine.staff_payments(rid).await.unwrap();
    assert_eq!(pay.len(), 1);
    assert_eq!(pay[0].hours, 2);
    assert_eq!(pay[0].amount, 100_000);

    let lines = engine.settlement(rid).await.unwrap();
    let line = |kind: &str, category: &str| {
        lines
            .iter()
            .find(|l| l.kind == kind && l.category == category)
            .cloned()
            .unwrap()
    };
    assert_eq!(line("income", "fees").variance, -20_000);
    assert_eq!(line("net", "net").actual, 310_000);
    assert_eq!(line("derived", "meal_cost").planned, 70_000);
    assert_eq!(line("derived", "meal_cost").actual, 70_000);
    assert_eq!(line("derived", "staff_cost").planned, 100_000);

    engine
        .record_survey(
            rid,
            SurveyResponse {
                id: Ulid::new(),
                form: FormKind::Service,
                phase: None,
                subject: None,
                sex: Some("f".into()),
                age_group: None,
                scores: vec![Some(5.0); 10],
            },
        )
        .await
        .unwrap();
    let rows = engine
        .satisfaction_report(FormKind::Service, &ReservationFilter::reservation(rid))
        .await
        .unwrap();
    let overall = rows.iter().find(|r| r.scope == "overall").unwrap();
    assert_eq!(overall.mean, Some(5.0));
    assert_eq!(overall.satisfied_pct, Some(100.0));
    assert!(matches!(
        engine
            .effect_report(FormKind::Service, &ReservationFilter::default())
            .await,
        Err(EngineError::Invalid(_))
    ));

    let summary = engine.operations_summary(&ReservationFilter::default()).await.unwrap();
    let total = summary.last().unwrap();
    assert_eq!(total.category, "total");
    assert_eq!(total.reservations, 1);
    assert_eq!(total.actual_income, 380_000);

    assert!(matches!(
        engine.settlement(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Concurrency and limits ───────────────────────────────

#[tokio::test]
async fn concurrent_writes_cannot_share_an_id() {
    let (engine, _) = new_engine("concurrent_same_id.wal");
    let a = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let b = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let item = ledger_item(LedgerKind::Income, LedgerPhase::Actual, "fees", 10_000);

    let (first, second) = tokio::join!(
        engine.add_ledger_item(a, item.clone()),
        engine.add_ledger_item(b, item.clone()),
    );
    assert!(first.is_ok() != second.is_ok(), "exactly one write may take the id");
    let refused = if first.is_ok() { second } else { first };
    assert!(matches!(refused, Err(EngineError::AlreadyExists(id)) if id == item.id));

    // The one record that exists can be removed, leaving nothing behind.
    engine.remove_entry(EntryKind::Ledger, item.id).await.unwrap();
    assert!(engine.get_reservation(a).await.unwrap().ledger.is_empty());
    assert!(engine.get_reservation(b).await.unwrap().ledger.is_empty());
}

#[tokio::test]
async fn concurrent_place_bookings_cannot_share_an_id() {
    let (engine, _) = new_engine("concurrent_same_booking_id.wal");
    let east = place(&engine).await;
    let west = place(&engine).await;
    let a = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let b = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    let mut to_east = place_booking(east, at("2030-05-01", 9), at("2030-05-01", 11));
    let mut to_west = place_booking(west, at("2030-05-01", 9), at("2030-05-01", 11));
    to_west.id = to_east.id;

    let (first, second) = tokio::join!(engine.book_place(a, to_east.clone()), engine.book_place(b, to_west));
    assert!(first.is_ok() != second.is_ok());

    engine.remove_entry(EntryKind::Place, to_east.id).await.unwrap();
    assert!(engine.get_bookings(east).await.is_empty());
    assert!(engine.get_bookings(west).await.is_empty());
    engine.delete_resource(east).await.unwrap();
    engine.delete_resource(west).await.unwrap();

    // A refused write gives its id back.
    let hall = place(&engine).await;
    engine
        .book_place(a, place_booking(hall, at("2030-05-01", 9), at("2030-05-01", 11)))
        .await
        .unwrap();
    to_east.place_id = hall;
    assert!(engine.book_place(b, to_east.clone()).await.unwrap_err().is_conflict());
    to_east.span = Span::new(at("2030-05-01", 13), at("2030-05-01", 14));
    engine.book_place(b, to_east).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_of_one_room_admit_exactly_one() {
    let (engine, _) = new_engine("concurrent_room_bookings.wal");
    let engine = Arc::new(engine);
    let r = room(&engine).await;
    let hall = place(&engine).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let rid = reserve(&engine, "2030-07-01", "2030-07-03", ReservationStatus::Confirmed).await;
            if i % 2 == 0 {
                engine
                    .assign_rooms(rid, vec![stay(r, "2030-07-01", "2030-07-03")])
                    .await
                    .map(|()| "room")
            } else {
                engine
                    .book_place(rid, place_booking(hall, at("2030-07-01", 9), at("2030-07-01", 12)))
                    .await
                    .map(|()| "place")
            }
        }));
    }

    let mut won = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(what) => won.push(what),
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }
    won.sort();
    assert_eq!(won, vec!["place", "room"]);
    assert_eq!(engine.get_bookings(r).await.len(), 1);
    assert_eq!(engine.get_bookings(hall).await.len(), 1);
}

async fn held_reservation(engine: &Engine, hold_until: Ms) -> Ulid {
    let id = Ulid::new();
    engine
        .create_reservation(NewReservation {
            id,
            group_name: "Walk-in".into(),
            contact_name: None,
            contact_phone: None,
            category: "general".into(),
            start_date: d("2030-05-01"),
            end_date: d("2030-05-02"),
            status: ReservationStatus::Tentative,
            hold_until: Some(hold_until),
            notes: None,
        })
        .await
        .unwrap();
    id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expiry_and_confirmation_settle_on_one_outcome() {
    let (engine, _) = new_engine("expiry_race.wal");
    let engine = Arc::new(engine);

    for _ in 0..25 {
        let r = room(&engine).await;
        let rid = held_reservation(&engine, 1_000).await;
        engine
            .assign_rooms(rid, vec![stay(r, "2030-05-01", "2030-05-02")])
            .await
            .unwrap();

        let reaper = tokio::spawn({
            let engine = engine.clone();
            async move { engine.expire_hold(rid, 2_000).await }
        });
        let confirm = tokio::spawn({
            let engine = engine.clone();
            async move { engine.set_status(rid, ReservationStatus::Confirmed).await }
        });
        let cancelled = reaper.await.unwrap().unwrap();
        let confirmed = confirm.await.unwrap();

        let status = engine.get_reservation(rid).await.unwrap().reservation.status;
        if cancelled {
            assert!(matches!(confirmed, Err(EngineError::InvalidTransition { .. })));
            assert_eq!(status, ReservationStatus::Cancelled);
            assert!(engine.get_bookings(r).await.is_empty());
        } else {
            confirmed.unwrap();
            assert_eq!(status, ReservationStatus::Confirmed);
            assert_eq!(engine.get_bookings(r).await.len(), 1);
        }
    }
}

#[tokio::test]
async fn confirmed_hold_is_not_expired() {
    let (engine, _) = new_engine("confirmed_hold.wal");
    let rid = held_reservation(&engine, 1_000).await;
    engine
        .set_status(rid, ReservationStatus::Confirmed)
        .await
        .unwrap();
    assert!(!engine.expire_hold(rid, 2_000).await.unwrap());
    let state = engine.get_reservation(rid).await.unwrap();
    assert_eq!(state.reservation.status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn query_windows_outside_the_calendar_are_refused() {
    let (engine, _) = new_engine("query_window_range.wal");
    let hall = add_resource(&engine, ResourceKind::Place, 1, Some(1_000), None).await;

    for (start, end) in [
        (i64::MIN + 1, i64::MIN + 100),
        (-10_000, 10_000),
        (i64::MAX - 100, i64::MAX),
    ] {
        assert!(matches!(
            engine.compute_availability(hall, start, end, None).await,
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            engine
                .free_resources(ResourceKind::Place, Span { start, end })
                .await,
            Err(EngineError::LimitExceeded(_))
        ));
    }

    // The first instant of the calendar is still a valid window start.
    let free = engine
        .compute_availability(hall, 0, HOUR_MS, None)
        .await
        .unwrap();
    assert_eq!(free, vec![Span::new(0, HOUR_MS)]);
}

#[tokio::test]
async fn settlement_beyond_money_range_is_refused() {
    use crate::limits::{MAX_AMOUNT, MAX_HEADCOUNT};

    let (engine, _) = new_engine("settlement_overflow.wal");
    let rid = reserve(&engine, "2030-05-01", "2030-05-02", ReservationStatus::Confirmed).await;
    for _ in 0..10 {
        engine
            .order_meal(
                rid,
                MealOrder {
                    id: Ulid::new(),
                    date: d("2030-05-01"),
                    meal: Meal::Lunch,
                    headcount: MAX_HEADCOUNT,
                    unit_price: MAX_AMOUNT,
                },
            )
            .await
            .unwrap();
    }
    assert!(matches!(
        engine.settlement(rid).await,
        Err(EngineError::LimitExceeded(_))
    ));
}
