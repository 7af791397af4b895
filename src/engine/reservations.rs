use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{Engine, EngineError, check_opt_text, check_required, check_text};

fn validate_dates(start: NaiveDate, end: NaiveDate) -> Result<(), EngineError> {
    if start > end {
        return Err(EngineError::invalid("start_date must not be after end_date"));
    }
    if (end - start).num_days() > MAX_RESERVATION_DAYS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    let window = date_window(start, end);
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

fn validate_header(r: &Reservation) -> Result<(), EngineError> {
    check_required(&r.group_name, "group_name")?;
    check_text(&r.group_name, MAX_NAME_LEN, "group_name too long")?;
    check_required(&r.category, "category")?;
    check_text(&r.category, MAX_NAME_LEN, "category too long")?;
    check_opt_text(&r.contact_name, MAX_NAME_LEN, "contact_name too long")?;
    check_opt_text(&r.contact_phone, MAX_NAME_LEN, "contact_phone too long")?;
    check_opt_text(&r.notes, MAX_TEXT_LEN, "notes too long")?;
    validate_dates(r.start_date, r.end_date)
}

fn check_headcount(n: u32, what: &str) -> Result<(), EngineError> {
    if n > MAX_HEADCOUNT {
        return Err(EngineError::invalid(format!("{what} out of range")));
    }
    Ok(())
}

fn check_amount(amount: Won, what: &str) -> Result<(), EngineError> {
    if !(0..=MAX_AMOUNT).contains(&amount) {
        return Err(EngineError::invalid(format!("{what} out of range")));
    }
    Ok(())
}

/// Participants, programs, rooms, places and meals only change while the
/// reservation is tentative or confirmed.
fn ensure_open(res: &ReservationState) -> Result<(), EngineError> {
    let status = res.reservation.status;
    if !status.is_open() {
        return Err(EngineError::ReservationClosed {
            id: res.id(),
            status,
        });
    }
    Ok(())
}

fn ensure_room_for_entries(res: &ReservationState, adding: usize) -> Result<(), EngineError> {
    if res.entry_count() + adding > MAX_ENTRIES_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many entries on reservation"));
    }
    Ok(())
}

fn ensure_within(res: &ReservationState, span: &Span, what: &'static str) -> Result<(), EngineError> {
    if !res.reservation.window().contains_span(span) {
        return Err(EngineError::OutOfRange {
            reservation_id: res.id(),
            what,
        });
    }
    Ok(())
}

/// A resource of the right kind with room for `people`.
fn ensure_bookable(
    rs: &ResourceState,
    expected: ResourceKind,
    people: u32,
) -> Result<(), EngineError> {
    if rs.info.kind != expected {
        return Err(EngineError::WrongResourceKind {
            resource_id: rs.id(),
            expected,
            actual: rs.info.kind,
        });
    }
    if let Some(max) = rs.info.max_occupancy
        && people > max
    {
        return Err(EngineError::OccupancyExceeded {
            resource_id: rs.id(),
            max,
            requested: people,
        });
    }
    if rs.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many intervals on resource"));
    }
    Ok(())
}

fn count_conflict(result: Result<(), EngineError>) -> Result<(), EngineError> {
    if let Err(e) = &result
        && e.is_conflict()
    {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    }
    result
}

/// Check a survey response against its form definition.
pub(crate) fn validate_survey(response: &SurveyResponse) -> Result<(), EngineError> {
    let form = response.form.spec();
    if response.scores.len() != form.items {
        return Err(EngineError::invalid(format!(
            "{} form has {} items, got {} scores",
            response.form.as_str(),
            form.items,
            response.scores.len()
        )));
    }
    for (i, score) in response.scores.iter().enumerate() {
        let Some(score) = score else { continue };
        let ok = match form.scale {
            Scale::Likert { min, max } => {
                score.fract() == 0.0 && (min as f64..=max as f64).contains(score)
            }
            Scale::Reading => score.is_finite() && *score >= 0.0,
        };
        if !ok {
            return Err(EngineError::invalid(format!(
                "item {} of {} form out of scale: {score}",
                i + 1,
                response.form.as_str()
            )));
        }
    }
    match (form.measures_effect, response.phase) {
        (true, None) => {
            return Err(EngineError::invalid(format!(
                "{} form needs a phase (pre or post)",
                response.form.as_str()
            )));
        }
        (false, Some(_)) => {
            return Err(EngineError::invalid(format!(
                "{} form is not taken in phases",
                response.form.as_str()
            )));
        }
        _ => {}
    }
    if response.form == FormKind::Program
        && response.subject.as_deref().is_none_or(|s| s.trim().is_empty())
    {
        return Err(EngineError::invalid("program form needs a subject (program name)"));
    }
    check_opt_text(&response.subject, MAX_NAME_LEN, "subject too long")?;
    check_opt_text(&response.sex, MAX_NAME_LEN, "sex too long")?;
    check_opt_text(&response.age_group, MAX_NAME_LEN, "age_group too long")
}

impl Engine {
    // ── Header ───────────────────────────────────────────────

    pub async fn create_reservation(&self, new: NewReservation) -> Result<Reservation, EngineError> {
        let _gate = self.gate.read().await;
        let now = now_ms();
        let reservation = Reservation {
            id: new.id,
            group_name: new.group_name,
            contact_name: new.contact_name,
            contact_phone: new.contact_phone,
            category: new.category,
            start_date: new.start_date,
            end_date: new.end_date,
            status: new.status,
            hold_until: new.hold_until,
            notes: new.notes,
            created_at: now,
            updated_at: now,
        };
        validate_header(&reservation)?;
        if self.store.reservation_count() >= MAX_RESERVATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }
        let _claim = self.claim_new_id(reservation.id)?;

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.wal_append(&event).await?;
        self.store.insert_reservation(reservation.clone());
        tracing::debug!(id = %reservation.id, status = reservation.status.as_str(), "reservation created");
        Ok(reservation)
    }

    /// Patch the header. Status changes follow the reservation lifecycle;
    /// cancelling releases every room and place the reservation held.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        self.patch_reservation(id, patch, |_| true)
            .await
            .map(|(reservation, _)| reservation)
    }

    /// Apply `patch` only if `precondition` holds for the header as it stands
    /// under the reservation lock. The flag tells whether it held; when it
    /// did not, the header comes back unchanged.
    pub(super) async fn patch_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        precondition: impl FnOnce(&Reservation) -> bool + Send,
    ) -> Result<(Reservation, bool), EngineError> {
        let _gate = self.gate.read().await;
        let mut res = self.lock_reservation(id).await?;
        let current = res.reservation.clone();
        if !precondition(&current) {
            return Ok((current, false));
        }

        let mut next = current.clone();
        if let Some(v) = patch.group_name {
            next.group_name = v;
        }
        if let Some(v) = patch.contact_name {
            next.contact_name = v;
        }
        if let Some(v) = patch.contact_phone {
            next.contact_phone = v;
        }
        if let Some(v) = patch.category {
            next.category = v;
        }
        if let Some(v) = patch.start_date {
            next.start_date = v;
        }
        if let Some(v) = patch.end_date {
            next.end_date = v;
        }
        if let Some(v) = patch.status {
            next.status = v;
        }
        if let Some(v) = patch.hold_until {
            next.hold_until = v;
        }
        if let Some(v) = patch.notes {
            next.notes = v;
        }
        if next == current {
            return Ok((current, true));
        }
        validate_header(&next)?;

        if !current.status.can_become(next.status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: next.status,
            });
        }
        let dates_changed = (next.start_date, next.end_date) != (current.start_date, current.end_date);
        if dates_changed {
            ensure_open(&res)?;
            if !res.details_fit(next.start_date, next.end_date) {
                return Err(EngineError::OutOfRange {
                    reservation_id: id,
                    what: "existing details",
                });
            }
        }
        next.updated_at = now_ms().max(current.updated_at);

        let releasing = current.status != ReservationStatus::Cancelled
            && next.status == ReservationStatus::Cancelled;
        let mut resources = if releasing {
            let held = res.bookings().into_iter().map(|b| b.resource_id);
            self.lock_resources(held, false).await?
        } else {
            Vec::new()
        };

        let event = Event::ReservationUpdated {
            reservation: next.clone(),
        };
        self.persist_reservation_event(&mut res, &mut resources, &event)
            .await?;
        if current.status != next.status {
            tracing::info!(
                %id,
                from = current.status.as_str(),
                to = next.status.as_str(),
                "reservation status changed"
            );
        }
        Ok((next, true))
    }

    pub async fn set_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation(id, ReservationPatch::status(status))
            .await
    }

    /// Remove the reservation with every participant record, program, room,
    /// place, meal, ledger line, document and survey under it, as one event.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let mut res = self.lock_reservation(id).await?;
        let mut resources = if res.holds_intervals() {
            let held = res.bookings().into_iter().map(|b| b.resource_id);
            self.lock_resources(held, false).await?
        } else {
            Vec::new()
        };
        let entries = res.entry_count();
        self.persist_reservation_event(&mut res, &mut resources, &Event::ReservationDeleted { id })
            .await?;
        tracing::info!(%id, entries, "reservation deleted");
        Ok(())
    }

    // ── Page2 ────────────────────────────────────────────────

    pub async fn set_participants(
        &self,
        reservation_id: Ulid,
        participants: Participants,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        check_headcount(participants.total(), "participant count")?;
        check_opt_text(&participants.age_group, MAX_NAME_LEN, "age_group too long")?;
        check_opt_text(&participants.participant_type, MAX_NAME_LEN, "participant_type too long")?;
        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_open(&res)?;
        let event = Event::ParticipantsSet {
            reservation_id,
            participants,
        };
        self.persist_reservation_event(&mut res, &mut [], &event)
            .await
    }

    pub async fn schedule_program(
        &self,
        reservation_id: Ulid,
        session: ProgramSession,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        check_required(&session.name, "program name")?;
        check_text(&session.name, MAX_NAME_LEN, "program name too long")?;
        check_headcount(session.headcount, "headcount")?;
        validate_span(&session.span)?;
        for (staff_id, role) in [
            (session.instructor_id, StaffRole::Instructor),
            (session.assistant_id, StaffRole::Assistant),
            (session.helper_id, StaffRole::Helper),
        ] {
            let Some(staff_id) = staff_id else { continue };
            let staff = self
                .store
                .get_staff(&staff_id)
                .ok_or(EngineError::NotFound(staff_id))?;
            if staff.role != role {
                return Err(EngineError::invalid(format!(
                    "staff {staff_id} is a {}, not a {}",
                    staff.role.as_str(),
                    role.as_str()
                )));
            }
        }

        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_open(&res)?;
        ensure_room_for_entries(&res, 1)?;
        ensure_within(&res, &session.span, "program session")?;
        let _claim = self.claim_new_id(session.id)?;

        let mut resources = self.lock_resources(session.place_id, true).await?;
        if let Some(rs) = resources.first() {
            ensure_bookable(rs, ResourceKind::Place, session.headcount)?;
            count_conflict(check_no_conflict(rs, &session.span))?;
        }

        let event = Event::ProgramScheduled {
            reservation_id,
            session,
        };
        self.persist_reservation_event(&mut res, &mut resources, &event)
            .await
    }

    // ── Page3 ────────────────────────────────────────────────

    /// Assign several rooms at once. Either every assignment commits or none
    /// does; rows are checked against existing bookings and each other.
    pub async fn assign_rooms(
        &self,
        reservation_id: Ulid,
        assignments: Vec<RoomAssignment>,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        if assignments.is_empty() {
            return Err(EngineError::invalid("no room assignments given"));
        }
        if assignments.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::new();
        for a in &assignments {
            if !seen.insert(a.id) {
                return Err(EngineError::AlreadyExists(a.id));
            }
            if a.check_in >= a.check_out {
                return Err(EngineError::invalid(format!(
                    "room assignment {}: check_in must be before check_out",
                    a.id
                )));
            }
            if a.occupants == 0 {
                return Err(EngineError::invalid(format!(
                    "room assignment {}: occupants must be at least 1",
                    a.id
                )));
            }
            check_headcount(a.occupants, "occupants")?;
        }

        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_open(&res)?;
        ensure_room_for_entries(&res, assignments.len())?;
        let (start, end) = (res.reservation.start_date, res.reservation.end_date);
        let mut claims = Vec::with_capacity(assignments.len());
        for a in &assignments {
            if a.check_in < start || a.check_out > end {
                return Err(EngineError::OutOfRange {
                    reservation_id,
                    what: "room stay",
                });
            }
            claims.push(self.claim_new_id(a.id)?);
        }

        let mut resources = self
            .lock_resources(assignments.iter().map(|a| a.room_id), true)
            .await?;
        // Check each row against a scratch copy that already holds the rows before it.
        let mut scratch: HashMap<Ulid, ResourceState> = HashMap::new();
        for a in &assignments {
            if !scratch.contains_key(&a.room_id) {
                let locked = resources
                    .iter()
                    .find(|g| g.id() == a.room_id)
                    .ok_or(EngineError::NotFound(a.room_id))?;
                scratch.insert(a.room_id, (**locked).clone());
            }
            let rs = scratch
                .get_mut(&a.room_id)
                .ok_or(EngineError::NotFound(a.room_id))?;
            ensure_bookable(rs, ResourceKind::Room, a.occupants)?;
            count_conflict(check_no_conflict(rs, &a.span()))?;
            rs.insert_interval(Interval {
                id: a.id,
                span: a.span(),
                kind: IntervalKind::Booking { reservation_id },
            });
        }
        drop(scratch);

        let event = Event::RoomsAssigned {
            reservation_id,
            assignments,
        };
        self.persist_reservation_event(&mut res, &mut resources, &event)
            .await
    }

    pub async fn book_place(
        &self,
        reservation_id: Ulid,
        booking: PlaceBooking,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        validate_span(&booking.span)?;
        check_headcount(booking.headcount, "headcount")?;
        check_opt_text(&booking.purpose, MAX_TEXT_LEN, "purpose too long")?;

        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_open(&res)?;
        ensure_room_for_entries(&res, 1)?;
        ensure_within(&res, &booking.span, "place booking")?;
        let _claim = self.claim_new_id(booking.id)?;

        let mut resources = self.lock_resources([booking.place_id], true).await?;
        if let Some(rs) = resources.first() {
            ensure_bookable(rs, ResourceKind::Place, booking.headcount)?;
            count_conflict(check_no_conflict(rs, &booking.span))?;
        }

        let event = Event::PlaceBooked {
            reservation_id,
            booking,
        };
        self.persist_reservation_event(&mut res, &mut resources, &event)
            .await
    }

    pub async fn order_meal(&self, reservation_id: Ulid, order: MealOrder) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        check_headcount(order.headcount, "headcount")?;
        check_amount(order.unit_price, "unit_price")?;
        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_open(&res)?;
        ensure_room_for_entries(&res, 1)?;
        let r = &res.reservation;
        if order.date < r.start_date || order.date > r.end_date {
            return Err(EngineError::OutOfRange {
                reservation_id,
                what: "meal date",
            });
        }
        let _claim = self.claim_new_id(order.id)?;
        let event = Event::MealOrdered {
            reservation_id,
            order,
        };
        self.persist_reservation_event(&mut res, &mut [], &event)
            .await
    }

    // ── Page4 / Page5 / surveys ──────────────────────────────

    pub async fn add_ledger_item(
        &self,
        reservation_id: Ulid,
        item: LedgerItem,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        check_required(&item.category, "category")?;
        check_text(&item.category, MAX_NAME_LEN, "category too long")?;
        check_opt_text(&item.description, MAX_TEXT_LEN, "description too long")?;
        check_amount(item.amount, "amount")?;
        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_room_for_entries(&res, 1)?;
        let _claim = self.claim_new_id(item.id)?;
        let event = Event::LedgerItemAdded {
            reservation_id,
            item,
        };
        self.persist_reservation_event(&mut res, &mut [], &event)
            .await
    }

    pub async fn add_document(
        &self,
        reservation_id: Ulid,
        document: Document,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        check_required(&document.kind, "document kind")?;
        check_required(&document.title, "document title")?;
        check_text(&document.kind, MAX_NAME_LEN, "document kind too long")?;
        check_text(&document.title, MAX_TEXT_LEN, "document title too long")?;
        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_room_for_entries(&res, 1)?;
        let _claim = self.claim_new_id(document.id)?;
        let event = Event::DocumentAdded {
            reservation_id,
            document,
        };
        self.persist_reservation_event(&mut res, &mut [], &event)
            .await
    }

    pub async fn record_survey(
        &self,
        reservation_id: Ulid,
        response: SurveyResponse,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        validate_survey(&response)?;
        let mut res = self.lock_reservation(reservation_id).await?;
        ensure_room_for_entries(&res, 1)?;
        let _claim = self.claim_new_id(response.id)?;
        let event = Event::SurveyRecorded {
            reservation_id,
            response,
        };
        self.persist_reservation_event(&mut res, &mut [], &event)
            .await
    }

    // ── Removal ──────────────────────────────────────────────

    /// Remove one detail entry: cancel a program, release a room or place,
    /// cancel a meal, or drop a ledger line, document or survey response.
    /// `kind` must match the table the entry lives in.
    pub async fn remove_entry(&self, kind: EntryKind, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let (reservation_id, actual) = self
            .store
            .entry_owner(&id)
            .ok_or(EngineError::NotFound(id))?;
        if actual != kind {
            return Err(EngineError::NotFound(id));
        }
        let mut res = self.lock_reservation(reservation_id).await?;
        if kind.requires_open_reservation() {
            ensure_open(&res)?;
        }
        let held = if res.holds_intervals() {
            res.booking_of(id)
        } else {
            None
        };
        let mut resources: Vec<OwnedRwLockWriteGuard<ResourceState>> = match held {
            Some(booking) => self.lock_resources([booking.resource_id], false).await?,
            None => Vec::new(),
        };
        let event = Event::EntryRemoved { id, reservation_id };
        self.persist_reservation_event(&mut res, &mut resources, &event)
            .await?;
        tracing::debug!(%id, %reservation_id, kind = kind.as_str(), "entry removed");
        Ok(())
    }
}
