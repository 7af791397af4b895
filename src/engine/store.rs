use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedReservationState = Arc<RwLock<ReservationState>>;

/// Effect of a reservation event on a resource's interval list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalChange {
    Insert { resource_id: Ulid, interval: Interval },
    Remove { resource_id: Ulid, interval_id: Ulid },
}

impl IntervalChange {
    pub fn resource_id(&self) -> Ulid {
        match self {
            IntervalChange::Insert { resource_id, .. } | IntervalChange::Remove { resource_id, .. } => {
                *resource_id
            }
        }
    }

    pub fn apply(&self, rs: &mut ResourceState) {
        match self {
            IntervalChange::Insert { interval, .. } => rs.insert_interval(interval.clone()),
            IntervalChange::Remove { interval_id, .. } => {
                rs.remove_interval(*interval_id);
            }
        }
    }
}

fn booking_interval(reservation_id: Ulid, booking: &HeldBooking) -> IntervalChange {
    IntervalChange::Insert {
        resource_id: booking.resource_id,
        interval: Interval {
            id: booking.entry_id,
            span: booking.span,
            kind: IntervalKind::Booking { reservation_id },
        },
    }
}

fn release_interval(booking: &HeldBooking) -> IntervalChange {
    IntervalChange::Remove {
        resource_id: booking.resource_id,
        interval_id: booking.entry_id,
    }
}

/// All tenant state. Maps hold shared handles; the data behind them is
/// mutated only under the per-resource / per-reservation write locks.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResourceState>,
    reservations: DashMap<Ulid, SharedReservationState>,
    staff: DashMap<Ulid, Staff>,
    /// Detail entry id → (reservation id, table).
    entries: DashMap<Ulid, (Ulid, EntryKind)>,
    /// Closure id → resource id.
    closures: DashMap<Ulid, Ulid>,
    /// Ids claimed by writes that have not been applied yet.
    pending: DashSet<Ulid>,
}

/// A new id held by an in-flight write. Dropping it releases the id; by then
/// the write has either been applied or failed.
pub struct IdClaim<'a> {
    store: &'a InMemoryStore,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.store.pending.remove(&self.id);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            reservations: DashMap::new(),
            staff: DashMap::new(),
            entries: DashMap::new(),
            closures: DashMap::new(),
            pending: DashSet::new(),
        }
    }

    /// Ids are unique across every kind of record in a tenant.
    pub fn id_in_use(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
            || self.reservations.contains_key(id)
            || self.staff.contains_key(id)
            || self.entries.contains_key(id)
            || self.closures.contains_key(id)
    }

    /// Claim `id` for a new record. None when a record already has it or
    /// another write is about to create one with it.
    pub fn claim_id(&self, id: Ulid) -> Option<IdClaim<'_>> {
        if !self.pending.insert(id) {
            return None;
        }
        let claim = IdClaim { store: self, id };
        if self.id_in_use(&id) {
            return None;
        }
        Some(claim)
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, info: ResourceInfo) {
        self.resources
            .insert(info.id, Arc::new(RwLock::new(ResourceState::new(info))));
    }

    /// Drop the resource and its closure index entries. Caller holds its write lock.
    pub fn remove_resource(&self, rs: &mut ResourceState) {
        for interval in &rs.intervals {
            self.closures.remove(&interval.id);
        }
        rs.deleted = true;
        self.resources.remove(&rs.id());
    }

    pub fn resources(&self) -> Vec<SharedResourceState> {
        self.resources.iter().map(|e| e.value().clone()).collect()
    }

    pub fn closure_owner(&self, closure_id: &Ulid) -> Option<Ulid> {
        self.closures.get(closure_id).map(|e| *e.value())
    }

    // ── Reservations ─────────────────────────────────────────

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<SharedReservationState> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn insert_reservation(&self, reservation: Reservation) {
        self.reservations.insert(
            reservation.id,
            Arc::new(RwLock::new(ReservationState::new(reservation))),
        );
    }

    pub fn reservations(&self) -> Vec<SharedReservationState> {
        self.reservations.iter().map(|e| e.value().clone()).collect()
    }

    pub fn entry_owner(&self, entry_id: &Ulid) -> Option<(Ulid, EntryKind)> {
        self.entries.get(entry_id).map(|e| *e.value())
    }

    // ── Staff ────────────────────────────────────────────────

    pub fn staff_count(&self) -> usize {
        self.staff.len()
    }

    pub fn get_staff(&self, id: &Ulid) -> Option<Staff> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn staff(&self) -> Vec<Staff> {
        let mut all: Vec<Staff> = self.staff.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    // ── Event application ────────────────────────────────────

    /// Apply a staff event. Returns false for any other event.
    pub fn apply_staff_event(&self, event: &Event) -> bool {
        match event {
            Event::StaffCreated { staff } | Event::StaffUpdated { staff } => {
                self.staff.insert(staff.id, staff.clone());
            }
            Event::StaffDeleted { id } => {
                self.staff.remove(id);
            }
            _ => return false,
        }
        true
    }

    /// Apply a resource-level event (no locking; caller holds the lock).
    /// Creation and deletion happen at the map level.
    pub fn apply_to_resource(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceUpdated { resource } => {
                rs.info = resource.clone();
            }
            Event::ClosureAdded {
                id,
                resource_id,
                span,
                reason,
            } => {
                rs.insert_interval(Interval {
                    id: *id,
                    span: *span,
                    kind: IntervalKind::Closure {
                        reason: reason.clone(),
                    },
                });
                self.closures.insert(*id, *resource_id);
            }
            Event::ClosureRemoved { id, .. } => {
                rs.remove_interval(*id);
                self.closures.remove(id);
            }
            _ => {}
        }
    }

    /// Apply a reservation event to its (locked) aggregate and return the
    /// interval changes the caller must make on the booked resources.
    /// `ReservationCreated` is handled at the map level.
    pub fn apply_to_reservation(
        &self,
        state: &mut ReservationState,
        event: &Event,
    ) -> Vec<IntervalChange> {
        let reservation_id = state.id();
        let mut changes = Vec::new();
        match event {
            Event::ReservationUpdated { reservation } => {
                let held = state.holds_intervals();
                state.reservation = reservation.clone();
                let holds = state.holds_intervals();
                if held && !holds {
                    changes.extend(state.bookings().iter().map(release_interval));
                } else if !held && holds {
                    changes.extend(
                        state
                            .bookings()
                            .iter()
                            .map(|b| booking_interval(reservation_id, b)),
                    );
                }
            }
            Event::ReservationDeleted { .. } => {
                if state.holds_intervals() {
                    changes.extend(state.bookings().iter().map(release_interval));
                }
                self.unmap_entries(state);
                state.deleted = true;
                self.reservations.remove(&reservation_id);
            }
            Event::ParticipantsSet { participants, .. } => {
                state.participants = Some(participants.clone());
            }
            Event::ProgramScheduled { session, .. } => {
                self.map_entry(session.id, reservation_id, EntryKind::Program);
                state.programs.push(session.clone());
                if state.holds_intervals()
                    && let Some(booking) = state.booking_of(session.id)
                {
                    changes.push(booking_interval(reservation_id, &booking));
                }
            }
            Event::RoomsAssigned { assignments, .. } => {
                for assignment in assignments {
                    self.map_entry(assignment.id, reservation_id, EntryKind::Room);
                    state.rooms.push(assignment.clone());
                    if state.holds_intervals() {
                        changes.push(booking_interval(
                            reservation_id,
                            &HeldBooking {
                                resource_id: assignment.room_id,
                                entry_id: assignment.id,
                                span: assignment.span(),
                            },
                        ));
                    }
                }
            }
            Event::PlaceBooked { booking, .. } => {
                self.map_entry(booking.id, reservation_id, EntryKind::Place);
                state.places.push(booking.clone());
                if state.holds_intervals() {
                    changes.push(booking_interval(
                        reservation_id,
                        &HeldBooking {
                            resource_id: booking.place_id,
                            entry_id: booking.id,
                            span: booking.span,
                        },
                    ));
                }
            }
            Event::MealOrdered { order, .. } => {
                self.map_entry(order.id, reservation_id, EntryKind::Meal);
                state.meals.push(order.clone());
            }
            Event::LedgerItemAdded { item, .. } => {
                self.map_entry(item.id, reservation_id, EntryKind::Ledger);
                state.ledger.push(item.clone());
            }
            Event::DocumentAdded { document, .. } => {
                self.map_entry(document.id, reservation_id, EntryKind::Document);
                state.documents.push(document.clone());
            }
            Event::SurveyRecorded { response, .. } => {
                self.map_entry(response.id, reservation_id, EntryKind::Survey);
                state.surveys.push(response.clone());
            }
            Event::EntryRemoved { id, .. } => {
                if state.holds_intervals()
                    && let Some(booking) = state.booking_of(*id)
                {
                    changes.push(release_interval(&booking));
                }
                state.remove_entry(*id);
                self.entries.remove(id);
            }
            _ => {}
        }
        changes
    }

    fn map_entry(&self, entry_id: Ulid, reservation_id: Ulid, kind: EntryKind) {
        self.entries.insert(entry_id, (reservation_id, kind));
    }

    fn unmap_entries(&self, state: &ReservationState) {
        let ids = state
            .programs
            .iter()
            .map(|e| e.id)
            .chain(state.rooms.iter().map(|e| e.id))
            .chain(state.places.iter().map(|e| e.id))
            .chain(state.meals.iter().map(|e| e.id))
            .chain(state.ledger.iter().map(|e| e.id))
            .chain(state.documents.iter().map(|e| e.id))
            .chain(state.surveys.iter().map(|e| e.id));
        for id in ids {
            self.entries.remove(&id);
        }
    }
}
