use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{availability, filter_min_duration};
use super::conflict::check_no_conflict;
use super::{Engine, EngineError};

/// Selects reservations for listings and reports. Date bounds apply to the
/// reservation's start date and are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub category: Option<String>,
}

impl ReservationFilter {
    pub fn reservation(id: Ulid) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        self.id.is_none_or(|id| id == r.id)
            && self.status.is_none_or(|s| s == r.status)
            && self.from.is_none_or(|d| r.start_date >= d)
            && self.to.is_none_or(|d| r.start_date <= d)
            && self.category.as_deref().is_none_or(|c| c == r.category)
    }
}

fn check_window(query: &Span) -> Result<(), EngineError> {
    if query.start >= query.end {
        return Err(EngineError::invalid("start must be before end"));
    }
    if query.start < MIN_VALID_TIMESTAMP_MS || query.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if query.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn list_resources(&self, kind: Option<ResourceKind>) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for rs in self.store.resources() {
            let guard = rs.read().await;
            if !guard.deleted && kind.is_none_or(|k| k == guard.info.kind) {
                out.push(guard.info.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Free spans of a resource inside `[start, end)`. A missing resource has none.
    pub async fn compute_availability(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = Span { start, end };
        check_window(&query)?;
        let Some(rs) = self.store.get_resource(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = rs.read().await;
        Ok(filter_min_duration(availability(&guard, &query), min_duration))
    }

    /// Resources of `kind` that could take a booking of exactly `span`.
    pub async fn free_resources(
        &self,
        kind: ResourceKind,
        span: Span,
    ) -> Result<Vec<ResourceInfo>, EngineError> {
        check_window(&span)?;
        let mut out = Vec::new();
        for rs in self.store.resources() {
            let guard = rs.read().await;
            if !guard.deleted && guard.info.kind == kind && check_no_conflict(&guard, &span).is_ok() {
                out.push(guard.info.clone());
            }
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    pub async fn get_closures(&self, resource_id: Ulid) -> Vec<ClosureInfo> {
        let Some(rs) = self.store.get_resource(&resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .intervals
            .iter()
            .filter_map(|i| match &i.kind {
                IntervalKind::Closure { reason } => Some(ClosureInfo {
                    id: i.id,
                    resource_id,
                    start: i.span.start,
                    end: i.span.end,
                    reason: reason.clone(),
                }),
                IntervalKind::Booking { .. } => None,
            })
            .collect()
    }

    pub async fn get_bookings(&self, resource_id: Ulid) -> Vec<BookingInfo> {
        let Some(rs) = self.store.get_resource(&resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .intervals
            .iter()
            .filter_map(|i| match &i.kind {
                IntervalKind::Booking { reservation_id } => Some(BookingInfo {
                    id: i.id,
                    resource_id,
                    reservation_id: *reservation_id,
                    start: i.span.start,
                    end: i.span.end,
                }),
                IntervalKind::Closure { .. } => None,
            })
            .collect()
    }

    // ── Staff ────────────────────────────────────────────────

    pub fn list_staff(&self) -> Vec<Staff> {
        self.store.staff()
    }

    pub fn get_staff(&self, id: Ulid) -> Option<Staff> {
        self.store.get_staff(&id)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Snapshot of one reservation with all of its details.
    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationState, EngineError> {
        let res = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = res.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.clone())
    }

    /// Snapshots of every matching reservation, ordered by start date.
    pub async fn select_reservations(&self, filter: &ReservationFilter) -> Vec<ReservationState> {
        if let Some(id) = filter.id {
            return match self.get_reservation(id).await {
                Ok(state) if filter.matches(&state.reservation) => vec![state],
                _ => Vec::new(),
            };
        }
        let mut out = Vec::new();
        for res in self.store.reservations() {
            let guard = res.read().await;
            if !guard.deleted && filter.matches(&guard.reservation) {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|s| (s.reservation.start_date, s.reservation.id));
        out
    }

    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let mut out = Vec::new();
        for res in self.store.reservations() {
            let guard = res.read().await;
            if !guard.deleted && filter.matches(&guard.reservation) {
                out.push(guard.reservation.clone());
            }
        }
        out.sort_by_key(|r| (r.start_date, r.id));
        out
    }
}
