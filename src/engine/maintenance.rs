use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Tentative reservations whose hold ran out at or before `now`.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for res in self.store.reservations() {
            // A locked reservation is being changed right now; the next sweep sees it.
            if let Ok(guard) = res.try_read()
                && is_expired(&guard.reservation, now)
            {
                expired.push(guard.id());
            }
        }
        expired
    }

    /// Cancel a tentative reservation whose hold expired. Returns false when
    /// it was confirmed, extended or removed in the meantime. Expiry is
    /// decided under the reservation's write lock.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let patch = ReservationPatch {
            status: Some(ReservationStatus::Cancelled),
            hold_until: Some(None),
            ..ReservationPatch::default()
        };
        match self
            .patch_reservation(id, patch, |r| is_expired(r, now))
            .await
        {
            Ok((_, cancelled)) => Ok(cancelled),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Rewrite the WAL as the shortest event list that rebuilds the current
    /// state. Writers are held off until the new log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let mut events = Vec::new();

        for staff in self.store.staff() {
            events.push(Event::StaffCreated { staff });
        }

        let mut resources = Vec::new();
        for rs in self.store.resources() {
            let guard = rs.read().await;
            if !guard.deleted {
                resources.push(guard.clone());
            }
        }
        resources.sort_by_key(|rs| rs.id());
        for rs in resources {
            let resource_id = rs.id();
            events.push(Event::ResourceCreated { resource: rs.info });
            for interval in rs.intervals {
                if let IntervalKind::Closure { reason } = interval.kind {
                    events.push(Event::ClosureAdded {
                        id: interval.id,
                        resource_id,
                        span: interval.span,
                        reason,
                    });
                }
            }
        }

        let mut reservations = Vec::new();
        for res in self.store.reservations() {
            let guard = res.read().await;
            if !guard.deleted {
                reservations.push(guard.clone());
            }
        }
        reservations.sort_by_key(|s| s.id());
        for state in reservations {
            emit_reservation(state, &mut events);
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn is_expired(r: &Reservation, now: Ms) -> bool {
    r.status == ReservationStatus::Tentative && r.hold_until.is_some_and(|t| t <= now)
}

/// The header first (a cancelled one makes the bookings below it inert),
/// then one event per detail; rooms go out as a single batch.
fn emit_reservation(state: ReservationState, events: &mut Vec<Event>) {
    let reservation_id = state.id();
    events.push(Event::ReservationCreated {
        reservation: state.reservation,
    });
    if let Some(participants) = state.participants {
        events.push(Event::ParticipantsSet {
            reservation_id,
            participants,
        });
    }
    if !state.rooms.is_empty() {
        events.push(Event::RoomsAssigned {
            reservation_id,
            assignments: state.rooms,
        });
    }
    events.extend(state.programs.into_iter().map(|session| Event::ProgramScheduled {
        reservation_id,
        session,
    }));
    events.extend(state.places.into_iter().map(|booking| Event::PlaceBooked {
        reservation_id,
        booking,
    }));
    events.extend(state.meals.into_iter().map(|order| Event::MealOrdered {
        reservation_id,
        order,
    }));
    events.extend(state.ledger.into_iter().map(|item| Event::LedgerItemAdded {
        reservation_id,
        item,
    }));
    events.extend(state.documents.into_iter().map(|document| Event::DocumentAdded {
        reservation_id,
        document,
    }));
    events.extend(state.surveys.into_iter().map(|response| Event::SurveyRecorded {
        reservation_id,
        response,
    }));
}
