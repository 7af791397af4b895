mod availability;
mod conflict;
mod error;
mod maintenance;
mod queries;
pub mod reports;
mod reservations;
mod resources;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{availability, compute_saturated_spans, merge_overlapping, subtract_intervals};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use queries::ReservationFilter;
pub use store::{IdClaim, InMemoryStore, IntervalChange, SharedReservationState, SharedResourceState};

use std::io;
use std::path::PathBuf;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up drains every queued append and commits them
/// with a single fsync; other commands run between batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL commit failed");
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch never leaks
    // into the next one; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// One tenant's reservation engine.
///
/// Lock order: `gate`, then a reservation, then resources in ascending id
/// order. Every mutation holds `gate` shared from validation until its event
/// is applied; compaction and staff deletion hold it exclusively so they see
/// a state no writer is halfway through.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            gate: RwLock::new(()),
        };
        for event in &events {
            engine.replay_event(event);
        }
        tracing::debug!(path = %wal_path.display(), events = events.len(), "replayed WAL");
        Ok(engine)
    }

    /// Rebuild state from one logged event. Nothing else can see the engine
    /// yet, so `try_write` always succeeds; blocking lock calls would panic
    /// when a tenant is opened from inside the runtime.
    fn replay_event(&self, event: &Event) {
        if self.store.apply_staff_event(event) {
            return;
        }
        match event {
            Event::ResourceCreated { resource } => self.store.insert_resource(resource.clone()),
            Event::ResourceDeleted { id } => {
                if let Some(rs) = self.store.get_resource(id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.store.remove_resource(&mut guard);
                }
            }
            Event::ResourceUpdated { resource } => self.replay_on_resource(resource.id, event),
            Event::ClosureAdded { resource_id, .. } | Event::ClosureRemoved { resource_id, .. } => {
                self.replay_on_resource(*resource_id, event)
            }
            Event::ReservationCreated { reservation } => {
                self.store.insert_reservation(reservation.clone())
            }
            other => {
                let Some(reservation_id) = other.reservation_id() else {
                    return;
                };
                let Some(res) = self.store.get_reservation(&reservation_id) else {
                    tracing::warn!(%reservation_id, "replay: event for unknown reservation");
                    return;
                };
                let Ok(mut guard) = res.try_write() else {
                    return;
                };
                for change in self.store.apply_to_reservation(&mut guard, other) {
                    if let Some(rs) = self.store.get_resource(&change.resource_id())
                        && let Ok(mut guard) = rs.try_write()
                    {
                        change.apply(&mut guard);
                    }
                }
            }
        }
    }

    fn replay_on_resource(&self, resource_id: Ulid, event: &Event) {
        if let Some(rs) = self.store.get_resource(&resource_id)
            && let Ok(mut guard) = rs.try_write()
        {
            self.store.apply_to_resource(&mut guard, event);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to a locked resource.
    pub(super) async fn persist_resource_event(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_resource(rs, event);
        Ok(())
    }

    /// WAL-append, then apply to a locked reservation and the locked
    /// resources its bookings touch.
    pub(super) async fn persist_reservation_event(
        &self,
        res: &mut ReservationState,
        resources: &mut [OwnedRwLockWriteGuard<ResourceState>],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for change in self.store.apply_to_reservation(res, event) {
            match resources.iter_mut().find(|rs| rs.id() == change.resource_id()) {
                Some(rs) => change.apply(rs),
                None => tracing::error!(
                    resource_id = %change.resource_id(),
                    reservation_id = %res.id(),
                    "interval change for a resource that was not locked"
                ),
            }
        }
        Ok(())
    }

    pub(super) async fn lock_resource(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.store.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Lock several resources in ascending id order. With `must_exist`
    /// unset, missing resources are skipped.
    pub(super) async fn lock_resources(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
        must_exist: bool,
    ) -> Result<Vec<OwnedRwLockWriteGuard<ResourceState>>, EngineError> {
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            match self.lock_resource(id).await {
                Ok(guard) => guards.push(guard),
                Err(EngineError::NotFound(_)) if !must_exist => {}
                Err(e) => return Err(e),
            }
        }
        Ok(guards)
    }

    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ReservationState>, EngineError> {
        let res = self
            .store
            .get_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = res.write_owned().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Hold a fresh id until the write creating it has been applied. Keep
    /// the claim alive across the WAL append.
    pub(super) fn claim_new_id(&self, id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        self.store
            .claim_id(id)
            .ok_or(EngineError::AlreadyExists(id))
    }
}

pub(super) fn check_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(super) fn check_opt_text(
    value: &Option<String>,
    max: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match value {
        Some(v) => check_text(v, max, what),
        None => Ok(()),
    }
}

pub(super) fn check_required(value: &str, what: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be empty")));
    }
    Ok(())
}
