use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError, check_opt_text, check_required, check_text};

fn validate_resource(info: &ResourceInfo) -> Result<(), EngineError> {
    check_required(&info.name, "resource name")?;
    check_text(&info.name, MAX_NAME_LEN, "resource name too long")?;
    if info.capacity == 0 {
        return Err(EngineError::invalid("capacity must be at least 1"));
    }
    if let Some(buffer) = info.buffer_after
        && !(0..=MAX_SPAN_DURATION_MS).contains(&buffer)
    {
        return Err(EngineError::invalid("buffer_after out of range"));
    }
    if info.max_occupancy == Some(0) {
        return Err(EngineError::invalid("max_occupancy must be at least 1"));
    }
    Ok(())
}

fn validate_staff(staff: &Staff) -> Result<(), EngineError> {
    check_required(&staff.name, "staff name")?;
    check_text(&staff.name, MAX_NAME_LEN, "staff name too long")?;
    if !(0..=MAX_AMOUNT).contains(&staff.rate) {
        return Err(EngineError::invalid("rate out of range"));
    }
    Ok(())
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, info: ResourceInfo) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        validate_resource(&info)?;
        if self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let _claim = self.claim_new_id(info.id)?;

        let event = Event::ResourceCreated {
            resource: info.clone(),
        };
        self.wal_append(&event).await?;
        tracing::debug!(id = %info.id, kind = info.kind.as_str(), "resource created");
        self.store.insert_resource(info);
        Ok(())
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<ResourceInfo, EngineError> {
        let _gate = self.gate.read().await;
        let mut rs = self.lock_resource(id).await?;

        let mut next = rs.info.clone();
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(capacity) = patch.capacity {
            next.capacity = capacity;
        }
        if let Some(buffer_after) = patch.buffer_after {
            next.buffer_after = buffer_after;
        }
        if let Some(max_occupancy) = patch.max_occupancy {
            next.max_occupancy = max_occupancy;
        }
        validate_resource(&next)?;
        if next == rs.info {
            return Ok(next);
        }

        let event = Event::ResourceUpdated {
            resource: next.clone(),
        };
        self.persist_resource_event(&mut rs, &event).await?;
        Ok(next)
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let mut rs = self.lock_resource(id).await?;
        if rs.has_bookings() {
            return Err(EngineError::HasBookings(id));
        }
        self.wal_append(&Event::ResourceDeleted { id }).await?;
        self.store.remove_resource(&mut rs);
        tracing::debug!(%id, "resource deleted");
        Ok(())
    }

    // ── Closures ─────────────────────────────────────────────

    /// Block a resource for maintenance or a holiday. Refused over existing
    /// bookings; those have to be moved first.
    pub async fn add_closure(
        &self,
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        validate_span(&span)?;
        check_opt_text(&reason, MAX_TEXT_LEN, "closure reason too long")?;
        let mut rs = self.lock_resource(resource_id).await?;
        if rs.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        let _claim = self.claim_new_id(id)?;
        if let Some(booked) = rs
            .overlapping(&span)
            .find(|i| i.is_booking() && i.span.overlaps(&span))
        {
            return Err(EngineError::Conflict {
                resource_id,
                with: booked.id,
            });
        }

        let event = Event::ClosureAdded {
            id,
            resource_id,
            span,
            reason,
        };
        self.persist_resource_event(&mut rs, &event).await
    }

    pub async fn remove_closure(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let resource_id = self
            .store
            .closure_owner(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut rs = self.lock_resource(resource_id).await?;
        if !rs.intervals.iter().any(|i| i.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ClosureRemoved { id, resource_id };
        self.persist_resource_event(&mut rs, &event).await
    }

    // ── Staff ────────────────────────────────────────────────

    pub async fn create_staff(&self, staff: Staff) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        validate_staff(&staff)?;
        if self.store.staff_count() >= MAX_STAFF_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        let _claim = self.claim_new_id(staff.id)?;
        let event = Event::StaffCreated { staff };
        self.wal_append(&event).await?;
        self.store.apply_staff_event(&event);
        Ok(())
    }

    /// Changing a role re-prices every session the person works, so it is
    /// refused while they are assigned to one.
    pub async fn update_staff(&self, id: Ulid, patch: StaffPatch) -> Result<Staff, EngineError> {
        let _gate = self.gate.write().await;
        let current = self.store.get_staff(&id).ok_or(EngineError::NotFound(id))?;
        let mut next = current.clone();
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(role) = patch.role {
            next.role = role;
        }
        if let Some(rate) = patch.rate {
            next.rate = rate;
        }
        validate_staff(&next)?;
        if next == current {
            return Ok(next);
        }
        if next.role != current.role && self.staff_in_use(id).await {
            return Err(EngineError::StaffInUse(id));
        }
        let event = Event::StaffUpdated {
            staff: next.clone(),
        };
        self.wal_append(&event).await?;
        self.store.apply_staff_event(&event);
        Ok(next)
    }

    pub async fn delete_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        if self.store.get_staff(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        if self.staff_in_use(id).await {
            return Err(EngineError::StaffInUse(id));
        }
        let event = Event::StaffDeleted { id };
        self.wal_append(&event).await?;
        self.store.apply_staff_event(&event);
        Ok(())
    }

    /// Caller holds `gate` exclusively, so no session is being scheduled.
    async fn staff_in_use(&self, id: Ulid) -> bool {
        for res in self.store.reservations() {
            if res.read().await.uses_staff(id) {
                return true;
            }
        }
        false
    }
}
