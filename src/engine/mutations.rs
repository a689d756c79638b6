use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{conflict_message, find_shortfall, validate_name, validate_notes};
use super::schedule::validate_template;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Log + apply + notify a catalog event. Caller holds `catalog_lock`.
    async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        self.publish(event);
        Ok(())
    }

    pub async fn upsert_tour(
        &self,
        id: Ulid,
        base_price: Decimal,
        min_participants: u32,
        max_participants: Option<u32>,
    ) -> Result<(), EngineError> {
        if base_price.is_sign_negative() {
            return Err(EngineError::Validation("base price cannot be negative".into()));
        }
        if min_participants == 0 {
            return Err(EngineError::Validation(
                "min participants must be at least 1".into(),
            ));
        }
        if let Some(max) = max_participants {
            if max < min_participants {
                return Err(EngineError::Validation(format!(
                    "max participants {max} is below min participants {min_participants}"
                )));
            }
            if max > MAX_SLOT_CAPACITY {
                return Err(EngineError::LimitExceeded("max participants too large"));
            }
        }
        let _gate = self.log_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let event = Event::TourUpserted {
            id,
            base_price,
            min_participants,
            max_participants,
        };
        self.persist_catalog(&event).await
    }

    pub async fn upsert_resource(
        &self,
        id: Ulid,
        name: String,
        total_quantity: u32,
        seats_per_unit: u32,
    ) -> Result<(), EngineError> {
        validate_name(&name, "resource name")?;
        if total_quantity > MAX_RESOURCE_QUANTITY {
            return Err(EngineError::LimitExceeded("resource quantity too large"));
        }
        if seats_per_unit == 0 {
            return Err(EngineError::Validation(
                "seats per unit must be at least 1".into(),
            ));
        }
        let _gate = self.log_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let event = Event::ResourceUpserted {
            id,
            name,
            total_quantity,
            seats_per_unit,
        };
        self.persist_catalog(&event).await
    }

    /// Set how many units of a resource one occurrence of the tour consumes.
    /// Zero removes the requirement. Existing slots keep their commitments.
    pub async fn set_requirement(
        &self,
        tour_id: Ulid,
        resource_id: Ulid,
        quantity_needed: u32,
    ) -> Result<(), EngineError> {
        if quantity_needed > MAX_RESOURCE_QUANTITY {
            return Err(EngineError::LimitExceeded("required quantity too large"));
        }
        let _gate = self.log_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let existing = {
            let tour = self
                .tours
                .get(&tour_id)
                .ok_or(EngineError::NotFound(tour_id))?;
            if quantity_needed > 0
                && tour.requirements.len() >= MAX_REQUIREMENTS_PER_TOUR
                && !tour.requirements.iter().any(|r| r.resource_id == resource_id)
            {
                return Err(EngineError::LimitExceeded("too many requirements on tour"));
            }
            tour.requirements.iter().any(|r| r.resource_id == resource_id)
        };
        if quantity_needed > 0 && !self.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        if quantity_needed == 0 && !existing {
            return Err(EngineError::NotFound(resource_id));
        }
        let event = Event::RequirementSet {
            tour_id,
            resource_id,
            quantity_needed,
        };
        self.persist_catalog(&event).await
    }

    pub async fn upsert_template(&self, template: AvailabilityTemplate) -> Result<(), EngineError> {
        validate_template(&template)?;
        let _gate = self.log_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.tours.contains_key(&template.tour_id) {
            return Err(EngineError::NotFound(template.tour_id));
        }
        if let Some(existing) = self.templates.get(&template.id)
            && existing.tour_id != template.tour_id
        {
            return Err(EngineError::Validation(
                "a template cannot move to another tour".into(),
            ));
        }
        let event = Event::TemplateUpserted { template };
        self.persist_catalog(&event).await
    }

    /// Patch the mutable fields of a template and validate the result as a whole.
    pub async fn update_template(
        &self,
        id: Ulid,
        update: TemplateUpdate,
    ) -> Result<AvailabilityTemplate, EngineError> {
        let _gate = self.log_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let mut template = self
            .templates
            .get(&id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(id))?;
        if let Some(weekdays) = update.weekdays {
            template.weekdays = weekdays;
        }
        if let Some(start) = update.day_start {
            template.day_start = start;
        }
        if let Some(end) = update.day_end {
            template.day_end = end;
        }
        if let Some(minutes) = update.slot_duration_minutes {
            template.slot_duration_minutes = minutes;
        }
        if let Some(minutes) = update.break_duration_minutes {
            template.break_duration_minutes = minutes;
        }
        if let Some(active) = update.active {
            template.active = active;
        }
        validate_template(&template)?;
        let event = Event::TemplateUpserted {
            template: template.clone(),
        };
        self.persist_catalog(&event).await?;
        Ok(template)
    }

    /// Refused while any slot generated from the template still exists.
    pub async fn delete_template(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.log_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let tour_id = self
            .templates
            .get(&id)
            .map(|t| t.tour_id)
            .ok_or(EngineError::NotFound(id))?;
        let tour_lock = self.tour_lock(tour_id);
        let _tour = tour_lock.lock().await;
        let remaining = self.template_slots.get(&id).map(|s| s.len()).unwrap_or(0);
        if remaining > 0 {
            return Err(EngineError::IntegrityConflict(format!(
                "template {id} still has {remaining} generated slots"
            )));
        }
        let event = Event::TemplateDeleted { id };
        self.persist_catalog(&event).await
    }

    /// Create a single slot outside any template. A resource shortfall is fatal here.
    pub async fn create_slot(
        &self,
        id: Ulid,
        tour_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
        capacity: Option<u32>,
    ) -> Result<TimeSlot, EngineError> {
        if window.end <= window.start {
            return Err(EngineError::Validation(
                "end time must be after start time".into(),
            ));
        }
        if window.duration_minutes() > MAX_SLOT_DURATION_MINUTES as i64 {
            return Err(EngineError::Validation(format!(
                "slot duration cannot exceed {MAX_SLOT_DURATION_MINUTES} minutes"
            )));
        }
        let _gate = self.log_gate.read().await;
        let tour_lock = self.tour_lock(tour_id);
        let _tour = tour_lock.lock().await;

        let tour = self
            .tours
            .get(&tour_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(tour_id))?;
        let total_capacity = capacity.unwrap_or_else(|| tour.slot_capacity());
        if total_capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1".into()));
        }
        if total_capacity > MAX_SLOT_CAPACITY {
            return Err(EngineError::LimitExceeded("slot capacity too large"));
        }
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = self.slot_keys.get(&(tour_id, date, window.start)) {
            return Err(EngineError::Validation(format!(
                "slot {} already starts at {} {}",
                *existing,
                date,
                window.start.format("%H:%M")
            )));
        }

        let mut ledgers = self
            .lock_ledgers(tour.requirements.iter().map(|r| r.resource_id))
            .await;
        if let Some(shortfall) = find_shortfall(
            &tour.requirements,
            &self.resources,
            |rid| ledgers.get(rid).map(|g| &**g),
            date,
            &window,
            None,
        )? {
            metrics::counter!(crate::observability::RESOURCE_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::ResourceConflict(conflict_message(
                date, &window, shortfall,
            )));
        }

        let slot = TimeSlot {
            id,
            tour_id,
            template_id: None,
            date,
            window,
            total_capacity,
            booked_count: 0,
            status: SlotStatus::Available,
            notes: None,
            commitments: tour
                .requirements
                .iter()
                .map(|r| ResourceCommitment {
                    resource_id: r.resource_id,
                    slot_id: id,
                    quantity_used: r.quantity_needed,
                })
                .collect(),
        };
        self.persist_slot(&mut ledgers, slot.clone(), None).await?;
        Ok(slot)
    }

    /// Delete a slot that holds no live bookings. Its commitments go with it.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.log_gate.read().await;
        let shared = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let (tour_id, resource_ids) = {
            let ss = shared.read().await;
            (ss.slot.tour_id, commitment_ids(&ss.slot))
        };
        let tour_lock = self.tour_lock(tour_id);
        let _tour = tour_lock.lock().await;
        let mut ledgers = self.lock_ledgers(resource_ids).await;
        let mut ss = shared.write().await;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        refuse_if_booked(&ss)?;
        let event = Event::SlotDeleted { id, tour_id };
        self.persist_slot_removal(&mut ledgers, &mut ss, &event).await
    }

    /// Cancel a slot: new bookings are refused and its commitments stop counting.
    /// Existing bookings are left to the caller to cancel or move.
    pub async fn cancel_slot(&self, id: Ulid) -> Result<TimeSlot, EngineError> {
        let _gate = self.log_gate.read().await;
        let shared = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let resource_ids = commitment_ids(&shared.read().await.slot);
        let mut ledgers = self.lock_ledgers(resource_ids).await;
        let mut ss = shared.write().await;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if ss.slot.status == SlotStatus::Cancelled {
            return Err(EngineError::Validation(format!("slot {id} is already cancelled")));
        }
        let event = Event::SlotCancelled {
            id,
            tour_id: ss.slot.tour_id,
        };
        self.persist_slot_removal(&mut ledgers, &mut ss, &event).await?;
        Ok(ss.slot.clone())
    }

    pub async fn update_slot(&self, id: Ulid, update: SlotUpdate) -> Result<TimeSlot, EngineError> {
        validate_notes(update.notes.as_deref())?;
        let _gate = self.log_gate.read().await;
        let shared = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let mut ss = shared.write().await;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let total_capacity = update.total_capacity.unwrap_or(ss.slot.total_capacity);
        if total_capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1".into()));
        }
        if total_capacity > MAX_SLOT_CAPACITY {
            return Err(EngineError::LimitExceeded("slot capacity too large"));
        }
        if total_capacity < ss.slot.booked_count {
            return Err(EngineError::Validation(format!(
                "capacity {total_capacity} is below the {} seats already booked",
                ss.slot.booked_count
            )));
        }
        let event = Event::SlotUpdated {
            id,
            tour_id: ss.slot.tour_id,
            total_capacity,
            notes: update.notes.or_else(|| ss.slot.notes.clone()),
        };
        self.persist_to_slot(&mut ss, &event).await?;
        Ok(ss.slot.clone())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No mutation can be between its log append and its apply while we hold this.
        let _gate = self.log_gate.write().await;
        let mut events = Vec::new();

        for r in self.resources.iter() {
            events.push(Event::ResourceUpserted {
                id: r.id,
                name: r.name.clone(),
                total_quantity: r.total_quantity,
                seats_per_unit: r.seats_per_unit,
            });
        }
        for t in self.tours.iter() {
            events.push(Event::TourUpserted {
                id: t.id,
                base_price: t.base_price,
                min_participants: t.min_participants,
                max_participants: t.max_participants,
            });
            for req in &t.requirements {
                events.push(Event::RequirementSet {
                    tour_id: t.id,
                    resource_id: req.resource_id,
                    quantity_needed: req.quantity_needed,
                });
            }
        }
        for t in self.templates.iter() {
            events.push(Event::TemplateUpserted {
                template: t.value().clone(),
            });
        }

        let shared: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut slot_count = 0usize;
        let mut booking_count = 0usize;
        for s in shared {
            let ss = s.read().await;
            let mut slot = ss.slot.clone();
            // Re-derived from the bookings that follow.
            slot.booked_count = 0;
            events.push(Event::SlotCreated {
                slot,
                replaced: None,
            });
            slot_count += 1;
            for b in &ss.bookings {
                events.push(Event::BookingCreated { booking: b.clone() });
                booking_count += 1;
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(slots = slot_count, bookings = booking_count, "compacted WAL");
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

pub(super) fn commitment_ids(slot: &TimeSlot) -> Vec<Ulid> {
    slot.commitments.iter().map(|c| c.resource_id).collect()
}

/// A slot may only disappear while none of its bookings is live or completed.
pub(super) fn refuse_if_booked(ss: &SlotState) -> Result<(), EngineError> {
    let kept = ss
        .bookings
        .iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .count();
    if ss.slot.booked_count > 0 || kept > 0 {
        return Err(EngineError::IntegrityConflict(format!(
            "slot {} has {} booked seats across {} bookings",
            ss.slot.id, ss.slot.booked_count, kept
        )));
    }
    Ok(())
}
