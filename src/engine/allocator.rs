use dashmap::mapref::entry::Entry;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_CREATED_TOTAL, BOOKINGS_REJECTED_TOTAL};

use super::conflict::{now_ms, validate_customer, validate_notes};
use super::pricing::price_quote;
use super::{Engine, EngineError};

/// `BK` followed by eight uppercase hex digits.
fn candidate_code() -> String {
    format!("BK{:08X}", (Ulid::new().random() & 0xFFFF_FFFF) as u32)
}

impl Engine {
    /// Free seats on a slot and whether `requested` of them fit.
    pub async fn check_slot_availability(
        &self,
        slot_id: Ulid,
        requested: u32,
    ) -> Result<SlotAvailability, EngineError> {
        let shared = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let ss = shared.read().await;
        let free_seats = ss.slot.free_seats();
        Ok(SlotAvailability {
            ok: ss.slot.status == SlotStatus::Available && free_seats >= requested,
            free_seats,
        })
    }

    /// Reserve seats on a slot.
    ///
    /// The slot's write lock is taken before the seat check and held through
    /// the log append and the counter update, so concurrent bookings on one
    /// slot serialise and can never jointly overbook it.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        if req.participants == 0 {
            return Err(EngineError::Validation(
                "participants must be at least 1".into(),
            ));
        }
        if req.participants > MAX_PARTICIPANTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        validate_customer(&req.customer)?;
        validate_notes(req.notes.as_deref())?;
        let initial = req.initial_status.unwrap_or(BookingStatus::Pending);
        if !initial.holds_seat() {
            return Err(EngineError::Validation(format!(
                "a booking cannot start as {initial}"
            )));
        }
        if self.booking_to_slot.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let _gate = self.log_gate.read().await;
        let shared = self
            .get_slot(&req.slot_id)
            .ok_or(EngineError::NotFound(req.slot_id))?;
        let mut ss = shared.write_owned().await;
        if !self.slots.contains_key(&req.slot_id) {
            return Err(EngineError::NotFound(req.slot_id));
        }
        if ss.slot.status == SlotStatus::Cancelled {
            return Err(EngineError::Validation(format!(
                "slot {} is cancelled",
                req.slot_id
            )));
        }

        let tour = self
            .tours
            .get(&ss.slot.tour_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(ss.slot.tour_id))?;
        if req.participants < tour.min_participants {
            return Err(EngineError::Validation(format!(
                "at least {} participants required",
                tour.min_participants
            )));
        }
        if let Some(max) = tour.max_participants
            && req.participants > max
        {
            return Err(EngineError::Validation(format!(
                "at most {max} participants allowed"
            )));
        }

        let free = ss.slot.free_seats();
        if req.participants > free {
            metrics::counter!(BOOKINGS_REJECTED_TOTAL).increment(1);
            debug!(slot_id = %req.slot_id, requested = req.participants, free, "booking rejected");
            return Err(EngineError::CapacityExceeded {
                requested: req.participants,
                free,
            });
        }

        let quote = price_quote(&tour, req.participants, |rid| {
            self.resources.get(rid).map(|r| r.clone())
        })?;

        // A retried request may race the original on another slot lock.
        match self.booking_to_slot.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(e) => {
                e.insert(req.slot_id);
            }
        }
        let code = match self.reserve_code(req.id) {
            Ok(code) => code,
            Err(e) => {
                self.booking_to_slot.remove(&req.id);
                return Err(e);
            }
        };
        let now = now_ms();
        let mut booking = Booking {
            id: req.id,
            code: code.clone(),
            slot_id: req.slot_id,
            tour_id: tour.id,
            customer: req.customer,
            participants: req.participants,
            total_price: quote.total_price,
            status: BookingStatus::Pending,
            created_at: now,
            confirmed_at: None,
            paid_at: None,
            completed_at: None,
            cancelled_at: None,
            notes: req.notes.filter(|n| !n.trim().is_empty()),
            resources: quote
                .manifest
                .iter()
                .map(|line| BookingResourceLine {
                    resource_id: line.resource_id,
                    units: line.units_needed,
                })
                .collect(),
        };
        booking.enter_status(initial, now);

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_to_slot(&mut ss, &event).await {
            self.booking_codes.remove(&code);
            self.booking_to_slot.remove(&booking.id);
            return Err(e);
        }
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Claim an unused booking code for `booking_id`.
    fn reserve_code(&self, booking_id: Ulid) -> Result<String, EngineError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = candidate_code();
            if let Entry::Vacant(slot) = self.booking_codes.entry(code.clone()) {
                slot.insert(booking_id);
                return Ok(code);
            }
        }
        warn!(%booking_id, "could not allocate a unique booking code");
        Err(EngineError::LimitExceeded("booking code space exhausted"))
    }

    /// Resolve booking → slot, then write-lock the slot.
    async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot_id = self
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let shared = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let ss = shared.write_owned().await;
        if ss.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(ss)
    }

    /// Move a booking along its state machine. Leaving a seat-holding state
    /// releases the seats on the slot.
    pub async fn update_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        validate_notes(note.as_deref())?;
        let _gate = self.log_gate.read().await;
        let mut ss = self.resolve_booking_write(id).await?;
        let (current, tour_id) = ss
            .booking(id)
            .map(|b| (b.status, b.tour_id))
            .ok_or(EngineError::NotFound(id))?;
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: status,
            });
        }
        let event = Event::BookingStatusChanged {
            id,
            slot_id: ss.slot.id,
            tour_id,
            status,
            at: now_ms(),
            note: note.filter(|n| !n.trim().is_empty()),
        };
        self.persist_to_slot(&mut ss, &event).await?;
        ss.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        let note = reason
            .filter(|r| !r.trim().is_empty())
            .map(|r| format!("cancellation reason: {}", r.trim()));
        self.update_booking_status(id, BookingStatus::Cancelled, note)
            .await
    }

    /// Delete a pending or cancelled booking. A pending booking gives its seats back.
    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.log_gate.read().await;
        let mut ss = self.resolve_booking_write(id).await?;
        let (status, code, tour_id) = ss
            .booking(id)
            .map(|b| (b.status, b.code.clone(), b.tour_id))
            .ok_or(EngineError::NotFound(id))?;
        if !matches!(status, BookingStatus::Pending | BookingStatus::Cancelled) {
            return Err(EngineError::Validation(format!(
                "only pending or cancelled bookings can be deleted (booking is {status})"
            )));
        }
        let event = Event::BookingDeleted {
            id,
            slot_id: ss.slot.id,
            tour_id,
        };
        self.persist_to_slot(&mut ss, &event).await?;
        self.booking_to_slot.remove(&id);
        self.booking_codes.remove(&code);
        Ok(())
    }

    /// Patch the contact fields of a guest booking.
    pub async fn update_booking(&self, id: Ulid, update: BookingUpdate) -> Result<Booking, EngineError> {
        let _gate = self.log_gate.read().await;
        let mut ss = self.resolve_booking_write(id).await?;
        let booking = ss.booking(id).ok_or(EngineError::NotFound(id))?;
        let CustomerIdentity::Guest { name, phone, email } = &booking.customer else {
            return Err(EngineError::Validation(
                "contact details of registered customers are managed by the identity service"
                    .into(),
            ));
        };
        let customer = CustomerIdentity::Guest {
            name: update.customer_name.unwrap_or_else(|| name.clone()),
            phone: update.customer_phone.unwrap_or_else(|| phone.clone()),
            email: match update.customer_email {
                Some(e) if e.trim().is_empty() => None,
                Some(e) => Some(e),
                None => email.clone(),
            },
        };
        validate_customer(&customer)?;
        let event = Event::BookingContactUpdated {
            id,
            slot_id: ss.slot.id,
            tour_id: booking.tour_id,
            customer,
        };
        self.persist_to_slot(&mut ss, &event).await?;
        ss.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }
}
