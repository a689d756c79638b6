use chrono::{DateTime, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::*;

use super::conflict::find_shortfall;
use super::pricing::price_quote;
use super::{Engine, EngineError, ResourceShortfall};

impl Engine {
    pub async fn get_slot_snapshot(&self, id: Ulid) -> Result<TimeSlot, EngineError> {
        let shared = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        Ok(shared.read().await.slot.clone())
    }

    /// Point-in-time resource check for a candidate window. Reserves nothing.
    pub async fn check_availability(
        &self,
        requirements: &[ResourceRequirement],
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude_slot: Option<Ulid>,
    ) -> Result<Option<ResourceShortfall>, EngineError> {
        if end <= start {
            return Err(EngineError::Validation(
                "end time must be after start time".into(),
            ));
        }
        let window = TimeWindow::new(start, end);
        let mut ids: Vec<Ulid> = requirements.iter().map(|r| r.resource_id).collect();
        ids.sort();
        ids.dedup();
        let mut guards = std::collections::BTreeMap::new();
        for rid in ids {
            guards.insert(rid, self.ledger(rid).read_owned().await);
        }
        find_shortfall(
            requirements,
            &self.resources,
            |rid| guards.get(rid).map(|g| &**g),
            date,
            &window,
            exclude_slot,
        )
    }

    /// Price and manifest for a tour, independent of any slot.
    pub fn quote_tour(&self, tour_id: Ulid, participants: u32) -> Result<PriceQuote, EngineError> {
        let tour = self
            .tours
            .get(&tour_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(tour_id))?;
        price_quote(&tour, participants, |rid| {
            self.resources.get(rid).map(|r| r.clone())
        })
    }

    /// Quote for a slot of a tour. The slot must belong to the tour.
    pub async fn quote(
        &self,
        tour_id: Ulid,
        slot_id: Ulid,
        participants: u32,
    ) -> Result<SlotQuote, EngineError> {
        let slot = self.get_slot_snapshot(slot_id).await?;
        if slot.tour_id != tour_id {
            return Err(EngineError::Validation(format!(
                "slot {slot_id} does not belong to tour {tour_id}"
            )));
        }
        self.quote_slot(slot_id, participants).await
    }

    /// Quote using the slot's own tour.
    pub async fn quote_slot(&self, slot_id: Ulid, participants: u32) -> Result<SlotQuote, EngineError> {
        let slot = self.get_slot_snapshot(slot_id).await?;
        let quote = self.quote_tour(slot.tour_id, participants)?;
        let free_seats = slot.free_seats();
        Ok(SlotQuote {
            total_price: quote.total_price,
            manifest: quote.manifest,
            available: slot.status == SlotStatus::Available && free_seats >= participants,
            free_seats,
        })
    }

    pub async fn slot_stats(&self, slot_id: Ulid) -> Result<SlotStats, EngineError> {
        let shared = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let ss = shared.read().await;
        let slot = &ss.slot;
        let booked = slot.booked_count;
        let status = if slot.status == SlotStatus::Cancelled {
            OccupancyStatus::Cancelled
        } else if booked >= slot.total_capacity {
            OccupancyStatus::FullyBooked
        } else if booked > 0 {
            OccupancyStatus::PartiallyBooked
        } else {
            OccupancyStatus::Available
        };
        Ok(SlotStats {
            slot_id,
            total_capacity: slot.total_capacity,
            booked,
            free: slot.free_seats(),
            pending_count: ss.participants_with(&[BookingStatus::Pending]),
            confirmed_count: ss.participants_with(&[BookingStatus::Confirmed, BookingStatus::Paid]),
            bookings_count: ss
                .bookings
                .iter()
                .filter(|b| b.status != BookingStatus::Cancelled)
                .count() as u32,
            status,
        })
    }

    /// Compare the occupancy counter with the sum over the booking rows.
    pub async fn audit_slot(&self, slot_id: Ulid) -> Result<OccupancyAudit, EngineError> {
        let shared = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let ss = shared.read().await;
        Ok(OccupancyAudit {
            slot_id,
            counter: ss.slot.booked_count,
            recomputed: ss.seated_participants(),
        })
    }

    /// Slots of a tour, optionally bounded by date, ordered by date and start.
    pub async fn list_slots(
        &self,
        tour_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Vec<TimeSlot> {
        let ids: Vec<Ulid> = self
            .slot_keys
            .iter()
            .filter(|e| {
                let (tid, date, _) = *e.key();
                tid == tour_id
                    && from.is_none_or(|f| date >= f)
                    && to.is_none_or(|t| date <= t)
            })
            .map(|e| *e.value())
            .collect();
        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.get_slot(&id) {
                slots.push(shared.read().await.slot.clone());
            }
        }
        slots.sort_by_key(|s| (s.date, s.window.start));
        slots
    }

    /// Non-cancelled bookings of a slot, oldest first.
    pub async fn bookings_for_slot(&self, slot_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let shared = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let ss = shared.read().await;
        let mut bookings: Vec<Booking> = ss
            .bookings
            .iter()
            .filter(|b| b.status != BookingStatus::Cancelled)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.created_at);
        Ok(bookings)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let slot_id = self.slot_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self.get_slot(&slot_id).ok_or(EngineError::NotFound(id))?;
        let ss = shared.read().await;
        ss.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn find_booking_by_code(&self, code: &str) -> Option<Booking> {
        let id = *self.booking_codes.get(&code.trim().to_uppercase())?.value();
        self.get_booking(id).await.ok()
    }

    /// Counts per status plus revenue and participants over confirmed, paid and
    /// completed bookings, filtered by the booking's creation date (UTC).
    pub async fn booking_stats(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> BookingStats {
        let shared: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut stats = BookingStats {
            revenue: Decimal::ZERO,
            ..Default::default()
        };
        for s in shared {
            let ss = s.read().await;
            for b in &ss.bookings {
                let Some(created) = DateTime::from_timestamp_millis(b.created_at) else {
                    continue;
                };
                let day = created.date_naive();
                if from.is_some_and(|f| day < f) || to.is_some_and(|t| day > t) {
                    continue;
                }
                stats.total += 1;
                match b.status {
                    BookingStatus::Pending => stats.pending += 1,
                    BookingStatus::Confirmed => stats.confirmed += 1,
                    BookingStatus::Paid => stats.paid += 1,
                    BookingStatus::Completed => stats.completed += 1,
                    BookingStatus::Cancelled => stats.cancelled += 1,
                }
                if matches!(
                    b.status,
                    BookingStatus::Confirmed | BookingStatus::Paid | BookingStatus::Completed
                ) {
                    stats.revenue += b.total_price;
                    stats.participants += b.participants;
                }
            }
        }
        stats
    }
}
