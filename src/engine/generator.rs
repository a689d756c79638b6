use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RESOURCE_CONFLICTS_TOTAL, SLOTS_GENERATED_TOTAL, SLOTS_SKIPPED_TOTAL};

use super::conflict::{conflict_message, find_shortfall};
use super::mutations::{commitment_ids, refuse_if_booked};
use super::schedule::{eligible_dates, tile_day, validate_range, validate_template};
use super::{Engine, EngineError};

impl Engine {
    /// Expand a template into dated slots over `[start, end]`.
    ///
    /// Existing slots at the same tour/date/start are skipped unless
    /// `overwrite` is set, in which case a booking-free slot is replaced in
    /// the same log record. A window with a resource shortfall is skipped and
    /// its conflict recorded in the report; only structural errors abort the run.
    pub async fn generate_schedules(
        &self,
        template_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        overwrite: bool,
        check_conflicts: bool,
    ) -> Result<GenerationReport, EngineError> {
        validate_range(start, end)?;
        let _gate = self.log_gate.read().await;

        let tour_id = self
            .templates
            .get(&template_id)
            .map(|t| t.tour_id)
            .ok_or(EngineError::NotFound(template_id))?;
        let tour_lock = self.tour_lock(tour_id);
        let _tour = tour_lock.lock().await;

        // Re-read under the tour lock: the template may have changed meanwhile.
        let template = self
            .templates
            .get(&template_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(template_id))?;
        if !template.active {
            return Err(EngineError::Validation(format!(
                "template {template_id} is inactive"
            )));
        }
        validate_template(&template)?;
        let tour = self
            .tours
            .get(&tour_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(tour_id))?;
        for req in &tour.requirements {
            if !self.resources.contains_key(&req.resource_id) {
                return Err(EngineError::NotFound(req.resource_id));
            }
        }

        let windows = tile_day(
            template.day_start,
            template.day_end,
            template.slot_duration_minutes,
            template.break_duration_minutes,
        );
        let capacity = tour.slot_capacity();
        let required: Vec<Ulid> = tour.requirements.iter().map(|r| r.resource_id).collect();
        let mut report = GenerationReport::default();

        for date in eligible_dates(template.weekdays, start, end) {
            for window in &windows {
                let existing = self
                    .slot_keys
                    .get(&(tour_id, date, window.start))
                    .map(|e| *e.value())
                    .and_then(|id| self.get_slot(&id));

                let mut lock_ids = required.clone();
                if let Some(shared) = &existing {
                    if !overwrite {
                        debug!(%date, start = %window.start, "slot exists, skipping");
                        report.slots_skipped += 1;
                        continue;
                    }
                    lock_ids.extend(commitment_ids(&shared.read().await.slot));
                }

                let mut ledgers = self.lock_ledgers(lock_ids).await;
                let mut replaced = match existing {
                    Some(shared) => Some(shared.write_owned().await),
                    None => None,
                };
                if let Some(old) = &replaced
                    && refuse_if_booked(old).is_err()
                {
                    warn!(%date, start = %window.start, slot_id = %old.slot.id, "not overwriting slot with bookings");
                    report.slots_skipped += 1;
                    report
                        .conflicts
                        .push(conflict_message(date, window, "existing slot has bookings"));
                    continue;
                }
                let replaced_id = replaced.as_ref().map(|ss| ss.slot.id);

                if check_conflicts
                    && let Some(shortfall) = find_shortfall(
                        &tour.requirements,
                        &self.resources,
                        |rid| ledgers.get(rid).map(|g| &**g),
                        date,
                        window,
                        replaced_id,
                    )?
                {
                    debug!(%date, start = %window.start, %shortfall, "resource conflict");
                    metrics::counter!(RESOURCE_CONFLICTS_TOTAL).increment(1);
                    report.slots_skipped += 1;
                    report
                        .conflicts
                        .push(conflict_message(date, window, shortfall));
                    continue;
                }

                let id = Ulid::new();
                let slot = TimeSlot {
                    id,
                    tour_id,
                    template_id: Some(template_id),
                    date,
                    window: *window,
                    total_capacity: capacity,
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
                self.persist_slot(&mut ledgers, slot, replaced.as_deref_mut())
                    .await?;
                report.slots_created += 1;
            }
        }

        metrics::counter!(SLOTS_GENERATED_TOTAL).increment(report.slots_created as u64);
        metrics::counter!(SLOTS_SKIPPED_TOTAL).increment(report.slots_skipped as u64);
        info!(
            %template_id,
            %start,
            %end,
            created = report.slots_created,
            skipped = report.slots_skipped,
            conflicts = report.conflicts.len(),
            "generated schedule"
        );
        Ok(report)
    }

    /// Dry run of `generate_schedules`: the same tiling, no persistence, no conflict checks.
    pub fn preview_generation(
        &self,
        template_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<GenerationPreview, EngineError> {
        validate_range(start, end)?;
        let template = self
            .templates
            .get(&template_id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(template_id))?;
        let requirements = self
            .tours
            .get(&template.tour_id)
            .map(|t| t.requirements.clone())
            .ok_or(EngineError::NotFound(template.tour_id))?;

        let per_day = tile_day(
            template.day_start,
            template.day_end,
            template.slot_duration_minutes,
            template.break_duration_minutes,
        )
        .len() as u32;

        let days: Vec<PreviewDay> = eligible_dates(template.weekdays, start, end)
            .into_iter()
            .map(|date| PreviewDay {
                date,
                weekday: date.weekday().number_from_monday() as u8,
                slots: per_day,
                day_start: template.day_start,
                day_end: template.day_end,
            })
            .collect();

        Ok(GenerationPreview {
            template_id,
            tour_id: template.tour_id,
            start_date: start,
            end_date: end,
            total_slots: per_day * days.len() as u32,
            days,
            requirements,
        })
    }
}
