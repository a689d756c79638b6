use chrono::{NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Tile one day into back-to-back slots separated by breaks.
///
/// Starting at `day_start`, carve `slot_minutes` windows while the window ends
/// no later than `day_end`; the cursor then skips `break_minutes`. A trailing
/// partial window is discarded. Arithmetic is in seconds from midnight so a
/// late cursor never wraps into the next day.
pub fn tile_day(
    day_start: NaiveTime,
    day_end: NaiveTime,
    slot_minutes: u32,
    break_minutes: u32,
) -> Vec<TimeWindow> {
    let mut windows = Vec::new();
    if slot_minutes == 0 {
        return windows;
    }
    let step = (slot_minutes + break_minutes) * 60;
    let end = secs_from_midnight(day_end);
    let mut cursor = secs_from_midnight(day_start);
    while cursor + slot_minutes * 60 <= end {
        let (Some(s), Some(e)) = (time_of_day(cursor), time_of_day(cursor + slot_minutes * 60))
        else {
            break;
        };
        windows.push(TimeWindow::new(s, e));
        cursor += step;
    }
    windows
}

/// Dates in `[start, end]` whose weekday is in `weekdays`.
pub fn eligible_dates(weekdays: WeekdaySet, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| weekdays.contains(*d))
        .collect()
}

pub fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<(), EngineError> {
    if start > end {
        return Err(EngineError::Validation(format!(
            "start date {start} is after end date {end}"
        )));
    }
    if (end - start).num_days() > MAX_GENERATION_DAYS {
        return Err(EngineError::Validation(format!(
            "date range exceeds {MAX_GENERATION_DAYS} days"
        )));
    }
    Ok(())
}

pub fn validate_template(t: &AvailabilityTemplate) -> Result<(), EngineError> {
    if t.weekdays.is_empty() {
        return Err(EngineError::Validation(
            "at least one weekday is required".into(),
        ));
    }
    if t.day_end <= t.day_start {
        return Err(EngineError::Validation(
            "day end must be after day start".into(),
        ));
    }
    if t.slot_duration_minutes == 0 {
        return Err(EngineError::Validation(
            "slot duration must be positive".into(),
        ));
    }
    if t.slot_duration_minutes > MAX_SLOT_DURATION_MINUTES {
        return Err(EngineError::Validation(format!(
            "slot duration cannot exceed {MAX_SLOT_DURATION_MINUTES} minutes"
        )));
    }
    if t.break_duration_minutes > MAX_BREAK_DURATION_MINUTES {
        return Err(EngineError::Validation(format!(
            "break duration cannot exceed {MAX_BREAK_DURATION_MINUTES} minutes"
        )));
    }
    Ok(())
}
