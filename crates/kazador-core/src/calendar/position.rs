use chrono::{
  DateTime,
  Duration,
  Utc
};

use crate::model::CalendarEvent;

/// Smallest block height, so very short
/// events stay visible.
pub const MIN_HEIGHT_PERCENT: f64 = 6.0;

const DAY_MILLIS: f64 = 86_400_000.0;
const DEFAULT_LENGTH_MINUTES: i64 = 30;

/// Vertical placement of a timed event
/// inside one day column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayPosition {
  pub top_percent:      f64,
  pub height_percent:   f64,
  pub continues_before: bool,
  pub continues_after:  bool
}

/// Places `event` in the day starting
/// at `day_start`.
///
/// Returns `None` for events without
/// any timestamp.
pub fn day_position(
  event: &CalendarEvent,
  day_start: DateTime<Utc>
) -> Option<DayPosition> {
  let start =
    event.start_at.or(event.end_at)?;
  let end = event
    .end_at
    .filter(|_| event.start_at.is_some())
    .unwrap_or_else(|| {
      start
        + Duration::minutes(
          DEFAULT_LENGTH_MINUTES
        )
    });
  let day_end =
    day_start + Duration::days(1);

  let clamped_start =
    start.clamp(day_start, day_end);
  let clamped_end = end
    .clamp(day_start, day_end)
    .max(clamped_start);

  let offset_start = (clamped_start
    - day_start)
    .num_milliseconds()
    as f64;
  let offset_end = (clamped_end
    - day_start)
    .num_milliseconds()
    as f64;

  let height_percent = ((offset_end
    - offset_start)
    / DAY_MILLIS
    * 100.0)
    .max(MIN_HEIGHT_PERCENT);
  let top_percent = (offset_start
    / DAY_MILLIS
    * 100.0)
    .min(100.0 - height_percent);

  Some(DayPosition {
    top_percent,
    height_percent,
    continues_before: start < day_start,
    continues_after: end > day_end
  })
}
