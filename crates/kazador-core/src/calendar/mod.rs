//! Calendar grid engine shared by the
//! day, week and month views.

pub mod bucket;
pub mod position;
pub mod range;

use chrono::{
  Datelike,
  NaiveDate,
  TimeDelta,
  Weekday
};

pub use bucket::{
  BucketedEvent,
  DayBucket,
  DayBuckets,
  bucket_events,
  is_all_day
};
pub use position::{
  DayPosition,
  MIN_HEIGHT_PERCENT,
  day_position
};
pub use range::{
  ViewMode,
  VisibleRange,
  shift,
  view_title,
  visible_range
};

/// Day key format used by every bucket.
pub const DAY_KEY_FORMAT: &str =
  "%Y-%m-%d";

#[must_use]
pub fn day_key(date: NaiveDate) -> String {
  date
    .format(DAY_KEY_FORMAT)
    .to_string()
}

/// `None` once the result leaves the
/// representable date range.
pub(crate) fn checked_add_days(
  date: NaiveDate,
  days: i64
) -> Option<NaiveDate> {
  TimeDelta::try_days(days).and_then(
    |delta| {
      date.checked_add_signed(delta)
    }
  )
}

/// Grid arithmetic; pins to the ends
/// of the date range.
pub(crate) fn add_days(
  date: NaiveDate,
  days: i64
) -> NaiveDate {
  checked_add_days(date, days)
    .unwrap_or(if days < 0 {
      NaiveDate::MIN
    } else {
      NaiveDate::MAX
    })
}

/// Most recent `week_start` on or
/// before `day`.
pub(crate) fn start_of_week(
  day: NaiveDate,
  week_start: Weekday
) -> NaiveDate {
  let day_idx = day
    .weekday()
    .num_days_from_sunday()
    as i64;
  let start_idx = week_start
    .num_days_from_sunday()
    as i64;
  let diff =
    (7 + day_idx - start_idx) % 7;
  add_days(day, -diff)
}

pub(crate) fn first_day_of_month(
  year: i32,
  month: u32
) -> NaiveDate {
  NaiveDate::from_ymd_opt(
    year, month, 1
  )
  .unwrap_or(NaiveDate::MIN)
}

pub(crate) fn last_day_of_month(
  year: i32,
  month: u32
) -> NaiveDate {
  let (next_year, next_month) =
    if month >= 12 {
      (year.saturating_add(1), 1_u32)
    } else {
      (year, month + 1)
    };
  add_days(
    first_day_of_month(
      next_year, next_month
    ),
    -1
  )
}

/// Moves `date` by whole months,
/// clamping the day to the target
/// month's length. `None` when the
/// target year is out of range.
#[must_use]
pub fn shift_months(
  date: NaiveDate,
  months: i64
) -> Option<NaiveDate> {
  let total = (i64::from(date.year())
    * 12
    + i64::from(date.month0()))
  .checked_add(months)?;
  let year = i32::try_from(
    total.div_euclid(12)
  )
  .ok()?;
  let month = u32::try_from(
    total.rem_euclid(12) + 1
  )
  .ok()?;

  let day = date.day();
  NaiveDate::from_ymd_opt(
    year, month, day
  )
  .or_else(|| {
    (28..day).rev().find_map(|d| {
      NaiveDate::from_ymd_opt(
        year, month, d
      )
    })
  })
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    Weekday
  };

  use super::*;

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  #[test]
  fn sunday_is_its_own_week_start() {
    assert_eq!(
      start_of_week(
        date(2024, 1, 7),
        Weekday::Sun
      ),
      date(2024, 1, 7)
    );
    assert_eq!(
      start_of_week(
        date(2024, 1, 13),
        Weekday::Sun
      ),
      date(2024, 1, 7)
    );
  }

  #[test]
  fn month_shift_clamps_day() {
    assert_eq!(
      shift_months(date(2023, 3, 31), -1),
      Some(date(2023, 2, 28))
    );
    assert_eq!(
      shift_months(date(2023, 12, 15), 1),
      Some(date(2024, 1, 15))
    );
    assert_eq!(
      shift_months(date(2024, 1, 31), -25),
      Some(date(2021, 12, 31))
    );
    assert_eq!(
      last_day_of_month(2024, 2),
      date(2024, 2, 29)
    );
  }

  #[test]
  fn out_of_range_shifts_are_reported() {
    let pivot = date(2024, 1, 10);
    assert_eq!(
      shift_months(
        pivot,
        i64::from(i32::MAX)
      ),
      None
    );
    assert_eq!(
      shift_months(pivot, i64::MIN),
      None
    );
    assert_eq!(
      checked_add_days(pivot, i64::MAX),
      None
    );
    assert_eq!(
      add_days(NaiveDate::MAX, 1),
      NaiveDate::MAX
    );
  }
}
