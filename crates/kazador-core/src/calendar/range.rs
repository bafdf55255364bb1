use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Datelike,
  NaiveDate,
  Utc,
  Weekday
};
use chrono_tz::Tz;

use super::{
  add_days,
  checked_add_days,
  first_day_of_month,
  last_day_of_month,
  shift_months,
  start_of_week
};
use crate::datetime::midnight_in;

/// Calendar grids always start their
/// weeks on Sunday.
pub const WEEK_START: Weekday =
  Weekday::Sun;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
)]
pub enum ViewMode {
  Day,
  Week,
  #[default]
  Month
}

impl ViewMode {
  pub fn as_key(self) -> &'static str {
    match self {
      | Self::Day => "day",
      | Self::Week => "week",
      | Self::Month => "month"
    }
  }

  pub fn from_key(
    raw: &str
  ) -> Option<Self> {
    match raw
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "day" => Some(Self::Day),
      | "week" => Some(Self::Week),
      | "month" => Some(Self::Month),
      | _ => None
    }
  }
}

impl fmt::Display for ViewMode {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(self.as_key())
  }
}

impl FromStr for ViewMode {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    Self::from_key(s).ok_or_else(|| {
      anyhow!(
        "unknown view '{s}'; expected \
         day, week or month"
      )
    })
  }
}

/// Half-open `[start, end)` range of
/// calendar dates.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct VisibleRange {
  pub start: NaiveDate,
  pub end:   NaiveDate
}

impl VisibleRange {
  pub fn len_days(&self) -> i64 {
    (self.end - self.start).num_days()
  }

  pub fn contains(
    &self,
    date: NaiveDate
  ) -> bool {
    date >= self.start && date < self.end
  }

  /// Last date rendered by the grid.
  pub fn last_day(&self) -> NaiveDate {
    add_days(self.end, -1)
  }

  pub fn days(
    &self
  ) -> impl Iterator<Item = NaiveDate>
  {
    let start = self.start;
    (0..self.len_days().max(0))
      .map(move |offset| {
        add_days(start, offset)
      })
  }

  pub fn start_instant(
    &self,
    tz: Tz
  ) -> DateTime<Utc> {
    midnight_in(tz, self.start)
  }

  pub fn end_instant(
    &self,
    tz: Tz
  ) -> DateTime<Utc> {
    midnight_in(tz, self.end)
  }
}

/// Visible date range for `view` around
/// `reference`.
#[tracing::instrument(level = "debug")]
pub fn visible_range(
  reference: NaiveDate,
  view: ViewMode
) -> VisibleRange {
  let range = match view {
    | ViewMode::Day => {
      VisibleRange {
        start: reference,
        end:   add_days(reference, 1)
      }
    }
    | ViewMode::Week => {
      let start = start_of_week(
        reference, WEEK_START
      );
      VisibleRange {
        start,
        end: add_days(start, 7)
      }
    }
    | ViewMode::Month => {
      let first = first_day_of_month(
        reference.year(),
        reference.month()
      );
      let last = last_day_of_month(
        reference.year(),
        reference.month()
      );
      VisibleRange {
        start: start_of_week(
          first, WEEK_START
        ),
        end:   add_days(
          start_of_week(
            last, WEEK_START
          ),
          7
        )
      }
    }
  };

  tracing::debug!(
    start = %range.start,
    end = %range.end,
    "computed visible range"
  );
  range
}

/// Moves the pivot by `step` views.
/// `None` when the result leaves the
/// representable date range.
#[must_use]
pub fn shift(
  current: NaiveDate,
  view: ViewMode,
  step: i64
) -> Option<NaiveDate> {
  match view {
    | ViewMode::Day => {
      checked_add_days(current, step)
    }
    | ViewMode::Week => {
      step.checked_mul(7).and_then(
        |days| {
          checked_add_days(
            current, days
          )
        }
      )
    }
    | ViewMode::Month => {
      shift_months(current, step)
    }
  }
}

pub fn view_title(
  view: ViewMode,
  reference: NaiveDate
) -> String {
  match view {
    | ViewMode::Month => {
      reference
        .format("%B %Y")
        .to_string()
    }
    | ViewMode::Week => {
      let start = start_of_week(
        reference, WEEK_START
      );
      format!(
        "Week of {}",
        start.format("%Y-%m-%d")
      )
    }
    | ViewMode::Day => {
      reference
        .format("%A, %Y-%m-%d")
        .to_string()
    }
  }
}
