use std::collections::BTreeMap;

use chrono::{
  DateTime,
  Duration,
  NaiveDate,
  Timelike,
  Utc
};
use chrono_tz::Tz;

use super::range::VisibleRange;
use crate::model::CalendarEvent;

/// An event placed into one day cell,
/// with its resolved span.
#[derive(Debug, Clone, Copy)]
pub struct BucketedEvent<'a> {
  pub event:   &'a CalendarEvent,
  pub start:   DateTime<Utc>,
  pub end:     DateTime<Utc>,
  pub all_day: bool
}

impl BucketedEvent<'_> {
  pub fn spans_multiple_days(
    &self,
    tz: Tz
  ) -> bool {
    self
      .start
      .with_timezone(&tz)
      .date_naive()
      != self
        .end
        .with_timezone(&tz)
        .date_naive()
  }
}

#[derive(Debug, Clone)]
pub struct DayBucket<'a> {
  pub date:    NaiveDate,
  pub all_day: Vec<BucketedEvent<'a>>,
  pub timed:   Vec<BucketedEvent<'a>>
}

impl DayBucket<'_> {
  fn new(date: NaiveDate) -> Self {
    Self {
      date,
      all_day: Vec::new(),
      timed: Vec::new()
    }
  }

  pub fn len(&self) -> usize {
    self.all_day.len() + self.timed.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(
    &self,
    event_id: &str
  ) -> bool {
    self
      .all_day
      .iter()
      .chain(self.timed.iter())
      .any(|entry| {
        entry.event.id == event_id
      })
  }
}

/// Every day of a visible range with
/// the events touching it.
#[derive(Debug, Clone)]
pub struct DayBuckets<'a> {
  range: VisibleRange,
  days:  BTreeMap<NaiveDate, DayBucket<'a>>
}

impl<'a> DayBuckets<'a> {
  pub fn range(&self) -> VisibleRange {
    self.range
  }

  pub fn get(
    &self,
    date: NaiveDate
  ) -> Option<&DayBucket<'a>> {
    self.days.get(&date)
  }

  /// Lookup by `YYYY-MM-DD` key.
  pub fn get_key(
    &self,
    key: &str
  ) -> Option<&DayBucket<'a>> {
    let date =
      NaiveDate::parse_from_str(
        key,
        super::DAY_KEY_FORMAT
      )
      .ok()?;
    self.days.get(&date)
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = &DayBucket<'a>>
  {
    self.days.values()
  }

  /// Date keys of the days holding
  /// `event_id`, in order.
  pub fn keys_for(
    &self,
    event_id: &str
  ) -> Vec<String> {
    self
      .days
      .values()
      .filter(|bucket| {
        bucket.contains(event_id)
      })
      .map(|bucket| {
        super::day_key(bucket.date)
      })
      .collect()
  }

  pub fn total_placements(&self) -> usize {
    self
      .days
      .values()
      .map(DayBucket::len)
      .sum()
  }
}

/// All-day when flagged, or when the
/// span covers at least 24h and both
/// ends sit in the midnight hour.
pub fn is_all_day(
  event: &CalendarEvent,
  start: DateTime<Utc>,
  end: DateTime<Utc>,
  tz: Tz
) -> bool {
  if event.is_all_day {
    return true;
  }

  end - start >= Duration::hours(24)
    && start.with_timezone(&tz).hour()
      == 0
    && end.with_timezone(&tz).hour()
      == 0
}

/// Assigns each event to every day of
/// `range` it overlaps.
///
/// Events without any timestamp are
/// skipped. Buckets are ordered by
/// start, then end, then summary and
/// id.
#[tracing::instrument(skip(events), fields(events = events.len()))]
pub fn bucket_events<'a>(
  events: &'a [CalendarEvent],
  range: VisibleRange,
  tz: Tz
) -> DayBuckets<'a> {
  let mut days = range
    .days()
    .map(|date| {
      (date, DayBucket::new(date))
    })
    .collect::<BTreeMap<_, _>>();

  let range_start =
    range.start_instant(tz);
  let range_end = range.end_instant(tz);
  let mut skipped_unscheduled = 0_usize;
  let mut skipped_outside = 0_usize;

  for event in events {
    let Some((start, end)) =
      event.effective_span()
    else {
      skipped_unscheduled += 1;
      continue;
    };

    if !(end >= range_start
      && start < range_end)
    {
      skipped_outside += 1;
      continue;
    }

    let first_day = start
      .with_timezone(&tz)
      .date_naive()
      .max(range.start);
    let last_day = end
      .with_timezone(&tz)
      .date_naive()
      .min(range.last_day());
    if first_day > last_day {
      tracing::debug!(
        event = %event.id,
        %start,
        %end,
        "event ends before it starts; not placed"
      );
      continue;
    }

    let entry = BucketedEvent {
      event,
      start,
      end,
      all_day: is_all_day(
        event, start, end, tz
      )
    };

    let mut day = first_day;
    while day <= last_day {
      if let Some(bucket) =
        days.get_mut(&day)
      {
        if entry.all_day {
          bucket.all_day.push(entry);
        } else {
          bucket.timed.push(entry);
        }
      }
      let Some(next) = day.succ_opt()
      else {
        break;
      };
      day = next;
    }
  }

  for bucket in days.values_mut() {
    bucket.all_day.sort_by(compare_entries);
    bucket.timed.sort_by(compare_entries);
  }

  tracing::debug!(
    skipped_unscheduled,
    skipped_outside,
    "bucketed calendar events"
  );

  DayBuckets { range, days }
}

fn compare_entries(
  a: &BucketedEvent<'_>,
  b: &BucketedEvent<'_>
) -> std::cmp::Ordering {
  a.start
    .cmp(&b.start)
    .then_with(|| a.end.cmp(&b.end))
    .then_with(|| {
      a.event
        .summary
        .cmp(&b.event.summary)
    })
    .then_with(|| {
      a.event.id.cmp(&b.event.id)
    })
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    TimeZone,
    Utc
  };

  use super::*;
  use crate::calendar::range::{
    ViewMode,
    visible_range
  };
  use crate::model::EventOrigin;

  fn at(
    y: i32,
    m: u32,
    d: u32,
    h: u32,
    min: u32
  ) -> DateTime<Utc> {
    Utc
      .with_ymd_and_hms(y, m, d, h, min, 0)
      .single()
      .expect("valid instant")
  }

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  fn event(
    id: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>
  ) -> CalendarEvent {
    CalendarEvent {
      id:          id.to_string(),
      summary:     id.to_uppercase(),
      description: None,
      location:    None,
      start_at:    start,
      end_at:      end,
      is_all_day:  false,
      status:      None,
      origin:      EventOrigin::Kazador,
      source_id:   None,
      source:      None,
      project_id:  None,
      raw:         None
    }
  }

  #[test]
  fn multi_day_event_lands_in_every_touched_day(
  ) {
    let events = vec![event(
      "tour",
      Some(at(2024, 1, 9, 18, 0)),
      Some(at(2024, 1, 12, 2, 0))
    )];
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Week
    );

    let buckets = bucket_events(
      &events,
      range,
      chrono_tz::UTC
    );

    assert_eq!(
      buckets.keys_for("tour"),
      vec![
        "2024-01-09",
        "2024-01-10",
        "2024-01-11",
        "2024-01-12"
      ]
    );
  }

  #[test]
  fn span_is_clamped_to_visible_range() {
    let events = vec![event(
      "residency",
      Some(at(2023, 12, 20, 10, 0)),
      Some(at(2024, 3, 1, 10, 0))
    )];
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Week
    );

    let buckets = bucket_events(
      &events,
      range,
      chrono_tz::UTC
    );

    let keys = buckets.keys_for("residency");
    assert_eq!(keys.len(), 7);
    assert_eq!(keys[0], "2024-01-07");
    assert_eq!(keys[6], "2024-01-13");
  }

  #[test]
  fn events_outside_range_and_unscheduled_are_dropped(
  ) {
    let events = vec![
      event(
        "before",
        Some(at(2024, 1, 1, 9, 0)),
        Some(at(2024, 1, 1, 10, 0))
      ),
      event(
        "after",
        Some(at(2024, 1, 14, 0, 0)),
        Some(at(2024, 1, 14, 1, 0))
      ),
      event("floating", None, None),
    ];
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Week
    );

    let buckets = bucket_events(
      &events,
      range,
      chrono_tz::UTC
    );

    assert_eq!(buckets.total_placements(), 0);
    assert_eq!(buckets.iter().count(), 7);
  }

  #[test]
  fn missing_end_uses_start_and_vice_versa() {
    let events = vec![
      event(
        "start-only",
        Some(at(2024, 1, 10, 9, 0)),
        None
      ),
      event(
        "end-only",
        None,
        Some(at(2024, 1, 10, 8, 0))
      ),
    ];
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Day
    );

    let buckets = bucket_events(
      &events,
      range,
      chrono_tz::UTC
    );
    let day = buckets
      .get_key("2024-01-10")
      .expect("day bucket");

    let ids = day
      .timed
      .iter()
      .map(|entry| entry.event.id.as_str())
      .collect::<Vec<_>>();
    assert_eq!(ids, vec!["end-only", "start-only"]);
  }

  #[test]
  fn classifies_all_day_events() {
    let flagged = CalendarEvent {
      is_all_day: true,
      ..event(
        "flagged",
        Some(at(2024, 1, 10, 9, 0)),
        Some(at(2024, 1, 10, 10, 0))
      )
    };
    let midnight_span = event(
      "midnight",
      Some(at(2024, 1, 10, 0, 0)),
      Some(at(2024, 1, 11, 0, 0))
    );
    let long_but_offset = event(
      "offset",
      Some(at(2024, 1, 10, 1, 0)),
      Some(at(2024, 1, 11, 1, 0))
    );
    let short_midnight = event(
      "short",
      Some(at(2024, 1, 10, 0, 0)),
      Some(at(2024, 1, 10, 0, 30))
    );

    let check = |e: &CalendarEvent| {
      let (start, end) =
        e.effective_span().expect("span");
      is_all_day(e, start, end, chrono_tz::UTC)
    };

    assert!(check(&flagged));
    assert!(check(&midnight_span));
    assert!(!check(&long_but_offset));
    assert!(!check(&short_midnight));
  }

  #[test]
  fn all_day_follows_display_timezone_midnight(
  ) {
    let helsinki: Tz = "Europe/Helsinki"
      .parse()
      .expect("tz");
    let local_day = event(
      "local",
      Some(at(2024, 1, 9, 22, 0)),
      Some(at(2024, 1, 10, 22, 0))
    );
    let utc_day = event(
      "utc",
      Some(at(2024, 1, 10, 0, 0)),
      Some(at(2024, 1, 11, 0, 0))
    );

    let check = |e: &CalendarEvent, tz| {
      let (start, end) =
        e.effective_span().expect("span");
      is_all_day(e, start, end, tz)
    };

    assert!(check(&local_day, helsinki));
    assert!(!check(&utc_day, helsinki));
    assert!(!check(
      &local_day,
      chrono_tz::UTC
    ));

    let events =
      vec![local_day, utc_day];
    let buckets = bucket_events(
      &events,
      visible_range(
        date(2024, 1, 10),
        ViewMode::Day
      ),
      helsinki
    );
    let day = buckets
      .get(date(2024, 1, 10))
      .expect("day bucket");
    assert_eq!(day.all_day.len(), 1);
    assert_eq!(
      day.all_day[0].event.id,
      "local"
    );
    assert_eq!(
      day.timed[0].event.id,
      "utc"
    );
  }

  #[test]
  fn all_day_and_timed_buckets_are_sorted() {
    let events = vec![
      event(
        "late",
        Some(at(2024, 1, 10, 15, 0)),
        Some(at(2024, 1, 10, 16, 0))
      ),
      event(
        "early",
        Some(at(2024, 1, 10, 8, 0)),
        Some(at(2024, 1, 10, 9, 0))
      ),
      event(
        "holiday",
        Some(at(2024, 1, 10, 0, 0)),
        Some(at(2024, 1, 11, 0, 0))
      ),
    ];
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Day
    );

    let buckets = bucket_events(
      &events,
      range,
      chrono_tz::UTC
    );
    let day = buckets
      .get(date(2024, 1, 10))
      .expect("day bucket");

    assert_eq!(day.all_day.len(), 1);
    assert_eq!(day.all_day[0].event.id, "holiday");
    let timed = day
      .timed
      .iter()
      .map(|entry| entry.event.id.as_str())
      .collect::<Vec<_>>();
    assert_eq!(timed, vec!["early", "late"]);
  }

  #[test]
  fn day_keys_follow_display_timezone() {
    let tz: Tz =
      "America/Los_Angeles".parse().expect("tz");
    // 06:00Z on the 11th is 22:00 on the
    // 10th in Los Angeles.
    let events = vec![event(
      "late-show",
      Some(at(2024, 1, 11, 6, 0)),
      Some(at(2024, 1, 11, 7, 0))
    )];
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Week
    );

    let buckets =
      bucket_events(&events, range, tz);
    assert_eq!(
      buckets.keys_for("late-show"),
      vec!["2024-01-10"]
    );
  }

  #[test]
  fn every_day_between_clamped_ends_is_filled(
  ) {
    let range = visible_range(
      date(2024, 1, 10),
      ViewMode::Month
    );
    let base = at(2023, 12, 25, 12, 0);

    for start_offset in 0..20_i64 {
      for length in [0_i64, 1, 5, 13, 40] {
        let start = base
          + Duration::days(start_offset * 2);
        let end =
          start + Duration::days(length);
        let events = vec![event(
          "probe",
          Some(start),
          Some(end)
        )];
        let buckets = bucket_events(
          &events,
          range,
          chrono_tz::UTC
        );

        let first = start
          .date_naive()
          .max(range.start);
        let last = end
          .date_naive()
          .min(range.last_day());
        let expected = if first <= last {
          (last - first).num_days() as usize
            + 1
        } else {
          0
        };
        assert_eq!(
          buckets.keys_for("probe").len(),
          expected,
          "start {start} end {end}"
        );
      }
    }
  }
}
