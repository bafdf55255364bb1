use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Duration,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  TimeZone,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

use crate::calendar::{
  ViewMode,
  shift
};

const TIMEZONE_CONFIG_FILE: &str =
  "kazador-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "KAZADOR_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "KAZADOR_TIME_CONFIG";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Timezone used to cut instants into
/// calendar days.
pub fn display_timezone() -> Tz {
  static DISPLAY_TZ: OnceLock<Tz> =
    OnceLock::new();
  *DISPLAY_TZ
    .get_or_init(resolve_display_timezone)
}

#[must_use]
pub fn today_in(tz: Tz) -> NaiveDate {
  Utc::now()
    .with_timezone(&tz)
    .date_naive()
}

fn resolve_display_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(&raw, TIMEZONE_ENV_VAR)
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  tracing::debug!(
    "no timezone configured; using UTC"
  );
  chrono_tz::UTC
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &Path
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  timezone_from_toml(&raw, path)
}

fn timezone_from_toml(
  raw: &str,
  path: &Path
) -> Option<Tz> {
  let parsed = match toml::from_str::<
    TimezoneConfig
  >(raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

pub fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured display timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// First instant of `date` in `tz`.
///
/// Midnight can be skipped by a DST
/// transition; the first existing hour
/// of the day is used then.
#[must_use]
pub fn midnight_in(
  tz: Tz,
  date: NaiveDate
) -> DateTime<Utc> {
  for hour in 0..3 {
    let Some(naive) =
      date.and_hms_opt(hour, 0, 0)
    else {
      break;
    };
    match tz.from_local_datetime(&naive)
    {
      | LocalResult::Single(local) => {
        return local
          .with_timezone(&Utc);
      }
      | LocalResult::Ambiguous(
        first,
        second
      ) => {
        let chosen = if first <= second {
          first
        } else {
          second
        };
        return chosen
          .with_timezone(&Utc);
      }
      | LocalResult::None => {
        tracing::debug!(
          %date,
          hour,
          timezone = %tz,
          "local hour skipped by transition"
        );
      }
    }
  }

  NaiveDateTime::new(
    date,
    NaiveTime::MIN
  )
  .and_utc()
}

/// Local wall-clock instant; errors when
/// the time falls into a DST gap.
pub fn local_instant(
  tz: Tz,
  date: NaiveDate,
  time: NaiveTime
) -> anyhow::Result<DateTime<Utc>> {
  let naive =
    NaiveDateTime::new(date, time);
  match tz.from_local_datetime(&naive) {
    | LocalResult::Single(local) => {
      Ok(local.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        first = %first,
        second = %second,
        "ambiguous local datetime; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Ok(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      Err(anyhow!(
        "{} does not exist in \
         timezone {}",
        naive.format("%Y-%m-%d %H:%M"),
        tz
      ))
    }
  }
}

fn offset_regex() -> &'static Regex {
  static OFFSET: OnceLock<Regex> =
    OnceLock::new();
  OFFSET.get_or_init(|| {
    Regex::new(
      r"^([+-])(\d{1,4})([dwm])$"
    )
    .expect("static offset regex is valid")
  })
}

fn time_regex() -> &'static Regex {
  static TIME: OnceLock<Regex> =
    OnceLock::new();
  TIME.get_or_init(|| {
    Regex::new(
      r"^(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$"
    )
    .expect("static time regex is valid")
  })
}

/// Parses a pivot date: `today`,
/// `tomorrow`, `yesterday`,
/// `YYYY-MM-DD`, a weekday name (next
/// occurrence, today included), or a
/// relative offset like `+3d`, `-1w`,
/// `+2m`.
#[tracing::instrument(skip(today), fields(input = input))]
pub fn parse_date_expr(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();

  match lower.as_str() {
    | "" => {
      return Err(anyhow!(
        "date expression is empty"
      ));
    }
    | "today" => return Ok(today),
    | "tomorrow" => {
      return Ok(
        today + Duration::days(1)
      );
    }
    | "yesterday" => {
      return Ok(
        today - Duration::days(1)
      );
    }
    | _ => {}
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    return Ok(date);
  }

  if let Some(weekday) =
    parse_weekday(&lower)
  {
    let today_idx = today
      .weekday()
      .num_days_from_monday()
      as i64;
    let target_idx = weekday
      .num_days_from_monday()
      as i64;
    let diff =
      (7 + target_idx - today_idx) % 7;
    return Ok(
      today + Duration::days(diff)
    );
  }

  if let Some(caps) =
    offset_regex().captures(&lower)
  {
    let amount: i64 = caps[2]
      .parse()
      .context("invalid offset amount")?;
    let signed = if &caps[1] == "-" {
      -amount
    } else {
      amount
    };
    let unit = match &caps[3] {
      | "d" => ViewMode::Day,
      | "w" => ViewMode::Week,
      | _ => ViewMode::Month
    };
    return shift(today, unit, signed)
      .ok_or_else(|| {
        anyhow!(
          "date offset '{token}' is out \
           of range"
        )
      });
  }

  Err(anyhow!(
    "unrecognized date '{token}'; \
     expected YYYY-MM-DD, today, \
     tomorrow, yesterday, a weekday \
     or an offset like +3d"
  ))
}

fn parse_weekday(
  raw: &str
) -> Option<Weekday> {
  let weekday = match raw {
    | "monday" | "mon" => Weekday::Mon,
    | "tuesday" | "tue" => Weekday::Tue,
    | "wednesday" | "wed" => {
      Weekday::Wed
    }
    | "thursday" | "thu" => {
      Weekday::Thu
    }
    | "friday" | "fri" => Weekday::Fri,
    | "saturday" | "sat" => {
      Weekday::Sat
    }
    | "sunday" | "sun" => Weekday::Sun,
    | _ => return None
  };
  Some(weekday)
}

/// Parses `HH:MM`, `H`, `9am` or
/// `9:30pm`.
pub fn parse_time_of_day(
  input: &str
) -> anyhow::Result<NaiveTime> {
  let lower =
    input.trim().to_ascii_lowercase();
  let caps = time_regex()
    .captures(&lower)
    .ok_or_else(|| {
      anyhow!(
        "unrecognized time '{}'; \
         expected HH:MM or 9:30am",
        input.trim()
      )
    })?;

  let mut hour: u32 = caps[1]
    .parse()
    .context("invalid hour")?;
  let minute: u32 = match caps.get(2) {
    | Some(m) => m
      .as_str()
      .parse()
      .context("invalid minute")?,
    | None => 0
  };

  if let Some(meridiem) = caps.get(3) {
    if hour == 0 || hour > 12 {
      return Err(anyhow!(
        "hour {hour} is out of range \
         for a 12-hour time"
      ));
    }
    hour %= 12;
    if meridiem.as_str() == "pm" {
      hour += 12;
    }
  }

  NaiveTime::from_hms_opt(
    hour, minute, 0
  )
  .ok_or_else(|| {
    anyhow!(
      "time {}:{:02} is out of range",
      hour,
      minute
    )
  })
}

#[cfg(test)]
mod tests {
  use chrono::{
    NaiveDate,
    NaiveTime,
    Timelike
  };

  use super::{
    midnight_in,
    parse_date_expr,
    parse_time_of_day,
    timezone_from_toml
  };

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  #[test]
  fn parses_keywords_and_iso_dates() {
    let today = date(2024, 1, 10);
    assert_eq!(
      parse_date_expr("today", today)
        .expect("today"),
      today
    );
    assert_eq!(
      parse_date_expr("Tomorrow", today)
        .expect("tomorrow"),
      date(2024, 1, 11)
    );
    assert_eq!(
      parse_date_expr(
        "2023-12-31",
        today
      )
      .expect("iso"),
      date(2023, 12, 31)
    );
  }

  #[test]
  fn weekday_name_resolves_to_next_occurrence(
  ) {
    // 2024-01-10 is a Wednesday.
    let today = date(2024, 1, 10);
    assert_eq!(
      parse_date_expr("wednesday", today)
        .expect("same day"),
      today
    );
    assert_eq!(
      parse_date_expr("sun", today)
        .expect("sunday"),
      date(2024, 1, 14)
    );
  }

  #[test]
  fn parses_relative_offsets() {
    let today = date(2024, 1, 31);
    assert_eq!(
      parse_date_expr("-1w", today)
        .expect("week back"),
      date(2024, 1, 24)
    );
    assert_eq!(
      parse_date_expr("+1m", today)
        .expect("month ahead"),
      date(2024, 2, 29)
    );
    assert!(
      parse_date_expr("next tuesday", today)
        .is_err()
    );
  }

  #[test]
  fn parses_clock_times() {
    assert_eq!(
      parse_time_of_day("09:30")
        .expect("24h"),
      NaiveTime::from_hms_opt(9, 30, 0)
        .expect("valid")
    );
    assert_eq!(
      parse_time_of_day("12am")
        .expect("midnight")
        .hour(),
      0
    );
    assert_eq!(
      parse_time_of_day("2:15 pm")
        .expect("pm"),
      NaiveTime::from_hms_opt(14, 15, 0)
        .expect("valid")
    );
    assert!(
      parse_time_of_day("25:00").is_err()
    );
    assert!(
      parse_time_of_day("13pm").is_err()
    );
  }

  #[test]
  fn midnight_honours_timezone_offset() {
    let tz: chrono_tz::Tz =
      "America/New_York"
        .parse()
        .expect("tz");
    let instant =
      midnight_in(tz, date(2024, 1, 10));
    assert_eq!(
      instant.to_rfc3339(),
      "2024-01-10T05:00:00+00:00"
    );
  }

  #[test]
  fn reads_timezone_from_time_section() {
    let tz = timezone_from_toml(
      "[time]\ntimezone = \"Europe/Helsinki\"\n",
      std::path::Path::new("kazador-time.toml")
    );
    assert_eq!(
      tz.map(|tz| tz.name().to_string()),
      Some("Europe/Helsinki".to_string())
    );
  }
}
