//! New-event form: validation and the request it produces.

use anyhow::{Context, anyhow, bail};
use chrono::{Duration, NaiveDate, NaiveTime, TimeDelta};
use chrono_tz::Tz;

use crate::datetime::{local_instant, midnight_in, parse_time_of_day};
use crate::model::{CalendarEvent, CreateEventRequest};

const DEFAULT_DURATION_MINUTES: i64 = 60;
const MAX_DURATION_MINUTES: i64 = 7 * 24 * 60;
const TIME_FORMAT: &str = "%H:%M";

/// Raw user input, as typed.
#[derive(Debug, Clone, Default)]
pub struct EventForm {
    pub summary: String,
    pub date: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub all_day: bool,
    pub location: Option<String>,
    pub description: Option<String>,
    pub source_id: Option<String>,
    pub project_id: Option<String>,
}

impl EventForm {
    /// Checks the input and builds the create request. Error messages are
    /// meant to be shown to the user as-is.
    #[tracing::instrument(skip(self), fields(summary = %self.summary, date = %self.date))]
    pub fn validate(&self, tz: Tz) -> anyhow::Result<CreateEventRequest> {
        let summary = self.summary.trim();
        if summary.is_empty() {
            bail!("Summary is required");
        }

        let date = self.parsed_date()?;
        let start_time = self.parsed_start_time()?;

        let (start_at, end_at, is_all_day) = match start_time {
            Some(time) if !self.all_day => {
                let start = local_instant(tz, date, time)?;
                let end = match non_empty(&self.end_time) {
                    Some(raw) => {
                        let end_time = parse_time_of_day(raw)
                            .with_context(|| format!("Invalid end time '{raw}'"))?;
                        let end = local_instant(tz, date, end_time)?;
                        if end <= start {
                            bail!("End time must be after start time");
                        }
                        end
                    }
                    None => {
                        let minutes = self.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES);
                        if minutes <= 0 {
                            bail!("Duration must be a positive number of minutes");
                        }
                        if minutes > MAX_DURATION_MINUTES {
                            bail!("Duration is too long");
                        }
                        TimeDelta::try_minutes(minutes)
                            .and_then(|delta| start.checked_add_signed(delta))
                            .ok_or_else(|| anyhow!("Duration is too long"))?
                    }
                };
                (start, end, false)
            }
            _ => {
                // Whole day, ending on its last second so it stays in one
                // day cell.
                let start = midnight_in(tz, date);
                let next = date
                    .succ_opt()
                    .ok_or_else(|| anyhow!("Date {date} is out of range"))?;
                let end = midnight_in(tz, next) - Duration::seconds(1);
                (start, end, true)
            }
        };

        Ok(CreateEventRequest {
            summary: summary.to_string(),
            start_at,
            end_at,
            is_all_day,
            description: non_empty(&self.description).map(str::to_string),
            location: non_empty(&self.location).map(str::to_string),
            source_id: non_empty(&self.source_id).map(str::to_string),
            project_id: non_empty(&self.project_id).map(str::to_string),
        })
    }

    fn parsed_date(&self) -> anyhow::Result<NaiveDate> {
        let raw = self.date.trim();
        if raw.is_empty() {
            bail!("Date is required");
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| anyhow!("Invalid date '{raw}'; expected YYYY-MM-DD"))
    }

    fn parsed_start_time(&self) -> anyhow::Result<Option<NaiveTime>> {
        non_empty(&self.start_time)
            .map(|raw| {
                parse_time_of_day(raw).with_context(|| format!("Invalid start time '{raw}'"))
            })
            .transpose()
    }

    /// The fields a user would expect to see again after the event is
    /// saved and reloaded.
    pub fn expected_echo(&self, tz: Tz) -> anyhow::Result<EchoedFields> {
        let request = self.validate(tz)?;
        Ok(EchoedFields::from_span(
            &request.summary,
            request.start_at.with_timezone(&tz).date_naive(),
            (!request.is_all_day).then(|| request.start_at.with_timezone(&tz).time()),
        ))
    }
}

/// `summary`/`date`/`time` as displayed for a stored event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoedFields {
    pub summary: String,
    pub date: String,
    pub time: Option<String>,
}

impl EchoedFields {
    fn from_span(summary: &str, date: NaiveDate, time: Option<NaiveTime>) -> Self {
        Self {
            summary: summary.to_string(),
            date: date.format("%Y-%m-%d").to_string(),
            time: time.map(|t| t.format(TIME_FORMAT).to_string()),
        }
    }

    pub fn from_event(event: &CalendarEvent, tz: Tz) -> Option<Self> {
        let (start, _) = event.effective_span()?;
        let local = start.with_timezone(&tz);
        Some(Self::from_span(
            &event.summary,
            local.date_naive(),
            (!event.is_all_day).then(|| local.time()),
        ))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
