//! Home/digest view: merges payloads the backend already computed.
//!
//! Nothing here ranks anything. Scores, metrics and summaries arrive
//! ready-made; this module only combines, filters and orders them for
//! display.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::calendar::{BucketedEvent, ViewMode, bucket_events, visible_range};
use crate::model::{CalendarEvent, DigestAction, DigestPayload, EmailRecord, ProjectDigest};
use crate::panel::Panel;

/// Upper bound on the email rows the home view works with.
pub const MAX_EMAIL_ROWS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeWindow {
    Day,
    #[default]
    Week,
    Month,
    All,
}

impl TimeWindow {
    pub fn as_key(self) -> &'static str {
        match self {
            Self::Day => "24h",
            Self::Week => "7d",
            Self::Month => "30d",
            Self::All => "all",
        }
    }

    fn span(self) -> Option<Duration> {
        match self {
            Self::Day => Some(Duration::hours(24)),
            Self::Week => Some(Duration::days(7)),
            Self::Month => Some(Duration::days(30)),
            Self::All => None,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

impl FromStr for TimeWindow {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "24h" | "day" => Ok(Self::Day),
            "7d" | "week" => Ok(Self::Week),
            "30d" | "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(anyhow!("unknown time window '{other}'; expected 24h, 7d, 30d or all")),
        }
    }
}

/// The label and time-window dropdowns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailFilter {
    pub label: Option<String>,
    pub window: TimeWindow,
}

impl EmailFilter {
    pub fn matches(&self, email: &EmailRecord, now: DateTime<Utc>) -> bool {
        if let Some(span) = self.window.span()
            && (email.received_at < now - span || email.received_at > now)
        {
            return false;
        }

        match self.label.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(label) => email
                .labels
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(label)),
        }
    }
}

/// Emails passing `filter`, newest first, from at most
/// [`MAX_EMAIL_ROWS`] input rows.
#[tracing::instrument(skip(emails, now), fields(total = emails.len()))]
pub fn filter_emails<'a>(
    emails: &'a [EmailRecord],
    filter: &EmailFilter,
    now: DateTime<Utc>,
) -> Vec<&'a EmailRecord> {
    let mut kept = emails
        .iter()
        .take(MAX_EMAIL_ROWS)
        .filter(|email| filter.matches(email, now))
        .collect::<Vec<_>>();
    kept.sort_by(|a, b| {
        b.received_at
            .cmp(&a.received_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    tracing::debug!(kept = kept.len(), "filtered emails");
    kept
}

/// Distinct labels for the label dropdown, sorted case-insensitively.
pub fn label_options(emails: &[EmailRecord]) -> Vec<String> {
    let mut seen = BTreeMap::<String, String>::new();
    for label in emails.iter().take(MAX_EMAIL_ROWS).flat_map(|e| e.labels.iter()) {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            continue;
        }
        seen.entry(trimmed.to_ascii_lowercase())
            .or_insert_with(|| trimmed.to_string());
    }
    seen.into_values().collect()
}

/// Global and per-project top actions, deduplicated by id (first seen
/// wins), highest score first.
pub fn merge_top_actions(digest: &DigestPayload, limit: usize) -> Vec<DigestAction> {
    let mut seen = BTreeSet::new();
    let mut merged = Vec::new();

    let per_project = digest.projects.iter().flat_map(|project| {
        project.top_actions.iter().map(move |action| {
            let mut action = action.clone();
            if action.project_id.is_none() {
                action.project_id = Some(project.project.id.clone());
            }
            if action.project_name.is_none() {
                action.project_name = Some(project.project.name.clone());
            }
            action
        })
    });

    for action in digest.top_actions.iter().cloned().chain(per_project) {
        if seen.insert(action.id.clone()) {
            merged.push(action);
        }
    }

    merged.sort_by(compare_actions);
    merged.truncate(limit);
    merged
}

fn compare_actions(a: &DigestAction, b: &DigestAction) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.due_at, b.due_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.title.cmp(&b.title))
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricTotals {
    pub projects: usize,
    pub open_tasks: u32,
    pub upcoming_timeline: u32,
    pub linked_emails: u32,
    pub conflicts: u32,
}

pub fn metric_totals(projects: &[ProjectDigest]) -> MetricTotals {
    projects.iter().fold(
        MetricTotals {
            projects: projects.len(),
            ..MetricTotals::default()
        },
        |mut totals, project| {
            let metrics = &project.metrics;
            totals.open_tasks = totals.open_tasks.saturating_add(metrics.open_tasks);
            totals.upcoming_timeline = totals
                .upcoming_timeline
                .saturating_add(metrics.upcoming_timeline);
            totals.linked_emails = totals.linked_emails.saturating_add(metrics.linked_emails);
            totals.conflicts = totals.conflicts.saturating_add(metrics.conflicts);
            totals
        },
    )
}

/// Events of `today`: all-day entries first, then timed ones by start.
pub fn today_events<'a>(
    events: &'a [CalendarEvent],
    today: NaiveDate,
    tz: Tz,
) -> Vec<BucketedEvent<'a>> {
    let range = visible_range(today, ViewMode::Day);
    let buckets = bucket_events(events, range, tz);
    buckets
        .get(today)
        .map(|bucket| {
            bucket
                .all_day
                .iter()
                .chain(bucket.timed.iter())
                .copied()
                .collect()
        })
        .unwrap_or_default()
}

/// What the home view fetched, each slot loaded or failed on its own.
#[derive(Debug, Clone)]
pub struct HomeInputs {
    pub digest: Panel<DigestPayload>,
    pub emails: Panel<Vec<EmailRecord>>,
    pub events: Panel<Vec<CalendarEvent>>,
}

#[derive(Debug, Clone)]
pub struct HomeView<'a> {
    pub generated_at: Option<DateTime<Utc>>,
    pub top_actions: Panel<Vec<DigestAction>>,
    pub projects: Panel<&'a [ProjectDigest]>,
    pub totals: Option<MetricTotals>,
    pub emails: Panel<Vec<&'a EmailRecord>>,
    pub label_options: Vec<String>,
    pub today: Panel<Vec<BucketedEvent<'a>>>,
}

pub struct HomeSettings {
    pub filter: EmailFilter,
    pub top_actions: usize,
    pub today: NaiveDate,
    pub now: DateTime<Utc>,
    pub timezone: Tz,
}

impl<'a> HomeView<'a> {
    #[tracing::instrument(skip_all)]
    pub fn build(inputs: &'a HomeInputs, settings: &HomeSettings) -> Self {
        let digest = inputs.digest.as_ref();
        Self {
            generated_at: digest.loaded().map(|d| d.generated_at),
            top_actions: digest
                .clone()
                .map(|d| merge_top_actions(d, settings.top_actions)),
            projects: digest.clone().map(|d| d.projects.as_slice()),
            totals: digest.loaded().map(|d| metric_totals(&d.projects)),
            emails: inputs
                .emails
                .as_ref()
                .map(|emails| filter_emails(emails, &settings.filter, settings.now)),
            label_options: inputs
                .emails
                .loaded()
                .map(|emails| label_options(emails))
                .unwrap_or_default(),
            today: inputs
                .events
                .as_ref()
                .map(|events| today_events(events, settings.today, settings.timezone)),
        }
    }
}
