use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::calendar::{
    BucketedEvent, DayBucket, DayBuckets, ViewMode, day_position, view_title,
};
use crate::config::Config;
use crate::datetime::midnight_in;
use crate::digest::{HomeView, MetricTotals};
use crate::form::EchoedFields;
use crate::model::{
    AdminUser, ApprovalRecord, CalendarEvent, CalendarSource, DigestAction, EmailRecord, Project,
    ProjectDigest, ProjectTask, SyncSummary, TaskStatus,
};
use crate::panel::Panel;
use crate::timeline::{DependencyLink, LaneGroup};

const CELL_WIDTH: usize = 14;
const CELL_EVENTS: usize = 3;
const BAR_WIDTH: usize = 24;
const WEEKDAY_HEADERS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
    timezone: Tz,
}

impl Renderer {
    pub fn new(cfg: &Config, timezone: Tz) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color, timezone })
    }

    /// Uncoloured output in `timezone`.
    pub fn plain(timezone: Tz) -> Self {
        Self {
            color: false,
            timezone,
        }
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn local_time(&self, instant: DateTime<Utc>) -> String {
        instant.with_timezone(&self.timezone).format("%H:%M").to_string()
    }

    fn local_date(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d")
            .to_string()
    }

    fn heading<W: Write>(&self, out: &mut W, title: &str) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(title, "1"))?;
        Ok(())
    }

    /// A panel whose fetch failed, in place of its content.
    pub fn failed<W: Write>(&self, out: &mut W, label: &str, message: &str) -> anyhow::Result<()> {
        writeln!(out, "{}", self.paint(&format!("! {label}: {message}"), "31"))?;
        Ok(())
    }

    fn panel<W: Write, T>(
        &self,
        out: &mut W,
        label: &str,
        panel: &Panel<T>,
        body: impl FnOnce(&Self, &mut W, &T) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        match panel {
            Panel::Loaded(value) => body(self, out, value),
            Panel::Failed(message) => self.failed(out, label, message),
        }
    }

    #[tracing::instrument(skip_all, fields(view = %view, reference = %reference))]
    pub fn calendar<W: Write>(
        &self,
        out: &mut W,
        view: ViewMode,
        reference: NaiveDate,
        today: NaiveDate,
        events: &Panel<DayBuckets<'_>>,
        link: &str,
    ) -> anyhow::Result<()> {
        self.heading(out, &view_title(view, reference))?;
        self.panel(out, "Calendar events", events, |r, out, buckets| match view {
            ViewMode::Month => r.month_grid(out, buckets, reference, today),
            ViewMode::Week | ViewMode::Day => r.agenda(out, buckets, today),
        })?;
        writeln!(out, "link: ?{link}")?;
        Ok(())
    }

    fn month_grid<W: Write>(
        &self,
        out: &mut W,
        buckets: &DayBuckets<'_>,
        reference: NaiveDate,
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        let header = WEEKDAY_HEADERS
            .iter()
            .map(|day| pad(day, CELL_WIDTH))
            .collect::<Vec<_>>()
            .join("|");
        writeln!(out, "{header}")?;

        let days = buckets.iter().collect::<Vec<_>>();
        for week in days.chunks(7) {
            writeln!(out, "{}", vec!["-".repeat(CELL_WIDTH); week.len()].join("+"))?;
            let cells = week
                .iter()
                .map(|bucket| self.month_cell(bucket, reference, today))
                .collect::<Vec<_>>();
            let height = cells.iter().map(Vec::len).max().unwrap_or(1);
            for line in 0..height {
                let row = cells
                    .iter()
                    .map(|cell| pad(cell.get(line).map(String::as_str).unwrap_or(""), CELL_WIDTH))
                    .collect::<Vec<_>>()
                    .join("|");
                writeln!(out, "{}", row.trim_end())?;
            }
        }
        Ok(())
    }

    fn month_cell(&self, bucket: &DayBucket<'_>, reference: NaiveDate, today: NaiveDate) -> Vec<String> {
        let mut number = format!("{:>2}", bucket.date.day());
        if bucket.date == today {
            number = self.paint(&format!("{number}*"), "7");
        } else if bucket.date.month() != reference.month() {
            number = self.paint(&number, "2");
        }

        let mut lines = vec![number];
        let entries = bucket.all_day.iter().chain(bucket.timed.iter()).collect::<Vec<_>>();
        for entry in entries.iter().take(CELL_EVENTS) {
            let label = if entry.all_day {
                format!("■ {}", entry.event.summary)
            } else {
                format!("{} {}", self.local_time(entry.start), entry.event.summary)
            };
            lines.push(truncate(&label, CELL_WIDTH));
        }
        if entries.len() > CELL_EVENTS {
            lines.push(format!("+{} more", entries.len() - CELL_EVENTS));
        }
        lines
    }

    fn agenda<W: Write>(
        &self,
        out: &mut W,
        buckets: &DayBuckets<'_>,
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        for bucket in buckets.iter() {
            let title = bucket.date.format("%a %Y-%m-%d").to_string();
            if bucket.date == today {
                writeln!(out, "{}", self.paint(&format!("{title} (today)"), "1;36"))?;
            } else {
                writeln!(out, "{}", self.paint(&title, "1"))?;
            }

            if bucket.is_empty() {
                writeln!(out, "  {}", self.paint("no events", "2"))?;
                continue;
            }

            for entry in &bucket.all_day {
                writeln!(out, "  {:<11} {}", "all day", entry.event.summary)?;
                self.event_details(out, entry.event)?;
            }

            let day_start = midnight_in(self.timezone, bucket.date);
            for entry in &bucket.timed {
                let bar = day_position(entry.event, day_start)
                    .map(|position| {
                        position_bar(
                            position.top_percent,
                            position.height_percent,
                            position.continues_before,
                            position.continues_after,
                        )
                    })
                    .unwrap_or_default();
                writeln!(
                    out,
                    "  {:<11} {} {}",
                    self.span_label(entry),
                    self.paint(&bar, "36"),
                    entry.event.summary
                )?;
                self.event_details(out, entry.event)?;
            }
        }
        Ok(())
    }

    fn span_label(&self, entry: &BucketedEvent<'_>) -> String {
        if entry.spans_multiple_days(self.timezone) {
            format!("{}→{}", self.local_time(entry.start), self.local_date(entry.end))
        } else {
            format!("{}-{}", self.local_time(entry.start), self.local_time(entry.end))
        }
    }

    fn event_details<W: Write>(&self, out: &mut W, event: &CalendarEvent) -> anyhow::Result<()> {
        if let Some(location) = event.location.as_deref().filter(|l| !l.trim().is_empty()) {
            writeln!(out, "              @ {location}")?;
        }
        if let Some(calendar) = event.calendar_label() {
            writeln!(out, "              {}", self.paint(&format!("[{calendar}]"), "2"))?;
        }
        if let Some(link) = event.deep_link() {
            writeln!(out, "              {link}")?;
        }
        Ok(())
    }

    pub fn created_event<W: Write>(
        &self,
        out: &mut W,
        event: &CalendarEvent,
        echoed: Option<&EchoedFields>,
    ) -> anyhow::Result<()> {
        writeln!(out, "Created event {}", self.paint(&event.id, "33"))?;
        match echoed {
            Some(fields) => {
                writeln!(out, "summary   {}", fields.summary)?;
                writeln!(out, "date      {}", fields.date)?;
                writeln!(out, "time      {}", fields.time.as_deref().unwrap_or("all day"))?;
            }
            None => writeln!(
                out,
                "{}",
                self.paint("event was not returned when reloading the calendar", "31")
            )?,
        }
        Ok(())
    }

    pub fn sources<W: Write>(&self, out: &mut W, sources: &[CalendarSource]) -> anyhow::Result<()> {
        let rows = sources
            .iter()
            .map(|source| {
                vec![
                    self.paint(&source.id, "33"),
                    source.summary.clone(),
                    source.calendar_id.clone(),
                    source.account_email.clone().unwrap_or_default(),
                    source
                        .last_synced_at
                        .map(|at| format!("{} {}", self.local_date(at), self.local_time(at)))
                        .unwrap_or_else(|| "never".to_string()),
                ]
            })
            .collect();
        write_table(out, &["ID", "Calendar", "Calendar ID", "Account", "Last sync"], rows)
    }

    pub fn sync_summary<W: Write>(&self, out: &mut W, summary: &SyncSummary) -> anyhow::Result<()> {
        writeln!(
            out,
            "Synced {}: {} created, {} updated, {} deleted",
            summary.source_id, summary.created, summary.updated, summary.deleted
        )?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn home<W: Write>(&self, out: &mut W, view: &HomeView<'_>) -> anyhow::Result<()> {
        if let Some(generated_at) = view.generated_at {
            writeln!(
                out,
                "{}",
                self.paint(
                    &format!(
                        "digest generated {} {}",
                        self.local_date(generated_at),
                        self.local_time(generated_at)
                    ),
                    "2"
                )
            )?;
        }

        self.heading(out, "Top actions")?;
        self.panel(out, "Top actions", &view.top_actions, |r, out, actions| {
            r.top_actions(out, actions)
        })?;
        writeln!(out)?;

        self.heading(out, "Projects")?;
        self.panel(out, "Projects", &view.projects, |r, out, projects| {
            r.project_metrics(out, projects, view.totals.as_ref())
        })?;
        writeln!(out)?;

        self.heading(out, "Today")?;
        self.panel(out, "Today's events", &view.today, |r, out, events| {
            if events.is_empty() {
                writeln!(out, "{}", r.paint("nothing scheduled", "2"))?;
            }
            for entry in events {
                let when = if entry.all_day {
                    "all day".to_string()
                } else {
                    r.span_label(entry)
                };
                writeln!(out, "  {when:<11} {}", entry.event.summary)?;
            }
            Ok(())
        })?;
        writeln!(out)?;

        self.heading(out, "Recent email")?;
        self.panel(out, "Recent email", &view.emails, |r, out, emails| {
            r.emails(out, emails, &view.label_options)
        })
    }

    pub fn top_actions<W: Write>(&self, out: &mut W, actions: &[DigestAction]) -> anyhow::Result<()> {
        if actions.is_empty() {
            writeln!(out, "{}", self.paint("no actions", "2"))?;
            return Ok(());
        }
        let rows = actions
            .iter()
            .map(|action| {
                vec![
                    format!("{:.2}", action.score),
                    action.title.clone(),
                    action.project_name.clone().unwrap_or_default(),
                    action.kind.clone(),
                    action.due_at.map(|due| self.local_date(due)).unwrap_or_default(),
                ]
            })
            .collect();
        write_table(out, &["Score", "Action", "Project", "Kind", "Due"], rows)
    }

    pub fn project_metrics<W: Write>(
        &self,
        out: &mut W,
        projects: &[ProjectDigest],
        totals: Option<&MetricTotals>,
    ) -> anyhow::Result<()> {
        let mut rows = projects
            .iter()
            .map(|digest| {
                let conflicts = digest.metrics.conflicts.to_string();
                vec![
                    digest.project.name.clone(),
                    digest.project.status.to_string(),
                    digest.metrics.open_tasks.to_string(),
                    digest.metrics.upcoming_timeline.to_string(),
                    digest.metrics.linked_emails.to_string(),
                    if digest.metrics.conflicts > 0 {
                        self.paint(&conflicts, "31")
                    } else {
                        conflicts
                    },
                    digest
                        .metrics
                        .health_score
                        .map(|score| format!("{score:.0}"))
                        .unwrap_or_default(),
                ]
            })
            .collect::<Vec<_>>();
        if let Some(totals) = totals {
            rows.push(vec![
                format!("{} projects", totals.projects),
                String::new(),
                totals.open_tasks.to_string(),
                totals.upcoming_timeline.to_string(),
                totals.linked_emails.to_string(),
                totals.conflicts.to_string(),
                String::new(),
            ]);
        }
        write_table(
            out,
            &["Project", "Status", "Open tasks", "Upcoming", "Emails", "Conflicts", "Health"],
            rows,
        )
    }

    pub fn emails<W: Write>(
        &self,
        out: &mut W,
        emails: &[&EmailRecord],
        label_options: &[String],
    ) -> anyhow::Result<()> {
        if !label_options.is_empty() {
            writeln!(out, "{}", self.paint(&format!("labels: {}", label_options.join(", ")), "2"))?;
        }
        let rows = emails
            .iter()
            .map(|email| {
                let subject = if email.is_read {
                    email.subject.clone()
                } else {
                    self.paint(&email.subject, "1")
                };
                vec![
                    format!(
                        "{} {}",
                        self.local_date(email.received_at),
                        self.local_time(email.received_at)
                    ),
                    email.sender().to_string(),
                    subject,
                    email.labels.join(", "),
                ]
            })
            .collect();
        write_table(out, &["Received", "From", "Subject", "Labels"], rows)
    }

    pub fn projects<W: Write>(&self, out: &mut W, projects: &[Project]) -> anyhow::Result<()> {
        let rows = projects
            .iter()
            .map(|project| {
                vec![
                    self.paint(&project.id, "33"),
                    project.name.clone(),
                    project.status.to_string(),
                    date_span(project.start_date, project.end_date),
                    project.labels.join(", "),
                ]
            })
            .collect();
        write_table(out, &["ID", "Name", "Status", "Dates", "Labels"], rows)
    }

    pub fn project<W: Write>(&self, out: &mut W, project: &Project) -> anyhow::Result<()> {
        writeln!(out, "id        {}", project.id)?;
        writeln!(out, "name      {}", project.name)?;
        writeln!(out, "status    {}", project.status)?;
        if let Some(slug) = &project.slug {
            writeln!(out, "slug      {slug}")?;
        }
        if let Some(color) = &project.color {
            writeln!(out, "color     {color}")?;
        }
        let dates = date_span(project.start_date, project.end_date);
        if !dates.is_empty() {
            writeln!(out, "dates     {dates}")?;
        }
        if !project.labels.is_empty() {
            writeln!(out, "labels    {}", project.labels.join(", "))?;
        }
        if let Some(description) = &project.description {
            writeln!(out, "desc      {description}")?;
        }
        Ok(())
    }

    pub fn tasks<W: Write>(&self, out: &mut W, tasks: &[ProjectTask], now: DateTime<Utc>) -> anyhow::Result<()> {
        let rows = tasks
            .iter()
            .map(|task| {
                let due = task.due_at.map(|due| self.local_date(due)).unwrap_or_default();
                let overdue = task
                    .due_at
                    .is_some_and(|due| due < now && task.status != TaskStatus::Done);
                vec![
                    self.paint(&task.id, "33"),
                    task.status.to_string(),
                    if overdue { self.paint(&due, "31") } else { due },
                    task.priority.map(|p| p.to_string()).unwrap_or_default(),
                    task.title.clone(),
                ]
            })
            .collect();
        write_table(out, &["ID", "Status", "Due", "Pri", "Title"], rows)
    }

    pub fn timeline<W: Write>(
        &self,
        out: &mut W,
        groups: &[LaneGroup<'_>],
        lanes: &[String],
        links: &Panel<Vec<DependencyLink<'_>>>,
        link: &str,
    ) -> anyhow::Result<()> {
        if !lanes.is_empty() {
            writeln!(out, "{}", self.paint(&format!("lanes: {}", lanes.join(", ")), "2"))?;
        }
        if groups.is_empty() {
            writeln!(out, "{}", self.paint("no timeline items", "2"))?;
        }
        for group in groups {
            self.heading(out, group.label())?;
            let rows = group
                .items
                .iter()
                .map(|item| {
                    vec![
                        self.paint(&item.id, "33"),
                        item.kind.to_string(),
                        item.starts_at.map(|at| self.local_date(at)).unwrap_or_default(),
                        item.ends_at.map(|at| self.local_date(at)).unwrap_or_default(),
                        item.title.clone(),
                    ]
                })
                .collect();
            write_table(&mut *out, &["ID", "Type", "Starts", "Ends", "Title"], rows)?;
            writeln!(out)?;
        }

        self.heading(out, "Dependencies")?;
        self.panel(out, "Dependencies", links, |r, out, links| {
            for link in links {
                match link {
                    DependencyLink::Resolved { from, to, kind } => {
                        writeln!(out, "  {} -[{kind}]-> {}", from.title, to.title)?
                    }
                    DependencyLink::Dangling { dependency, missing } => writeln!(
                        out,
                        "{}",
                        r.paint(
                            &format!(
                                "  {} references unknown items: {}",
                                dependency.id,
                                missing.join(", ")
                            ),
                            "31"
                        )
                    )?,
                }
            }
            Ok(())
        })?;
        writeln!(out, "link: ?{link}")?;
        Ok(())
    }

    pub fn approvals<W: Write>(&self, out: &mut W, approvals: &[ApprovalRecord]) -> anyhow::Result<()> {
        let rows = approvals
            .iter()
            .map(|approval| {
                vec![
                    self.paint(&approval.id, "33"),
                    approval.kind.clone(),
                    approval.status.to_string(),
                    approval.project_id.clone().unwrap_or_default(),
                    approval.created_at.map(|at| self.local_date(at)).unwrap_or_default(),
                    approval.summary.clone().unwrap_or_default(),
                ]
            })
            .collect();
        write_table(out, &["ID", "Type", "Status", "Project", "Created", "Summary"], rows)
    }

    pub fn approval<W: Write>(&self, out: &mut W, approval: &ApprovalRecord) -> anyhow::Result<()> {
        writeln!(out, "Approval {} is now {}", approval.id, approval.status)?;
        Ok(())
    }

    pub fn users<W: Write>(&self, out: &mut W, users: &[AdminUser]) -> anyhow::Result<()> {
        let rows = users
            .iter()
            .map(|user| {
                vec![
                    self.paint(&user.id, "33"),
                    user.email.clone(),
                    user.display_name.clone().unwrap_or_default(),
                    user.role.to_string(),
                    user.last_sign_in_at.map(|at| self.local_date(at)).unwrap_or_default(),
                ]
            })
            .collect();
        write_table(out, &["ID", "Email", "Name", "Role", "Last sign-in"], rows)
    }
}

/// One character per hour of the day, filled where the event sits.
fn position_bar(top: f64, height: f64, before: bool, after: bool) -> String {
    let width = BAR_WIDTH as f64;
    let first = ((top / 100.0) * width).floor().clamp(0.0, width - 1.0) as usize;
    let len = ((height / 100.0) * width).round().max(1.0) as usize;
    let last = (first + len).min(BAR_WIDTH);

    let mut cells = vec!['·'; BAR_WIDTH];
    for cell in &mut cells[first..last] {
        *cell = '█';
    }
    if before {
        cells[0] = '<';
    }
    if after {
        cells[BAR_WIDTH - 1] = '>';
    }
    cells.into_iter().collect()
}

fn date_span(start: Option<NaiveDate>, end: Option<NaiveDate>) -> String {
    match (start, end) {
        (Some(start), Some(end)) => format!("{start} to {end}"),
        (Some(start), None) => format!("from {start}"),
        (None, Some(end)) => format!("until {end}"),
        (None, None) => String::new(),
    }
}

/// Cuts `text` to `width` display columns, ending in `…` when shortened.
fn truncate(text: &str, width: usize) -> String {
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}

fn pad(cell: &str, width: usize) -> String {
    let visible = UnicodeWidthStr::width(strip_ansi(cell).as_str());
    format!("{cell}{}", " ".repeat(width.saturating_sub(visible)))
}

fn write_table<W: Write>(
    mut writer: W,
    headers: &[&str],
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(*header));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = *width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, width) in widths.iter().enumerate() {
            let cell = row.get(idx).map(String::as_str).unwrap_or("");
            write!(writer, "{} ", pad(cell, *width))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
